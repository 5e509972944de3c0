use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::download::retry::RetryPolicy;
use crate::error::{DriveError, Result};

pub const ENV_PREFIX: &str = "GDRIVE_VIDEOLOADER_";

pub const DRIVE_BASE_URL: &str = "https://drive.google.com/";

pub const DEFAULT_THREADS: usize = 16;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_FRAME_RATE: u32 = 25;
pub const DEFAULT_FFMPEG: &str = "ffmpeg";

pub const MIN_CHUNK_SIZE: usize = 1024;
pub const MAX_CHUNK_SIZE: usize = 10 * 1024 * 1024;

const CHUNK_SIZE_SMALL: usize = 16 * 1024;
const CHUNK_SIZE_MEDIUM: usize = 64 * 1024;
const CHUNK_SIZE_LARGE: usize = 256 * 1024;
const CHUNK_SIZE_XLARGE: usize = 1024 * 1024;

const FILE_SIZE_SMALL: u64 = 10 * 1024 * 1024;
const FILE_SIZE_MEDIUM: u64 = 100 * 1024 * 1024;
const FILE_SIZE_LARGE: u64 = 500 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Options {
    pub max_parallel_downloads: usize,
    pub max_download_retries: u32,
    /// `None` picks a chunk size from the file size.
    pub chunk_size: Option<usize>,
    pub retry_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub request_timeout: Duration,
    pub download_timeout: Duration,
    pub frame_rate: u32,
    pub base_url: Url,
    /// Encoder binary, looked up on `PATH` unless absolute.
    pub ffmpeg: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_parallel_downloads: DEFAULT_THREADS,
            max_download_retries: DEFAULT_MAX_RETRIES,
            chunk_size: None,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            retry_max_backoff: DEFAULT_RETRY_MAX_BACKOFF,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            frame_rate: DEFAULT_FRAME_RATE,
            base_url: Url::parse(DRIVE_BASE_URL).expect("default base url is valid"),
            ffmpeg: PathBuf::from(DEFAULT_FFMPEG),
        }
    }
}

impl Options {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` knows for `GDRIVE_VIDEOLOADER_*` keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut options = Options::default();

        if let Some(value) = get("THREADS") {
            options.max_parallel_downloads = parse_number("THREADS", &value)?;
        }
        if let Some(value) = get("MAX_RETRIES") {
            options.max_download_retries = parse_number("MAX_RETRIES", &value)?;
        }
        if let Some(value) = get("CHUNK_SIZE") {
            let size: usize = parse_number("CHUNK_SIZE", &value)?;
            options.chunk_size = (size > 0).then(|| clamp_chunk_size(size));
        }
        if let Some(value) = get("RETRY_BACKOFF_MS") {
            options.retry_backoff = Duration::from_millis(parse_number("RETRY_BACKOFF_MS", &value)?);
        }
        if let Some(value) = get("REQUEST_TIMEOUT") {
            options.request_timeout = Duration::from_secs(parse_number("REQUEST_TIMEOUT", &value)?);
        }
        if let Some(value) = get("DOWNLOAD_TIMEOUT") {
            options.download_timeout = Duration::from_secs(parse_number("DOWNLOAD_TIMEOUT", &value)?);
        }
        if let Some(value) = get("FRAME_RATE") {
            options.frame_rate = parse_number("FRAME_RATE", &value)?;
        }
        if let Some(value) = get("FFMPEG") {
            options.ffmpeg = PathBuf::from(value);
        }
        if let Some(value) = get("DRIVE_BASE_URL") {
            options.base_url = parse_base_url(&value)?;
        }

        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_downloads == 0 {
            return Err(DriveError::Config("thread count must be at least 1".into()));
        }
        if self.frame_rate == 0 {
            return Err(DriveError::Config("frame rate must be at least 1".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_download_retries + 1,
            base_delay: self.retry_backoff,
            max_delay: self.retry_max_backoff,
        }
    }

    pub fn chunk_size_for(&self, file_size: u64) -> usize {
        match self.chunk_size {
            Some(size) => clamp_chunk_size(size),
            None => adaptive_chunk_size(file_size),
        }
    }
}

pub fn clamp_chunk_size(size: usize) -> usize {
    size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

pub fn adaptive_chunk_size(file_size: u64) -> usize {
    if file_size < FILE_SIZE_SMALL {
        CHUNK_SIZE_SMALL
    } else if file_size < FILE_SIZE_MEDIUM {
        CHUNK_SIZE_MEDIUM
    } else if file_size < FILE_SIZE_LARGE {
        CHUNK_SIZE_LARGE
    } else {
        CHUNK_SIZE_XLARGE
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        DriveError::Config(format!("{}{} is not a valid number: {:?}", ENV_PREFIX, name, value))
    })
}

fn parse_base_url(value: &str) -> Result<Url> {
    // join() drops the last path segment unless the base ends with a slash
    let value = if value.ends_with('/') { value.to_string() } else { format!("{}/", value) };
    Url::parse(&value).map_err(|err| DriveError::Config(format!("invalid base url {:?}: {}", value, err)))
}
