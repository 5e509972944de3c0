use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::download::progress::DownloadProgress;
use crate::download::retry::retry;
use crate::download::DriveClient;
use crate::error::{DriveError, Result};
use crate::options::Options;

/// Streams a directly downloadable file into `output`, resuming a previous
/// partial download if one is lying around.
pub async fn download_direct(
    client: &DriveClient,
    stream_url: &Url,
    expected_size: u64,
    output: &Path,
    options: &Options,
    progress: Arc<DownloadProgress>,
    cancel: &CancellationToken,
) -> Result<()> {
    let partial = partial_path(output);
    let chunk_size = options.chunk_size_for(expected_size);
    progress.set_bytes_total(expected_size);
    debug!(chunk_size, "downloading stream to {}", partial.display());

    retry(&options.retry_policy(), cancel, "stream download", |_| {
        fetch_into(client, stream_url, &partial, chunk_size, options, &progress)
    })
    .await?;

    tokio::fs::rename(&partial, output).await?;
    info!(bytes = progress.bytes_transferred(), "saved {}", output.display());
    Ok(())
}

/// `clip.mp4` downloads into `clip.mp4.part`.
pub fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

async fn fetch_into(
    client: &DriveClient,
    stream_url: &Url,
    partial: &Path,
    chunk_size: usize,
    options: &Options,
    progress: &DownloadProgress,
) -> Result<()> {
    let existing = match tokio::fs::metadata(partial).await {
        Ok(metadata) => metadata.len(),
        Err(_) => 0,
    };

    let range_start = (existing > 0).then_some(existing);
    if range_start.is_some() {
        info!("resuming download from byte {}", existing);
    }

    let Some(mut response) = client.get_range(stream_url, range_start, options.download_timeout).await? else {
        debug!("range starts past the end of the stream, partial file is complete");
        return Ok(());
    };

    let mut file = if response.status() == StatusCode::PARTIAL_CONTENT {
        progress.set_bytes_transferred(existing);
        tokio::fs::OpenOptions::new().append(true).open(partial).await?
    } else {
        if existing > 0 {
            info!("server ignored the range request, restarting from zero");
        }
        progress.set_bytes_transferred(0);
        tokio::fs::File::create(partial).await?
    };

    if let Some(length) = response.content_length() {
        let total = length + if response.status() == StatusCode::PARTIAL_CONTENT { existing } else { 0 };
        progress.set_bytes_total(total);
    }

    let mut buffer = Vec::with_capacity(chunk_size);
    while let Some(piece) = response.chunk().await.map_err(DriveError::from_reqwest)? {
        buffer.extend_from_slice(&piece);
        if buffer.len() >= chunk_size {
            file.write_all(&buffer).await?;
            progress.add_bytes(buffer.len() as u64);
            buffer.clear();
        }
    }

    if !buffer.is_empty() {
        file.write_all(&buffer).await?;
        progress.add_bytes(buffer.len() as u64);
    }
    file.sync_all().await?;

    Ok(())
}
