use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::download::assemble::AssembledFrame;
use crate::download::store::FrameStore;
use crate::error::{DriveError, Result};

/// How much of the encoder's stderr is kept for the error message.
const STDERR_TAIL: usize = 2048;

/// Starts an encoding session that turns pushed frames into a video file.
#[async_trait]
pub trait FrameEncoder: Send + Sync {
    async fn start(&self, frame_rate: u32, output: &Path) -> Result<Box<dyn FrameSink>>;
}

#[async_trait]
pub trait FrameSink: Send {
    /// Frames arrive in ascending `frame_index` order.
    async fn push(&mut self, frame: AssembledFrame) -> Result<()>;

    async fn finish(self: Box<Self>) -> Result<()>;
}

/// Encodes H.264 with the `ffmpeg` binary, frames piped through stdin as PNG.
pub struct FfmpegEncoder {
    program: OsString,
}

impl FfmpegEncoder {
    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self { program: program.into() }
    }
}

#[async_trait]
impl FrameEncoder for FfmpegEncoder {
    async fn start(&self, frame_rate: u32, output: &Path) -> Result<Box<dyn FrameSink>> {
        let frame_rate = frame_rate.to_string();
        let mut child = Command::new(&self.program)
            .args(["-y", "-loglevel", "error", "-f", "image2pipe", "-framerate", frame_rate.as_str(), "-i", "-"])
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p"])
            // odd frame sizes are rejected by yuv420p
            .args(["-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2"])
            .arg(output)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    DriveError::Encoder(format!("{:?} was not found on PATH", self.program))
                }
                _ => DriveError::Encoder(format!("cannot start {:?}: {}", self.program, err)),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriveError::Encoder("encoder stdin is not available".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DriveError::Encoder("encoder stderr is not available".into()))?;

        // a full stderr pipe would stall the encoder while we block on stdin
        let diagnostics = tokio::spawn(read_tail(stderr));

        Ok(Box::new(FfmpegSink { child, stdin: Some(stdin), diagnostics, next_index: 0 }))
    }
}

/// Reads `stderr` to the end, keeping only the last [`STDERR_TAIL`] bytes.
async fn read_tail(mut stderr: ChildStderr) -> Vec<u8> {
    let mut tail = Vec::new();
    let mut buffer = [0u8; 4096];

    loop {
        match stderr.read(&mut buffer).await {
            Ok(0) => break,
            Ok(read) => {
                tail.extend_from_slice(&buffer[..read]);
                if tail.len() > STDERR_TAIL {
                    tail.drain(..tail.len() - STDERR_TAIL);
                }
            }
            Err(err) => {
                debug!("stopped reading encoder stderr: {}", err);
                break;
            }
        }
    }

    tail
}

struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
    diagnostics: JoinHandle<Vec<u8>>,
    next_index: usize,
}

#[async_trait]
impl FrameSink for FfmpegSink {
    async fn push(&mut self, frame: AssembledFrame) -> Result<()> {
        if frame.frame_index != self.next_index {
            return Err(DriveError::IncompleteSequence { missing: vec![self.next_index] });
        }

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| DriveError::Encoder("encoder input already closed".into()))?;
        stdin
            .write_all(&frame.image_bytes)
            .await
            .map_err(|err| DriveError::Encoder(format!("encoder stopped reading frames: {}", err)))?;

        self.next_index += 1;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let FfmpegSink { mut child, stdin, diagnostics, .. } = *self;
        // closing stdin tells ffmpeg the stream is over
        drop(stdin);

        let status = child.wait().await?;
        let stderr = diagnostics.await?;
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(DriveError::Encoder(format!("ffmpeg exited with {}: {}", status, stderr.trim())));
        }

        Ok(())
    }
}

/// Turns the finalized frames of a [`FrameStore`] into the output video.
pub struct VideoMuxer {
    encoder: Arc<dyn FrameEncoder>,
    frame_rate: u32,
}

impl VideoMuxer {
    pub fn new(encoder: Arc<dyn FrameEncoder>, frame_rate: u32) -> Self {
        Self { encoder, frame_rate }
    }

    /// Refuses to start unless every frame in `0..total_frames` is on disk.
    /// The frame directory is removed only once the video is in place.
    pub async fn mux(&self, store: &FrameStore, total_frames: usize, output: &Path) -> Result<()> {
        if total_frames == 0 {
            return Err(DriveError::Unsupported("the video has no frames".into()));
        }

        let missing = store.missing_frames(total_frames).await;
        if !missing.is_empty() {
            return Err(DriveError::IncompleteSequence { missing });
        }

        let partial = partial_output_path(output);
        info!(frames = total_frames, fps = self.frame_rate, "muxing {}", output.display());

        if let Err(err) = self.encode(store, total_frames, &partial).await {
            if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!("cannot remove {}: {}", partial.display(), cleanup);
                }
            }
            return Err(err);
        }

        tokio::fs::rename(&partial, output).await?;
        store.remove().await?;
        debug!("removed {}", store.root().display());

        Ok(())
    }

    async fn encode(&self, store: &FrameStore, total_frames: usize, partial: &Path) -> Result<()> {
        let mut sink = self.encoder.start(self.frame_rate, partial).await?;

        for frame_index in 0..total_frames {
            let image_bytes = store.read_frame(frame_index).await?;
            sink.push(AssembledFrame { frame_index, image_bytes }).await?;
        }

        sink.finish().await
    }
}

/// `clip.mp4` is encoded as `clip.part.mp4`, keeping the extension ffmpeg reads the container from.
pub fn partial_output_path(output: &Path) -> PathBuf {
    let stem = output.file_stem().map(OsString::from).unwrap_or_else(|| OsString::from("video"));
    let mut name = stem;
    name.push(".part");
    if let Some(extension) = output.extension() {
        name.push(".");
        name.push(extension);
    }
    output.with_file_name(name)
}

#[cfg(test)]
pub(crate) mod tests {
    use parking_lot::Mutex;

    use super::*;

    /// Writes the received frame indices to the output, one per line.
    #[derive(Default)]
    pub(crate) struct RecordingEncoder {
        pub(crate) sessions: Mutex<Vec<Vec<usize>>>,
        pub(crate) fail_on_finish: bool,
    }

    struct RecordingSink {
        output: PathBuf,
        frames: Vec<usize>,
        fail: bool,
    }

    #[async_trait]
    impl FrameEncoder for RecordingEncoder {
        async fn start(&self, _frame_rate: u32, output: &Path) -> Result<Box<dyn FrameSink>> {
            self.sessions.lock().push(Vec::new());
            Ok(Box::new(RecordingSink { output: output.to_path_buf(), frames: Vec::new(), fail: self.fail_on_finish }))
        }
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn push(&mut self, frame: AssembledFrame) -> Result<()> {
            self.frames.push(frame.frame_index);
            Ok(())
        }

        async fn finish(self: Box<Self>) -> Result<()> {
            let listing = self.frames.iter().map(|index| index.to_string()).collect::<Vec<_>>().join("\n");
            tokio::fs::write(&self.output, listing).await?;
            if self.fail {
                return Err(DriveError::Encoder("exit status 1".into()));
            }
            Ok(())
        }
    }

    async fn store_with_frames(dir: &Path, frames: impl Iterator<Item = usize>) -> FrameStore {
        let store = FrameStore::new(dir.join("clip.mp4.frames"));
        store.prepare().await.unwrap();
        for frame in frames {
            store.write_frame(frame, format!("frame {}", frame).as_bytes()).await.unwrap();
        }
        store
    }

    #[test]
    fn partial_name_keeps_extension() {
        assert_eq!(partial_output_path(Path::new("/v/clip.mp4")), Path::new("/v/clip.part.mp4"));
        assert_eq!(partial_output_path(Path::new("clip")), Path::new("clip.part"));
    }

    #[tokio::test]
    async fn frames_are_muxed_in_order_and_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_frames(dir.path(), (0..10).rev()).await;
        let output = dir.path().join("clip.mp4");
        let encoder = Arc::new(RecordingEncoder::default());

        VideoMuxer::new(encoder.clone(), 25).mux(&store, 10, &output).await.unwrap();

        assert_eq!(encoder.sessions.lock().len(), 1);
        let listing = tokio::fs::read_to_string(&output).await.unwrap();
        assert_eq!(listing.lines().map(|l| l.parse::<usize>().unwrap()).collect::<Vec<_>>(), (0..10).collect::<Vec<_>>());
        assert!(!store.root().exists());
        assert!(!partial_output_path(&output).exists());
    }

    #[tokio::test]
    async fn gap_fails_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_frames(dir.path(), (0..10).filter(|frame| *frame != 5)).await;
        let output = dir.path().join("clip.mp4");
        let encoder = Arc::new(RecordingEncoder::default());

        let err = VideoMuxer::new(encoder.clone(), 25).mux(&store, 10, &output).await.unwrap_err();

        assert!(matches!(err, DriveError::IncompleteSequence { ref missing } if missing == &vec![5]));
        assert!(!output.exists());
        assert!(encoder.sessions.lock().is_empty());
        assert!(store.is_complete(4).await);
    }

    #[tokio::test]
    async fn failed_encode_keeps_frames_for_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_frames(dir.path(), 0..3).await;
        let output = dir.path().join("clip.mp4");
        let encoder = Arc::new(RecordingEncoder { fail_on_finish: true, ..Default::default() });

        let err = VideoMuxer::new(encoder, 25).mux(&store, 3, &output).await.unwrap_err();

        assert!(matches!(err, DriveError::Encoder(_)));
        assert!(!output.exists());
        assert!(!partial_output_path(&output).exists());
        assert!(store.missing_frames(3).await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn noisy_encoder_does_not_stall_the_pipe() {
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("chatty-encoder");
        // floods stderr before reading any input, then fails
        std::fs::write(
            &script,
            "#!/bin/sh\nhead -c 1048576 /dev/zero | tr '\\0' x >&2\ncat > /dev/null\necho conversion failed >&2\nexit 3\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let encoder = FfmpegEncoder::with_program(script.as_os_str());
        let encode = async {
            let mut sink = encoder.start(25, &dir.path().join("out.mp4")).await?;
            for frame_index in 0..8 {
                sink.push(AssembledFrame { frame_index, image_bytes: vec![7u8; 256 * 1024] }).await?;
            }
            sink.finish().await
        };

        let err = tokio::time::timeout(Duration::from_secs(30), encode).await.unwrap().unwrap_err();

        assert!(matches!(err, DriveError::Encoder(ref msg) if msg.ends_with("conversion failed")), "{}", err);
        assert!(err.to_string().len() < STDERR_TAIL + 200);
    }

    #[tokio::test]
    async fn missing_encoder_binary_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = FfmpegEncoder::with_program("definitely-not-an-encoder-binary");

        let err = encoder.start(25, &dir.path().join("out.mp4")).await.err().unwrap();

        assert!(matches!(err, DriveError::Encoder(ref msg) if msg.contains("not found")));
    }
}
