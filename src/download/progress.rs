use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const REFRESH: Duration = Duration::from_millis(200);

/// Counters shared by all workers of a run.
#[derive(Debug, Default)]
pub struct DownloadProgress {
    frames_done: AtomicUsize,
    frames_total: AtomicUsize,
    bytes_transferred: AtomicU64,
    bytes_total: AtomicU64,
}

impl DownloadProgress {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_frames_total(&self, total: usize) {
        self.frames_total.store(total, Ordering::Relaxed);
    }

    pub fn set_bytes_total(&self, total: u64) {
        self.bytes_total.store(total, Ordering::Relaxed);
    }

    pub fn frame_done(&self) {
        self.frames_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
    }

    /// A resumed stream restarts its count from what is already on disk.
    pub fn set_bytes_transferred(&self, bytes: u64) {
        self.bytes_transferred.store(bytes, Ordering::Relaxed);
    }

    pub fn frames_done(&self) -> usize {
        self.frames_done.load(Ordering::Relaxed)
    }

    pub fn frames_total(&self) -> usize {
        self.frames_total.load(Ordering::Relaxed)
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::Relaxed)
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Frames,
    Bytes,
}

/// Draws a progress bar from `progress` until `stop` fires.
pub fn spawn_reporter(progress: Arc<DownloadProgress>, kind: ReportKind, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        bar.set_style(style(kind));

        loop {
            match kind {
                ReportKind::Frames => {
                    bar.set_length(progress.frames_total() as u64);
                    bar.set_position(progress.frames_done() as u64);
                    bar.set_message(indicatif::HumanBytes(progress.bytes_transferred()).to_string());
                }
                ReportKind::Bytes => {
                    bar.set_length(progress.bytes_total());
                    bar.set_position(progress.bytes_transferred());
                }
            }

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(REFRESH) => {}
            }
        }

        bar.finish_and_clear();
    })
}

fn style(kind: ReportKind) -> ProgressStyle {
    let template = match kind {
        ReportKind::Frames => "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} frames ({eta}) {msg}",
        ReportKind::Bytes => "[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
    };

    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}
