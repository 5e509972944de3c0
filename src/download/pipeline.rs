use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cookies::Session;
use crate::download::direct::download_direct;
use crate::download::metadata::{with_default_extension, FileKind, MetadataResolver, TileGrid};
use crate::download::mux::{FfmpegEncoder, FrameEncoder, VideoMuxer};
use crate::download::progress::{spawn_reporter, DownloadProgress, ReportKind};
use crate::download::scheduler::{Scheduler, TaskBoard};
use crate::download::store::FrameStore;
use crate::download::tile::{TileFetcher, TileSource, ViewerTileSource};
use crate::download::video_id::extract_video_id;
use crate::download::DriveClient;
use crate::error::{DriveError, Result};
use crate::options::Options;

/// Downloads the video behind `input` (an id or a share link) and returns
/// where it was saved.
pub async fn download(
    input: &str,
    output: Option<&Path>,
    options: &Options,
    session: Session,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let identifier = extract_video_id(input);
    if identifier.is_empty() {
        return Err(DriveError::NotFound(format!("no file id in {:?}", input)));
    }
    info!("resolving {}", identifier);

    let requested = output.map(output_path);
    if let Some(path) = &requested {
        refuse_existing(path).await?;
    }

    let client = Arc::new(DriveClient::new(options, session)?);
    let handle = MetadataResolver::new(options.retry_policy())
        .resolve(&client, &identifier, cancel)
        .await?;

    let output = match requested {
        Some(path) => path,
        None => {
            let path = PathBuf::from(handle.default_file_name());
            refuse_existing(&path).await?;
            path
        }
    };

    let progress = DownloadProgress::new();
    let stop_reporter = cancel.child_token();

    let result = match handle.kind {
        FileKind::Direct { ref stream_url, byte_size } => {
            info!(bytes = byte_size, "file is downloadable, streaming it directly");
            let reporter = spawn_reporter(Arc::clone(&progress), ReportKind::Bytes, stop_reporter.clone());
            let result = download_direct(&client, stream_url, byte_size, &output, options, progress, cancel).await;
            stop_reporter.cancel();
            let _ = reporter.await;
            result
        }
        FileKind::ViewOnly { total_frames, grid } => {
            info!(frames = total_frames, rows = grid.rows, cols = grid.cols, "file is view-only, rebuilding from frames");
            let source = Arc::new(ViewerTileSource::new(Arc::clone(&client), handle.identifier.as_str()));
            let encoder = Arc::new(FfmpegEncoder::with_program(&options.ffmpeg));
            let reporter = spawn_reporter(Arc::clone(&progress), ReportKind::Frames, stop_reporter.clone());
            let result =
                reconstruct(source, encoder, total_frames, grid, &output, options, progress, cancel).await;
            stop_reporter.cancel();
            let _ = reporter.await;
            result
        }
    };

    result.map(|_| output)
}

/// An explicit output without an extension becomes an mp4.
fn output_path(requested: &Path) -> PathBuf {
    match requested.file_name().and_then(|name| name.to_str()) {
        Some(name) => requested.with_file_name(with_default_extension(name)),
        None => requested.to_path_buf(),
    }
}

async fn refuse_existing(output: &Path) -> Result<()> {
    if tokio::fs::try_exists(output).await? {
        return Err(DriveError::OutputExists(output.to_path_buf()));
    }
    Ok(())
}

/// Fetches every frame of a view-only video into the work directory next to
/// `output`, then muxes them. Frames already on disk from an earlier run are kept.
#[allow(clippy::too_many_arguments)]
pub async fn reconstruct(
    source: Arc<dyn TileSource>,
    encoder: Arc<dyn FrameEncoder>,
    total_frames: usize,
    grid: TileGrid,
    output: &Path,
    options: &Options,
    progress: Arc<DownloadProgress>,
    cancel: &CancellationToken,
) -> Result<()> {
    if total_frames == 0 {
        return Err(DriveError::Unsupported("the viewer reports no frames".into()));
    }

    let store = Arc::new(FrameStore::for_output(output));
    store.prepare().await?;

    let resumed = store.complete_count(total_frames).await;
    if resumed > 0 {
        info!(resumed, "continuing from {}", store.root().display());
    }

    let policy = options.retry_policy();
    let fetcher = Arc::new(TileFetcher::new(source, Arc::clone(&store), policy, Arc::clone(&progress)));
    let scheduler = Scheduler::new(options.max_parallel_downloads, policy, fetcher, Arc::clone(&store), progress);

    let board = Arc::new(TaskBoard::new(total_frames, grid));
    if let Err(err) = scheduler.run(Arc::clone(&board), cancel).await {
        warn!("{} frames kept in {}", store.complete_count(total_frames).await, store.root().display());
        return Err(err);
    }

    VideoMuxer::new(encoder, options.frame_rate).mux(&store, total_frames, output).await?;
    info!("saved {}", output.display());
    Ok(())
}
