use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::download::progress::DownloadProgress;
use crate::download::retry::{retry, RetryPolicy};
use crate::download::scheduler::FrameTask;
use crate::download::store::FrameStore;
use crate::download::DriveClient;
use crate::error::{DriveError, Result};

const TILE_PATH: &str = "viewerng/img";
const VIEWER_WIDTH: &str = "1600";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tile {
    pub frame_index: usize,
    pub row: u32,
    pub col: u32,
    pub raw_bytes: Bytes,
}

/// Query shape of the viewer's own tile requests; other shapes get refused.
pub fn tile_url(client: &DriveClient, identifier: &str, frame_index: usize, row: u32, col: u32) -> Result<Url> {
    let page = frame_index.to_string();
    let row = row.to_string();
    let col = col.to_string();

    client.endpoint(
        TILE_PATH,
        &[
            ("id", identifier),
            ("page", page.as_str()),
            ("row", row.as_str()),
            ("col", col.as_str()),
            ("skiphighlight", "true"),
            ("w", VIEWER_WIDTH),
            ("webp", "false"),
        ],
    )
}

#[async_trait]
pub trait TileSource: Send + Sync {
    async fn fetch_tile(&self, frame_index: usize, row: u32, col: u32) -> Result<Bytes>;
}

pub struct ViewerTileSource {
    client: Arc<DriveClient>,
    identifier: String,
}

impl ViewerTileSource {
    pub fn new(client: Arc<DriveClient>, identifier: impl Into<String>) -> Self {
        Self { client, identifier: identifier.into() }
    }
}

#[async_trait]
impl TileSource for ViewerTileSource {
    async fn fetch_tile(&self, frame_index: usize, row: u32, col: u32) -> Result<Bytes> {
        let url = tile_url(&self.client, &self.identifier, frame_index, row, col)?;
        let bytes = self.client.get_bytes(&url).await?;

        if bytes.is_empty() {
            return Err(DriveError::TransientNetwork(format!(
                "empty tile r{}c{} for frame {}",
                row, col, frame_index
            )));
        }

        Ok(bytes)
    }
}

pub enum FetchOutcome {
    /// The frame was finalized by an earlier run.
    AlreadyComplete,
    Tiles(Vec<Tile>),
}

/// Fetches the tiles of one frame, persisting each so a later run can pick up
/// where this one stopped.
pub struct TileFetcher {
    source: Arc<dyn TileSource>,
    store: Arc<FrameStore>,
    policy: RetryPolicy,
    progress: Arc<DownloadProgress>,
}

impl TileFetcher {
    pub fn new(
        source: Arc<dyn TileSource>,
        store: Arc<FrameStore>,
        policy: RetryPolicy,
        progress: Arc<DownloadProgress>,
    ) -> Self {
        Self { source, store, policy, progress }
    }

    pub async fn fetch_frame(&self, task: &FrameTask, cancel: &CancellationToken) -> Result<FetchOutcome> {
        let frame_index = task.frame_index;

        if self.store.is_complete(frame_index).await {
            debug!(frame = frame_index, "frame already assembled, skipping");
            return Ok(FetchOutcome::AlreadyComplete);
        }

        if self.store.has_all_tiles(frame_index).await {
            debug!(frame = frame_index, "tiles already on disk, reassembling");
        }

        let grid = task.tile_grid_dims;
        let mut tiles = Vec::with_capacity(grid.tile_count());

        for (row, col) in grid.positions() {
            if cancel.is_cancelled() {
                return Err(DriveError::Cancelled);
            }

            let raw_bytes = match self.store.read_tile(frame_index, row, col).await? {
                Some(bytes) => bytes,
                None => {
                    let what = format!("tile r{}c{} of frame {}", row, col, frame_index);
                    let bytes = retry(&self.policy, cancel, &what, |_| {
                        self.source.fetch_tile(frame_index, row, col)
                    })
                    .await?;

                    self.store.write_tile(frame_index, row, col, &bytes).await?;
                    self.progress.add_bytes(bytes.len() as u64);
                    bytes
                }
            };

            tiles.push(Tile { frame_index, row, col, raw_bytes });
        }

        self.store.mark_fetched(frame_index).await?;
        Ok(FetchOutcome::Tiles(tiles))
    }
}
