//! On-disk state of a view-only reconstruction, laid out for resuming.
//!
//! ```text
//! <output>.frames/
//!     frame_000041.png          assembled frame, complete
//!     frame_000042/
//!         tile_r0_c0.bin        fetched tile
//!         .fetched              every tile of the frame is on disk
//! ```
//!
//! Every file is written under a `.part` name and renamed into place, so an
//! existing final name always means a complete artifact.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::Result;

const FETCHED_MARKER: &str = ".fetched";
const PART_SUFFIX: &str = ".part";

#[derive(Debug, Clone)]
pub struct FrameStore {
    root: PathBuf,
}

impl FrameStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Work directory next to the output file: `clip.mp4` keeps its frames in `clip.mp4.frames`.
    pub fn for_output(output: &Path) -> Self {
        let mut name = output.file_name().map(OsString::from).unwrap_or_else(|| OsString::from("video"));
        name.push(".frames");
        Self::new(output.with_file_name(name))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    pub fn frame_path(&self, frame_index: usize) -> PathBuf {
        self.root.join(format!("frame_{:06}.png", frame_index))
    }

    fn tile_dir(&self, frame_index: usize) -> PathBuf {
        self.root.join(format!("frame_{:06}", frame_index))
    }

    fn tile_path(&self, frame_index: usize, row: u32, col: u32) -> PathBuf {
        self.tile_dir(frame_index).join(format!("tile_r{}_c{}.bin", row, col))
    }

    pub async fn is_complete(&self, frame_index: usize) -> bool {
        exists(&self.frame_path(frame_index)).await
    }

    pub async fn has_all_tiles(&self, frame_index: usize) -> bool {
        exists(&self.tile_dir(frame_index).join(FETCHED_MARKER)).await
    }

    pub async fn read_tile(&self, frame_index: usize, row: u32, col: u32) -> Result<Option<Bytes>> {
        match tokio::fs::read(self.tile_path(frame_index, row, col)).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn write_tile(&self, frame_index: usize, row: u32, col: u32, bytes: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(self.tile_dir(frame_index)).await?;
        write_atomic(&self.tile_path(frame_index, row, col), bytes).await
    }

    pub async fn mark_fetched(&self, frame_index: usize) -> Result<()> {
        write_atomic(&self.tile_dir(frame_index).join(FETCHED_MARKER), b"").await
    }

    /// Drops the stored tiles of a frame so the next attempt fetches them again.
    pub async fn discard_tiles(&self, frame_index: usize) -> Result<()> {
        match tokio::fs::remove_dir_all(self.tile_dir(frame_index)).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    /// Finalizes a frame. Its tiles are no longer needed afterwards.
    pub async fn write_frame(&self, frame_index: usize, image_bytes: &[u8]) -> Result<()> {
        write_atomic(&self.frame_path(frame_index), image_bytes).await?;

        if let Err(err) = tokio::fs::remove_dir_all(self.tile_dir(frame_index)).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(frame = frame_index, "cannot remove tile directory: {}", err);
            }
        }

        Ok(())
    }

    pub async fn read_frame(&self, frame_index: usize) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.frame_path(frame_index)).await?)
    }

    pub async fn complete_count(&self, total_frames: usize) -> usize {
        total_frames - self.missing_frames(total_frames).await.len()
    }

    /// Indices in `0..total_frames` without a finalized frame, ascending.
    pub async fn missing_frames(&self, total_frames: usize) -> Vec<usize> {
        let mut missing = Vec::new();
        for frame_index in 0..total_frames {
            if !self.is_complete(frame_index).await {
                missing.push(frame_index);
            }
        }
        missing
    }

    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Writes `<path>.part`, syncs it and renames it over `path`.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut part_name = path.as_os_str().to_owned();
    part_name.push(PART_SUFFIX);
    let part_path = PathBuf::from(part_name);

    let mut file = tokio::fs::File::create(&part_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&part_path, path).await?;
    Ok(())
}
