//! Bounded worker pool that drives fetch and assembly of every frame.
//!
//! Workers pull the next pending frame from a [`TaskBoard`]; at most
//! `workers` frames are in memory at once, whatever the frame count.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::download::assemble::assemble_frame;
use crate::download::metadata::TileGrid;
use crate::download::progress::DownloadProgress;
use crate::download::retry::{retry, RetryPolicy};
use crate::download::store::FrameStore;
use crate::download::tile::{FetchOutcome, TileFetcher};
use crate::error::{DriveError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameTask {
    pub frame_index: usize,
    pub tile_grid_dims: TileGrid,
    pub status: FrameStatus,
    pub attempts: u32,
}

/// Source of work for [`run_pool`]. `claim` must never hand the same task to two workers.
pub trait WorkQueue: Send + Sync + 'static {
    type Task: Clone + Send + 'static;

    fn claim(&self) -> Option<Self::Task>;

    fn settle(&self, task: &Self::Task, outcome: &Result<()>);
}

/// The set of frame tasks of a run, and the only place a frame gets claimed.
pub struct TaskBoard {
    tasks: Mutex<Vec<FrameTask>>,
}

impl TaskBoard {
    pub fn new(total_frames: usize, grid: TileGrid) -> Self {
        let tasks = (0..total_frames)
            .map(|frame_index| FrameTask {
                frame_index,
                tile_grid_dims: grid,
                status: FrameStatus::Pending,
                attempts: 0,
            })
            .collect();

        Self { tasks: Mutex::new(tasks) }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    #[cfg(test)]
    pub fn status(&self, frame_index: usize) -> Option<FrameStatus> {
        self.tasks.lock().get(frame_index).map(|task| task.status)
    }

    pub fn count(&self, status: FrameStatus) -> usize {
        self.tasks.lock().iter().filter(|task| task.status == status).count()
    }

    pub fn all_complete(&self) -> bool {
        self.tasks.lock().iter().all(|task| task.status == FrameStatus::Complete)
    }

    pub fn record_attempt(&self, frame_index: usize) {
        if let Some(task) = self.tasks.lock().get_mut(frame_index) {
            task.attempts += 1;
        }
    }

    pub fn attempts(&self, frame_index: usize) -> u32 {
        self.tasks.lock().get(frame_index).map(|task| task.attempts).unwrap_or(0)
    }
}

impl WorkQueue for TaskBoard {
    type Task = FrameTask;

    fn claim(&self) -> Option<FrameTask> {
        let mut tasks = self.tasks.lock();
        let task = tasks.iter_mut().find(|task| task.status == FrameStatus::Pending)?;
        task.status = FrameStatus::InProgress;
        Some(task.clone())
    }

    fn settle(&self, task: &FrameTask, outcome: &Result<()>) {
        let mut tasks = self.tasks.lock();
        if let Some(entry) = tasks.get_mut(task.frame_index) {
            entry.status = match outcome {
                Ok(()) => FrameStatus::Complete,
                // an interrupted frame goes back to the queue for the next run
                Err(DriveError::Cancelled) => FrameStatus::Pending,
                Err(_) => FrameStatus::Failed,
            };
        }
    }
}

/// Runs `work` over every task of `queue` on `workers` concurrent tasks.
///
/// The first failing task stops the pool: no new task is claimed and
/// in-flight ones see their token cancelled. That error is returned; if the
/// pool was stopped through `cancel` instead, the result is `Cancelled`.
pub async fn run_pool<Q, F, Fut>(queue: Arc<Q>, workers: usize, cancel: &CancellationToken, work: F) -> Result<()>
where
    Q: WorkQueue,
    F: Fn(Q::Task, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let stop = cancel.child_token();
    let work = Arc::new(work);
    let mut pool = JoinSet::new();

    for worker in 0..workers.max(1) {
        let queue = Arc::clone(&queue);
        let work = Arc::clone(&work);
        let stop = stop.clone();

        pool.spawn(async move {
            while !stop.is_cancelled() {
                let Some(task) = queue.claim() else {
                    break;
                };

                let outcome = work(task.clone(), stop.clone()).await;
                queue.settle(&task, &outcome);

                if let Err(err) = outcome {
                    stop.cancel();
                    return Err(err);
                }
            }

            debug!(worker, "worker finished");
            Ok(())
        });
    }

    let mut first_error = None;
    while let Some(joined) = pool.join_next().await {
        let result = joined.map_err(DriveError::from).and_then(|result| result);
        match result {
            Ok(()) => {}
            Err(DriveError::Cancelled) => {}
            Err(err) => {
                stop.cancel();
                first_error.get_or_insert(err);
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None if cancel.is_cancelled() => Err(DriveError::Cancelled),
        None => Ok(()),
    }
}

/// Fetch and assembly of every frame on a bounded pool, with per-frame retries.
pub struct Scheduler {
    workers: usize,
    policy: RetryPolicy,
    fetcher: Arc<TileFetcher>,
    store: Arc<FrameStore>,
    progress: Arc<DownloadProgress>,
}

impl Scheduler {
    pub fn new(
        workers: usize,
        policy: RetryPolicy,
        fetcher: Arc<TileFetcher>,
        store: Arc<FrameStore>,
        progress: Arc<DownloadProgress>,
    ) -> Self {
        Self { workers, policy, fetcher, store, progress }
    }

    pub async fn run(&self, board: Arc<TaskBoard>, cancel: &CancellationToken) -> Result<()> {
        let total = board.len();
        self.progress.set_frames_total(total);
        info!(frames = total, workers = self.workers, "fetching frames");

        let policy = self.policy;
        let fetcher = Arc::clone(&self.fetcher);
        let store = Arc::clone(&self.store);
        let progress = Arc::clone(&self.progress);
        let attempts = Arc::clone(&board);

        let result = run_pool(Arc::clone(&board), self.workers, cancel, move |task: FrameTask, stop| {
            let fetcher = Arc::clone(&fetcher);
            let store = Arc::clone(&store);
            let progress = Arc::clone(&progress);
            let attempts = Arc::clone(&attempts);

            async move {
                let what = format!("frame {}", task.frame_index);
                let outcome = retry(&policy, &stop, &what, |_| {
                    attempts.record_attempt(task.frame_index);
                    process_frame(&fetcher, &store, &task, &stop)
                })
                .await;

                if let Err(err) = &outcome {
                    if !matches!(err, DriveError::Cancelled) {
                        warn!(frame = task.frame_index, attempts = attempts.attempts(task.frame_index), "giving up: {}", err);
                    }
                }
                outcome?;

                progress.frame_done();
                Ok(())
            }
        })
        .await;

        match &result {
            Ok(()) => {
                debug_assert!(board.all_complete());
                info!(frames = total, "all frames assembled")
            }
            Err(DriveError::Cancelled) => info!(
                complete = board.count(FrameStatus::Complete),
                "stopped, completed frames are kept for the next run"
            ),
            Err(err) => error!(failed = board.count(FrameStatus::Failed), "frame download failed: {}", err),
        }

        result
    }
}

async fn process_frame(
    fetcher: &TileFetcher,
    store: &FrameStore,
    task: &FrameTask,
    cancel: &CancellationToken,
) -> Result<()> {
    let tiles = match fetcher.fetch_frame(task, cancel).await? {
        FetchOutcome::AlreadyComplete => return Ok(()),
        FetchOutcome::Tiles(tiles) => tiles,
    };

    let frame_index = task.frame_index;
    let grid = task.tile_grid_dims;
    let assembled = tokio::task::spawn_blocking(move || assemble_frame(frame_index, grid, tiles)).await?;
    let frame = match assembled {
        Ok(frame) => frame,
        Err(err) => {
            // a bad tile on disk would fail every later run the same way
            warn!(frame = frame_index, "discarding stored tiles: {}", err);
            store.discard_tiles(frame_index).await?;
            return Err(err);
        }
    };

    store.write_frame(frame.frame_index, &frame.image_bytes).await?;
    debug!(frame = frame_index, bytes = frame.image_bytes.len(), "frame assembled");
    Ok(())
}
