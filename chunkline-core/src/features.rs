use std::{collections::VecDeque, time::Duration};

use fxhash::FxHashSet;
use parking_lot::Mutex;

use crate::{config::StoreConfig, coords::ChunkPosition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureTask {
    pub pos: ChunkPosition,
    pub retries: u32,
}

/// Result of trying to decorate one queued chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureStep {
    Decorated,
    /// Gone or already decorated; dropped from the queue.
    Skipped,
    /// East, south or south-east is missing. The task goes to the back and the
    /// batch stops.
    NotReady,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureBatchStats {
    pub decorated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub requeued: usize,
    pub batch_size: usize,
}

/// Batch size that shrinks when frames run long and creeps back up otherwise.
#[derive(Debug, Clone)]
pub struct AdaptiveBatch {
    size: usize,
    min: usize,
    max: usize,
    frame_budget: Duration,
}

impl AdaptiveBatch {
    const SHRINK: usize = 2;
    const GROW: usize = 1;

    pub fn new(config: &StoreConfig) -> Self {
        let min = config.feature_batch_min.max(1);
        let max = config.feature_batch_max.max(min);
        Self {
            size: config.feature_batch_initial.clamp(min, max),
            min,
            max,
            frame_budget: config.feature_frame_budget(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn adjust(&mut self, last_frame: Duration) -> usize {
        self.size = if last_frame > self.frame_budget {
            self.size.saturating_sub(Self::SHRINK).max(self.min)
        } else {
            (self.size + Self::GROW).min(self.max)
        };
        self.size
    }
}

#[derive(Default)]
struct Inner {
    queue: VecDeque<FeatureTask>,
    members: FxHashSet<ChunkPosition>,
}

/// Chunks waiting for decoration. A position is queued at most once.
pub struct FeaturePopulationQueue {
    inner: Mutex<Inner>,
    batch: Mutex<AdaptiveBatch>,
}

impl FeaturePopulationQueue {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            batch: Mutex::new(AdaptiveBatch::new(config)),
        }
    }

    pub fn enqueue(&self, pos: ChunkPosition) -> bool {
        let mut inner = self.inner.lock();
        if !inner.members.insert(pos) {
            return false;
        }
        inner.queue.push_back(FeatureTask { pos, retries: 0 });
        true
    }

    /// Forgets `pos`, e.g. because its chunk is unloading.
    pub fn remove(&self, pos: ChunkPosition) -> bool {
        let mut inner = self.inner.lock();
        if !inner.members.remove(&pos) {
            return false;
        }
        inner.queue.retain(|task| task.pos != pos);
        true
    }

    pub fn contains(&self, pos: ChunkPosition) -> bool {
        self.inner.lock().members.contains(&pos)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.batch.lock().size()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.members.clear();
    }

    /// Runs `step` over up to one adaptive batch of queued chunks. The queue lock is
    /// not held while `step` runs.
    pub fn process<F>(&self, last_frame: Duration, mut step: F) -> FeatureBatchStats
    where
        F: FnMut(&FeatureTask) -> FeatureStep,
    {
        let batch_size = self.batch.lock().adjust(last_frame);
        let mut stats = FeatureBatchStats {
            batch_size,
            ..Default::default()
        };

        for _ in 0..batch_size {
            let Some(task) = self.inner.lock().queue.pop_front() else {
                break;
            };

            match step(&task) {
                FeatureStep::NotReady => {
                    let mut inner = self.inner.lock();
                    // unloaded while we were looking at it
                    if inner.members.contains(&task.pos) {
                        inner.queue.push_back(FeatureTask {
                            pos: task.pos,
                            retries: task.retries + 1,
                        });
                        stats.requeued += 1;
                    }
                    break;
                }
                outcome => {
                    self.inner.lock().members.remove(&task.pos);
                    match outcome {
                        FeatureStep::Decorated => stats.decorated += 1,
                        FeatureStep::Failed => stats.failed += 1,
                        _ => stats.skipped += 1,
                    }
                }
            }
        }

        stats
    }
}
