use std::{
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::{
    chunk::{ChunkBlocks, ChunkMetadata},
    coords::ChunkPosition,
    error::ChunkResult,
    storage::PersistedChunk,
};

enum Slot<T> {
    Running,
    Finished(T),
    Taken,
}

/// One-shot result cell. Any number of threads may wait for it to finish; exactly
/// one of them takes the value.
pub(crate) struct Completion<T> {
    slot: Mutex<Slot<T>>,
    cvar: Condvar,
}

impl<T> Completion<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Running),
            cvar: Condvar::new(),
        }
    }

    /// First completion wins; later ones are dropped.
    pub fn complete(&self, value: T) {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Running) {
            *slot = Slot::Finished(value);
            self.cvar.notify_all();
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(*self.slot.lock(), Slot::Running)
    }

    pub fn take(&self) -> Option<T> {
        let mut slot = self.slot.lock();
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Finished(value) => Some(value),
            other => {
                *slot = other;
                None
            }
        }
    }

    pub fn wait_done(&self) {
        let mut slot = self.slot.lock();
        while matches!(*slot, Slot::Running) {
            self.cvar.wait(&mut slot);
        }
    }

    /// Returns `false` on timeout.
    pub fn wait_done_for(&self, timeout: Duration) -> bool {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Running) {
            self.cvar.wait_while_for(&mut slot, |s| matches!(s, Slot::Running), timeout);
        }
        !matches!(*slot, Slot::Running)
    }
}

/// What a background population task produced.
pub(crate) enum Populated {
    Loaded(PersistedChunk),
    Generated {
        blocks: ChunkBlocks,
        metadata: ChunkMetadata,
        must_persist: bool,
    },
}

const QUEUED: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

/// In-flight load/generate for one position.
pub(crate) struct PendingTask {
    pub pos: ChunkPosition,
    phase: AtomicU8,
    pub result: Completion<ChunkResult<Populated>>,
}

impl PendingTask {
    pub fn new(pos: ChunkPosition) -> Self {
        Self {
            pos,
            phase: AtomicU8::new(QUEUED),
            result: Completion::new(),
        }
    }

    /// Claims the task for a worker. `false` if it was cancelled first.
    pub fn begin(&self) -> bool {
        self.phase
            .compare_exchange(QUEUED, STARTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cancels a task no worker has started. Running tasks are left to finish.
    pub fn cancel(&self) -> bool {
        self.phase
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Resolves when an unload has finished: saved (if dirty), listeners notified and
/// resources released.
pub struct UnloadHandle {
    pos: ChunkPosition,
    done: Arc<Completion<ChunkResult<()>>>,
}

impl UnloadHandle {
    pub(crate) fn new(pos: ChunkPosition, done: Arc<Completion<ChunkResult<()>>>) -> Self {
        Self { pos, done }
    }

    pub fn position(&self) -> ChunkPosition {
        self.pos
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_finished()
    }

    pub fn wait(self) -> ChunkResult<()> {
        self.done.wait_done();
        self.done.take().unwrap_or(Ok(()))
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<ChunkResult<()>, Self> {
        if !self.done.wait_done_for(timeout) {
            return Err(self);
        }
        Ok(self.done.take().unwrap_or(Ok(())))
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::error::ChunkError;

    #[test]
    fn first_completion_wins() {
        let done = Completion::new();
        assert!(!done.is_finished());
        assert_eq!(done.take(), None);
        done.complete(1);
        done.complete(2);
        assert!(done.is_finished());
        assert_eq!(done.take(), Some(1));
        assert_eq!(done.take(), None);
        assert!(done.is_finished());
    }

    #[test]
    fn waiters_wake() {
        let done = Arc::new(Completion::new());
        let waiter = {
            let done = done.clone();
            thread::spawn(move || {
                done.wait_done();
                done.take()
            })
        };
        thread::sleep(Duration::from_millis(10));
        done.complete("saved");
        assert_eq!(waiter.join().unwrap(), Some("saved"));
    }

    #[test]
    fn timeout() {
        let done: Completion<()> = Completion::new();
        assert!(!done.wait_done_for(Duration::from_millis(5)));
        done.complete(());
        assert!(done.wait_done_for(Duration::from_millis(5)));
    }

    #[test]
    fn cancel_only_before_start() {
        let queued = PendingTask::new(ChunkPosition::ORIGIN);
        assert!(queued.cancel());
        assert!(!queued.begin());

        let running = PendingTask::new(ChunkPosition::ORIGIN);
        assert!(running.begin());
        assert!(!running.cancel());
    }

    #[test]
    fn unload_handle_surfaces_error() {
        let done = Arc::new(Completion::new());
        let handle = UnloadHandle::new(ChunkPosition::new(4, 4), done.clone());
        let handle = handle.wait_timeout(Duration::from_millis(1)).unwrap_err();
        done.complete(Err(ChunkError::NotLoaded(ChunkPosition::new(4, 4))));
        assert!(handle.is_finished());
        assert!(matches!(handle.wait(), Err(ChunkError::NotLoaded(_))));
    }
}
