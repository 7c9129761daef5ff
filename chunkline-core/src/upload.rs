use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam::queue::SegQueue;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    chunk::Chunk,
    config::UploaderConfig,
    coords::ChunkPosition,
    error::DeviceError,
    meshing::ChunkMesh,
    metrics::{ChunkMetric, ChunkMetrics},
    state::ChunkState,
};

/// Opaque device-side buffer id. Only the render thread creates or frees one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuHandle(pub u64);

/// Render-thread collaborator. Only reachable through [`AsyncUploader::process_uploads`].
pub trait GraphicsDevice {
    fn upload(&mut self, pos: ChunkPosition, mesh: &ChunkMesh) -> Result<GpuHandle, DeviceError>;

    fn release(&mut self, handle: GpuHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UploadPriority {
    Background,
    Low,
    Normal,
    High,
    Immediate,
}

impl UploadPriority {
    /// Nearer chunks upload first.
    pub fn from_distance(distance: u32, render_distance: u32) -> Self {
        let render_distance = render_distance.max(1);
        match distance {
            0 => UploadPriority::Immediate,
            d if d <= 2 => UploadPriority::High,
            d if d.saturating_mul(2) <= render_distance => UploadPriority::Normal,
            d if d <= render_distance => UploadPriority::Low,
            _ => UploadPriority::Background,
        }
    }
}

pub struct UploadRequest {
    pub pos: ChunkPosition,
    pub chunk: Weak<Chunk>,
    pub mesh: Arc<ChunkMesh>,
}

impl UploadRequest {
    pub fn new(chunk: &Arc<Chunk>, mesh: Arc<ChunkMesh>) -> Self {
        Self {
            pos: chunk.position(),
            chunk: Arc::downgrade(chunk),
            mesh,
        }
    }
}

impl std::fmt::Debug for UploadRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadRequest")
            .field("pos", &self.pos)
            .field("quads", &self.mesh.quad_count())
            .finish()
    }
}

#[derive(Debug, Error)]
#[error("upload queue full, rejected chunk {}", .request.pos)]
pub struct UploadRejected {
    pub request: UploadRequest,
    pub priority: UploadPriority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded(GpuHandle),
    /// The chunk was gone, unloading, or already had a newer mesh.
    Skipped,
    Failed,
    Cancelled,
}

/// Resolves once the render thread has dealt with the submitted mesh.
#[derive(Debug)]
pub struct UploadTicket {
    rx: Receiver<UploadOutcome>,
}

impl UploadTicket {
    pub fn try_outcome(&self) -> Option<UploadOutcome> {
        self.rx.try_recv().ok()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<UploadOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

struct QueuedUpload {
    priority: UploadPriority,
    seq: u64,
    request: UploadRequest,
    tx: Sender<UploadOutcome>,
}

impl QueuedUpload {
    fn resolve(self, outcome: UploadOutcome) {
        let _ = self.tx.send(outcome);
    }
}

impl PartialEq for QueuedUpload {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedUpload {}

impl PartialOrd for QueuedUpload {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// Max-heap: higher priority first, then earlier submission.
impl Ord for QueuedUpload {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub released: usize,
}

pub struct AsyncUploader {
    queue: Mutex<BinaryHeap<QueuedUpload>>,
    releases: SegQueue<GpuHandle>,
    next_seq: AtomicU64,
    rejected: AtomicU64,
    config: UploaderConfig,
    metrics: Arc<ChunkMetrics>,
}

impl AsyncUploader {
    pub fn new(config: UploaderConfig, metrics: Arc<ChunkMetrics>) -> Self {
        Self {
            queue: Mutex::new(BinaryHeap::with_capacity(config.capacity.min(4096))),
            releases: SegQueue::new(),
            next_seq: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            config,
            metrics,
        }
    }

    /// Callable from any thread.
    pub fn submit(
        &self,
        request: UploadRequest,
        priority: UploadPriority,
    ) -> Result<UploadTicket, UploadRejected> {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.capacity {
            drop(queue);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            warn!("upload queue full, rejecting chunk {}", request.pos);
            return Err(UploadRejected { request, priority });
        }

        let (tx, rx) = crossbeam_channel::bounded(1);
        queue.push(QueuedUpload {
            priority,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            request,
            tx,
        });

        Ok(UploadTicket { rx })
    }

    /// Queues a device handle for release on the next render-thread pass.
    pub fn release(&self, handle: GpuHandle) {
        self.releases.push(handle);
    }

    /// Render thread only. Uploads in priority order until the per-frame count or
    /// time budget runs out, then frees every handle queued for release.
    #[cfg_attr(feature = "profile", tracing::instrument(skip_all))]
    pub fn process_uploads(&self, device: &mut dyn GraphicsDevice) -> UploadStats {
        let start = Instant::now();
        let budget = self.config.frame_budget();
        let mut stats = UploadStats::default();

        while stats.uploaded + stats.skipped + stats.failed < self.config.max_uploads_per_frame
            && start.elapsed() < budget
        {
            let Some(entry) = self.queue.lock().pop() else {
                break;
            };

            let outcome = self.upload_one(device, &entry.request);
            match outcome {
                UploadOutcome::Uploaded(_) => stats.uploaded += 1,
                UploadOutcome::Failed => stats.failed += 1,
                _ => stats.skipped += 1,
            }
            entry.resolve(outcome);
        }

        while let Some(handle) = self.releases.pop() {
            device.release(handle);
            stats.released += 1;
        }

        stats
    }

    fn upload_one(
        &self,
        device: &mut dyn GraphicsDevice,
        request: &UploadRequest,
    ) -> UploadOutcome {
        let Some(chunk) = request.chunk.upgrade() else {
            return UploadOutcome::Skipped;
        };
        if chunk.state().has_any(ChunkState::UNLOADING) || !chunk.is_current_mesh(&request.mesh) {
            debug!("skipping stale upload for chunk {}", request.pos);
            return UploadOutcome::Skipped;
        }

        let started = Instant::now();
        let handle = match device.upload(request.pos, &request.mesh) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("uploading chunk {} failed: {e}", request.pos);
                chunk.mark_mesh_dirty_only();
                return UploadOutcome::Failed;
            }
        };
        self.metrics.get(ChunkMetric::Upload).record(started.elapsed());

        // The new buffer exists before the old one goes away.
        if let Some(old) = chunk.swap_gpu_handle(Some(handle)) {
            device.release(old);
        }
        chunk.state().mark_uploaded();

        // An unload racing this upload may already have released resources; whoever
        // takes the handle out of the slot frees it.
        if chunk.state().has_any(ChunkState::UNLOADING) {
            if let Some(orphan) = chunk.swap_gpu_handle(None) {
                device.release(orphan);
            }
            return UploadOutcome::Skipped;
        }

        UploadOutcome::Uploaded(handle)
    }

    /// Resolves everything still queued as cancelled. Returns how many were dropped.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.queue.lock().drain().collect();
        let count = drained.len();
        for entry in drained {
            entry.resolve(UploadOutcome::Cancelled);
        }
        count
    }

    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn pending_releases(&self) -> usize {
        self.releases.len()
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunk::{ChunkBlocks, ChunkMetadata},
        test_support::FakeDevice,
    };

    fn uploader(capacity: usize) -> AsyncUploader {
        AsyncUploader::new(
            UploaderConfig {
                capacity,
                max_uploads_per_frame: 10,
                frame_budget_us: 1_000_000,
            },
            Arc::new(ChunkMetrics::new()),
        )
    }

    fn meshed_chunk(x: i32) -> (Arc<Chunk>, Arc<ChunkMesh>) {
        let chunk = Arc::new(Chunk::new(
            ChunkPosition::new(x, 0),
            ChunkBlocks::default(),
            ChunkMetadata::default(),
            true,
            ChunkState::ACTIVE | ChunkState::READY | ChunkState::MESH_CPU_READY,
        ));
        let mesh = Arc::new(ChunkMesh::default());
        chunk.store_mesh(mesh.clone());
        (chunk, mesh)
    }

    #[test]
    fn priority_then_fifo() {
        let uploader = uploader(16);
        let mut device = FakeDevice::default();
        let chunks: Vec<_> = (0..4).map(meshed_chunk).collect();
        let priorities = [
            UploadPriority::Low,
            UploadPriority::High,
            UploadPriority::Low,
            UploadPriority::Immediate,
        ];
        for ((chunk, mesh), priority) in chunks.iter().zip(priorities) {
            uploader
                .submit(UploadRequest::new(chunk, mesh.clone()), priority)
                .unwrap();
        }

        let stats = uploader.process_uploads(&mut device);
        assert_eq!(stats.uploaded, 4);
        let order: Vec<i32> = device.uploads.iter().map(|p| p.x).collect();
        assert_eq!(order, vec![3, 1, 0, 2]);
        assert!(chunks.iter().all(|(c, _)| c.state().is_renderable()));
    }

    #[test]
    fn overflow_returns_request() {
        let uploader = uploader(1);
        let (a, mesh_a) = meshed_chunk(0);
        let (b, mesh_b) = meshed_chunk(1);

        uploader
            .submit(UploadRequest::new(&a, mesh_a), UploadPriority::Normal)
            .unwrap();
        let rejected = uploader
            .submit(UploadRequest::new(&b, mesh_b), UploadPriority::High)
            .unwrap_err();

        assert_eq!(rejected.request.pos, b.position());
        assert_eq!(rejected.priority, UploadPriority::High);
        assert_eq!(uploader.rejected_count(), 1);
        assert_eq!(uploader.queued_len(), 1);
    }

    #[test]
    fn per_frame_limit() {
        let uploader = AsyncUploader::new(
            UploaderConfig {
                capacity: 64,
                max_uploads_per_frame: 10,
                frame_budget_us: 1_000_000,
            },
            Arc::new(ChunkMetrics::new()),
        );
        let mut device = FakeDevice::default();
        let chunks: Vec<_> = (0..15).map(meshed_chunk).collect();
        for (chunk, mesh) in &chunks {
            uploader
                .submit(UploadRequest::new(chunk, mesh.clone()), UploadPriority::Normal)
                .unwrap();
        }

        assert_eq!(uploader.process_uploads(&mut device).uploaded, 10);
        assert_eq!(uploader.queued_len(), 5);
        assert_eq!(uploader.process_uploads(&mut device).uploaded, 5);
    }

    #[test]
    fn zero_budget_uploads_nothing() {
        let uploader = AsyncUploader::new(
            UploaderConfig {
                capacity: 8,
                max_uploads_per_frame: 10,
                frame_budget_us: 0,
            },
            Arc::new(ChunkMetrics::new()),
        );
        let (chunk, mesh) = meshed_chunk(0);
        uploader
            .submit(UploadRequest::new(&chunk, mesh), UploadPriority::Immediate)
            .unwrap();
        let mut device = FakeDevice::default();
        assert_eq!(uploader.process_uploads(&mut device).uploaded, 0);
        assert_eq!(uploader.queued_len(), 1);
    }

    #[test]
    fn stale_and_unloading_are_skipped() {
        let uploader = uploader(8);
        let mut device = FakeDevice::default();

        let (stale, old_mesh) = meshed_chunk(0);
        let stale_ticket = uploader
            .submit(UploadRequest::new(&stale, old_mesh), UploadPriority::Normal)
            .unwrap();
        stale.store_mesh(Arc::new(ChunkMesh::default()));

        let (leaving, mesh) = meshed_chunk(1);
        let leaving_ticket = uploader
            .submit(UploadRequest::new(&leaving, mesh), UploadPriority::Normal)
            .unwrap();
        leaving.state().begin_unload();

        let (dropped, mesh) = meshed_chunk(2);
        let dropped_ticket = uploader
            .submit(UploadRequest::new(&dropped, mesh), UploadPriority::Normal)
            .unwrap();
        drop(dropped);

        let stats = uploader.process_uploads(&mut device);
        assert_eq!(stats.skipped, 3);
        assert!(device.uploads.is_empty());
        assert_eq!(stale_ticket.try_outcome(), Some(UploadOutcome::Skipped));
        assert_eq!(leaving_ticket.try_outcome(), Some(UploadOutcome::Skipped));
        assert_eq!(dropped_ticket.try_outcome(), Some(UploadOutcome::Skipped));
    }

    #[test]
    fn reupload_releases_old_handle_after_new() {
        let uploader = uploader(8);
        let mut device = FakeDevice::default();
        let (chunk, mesh) = meshed_chunk(0);

        let first = uploader
            .submit(UploadRequest::new(&chunk, mesh), UploadPriority::Normal)
            .unwrap();
        uploader.process_uploads(&mut device);
        let Some(UploadOutcome::Uploaded(first_handle)) = first.try_outcome() else {
            panic!("first upload did not resolve");
        };

        chunk.state().mark_mesh_dirty();
        let newer = Arc::new(ChunkMesh::default());
        chunk.store_mesh(newer.clone());
        let second = uploader
            .submit(UploadRequest::new(&chunk, newer), UploadPriority::Normal)
            .unwrap();
        uploader.process_uploads(&mut device);

        let Some(UploadOutcome::Uploaded(second_handle)) = second.try_outcome() else {
            panic!("second upload did not resolve");
        };
        assert_ne!(first_handle, second_handle);
        assert_eq!(chunk.gpu_handle(), Some(second_handle));
        assert_eq!(device.released, vec![first_handle]);
        assert_eq!(device.live(), 1);
    }

    #[test]
    fn device_failure_redirties() {
        let uploader = uploader(8);
        let mut device = FakeDevice {
            fail_uploads: true,
            ..Default::default()
        };
        let (chunk, mesh) = meshed_chunk(0);
        let ticket = uploader
            .submit(UploadRequest::new(&chunk, mesh), UploadPriority::Normal)
            .unwrap();

        assert_eq!(uploader.process_uploads(&mut device).failed, 1);
        assert_eq!(ticket.try_outcome(), Some(UploadOutcome::Failed));
        assert!(chunk.state().needs_mesh_rebuild());
        assert!(!chunk.state().is_renderable());
    }

    #[test]
    fn releases_drain_on_render_thread() {
        let uploader = uploader(8);
        let mut device = FakeDevice::default();
        uploader.release(GpuHandle(41));
        uploader.release(GpuHandle(42));
        assert_eq!(uploader.pending_releases(), 2);

        let stats = uploader.process_uploads(&mut device);
        assert_eq!(stats.released, 2);
        assert_eq!(device.released, vec![GpuHandle(41), GpuHandle(42)]);
    }

    #[test]
    fn cancel_all_resolves_tickets() {
        let uploader = uploader(8);
        let (chunk, mesh) = meshed_chunk(0);
        let ticket = uploader
            .submit(UploadRequest::new(&chunk, mesh), UploadPriority::Normal)
            .unwrap();
        assert_eq!(uploader.cancel_all(), 1);
        assert_eq!(ticket.wait_timeout(Duration::from_secs(1)), Some(UploadOutcome::Cancelled));
        assert_eq!(uploader.queued_len(), 0);
    }

    #[test]
    fn distance_priority() {
        assert_eq!(UploadPriority::from_distance(0, 8), UploadPriority::Immediate);
        assert_eq!(UploadPriority::from_distance(2, 8), UploadPriority::High);
        assert_eq!(UploadPriority::from_distance(4, 8), UploadPriority::Normal);
        assert_eq!(UploadPriority::from_distance(7, 8), UploadPriority::Low);
        assert_eq!(UploadPriority::from_distance(9, 8), UploadPriority::Background);
        assert_eq!(UploadPriority::from_distance(u32::MAX, 8), UploadPriority::Background);
        assert_eq!(UploadPriority::from_distance(u32::MAX / 2 + 1, u32::MAX - 1), UploadPriority::Low);
        assert!(UploadPriority::Immediate > UploadPriority::Background);
    }
}
