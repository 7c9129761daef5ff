use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Worker threads for generation, load, save and mesh builds. 0 picks the core count.
    pub worker_threads: usize,
    pub feature_batch_initial: usize,
    pub feature_batch_min: usize,
    pub feature_batch_max: usize,
    /// Frames slower than this shrink the next decoration batch.
    pub feature_frame_budget_ms: u64,
    /// Background save of data-dirty chunks. 0 disables it.
    pub autosave_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            feature_batch_initial: 40,
            feature_batch_min: 10,
            feature_batch_max: 80,
            feature_frame_budget_ms: 16,
            autosave_interval_ms: 30_000,
        }
    }
}

impl StoreConfig {
    pub fn feature_frame_budget(&self) -> Duration {
        Duration::from_millis(self.feature_frame_budget_ms)
    }

    pub fn autosave_interval(&self) -> Option<Duration> {
        (self.autosave_interval_ms > 0).then(|| Duration::from_millis(self.autosave_interval_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MeshSchedulerConfig {
    /// Chunks kept loaded around the player, in chunks (Chebyshev).
    pub render_distance: u32,
    /// Chunks meshed around the player. Usually one less than the render distance
    /// so outer chunks have both seams available.
    pub border_distance: u32,
    pub max_dispatch_per_tick: usize,
    pub max_in_flight: usize,
    pub dispatch_budget_us: u64,
    pub scratch_buffers: usize,
}

impl Default for MeshSchedulerConfig {
    fn default() -> Self {
        Self {
            render_distance: 8,
            border_distance: 7,
            max_dispatch_per_tick: 8,
            max_in_flight: 16,
            dispatch_budget_us: 1_000,
            scratch_buffers: 16,
        }
    }
}

impl MeshSchedulerConfig {
    pub fn dispatch_budget(&self) -> Duration {
        Duration::from_micros(self.dispatch_budget_us)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    pub capacity: usize,
    pub max_uploads_per_frame: usize,
    pub frame_budget_us: u64,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_uploads_per_frame: 10,
            frame_budget_us: 2_000,
        }
    }
}

impl UploaderConfig {
    pub fn frame_budget(&self) -> Duration {
        Duration::from_micros(self.frame_budget_us)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Loaded chunks further than `render_distance + unload_margin` are unloaded.
    pub unload_margin: u32,
    pub store: StoreConfig,
    pub mesh: MeshSchedulerConfig,
    pub upload: UploaderConfig,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            unload_margin: 1,
            store: StoreConfig::default(),
            mesh: MeshSchedulerConfig::default(),
            upload: UploaderConfig::default(),
        }
    }
}
