pub mod access;
pub mod block;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod coords;
pub mod error;
pub mod features;
pub mod generation;
pub mod hasher;
pub mod meshing;
pub mod metrics;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod store;
pub mod task;
pub mod upload;
pub mod world;

#[cfg(test)]
mod test_support;

pub use block_mesh;
pub use glam;
