#![warn(clippy::all, rust_2018_idioms)]

pub mod config;
pub mod error;
mod locks;
pub mod model;
pub mod session;
pub mod storage;
pub mod volume;

pub use config::{AxisTriple, StorageConfig};
pub use error::{Result, VoxelError};
pub use model::{CombineMode, MemoryUsage, StagePosition, UpdateReport};
pub use session::{AcquisitionSession, PlacementState};
pub use storage::VoxelStorage;
