use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum VoxelError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("got {coords} coordinates but {values} values")]
    LengthMismatch { coords: usize, values: usize },
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch { expected: Vec<usize>, actual: Vec<usize> },
    #[error("channel {channel} out of range (storage has {channels} channels)")]
    InvalidChannel { channel: usize, channels: usize },
    #[error("cannot go from {from} to {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
    /// A live-view reference is still set while absolute placement was requested.
    #[error("reference position still set; clear it before absolute placement")]
    StaleReference,
}

pub type Result<T> = std::result::Result<T, VoxelError>;
