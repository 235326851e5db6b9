//! Error types for distributed operations.

use thiserror::Error;

/// Errors that can occur while bootstrapping or running distributed operations.
#[derive(Error, Debug)]
pub enum DistributedError {
    /// Rank is out of valid range for the process group.
    #[error("invalid rank {rank}: must be < world_size {world_size}")]
    InvalidRank { rank: usize, world_size: usize },

    /// World size must be at least one.
    #[error("invalid world_size {0}: must be >= 1")]
    InvalidWorldSize(usize),

    /// A required environment variable is absent.
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    /// An environment variable is present but cannot be parsed.
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    /// Selecting the local accelerator failed.
    #[error(
        "failed to select device {ordinal} (CUDA_VISIBLE_DEVICES={}): {reason}",
        visible_devices.as_deref().unwrap_or("<unset>")
    )]
    DeviceSelection {
        ordinal: usize,
        visible_devices: Option<String>,
        reason: String,
    },

    /// Rendezvous with peers failed (bind conflict, timeout, refused handshake).
    #[error("rendezvous at {endpoint} failed: {reason}")]
    Rendezvous { endpoint: String, reason: String },

    /// A peer sent something that does not follow the wire protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport-level I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Tensor shape mismatch for collective operation.
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Gradient for a gathered tensor cannot be split evenly across ranks.
    #[error("leading extent {extent} is not divisible by world_size {world_size}")]
    UnevenGather { extent: usize, world_size: usize },

    /// Requested backend is not compiled in or cannot be loaded.
    #[error("backend {0} is not available")]
    BackendUnavailable(String),

    /// A process group was already registered for this process.
    #[error("process group already initialized (rank {rank} of {world_size})")]
    AlreadyInitialized { rank: usize, world_size: usize },

    /// NCCL operation failed.
    #[error("NCCL error: {0}")]
    NcclError(String),

    /// Tensor device mismatch.
    #[error("tensor device mismatch: expected {expected}, got {actual}")]
    DeviceMismatch { expected: String, actual: String },

    /// Tensor cannot be used by the backend (dtype, layout, storage).
    #[error("invalid tensor: {0}")]
    InvalidTensor(String),

    /// Underlying tensor operation failed.
    #[error("tensor error: {0}")]
    TensorError(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, DistributedError>;
