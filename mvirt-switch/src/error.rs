//! Error types for switch topology and control operations.

use thiserror::Error;

/// Errors returned synchronously by topology and control operations.
///
/// Data-path conditions (full rings, stopped destinations, malformed frames)
/// are never reported through this type; they are counted and dropped.
#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("Port already attached: {0}")]
    AlreadyAttached(String),

    #[error("Bridge {0} has no free port slots")]
    TooManyPorts(String),

    #[error("No free bridge slots (capacity {0})")]
    OutOfBridges(usize),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Invalid virtio-net header length {0} (expected 0, 10 or 12)")]
    InvalidHeaderLen(usize),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Hardware adapter {name}: {reason}")]
    Hardware { name: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchError {
    pub(crate) fn hardware(name: &str, err: impl std::fmt::Display) -> Self {
        SwitchError::Hardware {
            name: name.to_string(),
            reason: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SwitchError>;
