//! Error types shared by kernel generation and the compute backends.

use thiserror::Error;

/// Problems detected before anything reaches a backend. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("template placeholder `{{{{{name}}}}}` has no value")]
    UnresolvedPlaceholder { name: String },

    #[error("malformed template placeholder at byte {offset}")]
    MalformedPlaceholder { offset: usize },

    #[error("dimension {name} must be positive, got {value}")]
    InvalidDimension { name: &'static str, value: usize },

    #[error("{what} has {elements} elements, which overflows 32-bit kernel indexing")]
    IndexOverflow { what: &'static str, elements: usize },

    #[error("invalid tiling: {0}")]
    InvalidTiling(String),

    #[error("workgroup shape {actual} does not match tiling (expected {expected})")]
    WorkgroupMismatch { expected: String, actual: String },

    #[error("{what} = {value} exceeds device limit {limit}")]
    ExceedsDeviceLimit {
        what: &'static str,
        value: u64,
        limit: u64,
    },

    #[error("precision {0} is not supported by this device")]
    UnsupportedPrecision(String),

    #[error("input {name} has shape {actual:?}, expected {expected:?}")]
    InputShape {
        name: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },
}

/// Opaque failures surfaced by a compute backend. The run aborts on these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("no suitable compute adapter found")]
    NoAdapter,

    #[error("failed to request device: {0}")]
    DeviceRequest(String),

    #[error("kernel compilation failed: {0}")]
    Compilation(String),

    #[error("buffer allocation failed: {0}")]
    Allocation(String),

    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error("command recorder for kernel `{0}` was not reset after the previous dispatch")]
    RecorderNotReset(String),

    #[error("waiting on dispatch {id} failed: {detail}")]
    Wait { id: u64, detail: String },

    #[error("device to host copy failed: {0}")]
    Readback(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ForgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, ForgeError>;
