//! Error types for network construction, simulation and backends.

use thiserror::Error;

use crate::tensor::Shape;

/// Result type alias for network operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures raised by a compute backend. Fatal for the step that hit them.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("out of device memory: requested {requested} floats, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    #[error("unknown tensor handle {0}")]
    UnknownTensor(u32),

    #[error("kernel entry point `{0}` is not compiled into this backend")]
    MissingEntryPoint(&'static str),

    #[error("dispatch of `{entry}` binds tensor {tensor} for both reading and writing")]
    Aliased { entry: &'static str, tensor: u32 },

    #[error("transfer size mismatch: tensor holds {expected} floats, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("tensor shape mismatch: {expected} vs {actual}")]
    ShapeMismatch { expected: Shape, actual: Shape },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("buffer mapping failed: {0}")]
    Map(String),
}

/// Main error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("layer size lists differ in length: {e_layers} excitatory vs {i_layers} inhibitory")]
    LayerCountMismatch { e_layers: usize, i_layers: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("{what} has shape {actual}, expected {expected}")]
    ShapeMismatch {
        what: &'static str,
        expected: Shape,
        actual: Shape,
    },

    #[error("layer {layer} does not chain onto its neighbours")]
    ChainBroken { layer: usize },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn check_shape(what: &'static str, expected: Shape, actual: Shape) -> Result<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(Error::ShapeMismatch {
                what,
                expected,
                actual,
            })
        }
    }
}
