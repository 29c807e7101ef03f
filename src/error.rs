use thiserror::Error;

/// Error taxonomy for a clustering run.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// The request was structurally invalid (bad cluster count, shape
    /// mismatch, out-of-range tolerance, ...). No device was touched.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// The device selector named no usable device.
    #[error("no such device: {0}")]
    NoSuchDevice(String),

    /// A device allocation or memory transfer failed.
    #[error("memory allocation or copy failed: {0}")]
    MemoryCopy(String),

    /// The accelerator reported a failure during kernel setup or execution.
    #[error("device runtime failure: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;
