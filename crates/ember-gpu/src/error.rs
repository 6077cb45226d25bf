//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// The device stopped responding (a blocking wait timed out or the
    /// driver reported the device as lost).
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Whether this error leaves the device unusable.
    pub fn is_device_lost(&self) -> bool {
        matches!(
            self,
            Self::DeviceLost(_) | Self::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        )
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
