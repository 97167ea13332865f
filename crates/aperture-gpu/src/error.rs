//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
///
/// Everything here is fatal except the variants for which
/// [`GpuError::is_recoverable`] returns `true`; those signal that the caller
/// should rebuild the swapchain and retry.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Raw Vulkan error from a call with no more specific classification.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Creating a native resource (render pass, framebuffer, command buffer,
    /// semaphore, fence, layout) failed.
    #[error("Failed to create {what}: {code:?}")]
    ResourceCreation {
        /// Which resource kind failed to create.
        what: &'static str,
        /// The native error code.
        code: vk::Result,
    },

    /// Queue submission, fence wait, or fence reset failed.
    #[error("Submission failed at {call}: {code:?}")]
    Submission {
        /// Which native call failed.
        call: &'static str,
        /// The native error code.
        code: vk::Result,
    },

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation or surface support query failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// The swapchain no longer matches the surface; rebuild it and retry.
    #[error("Swapchain is out of date")]
    SwapchainOutOfDate,

    /// A texture handle refers to a texture that has been destroyed.
    #[error("Stale texture handle")]
    StaleHandle,

    /// An operation was called in a state that does not permit it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Whether the caller can recover from this error without tearing the
    /// device down. Only swapchain staleness qualifies; the recovery is to
    /// rebuild the swapchain.
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::SwapchainOutOfDate)
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_swapchain_staleness_is_recoverable() {
        assert!(GpuError::SwapchainOutOfDate.is_recoverable());
        assert!(!GpuError::NoSuitableDevice.is_recoverable());
        assert!(!GpuError::Submission {
            call: "vkQueueSubmit",
            code: vk::Result::ERROR_DEVICE_LOST,
        }
        .is_recoverable());
        assert!(!GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR).is_recoverable());
    }

    #[test]
    fn submission_error_embeds_native_code() {
        let err = GpuError::Submission {
            call: "vkWaitForFences",
            code: vk::Result::ERROR_DEVICE_LOST,
        };
        let message = err.to_string();
        assert!(message.contains("vkWaitForFences"));
        assert!(message.contains("ERROR_DEVICE_LOST"));
    }
}
