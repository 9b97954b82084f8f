//! Error types for the frame orchestrator.
//!
//! This module provides a unified error type [`RenderError`] and a convenient [`Result`] alias.
//! Every variant maps onto an [`ErrorSeverity`] so callers can tell setup mistakes from
//! scheduling misuse and from device conditions that belong to the presentation layer.

use ash::vk;
use std::fmt;

/// Coarse classification of a [`RenderError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorSeverity {
    /// Setup mistake (pool exhaustion, unsupported format, missing feature). Never retried.
    Configuration,
    /// Violated scheduling invariant (busy worker, out-of-order frame phase).
    Contention,
    /// Device or presentation condition, surfaced to the caller untouched.
    Device,
}

/// Main error type for the orchestrator.
#[derive(Debug)]
pub enum RenderError {
    /// A Vulkan API call failed.
    VulkanError(String),
    /// Device initialization failed.
    DeviceInitFailed(String),
    /// The device was lost or the presentation target is out of date.
    DeviceLost(String),
    /// A fixed-size descriptor pool ran out of space.
    DescriptorPoolExhausted(String),
    /// The device cannot use this image format for the requested usage.
    UnsupportedFormat(vk::Format),
    /// A required device feature is not available.
    MissingFeature(&'static str),
    /// No compiled shader module was registered for a pass/stage.
    MissingShader(String),
    /// Invalid pipeline or configuration description.
    InvalidConfig(String),
    /// A job was submitted to a worker that is still recording.
    WorkerBusy(String),
    /// A worker was joined without having been given a job.
    WorkerIdle(String),
    /// The worker thread died before reporting completion.
    WorkerLost(String),
    /// A frame operation was called out of order.
    FrameOutOfOrder(String),
    /// Resource not found (unknown camera/light/mesh, stale handle).
    ResourceNotFound(String),
}

impl RenderError {
    /// Classifies this error according to the propagation policy.
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::DescriptorPoolExhausted(_)
            | Self::UnsupportedFormat(_)
            | Self::MissingFeature(_)
            | Self::MissingShader(_)
            | Self::InvalidConfig(_)
            | Self::DeviceInitFailed(_)
            | Self::ResourceNotFound(_) => ErrorSeverity::Configuration,
            Self::WorkerBusy(_)
            | Self::WorkerIdle(_)
            | Self::WorkerLost(_)
            | Self::FrameOutOfOrder(_) => ErrorSeverity::Contention,
            Self::VulkanError(_) | Self::DeviceLost(_) => ErrorSeverity::Device,
        }
    }

    /// Fatal errors must not be retried; continuing would corrupt GPU state.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.severity(), ErrorSeverity::Device)
    }
}

impl fmt::Display for RenderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::VulkanError(msg) => write!(f, "Vulkan error: {msg}"),
            Self::DeviceInitFailed(msg) => write!(f, "Device init failed: {msg}"),
            Self::DeviceLost(msg) => write!(f, "Device lost: {msg}"),
            Self::DescriptorPoolExhausted(msg) => write!(f, "Descriptor pool exhausted: {msg}"),
            Self::UnsupportedFormat(format) => write!(f, "Unsupported image format: {format:?}"),
            Self::MissingFeature(feature) => write!(f, "Missing device feature: {feature}"),
            Self::MissingShader(msg) => write!(f, "Missing shader: {msg}"),
            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {msg}"),
            Self::WorkerBusy(msg) => write!(f, "Recording worker busy: {msg}"),
            Self::WorkerIdle(msg) => write!(f, "Recording worker idle: {msg}"),
            Self::WorkerLost(msg) => write!(f, "Recording worker lost: {msg}"),
            Self::FrameOutOfOrder(msg) => write!(f, "Frame operation out of order: {msg}"),
            Self::ResourceNotFound(msg) => write!(f, "Resource not found: {msg}"),
        }
    }
}

impl std::error::Error for RenderError {}

/// Convenient Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, RenderError>;

impl From<vk::Result> for RenderError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST | vk::Result::ERROR_OUT_OF_DATE_KHR => {
                Self::DeviceLost(format!("{result:?}"))
            }
            _ => Self::VulkanError(format!("{result:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderError::WorkerBusy("camera 0".to_string());
        assert!(err.to_string().contains("busy"));
    }

    #[test]
    fn test_severity_classification() {
        assert_eq!(
            RenderError::DescriptorPoolExhausted("x".into()).severity(),
            ErrorSeverity::Configuration
        );
        assert_eq!(
            RenderError::FrameOutOfOrder("x".into()).severity(),
            ErrorSeverity::Contention
        );
        assert!(!RenderError::DeviceLost("x".into()).is_fatal());
        assert!(RenderError::MissingFeature("fill_mode_non_solid").is_fatal());
    }

    #[test]
    fn test_vk_result_conversion() {
        let err: RenderError = vk::Result::ERROR_DEVICE_LOST.into();
        assert!(matches!(err, RenderError::DeviceLost(_)));
        let err: RenderError = vk::Result::ERROR_OUT_OF_HOST_MEMORY.into();
        assert!(matches!(err, RenderError::VulkanError(_)));
    }
}
