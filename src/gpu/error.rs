//! GPU error taxonomy.
//!
//! Every variant except [`GpuError::OutOfDate`] is fatal: the engine has no
//! partial-failure path and callers are expected to stop rendering.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan API call returned a failure code
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] ash::vk::Result),

    /// Failed to load the Vulkan library
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// Adapter enumeration finished without an eligible candidate
    #[error("No eligible GPU adapter found")]
    NoSuitableAdapter,

    /// The presentation surface changed under the swap chain
    #[error("Swap chain is out of date")]
    OutOfDate,

    /// A resource was reset, released or resized while still referenced
    #[error("Resource still in use: {0}")]
    ResourceInUse(String),

    /// An API call that the runtime rejects outright
    #[error("Invalid call: {0}")]
    InvalidCall(String),

    /// The device or its timeline stopped responding
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// Surface creation or negotiation error
    #[error("Surface error: {0}")]
    Surface(String),
}

pub type GpuResult<T> = std::result::Result<T, GpuError>;
