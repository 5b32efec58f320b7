//! Frame-pipelined swap chain rendering.
//!
//! The CPU records frame *k+1* while the GPU still executes frame *k*. A ring
//! of per-frame allocators and back buffers, one monotonic fence and a swap
//! chain lifecycle manager keep the two from stepping on each other.
//!
//! - [`engine`]: fence synchronizer, frame ring, swap chain manager, adapter
//!   provisioning and the frame orchestrator
//! - [`gpu`]: the interface the engine drives
//! - [`backend`]: Vulkan and headless implementations of that interface

pub mod backend;
pub mod cli;
pub mod config;
pub mod engine;
pub mod gpu;
pub mod sync;
pub mod timing;

pub use engine::{Engine, EngineSettings, FrameReport};
pub use gpu::{GpuError, GpuResult};
