//! Vulkan abstraction layer with cached descriptor-driven resources.
//!
//! This crate provides:
//! - Vulkan instance and device management
//! - Content-addressed render pass, framebuffer, and bind group layout caches
//! - Texture registry with generational keys
//! - Memory allocation via gpu-allocator
//! - Command recording with implicit submission ordering
//! - Swapchain handling and presentation

pub mod binding;
pub mod cache;
pub mod command;
pub mod context;
pub mod encoder;
pub mod error;
pub mod framebuffer;
pub mod instance;
pub mod memory;
pub mod queue;
pub mod render_pass;
pub mod surface;
pub mod swapchain;
pub mod texture;

pub use binding::{
    BindGroupLayoutCache, BindGroupLayoutDescriptor, BindGroupLayoutEntry, BindGroupLayoutRegistry,
};
pub use command::{CommandBufferUsage, CommandRecorder};
pub use context::{GpuContext, GpuContextBuilder};
pub use encoder::{CommandEncoder, ComputePassEncoder, MipBlit, RenderPassEncoder};
pub use error::{GpuError, Result};
pub use framebuffer::{FramebufferCache, FramebufferDescriptor};
pub use memory::{Buffer, MemoryLocation, ResourceAllocator};
pub use queue::SubmissionQueue;
pub use render_pass::{
    ColorAttachment, DepthStencilAttachment, LoadOp, RenderPassCache, RenderPassDescriptor, StoreOp,
};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{Swapchain, SwapchainImage};
pub use texture::{Texture, TextureDescriptor, TextureKey, TextureRegistry, TextureView};
