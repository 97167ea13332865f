//! Framebuffer descriptors and the framebuffer cache.

use crate::cache::DescriptorCache;
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::Arc;

/// Structural key for a framebuffer: the render pass it targets plus the
/// ordered attachment views. View order is the attachment binding order.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct FramebufferDescriptor {
    pub render_pass: vk::RenderPass,
    pub attachments: Vec<vk::ImageView>,
    pub width: u32,
    pub height: u32,
}

/// An owned `vk::Framebuffer` created from a [`FramebufferDescriptor`].
pub struct Framebuffer {
    handle: vk::Framebuffer,
    width: u32,
    height: u32,
}

impl Framebuffer {
    pub(crate) fn new(device: &ash::Device, descriptor: &FramebufferDescriptor) -> Result<Self> {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(descriptor.render_pass)
            .attachments(&descriptor.attachments)
            .width(descriptor.width)
            .height(descriptor.height)
            .layers(1);

        let handle = unsafe { device.create_framebuffer(&create_info, None) }.map_err(|code| {
            GpuError::ResourceCreation {
                what: "framebuffer",
                code,
            }
        })?;

        Ok(Self {
            handle,
            width: descriptor.width,
            height: descriptor.height,
        })
    }

    /// Get the raw framebuffer handle.
    pub fn handle(&self) -> vk::Framebuffer {
        self.handle
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }
}

/// Cache of framebuffers keyed by structural descriptor.
///
/// Single-threaded use only; the owning context serializes access.
pub struct FramebufferCache {
    device: Arc<ash::Device>,
    cache: DescriptorCache<FramebufferDescriptor, Framebuffer>,
}

impl FramebufferCache {
    pub(crate) fn new(device: Arc<ash::Device>) -> Self {
        Self {
            device,
            cache: DescriptorCache::new(),
        }
    }

    /// Resolve a descriptor to its framebuffer, creating it on first use.
    pub fn get(&mut self, descriptor: &FramebufferDescriptor) -> Result<vk::Framebuffer> {
        let device = &self.device;
        let framebuffer = self
            .cache
            .get_or_create(descriptor, || Framebuffer::new(device, descriptor))?;
        Ok(framebuffer.handle())
    }

    /// Number of distinct framebuffers created so far.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache holds no framebuffers.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Destroy every cached framebuffer. Must run before device teardown.
    pub fn clear(&mut self) {
        let device = self.device.clone();
        self.cache.clear_with(|framebuffer| unsafe {
            device.destroy_framebuffer(framebuffer.handle, None);
        });
    }
}
