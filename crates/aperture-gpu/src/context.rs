//! GPU context management.
//!
//! The context owns the Vulkan instance, device, queue, command pool, the
//! resource allocator, the descriptor caches, and the texture registry.
//! Everything else in the crate borrows from it.

use crate::binding::{BindGroupLayoutCache, BindGroupLayoutDescriptor};
use crate::command::{CommandBufferUsage, CommandRecorder};
use crate::error::{GpuError, Result};
use crate::framebuffer::{FramebufferCache, FramebufferDescriptor};
use crate::instance::{create_instance, select_physical_device, InstanceConfig};
use crate::memory::ResourceAllocator;
use crate::queue::SubmissionQueue;
use crate::render_pass::{sample_count_flags, RenderPassCache, RenderPassDescriptor};
use crate::texture::{aspect_for_format, Texture, TextureDescriptor, TextureKey, TextureRegistry};
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;
use tracing::info;

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    graphics_queue_family: u32,
    graphics_queue: vk::Queue,
    command_pool: vk::CommandPool,

    allocator: Mutex<ResourceAllocator>,
    render_passes: Mutex<RenderPassCache>,
    framebuffers: Mutex<FramebufferCache>,
    bind_group_layouts: Mutex<BindGroupLayoutCache>,
    textures: Mutex<TextureRegistry>,
}

impl GpuContext {
    /// Get the Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub(crate) fn device_arc(&self) -> Arc<ash::Device> {
        self.device.clone()
    }

    /// Get the graphics queue.
    pub fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the graphics queue family index.
    pub fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Get access to the resource allocator.
    pub fn allocator(&self) -> &Mutex<ResourceAllocator> {
        &self.allocator
    }

    /// Get access to the render pass cache.
    pub fn render_passes(&self) -> &Mutex<RenderPassCache> {
        &self.render_passes
    }

    /// Get access to the framebuffer cache.
    pub fn framebuffers(&self) -> &Mutex<FramebufferCache> {
        &self.framebuffers
    }

    /// Get access to the bind group layout cache.
    pub fn bind_group_layouts(&self) -> &Mutex<BindGroupLayoutCache> {
        &self.bind_group_layouts
    }

    /// Get access to the texture registry.
    pub fn textures(&self) -> &Mutex<TextureRegistry> {
        &self.textures
    }

    /// Resolve a render pass descriptor through the cache.
    pub fn render_pass(&self, descriptor: &RenderPassDescriptor) -> Result<vk::RenderPass> {
        self.render_passes.lock().get(descriptor)
    }

    /// Resolve a framebuffer descriptor through the cache.
    pub fn framebuffer(&self, descriptor: &FramebufferDescriptor) -> Result<vk::Framebuffer> {
        self.framebuffers.lock().get(descriptor)
    }

    /// Resolve a bind group layout descriptor through the cache.
    pub fn bind_group_layout(
        &self,
        descriptor: &BindGroupLayoutDescriptor,
    ) -> Result<vk::DescriptorSetLayout> {
        self.bind_group_layouts.lock().get(descriptor)
    }

    /// Create a command recorder drawing from the shared command pool.
    pub fn create_command_recorder(&self, usage: CommandBufferUsage) -> Result<CommandRecorder> {
        CommandRecorder::new(self.device.clone(), self.command_pool, usage)
    }

    /// Create a submission queue for the graphics queue.
    pub fn create_submission_queue(&self) -> Result<SubmissionQueue> {
        SubmissionQueue::new(self.device.clone(), self.graphics_queue)
    }

    /// Create a texture and register it.
    pub fn create_texture(&self, descriptor: &TextureDescriptor, name: &str) -> Result<TextureKey> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(descriptor.format)
            .extent(vk::Extent3D {
                width: descriptor.extent.width,
                height: descriptor.extent.height,
                depth: 1,
            })
            .mip_levels(descriptor.mip_levels)
            .array_layers(1)
            .samples(sample_count_flags(descriptor.sample_count))
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(descriptor.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let (image, allocation) = self.allocator.lock().create_image(&create_info, name)?;

        let texture = Texture {
            image,
            allocation: Some(allocation),
            format: descriptor.format,
            extent: descriptor.extent,
            mip_levels: descriptor.mip_levels,
            aspect: aspect_for_format(descriptor.format),
            final_layout: descriptor.final_layout,
            foreign: false,
        };

        Ok(self.textures.lock().insert(texture))
    }

    /// Destroy a texture. Stale keys are reported, not ignored.
    pub fn destroy_texture(&self, key: TextureKey) -> Result<()> {
        let texture = self
            .textures
            .lock()
            .remove(key)
            .ok_or(GpuError::StaleHandle)?;

        if let Some(allocation) = texture.allocation {
            self.allocator.lock().free_image(texture.image, allocation)?;
        }
        Ok(())
    }

    /// Wait for the device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Cached handles and remaining textures hold device memory and
            // device objects; tear them down before the allocator and device.
            self.framebuffers.lock().clear();
            self.render_passes.lock().clear();
            self.bind_group_layouts.lock().clear();

            let leftover = self.textures.lock().drain_owned();
            {
                let mut allocator = self.allocator.lock();
                for texture in leftover {
                    if let Some(allocation) = texture.allocation {
                        let _ = allocator.free_image(texture.image, allocation);
                    }
                }
                allocator.shutdown();
            }

            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    config: InstanceConfig,
    required_queue_flags: vk::QueueFlags,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            config: InstanceConfig::default(),
            required_queue_flags: vk::QueueFlags::GRAPHICS
                | vk::QueueFlags::COMPUTE
                | vk::QueueFlags::TRANSFER,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.config.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.config.enable_validation = enable;
        self
    }

    /// Add an instance extension beyond the platform surface set.
    pub fn instance_extension(mut self, extension: &'static CStr) -> Self {
        self.config.extra_extensions.push(extension);
        self
    }

    /// Add an instance layer beyond the validation layer.
    pub fn instance_layer(mut self, layer: &'static CStr) -> Self {
        self.config.extra_layers.push(layer);
        self
    }

    /// Capabilities the selected queue family must expose.
    pub fn queue_flags(mut self, flags: vk::QueueFlags) -> Self {
        self.required_queue_flags = flags;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.config) }?;

        let (physical_device, graphics_queue_family) =
            unsafe { select_physical_device(&instance, self.required_queue_flags) }?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let device_name = properties
            .device_name_as_c_str()
            .ok()
            .and_then(|name| name.to_str().ok())
            .unwrap_or("unknown");
        info!(device = device_name, queue_family = graphics_queue_family, "selected GPU");

        let device =
            unsafe { create_device(&instance, physical_device, graphics_queue_family) }?;
        let device = Arc::new(device);

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(graphics_queue_family);
        let command_pool =
            unsafe { device.create_command_pool(&pool_info, None) }.map_err(|code| {
                GpuError::ResourceCreation {
                    what: "command pool",
                    code,
                }
            })?;

        let allocator =
            unsafe { ResourceAllocator::new(&instance, device.clone(), physical_device) }?;

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            graphics_queue_family,
            graphics_queue,
            command_pool,
            allocator: Mutex::new(allocator),
            render_passes: Mutex::new(RenderPassCache::new(device.clone())),
            framebuffers: Mutex::new(FramebufferCache::new(device.clone())),
            bind_group_layouts: Mutex::new(BindGroupLayoutCache::new(device.clone())),
            textures: Mutex::new(TextureRegistry::new()),
            device,
        })
    }
}

/// Required device extensions.
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::khr::swapchain::NAME]
}

/// Create the logical device with one queue from `queue_family`.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extensions = required_device_extensions();
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .maintenance4(true);

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .descriptor_indexing(true)
        .scalar_block_layout(true);

    let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
        .map_err(GpuError::from)?;

    Ok(device)
}
