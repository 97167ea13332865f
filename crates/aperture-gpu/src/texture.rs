//! Textures, the texture registry, and image layout transitions.
//!
//! Textures are addressed through generational [`TextureKey`]s rather than
//! references, so a key held after its texture was removed resolves to
//! `None` instead of dangling. Foreign images (swapchain-owned) share the
//! same bookkeeping but are never destroyed here.

use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::Allocation;
use slotmap::SlotMap;
use std::sync::Arc;

slotmap::new_key_type! {
    /// Generational handle to a texture in a [`TextureRegistry`].
    pub struct TextureKey;
}

/// Parameters for creating a texture.
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub sample_count: u32,
    pub usage: vk::ImageUsageFlags,
    /// Layout the image is expected to be in once fully initialized.
    pub final_layout: vk::ImageLayout,
}

/// A GPU image with its allocation and creation-time metadata.
pub struct Texture {
    pub image: vk::Image,
    pub(crate) allocation: Option<Allocation>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub mip_levels: u32,
    pub aspect: vk::ImageAspectFlags,
    pub final_layout: vk::ImageLayout,
    /// Owned elsewhere (swapchain); the registry never destroys it.
    pub(crate) foreign: bool,
}

/// Owns every live texture and hands out generational keys.
#[derive(Default)]
pub struct TextureRegistry {
    textures: SlotMap<TextureKey, Texture>,
}

impl TextureRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a texture created by the allocator.
    pub fn insert(&mut self, texture: Texture) -> TextureKey {
        self.textures.insert(texture)
    }

    /// Register an image owned by something else, typically a swapchain.
    pub fn insert_foreign(
        &mut self,
        image: vk::Image,
        format: vk::Format,
        extent: vk::Extent2D,
        final_layout: vk::ImageLayout,
    ) -> TextureKey {
        self.textures.insert(Texture {
            image,
            allocation: None,
            format,
            extent,
            mip_levels: 1,
            aspect: aspect_for_format(format),
            final_layout,
            foreign: true,
        })
    }

    /// Resolve a key. Stale keys yield `None`.
    pub fn get(&self, key: TextureKey) -> Option<&Texture> {
        self.textures.get(key)
    }

    /// Resolve a key mutably. Stale keys yield `None`.
    pub fn get_mut(&mut self, key: TextureKey) -> Option<&mut Texture> {
        self.textures.get_mut(key)
    }

    /// Remove a texture, returning it for resource teardown.
    pub fn remove(&mut self, key: TextureKey) -> Option<Texture> {
        self.textures.remove(key)
    }

    /// Number of live textures.
    pub fn len(&self) -> usize {
        self.textures.len()
    }

    /// Whether no textures are registered.
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    /// Drain every texture, returning those that own their image and
    /// allocation so the caller can free them.
    pub fn drain_owned(&mut self) -> Vec<Texture> {
        let keys: Vec<TextureKey> = self.textures.keys().collect();
        let mut owned = Vec::new();
        for key in keys {
            if let Some(texture) = self.textures.remove(key) {
                if !texture.foreign {
                    owned.push(texture);
                }
            }
        }
        owned
    }
}

/// A view over a registered texture.
pub struct TextureView {
    pub texture: TextureKey,
    pub view: vk::ImageView,
    pub aspect: vk::ImageAspectFlags,
}

impl TextureView {
    /// Create a 2D view covering all mip levels of `texture`.
    pub fn new(
        device: &Arc<ash::Device>,
        registry: &TextureRegistry,
        texture: TextureKey,
    ) -> Result<Self> {
        let info = registry.get(texture).ok_or(GpuError::StaleHandle)?;

        let create_info = vk::ImageViewCreateInfo::default()
            .image(info.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(info.format)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(info.aspect)
                    .base_mip_level(0)
                    .level_count(info.mip_levels)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        let view = unsafe { device.create_image_view(&create_info, None) }.map_err(|code| {
            GpuError::ResourceCreation {
                what: "image view",
                code,
            }
        })?;

        Ok(Self {
            texture,
            view,
            aspect: info.aspect,
        })
    }

    /// Destroy the underlying image view.
    ///
    /// # Safety
    /// The view must not be in use by any in-flight work.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        unsafe {
            device.destroy_image_view(self.view, None);
        }
        self.view = vk::ImageView::null();
    }
}

/// Aspect flags implied by a format. Depth formats with a stencil component
/// cover both aspects.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Access mask implied by an image layout on either side of a barrier.
pub fn layout_access_flags(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags::NONE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::GENERAL => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        _ => vk::AccessFlags::NONE,
    }
}

/// Pipeline stage implied by an image layout on either side of a barrier.
pub fn layout_stage_flags(layout: vk::ImageLayout) -> vk::PipelineStageFlags {
    match layout {
        vk::ImageLayout::UNDEFINED => vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL | vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            vk::PipelineStageFlags::TRANSFER
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::PipelineStageFlags::FRAGMENT_SHADER,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
        }
        vk::ImageLayout::GENERAL => vk::PipelineStageFlags::COMPUTE_SHADER,
        vk::ImageLayout::PRESENT_SRC_KHR => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        _ => vk::PipelineStageFlags::ALL_COMMANDS,
    }
}

/// Record an image layout transition over a mip range.
///
/// Access masks and stages are derived from the layouts on both sides.
///
/// # Safety
/// `cmd` must be in the recording state and `image` must be valid.
pub unsafe fn record_layout_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    base_mip: u32,
    level_count: u32,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(layout_access_flags(old_layout))
        .dst_access_mask(layout_access_flags(new_layout))
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .base_mip_level(base_mip)
                .level_count(level_count)
                .base_array_layer(0)
                .layer_count(1),
        );

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            layout_stage_flags(old_layout),
            layout_stage_flags(new_layout),
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn fake_texture(raw: u64) -> Texture {
        Texture {
            image: vk::Image::from_raw(raw),
            allocation: None,
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            mip_levels: 1,
            aspect: vk::ImageAspectFlags::COLOR,
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            foreign: false,
        }
    }

    #[test]
    fn removed_key_goes_stale() {
        let mut registry = TextureRegistry::new();
        let key = registry.insert(fake_texture(1));
        assert!(registry.get(key).is_some());

        registry.remove(key);
        assert!(registry.get(key).is_none());

        // A new insertion must not resurrect the old key.
        let fresh = registry.insert(fake_texture(2));
        assert!(registry.get(key).is_none());
        assert!(registry.get(fresh).is_some());
    }

    #[test]
    fn foreign_textures_are_excluded_from_drain() {
        let mut registry = TextureRegistry::new();
        registry.insert(fake_texture(1));
        registry.insert_foreign(
            vk::Image::from_raw(2),
            vk::Format::B8G8R8A8_SRGB,
            vk::Extent2D {
                width: 800,
                height: 600,
            },
            vk::ImageLayout::PRESENT_SRC_KHR,
        );

        let owned = registry.drain_owned();
        assert_eq!(owned.len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn depth_formats_carry_depth_aspect() {
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_for_format(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn layout_mappings_cover_transfer_and_sampling() {
        assert_eq!(
            layout_access_flags(vk::ImageLayout::UNDEFINED),
            vk::AccessFlags::NONE
        );
        assert_eq!(
            layout_access_flags(vk::ImageLayout::TRANSFER_SRC_OPTIMAL),
            vk::AccessFlags::TRANSFER_READ
        );
        assert_eq!(
            layout_access_flags(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::AccessFlags::TRANSFER_WRITE
        );
        assert_eq!(
            layout_access_flags(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            vk::AccessFlags::SHADER_READ
        );

        assert_eq!(
            layout_stage_flags(vk::ImageLayout::UNDEFINED),
            vk::PipelineStageFlags::TOP_OF_PIPE
        );
        assert_eq!(
            layout_stage_flags(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::PipelineStageFlags::TRANSFER
        );
        assert_eq!(
            layout_stage_flags(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            vk::PipelineStageFlags::FRAGMENT_SHADER
        );
    }
}
