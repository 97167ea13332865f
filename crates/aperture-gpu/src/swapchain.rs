//! Swapchain management and presentation.
//!
//! The swapchain owns exactly two binary semaphores for its lifetime: one
//! signaled by image acquisition and waited on by the final render
//! submission, one signaled by that submission and waited on by present.
//! Acquisition and presentation form a strict alternation; presenting
//! without a prior acquire is rejected.

use crate::error::{GpuError, Result};
use crate::queue::PresentHooks;
use crate::texture::{TextureKey, TextureRegistry};
use ash::vk;
use std::sync::Arc;
use tracing::debug;

/// One presentable image with its registry key and render target view.
pub struct SwapchainImage {
    pub texture: TextureKey,
    pub view: vk::ImageView,
}

/// Swapchain wrapper with acquire/present state.
pub struct Swapchain {
    device: Arc<ash::Device>,
    loader: ash::khr::swapchain::Device,
    handle: vk::SwapchainKHR,
    images: Vec<SwapchainImage>,
    format: vk::Format,
    extent: vk::Extent2D,
    image_available: vk::Semaphore,
    render_done: vk::Semaphore,
    acquired: Option<u32>,
}

impl Swapchain {
    /// Create a swapchain and register its images as foreign textures.
    ///
    /// # Safety
    /// The surface and capability data must describe a live surface that is
    /// compatible with the device.
    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe fn new(
        device: Arc<ash::Device>,
        loader: ash::khr::swapchain::Device,
        registry: &mut TextureRegistry,
        surface: vk::SurfaceKHR,
        capabilities: &vk::SurfaceCapabilitiesKHR,
        surface_format: vk::SurfaceFormatKHR,
        present_mode: vk::PresentModeKHR,
        extent: vk::Extent2D,
        old_swapchain: Option<vk::SwapchainKHR>,
        graphics_queue_family: u32,
    ) -> Result<Self> {
        let mut image_count = capabilities.min_image_count + 1;
        if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
            image_count = capabilities.max_image_count;
        }

        let queue_families = [graphics_queue_family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain.unwrap_or(vk::SwapchainKHR::null()));

        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        let raw_images = unsafe { loader.get_swapchain_images(handle) }?;

        let mut images = Vec::with_capacity(raw_images.len());
        for &image in &raw_images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(surface_format.format)
                .components(vk::ComponentMapping::default())
                .subresource_range(
                    vk::ImageSubresourceRange::default()
                        .aspect_mask(vk::ImageAspectFlags::COLOR)
                        .base_mip_level(0)
                        .level_count(1)
                        .base_array_layer(0)
                        .layer_count(1),
                );

            let view = unsafe { device.create_image_view(&view_info, None) }?;
            let texture = registry.insert_foreign(
                image,
                surface_format.format,
                extent,
                vk::ImageLayout::PRESENT_SRC_KHR,
            );
            images.push(SwapchainImage { texture, view });
        }

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let image_available = unsafe { device.create_semaphore(&semaphore_info, None) }?;
        let render_done = unsafe { device.create_semaphore(&semaphore_info, None) }?;

        debug!(
            images = images.len(),
            format = ?surface_format.format,
            width = extent.width,
            height = extent.height,
            "created swapchain"
        );

        Ok(Self {
            device,
            loader,
            handle,
            images,
            format: surface_format.format,
            extent,
            image_available,
            render_done,
            acquired: None,
        })
    }

    /// Acquire the next presentable image.
    ///
    /// An out-of-date surface yields [`GpuError::SwapchainOutOfDate`]; the
    /// caller recreates the swapchain and retries.
    pub fn acquire_next_texture(&mut self) -> Result<&SwapchainImage> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.handle,
                u64::MAX,
                self.image_available,
                vk::Fence::null(),
            )
        };

        let index = match result {
            Ok((index, _suboptimal)) => index,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Err(GpuError::SwapchainOutOfDate),
            Err(code) => return Err(GpuError::from(code)),
        };

        self.acquired = Some(index);
        Ok(&self.images[index as usize])
    }

    /// The image acquired by the last [`Swapchain::acquire_next_texture`]
    /// that has not been presented yet.
    pub fn current_image(&self) -> Option<&SwapchainImage> {
        self.acquired.map(|index| &self.images[index as usize])
    }

    /// Semaphores coupling a render batch to this swapchain. Fails when no
    /// image is acquired.
    pub(crate) fn present_hooks(&self) -> Result<PresentHooks> {
        if self.acquired.is_none() {
            return Err(GpuError::InvalidState(
                "No swapchain image acquired".to_string(),
            ));
        }
        Ok(PresentHooks {
            acquire_semaphore: self.image_available,
            acquire_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            render_done: self.render_done,
        })
    }

    /// Present the acquired image, consuming the acquire state.
    pub(crate) fn present(&mut self, queue: vk::Queue) -> Result<()> {
        let index = self.acquired.take().ok_or_else(|| {
            GpuError::InvalidState("Present without an acquired image".to_string())
        })?;

        let wait_semaphores = [self.render_done];
        let swapchains = [self.handle];
        let image_indices = [index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.loader.queue_present(queue, &present_info) };
        match result {
            Ok(_suboptimal) => Ok(()),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(GpuError::SwapchainOutOfDate),
            Err(code) => Err(GpuError::from(code)),
        }
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub(crate) fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    /// Destroy the swapchain, its views, its semaphores, and unregister its
    /// textures.
    ///
    /// # Safety
    /// No in-flight work may reference the swapchain.
    pub(crate) unsafe fn destroy(&mut self, registry: &mut TextureRegistry) {
        for image in self.images.drain(..) {
            registry.remove(image.texture);
            unsafe {
                self.device.destroy_image_view(image.view, None);
            }
        }
        unsafe {
            self.device.destroy_semaphore(self.image_available, None);
            self.device.destroy_semaphore(self.render_done, None);
            self.loader.destroy_swapchain(self.handle, None);
        }
        self.handle = vk::SwapchainKHR::null();
        self.acquired = None;
    }
}

/// Select the best surface format, preferring SRGB.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    for format in available {
        if format.format == vk::Format::B8G8R8A8_SRGB
            && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        {
            return *format;
        }
    }

    available[0]
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        vk::PresentModeKHR::FIFO
    } else {
        for &mode in available {
            if mode == vk::PresentModeKHR::MAILBOX {
                return mode;
            }
        }
        for &mode in available {
            if mode == vk::PresentModeKHR::IMMEDIATE {
                return mode;
            }
        }
        // FIFO is always supported
        vk::PresentModeKHR::FIFO
    }
}

/// Calculate the swapchain extent from surface capabilities.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surface_format_prefers_srgb() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(
            select_surface_format(&formats).format,
            vk::Format::B8G8R8A8_SRGB
        );
    }

    #[test]
    fn surface_format_falls_back_to_first() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(
            select_surface_format(&formats).format,
            vk::Format::R8G8B8A8_UNORM
        );
    }

    #[test]
    fn present_mode_honors_vsync() {
        let available = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(
            select_present_mode(&available, true),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            select_present_mode(&available, false),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(select_present_mode(&[], false), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn extent_clamps_when_surface_leaves_it_free() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 100,
                height: 100,
            },
            max_image_extent: vk::Extent2D {
                width: 2000,
                height: 2000,
            },
            ..Default::default()
        };

        let extent = calculate_extent(&capabilities, 5000, 50);
        assert_eq!(extent.width, 2000);
        assert_eq!(extent.height, 100);
    }

    #[test]
    fn extent_follows_a_fixed_surface() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..Default::default()
        };

        let extent = calculate_extent(&capabilities, 1920, 1080);
        assert_eq!(extent.width, 1280);
        assert_eq!(extent.height, 720);
    }
}
