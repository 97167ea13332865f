//! Command encoding on top of a [`CommandRecorder`].
//!
//! The encoder owns the recording session: creating one begins the command
//! buffer, `finish` ends it. Pass encoders scope render and compute work and
//! stamp the recorder's signal stage when they end, so a downstream waiter
//! blocks no earlier than the pass output stage.

use crate::command::CommandRecorder;
use crate::error::{GpuError, Result};
use crate::memory::Buffer;
use crate::texture::{record_layout_barrier, TextureKey, TextureRegistry};
use ash::vk;
use std::sync::Arc;

/// One blit step of a mip chain: the source extent at level `dst_level - 1`
/// and the destination extent at `dst_level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipBlit {
    pub dst_level: u32,
    pub src_extent: vk::Extent2D,
    pub dst_extent: vk::Extent2D,
}

/// Plan the blits needed to fill levels `1..mip_levels` from level 0.
///
/// Each level halves the previous extent, rounding down with a floor of 1.
pub fn mip_blit_plan(width: u32, height: u32, mip_levels: u32) -> Vec<MipBlit> {
    let mut blits = Vec::new();
    let mut src = vk::Extent2D { width, height };

    for dst_level in 1..mip_levels {
        let dst = vk::Extent2D {
            width: (src.width / 2).max(1),
            height: (src.height / 2).max(1),
        };
        blits.push(MipBlit {
            dst_level,
            src_extent: src,
            dst_extent: dst,
        });
        src = dst;
    }

    blits
}

/// Records commands into a recorder. Dropping without calling
/// [`CommandEncoder::finish`] leaves the command buffer in the recording
/// state; the recorder rejects re-begin until it is finished.
pub struct CommandEncoder<'a> {
    recorder: &'a mut CommandRecorder,
    device: Arc<ash::Device>,
}

impl<'a> CommandEncoder<'a> {
    /// Begin recording into `recorder`.
    pub fn new(recorder: &'a mut CommandRecorder) -> Result<Self> {
        let device = recorder.device().clone();
        recorder.begin()?;
        Ok(Self { recorder, device })
    }

    /// End recording. The recorder is then ready for submission.
    pub fn finish(self) -> Result<()> {
        self.recorder.finish()
    }

    /// Begin a render pass over `framebuffer`.
    pub fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) -> RenderPassEncoder<'a, '_> {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);

        unsafe {
            self.device.cmd_begin_render_pass(
                self.recorder.command_buffer(),
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }

        RenderPassEncoder { encoder: self }
    }

    /// Begin a compute pass. Purely a signal-stage scope; dispatches go
    /// through the raw command buffer.
    pub fn begin_compute_pass(&mut self) -> ComputePassEncoder<'a, '_> {
        ComputePassEncoder { encoder: self }
    }

    /// Copy a byte range between buffers.
    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &Buffer,
        src_offset: u64,
        dst: &Buffer,
        dst_offset: u64,
        size: u64,
    ) {
        let region = vk::BufferCopy::default()
            .src_offset(src_offset)
            .dst_offset(dst_offset)
            .size(size);

        unsafe {
            self.device.cmd_copy_buffer(
                self.recorder.command_buffer(),
                src.buffer,
                dst.buffer,
                &[region],
            );
        }
        self.recorder
            .set_signal_stage(vk::PipelineStageFlags::TRANSFER);
    }

    /// Upload buffer contents into mip level 0 of `dst`, generate the
    /// remaining mip levels by blitting, and leave the image in its
    /// declared final layout.
    pub fn copy_buffer_to_texture(
        &mut self,
        registry: &TextureRegistry,
        src: &Buffer,
        src_offset: u64,
        dst: TextureKey,
    ) -> Result<()> {
        let texture = registry.get(dst).ok_or(GpuError::StaleHandle)?;
        let cmd = self.recorder.command_buffer();

        unsafe {
            record_layout_barrier(
                &self.device,
                cmd,
                texture.image,
                texture.aspect,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                0,
                texture.mip_levels,
            );
        }

        let region = vk::BufferImageCopy::default()
            .buffer_offset(src_offset)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(texture.aspect)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: texture.extent.width,
                height: texture.extent.height,
                depth: 1,
            });

        unsafe {
            self.device.cmd_copy_buffer_to_image(
                cmd,
                src.buffer,
                texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }

        if texture.mip_levels > 1 {
            self.generate_mip_chain(texture.image, texture.aspect, texture.extent, texture.mip_levels);
        }

        // Every level is in TRANSFER_SRC after blitting (or TRANSFER_DST for
        // a single-level image); move the whole range to the final layout.
        let intermediate = if texture.mip_levels > 1 {
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        } else {
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        };
        unsafe {
            record_layout_barrier(
                &self.device,
                cmd,
                texture.image,
                texture.aspect,
                intermediate,
                texture.final_layout,
                0,
                texture.mip_levels,
            );
        }

        self.recorder
            .set_signal_stage(vk::PipelineStageFlags::TRANSFER);
        Ok(())
    }

    fn generate_mip_chain(
        &mut self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        extent: vk::Extent2D,
        mip_levels: u32,
    ) {
        let cmd = self.recorder.command_buffer();

        for blit in mip_blit_plan(extent.width, extent.height, mip_levels) {
            let src_level = blit.dst_level - 1;

            // The previous level was written as TRANSFER_DST; flip it to a
            // blit source before reading from it.
            unsafe {
                record_layout_barrier(
                    &self.device,
                    cmd,
                    image,
                    aspect,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    src_level,
                    1,
                );
            }

            let region = vk::ImageBlit::default()
                .src_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(aspect)
                        .mip_level(src_level)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .src_offsets([
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: blit.src_extent.width as i32,
                        y: blit.src_extent.height as i32,
                        z: 1,
                    },
                ])
                .dst_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(aspect)
                        .mip_level(blit.dst_level)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .dst_offsets([
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: blit.dst_extent.width as i32,
                        y: blit.dst_extent.height as i32,
                        z: 1,
                    },
                ]);

            unsafe {
                self.device.cmd_blit_image(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                    vk::Filter::LINEAR,
                );
            }
        }

        // The last level never became a blit source; align it with the rest.
        unsafe {
            record_layout_barrier(
                &self.device,
                cmd,
                image,
                aspect,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                mip_levels - 1,
                1,
            );
        }
    }

    /// Read back mip level 0 of `src` into a buffer, restoring the image to
    /// its declared final layout afterwards.
    pub fn copy_texture_to_buffer(
        &mut self,
        registry: &TextureRegistry,
        src: TextureKey,
        dst: &Buffer,
        dst_offset: u64,
    ) -> Result<()> {
        let texture = registry.get(src).ok_or(GpuError::StaleHandle)?;
        let cmd = self.recorder.command_buffer();

        unsafe {
            record_layout_barrier(
                &self.device,
                cmd,
                texture.image,
                texture.aspect,
                texture.final_layout,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                0,
                texture.mip_levels,
            );
        }

        let region = vk::BufferImageCopy::default()
            .buffer_offset(dst_offset)
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(texture.aspect)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_extent(vk::Extent3D {
                width: texture.extent.width,
                height: texture.extent.height,
                depth: 1,
            });

        unsafe {
            self.device.cmd_copy_image_to_buffer(
                cmd,
                texture.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst.buffer,
                &[region],
            );

            record_layout_barrier(
                &self.device,
                cmd,
                texture.image,
                texture.aspect,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                texture.final_layout,
                0,
                texture.mip_levels,
            );
        }

        self.recorder
            .set_signal_stage(vk::PipelineStageFlags::TRANSFER);
        Ok(())
    }

    /// Copy mip level 0 between two textures of the same extent, restoring
    /// both to their declared final layouts afterwards.
    pub fn copy_texture_to_texture(
        &mut self,
        registry: &TextureRegistry,
        src: TextureKey,
        dst: TextureKey,
    ) -> Result<()> {
        let src_texture = registry.get(src).ok_or(GpuError::StaleHandle)?;
        let dst_texture = registry.get(dst).ok_or(GpuError::StaleHandle)?;
        let cmd = self.recorder.command_buffer();

        unsafe {
            record_layout_barrier(
                &self.device,
                cmd,
                src_texture.image,
                src_texture.aspect,
                src_texture.final_layout,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                0,
                1,
            );
            record_layout_barrier(
                &self.device,
                cmd,
                dst_texture.image,
                dst_texture.aspect,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                0,
                1,
            );
        }

        let region = vk::ImageCopy::default()
            .src_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(src_texture.aspect)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .dst_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(dst_texture.aspect)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .extent(vk::Extent3D {
                width: src_texture.extent.width,
                height: src_texture.extent.height,
                depth: 1,
            });

        unsafe {
            self.device.cmd_copy_image(
                cmd,
                src_texture.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_texture.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            record_layout_barrier(
                &self.device,
                cmd,
                src_texture.image,
                src_texture.aspect,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                src_texture.final_layout,
                0,
                1,
            );
            record_layout_barrier(
                &self.device,
                cmd,
                dst_texture.image,
                dst_texture.aspect,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                dst_texture.final_layout,
                0,
                1,
            );
        }

        self.recorder
            .set_signal_stage(vk::PipelineStageFlags::TRANSFER);
        Ok(())
    }
}

/// Scope for render pass commands. [`RenderPassEncoder::end`] closes the
/// pass and stamps the recorder's signal stage at color attachment output.
pub struct RenderPassEncoder<'a, 'b> {
    encoder: &'b mut CommandEncoder<'a>,
}

impl RenderPassEncoder<'_, '_> {
    /// Raw command buffer for draw recording.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.encoder.recorder.command_buffer()
    }

    /// End the render pass.
    pub fn end(self) {
        unsafe {
            self.encoder
                .device
                .cmd_end_render_pass(self.encoder.recorder.command_buffer());
        }
        self.encoder
            .recorder
            .set_signal_stage(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
    }
}

/// Scope for compute commands. [`ComputePassEncoder::end`] stamps the
/// recorder's signal stage at the compute shader stage.
pub struct ComputePassEncoder<'a, 'b> {
    encoder: &'b mut CommandEncoder<'a>,
}

impl ComputePassEncoder<'_, '_> {
    /// Raw command buffer for dispatch recording.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.encoder.recorder.command_buffer()
    }

    /// End the compute pass.
    pub fn end(self) {
        self.encoder
            .recorder
            .set_signal_stage(vk::PipelineStageFlags::COMPUTE_SHADER);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_plan_halves_with_floor_of_one() {
        let plan = mip_blit_plan(64, 32, 4);
        assert_eq!(plan.len(), 3);

        assert_eq!(plan[0].dst_level, 1);
        assert_eq!(plan[0].src_extent, vk::Extent2D { width: 64, height: 32 });
        assert_eq!(plan[0].dst_extent, vk::Extent2D { width: 32, height: 16 });

        assert_eq!(plan[1].dst_level, 2);
        assert_eq!(plan[1].dst_extent, vk::Extent2D { width: 16, height: 8 });

        assert_eq!(plan[2].dst_level, 3);
        assert_eq!(plan[2].dst_extent, vk::Extent2D { width: 8, height: 4 });
    }

    #[test]
    fn mip_plan_clamps_narrow_dimensions() {
        let plan = mip_blit_plan(8, 1, 5);
        assert_eq!(plan.len(), 4);
        assert_eq!(plan[0].dst_extent, vk::Extent2D { width: 4, height: 1 });
        assert_eq!(plan[3].dst_extent, vk::Extent2D { width: 1, height: 1 });
    }

    #[test]
    fn mip_plan_rounds_odd_extents_down() {
        let plan = mip_blit_plan(5, 9, 3);
        assert_eq!(plan[0].dst_extent, vk::Extent2D { width: 2, height: 4 });
        assert_eq!(plan[1].dst_extent, vk::Extent2D { width: 1, height: 2 });
    }

    #[test]
    fn single_level_image_needs_no_blits() {
        assert!(mip_blit_plan(256, 256, 1).is_empty());
        assert!(mip_blit_plan(256, 256, 0).is_empty());
    }
}
