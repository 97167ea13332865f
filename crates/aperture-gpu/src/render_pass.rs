//! Render pass descriptors and the render pass cache.
//!
//! A [`RenderPassDescriptor`] is a value type describing the attachment
//! structure of a pass. The cache guarantees that structurally equal
//! descriptors resolve to the same `vk::RenderPass` instance, created at most
//! once.

use crate::cache::DescriptorCache;
use crate::error::{GpuError, Result};
use ash::vk;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// What to do with an attachment's contents when a pass begins.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    /// Existing contents are undefined.
    #[default]
    DontCare,
    /// Preserve the existing contents.
    Load,
    /// Clear to the pass's clear value.
    Clear,
}

impl LoadOp {
    pub(crate) const fn to_vk(self) -> vk::AttachmentLoadOp {
        match self {
            Self::DontCare => vk::AttachmentLoadOp::DONT_CARE,
            Self::Load => vk::AttachmentLoadOp::LOAD,
            Self::Clear => vk::AttachmentLoadOp::CLEAR,
        }
    }
}

/// What to do with an attachment's contents when a pass ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// Contents may be discarded.
    #[default]
    DontCare,
    /// Contents are written back.
    Store,
}

impl StoreOp {
    pub(crate) const fn to_vk(self) -> vk::AttachmentStoreOp {
        match self {
            Self::DontCare => vk::AttachmentStoreOp::DONT_CARE,
            Self::Store => vk::AttachmentStoreOp::STORE,
        }
    }
}

/// One color attachment slot of a render pass.
///
/// The position in [`RenderPassDescriptor::color_attachments`] is the binding
/// slot, so attachment order participates in cache equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorAttachment {
    pub format: vk::Format,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl Default for ColorAttachment {
    fn default() -> Self {
        Self {
            format: vk::Format::UNDEFINED,
            load_op: LoadOp::default(),
            store_op: StoreOp::default(),
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

/// The optional depth/stencil attachment of a render pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilAttachment {
    pub format: vk::Format,
    pub depth_load_op: LoadOp,
    pub depth_store_op: StoreOp,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
}

impl Default for DepthStencilAttachment {
    fn default() -> Self {
        Self {
            format: vk::Format::UNDEFINED,
            depth_load_op: LoadOp::default(),
            depth_store_op: StoreOp::default(),
            stencil_load_op: LoadOp::default(),
            stencil_store_op: StoreOp::default(),
        }
    }
}

/// Structural key for a render pass.
///
/// Immutable once built; equality is element-wise over every field, in
/// attachment order.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenderPassDescriptor {
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_stencil_attachment: Option<DepthStencilAttachment>,
    pub sample_count: u32,
}

// Order-sensitive fold over the fields that drive attachment compatibility.
// The folded set is a subset of the equality fields, so equal descriptors
// always hash equal.
impl Hash for RenderPassDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sample_count.hash(state);

        for color in &self.color_attachments {
            color.load_op.hash(state);
            color.store_op.hash(state);
            color.format.hash(state);
            color.final_layout.hash(state);
        }

        if let Some(depth_stencil) = &self.depth_stencil_attachment {
            depth_stencil.depth_load_op.hash(state);
            depth_stencil.depth_store_op.hash(state);
            depth_stencil.stencil_load_op.hash(state);
            depth_stencil.stencil_store_op.hash(state);
            depth_stencil.format.hash(state);
        }
    }
}

pub(crate) const fn sample_count_flags(count: u32) -> vk::SampleCountFlags {
    match count {
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        _ => vk::SampleCountFlags::TYPE_1,
    }
}

/// An owned `vk::RenderPass` created from a [`RenderPassDescriptor`].
pub struct RenderPass {
    handle: vk::RenderPass,
}

impl RenderPass {
    /// Create the native render pass with a single subpass derived from the
    /// descriptor's attachment list.
    pub(crate) fn new(device: &ash::Device, descriptor: &RenderPassDescriptor) -> Result<Self> {
        let sample_count = sample_count_flags(descriptor.sample_count);

        let mut attachments = Vec::with_capacity(descriptor.color_attachments.len() + 1);
        for color in &descriptor.color_attachments {
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(color.format)
                    .samples(sample_count)
                    .load_op(color.load_op.to_vk())
                    .store_op(color.store_op.to_vk())
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(color.initial_layout)
                    .final_layout(color.final_layout),
            );
        }

        if let Some(depth_stencil) = &descriptor.depth_stencil_attachment {
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(depth_stencil.format)
                    .samples(sample_count)
                    .load_op(depth_stencil.depth_load_op.to_vk())
                    .store_op(depth_stencil.depth_store_op.to_vk())
                    .stencil_load_op(depth_stencil.stencil_load_op.to_vk())
                    .stencil_store_op(depth_stencil.stencil_store_op.to_vk())
                    .initial_layout(vk::ImageLayout::UNDEFINED)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            );
        }

        let color_refs: Vec<vk::AttachmentReference> = (0..descriptor.color_attachments.len())
            .map(|slot| {
                vk::AttachmentReference::default()
                    .attachment(slot as u32)
                    .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            })
            .collect();

        let depth_ref = vk::AttachmentReference::default()
            .attachment(descriptor.color_attachments.len() as u32)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if descriptor.depth_stencil_attachment.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }
        let subpasses = [subpass];

        let dependencies = [
            // Depth writes of prior work must land before this pass touches
            // the depth attachment again.
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(
                    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                )
                .dst_stage_mask(
                    vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                )
                .dst_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE),
            vk::SubpassDependency::default()
                .src_subpass(vk::SUBPASS_EXTERNAL)
                .dst_subpass(0)
                .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
        ];

        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = unsafe { device.create_render_pass(&create_info, None) }.map_err(|code| {
            GpuError::ResourceCreation {
                what: "render pass",
                code,
            }
        })?;

        Ok(Self { handle })
    }

    /// Get the raw render pass handle.
    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }
}

/// Cache of render passes keyed by structural descriptor.
///
/// Single-threaded use only; the owning context serializes access.
pub struct RenderPassCache {
    device: Arc<ash::Device>,
    cache: DescriptorCache<RenderPassDescriptor, RenderPass>,
}

impl RenderPassCache {
    pub(crate) fn new(device: Arc<ash::Device>) -> Self {
        Self {
            device,
            cache: DescriptorCache::new(),
        }
    }

    /// Resolve a descriptor to its render pass, creating it on first use.
    pub fn get(&mut self, descriptor: &RenderPassDescriptor) -> Result<vk::RenderPass> {
        let device = &self.device;
        let pass = self
            .cache
            .get_or_create(descriptor, || RenderPass::new(device, descriptor))?;
        Ok(pass.handle())
    }

    /// Number of distinct render passes created so far.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether the cache holds no render passes.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Destroy every cached render pass. Must run before device teardown.
    pub fn clear(&mut self) {
        let device = self.device.clone();
        self.cache.clear_with(|pass| unsafe {
            device.destroy_render_pass(pass.handle, None);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(descriptor: &RenderPassDescriptor) -> u64 {
        let mut hasher = DefaultHasher::new();
        descriptor.hash(&mut hasher);
        hasher.finish()
    }

    fn base_descriptor() -> RenderPassDescriptor {
        RenderPassDescriptor {
            color_attachments: vec![
                ColorAttachment {
                    format: vk::Format::B8G8R8A8_UNORM,
                    load_op: LoadOp::Clear,
                    store_op: StoreOp::Store,
                    initial_layout: vk::ImageLayout::UNDEFINED,
                    final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
                },
                ColorAttachment {
                    format: vk::Format::R16G16B16A16_SFLOAT,
                    load_op: LoadOp::DontCare,
                    store_op: StoreOp::Store,
                    initial_layout: vk::ImageLayout::UNDEFINED,
                    final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                },
            ],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                format: vk::Format::D32_SFLOAT,
                depth_load_op: LoadOp::Clear,
                depth_store_op: StoreOp::DontCare,
                stencil_load_op: LoadOp::DontCare,
                stencil_store_op: StoreOp::DontCare,
            }),
            sample_count: 1,
        }
    }

    #[test]
    fn equal_descriptors_hash_equal() {
        let a = base_descriptor();
        let b = base_descriptor();
        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
    }

    #[test]
    fn single_field_mutations_break_equality() {
        let base = base_descriptor();

        let mut mutated = base.clone();
        mutated.color_attachments[1].store_op = StoreOp::DontCare;
        assert_ne!(base, mutated);

        let mut mutated = base.clone();
        mutated.color_attachments[0].format = vk::Format::R8G8B8A8_UNORM;
        assert_ne!(base, mutated);

        let mut mutated = base.clone();
        mutated.sample_count = 4;
        assert_ne!(base, mutated);

        let mut mutated = base.clone();
        mutated.depth_stencil_attachment = None;
        assert_ne!(base, mutated);

        let mut mutated = base.clone();
        if let Some(depth_stencil) = &mut mutated.depth_stencil_attachment {
            depth_stencil.stencil_load_op = LoadOp::Load;
        }
        assert_ne!(base, mutated);
    }

    #[test]
    fn mutated_hash_fields_change_the_hash() {
        // Not required by the hash contract, but collisions on these single
        // field flips would make every lookup fall through to full equality.
        let base = base_descriptor();
        let base_hash = hash_of(&base);

        let mut mutated = base.clone();
        mutated.color_attachments[0].load_op = LoadOp::Load;
        assert_ne!(base_hash, hash_of(&mutated));

        let mut mutated = base.clone();
        mutated.color_attachments[1].final_layout = vk::ImageLayout::GENERAL;
        assert_ne!(base_hash, hash_of(&mutated));

        let mut mutated = base;
        mutated.sample_count = 8;
        assert_ne!(base_hash, hash_of(&mutated));
    }

    #[test]
    fn attachment_order_is_significant() {
        let base = base_descriptor();
        let mut swapped = base.clone();
        swapped.color_attachments.swap(0, 1);

        assert_ne!(base, swapped);
        assert_ne!(hash_of(&base), hash_of(&swapped));
    }

    #[test]
    fn hash_is_deterministic_across_clones() {
        let descriptors: Vec<RenderPassDescriptor> = (1..=8)
            .map(|count| {
                let mut descriptor = base_descriptor();
                descriptor.color_attachments.truncate(count.min(2));
                descriptor.sample_count = count as u32;
                descriptor
            })
            .collect();

        for descriptor in &descriptors {
            assert_eq!(hash_of(descriptor), hash_of(&descriptor.clone()));
        }
    }

    #[test]
    fn sample_count_conversion_defaults_to_one() {
        assert_eq!(sample_count_flags(1), vk::SampleCountFlags::TYPE_1);
        assert_eq!(sample_count_flags(4), vk::SampleCountFlags::TYPE_4);
        assert_eq!(sample_count_flags(3), vk::SampleCountFlags::TYPE_1);
        assert_eq!(sample_count_flags(0), vk::SampleCountFlags::TYPE_1);
    }

    #[test]
    fn load_store_op_conversions() {
        assert_eq!(LoadOp::Clear.to_vk(), vk::AttachmentLoadOp::CLEAR);
        assert_eq!(LoadOp::Load.to_vk(), vk::AttachmentLoadOp::LOAD);
        assert_eq!(LoadOp::DontCare.to_vk(), vk::AttachmentLoadOp::DONT_CARE);
        assert_eq!(StoreOp::Store.to_vk(), vk::AttachmentStoreOp::STORE);
        assert_eq!(StoreOp::DontCare.to_vk(), vk::AttachmentStoreOp::DONT_CARE);
    }
}
