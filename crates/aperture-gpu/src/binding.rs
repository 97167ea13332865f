//! Bind group layout cache and registry.
//!
//! Follows the same content-addressed pattern as the render pass and
//! framebuffer caches: a structural descriptor resolves to at most one
//! `vk::DescriptorSetLayout`. The registry additionally maps pipeline group
//! indices to layouts; looking up an index that was never registered yields
//! `None` rather than an error.

use crate::cache::DescriptorCache;
use crate::error::{GpuError, Result};
use ash::vk;
use std::collections::HashMap;
use std::sync::Arc;

/// One binding slot of a bind group layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindGroupLayoutEntry {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub visibility: vk::ShaderStageFlags,
}

/// Structural key for a bind group layout. Entry order is significant.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct BindGroupLayoutDescriptor {
    pub entries: Vec<BindGroupLayoutEntry>,
}

/// An owned `vk::DescriptorSetLayout`.
pub struct BindGroupLayout {
    handle: vk::DescriptorSetLayout,
}

impl BindGroupLayout {
    pub(crate) fn new(
        device: &ash::Device,
        descriptor: &BindGroupLayoutDescriptor,
    ) -> Result<Self> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = descriptor
            .entries
            .iter()
            .map(|entry| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(entry.binding)
                    .descriptor_type(entry.ty)
                    .descriptor_count(entry.count)
                    .stage_flags(entry.visibility)
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);

        let handle = unsafe { device.create_descriptor_set_layout(&create_info, None) }.map_err(
            |code| GpuError::ResourceCreation {
                what: "descriptor set layout",
                code,
            },
        )?;

        Ok(Self { handle })
    }

    /// Get the raw layout handle.
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }
}

/// Cache of bind group layouts keyed by structural descriptor.
pub struct BindGroupLayoutCache {
    device: Arc<ash::Device>,
    cache: DescriptorCache<BindGroupLayoutDescriptor, BindGroupLayout>,
}

impl BindGroupLayoutCache {
    pub(crate) fn new(device: Arc<ash::Device>) -> Self {
        Self {
            device,
            cache: DescriptorCache::new(),
        }
    }

    /// Resolve a descriptor to its layout, creating it on first use.
    pub fn get(&mut self, descriptor: &BindGroupLayoutDescriptor) -> Result<vk::DescriptorSetLayout> {
        let device = &self.device;
        let layout = self
            .cache
            .get_or_create(descriptor, || BindGroupLayout::new(device, descriptor))?;
        Ok(layout.handle())
    }

    /// Destroy every cached layout. Must run before device teardown.
    pub fn clear(&mut self) {
        let device = self.device.clone();
        self.cache.clear_with(|layout| unsafe {
            device.destroy_descriptor_set_layout(layout.handle, None);
        });
    }
}

/// Maps pipeline group indices to resolved layouts.
///
/// Registration is explicit; a lookup for an index that was never registered
/// is a caller mistake reported as `None`, never a panic.
#[derive(Default)]
pub struct BindGroupLayoutRegistry {
    groups: HashMap<u32, vk::DescriptorSetLayout>,
}

impl BindGroupLayoutRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `index` with `layout`, replacing any previous association.
    pub fn register(&mut self, index: u32, layout: vk::DescriptorSetLayout) {
        self.groups.insert(index, layout);
    }

    /// Look up the layout registered for `index`.
    pub fn get(&self, index: u32) -> Option<vk::DescriptorSetLayout> {
        self.groups.get(&index).copied()
    }

    /// Number of registered groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether no groups are registered.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn unregistered_index_yields_none() {
        let registry = BindGroupLayoutRegistry::new();
        assert!(registry.get(0).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn registration_round_trips_and_replaces() {
        let mut registry = BindGroupLayoutRegistry::new();
        let first = vk::DescriptorSetLayout::from_raw(0xA);
        let second = vk::DescriptorSetLayout::from_raw(0xB);

        registry.register(2, first);
        assert_eq!(registry.get(2), Some(first));
        assert!(registry.get(1).is_none());

        registry.register(2, second);
        assert_eq!(registry.get(2), Some(second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn layout_descriptor_entry_order_is_significant() {
        let uniform = BindGroupLayoutEntry {
            binding: 0,
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            count: 1,
            visibility: vk::ShaderStageFlags::VERTEX,
        };
        let sampled = BindGroupLayoutEntry {
            binding: 1,
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: 1,
            visibility: vk::ShaderStageFlags::FRAGMENT,
        };

        let a = BindGroupLayoutDescriptor {
            entries: vec![uniform, sampled],
        };
        let b = BindGroupLayoutDescriptor {
            entries: vec![sampled, uniform],
        };
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
