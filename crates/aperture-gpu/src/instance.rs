//! Vulkan instance creation and physical device selection.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};
use tracing::warn;

/// Instance-level configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub app_name: String,
    pub enable_validation: bool,
    /// Extensions beyond the platform surface set.
    pub extra_extensions: Vec<&'static CStr>,
    /// Layers beyond the validation layer.
    pub extra_layers: Vec<&'static CStr>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_name: "aperture".to_string(),
            enable_validation: cfg!(debug_assertions),
            extra_extensions: Vec::new(),
            extra_layers: Vec::new(),
        }
    }
}

/// Required instance extensions for windowed rendering.
pub fn required_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// Validation layers to enable in debug builds.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance.
///
/// Layers requested but not installed are skipped with a warning rather
/// than failing instance creation.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(entry: &ash::Entry, config: &InstanceConfig) -> Result<ash::Instance> {
    let app_name = CString::new(config.app_name.as_str())
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;
    let engine_name = c"Aperture";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions = required_instance_extensions();
    extensions.extend_from_slice(&config.extra_extensions);
    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut layers = if config.enable_validation {
        validation_layers()
    } else {
        vec![]
    };
    layers.extend_from_slice(&config.extra_layers);

    let available_layers = unsafe { entry.enumerate_instance_layer_properties() }?;
    layers.retain(|layer| {
        let found = available_layers.iter().any(|props| {
            let name = unsafe { CStr::from_ptr(props.layer_name.as_ptr()) };
            name == *layer
        });
        if !found {
            warn!("Layer {:?} not available, skipping", layer);
        }
        found
    });

    let layer_names: Vec<*const i8> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = unsafe { entry.create_instance(&create_info, None) }?;

    Ok(instance)
}

/// Pick the first queue family supporting all of `required_flags`.
pub fn pick_queue_family(
    families: &[vk::QueueFamilyProperties],
    required_flags: vk::QueueFlags,
) -> Option<u32> {
    families
        .iter()
        .position(|family| family.queue_count > 0 && family.queue_flags.contains(required_flags))
        .map(|index| index as u32)
}

/// Select the best physical device exposing a queue family with
/// `required_flags`, returning the device and that family's index.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    required_flags: vk::QueueFlags,
) -> Result<(vk::PhysicalDevice, u32)> {
    let devices = unsafe { instance.enumerate_physical_devices() }?;

    if devices.is_empty() {
        return Err(GpuError::NoSuitableDevice);
    }

    let mut best: Option<(vk::PhysicalDevice, u32)> = None;
    let mut best_score = 0i32;

    for device in devices {
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(device) };
        let Some(queue_family) = pick_queue_family(&families, required_flags) else {
            continue;
        };

        let score = unsafe { score_physical_device(instance, device) };
        if score > best_score {
            best_score = score;
            best = Some((device, queue_family));
        }
    }

    best.ok_or(GpuError::NoSuitableDevice)
}

unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i32 {
    let properties = unsafe { instance.get_physical_device_properties(device) };

    let api_version = properties.api_version;
    if vk::api_version_major(api_version) < 1
        || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 3)
    {
        return -1;
    }

    let mut score = 0;

    match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 50,
        _ => {}
    }

    let memory = unsafe { instance.get_physical_device_memory_properties(device) };
    let vram_mb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024))
        .sum();
    score += (vram_mb / 1024) as i32; // +1 per GB

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn queue_family_requires_all_flags() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 1),
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                4,
            ),
        ];

        assert_eq!(
            pick_queue_family(&families, vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
            Some(1)
        );
        assert_eq!(
            pick_queue_family(&families, vk::QueueFlags::TRANSFER),
            Some(0)
        );
        assert_eq!(
            pick_queue_family(&families, vk::QueueFlags::SPARSE_BINDING),
            None
        );
    }

    #[test]
    fn queue_family_skips_empty_families() {
        let families = [
            family(vk::QueueFlags::GRAPHICS, 0),
            family(vk::QueueFlags::GRAPHICS, 1),
        ];
        assert_eq!(pick_queue_family(&families, vk::QueueFlags::GRAPHICS), Some(1));
    }
}
