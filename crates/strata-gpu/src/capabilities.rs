//! GPU capability detection.

use ash::vk;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Other(u32),
}

impl GpuVendor {
    /// Identify a vendor from its PCI vendor id.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            other => Self::Other(other),
        }
    }
}

/// Device identity and the limits the sector allocator depends on.
#[derive(Clone, Debug)]
pub struct GpuCapabilities {
    pub device_name: String,
    pub vendor: GpuVendor,
    pub device_type: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub min_storage_buffer_offset_alignment: u64,
    pub min_uniform_buffer_offset_alignment: u64,
    pub min_texel_buffer_offset_alignment: u64,
    pub timeline_semaphores: bool,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_2_features);
        unsafe {
            instance.get_physical_device_features2(physical_device, &mut features2);
        }

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        Self {
            device_name,
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_type: properties.device_type,
            api_version: properties.api_version,
            min_storage_buffer_offset_alignment: properties
                .limits
                .min_storage_buffer_offset_alignment,
            min_uniform_buffer_offset_alignment: properties
                .limits
                .min_uniform_buffer_offset_alignment,
            min_texel_buffer_offset_alignment: properties
                .limits
                .min_texel_buffer_offset_alignment,
            timeline_semaphores: vulkan_1_2_features.timeline_semaphore == vk::TRUE,
        }
    }

    /// Whether the device supports what this crate requires.
    pub fn meets_requirements(&self) -> bool {
        let major = vk::api_version_major(self.api_version);
        let minor = vk::api_version_minor(self.api_version);
        (major > 1 || (major == 1 && minor >= 2)) && self.timeline_semaphores
    }

    /// The minimum offset alignment for a buffer of the given usage.
    ///
    /// Usage classes without an alignment requirement return 0 and are
    /// not rounded by the sector packer.
    pub fn buffer_alignment(&self, usage: vk::BufferUsageFlags) -> u64 {
        if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
            self.min_storage_buffer_offset_alignment
        } else if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            self.min_uniform_buffer_offset_alignment
        } else if usage.contains(vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER) {
            self.min_texel_buffer_offset_alignment
        } else {
            0
        }
    }

    /// One-line description for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}, Vulkan {}.{}.{})",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_caps() -> GpuCapabilities {
        GpuCapabilities {
            device_name: "test".to_string(),
            vendor: GpuVendor::Other(0),
            device_type: vk::PhysicalDeviceType::DISCRETE_GPU,
            api_version: vk::API_VERSION_1_2,
            min_storage_buffer_offset_alignment: 64,
            min_uniform_buffer_offset_alignment: 256,
            min_texel_buffer_offset_alignment: 16,
            timeline_semaphores: true,
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
    }

    #[test]
    fn alignment_by_usage_class() {
        let caps = test_caps();
        assert_eq!(
            caps.buffer_alignment(vk::BufferUsageFlags::STORAGE_BUFFER),
            64
        );
        // Storage wins when several classes are combined.
        assert_eq!(
            caps.buffer_alignment(
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::UNIFORM_BUFFER
            ),
            64
        );
        assert_eq!(
            caps.buffer_alignment(vk::BufferUsageFlags::UNIFORM_BUFFER),
            256
        );
        assert_eq!(
            caps.buffer_alignment(vk::BufferUsageFlags::STORAGE_TEXEL_BUFFER),
            16
        );
        assert_eq!(caps.buffer_alignment(vk::BufferUsageFlags::VERTEX_BUFFER), 0);
    }

    #[test]
    fn requirements_gate_on_timeline_support() {
        let mut caps = test_caps();
        assert!(caps.meets_requirements());
        caps.timeline_semaphores = false;
        assert!(!caps.meets_requirements());
    }
}
