//! GPU context management.
//!
//! A headless bootstrap for consumers (and tests) that do not bring
//! their own device: instance, physical device, logical device with
//! graphics/compute/transfer queues, and the shared allocator. Embedding
//! applications with an existing device skip this module entirely and
//! construct managers from their own handles.

use crate::allocator::GpuAllocator;
use crate::buffer::SectorBuffer;
use crate::capabilities::GpuCapabilities;
use crate::command::QueueData;
use crate::descriptors::DescriptorSetManager;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::transfer::MemoryOps;
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    capabilities: GpuCapabilities,
    allocator: Arc<Mutex<GpuAllocator>>,

    graphics_queue_family: u32,
    compute_queue_family: u32,
    transfer_queue_family: u32,
    graphics_queue: vk::Queue,
    compute_queue: vk::Queue,
    transfer_queue: vk::Queue,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get access to the GPU allocator.
    pub fn allocator(&self) -> &Arc<Mutex<GpuAllocator>> {
        &self.allocator
    }

    /// The graphics queue with its family index.
    pub fn graphics_queue(&self) -> QueueData {
        QueueData {
            index: self.graphics_queue_family,
            queue: self.graphics_queue,
        }
    }

    /// The compute queue with its family index.
    pub fn compute_queue(&self) -> QueueData {
        QueueData {
            index: self.compute_queue_family,
            queue: self.compute_queue,
        }
    }

    /// The transfer queue with its family index.
    pub fn transfer_queue(&self) -> QueueData {
        QueueData {
            index: self.transfer_queue_family,
            queue: self.transfer_queue,
        }
    }

    /// Create a sector buffer on this context's transfer queue.
    pub fn sector_buffer(
        &self,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: impl Into<String>,
    ) -> Result<Arc<SectorBuffer>> {
        SectorBuffer::new(
            self.device.clone(),
            self.allocator.clone(),
            &self.capabilities,
            self.transfer_queue(),
            usage,
            location,
            name,
        )
    }

    /// Create a transfer scheduler on this context's transfer queue.
    pub fn memory_ops(&self) -> Result<MemoryOps> {
        MemoryOps::new(
            self.device.clone(),
            self.allocator.clone(),
            &self.capabilities,
            self.transfer_queue(),
        )
    }

    /// Create a descriptor set manager on this context's device.
    pub fn descriptor_manager(&self) -> DescriptorSetManager {
        DescriptorSetManager::new(self.device.clone())
    }

    /// Wait for the device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
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

            // Free all GPU memory before the device goes away. Managers
            // holding the allocator must already be dropped.
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    prefer_dedicated_transfer: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Strata".to_string(),
            enable_validation: cfg!(debug_assertions),
            prefer_dedicated_transfer: true,
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
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Prefer dedicated compute/transfer queue families over the
    /// graphics family. On by default; disable to keep all submissions
    /// on one queue.
    pub fn prefer_dedicated_transfer(mut self, prefer: bool) -> Self {
        self.prefer_dedicated_transfer = prefer;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let physical_device = unsafe { select_physical_device(&instance) }?;

        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };
        if !capabilities.meets_requirements() {
            return Err(GpuError::NoSuitableDevice);
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let queue_families = unsafe {
            find_queue_families(&instance, physical_device, self.prefer_dedicated_transfer)
        }?;

        let (device, graphics_queue, compute_queue, transfer_queue) =
            unsafe { create_device(&instance, physical_device, &queue_families)? };

        let device = Arc::new(device);

        let allocator =
            unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Arc::new(Mutex::new(allocator)),
            graphics_queue_family: queue_families.graphics,
            compute_queue_family: queue_families.compute,
            transfer_queue_family: queue_families.transfer,
            graphics_queue,
            compute_queue,
            transfer_queue,
        })
    }
}

/// Queue family indices.
struct QueueFamilyIndices {
    graphics: u32,
    compute: u32,
    transfer: u32,
}

/// Find queue families for graphics, compute, and transfer.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    prefer_dedicated: bool,
) -> Result<QueueFamilyIndices> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let mut graphics_family = None;
    let mut compute_family = None;
    let mut transfer_family = None;

    for (i, family) in queue_families.iter().enumerate() {
        let i = i as u32;

        // Look for dedicated compute queue (no graphics)
        if family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && compute_family.is_none()
        {
            compute_family = Some(i);
        }

        // Look for dedicated transfer queue (no graphics or compute)
        if family.queue_flags.contains(vk::QueueFlags::TRANSFER)
            && !family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && !family.queue_flags.contains(vk::QueueFlags::COMPUTE)
            && transfer_family.is_none()
        {
            transfer_family = Some(i);
        }

        // Graphics queue (also supports compute and transfer)
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && graphics_family.is_none() {
            graphics_family = Some(i);
        }
    }

    // Graphics queue is required
    let graphics = graphics_family.ok_or(GpuError::NoSuitableDevice)?;

    if !prefer_dedicated {
        return Ok(QueueFamilyIndices {
            graphics,
            compute: graphics,
            transfer: graphics,
        });
    }

    // Fall back to graphics queue for compute if no dedicated queue
    let compute = compute_family.unwrap_or(graphics);

    // Fall back to compute queue for transfer if no dedicated queue
    let transfer = transfer_family.unwrap_or(compute);

    Ok(QueueFamilyIndices {
        graphics,
        compute,
        transfer,
    })
}

/// Create the logical device and retrieve queues.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: &QueueFamilyIndices,
) -> Result<(ash::Device, vk::Queue, vk::Queue, vk::Queue)> {
    // Collect unique queue families
    let mut unique_families = HashSet::new();
    unique_families.insert(queue_families.graphics);
    unique_families.insert(queue_families.compute);
    unique_families.insert(queue_families.transfer);

    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    // Timeline semaphores are the one hard feature requirement
    let mut vulkan_1_2_features =
        vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .push_next(&mut features2);

    let device = unsafe {
        instance
            .create_device(physical_device, &device_create_info, None)
            .map_err(GpuError::from)?
    };

    let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
    let compute_queue = unsafe { device.get_device_queue(queue_families.compute, 0) };
    let transfer_queue = unsafe { device.get_device_queue(queue_families.transfer, 0) };

    Ok((device, graphics_queue, compute_queue, transfer_queue))
}
