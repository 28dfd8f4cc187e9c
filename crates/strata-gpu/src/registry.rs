//! Resource registry with deterministic teardown order.
//!
//! GPU objects have cross-type destruction-order requirements that do not
//! line up with host memory lifetime order, so teardown is explicit: each
//! resource type has its own queue, and [`ResourceRegistry::destroy_all`]
//! drains the queues in a fixed dependency-safe order. Managers retire
//! superseded objects (old backing buffers, replaced pools) into their
//! registry instead of destroying them at the call site.

use crate::allocator::{GpuAllocator, GpuBuffer, GpuImage};
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Owns pending-destruction queues for one manager's GPU objects.
pub struct ResourceRegistry {
    device: Arc<ash::Device>,
    allocator: Option<Arc<Mutex<GpuAllocator>>>,

    semaphores: VecDeque<vk::Semaphore>,
    fences: VecDeque<vk::Fence>,
    command_pools: VecDeque<vk::CommandPool>,
    pipelines: VecDeque<vk::Pipeline>,
    pipeline_layouts: VecDeque<vk::PipelineLayout>,
    descriptor_pools: VecDeque<vk::DescriptorPool>,
    descriptor_set_layouts: VecDeque<vk::DescriptorSetLayout>,
    samplers: VecDeque<vk::Sampler>,
    image_views: VecDeque<vk::ImageView>,
    images: VecDeque<GpuImage>,
    buffers: VecDeque<GpuBuffer>,
}

impl ResourceRegistry {
    /// Create a registry without allocator access. Buffer and image
    /// creation will fail until an allocator is attached.
    pub fn new(device: Arc<ash::Device>) -> Self {
        Self::build(device, None)
    }

    /// Create a registry that can create and free allocator-backed
    /// buffers and images.
    pub fn with_allocator(device: Arc<ash::Device>, allocator: Arc<Mutex<GpuAllocator>>) -> Self {
        Self::build(device, Some(allocator))
    }

    fn build(device: Arc<ash::Device>, allocator: Option<Arc<Mutex<GpuAllocator>>>) -> Self {
        Self {
            device,
            allocator,
            semaphores: VecDeque::new(),
            fences: VecDeque::new(),
            command_pools: VecDeque::new(),
            pipelines: VecDeque::new(),
            pipeline_layouts: VecDeque::new(),
            descriptor_pools: VecDeque::new(),
            descriptor_set_layouts: VecDeque::new(),
            samplers: VecDeque::new(),
            image_views: VecDeque::new(),
            images: VecDeque::new(),
            buffers: VecDeque::new(),
        }
    }

    /// Get the device this registry destroys against.
    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }

    /// Get the attached allocator.
    pub fn allocator(&self) -> Result<&Arc<Mutex<GpuAllocator>>> {
        self.allocator
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("Registry has no allocator".to_string()))
    }

    /// Create a binary semaphore, registered for teardown.
    pub fn make_semaphore(&mut self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { self.device.create_semaphore(&create_info, None)? };
        self.semaphores.push_back(semaphore);
        Ok(semaphore)
    }

    /// Create a fence, registered for teardown.
    pub fn make_fence(&mut self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { self.device.create_fence(&create_info, None)? };
        self.fences.push_back(fence);
        Ok(fence)
    }

    /// Create a command pool, registered for teardown.
    pub fn make_command_pool(
        &mut self,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);
        let pool = unsafe { self.device.create_command_pool(&create_info, None)? };
        self.command_pools.push_back(pool);
        Ok(pool)
    }

    /// Create a descriptor set layout, registered for teardown.
    pub fn make_descriptor_set_layout(
        &mut self,
        bindings: &[vk::DescriptorSetLayoutBinding],
    ) -> Result<vk::DescriptorSetLayout> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&create_info, None)? };
        self.descriptor_set_layouts.push_back(layout);
        Ok(layout)
    }

    /// Create a descriptor pool, registered for teardown.
    pub fn make_descriptor_pool(
        &mut self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&create_info, None)? };
        self.descriptor_pools.push_back(pool);
        Ok(pool)
    }

    /// Allocate descriptor sets from a pool. The sets are owned by the
    /// pool and die with it; they are not tracked individually.
    pub fn make_descriptor_sets(
        &mut self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };
        Ok(sets)
    }

    /// Create an allocator-backed buffer. The live buffer is handed to
    /// the caller; retire it back here once superseded.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuBuffer> {
        self.allocator()?
            .lock()
            .create_buffer(size, usage, location, name)
    }

    /// Create an allocator-backed image. The live image is handed to the
    /// caller; retire it back here once superseded.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        name: &str,
    ) -> Result<GpuImage> {
        self.allocator()?
            .lock()
            .create_image(create_info, location, name)
    }

    /// Queue a superseded buffer for destruction.
    pub fn retire_buffer(&mut self, buffer: GpuBuffer) {
        self.buffers.push_back(buffer);
    }

    /// Queue a superseded image for destruction.
    pub fn retire_image(&mut self, image: GpuImage) {
        self.images.push_back(image);
    }

    /// Register an externally created pipeline for teardown.
    pub fn manage_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.pipelines.push_back(pipeline);
    }

    /// Register an externally created pipeline layout for teardown.
    pub fn manage_pipeline_layout(&mut self, layout: vk::PipelineLayout) {
        self.pipeline_layouts.push_back(layout);
    }

    /// Register an externally created sampler for teardown.
    pub fn manage_sampler(&mut self, sampler: vk::Sampler) {
        self.samplers.push_back(sampler);
    }

    /// Register an externally created image view for teardown.
    pub fn manage_image_view(&mut self, view: vk::ImageView) {
        self.image_views.push_back(view);
    }

    /// Destroy all queued descriptor pools now. Frees their sets.
    pub fn destroy_descriptor_pools(&mut self) {
        while let Some(pool) = self.descriptor_pools.pop_front() {
            unsafe {
                self.device.destroy_descriptor_pool(pool, None);
            }
        }
    }

    /// Destroy all queued descriptor set layouts now.
    pub fn destroy_descriptor_set_layouts(&mut self) {
        while let Some(layout) = self.descriptor_set_layouts.pop_front() {
            unsafe {
                self.device.destroy_descriptor_set_layout(layout, None);
            }
        }
    }

    /// Destroy all queued buffers now.
    pub fn destroy_buffers(&mut self) {
        if self.buffers.is_empty() {
            return;
        }
        // Buffers cannot exist without an allocator to have created them.
        let allocator = self
            .allocator
            .as_ref()
            .expect("retired buffers without an allocator")
            .clone();
        let mut allocator = allocator.lock();
        while let Some(mut buffer) = self.buffers.pop_front() {
            if let Err(e) = allocator.free_buffer(&mut buffer) {
                tracing::warn!("Failed to free retired buffer: {e}");
            }
        }
    }

    /// Destroy all queued images now.
    pub fn destroy_images(&mut self) {
        if self.images.is_empty() {
            return;
        }
        let allocator = self
            .allocator
            .as_ref()
            .expect("retired images without an allocator")
            .clone();
        let mut allocator = allocator.lock();
        while let Some(mut image) = self.images.pop_front() {
            if let Err(e) = allocator.free_image(&mut image) {
                tracing::warn!("Failed to free retired image: {e}");
            }
        }
    }

    /// Drain every queue in dependency-safe order.
    ///
    /// The caller must ensure none of the queued objects are still in use
    /// by the GPU (wait on the owning context or the device first).
    pub fn destroy_all(&mut self) {
        unsafe {
            while let Some(semaphore) = self.semaphores.pop_front() {
                self.device.destroy_semaphore(semaphore, None);
            }
            while let Some(fence) = self.fences.pop_front() {
                self.device.destroy_fence(fence, None);
            }
            while let Some(pool) = self.command_pools.pop_front() {
                self.device.destroy_command_pool(pool, None);
            }
            while let Some(pipeline) = self.pipelines.pop_front() {
                self.device.destroy_pipeline(pipeline, None);
            }
            while let Some(layout) = self.pipeline_layouts.pop_front() {
                self.device.destroy_pipeline_layout(layout, None);
            }
        }
        self.destroy_descriptor_pools();
        self.destroy_descriptor_set_layouts();
        unsafe {
            while let Some(sampler) = self.samplers.pop_front() {
                self.device.destroy_sampler(sampler, None);
            }
            while let Some(view) = self.image_views.pop_front() {
                self.device.destroy_image_view(view, None);
            }
        }
        self.destroy_images();
        self.destroy_buffers();
    }
}

impl Drop for ResourceRegistry {
    fn drop(&mut self) {
        self.destroy_all();
    }
}
