//! Descriptor set management.
//!
//! Descriptor bindings are version-gated the same way transfers are: each
//! binding keeps a clone of its source's submission counter and the value
//! it last wrote. A sector repack bumps the source counter, the binding
//! reads as stale, and the next [`DescriptorSetManager::update`] rewrites
//! exactly the dirty sets, resolving live buffer handles and offsets at
//! write time, since both may have shifted since the binding was declared.

use crate::buffer::SectorHandle;
use crate::error::Result;
use crate::registry::ResourceRegistry;
use crate::sync::SharedCounter;
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Sentinel for a binding that has never been written.
const NEVER_WRITTEN: u64 = u64::MAX;

enum BindingResource {
    Buffer {
        sector: SectorHandle,
    },
    Image {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
}

struct DescriptorBinding {
    ty: vk::DescriptorType,
    source: SharedCounter,
    recorded: u64,
    stages: vk::ShaderStageFlags,
    resource: BindingResource,
}

impl DescriptorBinding {
    fn is_stale(&self) -> bool {
        self.recorded != self.source.get()
    }
}

/// One tracked descriptor set: its bindings, and the live layout and set
/// handles once allocated.
pub struct DescriptorSetData {
    bindings: Vec<DescriptorBinding>,
    set: vk::DescriptorSet,
    layout: vk::DescriptorSetLayout,
    layout_binding_count: usize,
}

impl DescriptorSetData {
    fn new() -> Self {
        Self {
            bindings: Vec::new(),
            set: vk::DescriptorSet::null(),
            layout: vk::DescriptorSetLayout::null(),
            layout_binding_count: 0,
        }
    }

    /// Bind a sector at the next binding slot. The descriptor type is
    /// inferred from the owning buffer's usage class; anything other
    /// than a storage or uniform buffer is a programming error.
    pub fn add_buffer(&mut self, sector: &SectorHandle, stages: vk::ShaderStageFlags) {
        let usage = sector.owner().usage();
        let ty = if usage.contains(vk::BufferUsageFlags::STORAGE_BUFFER) {
            vk::DescriptorType::STORAGE_BUFFER
        } else if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            vk::DescriptorType::UNIFORM_BUFFER
        } else {
            panic!("sector descriptor requires a storage or uniform buffer");
        };
        self.bindings.push(DescriptorBinding {
            ty,
            source: sector.owner().version_counter(),
            recorded: NEVER_WRITTEN,
            stages,
            resource: BindingResource::Buffer {
                sector: sector.clone(),
            },
        });
    }

    /// Bind an image view + sampler at the next binding slot. `source`
    /// is the counter whose bumps invalidate this binding.
    pub fn add_image(
        &mut self,
        ty: vk::DescriptorType,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
        source: SharedCounter,
        stages: vk::ShaderStageFlags,
    ) {
        self.bindings.push(DescriptorBinding {
            ty,
            source,
            recorded: NEVER_WRITTEN,
            stages,
            resource: BindingResource::Image {
                view,
                sampler,
                layout,
            },
        });
    }

    /// Whether the set handle must be (re)allocated: no set exists yet,
    /// or bindings were added since the layout was built.
    pub fn needs_allocation(&self) -> bool {
        self.set == vk::DescriptorSet::null() || self.layout_binding_count != self.bindings.len()
    }

    /// Whether any binding's recorded version is stale relative to its
    /// source counter.
    pub fn needs_rewrite(&self) -> bool {
        self.bindings.iter().any(DescriptorBinding::is_stale)
    }

    /// The live descriptor set handle for pipeline binding.
    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    /// The live layout handle for pipeline-layout construction.
    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Number of declared bindings.
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    fn layout_bindings(&self) -> Vec<vk::DescriptorSetLayoutBinding<'static>> {
        self.bindings
            .iter()
            .enumerate()
            .map(|(i, binding)| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(i as u32)
                    .descriptor_type(binding.ty)
                    .descriptor_count(1)
                    .stage_flags(binding.stages)
            })
            .collect()
    }

    fn accumulate_pool_sizes(&self, counts: &mut Vec<vk::DescriptorPoolSize>) {
        for binding in &self.bindings {
            if let Some(entry) = counts.iter_mut().find(|c| c.ty == binding.ty) {
                entry.descriptor_count += 1;
            } else {
                counts.push(vk::DescriptorPoolSize {
                    ty: binding.ty,
                    descriptor_count: 1,
                });
            }
        }
    }

    fn write(&mut self, device: &ash::Device) -> Result<()> {
        enum Slot {
            Buffer(usize),
            Image(usize),
        }

        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        let mut slots = Vec::with_capacity(self.bindings.len());
        for binding in &mut self.bindings {
            binding.recorded = binding.source.get();
            match &binding.resource {
                BindingResource::Buffer { sector } => {
                    let range = sector.resolve()?;
                    buffer_infos.push(
                        vk::DescriptorBufferInfo::default()
                            .buffer(range.buffer)
                            .offset(range.offset)
                            .range(range.size),
                    );
                    slots.push(Slot::Buffer(buffer_infos.len() - 1));
                }
                BindingResource::Image {
                    view,
                    sampler,
                    layout,
                } => {
                    image_infos.push(
                        vk::DescriptorImageInfo::default()
                            .sampler(*sampler)
                            .image_view(*view)
                            .image_layout(*layout),
                    );
                    slots.push(Slot::Image(image_infos.len() - 1));
                }
            }
        }

        let writes: Vec<vk::WriteDescriptorSet> = self
            .bindings
            .iter()
            .zip(&slots)
            .enumerate()
            .map(|(i, (binding, slot))| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(i as u32)
                    .descriptor_type(binding.ty);
                match slot {
                    Slot::Buffer(j) => write.buffer_info(std::slice::from_ref(&buffer_infos[*j])),
                    Slot::Image(j) => write.image_info(std::slice::from_ref(&image_infos[*j])),
                }
            })
            .collect();

        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }
        Ok(())
    }
}

/// Tracks descriptor sets, reallocating pools and layouts only when
/// binding counts change and rewriting only dirty sets.
pub struct DescriptorSetManager {
    registry: ResourceRegistry,
    pool: vk::DescriptorPool,
    sets: Vec<Arc<Mutex<DescriptorSetData>>>,
}

impl DescriptorSetManager {
    pub fn new(device: Arc<ash::Device>) -> Self {
        Self {
            registry: ResourceRegistry::new(device),
            pool: vk::DescriptorPool::null(),
            sets: Vec::new(),
        }
    }

    /// Start tracking a new, empty set.
    pub fn new_set(&mut self) -> Arc<Mutex<DescriptorSetData>> {
        let set = Arc::new(Mutex::new(DescriptorSetData::new()));
        self.sets.push(Arc::clone(&set));
        set
    }

    /// Two-pass update.
    ///
    /// Allocation pass: if any tracked set's binding count differs from
    /// its last-allocated layout, all layouts and the pool are destroyed
    /// and every set is reallocated together from one pool sized for all
    /// of them. Reallocating unaffected sets too is deliberate: it keeps
    /// the pool-sizing logic to a single histogram.
    ///
    /// Write pass: every set with a stale binding gets its full write
    /// list rebuilt and issued in one batched call.
    pub fn update(&mut self) -> Result<()> {
        let needs_allocation = self.sets.iter().any(|s| s.lock().needs_allocation());
        if needs_allocation && !self.sets.is_empty() {
            self.registry.destroy_descriptor_pools();
            self.registry.destroy_descriptor_set_layouts();

            let mut pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
            let mut layouts = Vec::with_capacity(self.sets.len());
            for set in &self.sets {
                let mut set = set.lock();
                let bindings = set.layout_bindings();
                let layout = self.registry.make_descriptor_set_layout(&bindings)?;
                set.layout = layout;
                set.layout_binding_count = set.bindings.len();
                set.accumulate_pool_sizes(&mut pool_sizes);
                layouts.push(layout);
                // A freshly allocated set holds garbage whatever the
                // version bookkeeping says; force the write pass.
                for binding in &mut set.bindings {
                    binding.recorded = NEVER_WRITTEN;
                }
            }

            self.pool = self
                .registry
                .make_descriptor_pool(self.sets.len() as u32, &pool_sizes)?;
            let handles = self.registry.make_descriptor_sets(self.pool, &layouts)?;
            for (set, handle) in self.sets.iter().zip(handles) {
                set.lock().set = handle;
            }
            tracing::trace!(sets = self.sets.len(), "reallocated descriptor sets");
        }

        let device = Arc::clone(self.registry.device());
        for set in &self.sets {
            let mut set = set.lock();
            if set.needs_rewrite() {
                set.write(&device)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn rewrite_gated_on_source_counter() {
        let mut set = DescriptorSetData::new();
        let source = SharedCounter::new(0);
        set.add_image(
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::ImageView::null(),
            vk::Sampler::null(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            source.clone(),
            vk::ShaderStageFlags::FRAGMENT,
        );

        // Never written: dirty.
        assert!(set.needs_rewrite());

        // Simulate the write pass stamping the source version.
        set.bindings[0].recorded = source.get();
        assert!(!set.needs_rewrite());

        // A submission on the source makes it dirty again, exactly once.
        source.increment();
        assert!(set.needs_rewrite());
        set.bindings[0].recorded = source.get();
        assert!(!set.needs_rewrite());
    }

    #[test]
    fn allocation_gated_on_binding_count() {
        let mut set = DescriptorSetData::new();
        let source = SharedCounter::new(0);

        // No set handle yet.
        assert!(set.needs_allocation());

        set.add_image(
            vk::DescriptorType::STORAGE_IMAGE,
            vk::ImageView::null(),
            vk::Sampler::null(),
            vk::ImageLayout::GENERAL,
            source.clone(),
            vk::ShaderStageFlags::COMPUTE,
        );
        // Simulate an allocation pass.
        set.set = vk::DescriptorSet::from_raw(1);
        set.layout_binding_count = set.binding_count();
        assert!(!set.needs_allocation());

        // Adding a binding invalidates the layout.
        set.add_image(
            vk::DescriptorType::STORAGE_IMAGE,
            vk::ImageView::null(),
            vk::Sampler::null(),
            vk::ImageLayout::GENERAL,
            source,
            vk::ShaderStageFlags::COMPUTE,
        );
        assert!(set.needs_allocation());
    }

    #[test]
    fn pool_size_histogram_accumulates_types() {
        let mut set = DescriptorSetData::new();
        let source = SharedCounter::new(0);
        for _ in 0..3 {
            set.add_image(
                vk::DescriptorType::STORAGE_IMAGE,
                vk::ImageView::null(),
                vk::Sampler::null(),
                vk::ImageLayout::GENERAL,
                source.clone(),
                vk::ShaderStageFlags::COMPUTE,
            );
        }
        set.add_image(
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::ImageView::null(),
            vk::Sampler::null(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            source,
            vk::ShaderStageFlags::FRAGMENT,
        );

        let mut sizes = Vec::new();
        set.accumulate_pool_sizes(&mut sizes);

        assert_eq!(sizes.len(), 2);
        let storage = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::STORAGE_IMAGE)
            .map(|s| s.descriptor_count);
        let sampled = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .map(|s| s.descriptor_count);
        assert_eq!(storage, Some(3));
        assert_eq!(sampled, Some(1));
    }
}
