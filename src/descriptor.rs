//! Descriptor-set layout declarations and the pool they are allocated from.

use ash::vk;
use log::error;
use smallvec::SmallVec;

/// One declared descriptor range: a slot within a set, the descriptor type
/// occupying it, and the array count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorBindingDesc {
    pub slot: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
}

/// Accumulates the descriptor declarations of one set index.
///
/// Builders are filled per stage during reflection and merged per pipeline.
/// Slot collisions follow a relaxed policy: an agreeing re-declaration (same
/// type and count, as when two stages read the same buffer) is a no-op, a
/// disagreeing one is logged and the first declaration kept.
#[derive(Clone, Debug, Default)]
pub struct DescriptorLayoutBuilder {
    entries: SmallVec<[DescriptorBindingDesc; 8]>,
}

impl DescriptorLayoutBuilder {
    pub fn add_binding(&mut self, slot: u32, descriptor_type: vk::DescriptorType, count: u32) {
        if let Some(existing) = self.entries.iter().find(|e| e.slot == slot) {
            if existing.descriptor_type != descriptor_type || existing.count != count {
                error!(
                    "slot {slot} declared as {:?} x{} and {descriptor_type:?} x{count}, \
                     keeping the first declaration",
                    existing.descriptor_type, existing.count,
                );
            }
            return;
        }
        self.entries.push(DescriptorBindingDesc {
            slot,
            descriptor_type,
            count,
        });
    }

    /// Folds another builder's declarations into this one, slot by slot,
    /// under the same collision policy as [`add_binding`](Self::add_binding).
    pub fn merge(&mut self, other: &DescriptorLayoutBuilder) {
        for e in &other.entries {
            self.add_binding(e.slot, e.descriptor_type, e.count);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Declarations in ascending slot order.
    pub fn entries(&self) -> Vec<DescriptorBindingDesc> {
        let mut entries: Vec<_> = self.entries.iter().copied().collect();
        entries.sort_unstable_by_key(|e| e.slot);
        entries
    }

    /// Creates the Vulkan layout object, with every range visible to
    /// `stage_flags`.
    ///
    /// # Safety
    ///
    /// `device` must outlive the returned layout.
    pub unsafe fn build(
        &self,
        device: &ash::Device,
        stage_flags: vk::ShaderStageFlags,
    ) -> Result<DescriptorLayout, vk::Result> {
        let entries = self.entries();
        let bindings: SmallVec<[vk::DescriptorSetLayoutBinding<'_>; 8]> = entries
            .iter()
            .map(|e| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(e.slot)
                    .descriptor_type(e.descriptor_type)
                    .descriptor_count(e.count)
                    .stage_flags(stage_flags)
            })
            .collect();

        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let handle = device.create_descriptor_set_layout(&create_info, None)?;

        Ok(DescriptorLayout {
            handle,
            device: device.clone(),
            entries,
        })
    }
}

/// An immutable descriptor-set layout, built once per pipeline and shared
/// read-only across its frame slots.
pub struct DescriptorLayout {
    handle: vk::DescriptorSetLayout,
    device: ash::Device,
    entries: Vec<DescriptorBindingDesc>,
}

impl DescriptorLayout {
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn entries(&self) -> &[DescriptorBindingDesc] {
        &self.entries
    }
}

impl Drop for DescriptorLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.handle, None);
        }
    }
}

/// Pool capacity, fixed at context creation.
#[derive(Clone, Copy, Debug)]
pub struct PoolCapacity {
    pub max_sets: u32,
    /// Descriptor count reserved per supported descriptor type.
    pub descriptors_per_type: u32,
}

impl Default for PoolCapacity {
    fn default() -> Self {
        PoolCapacity {
            max_sets: 1024,
            descriptors_per_type: 65536,
        }
    }
}

/// A fixed-capacity descriptor pool. Sets are allocated for the lifetime of
/// their pipeline and freed when the pipeline is destroyed; exhaustion is a
/// fatal configuration error.
pub struct DescriptorPool {
    handle: vk::DescriptorPool,
    device: ash::Device,
}

impl DescriptorPool {
    /// # Safety
    ///
    /// `device` must outlive the returned pool.
    pub unsafe fn new(device: &ash::Device, capacity: PoolCapacity) -> Result<Self, vk::Result> {
        let sizes = [
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            vk::DescriptorType::SAMPLER,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        ]
        .map(|ty| {
            vk::DescriptorPoolSize::default()
                .ty(ty)
                .descriptor_count(capacity.descriptors_per_type)
        });

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(capacity.max_sets)
            .pool_sizes(&sizes);
        let handle = device.create_descriptor_pool(&create_info, None)?;

        Ok(DescriptorPool {
            handle,
            device: device.clone(),
        })
    }

    /// Allocates one descriptor set per element of `layouts`.
    ///
    /// # Safety
    ///
    /// The layouts must belong to the same device as this pool.
    pub unsafe fn allocate(
        &mut self,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.handle)
            .set_layouts(layouts);
        self.device.allocate_descriptor_sets(&alloc_info)
    }

    /// Returns sets to the pool when their pipeline is destroyed.
    ///
    /// # Safety
    ///
    /// The sets must have been allocated from this pool and must not be in
    /// use by pending GPU work.
    pub unsafe fn free(&mut self, sets: &[vk::DescriptorSet]) {
        if !sets.is_empty() {
            let _ = self.device.free_descriptor_sets(self.handle, sets);
        }
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_pool(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_come_back_in_slot_order() {
        let mut builder = DescriptorLayoutBuilder::default();
        builder.add_binding(3, vk::DescriptorType::STORAGE_BUFFER, 1);
        builder.add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, 1);
        builder.add_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4);

        let slots: Vec<u32> = builder.entries().iter().map(|e| e.slot).collect();
        assert_eq!(slots, vec![0, 1, 3]);
    }

    #[test]
    fn agreeing_redeclaration_is_deduplicated() {
        let mut builder = DescriptorLayoutBuilder::default();
        builder.add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, 1);
        builder.add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, 1);
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn conflicting_redeclaration_keeps_first() {
        let mut builder = DescriptorLayoutBuilder::default();
        builder.add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, 1);
        builder.add_binding(0, vk::DescriptorType::STORAGE_BUFFER, 1);

        let entries = builder.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
    }

    #[test]
    fn merge_unions_distinct_slots() {
        let mut vs = DescriptorLayoutBuilder::default();
        vs.add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, 1);

        let mut fs = DescriptorLayoutBuilder::default();
        fs.add_binding(0, vk::DescriptorType::UNIFORM_BUFFER, 1);
        fs.add_binding(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1);

        vs.merge(&fs);
        assert_eq!(vs.len(), 2);
    }
}
