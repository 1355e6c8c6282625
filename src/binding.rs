//! The flat record a reflected shader parameter is reduced to.

use ash::vk;
use std::fmt;

/// The class of resource a [`Binding`] refers to.
///
/// This is recorded during reflection and checked again on every
/// [`set_parameter`](crate::pipeline::Pipeline::set_parameter) call, so that a
/// caller binding, say, an image to a storage-buffer slot gets a warning
/// instead of corrupting a descriptor table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Sampler,
    SampledImage,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
    AccelerationStructure,
    PushConstant,
    /// Reflected cleanly but not representable by this layer (for example
    /// texel buffers). Kept in the table so the name still resolves, but every
    /// update against it is rejected.
    Unsupported,
}

impl ResourceKind {
    /// The descriptor type used when writing this binding into a descriptor
    /// table. `None` for push constants and unsupported kinds, which never
    /// occupy a table slot.
    ///
    /// Sampled images are bound as combined image-samplers: images are always
    /// sampled through the context's default sampler unless an update supplies
    /// its own.
    pub fn descriptor_type(self) -> Option<vk::DescriptorType> {
        match self {
            ResourceKind::Sampler => Some(vk::DescriptorType::SAMPLER),
            ResourceKind::SampledImage => Some(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
            ResourceKind::StorageImage => Some(vk::DescriptorType::STORAGE_IMAGE),
            ResourceKind::UniformBuffer => Some(vk::DescriptorType::UNIFORM_BUFFER),
            ResourceKind::StorageBuffer => Some(vk::DescriptorType::STORAGE_BUFFER),
            ResourceKind::AccelerationStructure => {
                Some(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            }
            ResourceKind::PushConstant | ResourceKind::Unsupported => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::Sampler => "sampler",
            ResourceKind::SampledImage => "sampled image",
            ResourceKind::StorageImage => "storage image",
            ResourceKind::UniformBuffer => "uniform buffer",
            ResourceKind::StorageBuffer => "storage buffer",
            ResourceKind::AccelerationStructure => "acceleration structure",
            ResourceKind::PushConstant => "push constant",
            ResourceKind::Unsupported => "unsupported",
        };
        f.write_str(name)
    }
}

/// One named, addressable shader parameter.
///
/// The `name` is the dotted path reconstructed from the nesting of the
/// reflected type tree (`"camera.view_proj"`), unique within a stage. For
/// descriptor-backed bindings, `set`/`slot` address the descriptor table;
/// for uniform data they additionally locate the enclosing uniform block whose
/// backing-arena region `byte_offset` is relative to. For push constants,
/// `set` and `slot` are meaningless and `push_range` identifies the
/// declaration-order range the offset is relative to (until the pipeline merge
/// rebases offsets into the concatenated pipeline offset space).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Binding {
    pub name: String,
    pub set: u32,
    pub slot: u32,
    pub byte_offset: u64,
    pub byte_size: u64,
    /// Spacing between array elements in the backing store. Differs from the
    /// natural element size when GPU alignment rules pad each element; zero
    /// for non-arrays.
    pub element_stride: u64,
    pub element_count: u64,
    pub resource_kind: ResourceKind,
    pub is_push_constant: bool,
    /// Runtime-sized array (declared with no length). Excluded from
    /// fixed-size validation; size mismatches against it are warnings only.
    pub is_variable_sized_array: bool,
    /// Shader-local push-constant range index; only meaningful while
    /// `is_push_constant` is set.
    pub push_range: u32,
}

impl Binding {
    /// Whether a host-memory write (rather than a descriptor-table update)
    /// services updates to this binding.
    pub fn is_host_backed(&self) -> bool {
        self.is_push_constant || self.resource_kind == ResourceKind::UniformBuffer
    }
}
