//! The externally supplied type-layout tree and the walk that flattens it.
//!
//! A shader compiler front end (out of tree) lowers its own reflection API
//! into this crate's [`VariableNode`] tree: arbitrary nesting of structs,
//! arrays, constant-buffer wrappers, parameter blocks and push-constant
//! blocks, with per-category offsets attached to every variable. The tree is
//! plain owned data, so tests can hand-build layouts without a compiler or a
//! device present.
//!
//! [`walk_stage`] consumes a tree and produces the flat
//! [`StageReflection`](walker::StageReflection) table the rest of the crate
//! operates on.

mod walker;

pub use walker::{walk_stage, ReflectError, StageReflection, UniformRegion};

pub(crate) use walker::pack_uniform_regions;

use crate::binding::ResourceKind;

/// Which register category a variable consumes.
///
/// Determines whether a leaf is addressable at all: variables in the `None`,
/// `RayPayload` and `HitAttributes` categories are inter-stage plumbing, not
/// externally settable parameters, and are skipped by the walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceCategory {
    None,
    /// Ordinary uniform bytes inside a constant buffer or push-constant block.
    Uniform,
    /// A descriptor-table slot (textures, samplers, buffers, acceleration
    /// structures, and the implicit slot of a constant-buffer wrapper).
    DescriptorSlot,
    /// Ray-tracing payload; stage-internal.
    RayPayload,
    /// Ray-tracing hit attributes; stage-internal.
    HitAttributes,
    /// Wrappers and structs that span several categories.
    Mixed,
}

/// Offsets a variable contributes in each register category.
///
/// Offsets are *additive*: the absolute location of a leaf is the sum of the
/// contributions of every node on the path from the tree root down to it.
/// Nested containers therefore never overwrite an accumulated offset, they
/// only add to it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CategoryOffsets {
    /// Byte offset within the enclosing uniform data (constant buffer or
    /// push-constant block).
    pub uniform: u64,
    /// Descriptor slot (binding index) offset within the addressed set.
    pub descriptor_slot: u32,
    /// Register space (descriptor-set index) this variable is addressed in.
    pub binding_space: u32,
    /// Additional set index introduced when an enclosing parameter block
    /// opened a fresh register space.
    pub sub_element_space: u32,
    /// Push-constant range index offset (a shader may declare several
    /// push-constant blocks; they are numbered in declaration order).
    pub push_constant_range: u32,
}

/// The kind of descriptor range an opaque resource leaf occupies.
///
/// Mirrors the binding-range classification of the compiler front end;
/// collapsed to a [`ResourceKind`] when the binding table is emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindingRangeKind {
    Sampler,
    Texture,
    CombinedTextureSampler,
    MutableTexture,
    TypedBuffer,
    MutableTypedBuffer,
    RawBuffer,
    MutableRawBuffer,
    ConstantBuffer,
    PushConstant,
    AccelerationStructure,
    Unknown,
}

impl BindingRangeKind {
    pub(crate) fn resource_kind(self) -> ResourceKind {
        match self {
            BindingRangeKind::Sampler => ResourceKind::Sampler,
            BindingRangeKind::Texture | BindingRangeKind::CombinedTextureSampler => {
                ResourceKind::SampledImage
            }
            BindingRangeKind::MutableTexture => ResourceKind::StorageImage,
            BindingRangeKind::RawBuffer | BindingRangeKind::MutableRawBuffer => {
                ResourceKind::StorageBuffer
            }
            BindingRangeKind::ConstantBuffer => ResourceKind::UniformBuffer,
            BindingRangeKind::AccelerationStructure => ResourceKind::AccelerationStructure,
            BindingRangeKind::PushConstant => ResourceKind::PushConstant,
            BindingRangeKind::TypedBuffer
            | BindingRangeKind::MutableTypedBuffer
            | BindingRangeKind::Unknown => ResourceKind::Unsupported,
        }
    }
}

/// Layout of one reflected type.
#[derive(Clone, Debug)]
pub struct TypeLayout {
    pub kind: TypeKind,
    /// Size of this type in the uniform category, including struct padding.
    /// Zero for opaque resources.
    pub uniform_size: u64,
    /// Nonzero when this type's contents are laid out in push-constant space
    /// rather than a backing buffer (the marker a push-constant wrapper
    /// carries).
    pub push_constant_size: u64,
}

impl TypeLayout {
    /// A scalar/vector/matrix leaf occupying `uniform_size` bytes.
    pub fn data(uniform_size: u64) -> Self {
        TypeLayout {
            kind: TypeKind::Data,
            uniform_size,
            push_constant_size: 0,
        }
    }

    /// An opaque resource occupying one descriptor range.
    pub fn resource(binding: BindingRangeKind) -> Self {
        TypeLayout {
            kind: TypeKind::Resource {
                binding,
                element_stride: 0,
            },
            uniform_size: 0,
            push_constant_size: 0,
        }
    }

    /// A structured (storage) buffer of elements with the given stride.
    pub fn structured_buffer(mutable: bool, element_stride: u64) -> Self {
        let binding = if mutable {
            BindingRangeKind::MutableRawBuffer
        } else {
            BindingRangeKind::RawBuffer
        };
        TypeLayout {
            kind: TypeKind::Resource {
                binding,
                element_stride,
            },
            uniform_size: 0,
            push_constant_size: 0,
        }
    }

    /// A struct with the given fields and uniform footprint.
    pub fn structure(uniform_size: u64, fields: Vec<VariableNode>) -> Self {
        TypeLayout {
            kind: TypeKind::Struct { fields },
            uniform_size,
            push_constant_size: 0,
        }
    }

    /// An array of `element_count` elements spaced `element_stride` bytes
    /// apart. An `element_count` of zero marks a runtime-sized array.
    pub fn array(element: TypeLayout, element_count: u64, element_stride: u64) -> Self {
        let uniform_size = element_stride * element_count;
        TypeLayout {
            kind: TypeKind::Array {
                element: Box::new(element),
                element_count,
                element_stride,
            },
            uniform_size,
            push_constant_size: 0,
        }
    }

    /// A constant-buffer wrapper around `element`.
    pub fn constant_buffer(element: VariableNode) -> Self {
        TypeLayout {
            kind: TypeKind::ConstantBuffer {
                element: Box::new(element),
            },
            uniform_size: 0,
            push_constant_size: 0,
        }
    }

    /// A constant buffer whose contents live in push-constant space.
    pub fn push_constant_buffer(element: VariableNode) -> Self {
        let push_constant_size = element.ty.uniform_size;
        TypeLayout {
            kind: TypeKind::ConstantBuffer {
                element: Box::new(element),
            },
            uniform_size: 0,
            push_constant_size,
        }
    }

    /// A parameter block wrapping `element` in its own register space.
    pub fn parameter_block(element: VariableNode) -> Self {
        TypeLayout {
            kind: TypeKind::ParameterBlock {
                element: Box::new(element),
            },
            uniform_size: 0,
            push_constant_size: 0,
        }
    }

    pub(crate) fn field_count(&self) -> usize {
        match &self.kind {
            TypeKind::Struct { fields } => fields.len(),
            _ => 0,
        }
    }
}

/// Structural classification of a [`TypeLayout`].
#[derive(Clone, Debug)]
pub enum TypeKind {
    /// Scalar, vector or matrix leaf.
    Data,
    Struct {
        fields: Vec<VariableNode>,
    },
    Array {
        element: Box<TypeLayout>,
        /// Zero for runtime-sized arrays.
        element_count: u64,
        element_stride: u64,
    },
    /// Constant-buffer wrapper; a push-constant block when the type's
    /// `push_constant_size` is nonzero.
    ConstantBuffer {
        element: Box<VariableNode>,
    },
    /// Like a constant buffer, but introduces a new descriptor-set index for
    /// its contents instead of slots in the parent's set.
    ParameterBlock {
        element: Box<VariableNode>,
    },
    /// Opaque resource: texture, sampler, buffer view, acceleration
    /// structure. `element_stride` is the structured-buffer element stride
    /// where applicable.
    Resource {
        binding: BindingRangeKind,
        element_stride: u64,
    },
}

/// One variable in the reflected layout tree: a name, the category it
/// consumes, its additive offsets, and its type.
#[derive(Clone, Debug)]
pub struct VariableNode {
    /// `None` for anonymous variables. A leaf whose entire path is anonymous
    /// cannot be addressed and is dropped without an error.
    pub name: Option<String>,
    pub category: ResourceCategory,
    pub offsets: CategoryOffsets,
    pub ty: TypeLayout,
}

impl VariableNode {
    pub fn new(name: impl Into<String>, category: ResourceCategory, ty: TypeLayout) -> Self {
        VariableNode {
            name: Some(name.into()),
            category,
            offsets: CategoryOffsets::default(),
            ty,
        }
    }

    pub fn anonymous(category: ResourceCategory, ty: TypeLayout) -> Self {
        VariableNode {
            name: None,
            category,
            offsets: CategoryOffsets::default(),
            ty,
        }
    }

    /// Sets the byte offset this variable contributes in the uniform
    /// category.
    pub fn at_uniform_offset(mut self, offset: u64) -> Self {
        self.offsets.uniform = offset;
        self
    }

    /// Sets the descriptor slot offset this variable contributes.
    pub fn at_slot(mut self, slot: u32) -> Self {
        self.offsets.descriptor_slot = slot;
        self
    }

    /// Sets the register space (set index) this variable is addressed in.
    pub fn in_space(mut self, space: u32) -> Self {
        self.offsets.binding_space = space;
        self
    }

    /// Sets the extra set index contributed by an enclosing parameter block.
    pub fn at_sub_element_space(mut self, space: u32) -> Self {
        self.offsets.sub_element_space = space;
        self
    }

    /// Sets the push-constant range index offset.
    pub fn at_push_constant_range(mut self, range: u32) -> Self {
        self.offsets.push_constant_range = range;
        self
    }
}
