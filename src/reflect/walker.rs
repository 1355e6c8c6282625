//! Flattening walk over a reflected type-layout tree.

use crate::binding::{Binding, ResourceKind};
use crate::descriptor::DescriptorLayoutBuilder;
use crate::reflect::{BindingRangeKind, ResourceCategory, TypeKind, VariableNode};
use crate::MAX_BOUND_SETS;
use ash::vk;
use foldhash::{HashMap, HashSet};
use log::{debug, warn};

/// Structural problems in the reflected tree that make a stage unusable.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReflectError {
    #[error(
        "binding `{name}` addresses descriptor set {set}, only {max} simultaneously bound sets \
         are supported"
    )]
    SetIndexOutOfRange { name: String, set: u32, max: usize },
}

/// Everything the walk discovers about one shader stage.
#[derive(Debug)]
pub struct StageReflection {
    pub stage: vk::ShaderStageFlags,
    /// Dotted parameter path to flat binding record.
    pub bindings: HashMap<String, Binding>,
    /// Descriptor declarations per set index, empty sets included.
    pub set_builders: [DescriptorLayoutBuilder; MAX_BOUND_SETS],
    /// Byte size of each push-constant block, indexed by declaration order.
    /// Binding offsets have already been rebased into the concatenated
    /// offset space these sizes imply.
    pub push_range_sizes: Vec<u32>,
    /// Aggregated uniform footprint per `(set, slot)`: the largest
    /// `byte_offset + byte_size` any uniform binding under that slot reaches.
    pub uniform_block_sizes: HashMap<(u32, u32), u64>,
}

impl StageReflection {
    /// Total bytes of push-constant data across every declared range.
    pub fn push_constant_size(&self) -> u32 {
        self.push_range_sizes.iter().sum()
    }
}

/// One uniform block's placement inside the packed backing arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UniformRegion {
    pub set: u32,
    pub slot: u32,
    pub size: u64,
    pub offset: u64,
}

/// Packs aggregated uniform block sizes into a single arena.
///
/// Regions are placed in ascending `(set, slot)` order, each aligned to
/// `alignment` (the device's minimum uniform-buffer offset alignment), so the
/// resulting layout is reproducible. Returns the regions and the total arena
/// size.
pub(crate) fn pack_uniform_regions(
    block_sizes: &HashMap<(u32, u32), u64>,
    alignment: u64,
) -> (Vec<UniformRegion>, u64) {
    let mut keys: Vec<(u32, u32)> = block_sizes.keys().copied().collect();
    keys.sort_unstable();

    let mut regions = Vec::with_capacity(keys.len());
    let mut offset = 0u64;
    for (set, slot) in keys {
        if alignment != 0 {
            offset = (offset + alignment - 1) & !(alignment - 1);
        }
        let size = block_sizes[&(set, slot)];
        regions.push(UniformRegion {
            set,
            slot,
            size,
            offset,
        });
        offset += size;
    }
    (regions, offset)
}

/// The resolved absolute location of one variable, accumulated over its path.
#[derive(Clone, Copy, Debug, Default)]
struct ResolvedSlot {
    set: u32,
    slot: u32,
    uniform_offset: u64,
    push_range: u32,
    is_push_constant: bool,
}

/// Sums the path's per-category offset contributions, leaf to root.
///
/// Uniform-category variables need the implicit constant-buffer handling: the
/// innermost enclosing constant buffer *sets* the `(set, slot)` address (its
/// own location), ancestors above it keep adding to it, and descendants below
/// it contribute uniform bytes only. A constant buffer whose contents are
/// push-constant laid out switches the location over to a push-constant range
/// index instead.
fn resolve_slot(path: &[&VariableNode], category: ResourceCategory) -> ResolvedSlot {
    let mut slot = ResolvedSlot::default();

    if category == ResourceCategory::Uniform {
        let mut found_cb = false;
        for v in path.iter().rev() {
            slot.uniform_offset += v.offsets.uniform;

            if found_cb {
                slot.set += v.offsets.binding_space + v.offsets.sub_element_space;
                slot.slot += v.offsets.descriptor_slot;

                if slot.is_push_constant {
                    slot.push_range += v.offsets.push_constant_range;
                }
            } else if matches!(v.ty.kind, TypeKind::ConstantBuffer { .. }) {
                slot.set = v.offsets.binding_space + v.offsets.sub_element_space;
                slot.slot = v.offsets.descriptor_slot;

                found_cb = true;
                if v.ty.push_constant_size > 0 {
                    slot.push_range = v.offsets.push_constant_range;
                    slot.is_push_constant = true;
                }
            }
        }
    } else {
        for v in path.iter().rev() {
            slot.set += v.offsets.binding_space + v.offsets.sub_element_space;
            slot.slot += v.offsets.descriptor_slot;
            slot.push_range += v.offsets.push_constant_range;
        }
    }

    slot
}

/// Joins the named nodes on the path into the dotted parameter path.
/// Anonymous nodes contribute nothing, so a wrapper's contents keep the
/// wrapper variable's name as their prefix.
fn path_name(path: &[&VariableNode]) -> String {
    let mut name = String::new();
    for v in path {
        if let Some(n) = &v.name {
            if !name.is_empty() {
                name.push('.');
            }
            name.push_str(n);
        }
    }
    name
}

#[derive(Default)]
struct WalkState {
    bindings: HashMap<String, Binding>,
    push_range_sizes: Vec<u32>,
}

fn visit<'a>(node: &'a VariableNode, path: &mut Vec<&'a VariableNode>, out: &mut WalkState) {
    path.push(node);

    let slot = resolve_slot(path, node.category);

    if let TypeKind::Struct { fields } = &node.ty.kind {
        for field in fields {
            visit(field, path, out);
        }
    }
    match &node.ty.kind {
        TypeKind::ConstantBuffer { element } | TypeKind::ParameterBlock { element } => {
            visit(element, path, out);
        }
        _ => {}
    }

    let skipped_category = matches!(
        node.category,
        ResourceCategory::None | ResourceCategory::RayPayload | ResourceCategory::HitAttributes
    );
    let addressable = !skipped_category
        && !matches!(node.ty.kind, TypeKind::ParameterBlock { .. })
        && node.ty.field_count() == 0;

    if addressable {
        let name = path_name(path);
        // A fully anonymous path has no addressable name; drop it quietly.
        if !name.is_empty() {
            emit(node, &name, slot, out);
        }
    }

    path.pop();
}

fn emit(node: &VariableNode, name: &str, slot: ResolvedSlot, out: &mut WalkState) {
    let range_kind = match &node.ty.kind {
        TypeKind::Resource { binding, .. } => *binding,
        // An array of opaque resources occupies that resource's range kind.
        TypeKind::Array { element, .. } => match &element.kind {
            TypeKind::Resource { binding, .. } => *binding,
            _ => BindingRangeKind::ConstantBuffer,
        },
        // Uniform leaves and constant-buffer wrappers both land in the
        // enclosing buffer's descriptor range.
        _ => BindingRangeKind::ConstantBuffer,
    };

    // A push-constant block contributes a range size, not a binding of its
    // own; its contents were already emitted as push-constant leaves.
    let is_push_block =
        matches!(node.ty.kind, TypeKind::ConstantBuffer { .. }) && node.ty.push_constant_size > 0;
    if is_push_block {
        let range = slot.push_range as usize;
        if out.push_range_sizes.len() <= range {
            out.push_range_sizes.resize(range + 1, 0);
        }
        out.push_range_sizes[range] = node.ty.push_constant_size as u32;
        return;
    }

    let (element_count, element_stride, is_variable_sized_array) = match &node.ty.kind {
        TypeKind::Array {
            element_count,
            element_stride,
            ..
        } => (*element_count, *element_stride, *element_count == 0),
        TypeKind::Resource { element_stride, .. } => (0, *element_stride, false),
        _ => (0, 0, false),
    };

    let resource_kind = if slot.is_push_constant {
        ResourceKind::PushConstant
    } else {
        range_kind.resource_kind()
    };

    out.bindings.insert(
        name.to_owned(),
        Binding {
            name: name.to_owned(),
            set: slot.set,
            slot: slot.slot,
            byte_offset: slot.uniform_offset,
            byte_size: node.ty.uniform_size,
            element_stride,
            element_count,
            resource_kind,
            is_push_constant: slot.is_push_constant,
            is_variable_sized_array,
            push_range: slot.push_range,
        },
    );
}

/// Walks the root variables of one stage and produces its flat reflection.
///
/// `roots` are the stage's top-level parameter scopes (in the usual case the
/// global scope followed by the entry-point scope). The walk itself touches
/// no device state; errors are structural only.
pub fn walk_stage(
    stage: vk::ShaderStageFlags,
    roots: &[VariableNode],
) -> Result<StageReflection, ReflectError> {
    let mut state = WalkState::default();
    let mut path = Vec::new();
    for root in roots {
        visit(root, &mut path, &mut state);
    }

    // Rebase every push-constant leaf from its block-local offset into the
    // concatenated offset space formed by the declaration-ordered ranges.
    for binding in state.bindings.values_mut() {
        if !binding.is_push_constant {
            continue;
        }
        let base: u32 = state
            .push_range_sizes
            .iter()
            .take(binding.push_range as usize)
            .sum();
        binding.byte_offset += u64::from(base);
    }

    let mut set_builders: [DescriptorLayoutBuilder; MAX_BOUND_SETS] = Default::default();
    let mut seen: [HashSet<u32>; MAX_BOUND_SETS] = Default::default();
    let mut uniform_block_sizes = HashMap::default();

    for binding in state.bindings.values() {
        if binding.is_push_constant {
            continue;
        }

        let set = binding.set as usize;
        if set >= MAX_BOUND_SETS {
            return Err(ReflectError::SetIndexOutOfRange {
                name: binding.name.clone(),
                set: binding.set,
                max: MAX_BOUND_SETS,
            });
        }

        if binding.resource_kind == ResourceKind::UniformBuffer {
            let entry = uniform_block_sizes
                .entry((binding.set, binding.slot))
                .or_insert(0u64);
            *entry = (*entry).max(binding.byte_offset + binding.byte_size);
        }

        if seen[set].insert(binding.slot) {
            match binding.resource_kind.descriptor_type() {
                Some(ty) => {
                    let count = binding.element_count.max(1) as u32;
                    set_builders[set].add_binding(binding.slot, ty, count);
                }
                None => warn!(
                    "parameter `{}` has no descriptor representation ({}), it cannot be bound",
                    binding.name, binding.resource_kind
                ),
            }
        }
    }

    for binding in state.bindings.values() {
        if binding.is_push_constant {
            debug!(
                "{}: offset:{} size:{} stride:{} count:{} push constant (range {})",
                binding.name,
                binding.byte_offset,
                binding.byte_size,
                binding.element_stride,
                binding.element_count,
                binding.push_range,
            );
        } else {
            debug!(
                "{}: set:{} slot:{} offset:{} size:{} stride:{} count:{} {} variable sized:{}",
                binding.name,
                binding.set,
                binding.slot,
                binding.byte_offset,
                binding.byte_size,
                binding.element_stride,
                binding.element_count,
                binding.resource_kind,
                binding.is_variable_sized_array,
            );
        }
    }

    Ok(StageReflection {
        stage,
        bindings: state.bindings,
        set_builders,
        push_range_sizes: state.push_range_sizes,
        uniform_block_sizes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::TypeLayout;

    fn constant_buffer(
        name: &str,
        slot: u32,
        size: u64,
        fields: Vec<VariableNode>,
    ) -> VariableNode {
        let contents =
            VariableNode::anonymous(ResourceCategory::Uniform, TypeLayout::structure(size, fields));
        VariableNode::new(
            name,
            ResourceCategory::DescriptorSlot,
            TypeLayout::constant_buffer(contents),
        )
        .at_slot(slot)
    }

    fn globals(fields: Vec<VariableNode>) -> VariableNode {
        VariableNode::anonymous(ResourceCategory::Mixed, TypeLayout::structure(0, fields))
    }

    #[test]
    fn nested_struct_field_gets_dotted_name_and_offset() {
        let _ = env_logger::builder().is_test(true).try_init();
        let camera = constant_buffer(
            "camera",
            0,
            80,
            vec![
                VariableNode::new("viewProj", ResourceCategory::Uniform, TypeLayout::data(64))
                    .at_uniform_offset(0),
                VariableNode::new("exposure", ResourceCategory::Uniform, TypeLayout::data(4))
                    .at_uniform_offset(64),
            ],
        );

        let refl = walk_stage(vk::ShaderStageFlags::VERTEX, &[globals(vec![camera])]).unwrap();

        let vp = &refl.bindings["camera.viewProj"];
        assert_eq!((vp.set, vp.slot), (0, 0));
        assert_eq!(vp.byte_offset, 0);
        assert_eq!(vp.byte_size, 64);
        assert_eq!(vp.resource_kind, ResourceKind::UniformBuffer);
        assert!(!vp.is_push_constant);

        let exposure = &refl.bindings["camera.exposure"];
        assert_eq!(exposure.byte_offset, 64);

        // The wrapper itself is addressable too, with no uniform footprint.
        let cb = &refl.bindings["camera"];
        assert_eq!((cb.set, cb.slot, cb.byte_size), (0, 0, 0));

        // Aggregation covers the farthest-reaching field.
        assert_eq!(refl.uniform_block_sizes[&(0, 0)], 68);
    }

    #[test]
    fn sibling_buffers_do_not_share_aggregation() {
        let a = constant_buffer(
            "a",
            0,
            16,
            vec![VariableNode::new(
                "x",
                ResourceCategory::Uniform,
                TypeLayout::data(16),
            )],
        );
        let b = constant_buffer(
            "b",
            1,
            32,
            vec![VariableNode::new(
                "y",
                ResourceCategory::Uniform,
                TypeLayout::data(32),
            )],
        );

        let refl = walk_stage(vk::ShaderStageFlags::FRAGMENT, &[globals(vec![a, b])]).unwrap();

        assert_eq!(refl.uniform_block_sizes[&(0, 0)], 16);
        assert_eq!(refl.uniform_block_sizes[&(0, 1)], 32);
        assert_eq!(refl.set_builders[0].len(), 2);
    }

    #[test]
    fn push_constant_ranges_concatenate_in_declaration_order() {
        let first = VariableNode::new(
            "frame",
            ResourceCategory::DescriptorSlot,
            TypeLayout::push_constant_buffer(VariableNode::anonymous(
                ResourceCategory::Uniform,
                TypeLayout::structure(
                    16,
                    vec![VariableNode::new(
                        "index",
                        ResourceCategory::Uniform,
                        TypeLayout::data(4),
                    )],
                ),
            )),
        );
        let second = VariableNode::new(
            "object",
            ResourceCategory::DescriptorSlot,
            TypeLayout::push_constant_buffer(VariableNode::anonymous(
                ResourceCategory::Uniform,
                TypeLayout::structure(
                    8,
                    vec![VariableNode::new(
                        "id",
                        ResourceCategory::Uniform,
                        TypeLayout::data(4),
                    )
                    .at_uniform_offset(4)],
                ),
            )),
        )
        .at_push_constant_range(1);

        let refl =
            walk_stage(vk::ShaderStageFlags::VERTEX, &[globals(vec![first, second])]).unwrap();

        assert_eq!(refl.push_range_sizes, vec![16, 8]);
        assert_eq!(refl.push_constant_size(), 24);

        let index = &refl.bindings["frame.index"];
        assert!(index.is_push_constant);
        assert_eq!(index.resource_kind, ResourceKind::PushConstant);
        assert_eq!(index.byte_offset, 0);

        // The second range starts after the first, so its leaf's block-local
        // offset of 4 lands at 20 pipeline-wide.
        let id = &refl.bindings["object.id"];
        assert_eq!(id.byte_offset, 20);
        assert_eq!(id.push_range, 1);

        // Push blocks never occupy descriptor slots.
        assert!(refl.set_builders.iter().all(|b| b.is_empty()));
    }

    #[test]
    fn array_leaf_records_count_and_stride() {
        let lights = constant_buffer(
            "scene",
            0,
            256,
            vec![VariableNode::new(
                "lights",
                ResourceCategory::Uniform,
                TypeLayout::array(TypeLayout::data(12), 16, 16),
            )],
        );

        let refl = walk_stage(vk::ShaderStageFlags::FRAGMENT, &[globals(vec![lights])]).unwrap();

        let b = &refl.bindings["scene.lights"];
        assert_eq!(b.element_count, 16);
        assert_eq!(b.element_stride, 16);
        assert_eq!(b.byte_size, 256);
        assert!(!b.is_variable_sized_array);
    }

    #[test]
    fn zero_length_array_is_variable_sized() {
        let root = globals(vec![VariableNode::new(
            "instances",
            ResourceCategory::DescriptorSlot,
            TypeLayout::structured_buffer(false, 48),
        )]);
        let arr = globals(vec![VariableNode::new(
            "weights",
            ResourceCategory::Uniform,
            TypeLayout::array(TypeLayout::data(4), 0, 4),
        )]);

        let refl = walk_stage(vk::ShaderStageFlags::COMPUTE, &[root, arr]).unwrap();
        assert!(refl.bindings["weights"].is_variable_sized_array);
        assert!(!refl.bindings["instances"].is_variable_sized_array);
        assert_eq!(refl.bindings["instances"].element_stride, 48);
        assert_eq!(
            refl.bindings["instances"].resource_kind,
            ResourceKind::StorageBuffer
        );
    }

    #[test]
    fn parameter_block_contents_land_in_their_own_set() {
        let contents = VariableNode::anonymous(
            ResourceCategory::Mixed,
            TypeLayout::structure(
                0,
                vec![VariableNode::new(
                    "albedo",
                    ResourceCategory::DescriptorSlot,
                    TypeLayout::resource(BindingRangeKind::CombinedTextureSampler),
                )],
            ),
        );
        let block = VariableNode::new(
            "material",
            ResourceCategory::DescriptorSlot,
            TypeLayout::parameter_block(contents),
        )
        .at_sub_element_space(2);

        let refl = walk_stage(vk::ShaderStageFlags::FRAGMENT, &[globals(vec![block])]).unwrap();

        // The block wrapper itself emits nothing, only its contents do.
        assert!(!refl.bindings.contains_key("material"));
        let albedo = &refl.bindings["material.albedo"];
        assert_eq!((albedo.set, albedo.slot), (2, 0));
        assert_eq!(albedo.resource_kind, ResourceKind::SampledImage);
        assert!(!refl.set_builders[2].is_empty());
    }

    #[test]
    fn fully_anonymous_leaf_is_dropped_without_error() {
        let root = globals(vec![VariableNode::anonymous(
            ResourceCategory::Uniform,
            TypeLayout::data(4),
        )]);
        let refl = walk_stage(vk::ShaderStageFlags::VERTEX, &[root]).unwrap();
        assert!(refl.bindings.is_empty());
    }

    #[test]
    fn set_index_beyond_bound_is_rejected() {
        let root = globals(vec![VariableNode::new(
            "tex",
            ResourceCategory::DescriptorSlot,
            TypeLayout::resource(BindingRangeKind::Texture),
        )
        .in_space(7)]);

        let err = walk_stage(vk::ShaderStageFlags::FRAGMENT, &[root]).unwrap_err();
        assert_eq!(
            err,
            ReflectError::SetIndexOutOfRange {
                name: "tex".into(),
                set: 7,
                max: MAX_BOUND_SETS,
            }
        );
    }

    #[test]
    fn uniform_regions_pack_in_slot_order_with_alignment() {
        let mut sizes = HashMap::default();
        sizes.insert((0u32, 1u32), 68u64);
        sizes.insert((0, 0), 16);
        sizes.insert((1, 0), 4);

        let (regions, total) = pack_uniform_regions(&sizes, 64);

        assert_eq!(
            regions,
            vec![
                UniformRegion { set: 0, slot: 0, size: 16, offset: 0 },
                UniformRegion { set: 0, slot: 1, size: 68, offset: 64 },
                UniformRegion { set: 1, slot: 0, size: 4, offset: 192 },
            ]
        );
        assert_eq!(total, 196);
    }
}
