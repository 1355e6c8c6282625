//! Pure union of per-stage reflection into one pipeline-wide layout.
//!
//! Everything here runs before any GPU object exists, so configuration
//! errors (missing ray-tracing roles, conflicting push-constant blocks) are
//! caught while there is still nothing to clean up.

use crate::binding::Binding;
use crate::context::AllocError;
use crate::descriptor::DescriptorLayoutBuilder;
use crate::reflect::{pack_uniform_regions, StageReflection, UniformRegion};
use crate::shader::StageKind;
use crate::MAX_BOUND_SETS;
use ash::vk;
use foldhash::HashMap;
use log::warn;
use smallvec::SmallVec;

/// Fatal pipeline assembly errors.
#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error("ray-tracing pipeline is missing its {role} stage")]
    MissingStage { role: StageKind },
    #[error(
        "push-constant range {range} declared with size {first} by one stage and {second} by \
         another"
    )]
    PushConstantConflict { range: u32, first: u32, second: u32 },
    #[error("device was created without ray-tracing pipeline support")]
    RayTracingUnavailable,
    #[error("descriptor pool exhausted")]
    PoolExhausted,
    #[error("{what} failed: {source}")]
    Vulkan {
        what: &'static str,
        source: vk::Result,
    },
    #[error(transparent)]
    Allocation(#[from] AllocError),
}

/// One merged push-constant range in the concatenated pipeline offset space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PushConstantRange {
    pub offset: u32,
    pub size: u32,
    pub stages: vk::ShaderStageFlags,
}

/// The complete device-independent binding layout of one pipeline.
#[derive(Debug)]
pub struct MergedLayout {
    /// Union of every stage's parameter table.
    pub bindings: HashMap<String, Binding>,
    pub set_builders: [DescriptorLayoutBuilder; MAX_BOUND_SETS],
    /// Stages declaring at least one binding in each set.
    pub set_stages: [vk::ShaderStageFlags; MAX_BOUND_SETS],
    /// Declaration-ordered ranges with running offsets and union stage masks.
    pub push_ranges: Vec<PushConstantRange>,
    /// Uniform blocks packed into one backing arena.
    pub uniform_regions: Vec<UniformRegion>,
    /// Total arena size in bytes.
    pub uniform_size: u64,
}

impl MergedLayout {
    pub fn push_constant_size(&self) -> u32 {
        self.push_ranges.iter().map(|r| r.size).sum()
    }
}

/// Merges the reflections of all stages of one pipeline.
///
/// `min_uniform_alignment` is the device's minimum uniform-buffer offset
/// alignment, used when packing the uniform arena.
pub fn merge_stages(
    stages: &[&StageReflection],
    min_uniform_alignment: u64,
) -> Result<MergedLayout, AssemblyError> {
    let mut bindings: HashMap<String, Binding> = HashMap::default();
    let mut set_builders: [DescriptorLayoutBuilder; MAX_BOUND_SETS] = Default::default();
    let mut set_stages = [vk::ShaderStageFlags::empty(); MAX_BOUND_SETS];
    let mut range_sizes: SmallVec<[(u32, vk::ShaderStageFlags); 2]> = SmallVec::new();
    let mut uniform_block_sizes: HashMap<(u32, u32), u64> = HashMap::default();

    for stage in stages {
        for (name, binding) in &stage.bindings {
            match bindings.get(name) {
                None => {
                    bindings.insert(name.clone(), binding.clone());
                }
                Some(existing) if existing != binding => {
                    warn!(
                        "parameter `{name}` reflects differently across stages, keeping the \
                         first stage's layout"
                    );
                }
                Some(_) => {}
            }
        }

        for (set, builder) in stage.set_builders.iter().enumerate() {
            if !builder.is_empty() {
                set_builders[set].merge(builder);
                set_stages[set] |= stage.stage;
            }
        }

        for (index, &size) in stage.push_range_sizes.iter().enumerate() {
            if size == 0 {
                continue;
            }
            if range_sizes.len() <= index {
                range_sizes.resize(index + 1, (0, vk::ShaderStageFlags::empty()));
            }
            let (merged_size, stage_mask) = &mut range_sizes[index];
            if *merged_size != 0 && *merged_size != size {
                return Err(AssemblyError::PushConstantConflict {
                    range: index as u32,
                    first: *merged_size,
                    second: size,
                });
            }
            *merged_size = size;
            *stage_mask |= stage.stage;
        }

        for (&key, &size) in &stage.uniform_block_sizes {
            let entry = uniform_block_sizes.entry(key).or_insert(0);
            *entry = (*entry).max(size);
        }
    }

    let mut push_ranges = Vec::with_capacity(range_sizes.len());
    let mut offset = 0u32;
    for (size, range_stages) in range_sizes {
        // A gap left by a stage declaring only higher range indices holds no
        // data and must not become a zero-size Vulkan range.
        if size == 0 {
            continue;
        }
        push_ranges.push(PushConstantRange {
            offset,
            size,
            stages: range_stages,
        });
        offset += size;
    }

    let (uniform_regions, uniform_size) =
        pack_uniform_regions(&uniform_block_sizes, min_uniform_alignment);

    Ok(MergedLayout {
        bindings,
        set_builders,
        set_stages,
        push_ranges,
        uniform_regions,
        uniform_size,
    })
}

/// Sorts ray-tracing stages into their canonical raygen/miss/closest-hit
/// order, failing fast when a role is absent.
///
/// Returns the index each role occupies in `stages`.
pub(crate) fn ray_tracing_roles(stages: &[StageKind]) -> Result<[usize; 3], AssemblyError> {
    let find = |role: StageKind| {
        stages
            .iter()
            .position(|&s| s == role)
            .ok_or(AssemblyError::MissingStage { role })
    };
    Ok([
        find(StageKind::RayGen)?,
        find(StageKind::Miss)?,
        find(StageKind::ClosestHit)?,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::{
        walk_stage, BindingRangeKind, ResourceCategory, TypeLayout, VariableNode,
    };
    use crate::ResourceKind;

    fn globals(fields: Vec<VariableNode>) -> VariableNode {
        VariableNode::anonymous(ResourceCategory::Mixed, TypeLayout::structure(0, fields))
    }

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

    fn push_block(name: &str, size: u64, fields: Vec<VariableNode>) -> VariableNode {
        VariableNode::new(
            name,
            ResourceCategory::DescriptorSlot,
            TypeLayout::push_constant_buffer(VariableNode::anonymous(
                ResourceCategory::Uniform,
                TypeLayout::structure(size, fields),
            )),
        )
    }

    fn scalar(name: &str, size: u64, offset: u64) -> VariableNode {
        VariableNode::new(name, ResourceCategory::Uniform, TypeLayout::data(size))
            .at_uniform_offset(offset)
    }

    #[test]
    fn shared_slot_across_stages_appears_once() {
        let vs = walk_stage(
            vk::ShaderStageFlags::VERTEX,
            &[globals(vec![constant_buffer(
                "camera",
                0,
                64,
                vec![scalar("viewProj", 64, 0)],
            )])],
        )
        .unwrap();
        let fs = walk_stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[globals(vec![
                constant_buffer("camera", 0, 64, vec![scalar("viewProj", 64, 0)]),
                VariableNode::new(
                    "albedo",
                    ResourceCategory::DescriptorSlot,
                    TypeLayout::resource(BindingRangeKind::CombinedTextureSampler),
                )
                .at_slot(1),
            ])],
        )
        .unwrap();

        let merged = merge_stages(&[&vs, &fs], 256).unwrap();

        assert_eq!(merged.set_builders[0].len(), 2);
        assert_eq!(
            merged.set_stages[0],
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(merged.uniform_regions.len(), 1);
        assert_eq!(merged.uniform_size, 64);
        assert_eq!(
            merged.bindings["camera.viewProj"].resource_kind,
            ResourceKind::UniformBuffer
        );
    }

    #[test]
    fn push_ranges_union_stage_masks() {
        let vs = walk_stage(
            vk::ShaderStageFlags::VERTEX,
            &[globals(vec![push_block(
                "frame",
                16,
                vec![scalar("index", 4, 0)],
            )])],
        )
        .unwrap();
        let fs = walk_stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[globals(vec![push_block(
                "frame",
                16,
                vec![scalar("index", 4, 0)],
            )])],
        )
        .unwrap();

        let merged = merge_stages(&[&vs, &fs], 256).unwrap();

        assert_eq!(
            merged.push_ranges,
            vec![PushConstantRange {
                offset: 0,
                size: 16,
                stages: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            }]
        );
        assert_eq!(merged.push_constant_size(), 16);
    }

    #[test]
    fn conflicting_push_range_sizes_fail_assembly() {
        let vs = walk_stage(
            vk::ShaderStageFlags::VERTEX,
            &[globals(vec![push_block(
                "frame",
                16,
                vec![scalar("index", 4, 0)],
            )])],
        )
        .unwrap();
        let fs = walk_stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[globals(vec![push_block(
                "frame",
                32,
                vec![scalar("index", 4, 0)],
            )])],
        )
        .unwrap();

        let err = merge_stages(&[&vs, &fs], 256).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::PushConstantConflict {
                range: 0,
                first: 16,
                second: 32,
            }
        ));
    }

    #[test]
    fn compute_stage_with_buffer_and_count() {
        let cs = walk_stage(
            vk::ShaderStageFlags::COMPUTE,
            &[globals(vec![
                VariableNode::new(
                    "values",
                    ResourceCategory::DescriptorSlot,
                    TypeLayout::structured_buffer(true, 4),
                ),
                constant_buffer("params", 1, 4, vec![scalar("count", 4, 0)]),
            ])],
        )
        .unwrap();

        let merged = merge_stages(&[&cs], 64).unwrap();

        let values = &merged.bindings["values"];
        assert_eq!((values.set, values.slot), (0, 0));
        assert_eq!(values.resource_kind, ResourceKind::StorageBuffer);

        let count = &merged.bindings["params.count"];
        assert_eq!((count.set, count.slot), (0, 1));
        assert_eq!(count.byte_size, 4);

        assert_eq!(merged.uniform_regions.len(), 1);
        assert_eq!(merged.uniform_regions[0].size, 4);
        assert_eq!(merged.set_stages[0], vk::ShaderStageFlags::COMPUTE);
        assert!(merged.push_ranges.is_empty());
    }

    #[test]
    fn empty_sets_are_omitted() {
        let fs = walk_stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[globals(vec![VariableNode::new(
                "albedo",
                ResourceCategory::DescriptorSlot,
                TypeLayout::resource(BindingRangeKind::Texture),
            )
            .in_space(2)])],
        )
        .unwrap();

        let merged = merge_stages(&[&fs], 256).unwrap();
        assert!(merged.set_builders[0].is_empty());
        assert!(merged.set_builders[1].is_empty());
        assert!(!merged.set_builders[2].is_empty());
        assert_eq!(merged.set_stages[0], vk::ShaderStageFlags::empty());
    }

    #[test]
    fn skipped_push_range_index_leaves_no_zero_size_range() {
        let fs = walk_stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[globals(vec![push_block(
                "object",
                8,
                vec![scalar("id", 4, 0)],
            )
            .at_push_constant_range(1)])],
        )
        .unwrap();

        let merged = merge_stages(&[&fs], 256).unwrap();

        assert_eq!(
            merged.push_ranges,
            vec![PushConstantRange {
                offset: 0,
                size: 8,
                stages: vk::ShaderStageFlags::FRAGMENT,
            }]
        );
        assert_eq!(merged.push_constant_size(), 8);
    }

    #[test]
    fn ray_tracing_roles_sort_canonically() {
        let order = ray_tracing_roles(&[
            StageKind::Miss,
            StageKind::ClosestHit,
            StageKind::RayGen,
        ])
        .unwrap();
        assert_eq!(order, [2, 0, 1]);
    }

    #[test]
    fn missing_miss_stage_fails_fast() {
        let err = ray_tracing_roles(&[StageKind::RayGen, StageKind::ClosestHit]).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::MissingStage {
                role: StageKind::Miss
            }
        ));
    }
}
