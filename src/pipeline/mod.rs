//! Pipeline assembly, ownership of the merged binding state, and command
//! recording.

pub mod merge;
pub mod sbt;

pub use merge::{merge_stages, AssemblyError, MergedLayout, PushConstantRange};
pub use sbt::ShaderBindingTable;

use crate::binding::Binding;
use crate::context::DeviceContext;
use crate::descriptor::DescriptorLayout;
use crate::frame::FrameResources;
use crate::params::{plan_update, DescriptorWrite, ParameterValue, ParameterWarning, UpdateAction};
use crate::shader::{Shader, StageKind};
use crate::MAX_BOUND_SETS;
use ash::vk;
use foldhash::HashMap;
use log::{debug, warn};
use smallvec::SmallVec;
use std::sync::Arc;

/// Fixed-function state for graphics pipeline assembly, targeting dynamic
/// rendering.
#[derive(Clone, Debug)]
pub struct GraphicsPipelineCreateInfo {
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub stencil_format: Option<vk::Format>,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub blend: bool,
    pub samples: vk::SampleCountFlags,
    /// Viewport and scissor set at record time instead of baked in.
    pub dynamic_viewport: bool,
    /// Ignored when `dynamic_viewport` is set.
    pub viewport_extent: vk::Extent2D,
    pub cull_mode: vk::CullModeFlags,
    pub vertex_binding: Option<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
}

impl Default for GraphicsPipelineCreateInfo {
    fn default() -> Self {
        GraphicsPipelineCreateInfo {
            color_formats: Vec::new(),
            depth_format: None,
            stencil_format: None,
            depth_write: false,
            depth_compare: vk::CompareOp::LESS,
            blend: false,
            samples: vk::SampleCountFlags::TYPE_1,
            dynamic_viewport: true,
            viewport_extent: vk::Extent2D::default(),
            cull_mode: vk::CullModeFlags::BACK,
            vertex_binding: None,
            vertex_attributes: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PipelineKind {
    Graphics,
    Compute,
    RayTracing,
}

impl PipelineKind {
    fn bind_point(self) -> vk::PipelineBindPoint {
        match self {
            PipelineKind::Graphics => vk::PipelineBindPoint::GRAPHICS,
            PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
            PipelineKind::RayTracing => vk::PipelineBindPoint::RAY_TRACING_KHR,
        }
    }
}

/// Everything common to the three pipeline kinds, assembled before the
/// pipeline object itself exists.
struct CommonState {
    set_layouts: Vec<DescriptorLayout>,
    /// Set indices that actually hold bindings; only these get tables.
    table_indices: SmallVec<[u32; MAX_BOUND_SETS]>,
    layout: vk::PipelineLayout,
    /// One table per non-empty set per frame slot.
    tables: Vec<SmallVec<[vk::DescriptorSet; MAX_BOUND_SETS]>>,
    frames: FrameResources,
}

fn pool_error(source: vk::Result) -> AssemblyError {
    match source {
        vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
            AssemblyError::PoolExhausted
        }
        source => AssemblyError::Vulkan {
            what: "descriptor set allocation",
            source,
        },
    }
}

unsafe fn assemble_common(
    context: &Arc<DeviceContext>,
    merged: &MergedLayout,
) -> Result<CommonState, AssemblyError> {
    let device = context.device();

    // The pipeline layout's set array is contiguous from zero, so empty sets
    // below the highest used index still need (empty) layout objects. Tables
    // are only allocated for non-empty sets.
    let set_count = merged
        .set_builders
        .iter()
        .rposition(|b| !b.is_empty())
        .map_or(0, |i| i + 1);

    let all_stages = merged
        .set_stages
        .iter()
        .fold(vk::ShaderStageFlags::empty(), |acc, &s| acc | s);

    let mut set_layouts = Vec::with_capacity(set_count);
    let mut table_indices: SmallVec<[u32; MAX_BOUND_SETS]> = SmallVec::new();
    for set in 0..set_count {
        let layout = merged.set_builders[set]
            .build(device, all_stages)
            .map_err(|source| AssemblyError::Vulkan {
                what: "descriptor set layout creation",
                source,
            })?;
        if !merged.set_builders[set].is_empty() {
            table_indices.push(set as u32);
        }
        set_layouts.push(layout);
    }

    let layout_handles: SmallVec<[vk::DescriptorSetLayout; MAX_BOUND_SETS]> =
        set_layouts.iter().map(|l| l.handle()).collect();
    let push_ranges: SmallVec<[vk::PushConstantRange; 2]> = merged
        .push_ranges
        .iter()
        .map(|r| {
            vk::PushConstantRange::default()
                .stage_flags(r.stages)
                .offset(r.offset)
                .size(r.size)
        })
        .collect();

    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&layout_handles)
        .push_constant_ranges(&push_ranges);
    let layout = device
        .create_pipeline_layout(&layout_info, None)
        .map_err(|source| AssemblyError::Vulkan {
            what: "pipeline layout creation",
            source,
        })?;

    let table_layouts: SmallVec<[vk::DescriptorSetLayout; MAX_BOUND_SETS]> = table_indices
        .iter()
        .map(|&set| set_layouts[set as usize].handle())
        .collect();

    let mut tables: Vec<SmallVec<[vk::DescriptorSet; MAX_BOUND_SETS]>> = Vec::new();
    for _ in 0..context.frames_in_flight() {
        if table_layouts.is_empty() {
            tables.push(SmallVec::new());
            continue;
        }
        match context.allocate_descriptor_sets(&table_layouts) {
            Ok(sets) => tables.push(sets.into_iter().collect()),
            Err(source) => {
                for frame in &tables {
                    context.free_descriptor_sets(frame);
                }
                device.destroy_pipeline_layout(layout, None);
                return Err(pool_error(source));
            }
        }
    }

    let frames = match FrameResources::new(
        context.allocator().clone(),
        context.frames_in_flight(),
        merged,
    ) {
        Ok(frames) => frames,
        Err(e) => {
            for frame in &tables {
                context.free_descriptor_sets(frame);
            }
            device.destroy_pipeline_layout(layout, None);
            return Err(e.into());
        }
    };

    // Bind each uniform region to its slot once; the arenas never move, so
    // steady-state uniform updates are plain memory writes.
    for (frame_slot, frame_tables) in tables.iter().enumerate() {
        let Some(arena) = frames.arena(frame_slot) else {
            continue;
        };
        for region in &merged.uniform_regions {
            let Some(table_pos) = table_indices.iter().position(|&s| s == region.set) else {
                continue;
            };
            let buffer_info = [vk::DescriptorBufferInfo::default()
                .buffer(arena.handle)
                .offset(region.offset)
                .range(region.size)];
            let write = vk::WriteDescriptorSet::default()
                .dst_set(frame_tables[table_pos])
                .dst_binding(region.slot)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info);
            device.update_descriptor_sets(&[write], &[]);
        }
    }

    Ok(CommonState {
        set_layouts,
        table_indices,
        layout,
        tables,
        frames,
    })
}

unsafe fn destroy_common(context: &DeviceContext, common: CommonState) {
    for frame in &common.tables {
        context.free_descriptor_sets(frame);
    }
    context
        .device()
        .destroy_pipeline_layout(common.layout, None);
    // Set layouts and frame arenas clean up through their own drops.
}

fn group_counts(threads: [u32; 3], group_size: [u32; 3]) -> [u32; 3] {
    let mut counts = [0u32; 3];
    for i in 0..3 {
        counts[i] = threads[i].div_ceil(group_size[i].max(1));
    }
    counts
}

/// A fully assembled pipeline: the Vulkan objects plus the retained binding
/// state that `set_parameter` and `bind` operate on.
pub struct Pipeline {
    context: Arc<DeviceContext>,
    name: String,
    kind: PipelineKind,
    shaders: SmallVec<[Arc<Shader>; 3]>,
    bindings: HashMap<String, Binding>,
    push_ranges: Vec<PushConstantRange>,
    set_layouts: Vec<DescriptorLayout>,
    table_indices: SmallVec<[u32; MAX_BOUND_SETS]>,
    tables: Vec<SmallVec<[vk::DescriptorSet; MAX_BOUND_SETS]>>,
    layout: vk::PipelineLayout,
    handle: vk::Pipeline,
    frames: FrameResources,
    sbt: Option<ShaderBindingTable>,
    thread_group_size: [u32; 3],
}

impl Pipeline {
    /// Assembles a graphics pipeline from a vertex and a fragment stage.
    ///
    /// # Safety
    ///
    /// The shaders must belong to `context`'s device.
    pub unsafe fn new_graphics(
        context: &Arc<DeviceContext>,
        name: impl Into<String>,
        vertex: Arc<Shader>,
        fragment: Arc<Shader>,
        create_info: &GraphicsPipelineCreateInfo,
    ) -> Result<Pipeline, AssemblyError> {
        let name = name.into();
        let merged = merge_stages(
            &[vertex.reflection(), fragment.reflection()],
            context.limits().min_uniform_buffer_offset_alignment,
        )?;
        let common = assemble_common(context, &merged)?;
        let device = context.device();

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vertex.module())
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(fragment.module())
                .name(c"main"),
        ];

        let mut vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let binding_descs;
        if let Some(binding) = create_info.vertex_binding {
            binding_descs = [binding];
            vertex_input = vertex_input
                .vertex_binding_descriptions(&binding_descs)
                .vertex_attribute_descriptions(&create_info.vertex_attributes);
        }

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        // Fixed viewports flip Y so world space stays right handed.
        let extent = create_info.viewport_extent;
        let viewports = [vk::Viewport::default()
            .x(0.0)
            .y(extent.height as f32)
            .width(extent.width as f32)
            .height(-(extent.height as f32))
            .min_depth(0.0)
            .max_depth(1.0)];
        let scissors = [vk::Rect2D::default().extent(extent)];
        let mut viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        if !create_info.dynamic_viewport {
            viewport_state = viewport_state.viewports(&viewports).scissors(&scissors);
        }

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(create_info.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .line_width(1.0);

        let multisample = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(create_info.samples)
            .sample_shading_enable(create_info.samples != vk::SampleCountFlags::TYPE_1)
            .min_sample_shading(0.2);

        let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(create_info.blend)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)];
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(create_info.depth_format.is_some())
            .depth_write_enable(create_info.depth_write)
            .depth_compare_op(create_info.depth_compare)
            .stencil_test_enable(create_info.stencil_format.is_some());

        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&create_info.color_formats)
            .depth_attachment_format(create_info.depth_format.unwrap_or(vk::Format::UNDEFINED))
            .stencil_attachment_format(
                create_info.stencil_format.unwrap_or(vk::Format::UNDEFINED),
            );

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .depth_stencil_state(&depth_stencil)
            .layout(common.layout)
            .push_next(&mut rendering);
        if create_info.dynamic_viewport {
            pipeline_info = pipeline_info.dynamic_state(&dynamic_state);
        }

        let handle = match device.create_graphics_pipelines(
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        ) {
            Ok(pipelines) => pipelines[0],
            Err((_, source)) => {
                destroy_common(context, common);
                return Err(AssemblyError::Vulkan {
                    what: "graphics pipeline creation",
                    source,
                });
            }
        };

        debug!("assembled graphics pipeline `{name}`");
        Ok(Pipeline::from_parts(
            context,
            name,
            PipelineKind::Graphics,
            SmallVec::from_iter([vertex, fragment]),
            merged,
            common,
            handle,
            None,
            [1, 1, 1],
        ))
    }

    /// Assembles a compute pipeline from a single compute stage.
    ///
    /// # Safety
    ///
    /// The shader must belong to `context`'s device.
    pub unsafe fn new_compute(
        context: &Arc<DeviceContext>,
        name: impl Into<String>,
        shader: Arc<Shader>,
    ) -> Result<Pipeline, AssemblyError> {
        let name = name.into();
        let merged = merge_stages(
            &[shader.reflection()],
            context.limits().min_uniform_buffer_offset_alignment,
        )?;
        let common = assemble_common(context, &merged)?;
        let device = context.device();

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.module())
            .name(c"main");
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(common.layout);

        let handle = match device.create_compute_pipelines(
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        ) {
            Ok(pipelines) => pipelines[0],
            Err((_, source)) => {
                destroy_common(context, common);
                return Err(AssemblyError::Vulkan {
                    what: "compute pipeline creation",
                    source,
                });
            }
        };

        let thread_group_size = shader.thread_group_size();
        debug!("assembled compute pipeline `{name}`, thread group {thread_group_size:?}");
        Ok(Pipeline::from_parts(
            context,
            name,
            PipelineKind::Compute,
            SmallVec::from_iter([shader]),
            merged,
            common,
            handle,
            None,
            thread_group_size,
        ))
    }

    /// Assembles a ray-tracing pipeline with one raygen, one miss and one
    /// closest-hit stage, in any order, and derives its shader-binding
    /// table.
    ///
    /// # Safety
    ///
    /// The shaders must belong to `context`'s device.
    pub unsafe fn new_ray_tracing(
        context: &Arc<DeviceContext>,
        name: impl Into<String>,
        shaders: Vec<Arc<Shader>>,
    ) -> Result<Pipeline, AssemblyError> {
        let name = name.into();

        let kinds: SmallVec<[StageKind; 3]> = shaders.iter().map(|s| s.stage()).collect();
        let [raygen, miss, closest_hit] = merge::ray_tracing_roles(&kinds)?;
        let Some(rt) = context.ray_tracing() else {
            return Err(AssemblyError::RayTracingUnavailable);
        };

        let ordered: SmallVec<[Arc<Shader>; 3]> = SmallVec::from_iter([
            shaders[raygen].clone(),
            shaders[miss].clone(),
            shaders[closest_hit].clone(),
        ]);
        let merged = {
            let reflections: SmallVec<[&crate::reflect::StageReflection; 3]> =
                ordered.iter().map(|s| s.reflection()).collect();
            merge_stages(
                &reflections,
                context.limits().min_uniform_buffer_offset_alignment,
            )?
        };
        let common = assemble_common(context, &merged)?;

        let stages: SmallVec<[vk::PipelineShaderStageCreateInfo<'_>; 3]> = ordered
            .iter()
            .map(|s| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(s.stage().stage_flags())
                    .module(s.module())
                    .name(c"main")
            })
            .collect();

        let general = |index: u32| {
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(index)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
        };
        let groups = [
            general(0),
            general(1),
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(2)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR),
        ];

        let pipeline_info = vk::RayTracingPipelineCreateInfoKHR::default()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(1)
            .layout(common.layout);

        let handle = match rt.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[pipeline_info],
            None,
        ) {
            Ok(pipelines) => pipelines[0],
            Err((_, source)) => {
                destroy_common(context, common);
                return Err(AssemblyError::Vulkan {
                    what: "ray-tracing pipeline creation",
                    source,
                });
            }
        };

        let limits = context.limits();
        let handle_data_size = limits.shader_group_handle_size as usize * groups.len();
        let handles = match rt.get_ray_tracing_shader_group_handles(
            handle,
            0,
            groups.len() as u32,
            handle_data_size,
        ) {
            Ok(handles) => handles,
            Err(source) => {
                context.device().destroy_pipeline(handle, None);
                destroy_common(context, common);
                return Err(AssemblyError::Vulkan {
                    what: "shader group handle query",
                    source,
                });
            }
        };

        let sbt = match ShaderBindingTable::new(
            context.allocator().clone(),
            limits,
            &handles,
            1,
            1,
        ) {
            Ok(sbt) => sbt,
            Err(e) => {
                context.device().destroy_pipeline(handle, None);
                destroy_common(context, common);
                return Err(e.into());
            }
        };

        debug!("assembled ray-tracing pipeline `{name}`");
        Ok(Pipeline::from_parts(
            context,
            name,
            PipelineKind::RayTracing,
            ordered,
            merged,
            common,
            handle,
            Some(sbt),
            [1, 1, 1],
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        context: &Arc<DeviceContext>,
        name: String,
        kind: PipelineKind,
        shaders: SmallVec<[Arc<Shader>; 3]>,
        merged: MergedLayout,
        common: CommonState,
        handle: vk::Pipeline,
        sbt: Option<ShaderBindingTable>,
        thread_group_size: [u32; 3],
    ) -> Pipeline {
        Pipeline {
            context: context.clone(),
            name,
            kind,
            shaders,
            bindings: merged.bindings,
            push_ranges: merged.push_ranges,
            set_layouts: common.set_layouts,
            table_indices: common.table_indices,
            tables: common.tables,
            layout: common.layout,
            handle,
            frames: common.frames,
            sbt,
            thread_group_size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub fn shaders(&self) -> &[Arc<Shader>] {
        &self.shaders
    }

    /// The merged name-keyed parameter table.
    pub fn bindings(&self) -> &HashMap<String, Binding> {
        &self.bindings
    }

    /// Updates one named parameter for the given frame slot.
    ///
    /// Mismatches are logged, returned, and leave all staged data and
    /// descriptor tables untouched.
    pub fn set_parameter(
        &mut self,
        frame_slot: usize,
        name: &str,
        value: ParameterValue<'_>,
    ) -> Result<(), ParameterWarning> {
        let Some(binding) = self.bindings.get(name).cloned() else {
            let w = ParameterWarning::UnknownName { name: name.into() };
            warn!("{w} in pipeline `{}`", self.name);
            return Err(w);
        };

        match plan_update(&binding, value) {
            Ok(UpdateAction::Host {
                bytes,
                element_size,
            }) => {
                if binding.is_push_constant {
                    self.frames.write_push(&binding, &bytes, element_size);
                } else {
                    self.frames
                        .write_uniform(frame_slot, &binding, &bytes, element_size);
                }
                Ok(())
            }
            Ok(UpdateAction::Descriptor(write)) => {
                unsafe { self.write_descriptor(frame_slot, &binding, write) };
                Ok(())
            }
            Err(w) => {
                warn!("{w} in pipeline `{}`", self.name);
                Err(w)
            }
        }
    }

    unsafe fn write_descriptor(
        &self,
        frame_slot: usize,
        binding: &Binding,
        write: DescriptorWrite,
    ) {
        let Some(table) = self.table(frame_slot, binding.set) else {
            warn!(
                "parameter `{}` addresses set {} which holds no table",
                binding.name, binding.set
            );
            return;
        };
        let Some(descriptor_type) = binding.resource_kind.descriptor_type() else {
            return;
        };
        let device = self.context.device();

        let base = vk::WriteDescriptorSet::default()
            .dst_set(table)
            .dst_binding(binding.slot)
            .descriptor_type(descriptor_type);

        match write {
            DescriptorWrite::Buffer(buffer) => {
                let info = [vk::DescriptorBufferInfo::default()
                    .buffer(buffer.buffer)
                    .offset(buffer.offset)
                    .range(buffer.range)];
                device.update_descriptor_sets(&[base.buffer_info(&info)], &[]);
            }
            DescriptorWrite::Image { image, storage } => {
                let sampler = if storage {
                    vk::Sampler::null()
                } else {
                    image.sampler.unwrap_or(self.context.default_sampler())
                };
                let info = [vk::DescriptorImageInfo::default()
                    .image_view(image.view)
                    .image_layout(image.layout)
                    .sampler(sampler)];
                device.update_descriptor_sets(&[base.image_info(&info)], &[]);
            }
            DescriptorWrite::AccelerationStructure(handle) => {
                let structures = [handle];
                let mut info = vk::WriteDescriptorSetAccelerationStructureKHR::default()
                    .acceleration_structures(&structures);
                let write = base.push_next(&mut info).descriptor_count(1);
                device.update_descriptor_sets(&[write], &[]);
            }
        }
    }

    fn table(&self, frame_slot: usize, set: u32) -> Option<vk::DescriptorSet> {
        let pos = self.table_indices.iter().position(|&s| s == set)?;
        Some(*self.tables.get(frame_slot)?.get(pos)?)
    }

    /// Binds the pipeline, its descriptor tables for the frame slot, and the
    /// staged push-constant data.
    ///
    /// # Safety
    ///
    /// `cmd` must be in the recording state on a queue supporting this
    /// pipeline's bind point.
    pub unsafe fn bind(&self, cmd: vk::CommandBuffer, frame_slot: usize) {
        let device = self.context.device();
        let bind_point = self.kind.bind_point();

        if let Some(frame_tables) = self.tables.get(frame_slot) {
            for (pos, &set) in self.table_indices.iter().enumerate() {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    bind_point,
                    self.layout,
                    set,
                    &[frame_tables[pos]],
                    &[],
                );
            }
        } else {
            warn!(
                "frame slot {frame_slot} out of range in pipeline `{}`, descriptor tables not \
                 bound",
                self.name
            );
        }

        let staged = self.frames.push_bytes();
        for range in &self.push_ranges {
            let start = range.offset as usize;
            let end = start + range.size as usize;
            device.cmd_push_constants(cmd, self.layout, range.stages, range.offset, &staged[start..end]);
        }

        device.cmd_bind_pipeline(cmd, bind_point, self.handle);
    }

    /// Dispatches enough thread groups to cover the requested thread counts.
    ///
    /// # Safety
    ///
    /// `cmd` must be recording, with this compute pipeline bound.
    pub unsafe fn dispatch(&self, cmd: vk::CommandBuffer, threads: [u32; 3]) {
        debug_assert_eq!(self.kind, PipelineKind::Compute);
        let [x, y, z] = group_counts(threads, self.thread_group_size);
        self.context.device().cmd_dispatch(cmd, x, y, z);
    }

    /// Records a trace-rays call over the shader-binding table.
    ///
    /// # Safety
    ///
    /// `cmd` must be recording, with this ray-tracing pipeline bound.
    pub unsafe fn trace_rays(&self, cmd: vk::CommandBuffer, width: u32, height: u32, depth: u32) {
        let (Some(rt), Some(sbt)) = (self.context.ray_tracing(), self.sbt.as_ref()) else {
            return;
        };
        let (raygen, miss, hit, callable) = sbt.regions();
        rt.cmd_trace_rays(cmd, raygen, miss, hit, callable, width, height, depth);
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            for frame in &self.tables {
                self.context.free_descriptor_sets(frame);
            }
            let device = self.context.device();
            device.destroy_pipeline(self.handle, None);
            device.destroy_pipeline_layout(self.layout, None);
        }
        // Set layouts, frame arenas and the binding table drop themselves.
    }
}
