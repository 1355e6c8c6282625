//! Shader-reflection-driven resource binding for Vulkan.
//!
//! `bindery` sits between a shader compiler and the raw Vulkan API. Given the
//! reflected type-layout tree of each compiled shader stage, it discovers every
//! external resource the stage expects (buffers, images, acceleration
//! structures, inline constants) together with the exact byte offsets, binding
//! slots and strides the GPU interface requires, merges the per-stage
//! discoveries into one pipeline-wide binding layout, and manages
//! per-in-flight-frame copies of all mutable backing state so that host-side
//! parameter updates can never corrupt data a previous frame's GPU work is
//! still reading.
//!
//! # Overview
//!
//! The flow from shader to draw call:
//!
//! 1. An external compiler produces SPIR-V plus a [`reflect::VariableNode`]
//!    tree describing the stage's parameters. [`reflect::walk_stage`] turns
//!    that tree into a flat table of named [`binding::Binding`]s.
//! 2. [`pipeline::merge`] unions the tables of all stages of one pipeline into
//!    descriptor-set declarations, push-constant ranges and a single
//!    name-keyed lookup table.
//! 3. [`pipeline::Pipeline`] turns the merged layout into live Vulkan objects:
//!    descriptor-set layouts, one descriptor table per set per frame slot, a
//!    persistently mapped uniform arena per frame slot, the pipeline object
//!    itself, and (for ray tracing) a shader-binding table.
//! 4. At record time, [`pipeline::Pipeline::set_parameter`] translates a
//!    parameter name and value into either a host-memory write or a
//!    descriptor-table update for the current frame slot, and
//!    [`pipeline::Pipeline::bind`] attaches tables and push constants to the
//!    command stream.
//!
//! # What this crate does not do
//!
//! Window and swapchain management, frame pacing, fences, asset loading and
//! memory allocation policy all live with the caller. The crate receives an
//! already-created [`ash::Device`] and a [`context::BufferAllocator`]
//! implementation, and assumes the caller waits on its frame fence before
//! reusing a frame slot.

pub mod binding;
pub mod context;
pub mod descriptor;
pub mod frame;
pub mod params;
pub mod pipeline;
pub mod reflect;
pub mod shader;

/// Highest number of simultaneously bound descriptor sets the layer tracks.
///
/// Vulkan guarantees at least four bound sets; reflection output addressing a
/// set at or above this bound is rejected during the walk.
pub const MAX_BOUND_SETS: usize = 4;

pub use binding::{Binding, ResourceKind};
pub use context::{
    AllocError, AllocatedBuffer, BufferAllocator, BufferRequest, DeviceBindingLimits,
    DeviceContext, DeviceContextCreateInfo,
};
pub use params::{BufferBinding, ImageBinding, ParameterValue, ParameterWarning};
pub use pipeline::{AssemblyError, GraphicsPipelineCreateInfo, Pipeline};
pub use shader::{Shader, ShaderCreateInfo, ShaderError, StageKind};
