//! A compiled shader stage: SPIR-V module plus its reflected binding table.

use crate::context::DeviceContext;
use crate::reflect::{walk_stage, ReflectError, StageReflection, VariableNode};
use ash::vk;
use log::debug;
use std::fmt;
use std::sync::Arc;

/// The pipeline role of a shader stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StageKind {
    Vertex,
    Fragment,
    Compute,
    RayGen,
    Miss,
    ClosestHit,
}

impl StageKind {
    pub fn stage_flags(self) -> vk::ShaderStageFlags {
        match self {
            StageKind::Vertex => vk::ShaderStageFlags::VERTEX,
            StageKind::Fragment => vk::ShaderStageFlags::FRAGMENT,
            StageKind::Compute => vk::ShaderStageFlags::COMPUTE,
            StageKind::RayGen => vk::ShaderStageFlags::RAYGEN_KHR,
            StageKind::Miss => vk::ShaderStageFlags::MISS_KHR,
            StageKind::ClosestHit => vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StageKind::Vertex => "vertex",
            StageKind::Fragment => "fragment",
            StageKind::Compute => "compute",
            StageKind::RayGen => "ray generation",
            StageKind::Miss => "miss",
            StageKind::ClosestHit => "closest hit",
        };
        f.write_str(name)
    }
}

/// Errors creating a [`Shader`].
#[derive(Debug, thiserror::Error)]
pub enum ShaderError {
    #[error("reflection of shader `{name}` failed: {source}")]
    Reflect {
        name: String,
        source: ReflectError,
    },
    #[error("failed to create shader module `{name}`: {source}")]
    ModuleCreation { name: String, source: vk::Result },
}

/// Parameters for [`Shader::new`].
pub struct ShaderCreateInfo {
    /// Name used in log and error messages, typically the source file name.
    pub name: String,
    pub stage: StageKind,
    pub spirv: Vec<u32>,
    /// Root parameter scopes of the reflected layout tree, global scope
    /// first, entry-point scope second.
    pub parameter_roots: Vec<VariableNode>,
    /// Reflected compute thread-group size; `[1, 1, 1]` for non-compute
    /// stages.
    pub thread_group_size: [u32; 3],
}

/// One compiled stage, shared read-only across every pipeline that uses it.
pub struct Shader {
    name: String,
    stage: StageKind,
    module: vk::ShaderModule,
    device: ash::Device,
    reflection: StageReflection,
    thread_group_size: [u32; 3],
}

impl Shader {
    /// Creates the Vulkan module and reflects the stage's binding table.
    ///
    /// # Safety
    ///
    /// `create_info.spirv` must be valid SPIR-V matching the declared stage
    /// and layout tree.
    pub unsafe fn new(
        context: &Arc<DeviceContext>,
        create_info: ShaderCreateInfo,
    ) -> Result<Arc<Shader>, ShaderError> {
        let ShaderCreateInfo {
            name,
            stage,
            spirv,
            parameter_roots,
            thread_group_size,
        } = create_info;

        let reflection = walk_stage(stage.stage_flags(), &parameter_roots)
            .map_err(|source| ShaderError::Reflect {
                name: name.clone(),
                source,
            })?;
        debug!(
            "reflected {} shader `{name}`: {} parameters, {} push-constant bytes",
            stage,
            reflection.bindings.len(),
            reflection.push_constant_size(),
        );

        let module_info = vk::ShaderModuleCreateInfo::default().code(&spirv);
        let module = context
            .device()
            .create_shader_module(&module_info, None)
            .map_err(|source| ShaderError::ModuleCreation {
                name: name.clone(),
                source,
            })?;

        Ok(Arc::new(Shader {
            name,
            stage,
            module,
            device: context.device().clone(),
            reflection,
            thread_group_size,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage(&self) -> StageKind {
        self.stage
    }

    pub fn module(&self) -> vk::ShaderModule {
        self.module
    }

    pub fn reflection(&self) -> &StageReflection {
        &self.reflection
    }

    pub fn thread_group_size(&self) -> [u32; 3] {
        self.thread_group_size
    }
}

impl Drop for Shader {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}
