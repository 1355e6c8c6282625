//! Device-level state shared by every pipeline: function tables, binding
//! limits, the descriptor pool, the default sampler and the buffer allocator.

use crate::descriptor::{DescriptorPool, PoolCapacity};
use ash::vk;
use parking_lot::Mutex;
use std::ptr::NonNull;
use std::sync::Arc;

/// Default number of frames that may be in flight at once.
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;

/// Errors surfaced by a [`BufferAllocator`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("device allocation failed: {0}")]
    Vulkan(#[from] vk::Result),
    #[error("allocation of {size} bytes failed: {reason}")]
    Failed { size: u64, reason: String },
}

/// What a buffer allocation must provide.
#[derive(Clone, Copy, Debug)]
pub struct BufferRequest {
    pub size: u64,
    pub usage: vk::BufferUsageFlags,
    /// Whether the buffer must be host visible and stay persistently mapped
    /// for its whole lifetime.
    pub host_visible: bool,
}

/// A buffer handed out by the external allocator.
///
/// `mapped` is the persistent mapping when one was requested. The pointer is
/// only dereferenced while the buffer is alive and from the externally
/// serialized frame-recording thread.
#[derive(Debug)]
pub struct AllocatedBuffer {
    pub handle: vk::Buffer,
    pub size: u64,
    /// Device address, zero when the buffer was created without address
    /// usage.
    pub device_address: u64,
    pub mapped: Option<NonNull<u8>>,
}

// The mapping pointer refers to allocator-owned memory whose mutation is
// serialized by the frame discipline.
unsafe impl Send for AllocatedBuffer {}
unsafe impl Sync for AllocatedBuffer {}

impl AllocatedBuffer {
    /// # Safety
    ///
    /// The caller must be the only writer of the mapping, per the single
    /// recording thread discipline.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn mapped_slice(&self) -> Option<&mut [u8]> {
        self.mapped
            .map(|p| std::slice::from_raw_parts_mut(p.as_ptr(), self.size as usize))
    }
}

/// The seam to the application's GPU memory allocator. The binding layer
/// requests buffers through this trait and never owns allocation policy.
pub trait BufferAllocator: Send + Sync {
    fn create_buffer(&self, request: &BufferRequest) -> Result<AllocatedBuffer, AllocError>;
    fn destroy_buffer(&self, buffer: AllocatedBuffer);
}

/// Device limits the binding layer needs, queried once by the caller from
/// `VkPhysicalDeviceProperties2` and its ray-tracing extension struct.
#[derive(Clone, Copy, Debug)]
pub struct DeviceBindingLimits {
    pub min_uniform_buffer_offset_alignment: u64,
    pub shader_group_handle_size: u32,
    pub shader_group_handle_alignment: u32,
    pub shader_group_base_alignment: u32,
}

impl Default for DeviceBindingLimits {
    fn default() -> Self {
        DeviceBindingLimits {
            min_uniform_buffer_offset_alignment: 256,
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 32,
            shader_group_base_alignment: 64,
        }
    }
}

/// Parameters for [`DeviceContext::new`].
pub struct DeviceContextCreateInfo {
    pub device: ash::Device,
    /// Ray-tracing pipeline extension functions; `None` on devices without
    /// the extension, in which case ray-tracing pipeline assembly fails.
    pub ray_tracing: Option<ash::khr::ray_tracing_pipeline::Device>,
    pub limits: DeviceBindingLimits,
    pub allocator: Arc<dyn BufferAllocator>,
    pub pool_capacity: PoolCapacity,
    pub frames_in_flight: usize,
}

/// Everything pipelines share on one logical device.
///
/// The context is created once after device setup and passed by `Arc` into
/// every pipeline constructor. The descriptor pool sits behind a mutex so
/// pipelines may be assembled from any thread; per-frame mutation stays
/// externally serialized and takes no locks.
pub struct DeviceContext {
    device: ash::Device,
    ray_tracing: Option<ash::khr::ray_tracing_pipeline::Device>,
    limits: DeviceBindingLimits,
    allocator: Arc<dyn BufferAllocator>,
    descriptor_pool: Mutex<DescriptorPool>,
    default_sampler: vk::Sampler,
    frames_in_flight: usize,
}

impl DeviceContext {
    /// # Safety
    ///
    /// `create_info.device` must be a valid device that outlives the context
    /// and every object created through it.
    pub unsafe fn new(create_info: DeviceContextCreateInfo) -> Result<Arc<Self>, vk::Result> {
        let DeviceContextCreateInfo {
            device,
            ray_tracing,
            limits,
            allocator,
            pool_capacity,
            frames_in_flight,
        } = create_info;

        let descriptor_pool = DescriptorPool::new(&device, pool_capacity)?;

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);
        let default_sampler = device.create_sampler(&sampler_info, None)?;

        Ok(Arc::new(DeviceContext {
            device,
            ray_tracing,
            limits,
            allocator,
            descriptor_pool: Mutex::new(descriptor_pool),
            default_sampler,
            frames_in_flight,
        }))
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn ray_tracing(&self) -> Option<&ash::khr::ray_tracing_pipeline::Device> {
        self.ray_tracing.as_ref()
    }

    pub fn limits(&self) -> &DeviceBindingLimits {
        &self.limits
    }

    pub fn allocator(&self) -> &Arc<dyn BufferAllocator> {
        &self.allocator
    }

    /// Sampler used for combined image bindings when the update does not
    /// supply its own.
    pub fn default_sampler(&self) -> vk::Sampler {
        self.default_sampler
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// # Safety
    ///
    /// The layouts must belong to this context's device.
    pub(crate) unsafe fn allocate_descriptor_sets(
        &self,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>, vk::Result> {
        self.descriptor_pool.lock().allocate(layouts)
    }

    /// # Safety
    ///
    /// The sets must have been allocated from this context's pool and must
    /// not be referenced by pending GPU work.
    pub(crate) unsafe fn free_descriptor_sets(&self, sets: &[vk::DescriptorSet]) {
        self.descriptor_pool.lock().free(sets);
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_sampler(self.default_sampler, None);
        }
    }
}
