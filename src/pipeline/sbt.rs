//! Shader-binding-table layout and construction.
//!
//! Record placement is pure arithmetic over the device's reported handle
//! size and alignments, kept separate from the buffer fill so it can be
//! checked without a device.

use crate::context::{AllocError, AllocatedBuffer, BufferAllocator, BufferRequest, DeviceBindingLimits};
use ash::vk;
use std::sync::Arc;

fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Byte placement of one role's records within the table buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RegionLayout {
    pub offset: u64,
    pub stride: u64,
    pub size: u64,
}

/// Placement of every role's records. One record per group, no callable
/// groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct RecordLayout {
    pub raygen: RegionLayout,
    pub miss: RegionLayout,
    pub hit: RegionLayout,
    pub total_size: u64,
}

/// Computes record placement for one raygen group, `miss_count` miss groups
/// and `hit_count` hit groups.
///
/// Each record is the group handle rounded up to the handle alignment; each
/// role's region starts on the base alignment. The raygen region's stride
/// must equal its size, per the ray-tracing API contract.
pub(crate) fn record_layout(
    limits: &DeviceBindingLimits,
    miss_count: u64,
    hit_count: u64,
) -> RecordLayout {
    let handle_size = u64::from(limits.shader_group_handle_size);
    let handle_size_aligned = align_up(handle_size, u64::from(limits.shader_group_handle_alignment));
    let base_alignment = u64::from(limits.shader_group_base_alignment);

    let raygen = RegionLayout {
        offset: 0,
        stride: align_up(handle_size_aligned, base_alignment),
        size: align_up(handle_size_aligned, base_alignment),
    };
    let miss = RegionLayout {
        offset: raygen.offset + raygen.size,
        stride: handle_size_aligned,
        size: align_up(miss_count * handle_size_aligned, base_alignment),
    };
    let hit = RegionLayout {
        offset: miss.offset + miss.size,
        stride: handle_size_aligned,
        size: align_up(hit_count * handle_size_aligned, base_alignment),
    };

    RecordLayout {
        raygen,
        miss,
        hit,
        total_size: hit.offset + hit.size,
    }
}

/// Copies the queried group handles into their record positions. `handles`
/// holds the tightly packed handles in group order: raygen, miss groups,
/// hit groups.
pub(crate) fn fill_records(
    dst: &mut [u8],
    handles: &[u8],
    handle_size: usize,
    layout: &RecordLayout,
    miss_count: usize,
    hit_count: usize,
) {
    let handle = |group: usize| &handles[group * handle_size..(group + 1) * handle_size];

    let raygen_at = layout.raygen.offset as usize;
    dst[raygen_at..raygen_at + handle_size].copy_from_slice(handle(0));

    for i in 0..miss_count {
        let at = (layout.miss.offset + i as u64 * layout.miss.stride) as usize;
        dst[at..at + handle_size].copy_from_slice(handle(1 + i));
    }
    for i in 0..hit_count {
        let at = (layout.hit.offset + i as u64 * layout.hit.stride) as usize;
        dst[at..at + handle_size].copy_from_slice(handle(1 + miss_count + i));
    }
}

/// The built table: the backing buffer and the four strided regions
/// `vkCmdTraceRaysKHR` consumes.
pub struct ShaderBindingTable {
    allocator: Arc<dyn BufferAllocator>,
    buffer: Option<AllocatedBuffer>,
    raygen: vk::StridedDeviceAddressRegionKHR,
    miss: vk::StridedDeviceAddressRegionKHR,
    hit: vk::StridedDeviceAddressRegionKHR,
    callable: vk::StridedDeviceAddressRegionKHR,
}

impl ShaderBindingTable {
    /// Builds the table from the pipeline's queried group handles.
    pub(crate) fn new(
        allocator: Arc<dyn BufferAllocator>,
        limits: &DeviceBindingLimits,
        handles: &[u8],
        miss_count: usize,
        hit_count: usize,
    ) -> Result<ShaderBindingTable, AllocError> {
        let layout = record_layout(limits, miss_count as u64, hit_count as u64);

        let buffer = allocator.create_buffer(&BufferRequest {
            size: layout.total_size,
            usage: vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            host_visible: true,
        })?;

        if let Some(mapped) = unsafe { buffer.mapped_slice() } {
            fill_records(
                mapped,
                handles,
                limits.shader_group_handle_size as usize,
                &layout,
                miss_count,
                hit_count,
            );
        }

        let base = buffer.device_address;
        let region = |r: RegionLayout| {
            vk::StridedDeviceAddressRegionKHR::default()
                .device_address(base + r.offset)
                .stride(r.stride)
                .size(r.size)
        };

        Ok(ShaderBindingTable {
            allocator,
            raygen: region(layout.raygen),
            miss: region(layout.miss),
            hit: region(layout.hit),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
            buffer: Some(buffer),
        })
    }

    pub fn regions(
        &self,
    ) -> (
        &vk::StridedDeviceAddressRegionKHR,
        &vk::StridedDeviceAddressRegionKHR,
        &vk::StridedDeviceAddressRegionKHR,
        &vk::StridedDeviceAddressRegionKHR,
    ) {
        (&self.raygen, &self.miss, &self.hit, &self.callable)
    }
}

impl Drop for ShaderBindingTable {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.allocator.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> DeviceBindingLimits {
        DeviceBindingLimits {
            min_uniform_buffer_offset_alignment: 256,
            shader_group_handle_size: 32,
            shader_group_handle_alignment: 64,
            shader_group_base_alignment: 128,
        }
    }

    #[test]
    fn regions_start_on_base_alignment() {
        let layout = record_layout(&limits(), 2, 1);

        assert_eq!(layout.raygen, RegionLayout { offset: 0, stride: 128, size: 128 });
        // Two miss records of 64 aligned bytes round up to the base
        // alignment.
        assert_eq!(layout.miss, RegionLayout { offset: 128, stride: 64, size: 128 });
        assert_eq!(layout.hit, RegionLayout { offset: 256, stride: 64, size: 128 });
        assert_eq!(layout.total_size, 384);
    }

    #[test]
    fn handles_land_at_their_record_offsets() {
        let limits = limits();
        let layout = record_layout(&limits, 1, 1);
        let handle_size = limits.shader_group_handle_size as usize;

        let mut handles = vec![0u8; handle_size * 3];
        for (group, chunk) in handles.chunks_mut(handle_size).enumerate() {
            chunk.fill(group as u8 + 1);
        }

        let mut table = vec![0u8; layout.total_size as usize];
        fill_records(&mut table, &handles, handle_size, &layout, 1, 1);

        assert!(table[..handle_size].iter().all(|&b| b == 1));
        let miss_at = layout.miss.offset as usize;
        assert!(table[miss_at..miss_at + handle_size].iter().all(|&b| b == 2));
        let hit_at = layout.hit.offset as usize;
        assert!(table[hit_at..hit_at + handle_size].iter().all(|&b| b == 3));
    }
}
