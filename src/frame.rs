//! Per-in-flight-frame backing state for one pipeline.
//!
//! Each frame slot owns its own persistently mapped uniform arena, so a host
//! write for frame *k* can never touch bytes frame *k - N* is still reading
//! on the GPU. Push-constant data is staged once, frame independent, because
//! it is re-recorded into the command stream on every bind.

use crate::binding::Binding;
use crate::context::{AllocError, AllocatedBuffer, BufferAllocator, BufferRequest};
use crate::pipeline::merge::MergedLayout;
use crate::reflect::UniformRegion;
use ash::vk;
use foldhash::HashMap;
use log::warn;
use std::sync::Arc;

pub struct FrameResources {
    allocator: Arc<dyn BufferAllocator>,
    /// One uniform arena per frame slot; empty when the pipeline has no
    /// uniform data at all.
    arenas: Vec<AllocatedBuffer>,
    push_data: Vec<u8>,
    regions: HashMap<(u32, u32), UniformRegion>,
}

impl FrameResources {
    pub fn new(
        allocator: Arc<dyn BufferAllocator>,
        frames_in_flight: usize,
        layout: &MergedLayout,
    ) -> Result<FrameResources, AllocError> {
        let mut arenas = Vec::new();
        if layout.uniform_size > 0 {
            let request = BufferRequest {
                size: layout.uniform_size,
                usage: vk::BufferUsageFlags::UNIFORM_BUFFER,
                host_visible: true,
            };
            for _ in 0..frames_in_flight {
                match allocator.create_buffer(&request) {
                    Ok(buffer) => arenas.push(buffer),
                    Err(e) => {
                        for arena in arenas.drain(..) {
                            allocator.destroy_buffer(arena);
                        }
                        return Err(e);
                    }
                }
            }
        }

        let regions = layout
            .uniform_regions
            .iter()
            .map(|r| ((r.set, r.slot), *r))
            .collect();

        Ok(FrameResources {
            allocator,
            arenas,
            push_data: vec![0; layout.push_constant_size() as usize],
            regions,
        })
    }

    pub fn arena(&self, frame_slot: usize) -> Option<&AllocatedBuffer> {
        self.arenas.get(frame_slot)
    }

    pub fn region(&self, set: u32, slot: u32) -> Option<&UniformRegion> {
        self.regions.get(&(set, slot))
    }

    /// The staged push-constant bytes recorded on every bind.
    pub fn push_bytes(&self) -> &[u8] {
        &self.push_data
    }

    /// Copies `data` into the uniform region backing `binding` in the given
    /// frame slot's arena. Writes that would run past the region are logged
    /// and truncated at the boundary.
    pub fn write_uniform(
        &mut self,
        frame_slot: usize,
        binding: &Binding,
        data: &[u8],
        element_size: usize,
    ) {
        let Some(region) = self.regions.get(&(binding.set, binding.slot)).copied() else {
            warn!(
                "parameter `{}` has no backing uniform region (set {} slot {})",
                binding.name, binding.set, binding.slot
            );
            return;
        };
        let Some(arena) = self.arenas.get_mut(frame_slot) else {
            warn!(
                "frame slot {frame_slot} out of range for parameter `{}`",
                binding.name
            );
            return;
        };

        // Mapping exists by construction, the arena was requested host
        // visible.
        let Some(mapped) = (unsafe { arena.mapped_slice() }) else {
            return;
        };
        let start = region.offset as usize;
        let end = start + region.size as usize;
        let dst = &mut mapped[start..end];

        copy_strided(
            &binding.name,
            dst,
            binding.byte_offset as usize,
            data,
            element_size,
            binding.element_stride as usize,
        );
    }

    /// Copies `data` into the push-constant staging at the binding's
    /// pipeline-wide offset.
    pub fn write_push(&mut self, binding: &Binding, data: &[u8], element_size: usize) {
        copy_strided(
            &binding.name,
            &mut self.push_data,
            binding.byte_offset as usize,
            data,
            element_size,
            binding.element_stride as usize,
        );
    }

    /// Read-back of one frame slot's copy of a uniform region.
    pub fn uniform_bytes(&self, frame_slot: usize, set: u32, slot: u32) -> Option<&[u8]> {
        let region = self.regions.get(&(set, slot))?;
        let arena = self.arenas.get(frame_slot)?;
        let mapped = unsafe { arena.mapped_slice()? };
        let start = region.offset as usize;
        Some(&mapped[start..start + region.size as usize])
    }
}

impl Drop for FrameResources {
    fn drop(&mut self) {
        for arena in self.arenas.drain(..) {
            self.allocator.destroy_buffer(arena);
        }
    }
}

/// Copies `data` to `dst` starting at `offset`, one straight copy when the
/// stride matches the natural element size (or the value is not an array),
/// otherwise element by element at `offset + i * stride`.
fn copy_strided(
    name: &str,
    dst: &mut [u8],
    offset: usize,
    data: &[u8],
    element_size: usize,
    stride: usize,
) {
    if stride == 0 || stride == element_size || element_size == 0 {
        let avail = dst.len().saturating_sub(offset);
        let n = data.len().min(avail);
        if n < data.len() {
            warn!("write of {} bytes to `{name}` truncated to {n}", data.len());
        }
        if n > 0 {
            dst[offset..offset + n].copy_from_slice(&data[..n]);
        }
        return;
    }

    let count = data.len() / element_size;
    for i in 0..count {
        let dst_start = offset + i * stride;
        if dst_start + element_size > dst.len() {
            warn!(
                "strided write to `{name}` truncated after {i} of {count} elements"
            );
            return;
        }
        let src = &data[i * element_size..(i + 1) * element_size];
        dst[dst_start..dst_start + element_size].copy_from_slice(src);
    }
}
