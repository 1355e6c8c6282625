//! Values accepted by `set_parameter` and the validation that turns a
//! `(binding, value)` pair into a concrete update.
//!
//! Validation is separated from execution: [`plan_update`] is a pure function
//! from a binding record and a value to either a host write or a descriptor
//! write, so every mismatch rule is testable without a device.

use crate::binding::{Binding, ResourceKind};
use ash::vk;
use log::warn;
use std::borrow::Cow;

/// A buffer handle bound to a storage-buffer parameter.
#[derive(Clone, Copy, Debug)]
pub struct BufferBinding {
    pub buffer: vk::Buffer,
    pub offset: u64,
    /// Bound range; `vk::WHOLE_SIZE` to bind to the end.
    pub range: u64,
    /// Actual data size, used for the element-stride divisibility check.
    /// Zero skips the check.
    pub data_size: u64,
}

/// An image view bound to a sampled- or storage-image parameter.
#[derive(Clone, Copy, Debug)]
pub struct ImageBinding {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    /// Sampler for combined bindings; the context's default sampler is used
    /// when absent.
    pub sampler: Option<vk::Sampler>,
}

/// A value passed to [`set_parameter`](crate::pipeline::Pipeline::set_parameter).
#[derive(Clone, Copy, Debug)]
pub enum ParameterValue<'a> {
    /// Raw bytes of one plain-old-data value.
    Bytes(&'a [u8]),
    /// Normalized to a 4-byte integer word before writing, matching the
    /// shader-side layout of `bool`.
    Bool(bool),
    /// A contiguous run of elements, copied with the binding's stride.
    Slice {
        data: &'a [u8],
        element_size: usize,
    },
    Buffer(BufferBinding),
    Image(ImageBinding),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

impl<'a> ParameterValue<'a> {
    pub fn pod<T: bytemuck::Pod>(value: &'a T) -> Self {
        ParameterValue::Bytes(bytemuck::bytes_of(value))
    }

    pub fn pod_slice<T: bytemuck::Pod>(values: &'a [T]) -> Self {
        ParameterValue::Slice {
            data: bytemuck::cast_slice(values),
            element_size: std::mem::size_of::<T>(),
        }
    }

    fn described(&self) -> &'static str {
        match self {
            ParameterValue::Bytes(_) => "raw data",
            ParameterValue::Bool(_) => "bool",
            ParameterValue::Slice { .. } => "element slice",
            ParameterValue::Buffer(_) => "buffer",
            ParameterValue::Image(_) => "image",
            ParameterValue::AccelerationStructure(_) => "acceleration structure",
        }
    }
}

/// Non-fatal problems with a parameter update. The update is dropped, all
/// staged data and descriptor tables stay untouched.
#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParameterWarning {
    #[error("shader parameter `{name}` not found")]
    UnknownName { name: String },
    #[error("parameter `{name}` is a {expected}, a {provided} cannot be bound to it")]
    KindMismatch {
        name: String,
        expected: ResourceKind,
        provided: &'static str,
    },
    #[error("parameter `{name}` has no bindable representation")]
    Unsupported { name: String },
}

/// Where a validated update goes.
#[derive(Debug)]
pub(crate) enum UpdateAction<'a> {
    /// Copy into the frame's uniform arena or the push-constant staging.
    Host {
        bytes: Cow<'a, [u8]>,
        element_size: usize,
    },
    Descriptor(DescriptorWrite),
}

#[derive(Debug)]
pub(crate) enum DescriptorWrite {
    Buffer(BufferBinding),
    Image { image: ImageBinding, storage: bool },
    AccelerationStructure(vk::AccelerationStructureKHR),
}

fn mismatch(binding: &Binding, value: &ParameterValue<'_>) -> ParameterWarning {
    ParameterWarning::KindMismatch {
        name: binding.name.clone(),
        expected: binding.resource_kind,
        provided: value.described(),
    }
}

/// Validates `value` against `binding` and decides the update to perform.
pub(crate) fn plan_update<'a>(
    binding: &Binding,
    value: ParameterValue<'a>,
) -> Result<UpdateAction<'a>, ParameterWarning> {
    if binding.resource_kind == ResourceKind::Unsupported {
        return Err(ParameterWarning::Unsupported {
            name: binding.name.clone(),
        });
    }

    match value {
        ParameterValue::Bytes(data) => {
            if !binding.is_host_backed() {
                return Err(mismatch(binding, &value));
            }
            Ok(UpdateAction::Host {
                bytes: Cow::Borrowed(data),
                element_size: data.len(),
            })
        }
        ParameterValue::Bool(b) => {
            if !binding.is_host_backed() {
                return Err(mismatch(binding, &value));
            }
            let word: i32 = if b { 1 } else { 0 };
            Ok(UpdateAction::Host {
                bytes: Cow::Owned(word.to_le_bytes().to_vec()),
                element_size: 4,
            })
        }
        ParameterValue::Slice { data, element_size } => {
            if !binding.is_host_backed() {
                return Err(mismatch(binding, &value));
            }
            Ok(UpdateAction::Host {
                bytes: Cow::Borrowed(data),
                element_size,
            })
        }
        ParameterValue::Buffer(buffer) => {
            if binding.resource_kind != ResourceKind::StorageBuffer {
                return Err(mismatch(binding, &value));
            }
            if binding.element_stride != 0
                && buffer.data_size != 0
                && buffer.data_size % binding.element_stride != 0
            {
                warn!(
                    "buffer bound to `{}` holds {} bytes, not a multiple of the element \
                     stride {}",
                    binding.name, buffer.data_size, binding.element_stride
                );
            }
            Ok(UpdateAction::Descriptor(DescriptorWrite::Buffer(buffer)))
        }
        ParameterValue::Image(image) => {
            let storage = match binding.resource_kind {
                ResourceKind::SampledImage => false,
                ResourceKind::StorageImage => true,
                _ => return Err(mismatch(binding, &value)),
            };
            Ok(UpdateAction::Descriptor(DescriptorWrite::Image {
                image,
                storage,
            }))
        }
        ParameterValue::AccelerationStructure(handle) => {
            if binding.resource_kind != ResourceKind::AccelerationStructure {
                return Err(mismatch(binding, &value));
            }
            Ok(UpdateAction::Descriptor(
                DescriptorWrite::AccelerationStructure(handle),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(kind: ResourceKind) -> Binding {
        Binding {
            name: "p".into(),
            set: 0,
            slot: 0,
            byte_offset: 0,
            byte_size: 4,
            element_stride: 0,
            element_count: 0,
            resource_kind: kind,
            is_push_constant: kind == ResourceKind::PushConstant,
            is_variable_sized_array: false,
            push_range: 0,
        }
    }

    #[test]
    fn bool_normalizes_to_a_four_byte_word() {
        let b = binding(ResourceKind::PushConstant);
        let action = plan_update(&b, ParameterValue::Bool(true)).unwrap();
        match action {
            UpdateAction::Host {
                bytes,
                element_size,
            } => {
                assert_eq!(bytes.as_ref(), &1i32.to_le_bytes());
                assert_eq!(element_size, 4);
            }
            other => panic!("expected host write, got {other:?}"),
        }
    }

    #[test]
    fn image_against_buffer_binding_is_rejected() {
        let b = binding(ResourceKind::StorageBuffer);
        let image = ImageBinding {
            view: vk::ImageView::null(),
            layout: vk::ImageLayout::GENERAL,
            sampler: None,
        };
        let err = plan_update(&b, ParameterValue::Image(image)).unwrap_err();
        assert_eq!(
            err,
            ParameterWarning::KindMismatch {
                name: "p".into(),
                expected: ResourceKind::StorageBuffer,
                provided: "image",
            }
        );
    }

    #[test]
    fn raw_data_against_image_binding_is_rejected() {
        let b = binding(ResourceKind::SampledImage);
        let err = plan_update(&b, ParameterValue::Bytes(&[0; 4])).unwrap_err();
        assert!(matches!(err, ParameterWarning::KindMismatch { .. }));
    }

    #[test]
    fn indivisible_buffer_size_still_binds() {
        let mut b = binding(ResourceKind::StorageBuffer);
        b.element_stride = 48;
        let buffer = BufferBinding {
            buffer: vk::Buffer::null(),
            offset: 0,
            range: vk::WHOLE_SIZE,
            data_size: 100,
        };
        let action = plan_update(&b, ParameterValue::Buffer(buffer)).unwrap();
        assert!(matches!(
            action,
            UpdateAction::Descriptor(DescriptorWrite::Buffer(_))
        ));
    }

    #[test]
    fn unsupported_kind_rejects_every_value() {
        let b = binding(ResourceKind::Unsupported);
        let err = plan_update(&b, ParameterValue::Bytes(&[0; 4])).unwrap_err();
        assert_eq!(err, ParameterWarning::Unsupported { name: "p".into() });
    }

    #[test]
    fn pod_slice_carries_element_size() {
        let values = [1.0f32, 2.0, 3.0];
        match ParameterValue::pod_slice(&values) {
            ParameterValue::Slice { data, element_size } => {
                assert_eq!(data.len(), 12);
                assert_eq!(element_size, 4);
            }
            other => panic!("unexpected value {other:?}"),
        }
    }
}
