// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Descriptors
//!
//! (◕‿◕)︵‿︵‿︵‿︵┻━┻
//!
//! Somebody else's descriptor layout, written down exactly once.  The geometry is still:
//!
//!   `[DescriptorSet[Binding[ArrayIndex]]]`
//!
//! Bindings are kept sorted so that rollover from one binding into the next during a write can just
//! walk forward.  A binding with a variable descriptor count must be the highest-numbered binding in
//! the set, otherwise "the last array" would not be well defined.

use ash::vk;

use crate::prelude::*;

/// Descriptor types collapsed to what the validator cares about.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorClass {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
    UniformBuffer,
    StorageBuffer,
    UniformBufferDynamic,
    StorageBufferDynamic,
    InputAttachment,
    InlineUniformBlock,
    AccelerationStructure,
}

impl DescriptorClass {
    pub fn is_buffer(&self) -> bool {
        matches!(
            self,
            DescriptorClass::UniformBuffer
                | DescriptorClass::StorageBuffer
                | DescriptorClass::UniformBufferDynamic
                | DescriptorClass::StorageBufferDynamic
        )
    }

    pub fn is_texel_buffer(&self) -> bool {
        matches!(
            self,
            DescriptorClass::UniformTexelBuffer | DescriptorClass::StorageTexelBuffer
        )
    }

    pub fn is_image(&self) -> bool {
        matches!(
            self,
            DescriptorClass::CombinedImageSampler
                | DescriptorClass::SampledImage
                | DescriptorClass::StorageImage
                | DescriptorClass::InputAttachment
        )
    }
}

impl TryFrom<vk::DescriptorType> for DescriptorClass {
    type Error = VulkanError;

    fn try_from(ty: vk::DescriptorType) -> Result<Self, Self::Error> {
        Ok(match ty {
            vk::DescriptorType::SAMPLER => DescriptorClass::Sampler,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER => DescriptorClass::CombinedImageSampler,
            vk::DescriptorType::SAMPLED_IMAGE => DescriptorClass::SampledImage,
            vk::DescriptorType::STORAGE_IMAGE => DescriptorClass::StorageImage,
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER => DescriptorClass::UniformTexelBuffer,
            vk::DescriptorType::STORAGE_TEXEL_BUFFER => DescriptorClass::StorageTexelBuffer,
            vk::DescriptorType::UNIFORM_BUFFER => DescriptorClass::UniformBuffer,
            vk::DescriptorType::STORAGE_BUFFER => DescriptorClass::StorageBuffer,
            vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC => DescriptorClass::UniformBufferDynamic,
            vk::DescriptorType::STORAGE_BUFFER_DYNAMIC => DescriptorClass::StorageBufferDynamic,
            vk::DescriptorType::INPUT_ATTACHMENT => DescriptorClass::InputAttachment,
            vk::DescriptorType::INLINE_UNIFORM_BLOCK => DescriptorClass::InlineUniformBlock,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR => {
                DescriptorClass::AccelerationStructure
            }
            other => return Err(VulkanError::UnsupportedDescriptorType(other)),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingLayout {
    pub binding: u32,
    pub class: DescriptorClass,
    /// Declared array length.  For a variable-count binding this is the upper bound.
    pub count: u32,
    pub flags: vk::DescriptorBindingFlags,
    pub stages: vk::ShaderStageFlags,
}

impl BindingLayout {
    pub fn partially_bound(&self) -> bool {
        self.flags
            .contains(vk::DescriptorBindingFlags::PARTIALLY_BOUND)
    }

    pub fn update_after_bind(&self) -> bool {
        self.flags
            .contains(vk::DescriptorBindingFlags::UPDATE_AFTER_BIND)
    }

    pub fn variable_count(&self) -> bool {
        self.flags
            .contains(vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorSetLayout {
    bindings: Vec<BindingLayout>,
}

impl DescriptorSetLayout {
    /// `flags` is either empty or parallel to `bindings`, like
    /// `VkDescriptorSetLayoutBindingFlagsCreateInfo`.
    pub fn new(
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
        flags: &[vk::DescriptorBindingFlags],
    ) -> Result<Self, VulkanError> {
        if !flags.is_empty() && flags.len() != bindings.len() {
            return Err(VulkanError::BindingFlagsMismatch {
                bindings: bindings.len(),
                flags: flags.len(),
            });
        }

        let mut layouts = bindings
            .iter()
            .enumerate()
            .map(|(i, b)| {
                Ok(BindingLayout {
                    binding: b.binding,
                    class: DescriptorClass::try_from(b.descriptor_type)?,
                    count: b.descriptor_count,
                    flags: flags.get(i).copied().unwrap_or_default(),
                    stages: b.stage_flags,
                })
            })
            .collect::<Result<Vec<_>, VulkanError>>()?;
        layouts.sort_by_key(|b| b.binding);

        for pair in layouts.windows(2) {
            if pair[0].binding == pair[1].binding {
                return Err(VulkanError::DuplicateBinding(pair[0].binding));
            }
        }
        if let Some(last) = layouts.len().checked_sub(1) {
            if let Some(early) = layouts[..last].iter().find(|b| b.variable_count()) {
                return Err(VulkanError::VariableCountNotLast(early.binding));
            }
        }

        Ok(Self { bindings: layouts })
    }

    pub fn bindings(&self) -> &[BindingLayout] {
        &self.bindings
    }

    pub fn binding(&self, binding: u32) -> Option<&BindingLayout> {
        self.bindings
            .binary_search_by_key(&binding, |b| b.binding)
            .ok()
            .map(|i| &self.bindings[i])
    }

    /// The binding whose length is chosen at allocation time, if any.
    pub fn variable_binding(&self) -> Option<&BindingLayout> {
        self.bindings.last().filter(|b| b.variable_count())
    }

    /// The first binding numbered above `binding`.  Used for write rollover.
    pub fn next_binding(&self, binding: u32) -> Option<&BindingLayout> {
        let i = self.bindings.partition_point(|b| b.binding <= binding);
        self.bindings.get(i)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn binding(n: u32, ty: vk::DescriptorType, count: u32) -> vk::DescriptorSetLayoutBinding<'static> {
        vk::DescriptorSetLayoutBinding::default()
            .binding(n)
            .descriptor_type(ty)
            .descriptor_count(count)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
    }

    #[test]
    fn test_sorted_lookup() {
        let layout = DescriptorSetLayout::new(
            &[
                binding(4, vk::DescriptorType::STORAGE_BUFFER, 8),
                binding(1, vk::DescriptorType::SAMPLED_IMAGE, 2),
            ],
            &[],
        )
        .unwrap();
        assert_eq!(layout.bindings()[0].binding, 1);
        assert_eq!(layout.binding(4).unwrap().class, DescriptorClass::StorageBuffer);
        assert!(layout.binding(2).is_none());
        assert_eq!(layout.next_binding(1).unwrap().binding, 4);
        assert!(layout.next_binding(4).is_none());
        assert!(layout.variable_binding().is_none());
    }

    #[test]
    fn test_variable_count_must_be_last() {
        let bindings = [
            binding(0, vk::DescriptorType::STORAGE_BUFFER, 8),
            binding(1, vk::DescriptorType::STORAGE_BUFFER, 8),
        ];
        let variable = vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT;
        let none = vk::DescriptorBindingFlags::empty();

        assert_eq!(
            DescriptorSetLayout::new(&bindings, &[variable, none]),
            Err(VulkanError::VariableCountNotLast(0))
        );
        let layout = DescriptorSetLayout::new(&bindings, &[none, variable]).unwrap();
        assert_eq!(layout.variable_binding().unwrap().binding, 1);
        assert_eq!(
            DescriptorSetLayout::new(&bindings, &[none]),
            Err(VulkanError::BindingFlagsMismatch {
                bindings: 2,
                flags: 1
            })
        );
    }

    #[test]
    fn test_duplicate_binding() {
        let bindings = [
            binding(3, vk::DescriptorType::STORAGE_BUFFER, 1),
            binding(3, vk::DescriptorType::UNIFORM_BUFFER, 1),
        ];
        assert_eq!(
            DescriptorSetLayout::new(&bindings, &[]),
            Err(VulkanError::DuplicateBinding(3))
        );
    }
}
