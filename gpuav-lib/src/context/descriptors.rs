// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Descriptors
//!
//! Layouts, sets and the writes into them, translated from Vulkan handles into the binding table's
//! own identities.  A write captures the liveness of everything the descriptor points through, so
//! a texel buffer dies with its view or with the buffer under it.

use std::sync::Arc;

use ash::vk;
use gpuav_vulkan::descriptors::DescriptorSetLayout;
use gpuav_vulkan::handle::ObjectHandle;
use smallvec::SmallVec;

use super::ValidationContext;
use crate::GpuavError;
use crate::descriptors::{BoundDescriptor, BoundResource, DescriptorCopy, DescriptorWrite, SetId};
use crate::resource::{ResourceKind, ResourceTracker};

/// What one array element of a write points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorInfo {
    /// `range` may be `vk::WHOLE_SIZE`.
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    TexelBuffer(vk::BufferView),
    Image(vk::ImageView),
    Sampler(vk::Sampler),
    /// `VK_NULL_HANDLE`, legal only with `nullDescriptor`.
    Null,
}

/// One `VkWriteDescriptorSet`.  Writes longer than the binding roll over into the next one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteInfo {
    pub dst_set: vk::DescriptorSet,
    pub binding: u32,
    pub first_array_element: u32,
    pub descriptors: Vec<DescriptorInfo>,
}

/// One `VkCopyDescriptorSet`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopyInfo {
    pub src_set: vk::DescriptorSet,
    pub src_binding: u32,
    pub src_array_element: u32,
    pub dst_set: vk::DescriptorSet,
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub count: u32,
}

impl ValidationContext {
    /// `flags` is either empty or parallel to `bindings`.
    pub fn create_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
        flags: &[vk::DescriptorBindingFlags],
    ) -> Result<(), GpuavError> {
        let parsed = Arc::new(DescriptorSetLayout::new(bindings, flags)?);
        let mut objects = self.objects.write()?;
        if objects.set_layouts.contains_key(&layout) {
            return Err(GpuavError::DuplicateObject(layout.into()));
        }
        objects.set_layouts.insert(layout, parsed);
        Ok(())
    }

    pub fn destroy_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<(), GpuavError> {
        // Sets already allocated keep their own reference.
        self.objects
            .write()?
            .set_layouts
            .remove(&layout)
            .map(|_| ())
            .ok_or(GpuavError::UnknownObject(layout.into()))
    }

    /// `variable_count` comes from `VkDescriptorSetVariableDescriptorCountAllocateInfo`.  Without
    /// it a variable-count binding gets no usable slots.
    pub fn allocate_descriptor_set(
        &self,
        set: vk::DescriptorSet,
        layout: vk::DescriptorSetLayout,
        variable_count: Option<u32>,
    ) -> Result<SetId, GpuavError> {
        let mut objects = self.objects.write()?;
        if objects.sets.contains_key(&set) {
            return Err(GpuavError::DuplicateObject(set.into()));
        }
        let layout = objects
            .set_layouts
            .get(&layout)
            .cloned()
            .ok_or(GpuavError::UnknownObject(layout.into()))?;
        let id = self.descriptors.write()?.allocate(layout, variable_count)?;
        objects.sets.insert(set, id);
        Ok(id)
    }

    pub fn free_descriptor_set(&self, set: vk::DescriptorSet) -> Result<(), GpuavError> {
        let mut objects = self.objects.write()?;
        let id = *objects
            .sets
            .get(&set)
            .ok_or(GpuavError::UnknownObject(set.into()))?;
        self.descriptors.write()?.free(id)?;
        objects.sets.remove(&set);
        Ok(())
    }

    /// The id the binding table knows `set` by.
    pub fn set_id(&self, set: vk::DescriptorSet) -> Result<SetId, GpuavError> {
        self.objects
            .read()?
            .sets
            .get(&set)
            .copied()
            .ok_or(GpuavError::UnknownObject(set.into()))
    }

    /// Apply writes in order, like `vkUpdateDescriptorSets`.  On error, earlier writes stay
    /// applied.
    pub fn update_descriptor_sets(&self, writes: &[WriteInfo]) -> Result<(), GpuavError> {
        let objects = self.objects.read()?;
        let resources = self.resources.read()?;
        let mut descriptors = self.descriptors.write()?;
        for write in writes {
            let set = *objects
                .sets
                .get(&write.dst_set)
                .ok_or(GpuavError::UnknownObject(write.dst_set.into()))?;
            let resolved = write
                .descriptors
                .iter()
                .map(|info| resolve(&resources, info))
                .collect::<Result<Vec<_>, _>>()?;
            descriptors.bind_set(
                set,
                &[DescriptorWrite {
                    binding: write.binding,
                    first_array_element: write.first_array_element,
                    descriptors: resolved,
                }],
            )?;
        }
        Ok(())
    }

    pub fn copy_descriptor_sets(&self, copies: &[CopyInfo]) -> Result<(), GpuavError> {
        let objects = self.objects.read()?;
        let id = |set: vk::DescriptorSet| {
            objects
                .sets
                .get(&set)
                .copied()
                .ok_or(GpuavError::UnknownObject(set.into()))
        };
        let copies = copies
            .iter()
            .map(|c| {
                Ok(DescriptorCopy {
                    src_set: id(c.src_set)?,
                    src_binding: c.src_binding,
                    src_array_element: c.src_array_element,
                    dst_set: id(c.dst_set)?,
                    dst_binding: c.dst_binding,
                    dst_array_element: c.dst_array_element,
                    count: c.count,
                })
            })
            .collect::<Result<Vec<_>, GpuavError>>()?;
        self.descriptors.write()?.copy_descriptors(&copies)?;
        Ok(())
    }
}

/// Descriptor info to a bound descriptor.  `None` is a null descriptor.
fn resolve(
    resources: &ResourceTracker,
    info: &DescriptorInfo,
) -> Result<Option<BoundDescriptor>, GpuavError> {
    let lookup = move |handle: ObjectHandle| {
        resources
            .get(handle)
            .ok_or(GpuavError::UnknownObject(handle))
    };

    let mut liveness = SmallVec::new();
    let resource = match *info {
        DescriptorInfo::Null => return Ok(None),
        DescriptorInfo::Buffer {
            buffer,
            offset,
            range,
        } => {
            let tracked = lookup(buffer.into())?;
            let size = tracked
                .buffer_size()
                .ok_or(GpuavError::UnknownObject(buffer.into()))?;
            liveness.push(tracked.liveness.clone());
            let length = if range == vk::WHOLE_SIZE {
                size.saturating_sub(offset)
            } else {
                range
            };
            BoundResource::Buffer {
                buffer,
                offset,
                length,
            }
        }
        DescriptorInfo::TexelBuffer(view) => {
            let tracked = lookup(view.into())?;
            let ResourceKind::BufferView {
                buffer,
                range,
                texel_size,
                ..
            } = tracked.kind
            else {
                return Err(GpuavError::UnknownObject(view.into()));
            };
            liveness.push(tracked.liveness.clone());
            liveness.push(lookup(buffer.into())?.liveness.clone());
            BoundResource::TexelBuffer {
                view,
                buffer,
                length: range,
                texel_size,
            }
        }
        DescriptorInfo::Image(view) => {
            let tracked = lookup(view.into())?;
            let ResourceKind::ImageView { image } = tracked.kind else {
                return Err(GpuavError::UnknownObject(view.into()));
            };
            liveness.push(tracked.liveness.clone());
            liveness.push(lookup(image.into())?.liveness.clone());
            BoundResource::Image { view, image }
        }
        DescriptorInfo::Sampler(sampler) => {
            liveness.push(lookup(sampler.into())?.liveness.clone());
            BoundResource::Sampler(sampler)
        }
    };
    Ok(Some(BoundDescriptor { resource, liveness }))
}
