// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Handles
//!
//! Non-dispatchable handles are only unique per type, so identity is always the pair of object type
//! and raw value.

use std::fmt;

use ash::vk::{self, Handle};

/// Type-erased identity of a Vulkan object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub ty: vk::ObjectType,
    pub raw: u64,
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {:#x}", self.ty, self.raw)
    }
}

/// Every object a diagnostic can point at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectHandle {
    Buffer(vk::Buffer),
    BufferView(vk::BufferView),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    DeviceMemory(vk::DeviceMemory),
    AccelerationStructure(vk::AccelerationStructureKHR),
    DescriptorSet(vk::DescriptorSet),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
    CommandBuffer(vk::CommandBuffer),
}

macro_rules! handle_conversions {
    ($($variant:ident => $ty:ty, $object_type:expr;)*) => {
        $(
            impl From<$ty> for ObjectHandle {
                fn from(handle: $ty) -> Self {
                    ObjectHandle::$variant(handle)
                }
            }
        )*

        impl ObjectHandle {
            pub fn raw(&self) -> u64 {
                match self {
                    $(ObjectHandle::$variant(handle) => handle.as_raw(),)*
                }
            }

            pub fn object_type(&self) -> vk::ObjectType {
                match self {
                    $(ObjectHandle::$variant(_) => $object_type,)*
                }
            }
        }
    };
}

handle_conversions! {
    Buffer => vk::Buffer, vk::ObjectType::BUFFER;
    BufferView => vk::BufferView, vk::ObjectType::BUFFER_VIEW;
    Image => vk::Image, vk::ObjectType::IMAGE;
    ImageView => vk::ImageView, vk::ObjectType::IMAGE_VIEW;
    Sampler => vk::Sampler, vk::ObjectType::SAMPLER;
    DeviceMemory => vk::DeviceMemory, vk::ObjectType::DEVICE_MEMORY;
    AccelerationStructure => vk::AccelerationStructureKHR, vk::ObjectType::ACCELERATION_STRUCTURE_KHR;
    DescriptorSet => vk::DescriptorSet, vk::ObjectType::DESCRIPTOR_SET;
    DescriptorSetLayout => vk::DescriptorSetLayout, vk::ObjectType::DESCRIPTOR_SET_LAYOUT;
    Pipeline => vk::Pipeline, vk::ObjectType::PIPELINE;
    PipelineLayout => vk::PipelineLayout, vk::ObjectType::PIPELINE_LAYOUT;
    CommandBuffer => vk::CommandBuffer, vk::ObjectType::COMMAND_BUFFER;
}

impl ObjectHandle {
    pub fn id(&self) -> ObjectId {
        ObjectId {
            ty: self.object_type(),
            raw: self.raw(),
        }
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObjectHandle::Buffer(_) => "VkBuffer",
            ObjectHandle::BufferView(_) => "VkBufferView",
            ObjectHandle::Image(_) => "VkImage",
            ObjectHandle::ImageView(_) => "VkImageView",
            ObjectHandle::Sampler(_) => "VkSampler",
            ObjectHandle::DeviceMemory(_) => "VkDeviceMemory",
            ObjectHandle::AccelerationStructure(_) => "VkAccelerationStructureKHR",
            ObjectHandle::DescriptorSet(_) => "VkDescriptorSet",
            ObjectHandle::DescriptorSetLayout(_) => "VkDescriptorSetLayout",
            ObjectHandle::Pipeline(_) => "VkPipeline",
            ObjectHandle::PipelineLayout(_) => "VkPipelineLayout",
            ObjectHandle::CommandBuffer(_) => "VkCommandBuffer",
        };
        write!(f, "{name} {:#x}", self.raw())
    }
}
