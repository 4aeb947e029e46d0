// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Vulkan
//!
//! The words we use to talk about somebody else's device.
//!
//! Nothing here calls into a driver.  The validation engine watches a stream of API calls that
//! already happened and only needs to name things:
//!
//! - `ObjectHandle` and `ObjectId` for every object a diagnostic may point at
//! - `DescriptorSetLayout` and `BindingLayout` as seen at layout creation
//! - `DeviceCapabilities` for the few features that change what counts as valid

pub mod capabilities;
pub mod descriptors;
pub mod handle;

use ash::vk;

pub mod prelude {
    pub use super::VulkanError;
    pub use crate::capabilities::DeviceCapabilities;
    pub use crate::descriptors::{BindingLayout, DescriptorClass, DescriptorSetLayout};
    pub use crate::handle::{ObjectHandle, ObjectId};
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum VulkanError {
    #[error("descriptor type {0:?} is not supported")]
    UnsupportedDescriptorType(vk::DescriptorType),

    #[error("{flags} binding flags given for {bindings} bindings")]
    BindingFlagsMismatch { bindings: usize, flags: usize },

    #[error("binding {0} declared twice")]
    DuplicateBinding(u32),

    #[error("binding {0} has a variable descriptor count but is not the highest binding")]
    VariableCountNotLast(u32),
}
