// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! GPU-assisted memory-safety validation for Vulkan.
//!
//! Shaders are rewritten so that every risky memory access first asks the host's recorded truth
//! whether it is allowed.  Failed checks leave records in a per-command-buffer feedback buffer,
//! which is decoded into human-readable diagnostics once the submission completes.  Nothing here
//! talks to a driver.  The application, or the layer embedding this crate, feeds the Vulkan calls
//! it observes into a [`ValidationContext`] in call order.
//!
//! The pieces, bottom up:
//!
//! - [`registry`] knows which device addresses belong to which resource, and which used to.
//! - [`descriptors`] knows what every descriptor slot was written with.
//! - [`pipeline`] instruments shaders and remembers what every check site guards.
//! - [`coordinator`] owns feedback channels and their lifecycle per command buffer.
//! - [`diagnostics`] turns records into deduplicated [`DiagnosticEvent`]s.
//! - [`device`] is the host model of the check routines shaders call.

pub mod context;
pub mod coordinator;
pub mod descriptors;
pub mod device;
pub mod diagnostics;
pub mod pipeline;
pub mod registry;
pub mod resource;
pub mod settings;

pub use context::ValidationContext;
pub use diagnostics::{Category, DiagnosticEvent, DiagnosticSink};
pub use settings::Settings;

use gpuav_vulkan::handle::ObjectHandle;

pub mod prelude {
    pub use super::GpuavError;
    pub use crate::context::{BufferInfo, DescriptorInfo, ValidationContext, WriteInfo};
    pub use crate::diagnostics::{
        Category, CollectingSink, DiagnosticEvent, DiagnosticSink, TracingSink,
    };
    pub use crate::settings::Settings;
    pub use gpuav_vulkan::prelude::*;
}

#[derive(thiserror::Error, Debug)]
pub enum GpuavError {
    #[error("address registry: {0}")]
    Registry(#[from] registry::RegistryError),

    #[error("descriptors: {0}")]
    Descriptor(#[from] descriptors::DescriptorError),

    #[error("submission: {0}")]
    Coordinator(#[from] coordinator::CoordinatorError),

    #[error("feedback: {0}")]
    Feedback(#[from] gpuav_feedback::FeedbackError),

    #[error("shader instrumentation: {0}")]
    Spirv(#[from] gpuav_spirv::SpirvError),

    #[error("Vulkan: {0}")]
    Vulkan(#[from] gpuav_vulkan::VulkanError),

    #[error("configuration: {0}")]
    Config(String),

    #[error("configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} is not known to the validator")]
    UnknownObject(ObjectHandle),

    #[error("{0} already exists")]
    DuplicateObject(ObjectHandle),

    #[error("validator state poisoned")]
    Poison,
}

impl<T> From<std::sync::PoisonError<T>> for GpuavError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        GpuavError::Poison
    }
}
