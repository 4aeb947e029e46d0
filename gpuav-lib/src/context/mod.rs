// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Context
//!
//! All validation state of one logical device, owned by whoever embeds the validator and passed by
//! reference.  Methods mirror the Vulkan calls that matter and must be fed in the order the
//! application made them.
//!
//! The registry, binding table and resource tracker each sit behind their own `RwLock`.  Recording
//! threads mostly read, creation and destruction write.  When more than one lock is needed they are
//! always taken in field order below, which keeps concurrent calls from deadlocking.
//!
//! A submission is where host state and device state meet.  `queue_submit` snapshots descriptors and
//! addresses for every dispatch.  `submission_complete` decodes feedback, releases sets and
//! collects destroyed address ranges and shaders nobody can reach anymore.

pub mod descriptors;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use ash::vk;
use gpuav_spirv::InstrumentedShader;
use gpuav_vulkan::capabilities::DeviceCapabilities;
use gpuav_vulkan::descriptors::DescriptorSetLayout;
use gpuav_vulkan::handle::ObjectHandle;
use tracing::{debug, trace, warn};

use crate::GpuavError;
use crate::coordinator::{CommandBufferState, CoordinatorError, SubmissionCoordinator};
use crate::descriptors::{DescriptorBindingTable, SetId};
use crate::device::DeviceChecks;
use crate::diagnostics::{DiagnosticEvent, DiagnosticSink, TracingSink};
use crate::pipeline::{PipelineCache, PipelineLayout};
use crate::registry::{AddressRangeRegistry, RegistryError, SubmissionIndex};
use crate::resource::{ResourceKind, ResourceTracker};
use crate::settings::Settings;

pub use descriptors::{CopyInfo, DescriptorInfo, WriteInfo};

/// Buffer creation as far as validation cares.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferInfo {
    pub size: u64,
    /// From `vkGetBufferDeviceAddress`, when the buffer has one.
    pub device_address: Option<u64>,
    /// Backing allocation.  Ranges of different allocations may not overlap.
    pub memory: Option<vk::DeviceMemory>,
}

/// Handle-keyed objects that only describe other things.
#[derive(Default)]
struct Objects {
    set_layouts: HashMap<vk::DescriptorSetLayout, Arc<DescriptorSetLayout>>,
    pipeline_layouts: HashMap<vk::PipelineLayout, Arc<PipelineLayout>>,
    sets: HashMap<vk::DescriptorSet, SetId>,
}

pub struct ValidationContext {
    settings: Settings,
    capabilities: DeviceCapabilities,
    objects: RwLock<Objects>,
    resources: RwLock<ResourceTracker>,
    registry: RwLock<AddressRangeRegistry>,
    descriptors: RwLock<DescriptorBindingTable>,
    pipelines: Mutex<PipelineCache>,
    coordinator: Mutex<SubmissionCoordinator>,
    sink: Box<dyn DiagnosticSink>,
}

impl ValidationContext {
    /// Diagnostics go to `tracing`.
    pub fn new(settings: Settings, capabilities: DeviceCapabilities) -> Self {
        Self::with_sink(settings, capabilities, TracingSink)
    }

    pub fn with_sink(
        settings: Settings,
        capabilities: DeviceCapabilities,
        sink: impl DiagnosticSink + 'static,
    ) -> Self {
        debug!(?settings, ?capabilities, "validation context created");
        Self {
            objects: RwLock::default(),
            resources: RwLock::default(),
            registry: RwLock::default(),
            descriptors: RwLock::new(DescriptorBindingTable::new(capabilities.null_descriptor)),
            pipelines: Mutex::new(PipelineCache::new(settings.instrument_options())),
            coordinator: Mutex::new(SubmissionCoordinator::new(
                settings.feedback_capacity,
                settings.max_diagnostics,
            )),
            sink: Box::new(sink),
            settings,
            capabilities,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    // Resources

    pub fn create_buffer(&self, buffer: vk::Buffer, info: BufferInfo) -> Result<(), GpuavError> {
        let handle = ObjectHandle::from(buffer);
        let mut resources = self.resources.write()?;
        if resources.get(handle).is_some() {
            return Err(GpuavError::DuplicateObject(handle));
        }

        // Register first so a conflict leaves nothing half created.
        let range = match info.device_address {
            Some(address) => {
                let owner = info.memory.map_or(handle, ObjectHandle::from);
                Some(self.registry.write()?.insert(address, info.size, owner)?)
            }
            None => None,
        };
        resources.track(
            handle,
            ResourceKind::Buffer {
                size: info.size,
                device_address: info.device_address,
            },
        );
        if let Some(range) = range {
            resources.set_range(handle, range);
        }
        trace!(%handle, size = info.size, address = ?info.device_address, "buffer created");
        Ok(())
    }

    /// `buffer` occupies `[offset, offset + size)` of memory already registered for `target`.
    pub fn create_aliased_buffer(
        &self,
        buffer: vk::Buffer,
        target: vk::Buffer,
        offset: u64,
        size: u64,
    ) -> Result<(), GpuavError> {
        let handle = ObjectHandle::from(buffer);
        let target_handle = ObjectHandle::from(target);
        let mut resources = self.resources.write()?;
        if resources.get(handle).is_some() {
            return Err(GpuavError::DuplicateObject(handle));
        }
        let target_resource = resources
            .get(target_handle)
            .ok_or(GpuavError::UnknownObject(target_handle))?;
        let (Some(target_range), Some(base)) =
            (target_resource.range, target_resource.device_address())
        else {
            return Err(GpuavError::UnknownObject(target_handle));
        };

        let address = base
            .checked_add(offset)
            .ok_or(RegistryError::RangeOverflow { base, length: offset })?;
        let range = self
            .registry
            .write()?
            .insert_alias(target_range, address, size, handle)?;
        resources.track(
            handle,
            ResourceKind::Buffer {
                size,
                device_address: Some(address),
            },
        );
        resources.set_range(handle, range);
        trace!(%handle, target = %target_handle, offset, size, "aliased buffer created");
        Ok(())
    }

    /// `range` may be `vk::WHOLE_SIZE`.
    pub fn create_buffer_view(
        &self,
        view: vk::BufferView,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
        texel_size: u32,
    ) -> Result<(), GpuavError> {
        let mut resources = self.resources.write()?;
        let size = resources
            .get(buffer.into())
            .and_then(|r| r.buffer_size())
            .ok_or(GpuavError::UnknownObject(buffer.into()))?;
        let range = if range == vk::WHOLE_SIZE {
            size.saturating_sub(offset)
        } else {
            range
        };
        let kind = ResourceKind::BufferView {
            buffer,
            offset,
            range,
            texel_size,
        };
        track(&mut resources, view.into(), kind)
    }

    pub fn create_image(&self, image: vk::Image) -> Result<(), GpuavError> {
        track(&mut *self.resources.write()?, image.into(), ResourceKind::Image)
    }

    pub fn create_image_view(&self, view: vk::ImageView, image: vk::Image) -> Result<(), GpuavError> {
        let mut resources = self.resources.write()?;
        if resources.get(image.into()).is_none() {
            return Err(GpuavError::UnknownObject(image.into()));
        }
        track(&mut resources, view.into(), ResourceKind::ImageView { image })
    }

    pub fn create_sampler(&self, sampler: vk::Sampler) -> Result<(), GpuavError> {
        track(&mut *self.resources.write()?, sampler.into(), ResourceKind::Sampler)
    }

    /// Descriptors referencing the resource become `Destroyed`, its address range stops being live,
    /// and snapshots already taken see it gone.
    pub fn destroy_resource(&self, handle: impl Into<ObjectHandle>) -> Result<(), GpuavError> {
        let handle = handle.into();
        let mut resources = self.resources.write()?;
        let mut registry = self.registry.write()?;
        let mut descriptors = self.descriptors.write()?;
        let resource = resources
            .destroy(handle)
            .ok_or(GpuavError::UnknownObject(handle))?;

        if let Some(range) = resource.range {
            let after = self.coordinator.lock()?.last_submitted();
            registry.mark_destroyed(range, after)?;
        }
        descriptors.on_resource_destroyed(handle);
        trace!(%handle, "resource destroyed");
        Ok(())
    }

    // Pipelines

    pub fn create_pipeline_layout(
        &self,
        layout: vk::PipelineLayout,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<(), GpuavError> {
        let mut objects = self.objects.write()?;
        let sets = set_layouts
            .iter()
            .map(|l| {
                objects
                    .set_layouts
                    .get(l)
                    .cloned()
                    .ok_or(GpuavError::UnknownObject((*l).into()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        objects
            .pipeline_layouts
            .insert(layout, Arc::new(PipelineLayout::new(sets)));
        Ok(())
    }

    /// Instrument the compute shader `words` and remember the pipeline.  Returns the shader to hand
    /// to the driver in place of the original.
    pub fn create_compute_pipeline(
        &self,
        pipeline: vk::Pipeline,
        layout: vk::PipelineLayout,
        words: &[u32],
    ) -> Result<Arc<InstrumentedShader>, GpuavError> {
        let layout = self
            .objects
            .read()?
            .pipeline_layouts
            .get(&layout)
            .cloned()
            .ok_or(GpuavError::UnknownObject(layout.into()))?;
        let mut pipelines = self.pipelines.lock()?;
        Ok(pipelines.create_pipeline(pipeline, words, layout)?.shader.clone())
    }

    /// The pipeline's shader stays resolvable until every submission that could have run it has
    /// completed.
    pub fn destroy_pipeline(&self, pipeline: vk::Pipeline) -> Result<(), GpuavError> {
        let mut pipelines = self.pipelines.lock()?;
        let after = self.coordinator.lock()?.last_submitted();
        pipelines
            .destroy_pipeline(pipeline, after)
            .map(|_| ())
            .ok_or(GpuavError::UnknownObject(pipeline.into()))
    }

    // Command buffers

    pub fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<(), GpuavError> {
        self.coordinator.lock()?.attach(command_buffer)?;
        Ok(())
    }

    pub fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) -> Result<(), GpuavError> {
        if self.pipelines.lock()?.pipeline(pipeline).is_none() {
            return Err(GpuavError::UnknownObject(pipeline.into()));
        }
        self.coordinator
            .lock()?
            .bind_pipeline(command_buffer, pipeline)?;
        Ok(())
    }

    pub fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        first_set: u32,
        sets: &[vk::DescriptorSet],
    ) -> Result<(), GpuavError> {
        let ids = {
            let objects = self.objects.read()?;
            sets.iter()
                .map(|s| {
                    objects
                        .sets
                        .get(s)
                        .copied()
                        .ok_or(GpuavError::UnknownObject((*s).into()))
                })
                .collect::<Result<Vec<_>, _>>()?
        };
        self.coordinator
            .lock()?
            .bind_descriptor_sets(command_buffer, first_set, &ids)?;
        Ok(())
    }

    /// Returns the dispatch's index within the command buffer.
    pub fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer) -> Result<u16, GpuavError> {
        Ok(self.coordinator.lock()?.record_dispatch(command_buffer)?)
    }

    pub fn command_buffer_state(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<Option<CommandBufferState>, GpuavError> {
        Ok(self.coordinator.lock()?.state(command_buffer))
    }

    /// Resets and drops the command buffer's channel without decoding.
    pub fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) -> Result<(), GpuavError> {
        self.coordinator.lock()?.abandon(command_buffer)?;
        Ok(())
    }

    // Submission

    /// Arm the channels and take every snapshot the submission's dispatches will be checked against.
    pub fn queue_submit(
        &self,
        command_buffers: &[vk::CommandBuffer],
    ) -> Result<SubmissionIndex, GpuavError> {
        let resources = self.resources.read()?;
        let registry = self.registry.read()?;
        let mut descriptors = self.descriptors.write()?;
        let mut coordinator = self.coordinator.lock()?;

        let index = coordinator.on_submit(command_buffers)?;
        let addresses = Arc::new(registry.snapshot(|handle| resources.liveness(handle)));

        let mut snapshots = Vec::new();
        let mut failures = Vec::new();
        for cb in command_buffers {
            // Dispatch indices fit in u16, recording refuses any more.
            let dispatches = coordinator.dispatches(*cb).unwrap_or(&[]);
            for (i, dispatch) in (0u16..).zip(dispatches) {
                match descriptors.snapshot(&dispatch.sets) {
                    Ok(snapshot) => {
                        // Every set exists, the snapshot just looked them up.
                        for (_, set) in &dispatch.sets {
                            descriptors.mark_in_flight(*set)?;
                        }
                        snapshots.push((*cb, i, Arc::new(snapshot)));
                    }
                    // Nothing of an unverifiable dispatch is held in flight.
                    Err(e) => {
                        warn!(command_buffer = ?cb, dispatch = i, error = %e, "snapshot failed");
                        failures.push((*cb, i, e.to_string()));
                    }
                }
            }
        }
        for (cb, i, snapshot) in snapshots {
            coordinator.snapshot(cb, i, snapshot, addresses.clone())?;
        }
        for (cb, i, reason) in failures {
            coordinator.snapshot_failed(cb, i, reason)?;
        }
        debug!(index, addresses = addresses.len(), "submission snapshotted");
        Ok(index)
    }

    /// The submission's completion signal was observed.  Decoded events go to the sink and are
    /// returned.
    pub fn submission_complete(
        &self,
        index: SubmissionIndex,
    ) -> Result<Vec<DiagnosticEvent>, GpuavError> {
        let mut registry = self.registry.write()?;
        let mut descriptors = self.descriptors.write()?;
        let mut pipelines = self.pipelines.lock()?;
        let mut coordinator = self.coordinator.lock()?;

        let sets = coordinator.submission_sets(index);
        let events = coordinator.on_complete(index, pipelines.sites())?;
        for set in sets {
            descriptors.release(set);
        }
        let watermark = coordinator.completed_watermark();
        let collected = registry.collect_garbage(watermark);
        if collected > 0 {
            trace!(collected, "address ranges collected");
        }
        let retired = pipelines.collect_garbage(watermark);
        if retired > 0 {
            trace!(retired, "instrumented shaders dropped");
        }

        for event in &events {
            self.sink.report(event);
        }
        Ok(events)
    }

    /// Checks for dispatch `index` of a submitted command buffer, as the device would run them.
    pub fn device_checks(
        &self,
        command_buffer: vk::CommandBuffer,
        index: u16,
    ) -> Result<DeviceChecks, GpuavError> {
        let coordinator = self.coordinator.lock()?;
        let dispatch = coordinator
            .dispatches(command_buffer)
            .ok_or(CoordinatorError::UnknownCommandBuffer(command_buffer))?
            .get(index as usize)
            .ok_or(CoordinatorError::UnknownDispatch {
                command_buffer,
                index,
            })?;
        let missing = CoordinatorError::MissingSnapshot {
            command_buffer,
            index,
        };
        let (Some(snapshot), Some(addresses)) = (&dispatch.snapshot, &dispatch.addresses) else {
            return Err(missing.into());
        };
        let channel = coordinator
            .channel(command_buffer)
            .ok_or(CoordinatorError::UnknownCommandBuffer(command_buffer))?;
        Ok(DeviceChecks {
            snapshot: snapshot.clone(),
            addresses: addresses.clone(),
            channel,
            dispatch_index: index,
            sentinel: self.settings.sentinel_address,
        })
    }
}

fn track(
    resources: &mut ResourceTracker,
    handle: ObjectHandle,
    kind: ResourceKind,
) -> Result<(), GpuavError> {
    resources
        .track(handle, kind)
        .ok_or(GpuavError::DuplicateObject(handle))?;
    trace!(%handle, "resource created");
    Ok(())
}
