// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Submissions
//!
//! Every recorded command buffer owns one feedback channel.  The lifecycle is:
//!
//! ```text
//! Recording --submit--> Pending --complete--> Decoded --reset--> Idle
//!     ^                                                           |
//!     +-------------------------- re-record ----------------------+
//! ```
//!
//! Re-recording resets the channel even when the last results were never decoded.  Nothing is
//! decoded before the submission's completion signal, and a pending command buffer can be neither
//! re-recorded nor freed.
//!
//! Each dispatch remembers which pipeline and sets it ran with.  Snapshots are attached at submit
//! time, and a dispatch that reaches completion without one is reported as unverifiable instead of
//! silently passing.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ash::vk;
use gpuav_feedback::{ChannelState, FeedbackChannel, FeedbackError};
use tracing::{debug, trace, warn};

use crate::descriptors::{BindingSnapshot, SetId};
use crate::diagnostics::{Decoder, DiagnosticEvent};
use crate::pipeline::CheckSiteTable;
use crate::registry::{AddressTable, SubmissionIndex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandBufferState {
    Recording,
    Pending,
    Decoded,
    Idle,
}

/// One recorded dispatch and the state it will be judged against.
#[derive(Clone, Debug)]
pub struct Dispatch {
    pub pipeline: vk::Pipeline,
    /// `(set index, set)` bound when the dispatch was recorded.
    pub sets: Vec<(u32, SetId)>,
    pub snapshot: Option<Arc<BindingSnapshot>>,
    pub addresses: Option<Arc<AddressTable>>,
    /// Why this submission could not snapshot the dispatch.
    pub snapshot_error: Option<String>,
}

#[derive(Debug)]
struct Tracked {
    state: CommandBufferState,
    channel: Arc<FeedbackChannel>,
    bound_pipeline: Option<vk::Pipeline>,
    bound_sets: BTreeMap<u32, SetId>,
    dispatches: Vec<Dispatch>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("command buffer {0:?} was never begun")]
    UnknownCommandBuffer(vk::CommandBuffer),

    #[error("command buffer {0:?} is pending execution")]
    CommandBufferPending(vk::CommandBuffer),

    #[error("command buffer {0:?} is not recording")]
    NotRecording(vk::CommandBuffer),

    #[error("dispatch recorded in {0:?} without a bound pipeline")]
    NoPipelineBound(vk::CommandBuffer),

    #[error("command buffer {0:?} holds more dispatches than a record can name")]
    TooManyDispatches(vk::CommandBuffer),

    #[error("dispatch {index} does not exist in {command_buffer:?}")]
    UnknownDispatch {
        command_buffer: vk::CommandBuffer,
        index: u16,
    },

    #[error("dispatch {index} of {command_buffer:?} has no snapshot")]
    MissingSnapshot {
        command_buffer: vk::CommandBuffer,
        index: u16,
    },

    #[error("submission {0} is not pending")]
    UnknownSubmission(SubmissionIndex),

    #[error(transparent)]
    Feedback(#[from] FeedbackError),
}

pub struct SubmissionCoordinator {
    feedback_capacity: u32,
    max_diagnostics: usize,
    command_buffers: HashMap<vk::CommandBuffer, Tracked>,
    pending: BTreeMap<SubmissionIndex, Vec<vk::CommandBuffer>>,
    next_submission: SubmissionIndex,
}

impl SubmissionCoordinator {
    pub fn new(feedback_capacity: u32, max_diagnostics: usize) -> Self {
        Self {
            feedback_capacity,
            max_diagnostics,
            command_buffers: HashMap::new(),
            pending: BTreeMap::new(),
            next_submission: 1,
        }
    }

    /// Begin recording, with a clean channel.
    pub fn attach(
        &mut self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<Arc<FeedbackChannel>, CoordinatorError> {
        if let Some(tracked) = self.command_buffers.get_mut(&command_buffer) {
            if tracked.state == CommandBufferState::Pending {
                return Err(CoordinatorError::CommandBufferPending(command_buffer));
            }
            if tracked.channel.state() != ChannelState::Ready {
                debug!(?command_buffer, "re-recording resets undecoded feedback");
            }
            tracked.channel.reset();
            tracked.state = CommandBufferState::Recording;
            tracked.bound_pipeline = None;
            tracked.bound_sets.clear();
            tracked.dispatches.clear();
            return Ok(tracked.channel.clone());
        }

        let channel = Arc::new(FeedbackChannel::new(self.feedback_capacity)?);
        self.command_buffers.insert(
            command_buffer,
            Tracked {
                state: CommandBufferState::Recording,
                channel: channel.clone(),
                bound_pipeline: None,
                bound_sets: BTreeMap::new(),
                dispatches: Vec::new(),
            },
        );
        trace!(?command_buffer, "feedback channel attached");
        Ok(channel)
    }

    pub fn bind_pipeline(
        &mut self,
        command_buffer: vk::CommandBuffer,
        pipeline: vk::Pipeline,
    ) -> Result<(), CoordinatorError> {
        self.recording(command_buffer)?.bound_pipeline = Some(pipeline);
        Ok(())
    }

    pub fn bind_descriptor_sets(
        &mut self,
        command_buffer: vk::CommandBuffer,
        first_set: u32,
        sets: &[SetId],
    ) -> Result<(), CoordinatorError> {
        let tracked = self.recording(command_buffer)?;
        for (index, set) in (first_set..).zip(sets) {
            tracked.bound_sets.insert(index, *set);
        }
        Ok(())
    }

    /// Returns the dispatch index records of this dispatch will carry.
    pub fn record_dispatch(
        &mut self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<u16, CoordinatorError> {
        let tracked = self.recording(command_buffer)?;
        let pipeline = tracked
            .bound_pipeline
            .ok_or(CoordinatorError::NoPipelineBound(command_buffer))?;
        let index = u16::try_from(tracked.dispatches.len())
            .map_err(|_| CoordinatorError::TooManyDispatches(command_buffer))?;
        tracked.dispatches.push(Dispatch {
            pipeline,
            sets: tracked.bound_sets.iter().map(|(i, s)| (*i, *s)).collect(),
            snapshot: None,
            addresses: None,
            snapshot_error: None,
        });
        Ok(index)
    }

    /// Attach the state dispatch `index` will be checked against.
    pub fn snapshot(
        &mut self,
        command_buffer: vk::CommandBuffer,
        index: u16,
        snapshot: Arc<BindingSnapshot>,
        addresses: Arc<AddressTable>,
    ) -> Result<(), CoordinatorError> {
        let dispatch = self.dispatch_mut(command_buffer, index)?;
        dispatch.snapshot = Some(snapshot);
        dispatch.addresses = Some(addresses);
        dispatch.snapshot_error = None;
        Ok(())
    }

    /// Dispatch `index` runs unchecked this submission because of `reason`.
    pub fn snapshot_failed(
        &mut self,
        command_buffer: vk::CommandBuffer,
        index: u16,
        reason: String,
    ) -> Result<(), CoordinatorError> {
        let dispatch = self.dispatch_mut(command_buffer, index)?;
        dispatch.snapshot = None;
        dispatch.addresses = None;
        dispatch.snapshot_error = Some(reason);
        Ok(())
    }

    pub fn dispatches(&self, command_buffer: vk::CommandBuffer) -> Option<&[Dispatch]> {
        self.command_buffers
            .get(&command_buffer)
            .map(|t| t.dispatches.as_slice())
    }

    pub fn channel(&self, command_buffer: vk::CommandBuffer) -> Option<Arc<FeedbackChannel>> {
        self.command_buffers
            .get(&command_buffer)
            .map(|t| t.channel.clone())
    }

    pub fn state(&self, command_buffer: vk::CommandBuffer) -> Option<CommandBufferState> {
        self.command_buffers.get(&command_buffer).map(|t| t.state)
    }

    /// Hand the channels of `command_buffers` to the device.  Nothing changes on error.
    pub fn on_submit(
        &mut self,
        command_buffers: &[vk::CommandBuffer],
    ) -> Result<SubmissionIndex, CoordinatorError> {
        for (i, cb) in command_buffers.iter().enumerate() {
            let tracked = self.tracked(*cb)?;
            if tracked.state == CommandBufferState::Pending || command_buffers[..i].contains(cb) {
                return Err(CoordinatorError::CommandBufferPending(*cb));
            }
        }

        let index = self.next_submission;
        self.next_submission += 1;
        for cb in command_buffers {
            if let Some(tracked) = self.command_buffers.get_mut(cb) {
                // Resubmitting without re-recording reuses the channel cleared at completion.
                if tracked.channel.state() != ChannelState::Ready {
                    tracked.channel.reset();
                }
                tracked.channel.arm();
                tracked.state = CommandBufferState::Pending;
                // Every submission is judged against its own snapshots.
                for dispatch in &mut tracked.dispatches {
                    dispatch.snapshot = None;
                    dispatch.addresses = None;
                    dispatch.snapshot_error = None;
                }
            }
        }
        self.pending.insert(index, command_buffers.to_vec());
        trace!(index, command_buffers = command_buffers.len(), "submitted");
        Ok(index)
    }

    /// Sets held in flight by submission `index`: those of every dispatch that got a snapshot.
    pub fn submission_sets(&self, index: SubmissionIndex) -> Vec<SetId> {
        let Some(command_buffers) = self.pending.get(&index) else {
            return Vec::new();
        };
        command_buffers
            .iter()
            .filter_map(|cb| self.command_buffers.get(cb))
            .flat_map(|t| t.dispatches.iter())
            .filter(|d| d.snapshot.is_some())
            .flat_map(|d| d.sets.iter().map(|(_, set)| *set))
            .collect()
    }

    /// The completion signal of submission `index` was observed.  Decodes and resets every channel
    /// it carried.
    pub fn on_complete(
        &mut self,
        index: SubmissionIndex,
        sites: &CheckSiteTable,
    ) -> Result<Vec<DiagnosticEvent>, CoordinatorError> {
        let command_buffers = self
            .pending
            .remove(&index)
            .ok_or(CoordinatorError::UnknownSubmission(index))?;

        let mut decoder = Decoder::new(sites, self.max_diagnostics);
        for cb in command_buffers {
            let Some(tracked) = self.command_buffers.get_mut(&cb) else {
                continue;
            };
            tracked.channel.mark_complete();
            let feedback = tracked.channel.decode();
            tracked.state = CommandBufferState::Decoded;
            decoder.decode(&feedback, &tracked.dispatches, cb);
            for (i, dispatch) in tracked.dispatches.iter().enumerate() {
                if dispatch.snapshot.is_none() {
                    warn!(command_buffer = ?cb, dispatch = i, "dispatch completed without a snapshot");
                    decoder.unverifiable(cb, i, dispatch.snapshot_error.as_deref());
                }
            }
            tracked.channel.reset();
            tracked.state = CommandBufferState::Idle;
        }
        let events = decoder.finish();
        debug!(index, events = events.len(), "submission decoded");
        Ok(events)
    }

    /// Forget `command_buffer` without decoding.
    pub fn abandon(&mut self, command_buffer: vk::CommandBuffer) -> Result<(), CoordinatorError> {
        if self.tracked(command_buffer)?.state == CommandBufferState::Pending {
            return Err(CoordinatorError::CommandBufferPending(command_buffer));
        }
        if let Some(tracked) = self.command_buffers.remove(&command_buffer) {
            tracked.channel.reset();
        }
        Ok(())
    }

    pub fn last_submitted(&self) -> SubmissionIndex {
        self.next_submission - 1
    }

    /// Every submission up to and including the returned index has completed.
    pub fn completed_watermark(&self) -> SubmissionIndex {
        match self.pending.keys().next() {
            Some(oldest) => oldest - 1,
            None => self.last_submitted(),
        }
    }

    fn tracked(&self, command_buffer: vk::CommandBuffer) -> Result<&Tracked, CoordinatorError> {
        self.command_buffers
            .get(&command_buffer)
            .ok_or(CoordinatorError::UnknownCommandBuffer(command_buffer))
    }

    fn tracked_mut(
        &mut self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<&mut Tracked, CoordinatorError> {
        self.command_buffers
            .get_mut(&command_buffer)
            .ok_or(CoordinatorError::UnknownCommandBuffer(command_buffer))
    }

    fn dispatch_mut(
        &mut self,
        command_buffer: vk::CommandBuffer,
        index: u16,
    ) -> Result<&mut Dispatch, CoordinatorError> {
        self.tracked_mut(command_buffer)?
            .dispatches
            .get_mut(index as usize)
            .ok_or(CoordinatorError::UnknownDispatch {
                command_buffer,
                index,
            })
    }

    fn recording(
        &mut self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<&mut Tracked, CoordinatorError> {
        let tracked = self.tracked_mut(command_buffer)?;
        if tracked.state != CommandBufferState::Recording {
            return Err(CoordinatorError::NotRecording(command_buffer));
        }
        Ok(tracked)
    }
}
