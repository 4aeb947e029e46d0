// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Diagnostics
//!
//! Raw records in, sentences out.
//!
//! One submission may produce thousands of records for a single bug, one per invocation.  The
//! [`Decoder`] folds them into one [`DiagnosticEvent`] per check site and category and counts the
//! rest as occurrences.  Events beyond the configured cap are counted and mentioned once instead of
//! delivered.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;
use gpuav_feedback::{DecodedFeedback, ErrorCode, ViolationRecord};
use gpuav_spirv::{CheckSite, SourceLocation};
use gpuav_vulkan::handle::ObjectHandle;
use smallvec::SmallVec;
use tracing::{error, warn};

use crate::coordinator::Dispatch;
use crate::descriptors::SlotQuery;
use crate::pipeline::CheckSiteTable;
use crate::registry::AddressLookup;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Category {
    OutOfBounds,
    UninitializedDescriptor,
    DestroyedResource,
    AlignmentViolation,
    OverflowInAddressArithmetic,
    /// The feedback channel ran out of room.  Some violations were not recorded.
    Truncated,
    /// Work ran without a binding snapshot, so its checks had nothing to check against.
    Unverifiable,
}

impl From<ErrorCode> for Category {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::DescriptorIndexOutOfBounds
            | ErrorCode::BufferOutOfBounds
            | ErrorCode::TexelOutOfBounds
            | ErrorCode::AddressUnmapped
            | ErrorCode::AddressOutOfBounds => Category::OutOfBounds,
            ErrorCode::DescriptorUninitialized | ErrorCode::DescriptorBeyondCount => {
                Category::UninitializedDescriptor
            }
            ErrorCode::DescriptorDestroyed | ErrorCode::AddressDestroyed => {
                Category::DestroyedResource
            }
            ErrorCode::AddressMisaligned => Category::AlignmentViolation,
            ErrorCode::AddressOverflow => Category::OverflowInAddressArithmetic,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Category::OutOfBounds => "out-of-bounds",
            Category::UninitializedDescriptor => "uninitialized-descriptor",
            Category::DestroyedResource => "destroyed-resource",
            Category::AlignmentViolation => "misaligned-address",
            Category::OverflowInAddressArithmetic => "address-overflow",
            Category::Truncated => "feedback-truncated",
            Category::Unverifiable => "unverifiable",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiagnosticEvent {
    pub category: Category,
    pub check_site_id: Option<u32>,
    pub message: String,
    pub source_location: Option<SourceLocation>,
    /// Most specific first: the resource, then the pipeline, then the command buffer.
    pub object_handles: SmallVec<ObjectHandle, 4>,
    /// Records folded into this event.
    pub occurrences: u64,
}

impl fmt::Display for DiagnosticEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)?;
        if self.occurrences > 1 {
            write!(f, " ({} times)", self.occurrences)?;
        }
        Ok(())
    }
}

/// Where decoded diagnostics go.
pub trait DiagnosticSink: Send + Sync {
    fn report(&self, event: &DiagnosticEvent);
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSink for Arc<S> {
    fn report(&self, event: &DiagnosticEvent) {
        (**self).report(event)
    }
}

/// Every event becomes a `tracing` error.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn report(&self, event: &DiagnosticEvent) {
        let handles: Vec<String> = event.object_handles.iter().map(|h| h.to_string()).collect();
        error!(
            category = %event.category,
            site = ?event.check_site_id,
            occurrences = event.occurrences,
            objects = ?handles,
            "{}",
            event.message
        );
    }
}

/// Keeps events until somebody takes them.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<DiagnosticEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<DiagnosticEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, event: &DiagnosticEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum DedupKey {
    Site(u32, Category),
    Truncated(vk::CommandBuffer),
    Unverifiable(vk::CommandBuffer),
}

/// Folds the records of one submission into events.
pub struct Decoder<'a> {
    sites: &'a CheckSiteTable,
    max_events: usize,
    events: Vec<DiagnosticEvent>,
    seen: HashMap<DedupKey, usize>,
    suppressed: u64,
}

impl<'a> Decoder<'a> {
    pub fn new(sites: &'a CheckSiteTable, max_events: usize) -> Self {
        Self {
            sites,
            max_events,
            events: Vec::new(),
            seen: HashMap::new(),
            suppressed: 0,
        }
    }

    /// Decode one command buffer's channel.
    pub fn decode(
        &mut self,
        feedback: &DecodedFeedback,
        dispatches: &[Dispatch],
        command_buffer: vk::CommandBuffer,
    ) {
        for record in &feedback.records {
            let Ok(code) = record.code() else {
                warn!(
                    code = record.error_code,
                    site = record.check_site_id,
                    "undecodable violation record"
                );
                continue;
            };
            let resolved = self.sites.resolve(record.check_site_id);
            let dispatch = dispatches.get(record.dispatch_index as usize);
            let event = describe(record, code, resolved, dispatch, command_buffer);
            self.push(DedupKey::Site(record.check_site_id, event.category), event, true);
        }

        if feedback.is_truncated() {
            let dropped = u64::from(feedback.dropped());
            let event = DiagnosticEvent {
                category: Category::Truncated,
                check_site_id: None,
                message: format!(
                    "feedback buffer of {} records was full, {} further violations were dropped",
                    feedback.capacity, dropped
                ),
                source_location: None,
                object_handles: SmallVec::from_iter([ObjectHandle::from(command_buffer)]),
                occurrences: dropped,
            };
            self.push(DedupKey::Truncated(command_buffer), event, false);
        }
    }

    /// Dispatch `index` of `command_buffer` ran without a binding snapshot, for `reason` when
    /// one is known.
    pub fn unverifiable(
        &mut self,
        command_buffer: vk::CommandBuffer,
        index: usize,
        reason: Option<&str>,
    ) {
        let because = reason.map_or_else(String::new, |r| format!(" ({r})"));
        let event = DiagnosticEvent {
            category: Category::Unverifiable,
            check_site_id: None,
            message: format!(
                "dispatch {index} of {} ran without a descriptor snapshot{because}, its accesses were not validated",
                ObjectHandle::from(command_buffer)
            ),
            source_location: None,
            object_handles: SmallVec::from_iter([ObjectHandle::from(command_buffer)]),
            occurrences: 1,
        };
        self.push(DedupKey::Unverifiable(command_buffer), event, false);
    }

    pub fn finish(mut self) -> Vec<DiagnosticEvent> {
        if self.suppressed > 0 {
            warn!(
                suppressed = self.suppressed,
                cap = self.max_events,
                "diagnostics beyond the per-submission cap were not delivered"
            );
        }
        std::mem::take(&mut self.events)
    }

    fn push(&mut self, key: DedupKey, event: DiagnosticEvent, capped: bool) {
        if let Some(&at) = self.seen.get(&key) {
            self.events[at].occurrences += event.occurrences;
            return;
        }
        if capped && self.events.len() >= self.max_events {
            self.suppressed += 1;
            return;
        }
        self.seen.insert(key, self.events.len());
        self.events.push(event);
    }
}

fn describe(
    record: &ViolationRecord,
    code: ErrorCode,
    resolved: Option<(&CheckSite, Option<&SourceLocation>)>,
    dispatch: Option<&Dispatch>,
    command_buffer: vk::CommandBuffer,
) -> DiagnosticEvent {
    let site = resolved.map(|(site, _)| site);
    let location = resolved.and_then(|(_, location)| location).cloned();
    let index = record.observed_index;
    let address = record.observed_index;
    let length = record.bound_length;
    let offset = record.accessed_offset;

    let mut handles: SmallVec<ObjectHandle, 4> = SmallVec::new();
    let slot = match (site.and_then(|s| s.kind.descriptor()), dispatch) {
        (Some((set, binding)), Some(dispatch)) => dispatch
            .snapshot
            .as_ref()
            .and_then(|s| s.slot(set, binding, index as u32)),
        _ => None,
    };
    let bound_to = match &slot {
        Some(SlotQuery::Bound(d) | SlotQuery::Destroyed(d)) => Some(d.resource.primary()),
        _ => None,
    };
    // Descriptor codes carry an index, not an address.
    let hit = dispatch
        .filter(|_| code.is_address())
        .and_then(|d| d.addresses.as_ref())
        .and_then(|table| match table.lookup(address) {
            AddressLookup::Live(entry) | AddressLookup::Destroyed(entry) => Some(entry.resource),
            AddressLookup::Unmapped => None,
        });

    let slot_name = match site.and_then(|s| s.kind.descriptor()) {
        Some((set, binding)) => format!("descriptor {set}.{binding}[{index}]"),
        None => format!("descriptor [{index}]"),
    };
    let access = site.map_or_else(|| "access".to_string(), |s| s.kind.access().to_string());
    let size = site.map_or(0, |s| s.kind.footprint());
    let resource_name = |handle: Option<ObjectHandle>| {
        handle.map_or_else(|| "a resource".to_string(), |h| h.to_string())
    };

    let mut message = match code {
        ErrorCode::DescriptorIndexOutOfBounds => {
            format!("{slot_name} is out of bounds, the binding holds {length} descriptors")
        }
        ErrorCode::DescriptorUninitialized => format!("{slot_name} was never written"),
        ErrorCode::DescriptorBeyondCount => format!(
            "{slot_name} is beyond the variable descriptor count of {length}, the allocation shrank the usable range"
        ),
        ErrorCode::DescriptorDestroyed => format!(
            "{slot_name} refers to {} which was destroyed after being bound",
            resource_name(bound_to)
        ),
        ErrorCode::BufferOutOfBounds => format!(
            "{access} of {size} bytes at offset {offset} is out of bounds of the {length} bytes bound to {slot_name}"
        ),
        ErrorCode::TexelOutOfBounds => format!(
            "texel {index} is out of bounds of the {length} texels bound to {slot_name}"
        ),
        ErrorCode::AddressUnmapped => {
            format!("{access} at address {address:#x} does not hit any buffer")
        }
        ErrorCode::AddressOutOfBounds => format!(
            "{access} of {size} bytes at address {address:#x} runs past the end of {} ({length} bytes, offset {offset})",
            resource_name(hit)
        ),
        ErrorCode::AddressDestroyed => format!(
            "{access} at address {address:#x} hits {}, which was destroyed",
            resource_name(hit)
        ),
        ErrorCode::AddressMisaligned => {
            format!("{access} at address {address:#x} is not aligned to {length} bytes")
        }
        ErrorCode::AddressOverflow => format!(
            "{access} of {length} bytes at address {address:#x} overflows the address space"
        ),
    };
    if let Some(location) = &location {
        message.push_str(&format!(" at {location}"));
    }
    message.push_str(&format!(" (check site {})", record.check_site_id));

    if let Some(handle) = bound_to.or(hit) {
        handles.push(handle);
    }
    if let Some(dispatch) = dispatch {
        handles.push(dispatch.pipeline.into());
    }
    handles.push(command_buffer.into());

    DiagnosticEvent {
        category: code.into(),
        check_site_id: Some(record.check_site_id),
        message,
        source_location: location,
        object_handles: handles,
        occurrences: 1,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ash::vk::Handle;

    use crate::registry::AddressRangeRegistry;

    fn record(site: u32, code: ErrorCode, invocation: u64) -> ViolationRecord {
        ViolationRecord {
            check_site_id: site,
            error_code: code as u16,
            dispatch_index: 0,
            invocation_id: invocation,
            observed_index: 5,
            bound_length: 6,
            accessed_offset: 0,
        }
    }

    #[test]
    fn test_dedup_by_site() {
        let sites = CheckSiteTable::default();
        let cb = vk::CommandBuffer::from_raw(7);
        let feedback = DecodedFeedback {
            records: vec![
                record(3, ErrorCode::DescriptorUninitialized, 0),
                record(3, ErrorCode::DescriptorUninitialized, 1),
                record(3, ErrorCode::DescriptorDestroyed, 2),
                record(4, ErrorCode::DescriptorUninitialized, 3),
            ],
            reserved: 4,
            capacity: 4,
        };

        let mut decoder = Decoder::new(&sites, 16);
        decoder.decode(&feedback, &[], cb);
        let events = decoder.finish();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].category, Category::UninitializedDescriptor);
        assert_eq!(events[0].occurrences, 2);
        assert_eq!(events[0].check_site_id, Some(3));
        assert!(events[0].message.contains("never written"));
        assert_eq!(events[1].category, Category::DestroyedResource);
        assert_eq!(events[2].check_site_id, Some(4));
        assert_eq!(&events[2].object_handles[..], &[ObjectHandle::from(cb)]);
    }

    #[test]
    fn test_cap_and_truncation() {
        let sites = CheckSiteTable::default();
        let cb = vk::CommandBuffer::from_raw(7);
        let feedback = DecodedFeedback {
            records: (0..4)
                .map(|s| record(s, ErrorCode::AddressUnmapped, 0))
                .collect(),
            reserved: 9,
            capacity: 4,
        };

        let mut decoder = Decoder::new(&sites, 2);
        decoder.decode(&feedback, &[], cb);
        decoder.unverifiable(cb, 1, Some("set #3 is not allocated"));
        decoder.unverifiable(cb, 2, None);
        let events = decoder.finish();
        let categories: Vec<_> = events.iter().map(|e| e.category).collect();
        assert_eq!(
            categories,
            [
                Category::OutOfBounds,
                Category::OutOfBounds,
                Category::Truncated,
                Category::Unverifiable,
            ]
        );
        assert_eq!(events[2].occurrences, 5);
        assert_eq!(events[3].occurrences, 2);
        assert!(events[3].message.contains("dispatch 1 of"));
        assert!(events[3].message.contains("snapshot (set #3 is not allocated)"));
    }

    #[test]
    fn test_address_owner_only_for_address_codes() {
        let mut registry = AddressRangeRegistry::new();
        let buffer = ObjectHandle::from(vk::Buffer::from_raw(1));
        registry.insert(0, 0x100, buffer).unwrap();
        let pipeline = vk::Pipeline::from_raw(2);
        let cb = vk::CommandBuffer::from_raw(7);
        let dispatch = Dispatch {
            pipeline,
            sets: Vec::new(),
            snapshot: None,
            addresses: Some(Arc::new(registry.snapshot(|_| None))),
            snapshot_error: None,
        };

        // Index 5 of a descriptor array is also address 5, which the table maps.
        let sites = CheckSiteTable::default();
        let feedback = DecodedFeedback {
            records: vec![
                record(3, ErrorCode::DescriptorUninitialized, 0),
                record(4, ErrorCode::AddressOutOfBounds, 0),
            ],
            reserved: 2,
            capacity: 4,
        };
        let mut decoder = Decoder::new(&sites, 16);
        decoder.decode(&feedback, &[dispatch], cb);
        let events = decoder.finish();

        assert_eq!(
            &events[0].object_handles[..],
            &[ObjectHandle::from(pipeline), ObjectHandle::from(cb)]
        );
        assert_eq!(
            &events[1].object_handles[..],
            &[buffer, ObjectHandle::from(pipeline), ObjectHandle::from(cb)]
        );
        assert!(events[1].message.contains("runs past the end of VkBuffer 0x1"));
    }

    #[test]
    fn test_collecting_sink() {
        let sink = Arc::new(CollectingSink::new());
        let shared: Arc<dyn DiagnosticSink> = sink.clone();
        let event = DiagnosticEvent {
            category: Category::AlignmentViolation,
            check_site_id: Some(1),
            message: "misaligned".to_string(),
            source_location: None,
            object_handles: SmallVec::new(),
            occurrences: 1,
        };
        shared.report(&event);
        TracingSink.report(&event);
        assert_eq!(sink.take(), vec![event]);
        assert!(sink.take().is_empty());
    }
}
