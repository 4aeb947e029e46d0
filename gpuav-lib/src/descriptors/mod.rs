// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Descriptor Binding Table
//!
//! Host-side truth about every allocated descriptor set: for each `(binding, array index)`, was it
//! written, with what, and does that thing still exist.
//!
//! Slot transitions:
//!
//! - `Uninitialized -> Bound` on a write
//! - `Uninitialized | Bound -> NullAllowed` on an explicit null write, only with the null
//!   descriptor capability
//! - `Bound -> Destroyed` when the referenced resource is destroyed while the set is allocated
//!
//! A resource destroyed while a set is in flight is also caught by the shared liveness tokens that
//! snapshots keep, see [`snapshot`].
//!
//! Variable-count bindings keep their full declared capacity of slots but only the first
//! `allocated` are usable.  Querying above that reports [`SlotQuery::BeyondAllocatedCount`] so the
//! message can say the allocation shrank the binding rather than "out of range".

pub mod snapshot;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use ash::vk;
use gpuav_vulkan::descriptors::{BindingLayout, DescriptorSetLayout};
use gpuav_vulkan::handle::{ObjectHandle, ObjectId};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::resource::Liveness;

pub use snapshot::{BindingSnapshot, SnapshotBinding};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetId(u64);

impl fmt::Display for SetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "set #{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotStatus {
    Uninitialized,
    Bound,
    Destroyed,
    NullAllowed,
}

impl SlotStatus {
    /// Encoding shared with the device-side snapshot table.
    pub fn code(&self) -> u32 {
        match self {
            SlotStatus::Uninitialized => 0,
            SlotStatus::Bound => 1,
            SlotStatus::Destroyed => 2,
            SlotStatus::NullAllowed => 3,
        }
    }
}

/// What a slot points at, with the range the descriptor made visible.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoundResource {
    Buffer {
        buffer: vk::Buffer,
        offset: u64,
        /// Bytes visible through the descriptor, after resolving `VK_WHOLE_SIZE`.
        length: u64,
    },
    TexelBuffer {
        view: vk::BufferView,
        buffer: vk::Buffer,
        length: u64,
        texel_size: u32,
    },
    Image {
        view: vk::ImageView,
        image: vk::Image,
    },
    Sampler(vk::Sampler),
}

impl BoundResource {
    /// The handle a message should name first.
    pub fn primary(&self) -> ObjectHandle {
        match *self {
            BoundResource::Buffer { buffer, .. } => buffer.into(),
            BoundResource::TexelBuffer { view, .. } => view.into(),
            BoundResource::Image { view, .. } => view.into(),
            BoundResource::Sampler(sampler) => sampler.into(),
        }
    }

    /// Every object whose destruction invalidates the descriptor.
    pub fn handles(&self) -> SmallVec<ObjectHandle, 2> {
        let mut handles = SmallVec::new();
        match *self {
            BoundResource::Buffer { buffer, .. } => handles.push(buffer.into()),
            BoundResource::TexelBuffer { view, buffer, .. } => {
                handles.push(view.into());
                handles.push(buffer.into());
            }
            BoundResource::Image { view, image } => {
                handles.push(view.into());
                handles.push(image.into());
            }
            BoundResource::Sampler(sampler) => handles.push(sampler.into()),
        }
        handles
    }

    /// Bytes for buffers, texels for texel buffers, zero for everything else.
    pub fn bound_length(&self) -> u64 {
        match *self {
            BoundResource::Buffer { length, .. } => length,
            BoundResource::TexelBuffer {
                length, texel_size, ..
            } => length / u64::from(texel_size.max(1)),
            BoundResource::Image { .. } | BoundResource::Sampler(_) => 0,
        }
    }
}

/// A written descriptor plus the liveness tokens of everything it references.
#[derive(Clone, Debug)]
pub struct BoundDescriptor {
    pub resource: BoundResource,
    pub liveness: SmallVec<Liveness, 2>,
}

impl BoundDescriptor {
    pub fn is_alive(&self) -> bool {
        self.liveness.iter().all(Liveness::is_alive)
    }
}

#[derive(Clone, Debug)]
pub struct Slot {
    pub status: SlotStatus,
    pub descriptor: Option<BoundDescriptor>,
}

impl Slot {
    fn uninitialized() -> Self {
        Slot {
            status: SlotStatus::Uninitialized,
            descriptor: None,
        }
    }
}

/// `vkUpdateDescriptorSets` write.  `None` entries are explicit null descriptors.
#[derive(Clone, Debug)]
pub struct DescriptorWrite {
    pub binding: u32,
    pub first_array_element: u32,
    pub descriptors: Vec<Option<BoundDescriptor>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorCopy {
    pub src_set: SetId,
    pub src_binding: u32,
    pub src_array_element: u32,
    pub dst_set: SetId,
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub count: u32,
}

/// Answer to "what would an invocation find here".
#[derive(Clone, Debug)]
pub enum SlotQuery {
    Uninitialized,
    Bound(BoundDescriptor),
    Destroyed(BoundDescriptor),
    NullAllowed,
    /// Inside the declared capacity, above the variable count chosen at allocation.
    BeyondAllocatedCount { allocated: u32 },
    /// At or above the declared capacity.
    OutOfRange { count: u32 },
}

#[derive(Clone, Debug)]
pub struct BindingState {
    pub layout: BindingLayout,
    /// Usable slots.  Equal to the declared count except for variable-count bindings.
    pub allocated: u32,
    pub slots: Vec<Slot>,
}

impl BindingState {
    pub(crate) fn query(&self, index: u32) -> SlotQuery {
        if index >= self.layout.count {
            return SlotQuery::OutOfRange {
                count: self.layout.count,
            };
        }
        if index >= self.allocated {
            return SlotQuery::BeyondAllocatedCount {
                allocated: self.allocated,
            };
        }
        let slot = &self.slots[index as usize];
        match (slot.status, &slot.descriptor) {
            (SlotStatus::Bound, Some(d)) if d.is_alive() => SlotQuery::Bound(d.clone()),
            (SlotStatus::Bound | SlotStatus::Destroyed, Some(d)) => {
                SlotQuery::Destroyed(d.clone())
            }
            (SlotStatus::NullAllowed, _) => SlotQuery::NullAllowed,
            _ => SlotQuery::Uninitialized,
        }
    }
}

#[derive(Debug)]
pub struct DescriptorSetState {
    pub layout: Arc<DescriptorSetLayout>,
    pub variable_count: Option<u32>,
    pub bindings: BTreeMap<u32, BindingState>,
    /// Submissions currently executing with this set bound.
    in_flight: u32,
}

impl DescriptorSetState {
    pub fn in_flight(&self) -> bool {
        self.in_flight > 0
    }

    /// Slots covered by `count` consecutive descriptors starting at `(binding, element)`, rolling
    /// over into following bindings like `vkUpdateDescriptorSets` does.
    fn walk(
        &self,
        set: SetId,
        binding: u32,
        element: u32,
        count: usize,
    ) -> Result<Vec<(u32, u32)>, DescriptorError> {
        let mut slots = Vec::with_capacity(count);
        let (mut b, mut e) = (binding, element);
        while slots.len() < count {
            let state = self
                .bindings
                .get(&b)
                .ok_or(DescriptorError::UnknownBinding { set, binding: b })?;
            if e < state.allocated {
                slots.push((b, e));
                e += 1;
                continue;
            }
            let next = self.layout.next_binding(b).ok_or(DescriptorError::WriteOutOfRange {
                set,
                binding,
                count: count as u32,
            })?;
            e -= state.allocated;
            b = next.binding;
        }
        Ok(slots)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("{0} is not allocated")]
    UnknownSet(SetId),

    #[error("{set} has no binding {binding}")]
    UnknownBinding { set: SetId, binding: u32 },

    #[error("variable descriptor count {requested} exceeds the declared capacity {capacity}")]
    VariableCountTooLarge { requested: u32, capacity: u32 },

    #[error("{count} descriptors starting at binding {binding} of {set} run past the last binding")]
    WriteOutOfRange { set: SetId, binding: u32, count: u32 },

    #[error("null descriptor written to binding {binding} of {set} without the nullDescriptor feature")]
    NullWithoutCapability { set: SetId, binding: u32 },

    #[error("binding {binding} of {set} updated while in use without UPDATE_AFTER_BIND")]
    UpdateWhileInFlight { set: SetId, binding: u32 },

    #[error("{0} freed while in use")]
    FreedWhileInFlight(SetId),
}

#[derive(Debug, Default)]
pub struct DescriptorBindingTable {
    next_id: u64,
    null_descriptor: bool,
    sets: HashMap<SetId, DescriptorSetState>,
    /// Resource to every slot that references it.
    referenced_by: HashMap<ObjectId, HashSet<(SetId, u32, u32)>>,
}

impl DescriptorBindingTable {
    pub fn new(null_descriptor: bool) -> Self {
        Self {
            null_descriptor,
            ..Self::default()
        }
    }

    pub fn allocate(
        &mut self,
        layout: Arc<DescriptorSetLayout>,
        variable_count: Option<u32>,
    ) -> Result<SetId, DescriptorError> {
        let mut bindings = BTreeMap::new();
        for binding in layout.bindings() {
            let allocated = if binding.variable_count() {
                // Without an explicit count the variable binding gets zero descriptors.
                let requested = variable_count.unwrap_or(0);
                if requested > binding.count {
                    return Err(DescriptorError::VariableCountTooLarge {
                        requested,
                        capacity: binding.count,
                    });
                }
                requested
            } else {
                binding.count
            };
            bindings.insert(
                binding.binding,
                BindingState {
                    layout: binding.clone(),
                    allocated,
                    slots: vec![Slot::uninitialized(); binding.count as usize],
                },
            );
        }

        let id = SetId(self.next_id);
        self.next_id += 1;
        self.sets.insert(
            id,
            DescriptorSetState {
                layout,
                variable_count,
                bindings,
                in_flight: 0,
            },
        );
        trace!(%id, ?variable_count, "descriptor set allocated");
        Ok(id)
    }

    pub fn free(&mut self, set: SetId) -> Result<(), DescriptorError> {
        let state = self.sets.get(&set).ok_or(DescriptorError::UnknownSet(set))?;
        if state.in_flight() {
            return Err(DescriptorError::FreedWhileInFlight(set));
        }
        if let Some(state) = self.sets.remove(&set) {
            for (binding, b) in &state.bindings {
                for (index, slot) in b.slots.iter().enumerate() {
                    self.unreference(set, *binding, index as u32, slot);
                }
            }
        }
        trace!(%set, "descriptor set freed");
        Ok(())
    }

    pub fn get(&self, set: SetId) -> Option<&DescriptorSetState> {
        self.sets.get(&set)
    }

    /// Apply writes in order.  On error, earlier writes stay applied.
    pub fn bind_set(&mut self, set: SetId, writes: &[DescriptorWrite]) -> Result<(), DescriptorError> {
        for write in writes {
            let targets = self
                .sets
                .get(&set)
                .ok_or(DescriptorError::UnknownSet(set))?
                .walk(set, write.binding, write.first_array_element, write.descriptors.len())?;
            for ((binding, index), descriptor) in targets.into_iter().zip(&write.descriptors) {
                self.write_slot(set, binding, index, descriptor.clone())?;
            }
        }
        Ok(())
    }

    pub fn copy_descriptors(&mut self, copies: &[DescriptorCopy]) -> Result<(), DescriptorError> {
        for copy in copies {
            let count = copy.count as usize;
            let source = self
                .sets
                .get(&copy.src_set)
                .ok_or(DescriptorError::UnknownSet(copy.src_set))?;
            let slots: Vec<Slot> = source
                .walk(copy.src_set, copy.src_binding, copy.src_array_element, count)?
                .into_iter()
                .map(|(b, i)| source.bindings[&b].slots[i as usize].clone())
                .collect();
            let targets = self
                .sets
                .get(&copy.dst_set)
                .ok_or(DescriptorError::UnknownSet(copy.dst_set))?
                .walk(copy.dst_set, copy.dst_binding, copy.dst_array_element, count)?;
            for ((binding, index), slot) in targets.into_iter().zip(slots) {
                self.put_slot(copy.dst_set, binding, index, slot)?;
            }
        }
        Ok(())
    }

    fn write_slot(
        &mut self,
        set: SetId,
        binding: u32,
        index: u32,
        descriptor: Option<BoundDescriptor>,
    ) -> Result<(), DescriptorError> {
        let slot = match descriptor {
            Some(descriptor) => Slot {
                status: SlotStatus::Bound,
                descriptor: Some(descriptor),
            },
            None if self.null_descriptor => Slot {
                status: SlotStatus::NullAllowed,
                descriptor: None,
            },
            None => return Err(DescriptorError::NullWithoutCapability { set, binding }),
        };
        self.put_slot(set, binding, index, slot)
    }

    fn put_slot(
        &mut self,
        set: SetId,
        binding: u32,
        index: u32,
        slot: Slot,
    ) -> Result<(), DescriptorError> {
        let state = self
            .sets
            .get_mut(&set)
            .ok_or(DescriptorError::UnknownSet(set))?;
        let in_flight = state.in_flight();
        let b = state
            .bindings
            .get_mut(&binding)
            .ok_or(DescriptorError::UnknownBinding { set, binding })?;
        if in_flight && !b.layout.update_after_bind() {
            return Err(DescriptorError::UpdateWhileInFlight { set, binding });
        }
        let previous = std::mem::replace(&mut b.slots[index as usize], slot.clone());

        self.unreference(set, binding, index, &previous);
        if let Some(descriptor) = &slot.descriptor {
            for handle in descriptor.resource.handles() {
                self.referenced_by
                    .entry(handle.id())
                    .or_default()
                    .insert((set, binding, index));
            }
        }
        Ok(())
    }

    fn unreference(&mut self, set: SetId, binding: u32, index: u32, slot: &Slot) {
        let Some(descriptor) = &slot.descriptor else {
            return;
        };
        for handle in descriptor.resource.handles() {
            if let Some(slots) = self.referenced_by.get_mut(&handle.id()) {
                slots.remove(&(set, binding, index));
                if slots.is_empty() {
                    self.referenced_by.remove(&handle.id());
                }
            }
        }
    }

    pub fn query(&self, set: SetId, binding: u32, index: u32) -> Result<SlotQuery, DescriptorError> {
        let state = self.sets.get(&set).ok_or(DescriptorError::UnknownSet(set))?;
        let b = state
            .bindings
            .get(&binding)
            .ok_or(DescriptorError::UnknownBinding { set, binding })?;
        Ok(b.query(index))
    }

    /// Every slot still referencing `handle` becomes `Destroyed`.  Returns how many.
    pub fn on_resource_destroyed(&mut self, handle: ObjectHandle) -> usize {
        let Some(slots) = self.referenced_by.remove(&handle.id()) else {
            return 0;
        };
        let mut count = 0;
        for (set, binding, index) in slots {
            let slot = self
                .sets
                .get_mut(&set)
                .and_then(|s| s.bindings.get_mut(&binding))
                .and_then(|b| b.slots.get_mut(index as usize));
            if let Some(slot) = slot {
                if slot.status == SlotStatus::Bound {
                    slot.status = SlotStatus::Destroyed;
                    count += 1;
                }
            }
        }
        debug!(%handle, slots = count, "descriptors invalidated by destroy");
        count
    }

    pub fn mark_in_flight(&mut self, set: SetId) -> Result<(), DescriptorError> {
        let state = self
            .sets
            .get_mut(&set)
            .ok_or(DescriptorError::UnknownSet(set))?;
        state.in_flight += 1;
        Ok(())
    }

    /// Undo one [`mark_in_flight`](Self::mark_in_flight).  Sets freed meanwhile are ignored.
    pub fn release(&mut self, set: SetId) {
        if let Some(state) = self.sets.get_mut(&set) {
            state.in_flight = state.in_flight.saturating_sub(1);
        }
    }

    /// Point-in-time copy of the sets bound at `(set index, set)`.
    pub fn snapshot(&self, bound: &[(u32, SetId)]) -> Result<BindingSnapshot, DescriptorError> {
        let mut snapshot = BindingSnapshot::default();
        for &(index, set) in bound {
            let state = self.sets.get(&set).ok_or(DescriptorError::UnknownSet(set))?;
            for (binding, b) in &state.bindings {
                snapshot.insert(index, *binding, SnapshotBinding::capture(set, b));
            }
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ash::vk::Handle;
    use proptest::prelude::*;

    use crate::resource::{ResourceKind, ResourceTracker};

    fn layout(count: u32, flags: vk::DescriptorBindingFlags) -> Arc<DescriptorSetLayout> {
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(count),
        ];
        let flags = [vk::DescriptorBindingFlags::empty(), flags];
        Arc::new(DescriptorSetLayout::new(&bindings, &flags).unwrap())
    }

    fn buffer_descriptor(tracker: &mut ResourceTracker, raw: u64) -> BoundDescriptor {
        let buffer = vk::Buffer::from_raw(raw);
        let liveness = tracker
            .track(
                buffer.into(),
                ResourceKind::Buffer {
                    size: 64,
                    device_address: None,
                },
            )
            .unwrap();
        BoundDescriptor {
            resource: BoundResource::Buffer {
                buffer,
                offset: 0,
                length: 64,
            },
            liveness: SmallVec::from_iter([liveness]),
        }
    }

    #[test]
    fn test_variable_count_statuses() {
        let mut tracker = ResourceTracker::new();
        let mut table = DescriptorBindingTable::new(false);
        let layout = layout(8, vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT);
        assert_eq!(
            table.allocate(layout.clone(), Some(9)),
            Err(DescriptorError::VariableCountTooLarge {
                requested: 9,
                capacity: 8,
            })
        );
        let set = table.allocate(layout, Some(4)).unwrap();

        let write = DescriptorWrite {
            binding: 1,
            first_array_element: 0,
            descriptors: vec![Some(buffer_descriptor(&mut tracker, 1))],
        };
        table.bind_set(set, &[write]).unwrap();

        assert!(matches!(table.query(set, 1, 0).unwrap(), SlotQuery::Bound(_)));
        assert!(matches!(table.query(set, 1, 3).unwrap(), SlotQuery::Uninitialized));
        assert!(matches!(
            table.query(set, 1, 4).unwrap(),
            SlotQuery::BeyondAllocatedCount { allocated: 4 }
        ));
        assert!(matches!(
            table.query(set, 1, 8).unwrap(),
            SlotQuery::OutOfRange { count: 8 }
        ));
        assert!(matches!(
            table.query(set, 2, 0),
            Err(DescriptorError::UnknownBinding { binding: 2, .. })
        ));
    }

    #[test]
    fn test_write_rolls_over() {
        let mut tracker = ResourceTracker::new();
        let mut table = DescriptorBindingTable::new(false);
        let set = table
            .allocate(layout(2, vk::DescriptorBindingFlags::empty()), None)
            .unwrap();
        let descriptors = (1..=3)
            .map(|raw| Some(buffer_descriptor(&mut tracker, raw)))
            .collect();
        let write = DescriptorWrite {
            binding: 0,
            first_array_element: 0,
            descriptors,
        };
        table.bind_set(set, &[write]).unwrap();
        for index in 0..2 {
            assert!(matches!(table.query(set, 1, index).unwrap(), SlotQuery::Bound(_)));
        }

        let past_end = DescriptorWrite {
            binding: 1,
            first_array_element: 1,
            descriptors: vec![Some(buffer_descriptor(&mut tracker, 4)), None],
        };
        assert!(matches!(
            table.bind_set(set, &[past_end]),
            Err(DescriptorError::WriteOutOfRange { .. })
        ));
    }

    #[test]
    fn test_null_needs_capability() {
        let layout = layout(2, vk::DescriptorBindingFlags::empty());
        let write = DescriptorWrite {
            binding: 1,
            first_array_element: 1,
            descriptors: vec![None],
        };

        let mut table = DescriptorBindingTable::new(false);
        let set = table.allocate(layout.clone(), None).unwrap();
        assert_eq!(
            table.bind_set(set, &[write.clone()]),
            Err(DescriptorError::NullWithoutCapability { set, binding: 1 })
        );

        let mut table = DescriptorBindingTable::new(true);
        let set = table.allocate(layout, None).unwrap();
        table.bind_set(set, &[write]).unwrap();
        assert!(matches!(table.query(set, 1, 1).unwrap(), SlotQuery::NullAllowed));
    }

    #[test]
    fn test_destroy_marks_slots() {
        let mut tracker = ResourceTracker::new();
        let mut table = DescriptorBindingTable::new(false);
        let set = table
            .allocate(layout(2, vk::DescriptorBindingFlags::empty()), None)
            .unwrap();
        let descriptor = buffer_descriptor(&mut tracker, 9);
        let write = DescriptorWrite {
            binding: 1,
            first_array_element: 0,
            descriptors: vec![Some(descriptor.clone()), Some(descriptor)],
        };
        table.bind_set(set, &[write]).unwrap();

        let buffer = ObjectHandle::from(vk::Buffer::from_raw(9));
        tracker.destroy(buffer).unwrap();
        assert_eq!(table.on_resource_destroyed(buffer), 2);
        assert_eq!(table.on_resource_destroyed(buffer), 0);
        assert!(matches!(table.query(set, 1, 1).unwrap(), SlotQuery::Destroyed(_)));
    }

    #[test]
    fn test_in_flight_updates() {
        let mut tracker = ResourceTracker::new();
        let mut table = DescriptorBindingTable::new(false);
        let set = table
            .allocate(
                layout(2, vk::DescriptorBindingFlags::UPDATE_AFTER_BIND),
                None,
            )
            .unwrap();
        table.mark_in_flight(set).unwrap();

        let fixed = DescriptorWrite {
            binding: 0,
            first_array_element: 0,
            descriptors: vec![Some(buffer_descriptor(&mut tracker, 1))],
        };
        assert_eq!(
            table.bind_set(set, &[fixed]),
            Err(DescriptorError::UpdateWhileInFlight { set, binding: 0 })
        );
        let late = DescriptorWrite {
            binding: 1,
            first_array_element: 0,
            descriptors: vec![Some(buffer_descriptor(&mut tracker, 2))],
        };
        table.bind_set(set, &[late]).unwrap();
        assert_eq!(table.free(set), Err(DescriptorError::FreedWhileInFlight(set)));
        table.release(set);
        table.free(set).unwrap();
        assert!(table.referenced_by.is_empty());
    }

    #[test]
    fn test_copy_descriptors() {
        let mut tracker = ResourceTracker::new();
        let mut table = DescriptorBindingTable::new(false);
        let layout = layout(4, vk::DescriptorBindingFlags::empty());
        let src = table.allocate(layout.clone(), None).unwrap();
        let dst = table.allocate(layout, None).unwrap();
        let write = DescriptorWrite {
            binding: 1,
            first_array_element: 0,
            descriptors: vec![Some(buffer_descriptor(&mut tracker, 5))],
        };
        table.bind_set(src, &[write]).unwrap();
        table
            .copy_descriptors(&[DescriptorCopy {
                src_set: src,
                src_binding: 1,
                src_array_element: 0,
                dst_set: dst,
                dst_binding: 1,
                dst_array_element: 2,
                count: 2,
            }])
            .unwrap();
        assert!(matches!(table.query(dst, 1, 2).unwrap(), SlotQuery::Bound(_)));
        assert!(matches!(table.query(dst, 1, 3).unwrap(), SlotQuery::Uninitialized));

        let buffer = ObjectHandle::from(vk::Buffer::from_raw(5));
        assert_eq!(table.on_resource_destroyed(buffer), 2);
    }

    proptest! {
        #[test]
        fn test_unwritten_slots_are_uninitialized(
            capacity in 1u32..32,
            allocated in 0u32..32,
            written in prop::collection::btree_set(0u32..32, 0..16),
        ) {
            let allocated = allocated.min(capacity);
            let mut tracker = ResourceTracker::new();
            let mut table = DescriptorBindingTable::new(false);
            let layout = layout(capacity, vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT);
            let set = table.allocate(layout, Some(allocated)).unwrap();

            let written: Vec<u32> = written.into_iter().filter(|i| *i < allocated).collect();
            for (n, index) in written.iter().enumerate() {
                let write = DescriptorWrite {
                    binding: 1,
                    first_array_element: *index,
                    descriptors: vec![Some(buffer_descriptor(&mut tracker, n as u64 + 1))],
                };
                table.bind_set(set, &[write]).unwrap();
            }

            for index in 0..capacity + 2 {
                let query = table.query(set, 1, index).unwrap();
                if index >= capacity {
                    let out_of_range = matches!(query, SlotQuery::OutOfRange { .. });
                    prop_assert!(out_of_range);
                } else if index >= allocated {
                    let beyond_allocated = matches!(query, SlotQuery::BeyondAllocatedCount { allocated: a } if a == allocated);
                    prop_assert!(beyond_allocated);
                } else if written.contains(&index) {
                    prop_assert!(matches!(query, SlotQuery::Bound(_)));
                } else {
                    prop_assert!(matches!(query, SlotQuery::Uninitialized));
                }
            }
        }
    }
}
