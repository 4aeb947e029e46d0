// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Binding Snapshots
//!
//! What one dispatch may see.  Taken when the command buffer is submitted, so later updates to the
//! live table cannot change what the dispatch is judged against.  Slots keep the liveness tokens of
//! their resources, which is the one thing deliberately shared with the present.
//!
//! Device layout from [`BindingSnapshot::encode`]:
//!
//! ```text
//! u64 binding_count
//! { u64 set << 32 | binding; u64 count << 32 | allocated; u64 first_slot } [binding_count]
//! { u64 status; u64 bound_length } [total slots]
//! ```

use std::collections::BTreeMap;

use super::{BindingState, SetId, SlotQuery};

/// One binding of one set, frozen.
#[derive(Clone, Debug)]
pub struct SnapshotBinding {
    pub set: SetId,
    state: BindingState,
}

impl SnapshotBinding {
    pub(crate) fn capture(set: SetId, state: &BindingState) -> Self {
        Self {
            set,
            state: state.clone(),
        }
    }

    pub fn count(&self) -> u32 {
        self.state.layout.count
    }

    pub fn allocated(&self) -> u32 {
        self.state.allocated
    }

    pub fn query(&self, index: u32) -> SlotQuery {
        self.state.query(index)
    }
}

#[derive(Clone, Debug, Default)]
pub struct BindingSnapshot {
    bindings: BTreeMap<(u32, u32), SnapshotBinding>,
}

impl BindingSnapshot {
    pub(crate) fn insert(&mut self, set: u32, binding: u32, captured: SnapshotBinding) {
        self.bindings.insert((set, binding), captured);
    }

    pub fn binding(&self, set: u32, binding: u32) -> Option<&SnapshotBinding> {
        self.bindings.get(&(set, binding))
    }

    /// `None` when nothing is bound at `(set, binding)`.
    pub fn slot(&self, set: u32, binding: u32, index: u32) -> Option<SlotQuery> {
        self.binding(set, binding).map(|b| b.query(index))
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn encode(&self) -> Vec<u64> {
        let slots: usize = self.bindings.values().map(|b| b.state.slots.len()).sum();
        let mut words = Vec::with_capacity(1 + self.bindings.len() * 3 + slots * 2);
        words.push(self.bindings.len() as u64);

        let mut first_slot = 0u64;
        for (&(set, binding), b) in &self.bindings {
            words.push(u64::from(set) << 32 | u64::from(binding));
            words.push(u64::from(b.count()) << 32 | u64::from(b.allocated()));
            words.push(first_slot);
            first_slot += b.state.slots.len() as u64;
        }
        for b in self.bindings.values() {
            for index in 0..b.count() {
                let (status, length) = match b.query(index) {
                    SlotQuery::Bound(d) => (1, d.resource.bound_length()),
                    SlotQuery::Destroyed(d) => (2, d.resource.bound_length()),
                    SlotQuery::NullAllowed => (3, 0),
                    SlotQuery::Uninitialized
                    | SlotQuery::BeyondAllocatedCount { .. }
                    | SlotQuery::OutOfRange { .. } => (0, 0),
                };
                words.push(status);
                words.push(length);
            }
        }
        words
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    use ash::vk::{self, Handle};
    use gpuav_vulkan::descriptors::DescriptorSetLayout;
    use gpuav_vulkan::handle::ObjectHandle;
    use proptest::prelude::*;
    use smallvec::SmallVec;

    use crate::descriptors::{BoundDescriptor, BoundResource, DescriptorBindingTable, DescriptorWrite};
    use crate::resource::{ResourceKind, ResourceTracker};

    fn storage_layout(count: u32) -> Arc<DescriptorSetLayout> {
        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(count)];
        Arc::new(DescriptorSetLayout::new(&bindings, &[]).unwrap())
    }

    fn write(tracker: &mut ResourceTracker, index: u32, raw: u64, length: u64) -> DescriptorWrite {
        let buffer = vk::Buffer::from_raw(raw);
        let liveness = tracker
            .track(
                buffer.into(),
                ResourceKind::Buffer {
                    size: length,
                    device_address: None,
                },
            )
            .unwrap();
        DescriptorWrite {
            binding: 0,
            first_array_element: index,
            descriptors: vec![Some(BoundDescriptor {
                resource: BoundResource::Buffer {
                    buffer,
                    offset: 0,
                    length,
                },
                liveness: SmallVec::from_iter([liveness]),
            })],
        }
    }

    #[test]
    fn test_encode_layout() {
        let mut tracker = ResourceTracker::new();
        let mut table = DescriptorBindingTable::new(false);
        let set = table.allocate(storage_layout(2), None).unwrap();
        table.bind_set(set, &[write(&mut tracker, 1, 7, 256)]).unwrap();

        let snapshot = table.snapshot(&[(3, set)]).unwrap();
        assert!(snapshot.slot(3, 1, 0).is_none());
        assert_eq!(
            snapshot.encode(),
            vec![1, 3 << 32, 2 << 32 | 2, 0, 0, 0, 1, 256]
        );
    }

    proptest! {
        /// Later writes never reach a snapshot, later destroys always do.
        #[test]
        fn test_snapshot_isolation(
            count in 1u32..16,
            before in prop::collection::btree_set(0u32..16, 0..8),
            after in prop::collection::btree_set(0u32..16, 0..8),
            destroy in prop::collection::btree_set(0u32..16, 0..8),
        ) {
            let mut tracker = ResourceTracker::new();
            let mut table = DescriptorBindingTable::new(false);
            let set = table.allocate(storage_layout(count), None).unwrap();

            let before: Vec<u32> = before.into_iter().filter(|i| *i < count).collect();
            for &index in &before {
                table.bind_set(set, &[write(&mut tracker, index, 100 + u64::from(index), 64)]).unwrap();
            }
            let snapshot = table.snapshot(&[(0, set)]).unwrap();

            for index in after.into_iter().filter(|i| *i < count) {
                table.bind_set(set, &[write(&mut tracker, index, 200 + u64::from(index), 64)]).unwrap();
            }
            for &index in &destroy {
                let handle = ObjectHandle::from(vk::Buffer::from_raw(100 + u64::from(index)));
                if tracker.destroy(handle).is_some() {
                    table.on_resource_destroyed(handle);
                }
            }

            for index in 0..count {
                let query = snapshot.slot(0, 0, index).unwrap();
                match (before.contains(&index), destroy.contains(&index)) {
                    (false, _) => prop_assert!(matches!(query, SlotQuery::Uninitialized)),
                    (true, false) => prop_assert!(matches!(query, SlotQuery::Bound(_))),
                    (true, true) => prop_assert!(matches!(query, SlotQuery::Destroyed(_))),
                }
            }
        }
    }
}
