// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Device Checks
//!
//! Host model of the three routines instrumented shaders link against:
//!
//! - `gpuav_check_descriptor(site, set, binding, index, offset, size) -> bool`
//! - `gpuav_check_texel(site, set, binding, index, texel) -> bool`
//! - `gpuav_check_address(site, address, size, alignment) -> bool`
//!
//! `offset`, `size`, `texel` and `address` are u64, everything else is u32.  The shader side
//! saturates offsets at `u64::MAX` rather than wrapping, so a huge index can only fail a check.
//!
//! `true` lets the guarded instruction run.  `false` skips it, and unless the failure is a
//! consequence of an earlier one, leaves a record in the feedback channel first.
//!
//! The device library must agree with this module bit for bit.  Tests and software replay run
//! through here directly, one call per invocation, from as many threads as they like.

use std::sync::Arc;

use gpuav_feedback::{ErrorCode, FeedbackChannel, ViolationRecord};
use gpuav_spirv::SENTINEL_SPAN;

use crate::descriptors::{BindingSnapshot, BoundResource, SlotQuery};
use crate::registry::{AddressLookup, AddressTable};

/// Everything one dispatch's checks read or write.
#[derive(Clone, Debug)]
pub struct DeviceChecks {
    pub snapshot: Arc<BindingSnapshot>,
    pub addresses: Arc<AddressTable>,
    pub channel: Arc<FeedbackChannel>,
    pub dispatch_index: u16,
    pub sentinel: u64,
}

/// Fields of a record that vary by failure.
struct Failure {
    code: ErrorCode,
    observed_index: u64,
    bound_length: u64,
    accessed_offset: i64,
}

impl Failure {
    fn new(code: ErrorCode, observed_index: u64, bound_length: u64) -> Self {
        Self {
            code,
            observed_index,
            bound_length,
            accessed_offset: 0,
        }
    }

    fn at(mut self, offset: u64) -> Self {
        self.accessed_offset = offset as i64;
        self
    }
}

impl DeviceChecks {
    #[allow(clippy::too_many_arguments)]
    pub fn check_descriptor(
        &self,
        invocation: u64,
        site: u32,
        set: u32,
        binding: u32,
        index: u32,
        offset: u64,
        size: u64,
    ) -> bool {
        self.verdict(invocation, site, || {
            let resource = self.slot(set, binding, index)?;
            if size == 0 {
                return Ok(());
            }
            match resource {
                Some(BoundResource::Buffer { length, .. }) => {
                    let past = offset.checked_add(size).is_none_or(|end| end > length);
                    if past {
                        return Err(Failure::new(
                            ErrorCode::BufferOutOfBounds,
                            u64::from(index),
                            length,
                        )
                        .at(offset));
                    }
                    Ok(())
                }
                _ => Ok(()),
            }
        })
    }

    pub fn check_texel(
        &self,
        invocation: u64,
        site: u32,
        set: u32,
        binding: u32,
        index: u32,
        texel: u64,
    ) -> bool {
        self.verdict(invocation, site, || {
            let resource = self.slot(set, binding, index)?;
            if let Some(resource @ BoundResource::TexelBuffer { .. }) = resource {
                let texels = resource.bound_length();
                if texel >= texels {
                    return Err(Failure::new(ErrorCode::TexelOutOfBounds, texel, texels));
                }
            }
            Ok(())
        })
    }

    pub fn check_address(
        &self,
        invocation: u64,
        site: u32,
        address: u64,
        size: u64,
        alignment: u32,
    ) -> bool {
        // Hops below a failed root.  The root already reported.
        if address.wrapping_sub(self.sentinel) < SENTINEL_SPAN {
            return false;
        }
        self.verdict(invocation, site, || {
            if alignment > 1 && address % u64::from(alignment) != 0 {
                return Err(Failure::new(
                    ErrorCode::AddressMisaligned,
                    address,
                    u64::from(alignment),
                ));
            }
            let Some(end) = address.checked_add(size) else {
                return Err(Failure::new(ErrorCode::AddressOverflow, address, size));
            };
            match self.addresses.lookup(address) {
                AddressLookup::Live(entry) if end > entry.end() => Err(Failure::new(
                    ErrorCode::AddressOutOfBounds,
                    address,
                    entry.length,
                )
                .at(address - entry.base)),
                AddressLookup::Live(_) => Ok(()),
                AddressLookup::Destroyed(entry) => Err(Failure::new(
                    ErrorCode::AddressDestroyed,
                    address,
                    entry.length,
                )
                .at(address - entry.base)),
                AddressLookup::Unmapped => {
                    Err(Failure::new(ErrorCode::AddressUnmapped, address, 0))
                }
            }
        })
    }

    /// Slot status checks shared by descriptor and texel checks.  `Ok(None)` for a null
    /// descriptor, which reads zeros without a record.
    fn slot(&self, set: u32, binding: u32, index: u32) -> Result<Option<BoundResource>, Failure> {
        let observed = u64::from(index);
        match self.snapshot.slot(set, binding, index) {
            Some(SlotQuery::Bound(descriptor)) => Ok(Some(descriptor.resource)),
            Some(SlotQuery::NullAllowed) => Ok(None),
            Some(SlotQuery::Destroyed(descriptor)) => Err(Failure::new(
                ErrorCode::DescriptorDestroyed,
                observed,
                descriptor.resource.bound_length(),
            )),
            Some(SlotQuery::BeyondAllocatedCount { allocated }) => Err(Failure::new(
                ErrorCode::DescriptorBeyondCount,
                observed,
                u64::from(allocated),
            )),
            Some(SlotQuery::OutOfRange { count }) => Err(Failure::new(
                ErrorCode::DescriptorIndexOutOfBounds,
                observed,
                u64::from(count),
            )),
            Some(SlotQuery::Uninitialized) | None => {
                Err(Failure::new(ErrorCode::DescriptorUninitialized, observed, 0))
            }
        }
    }

    fn verdict(
        &self,
        invocation: u64,
        site: u32,
        check: impl FnOnce() -> Result<(), Failure>,
    ) -> bool {
        let failure = match check() {
            Ok(()) => return true,
            Err(failure) => failure,
        };
        // A full channel still skips the access.  The decoder reports the overflow.
        self.channel.report(&ViolationRecord {
            check_site_id: site,
            error_code: failure.code as u16,
            dispatch_index: self.dispatch_index,
            invocation_id: invocation,
            observed_index: failure.observed_index,
            bound_length: failure.bound_length,
            accessed_offset: failure.accessed_offset,
        });
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use ash::vk::{self, Handle};
    use gpuav_spirv::DEFAULT_SENTINEL;
    use gpuav_vulkan::descriptors::DescriptorSetLayout;
    use gpuav_vulkan::handle::ObjectHandle;
    use smallvec::SmallVec;

    use crate::descriptors::{BoundDescriptor, DescriptorBindingTable, DescriptorWrite};
    use crate::registry::AddressRangeRegistry;
    use crate::resource::{ResourceKind, ResourceTracker};

    fn checks(snapshot: BindingSnapshot, addresses: AddressTable) -> DeviceChecks {
        DeviceChecks {
            snapshot: Arc::new(snapshot),
            addresses: Arc::new(addresses),
            channel: Arc::new(FeedbackChannel::new(16).unwrap()),
            dispatch_index: 2,
            sentinel: DEFAULT_SENTINEL,
        }
    }

    fn codes(checks: &DeviceChecks) -> Vec<ErrorCode> {
        checks
            .channel
            .decode()
            .records
            .iter()
            .map(|r| r.code().unwrap())
            .collect()
    }

    fn texel_snapshot(tracker: &mut ResourceTracker) -> BindingSnapshot {
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(2),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::UNIFORM_TEXEL_BUFFER)
                .descriptor_count(1),
        ];
        let layout = Arc::new(DescriptorSetLayout::new(&bindings, &[]).unwrap());
        let mut table = DescriptorBindingTable::new(false);
        let set = table.allocate(layout, None).unwrap();

        let buffer = vk::Buffer::from_raw(1);
        let view = vk::BufferView::from_raw(2);
        let b = tracker
            .track(
                buffer.into(),
                ResourceKind::Buffer {
                    size: 64,
                    device_address: None,
                },
            )
            .unwrap();
        let v = tracker
            .track(
                view.into(),
                ResourceKind::BufferView {
                    buffer,
                    offset: 0,
                    range: 64,
                    texel_size: 4,
                },
            )
            .unwrap();
        let writes = [
            DescriptorWrite {
                binding: 0,
                first_array_element: 0,
                descriptors: vec![Some(BoundDescriptor {
                    resource: BoundResource::Buffer {
                        buffer,
                        offset: 0,
                        length: 16,
                    },
                    liveness: SmallVec::from_iter([b.clone()]),
                })],
            },
            DescriptorWrite {
                binding: 1,
                first_array_element: 0,
                descriptors: vec![Some(BoundDescriptor {
                    resource: BoundResource::TexelBuffer {
                        view,
                        buffer,
                        length: 64,
                        texel_size: 4,
                    },
                    liveness: SmallVec::from_iter([v, b]),
                })],
            },
        ];
        table.bind_set(set, &writes).unwrap();
        table.snapshot(&[(0, set)]).unwrap()
    }

    #[test]
    fn test_descriptor_bounds() {
        let mut tracker = ResourceTracker::new();
        let checks = checks(texel_snapshot(&mut tracker), AddressTable::default());

        assert!(checks.check_descriptor(0, 1, 0, 0, 0, 0, 16));
        assert!(!checks.check_descriptor(1, 1, 0, 0, 0, 16, 4));
        assert!(!checks.check_descriptor(2, 1, 0, 0, 1, 0, 4));
        assert!(!checks.check_descriptor(3, 1, 0, 0, 2, 0, 4));
        assert!(!checks.check_descriptor(4, 1, 3, 0, 0, 0, 0));

        let feedback = checks.channel.decode();
        let first = feedback.records[0];
        assert_eq!(first.bound_length, 16);
        assert_eq!(first.accessed_offset, 16);
        assert_eq!(first.dispatch_index, 2);
        assert_eq!(first.invocation_id, 1);
        let codes: Vec<_> = feedback.records.iter().map(|r| r.code().unwrap()).collect();
        assert_eq!(
            codes,
            [
                ErrorCode::BufferOutOfBounds,
                ErrorCode::DescriptorUninitialized,
                ErrorCode::DescriptorIndexOutOfBounds,
                ErrorCode::DescriptorUninitialized,
            ]
        );
    }

    #[test]
    fn test_texel_bounds_and_destroy() {
        let mut tracker = ResourceTracker::new();
        let checks = checks(texel_snapshot(&mut tracker), AddressTable::default());

        assert!(checks.check_texel(0, 3, 0, 1, 0, 15));
        assert!(!checks.check_texel(0, 3, 0, 1, 0, 16));
        tracker.destroy(vk::Buffer::from_raw(1).into()).unwrap();
        assert!(!checks.check_texel(0, 3, 0, 1, 0, 0));
        assert!(!checks.check_descriptor(0, 3, 0, 0, 0, 0, 4));
        assert_eq!(
            codes(&checks),
            [
                ErrorCode::TexelOutOfBounds,
                ErrorCode::DescriptorDestroyed,
                ErrorCode::DescriptorDestroyed,
            ]
        );
    }

    #[test]
    fn test_address_checks() {
        let memory = ObjectHandle::from(vk::DeviceMemory::from_raw(1));
        let mut registry = AddressRangeRegistry::new();
        registry.insert(0x1000, 0x100, memory).unwrap();
        let dead = registry.insert(0x4000, 0x100, memory).unwrap();
        registry.mark_destroyed(dead, 1).unwrap();
        let checks = checks(BindingSnapshot::default(), registry.snapshot(|_| None));

        assert!(checks.check_address(0, 5, 0x1000, 0x100, 4));
        assert!(!checks.check_address(0, 5, 0x10fc, 8, 4));
        assert!(!checks.check_address(0, 5, 0x1002, 4, 4));
        assert!(!checks.check_address(0, 5, 0x4000, 4, 4));
        assert!(!checks.check_address(0, 5, 0x8000, 4, 4));
        assert!(!checks.check_address(0, 5, u64::MAX - 3, 8, 4));
        assert!(!checks.check_address(0, 5, DEFAULT_SENTINEL + 64, 4, 4));
        assert_eq!(
            codes(&checks),
            [
                ErrorCode::AddressOutOfBounds,
                ErrorCode::AddressMisaligned,
                ErrorCode::AddressDestroyed,
                ErrorCode::AddressUnmapped,
                ErrorCode::AddressOverflow,
            ]
        );
    }
}
