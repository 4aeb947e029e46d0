// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Resources
//!
//! Buffers, views, images and samplers as far as memory safety is concerned: how big they are,
//! where they live in the device address space, and whether they still exist.
//!
//! Snapshots copy bindings by value, so a snapshot alone cannot notice that a resource was
//! destroyed after it was taken.  Every tracked resource therefore carries a [`Liveness`] token
//! that snapshots share.  Destroying the resource flips the token and every snapshot holding it
//! sees the change.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use ash::vk;
use gpuav_vulkan::handle::{ObjectHandle, ObjectId};

use crate::registry::RangeId;

/// Shared "still exists" flag.
#[derive(Clone, Debug)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Liveness(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn retire(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer {
        size: u64,
        device_address: Option<u64>,
    },
    BufferView {
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
        /// Bytes per texel of the view format.
        texel_size: u32,
    },
    Image,
    ImageView {
        image: vk::Image,
    },
    Sampler,
}

#[derive(Clone, Debug)]
pub struct Resource {
    pub handle: ObjectHandle,
    pub kind: ResourceKind,
    /// Address range registered for this resource, if it has a device address.
    pub range: Option<RangeId>,
    pub liveness: Liveness,
}

impl Resource {
    pub fn buffer_size(&self) -> Option<u64> {
        match self.kind {
            ResourceKind::Buffer { size, .. } => Some(size),
            _ => None,
        }
    }

    pub fn device_address(&self) -> Option<u64> {
        match self.kind {
            ResourceKind::Buffer { device_address, .. } => device_address,
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ResourceTracker {
    resources: HashMap<ObjectId, Resource>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking.  `None` when the handle is already tracked.
    pub fn track(&mut self, handle: ObjectHandle, kind: ResourceKind) -> Option<Liveness> {
        if self.resources.contains_key(&handle.id()) {
            return None;
        }
        let liveness = Liveness::new();
        self.resources.insert(
            handle.id(),
            Resource {
                handle,
                kind,
                range: None,
                liveness: liveness.clone(),
            },
        );
        Some(liveness)
    }

    pub fn set_range(&mut self, handle: ObjectHandle, range: RangeId) -> bool {
        match self.resources.get_mut(&handle.id()) {
            Some(resource) => {
                resource.range = Some(range);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&Resource> {
        self.resources.get(&handle.id())
    }

    pub fn liveness(&self, handle: ObjectHandle) -> Option<Liveness> {
        self.get(handle).map(|r| r.liveness.clone())
    }

    /// Stop tracking and retire the liveness token.
    pub fn destroy(&mut self, handle: ObjectHandle) -> Option<Resource> {
        let resource = self.resources.remove(&handle.id())?;
        resource.liveness.retire();
        Some(resource)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
