// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host-side view of the pipeline layout, as far as the instrumentor needs it.

use std::collections::BTreeMap;

use xxhash_rust::xxh3::Xxh3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BindingShape {
    /// Declared descriptor count.
    pub count: u32,
    pub texel_buffer: bool,
}

/// `(set, binding)` to shape.  Descriptors the layout does not know about are not instrumented.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LayoutMetadata {
    bindings: BTreeMap<(u32, u32), BindingShape>,
}

impl LayoutMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, set: u32, binding: u32, shape: BindingShape) {
        self.bindings.insert((set, binding), shape);
    }

    pub fn get(&self, set: u32, binding: u32) -> Option<&BindingShape> {
        self.bindings.get(&(set, binding))
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Stable hash of the contents, for cache keys.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for ((set, binding), shape) in &self.bindings {
            hasher.update(&set.to_le_bytes());
            hasher.update(&binding.to_le_bytes());
            hasher.update(&shape.count.to_le_bytes());
            hasher.update(&[shape.texel_buffer as u8]);
        }
        hasher.digest()
    }
}

impl FromIterator<((u32, u32), BindingShape)> for LayoutMetadata {
    fn from_iter<T: IntoIterator<Item = ((u32, u32), BindingShape)>>(iter: T) -> Self {
        Self {
            bindings: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_fingerprint_tracks_contents() {
        let shape = BindingShape {
            count: 6,
            texel_buffer: false,
        };
        let a: LayoutMetadata = [((0, 0), shape)].into_iter().collect();
        let mut b = LayoutMetadata::new();
        b.insert(0, 0, shape);
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.insert(0, 1, shape);
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_eq!(b.get(0, 1), Some(&shape));
    }
}
