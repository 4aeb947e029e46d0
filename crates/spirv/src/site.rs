// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Check sites
//!
//! Everything the host needs to turn a bare check-site id from the feedback buffer back into a
//! sentence.  Built once per shader, never mutated afterward.

use std::fmt;

/// What the original instruction did with the memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Load,
    Store,
    CopySource,
    CopyTarget,
    Sample,
    Read,
    Write,
    Atomic,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessKind::Load => "load",
            AccessKind::Store => "store",
            AccessKind::CopySource => "copy read",
            AccessKind::CopyTarget => "copy write",
            AccessKind::Sample => "sample",
            AccessKind::Read => "read",
            AccessKind::Write => "write",
            AccessKind::Atomic => "atomic",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AtomicTarget {
    Descriptor { set: u32, binding: u32 },
    Address { alignment: u32 },
    Texel { set: u32, binding: u32 },
}

/// The closed set of instrumented operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CheckKind {
    /// Buffer or image access through a descriptor, possibly an indexed array of them.  Image
    /// accesses have a zero footprint and only check the slot itself.
    DescriptorIndexedAccess {
        set: u32,
        binding: u32,
        access: AccessKind,
        footprint: u64,
    },
    /// Load, store or copy through a physical storage buffer pointer.
    RawPointerDereference {
        access: AccessKind,
        footprint: u64,
        alignment: u32,
    },
    AtomicOp { target: AtomicTarget, width: u32 },
    TexelBufferOp {
        set: u32,
        binding: u32,
        access: AccessKind,
    },
}

impl CheckKind {
    /// `(set, binding)` when the access goes through a descriptor.
    pub fn descriptor(&self) -> Option<(u32, u32)> {
        match *self {
            CheckKind::DescriptorIndexedAccess { set, binding, .. }
            | CheckKind::TexelBufferOp { set, binding, .. } => Some((set, binding)),
            CheckKind::AtomicOp {
                target:
                    AtomicTarget::Descriptor { set, binding } | AtomicTarget::Texel { set, binding },
                ..
            } => Some((set, binding)),
            CheckKind::AtomicOp {
                target: AtomicTarget::Address { .. },
                ..
            }
            | CheckKind::RawPointerDereference { .. } => None,
        }
    }

    /// Bytes touched by one execution of the instruction.
    pub fn footprint(&self) -> u64 {
        match *self {
            CheckKind::DescriptorIndexedAccess { footprint, .. }
            | CheckKind::RawPointerDereference { footprint, .. } => footprint,
            CheckKind::AtomicOp { width, .. } => width as u64,
            CheckKind::TexelBufferOp { .. } => 1,
        }
    }

    pub fn access(&self) -> AccessKind {
        match *self {
            CheckKind::DescriptorIndexedAccess { access, .. }
            | CheckKind::RawPointerDereference { access, .. }
            | CheckKind::TexelBufferOp { access, .. } => access,
            CheckKind::AtomicOp { .. } => AccessKind::Atomic,
        }
    }
}

/// Index into [`crate::InstrumentedShader::source_locations`].
pub type SourceLocationId = u32;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckSite {
    pub id: u32,
    pub kind: CheckKind,
    /// Opcode of the instruction being guarded.
    pub opcode: u16,
    pub source_location: Option<SourceLocationId>,
}
