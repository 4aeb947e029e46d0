// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Records
//!
//! Byte layout shared with the injected device routines.  Any change here must be mirrored in the
//! linked check library or the host will happily decode nonsense.

use std::mem::{offset_of, size_of};

use crate::FeedbackError;

/// Bytes occupied by [`FeedbackHeader`] at the front of every feedback buffer.
pub const HEADER_SIZE: usize = 8;
/// Bytes occupied by one [`ViolationRecord`].
pub const RECORD_SIZE: usize = 40;
/// A record viewed as 64-bit words, which is how slots are stored host side.
pub const RECORD_WORDS: usize = RECORD_SIZE / 8;

/// Total byte size of a feedback buffer holding `capacity` records.
pub const fn buffer_size(capacity: u32) -> usize {
    HEADER_SIZE + capacity as usize * RECORD_SIZE
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct FeedbackHeader {
    pub cursor: u32,
    pub capacity: u32,
}

/// One failed check, as written by the device.
///
/// The four bytes after `check_site_id` would be alignment padding for `invocation_id`.  They carry
/// the failure code and the ordinal of the dispatch within its command buffer instead.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ViolationRecord {
    pub check_site_id: u32,
    pub error_code: u16,
    pub dispatch_index: u16,
    pub invocation_id: u64,
    /// Descriptor index, texel coordinate or device address, depending on `error_code`.
    pub observed_index: u64,
    pub bound_length: u64,
    pub accessed_offset: i64,
}

const _: () = assert!(size_of::<FeedbackHeader>() == HEADER_SIZE);
const _: () = assert!(size_of::<ViolationRecord>() == RECORD_SIZE);
const _: () = assert!(offset_of!(ViolationRecord, check_site_id) == 0);
const _: () = assert!(offset_of!(ViolationRecord, error_code) == 4);
const _: () = assert!(offset_of!(ViolationRecord, dispatch_index) == 6);
const _: () = assert!(offset_of!(ViolationRecord, invocation_id) == 8);
const _: () = assert!(offset_of!(ViolationRecord, observed_index) == 16);
const _: () = assert!(offset_of!(ViolationRecord, bound_length) == 24);
const _: () = assert!(offset_of!(ViolationRecord, accessed_offset) == 32);

impl ViolationRecord {
    pub fn code(&self) -> Result<ErrorCode, FeedbackError> {
        ErrorCode::try_from(self.error_code)
    }

    pub(crate) fn to_words(self) -> [u64; RECORD_WORDS] {
        bytemuck::cast(self)
    }

    pub(crate) fn from_words(words: [u64; RECORD_WORDS]) -> Self {
        bytemuck::cast(words)
    }
}

/// Why a device check failed.
///
/// The numbering is part of the wire format.  Zero is left unused so that a slot that was reserved
/// but never filled decodes as an error instead of a plausible violation.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// `observed_index` is the descriptor index, `bound_length` the array capacity.
    DescriptorIndexOutOfBounds = 1,
    DescriptorUninitialized = 2,
    /// `bound_length` is the variable descriptor count the set was allocated with.
    DescriptorBeyondCount = 3,
    DescriptorDestroyed = 4,
    /// `bound_length` is the bound range, `accessed_offset` the first byte touched.
    BufferOutOfBounds = 5,
    /// `observed_index` is the texel coordinate, `bound_length` the texel count.
    TexelOutOfBounds = 6,
    /// `observed_index` is the address.  No range, live or dead, contains it.
    AddressUnmapped = 7,
    /// The access starts inside a live range but runs past its end.
    AddressOutOfBounds = 8,
    AddressDestroyed = 9,
    /// `bound_length` carries the required alignment.
    AddressMisaligned = 10,
    /// `bound_length` carries the access size that wrapped the address space.
    AddressOverflow = 11,
}

impl TryFrom<u16> for ErrorCode {
    type Error = FeedbackError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => ErrorCode::DescriptorIndexOutOfBounds,
            2 => ErrorCode::DescriptorUninitialized,
            3 => ErrorCode::DescriptorBeyondCount,
            4 => ErrorCode::DescriptorDestroyed,
            5 => ErrorCode::BufferOutOfBounds,
            6 => ErrorCode::TexelOutOfBounds,
            7 => ErrorCode::AddressUnmapped,
            8 => ErrorCode::AddressOutOfBounds,
            9 => ErrorCode::AddressDestroyed,
            10 => ErrorCode::AddressMisaligned,
            11 => ErrorCode::AddressOverflow,
            other => return Err(FeedbackError::UnknownCode(other)),
        })
    }
}

impl ErrorCode {
    /// `observed_index` of these codes is a device address.
    pub fn is_address(self) -> bool {
        matches!(
            self,
            ErrorCode::AddressUnmapped
                | ErrorCode::AddressOutOfBounds
                | ErrorCode::AddressDestroyed
                | ErrorCode::AddressMisaligned
                | ErrorCode::AddressOverflow
        )
    }
}
