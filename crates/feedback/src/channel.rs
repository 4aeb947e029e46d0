// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Channel
//!
//! Host model of one feedback buffer.  Slots are stored as atomic 64-bit words so that concurrent
//! writers (emulated invocations, or a mapped device buffer being mirrored) never need a lock.  The
//! only point of coordination is the cursor.

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

use crate::prelude::*;

#[derive(Default)]
struct Slot {
    words: [AtomicU64; RECORD_WORDS],
}

/// Protocol position of a channel.
///
/// `Ready -> Armed -> Complete -> Decoded -> (reset) -> Ready`.  Only `Armed` means the device may
/// be writing.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Ready = 0,
    Armed = 1,
    Complete = 2,
    Decoded = 3,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Ready,
            1 => ChannelState::Armed,
            2 => ChannelState::Complete,
            _ => ChannelState::Decoded,
        }
    }
}

pub struct FeedbackChannel {
    cursor: AtomicU32,
    capacity: u32,
    slots: Box<[Slot]>,
    state: AtomicU8,
}

impl fmt::Debug for FeedbackChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedbackChannel")
            .field("capacity", &self.capacity)
            .field("reserved", &self.reserved())
            .field("state", &self.state())
            .finish()
    }
}

/// Exclusive right to fill one slot.  Obtained from [`FeedbackChannel::reserve_slot`].
pub struct WriteHandle<'a> {
    channel: &'a FeedbackChannel,
    index: u32,
}

impl WriteHandle<'_> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn write(self, record: &ViolationRecord) {
        let slot = &self.channel.slots[self.index as usize];
        // Relaxed is enough.  The host only looks after the completion signal, which orders
        // everything the device did before it.
        for (word, value) in slot.words.iter().zip(record.to_words()) {
            word.store(value, Ordering::Relaxed);
        }
    }
}

/// Result of draining a channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DecodedFeedback {
    pub records: Vec<ViolationRecord>,
    /// Raw cursor value, which counts rejected reservations too.
    pub reserved: u32,
    pub capacity: u32,
}

impl DecodedFeedback {
    /// Violations that happened but had nowhere to go.
    pub fn dropped(&self) -> u32 {
        self.reserved.saturating_sub(self.capacity)
    }

    pub fn is_truncated(&self) -> bool {
        self.reserved > self.capacity
    }
}

impl FeedbackChannel {
    pub fn new(capacity: u32) -> Result<Self, FeedbackError> {
        if capacity == 0 {
            return Err(FeedbackError::ZeroCapacity);
        }
        let slots = (0..capacity).map(|_| Slot::default()).collect();
        Ok(Self {
            cursor: AtomicU32::new(0),
            capacity,
            slots,
            state: AtomicU8::new(ChannelState::Ready as u8),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Current cursor.  May exceed capacity.
    pub fn reserved(&self) -> u32 {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Claim the next slot.  Past capacity this returns `None` but still counts the attempt, so
    /// the decoder can tell how much was lost.
    pub fn reserve_slot(&self) -> Option<WriteHandle<'_>> {
        // Saturate instead of wrapping.  A wrapped cursor would hand out slots that are already
        // filled.
        let (Ok(previous) | Err(previous)) =
            self.cursor
                .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |cursor| {
                    Some(cursor.saturating_add(1))
                });
        (previous < self.capacity).then_some(WriteHandle {
            channel: self,
            index: previous,
        })
    }

    /// Reserve and fill in one go.  Returns false when the record was dropped.
    pub fn report(&self, record: &ViolationRecord) -> bool {
        match self.reserve_slot() {
            Some(handle) => {
                handle.write(record);
                true
            }
            None => false,
        }
    }

    /// Hand the channel to the device.
    ///
    /// # Panics
    ///
    /// When the channel still holds results from an earlier use.
    pub fn arm(&self) {
        if let Err(state) = self.transition(ChannelState::Ready, ChannelState::Armed) {
            panic!("feedback channel reused without reset (state {state:?})");
        }
    }

    /// The completion signal for the owning submission was observed.
    ///
    /// # Panics
    ///
    /// When the channel was never armed.
    pub fn mark_complete(&self) {
        if let Err(state) = self.transition(ChannelState::Armed, ChannelState::Complete) {
            panic!("completion signalled for a feedback channel in state {state:?}");
        }
    }

    /// Drain the records written so far.
    ///
    /// # Panics
    ///
    /// While the device may still be writing, or when the same results were already decoded.
    pub fn decode(&self) -> DecodedFeedback {
        match self.state() {
            ChannelState::Armed => panic!("feedback channel decoded before completion"),
            ChannelState::Decoded => panic!("feedback channel decoded twice without reset"),
            ChannelState::Complete => {
                // Another decoder racing us would be a protocol bug too.
                if let Err(state) = self.transition(ChannelState::Complete, ChannelState::Decoded)
                {
                    panic!("feedback channel changed state during decode ({state:?})");
                }
            }
            ChannelState::Ready => {}
        }

        let reserved = self.reserved();
        let written = reserved.min(self.capacity) as usize;
        let records = self.slots[..written]
            .iter()
            .map(|slot| {
                let words = std::array::from_fn(|i| slot.words[i].load(Ordering::Acquire));
                ViolationRecord::from_words(words)
            })
            .collect();

        let decoded = DecodedFeedback {
            records,
            reserved,
            capacity: self.capacity,
        };
        if decoded.is_truncated() {
            tracing::debug!(
                capacity = self.capacity,
                dropped = decoded.dropped(),
                "feedback channel overflowed"
            );
        }
        decoded
    }

    /// Forget everything and return to `Ready`.  Calling it twice is harmless.
    ///
    /// # Panics
    ///
    /// While the device may still be writing.
    pub fn reset(&self) {
        let state = self.state();
        assert!(
            state != ChannelState::Armed,
            "feedback channel reset while the device may be writing"
        );
        self.cursor.store(0, Ordering::Release);
        for slot in self.slots.iter() {
            for word in &slot.words {
                word.store(0, Ordering::Relaxed);
            }
        }
        self.state
            .store(ChannelState::Ready as u8, Ordering::Release);
    }

    /// Serialize into the exact byte layout the device sees.
    pub fn to_bytes(&self) -> Vec<u8> {
        let header = FeedbackHeader {
            cursor: self.reserved(),
            capacity: self.capacity,
        };
        let mut bytes = Vec::with_capacity(buffer_size(self.capacity));
        bytes.extend_from_slice(bytemuck::bytes_of(&header));
        for slot in self.slots.iter() {
            let words: [u64; RECORD_WORDS] =
                std::array::from_fn(|i| slot.words[i].load(Ordering::Acquire));
            bytes.extend_from_slice(bytemuck::bytes_of(&words));
        }
        bytes
    }

    fn transition(&self, from: ChannelState, to: ChannelState) -> Result<(), ChannelState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ChannelState::from_u8)
    }
}

/// Decode a feedback buffer read back from device memory.
pub fn decode_bytes(bytes: &[u8]) -> Result<DecodedFeedback, FeedbackError> {
    if bytes.len() < HEADER_SIZE {
        return Err(FeedbackError::ShortBuffer {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    let header: FeedbackHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_SIZE]);
    let expected = buffer_size(header.capacity);
    if bytes.len() < expected {
        return Err(FeedbackError::ShortBuffer {
            expected,
            actual: bytes.len(),
        });
    }

    let written = header.cursor.min(header.capacity) as usize;
    let records = bytes[HEADER_SIZE..]
        .chunks_exact(RECORD_SIZE)
        .take(written)
        .map(bytemuck::pod_read_unaligned::<ViolationRecord>)
        .collect();

    Ok(DecodedFeedback {
        records,
        reserved: header.cursor,
        capacity: header.capacity,
    })
}
