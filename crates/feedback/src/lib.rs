// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Feedback
//!
//! Shaders can't call us, so they leave notes.
//!
//! Every command buffer that runs instrumented code gets one feedback buffer.  The device side
//! treats it as a bag of fixed-size records guarded by a single atomic cursor:
//!
//! ```text
//! struct Feedback {
//!     u32 cursor;
//!     u32 capacity;
//!     ViolationRecord records[capacity];
//! }
//! ```
//!
//! A failing check bumps the cursor, and if the old value is still below capacity, the slot it got
//! back is exclusively its own to fill.  Nobody waits and nobody retries.  When the cursor runs past
//! capacity the extra notes are simply dropped and the host reports the buffer as truncated.
//!
//! The host side never reads a buffer while the device might still be writing it.  The
//! [`FeedbackChannel`] carries a small protocol state machine so that decode-before-completion and
//! reuse-without-reset blow up loudly instead of producing garbage.

pub mod channel;
pub mod record;

pub use channel::{ChannelState, DecodedFeedback, FeedbackChannel, WriteHandle, decode_bytes};
pub use record::{ErrorCode, FeedbackHeader, ViolationRecord};

pub mod prelude {
    pub use super::FeedbackError;
    pub use crate::record::*;
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedbackError {
    #[error("feedback capacity must be at least one record")]
    ZeroCapacity,

    #[error("feedback buffer of {actual} bytes is too small, need {expected}")]
    ShortBuffer { expected: usize, actual: usize },

    #[error("unknown violation code {0}")]
    UnknownCode(u16),
}
