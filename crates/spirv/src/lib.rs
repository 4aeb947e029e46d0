// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # SPIR-V
//!
//! Shader rewriting for validation.  A module goes in together with what the host knows about its
//! descriptor layout, and comes out with every risky memory access fenced behind a check plus a
//! table explaining what each check guards.
//!
//! - [`Module`] parses and assembles words without interpreting much.
//! - [`ModuleInfo`](info::ModuleInfo) learns types, layouts and descriptor decorations.
//! - [`Instrumentor`] does the rewriting.
//!
//! The check routines themselves are not emitted here.  They are declared as linked imports and the
//! caller links the instrumented module against its own routine library.

pub mod info;
pub mod instrument;
pub mod layout;
pub mod module;
pub mod op;
pub mod site;

pub use instrument::{
    CHECK_ADDRESS, CHECK_DESCRIPTOR, CHECK_TEXEL, DEFAULT_SENTINEL, InstrumentOptions,
    InstrumentedShader, Instrumentor, SENTINEL_SPAN,
};
pub use layout::{BindingShape, LayoutMetadata};
pub use module::{Id, Instruction, Module};
pub use site::{AccessKind, AtomicTarget, CheckKind, CheckSite, SourceLocation, SourceLocationId};

pub mod prelude {
    pub use super::SpirvError;
    pub use crate::instrument::{InstrumentOptions, InstrumentedShader, Instrumentor};
    pub use crate::layout::{BindingShape, LayoutMetadata};
    pub use crate::site::{AccessKind, AtomicTarget, CheckKind, CheckSite, SourceLocation};
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SpirvError {
    #[error("not a SPIR-V module, magic is {0:#010x}")]
    BadMagic(u32),

    #[error("module truncated at word {offset}")]
    Truncated { offset: usize },

    #[error("instruction at word {offset} has a zero word count")]
    ZeroWordCount { offset: usize },

    #[error("malformed function: {0}")]
    MalformedFunction(&'static str),

    #[error("instruction with opcode {opcode} needs {words} words, more than a word count can hold")]
    InstructionTooLong { opcode: u16, words: usize },

    #[error("instrumenting needs more result ids than a module bound can hold")]
    IdsExhausted,

    #[error("check site ids starting at {first} run past u32::MAX")]
    SiteIdsExhausted { first: u32 },
}
