// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Module
//!
//! Words in, words out.  Instructions are kept as opcode plus raw operand words.  Anything the
//! instrumentor does not understand passes through untouched.

use xxhash_rust::xxh3::{Xxh3, xxh3_64};

use crate::op;
use crate::prelude::*;

pub type Id = u32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub generator: u32,
    /// One past the highest id in use.
    pub bound: u32,
    pub schema: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: u16,
    /// Every word after the opcode/word-count word.
    pub operands: Vec<u32>,
}

impl Instruction {
    pub fn new(opcode: u16, operands: Vec<u32>) -> Self {
        Self { opcode, operands }
    }

    pub fn result_type(&self) -> Option<Id> {
        if op::has_result_type(self.opcode) {
            self.operands.first().copied()
        } else {
            None
        }
    }

    pub fn result_id(&self) -> Option<Id> {
        if op::has_result_type(self.opcode) {
            self.operands.get(1).copied()
        } else if op::has_result(self.opcode) {
            self.operands.first().copied()
        } else {
            None
        }
    }

    /// Replace the result id in place.  No-op for instructions without one.
    pub fn set_result_id(&mut self, id: Id) {
        let slot = if op::has_result_type(self.opcode) {
            self.operands.get_mut(1)
        } else if op::has_result(self.opcode) {
            self.operands.first_mut()
        } else {
            None
        };
        if let Some(slot) = slot {
            *slot = id;
        }
    }

    pub fn operand(&self, index: usize) -> Option<u32> {
        self.operands.get(index).copied()
    }

    pub fn word_count(&self) -> usize {
        self.operands.len() + 1
    }

    /// Word count and opcode packed into the leading word.
    pub fn first_word(&self) -> Result<u32, SpirvError> {
        let count = u16::try_from(self.word_count()).map_err(|_| SpirvError::InstructionTooLong {
            opcode: self.opcode,
            words: self.word_count(),
        })?;
        Ok((u32::from(count) << 16) | u32::from(self.opcode))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    pub header: Header,
    pub instructions: Vec<Instruction>,
}

impl Module {
    pub fn parse(words: &[u32]) -> Result<Self, SpirvError> {
        if words.len() < 5 {
            return Err(SpirvError::Truncated { offset: words.len() });
        }
        if words[0] != op::MAGIC {
            return Err(SpirvError::BadMagic(words[0]));
        }
        let header = Header {
            version: words[1],
            generator: words[2],
            bound: words[3],
            schema: words[4],
        };

        let mut instructions = Vec::new();
        let mut offset = 5;
        while offset < words.len() {
            let first = words[offset];
            let count = (first >> 16) as usize;
            let opcode = (first & 0xffff) as u16;
            if count == 0 {
                return Err(SpirvError::ZeroWordCount { offset });
            }
            if offset + count > words.len() {
                return Err(SpirvError::Truncated { offset });
            }
            instructions.push(Instruction {
                opcode,
                operands: words[offset + 1..offset + count].to_vec(),
            });
            offset += count;
        }

        Ok(Self {
            header,
            instructions,
        })
    }

    pub fn assemble(&self) -> Result<Vec<u32>, SpirvError> {
        let body: usize = self.instructions.iter().map(Instruction::word_count).sum();
        let mut words = Vec::with_capacity(5 + body);
        words.extend(self.header_words());
        for inst in &self.instructions {
            words.push(inst.first_word()?);
            words.extend_from_slice(&inst.operands);
        }
        Ok(words)
    }

    /// Identity of the module contents.  Used to instrument identical shaders once.
    ///
    /// Equal to [`hash_words`] of the assembled module.  An instruction too long to assemble still
    /// hashes, by its untruncated word count.
    pub fn hash(&self) -> u64 {
        let mut hasher = Xxh3::new();
        let mut update = |word: u32| hasher.update(&word.to_le_bytes());
        self.header_words().into_iter().for_each(&mut update);
        for inst in &self.instructions {
            match inst.first_word() {
                Ok(first) => update(first),
                // A zero word never leads an assembled instruction.
                Err(_) => {
                    let count = inst.word_count() as u64;
                    [0, u32::from(inst.opcode), count as u32, (count >> 32) as u32]
                        .into_iter()
                        .for_each(&mut update);
                }
            }
            inst.operands.iter().copied().for_each(&mut update);
        }
        hasher.digest()
    }

    fn header_words(&self) -> [u32; 5] {
        [
            op::MAGIC,
            self.header.version,
            self.header.generator,
            self.header.bound,
            self.header.schema,
        ]
    }
}

pub fn hash_words(words: &[u32]) -> u64 {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    xxh3_64(&bytes)
}

/// Decode a nul-terminated literal string.  Returns the string and the words it occupied.
pub fn decode_string(words: &[u32]) -> (String, usize) {
    let mut bytes = Vec::new();
    for (i, word) in words.iter().enumerate() {
        for byte in word.to_le_bytes() {
            if byte == 0 {
                return (String::from_utf8_lossy(&bytes).into_owned(), i + 1);
            }
            bytes.push(byte);
        }
    }
    (String::from_utf8_lossy(&bytes).into_owned(), words.len())
}

/// Encode a literal string, nul terminated and padded to whole words.
pub fn encode_string(s: &str) -> Vec<u32> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    while bytes.len() % 4 != 0 {
        bytes.push(0);
    }
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
