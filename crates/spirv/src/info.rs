// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Info
//!
//! One pass over the module to learn types, explicit layout decorations, integer constants and
//! which global variables are descriptors.  Byte footprints are computed from the explicit layout,
//! which for buffer-backed storage classes is required to be present.

use std::collections::{HashMap, HashSet};

use crate::module::{Id, Module, decode_string};
use crate::op::{self, decoration};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Type {
    Void,
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: Id, count: u32 },
    Matrix { column: Id, count: u32 },
    Image { dim: u32 },
    Sampler,
    SampledImage { image: Id },
    Array { element: Id, length: Id },
    RuntimeArray { element: Id },
    Struct { members: Vec<Id> },
    Pointer { storage: u32, pointee: Id },
    Function { ret: Id, params: Vec<Id> },
    Other,
}

/// Explicit layout of a matrix, taken from the struct member that holds it directly or through
/// arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MatrixLayout {
    /// Bytes between columns, or between rows when row major.
    pub stride: u32,
    pub row_major: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Variable {
    pub pointer_type: Id,
    pub storage: u32,
}

#[derive(Debug, Default)]
pub struct ModuleInfo {
    pub types: HashMap<Id, Type>,
    pub constants: HashMap<Id, u64>,
    pub value_types: HashMap<Id, Id>,
    pub variables: HashMap<Id, Variable>,
    pub strings: HashMap<Id, String>,
    pub capabilities: HashSet<u32>,
    descriptor_sets: HashMap<Id, u32>,
    bindings: HashMap<Id, u32>,
    blocks: HashSet<Id>,
    array_strides: HashMap<Id, u32>,
    member_offsets: HashMap<(Id, u32), u32>,
    matrix_strides: HashMap<(Id, u32), u32>,
    row_major: HashSet<(Id, u32)>,
}

impl ModuleInfo {
    pub fn analyze(module: &Module) -> Self {
        let mut info = ModuleInfo::default();
        for inst in &module.instructions {
            let w = &inst.operands;
            if let (Some(ty), Some(result)) = (inst.result_type(), inst.result_id()) {
                info.value_types.insert(result, ty);
            }
            match inst.opcode {
                op::CAPABILITY if !w.is_empty() => {
                    info.capabilities.insert(w[0]);
                }
                op::STRING if !w.is_empty() => {
                    info.strings.insert(w[0], decode_string(&w[1..]).0);
                }
                op::DECORATE if w.len() >= 2 => match (w[1], w.get(2)) {
                    (decoration::DESCRIPTOR_SET, Some(&set)) => {
                        info.descriptor_sets.insert(w[0], set);
                    }
                    (decoration::BINDING, Some(&binding)) => {
                        info.bindings.insert(w[0], binding);
                    }
                    (decoration::ARRAY_STRIDE, Some(&stride)) => {
                        info.array_strides.insert(w[0], stride);
                    }
                    (decoration::BLOCK | decoration::BUFFER_BLOCK, _) => {
                        info.blocks.insert(w[0]);
                    }
                    _ => {}
                },
                op::MEMBER_DECORATE if w.len() >= 4 => match w[2] {
                    decoration::OFFSET => {
                        info.member_offsets.insert((w[0], w[1]), w[3]);
                    }
                    decoration::MATRIX_STRIDE => {
                        info.matrix_strides.insert((w[0], w[1]), w[3]);
                    }
                    _ => {}
                },
                op::MEMBER_DECORATE if w.len() == 3 && w[2] == decoration::ROW_MAJOR => {
                    info.row_major.insert((w[0], w[1]));
                }
                op::CONSTANT | op::SPEC_CONSTANT if w.len() >= 3 => {
                    let low = w[2] as u64;
                    let high = w.get(3).copied().unwrap_or(0) as u64;
                    info.constants.insert(w[1], low | (high << 32));
                }
                op::VARIABLE if w.len() >= 3 => {
                    info.variables.insert(
                        w[1],
                        Variable {
                            pointer_type: w[0],
                            storage: w[2],
                        },
                    );
                }
                opcode if (op::TYPE_VOID..=op::TYPE_FUNCTION).contains(&opcode) && !w.is_empty() => {
                    info.types.insert(w[0], Self::parse_type(opcode, w));
                }
                _ => {}
            }
        }
        info
    }

    fn parse_type(opcode: u16, w: &[u32]) -> Type {
        let at = |i: usize| w.get(i).copied().unwrap_or(0);
        match opcode {
            op::TYPE_VOID => Type::Void,
            op::TYPE_BOOL => Type::Bool,
            op::TYPE_INT => Type::Int {
                width: at(1),
                signed: at(2) != 0,
            },
            op::TYPE_FLOAT => Type::Float { width: at(1) },
            op::TYPE_VECTOR => Type::Vector {
                component: at(1),
                count: at(2),
            },
            op::TYPE_MATRIX => Type::Matrix {
                column: at(1),
                count: at(2),
            },
            op::TYPE_IMAGE => Type::Image { dim: at(2) },
            op::TYPE_SAMPLER => Type::Sampler,
            op::TYPE_SAMPLED_IMAGE => Type::SampledImage { image: at(1) },
            op::TYPE_ARRAY => Type::Array {
                element: at(1),
                length: at(2),
            },
            op::TYPE_RUNTIME_ARRAY => Type::RuntimeArray { element: at(1) },
            op::TYPE_STRUCT => Type::Struct {
                members: w[1..].to_vec(),
            },
            op::TYPE_POINTER => Type::Pointer {
                storage: at(1),
                pointee: at(2),
            },
            op::TYPE_FUNCTION => Type::Function {
                ret: at(1),
                params: w.get(2..).map(<[u32]>::to_vec).unwrap_or_default(),
            },
            _ => Type::Other,
        }
    }

    pub fn ty(&self, id: Id) -> Option<&Type> {
        self.types.get(&id)
    }

    pub fn constant(&self, id: Id) -> Option<u64> {
        self.constants.get(&id).copied()
    }

    pub fn value_type(&self, id: Id) -> Option<Id> {
        self.value_types.get(&id).copied()
    }

    /// `(storage class, pointee)` of a pointer type.
    pub fn pointee(&self, pointer_type: Id) -> Option<(u32, Id)> {
        match self.ty(pointer_type)? {
            Type::Pointer { storage, pointee } => Some((*storage, *pointee)),
            _ => None,
        }
    }

    /// `(set, binding)` for a variable decorated as a descriptor.
    pub fn descriptor_binding(&self, variable: Id) -> Option<(u32, u32)> {
        Some((
            *self.descriptor_sets.get(&variable)?,
            *self.bindings.get(&variable)?,
        ))
    }

    pub fn is_block(&self, ty: Id) -> bool {
        self.blocks.contains(&ty)
    }

    pub fn array_stride(&self, ty: Id) -> Option<u32> {
        self.array_strides.get(&ty).copied()
    }

    pub fn member_offset(&self, ty: Id, member: u32) -> Option<u32> {
        self.member_offsets.get(&(ty, member)).copied()
    }

    pub fn matrix_stride(&self, ty: Id, member: u32) -> Option<u32> {
        self.matrix_strides.get(&(ty, member)).copied()
    }

    /// Layout of matrices inside member `member` of struct `ty`.  Without a `MatrixStride` the
    /// columns are packed.
    pub fn matrix_layout(&self, ty: Id, member: u32) -> Option<MatrixLayout> {
        Some(MatrixLayout {
            stride: self.matrix_stride(ty, member)?,
            row_major: self.row_major.contains(&(ty, member)),
        })
    }

    /// Whether `ty` is an `OpTypeImage` (or sampled image) with `Dim Buffer`.
    pub fn is_texel_buffer(&self, ty: Id) -> bool {
        match self.ty(ty) {
            Some(Type::Image { dim }) => *dim == op::DIM_BUFFER,
            Some(Type::SampledImage { image }) => self.is_texel_buffer(*image),
            _ => false,
        }
    }

    /// Number of bytes reachable through a value of type `ty` under the explicit layout.
    ///
    /// Aggregates count every byte any member could touch, from the first byte of the first member
    /// to the last byte of the last.  Unsized types have no footprint.  Sizes saturate at
    /// `u64::MAX`, which no bound check passes.
    pub fn size_of(&self, ty: Id) -> Option<u64> {
        self.footprint(ty, None)
    }

    /// [`size_of`](Self::size_of) for a value whose matrices are laid out as `matrix`.
    pub fn footprint(&self, ty: Id, matrix: Option<MatrixLayout>) -> Option<u64> {
        match self.ty(ty)? {
            Type::Bool => Some(4),
            Type::Int { width, .. } | Type::Float { width } => Some(*width as u64 / 8),
            Type::Vector { component, count } => {
                Some(self.size_of(*component)?.saturating_mul(*count as u64))
            }
            Type::Matrix { column, count } => {
                let count = *count as u64;
                if count == 0 {
                    return Some(0);
                }
                match matrix {
                    Some(MatrixLayout {
                        stride,
                        row_major: true,
                    }) => {
                        let Some(Type::Vector {
                            component,
                            count: rows,
                        }) = self.ty(*column)
                        else {
                            return None;
                        };
                        let rows = (*rows as u64).max(1);
                        let row = self.size_of(*component)?.saturating_mul(count);
                        Some(strided(rows, stride as u64, row))
                    }
                    Some(MatrixLayout { stride, .. }) => {
                        Some(strided(count, stride as u64, self.size_of(*column)?))
                    }
                    None => Some(self.size_of(*column)?.saturating_mul(count)),
                }
            }
            Type::Array { element, length } => {
                let length = self.constant(*length)?;
                let element_size = self.footprint(*element, matrix)?;
                let stride = self
                    .array_stride(ty)
                    .map(u64::from)
                    .unwrap_or(element_size);
                match length {
                    0 => Some(0),
                    n => Some(strided(n, stride, element_size)),
                }
            }
            Type::Struct { members } => {
                let mut end = 0u64;
                let mut cursor = 0u64;
                for (i, member) in members.iter().enumerate() {
                    let i = i as u32;
                    let offset = self
                        .member_offset(ty, i)
                        .map(u64::from)
                        .unwrap_or(cursor);
                    let size = self.footprint(*member, self.matrix_layout(ty, i))?;
                    cursor = offset.saturating_add(size);
                    end = end.max(cursor);
                }
                Some(end)
            }
            Type::Pointer { storage, .. } if *storage == op::storage::PHYSICAL_STORAGE_BUFFER => {
                Some(8)
            }
            _ => None,
        }
    }

    /// Byte distance between consecutive elements when indexing into `ty`.  Matrices are assumed
    /// packed and column major; chains through a struct member use
    /// [`matrix_layout`](Self::matrix_layout) instead.
    pub fn element_stride(&self, ty: Id) -> Option<u64> {
        match self.ty(ty)? {
            Type::Array { element, .. } | Type::RuntimeArray { element } => self
                .array_stride(ty)
                .map(u64::from)
                .or_else(|| self.size_of(*element)),
            Type::Vector { component, .. } => self.size_of(*component),
            Type::Matrix { column, .. } => self.size_of(*column),
            _ => None,
        }
    }

    pub fn find_int(&self, width: u32, signed: bool) -> Option<Id> {
        self.find_type(|t| *t == Type::Int { width, signed })
    }

    pub fn find_type(&self, predicate: impl Fn(&Type) -> bool) -> Option<Id> {
        // Smallest id wins so repeated runs are deterministic.
        self.types
            .iter()
            .filter(|(_, t)| predicate(t))
            .map(|(id, _)| *id)
            .min()
    }
}

/// Bytes spanned by `count` items of `size` bytes placed `stride` apart.
pub(crate) fn strided(count: u64, stride: u64, size: u64) -> u64 {
    count
        .saturating_sub(1)
        .saturating_mul(stride)
        .saturating_add(size)
}
