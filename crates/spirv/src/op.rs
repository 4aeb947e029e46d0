// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The slice of the SPIR-V grammar the instrumentor reads or writes.

pub const MAGIC: u32 = 0x0723_0203;

pub const NOP: u16 = 0;
pub const SOURCE_CONTINUED: u16 = 2;
pub const SOURCE: u16 = 3;
pub const SOURCE_EXTENSION: u16 = 4;
pub const NAME: u16 = 5;
pub const MEMBER_NAME: u16 = 6;
pub const STRING: u16 = 7;
pub const LINE: u16 = 8;
pub const EXTENSION: u16 = 10;
pub const EXT_INST_IMPORT: u16 = 11;
pub const MEMORY_MODEL: u16 = 14;
pub const ENTRY_POINT: u16 = 15;
pub const EXECUTION_MODE: u16 = 16;
pub const CAPABILITY: u16 = 17;
pub const TYPE_VOID: u16 = 19;
pub const TYPE_BOOL: u16 = 20;
pub const TYPE_INT: u16 = 21;
pub const TYPE_FLOAT: u16 = 22;
pub const TYPE_VECTOR: u16 = 23;
pub const TYPE_MATRIX: u16 = 24;
pub const TYPE_IMAGE: u16 = 25;
pub const TYPE_SAMPLER: u16 = 26;
pub const TYPE_SAMPLED_IMAGE: u16 = 27;
pub const TYPE_ARRAY: u16 = 28;
pub const TYPE_RUNTIME_ARRAY: u16 = 29;
pub const TYPE_STRUCT: u16 = 30;
pub const TYPE_POINTER: u16 = 32;
pub const TYPE_FUNCTION: u16 = 33;
pub const TYPE_FORWARD_POINTER: u16 = 39;
pub const CONSTANT: u16 = 43;
pub const CONSTANT_NULL: u16 = 46;
pub const SPEC_CONSTANT: u16 = 50;
pub const FUNCTION: u16 = 54;
pub const FUNCTION_PARAMETER: u16 = 55;
pub const FUNCTION_END: u16 = 56;
pub const FUNCTION_CALL: u16 = 57;
pub const VARIABLE: u16 = 59;
pub const IMAGE_TEXEL_POINTER: u16 = 60;
pub const LOAD: u16 = 61;
pub const STORE: u16 = 62;
pub const COPY_MEMORY: u16 = 63;
pub const COPY_MEMORY_SIZED: u16 = 64;
pub const ACCESS_CHAIN: u16 = 65;
pub const IN_BOUNDS_ACCESS_CHAIN: u16 = 66;
pub const PTR_ACCESS_CHAIN: u16 = 67;
pub const IN_BOUNDS_PTR_ACCESS_CHAIN: u16 = 70;
pub const DECORATE: u16 = 71;
pub const MEMBER_DECORATE: u16 = 72;
pub const DECORATION_GROUP: u16 = 73;
pub const GROUP_DECORATE: u16 = 74;
pub const GROUP_MEMBER_DECORATE: u16 = 75;
pub const SAMPLED_IMAGE: u16 = 86;
pub const IMAGE_SAMPLE_IMPLICIT_LOD: u16 = 87;
pub const IMAGE_SAMPLE_PROJ_DREF_EXPLICIT_LOD: u16 = 94;
pub const IMAGE_FETCH: u16 = 95;
pub const IMAGE_GATHER: u16 = 96;
pub const IMAGE_DREF_GATHER: u16 = 97;
pub const IMAGE_READ: u16 = 98;
pub const IMAGE_WRITE: u16 = 99;
pub const IMAGE: u16 = 100;
pub const U_CONVERT: u16 = 113;
pub const S_CONVERT: u16 = 114;
pub const CONVERT_PTR_TO_U: u16 = 117;
pub const CONVERT_U_TO_PTR: u16 = 120;
pub const BITCAST: u16 = 124;
pub const I_ADD: u16 = 128;
pub const I_MUL: u16 = 132;
pub const LOGICAL_AND: u16 = 167;
pub const SELECT: u16 = 169;
pub const U_GREATER_THAN: u16 = 172;
pub const U_LESS_THAN: u16 = 176;
pub const CONTROL_BARRIER: u16 = 224;
pub const MEMORY_BARRIER: u16 = 225;
pub const ATOMIC_LOAD: u16 = 227;
pub const ATOMIC_STORE: u16 = 228;
pub const ATOMIC_XOR: u16 = 242;
pub const PHI: u16 = 245;
pub const LOOP_MERGE: u16 = 246;
pub const SELECTION_MERGE: u16 = 247;
pub const LABEL: u16 = 248;
pub const BRANCH: u16 = 249;
pub const BRANCH_CONDITIONAL: u16 = 250;
pub const SWITCH: u16 = 251;
pub const KILL: u16 = 252;
pub const RETURN: u16 = 253;
pub const RETURN_VALUE: u16 = 254;
pub const UNREACHABLE: u16 = 255;
pub const NO_LINE: u16 = 317;
pub const ATOMIC_FLAG_TEST_AND_SET: u16 = 318;
pub const ATOMIC_FLAG_CLEAR: u16 = 319;
pub const MODULE_PROCESSED: u16 = 330;
pub const EXECUTION_MODE_ID: u16 = 331;
pub const DECORATE_ID: u16 = 332;
pub const TERMINATE_INVOCATION: u16 = 4416;
pub const ATOMIC_F_MIN_EXT: u16 = 5614;
pub const ATOMIC_F_MAX_EXT: u16 = 5615;
pub const DECORATE_STRING: u16 = 5632;
pub const MEMBER_DECORATE_STRING: u16 = 5633;
pub const ATOMIC_F_ADD_EXT: u16 = 6035;

pub mod decoration {
    pub const BLOCK: u32 = 2;
    pub const BUFFER_BLOCK: u32 = 3;
    pub const ROW_MAJOR: u32 = 4;
    pub const ARRAY_STRIDE: u32 = 6;
    pub const MATRIX_STRIDE: u32 = 7;
    pub const BINDING: u32 = 33;
    pub const DESCRIPTOR_SET: u32 = 34;
    pub const OFFSET: u32 = 35;
    pub const LINKAGE_ATTRIBUTES: u32 = 41;
}

pub mod storage {
    pub const UNIFORM_CONSTANT: u32 = 0;
    pub const UNIFORM: u32 = 2;
    pub const STORAGE_BUFFER: u32 = 12;
    pub const PHYSICAL_STORAGE_BUFFER: u32 = 5349;
}

pub mod capability {
    pub const LINKAGE: u32 = 5;
    pub const INT64: u32 = 11;
}

pub const DIM_BUFFER: u32 = 5;
pub const LINKAGE_IMPORT: u32 = 1;
pub const MEMORY_ACCESS_ALIGNED: u32 = 0x2;

/// Opcodes whose instructions define neither a type nor a result.
fn defines_nothing(opcode: u16) -> bool {
    matches!(
        opcode,
        NOP | SOURCE_CONTINUED
            | SOURCE
            | SOURCE_EXTENSION
            | NAME
            | MEMBER_NAME
            | LINE
            | NO_LINE
            | EXTENSION
            | MEMORY_MODEL
            | ENTRY_POINT
            | EXECUTION_MODE
            | EXECUTION_MODE_ID
            | CAPABILITY
            | TYPE_FORWARD_POINTER
            | FUNCTION_END
            | STORE
            | COPY_MEMORY
            | COPY_MEMORY_SIZED
            | DECORATE
            | MEMBER_DECORATE
            | DECORATE_ID
            | DECORATE_STRING
            | MEMBER_DECORATE_STRING
            | GROUP_DECORATE
            | GROUP_MEMBER_DECORATE
            | IMAGE_WRITE
            | CONTROL_BARRIER
            | MEMORY_BARRIER
            | ATOMIC_STORE
            | ATOMIC_FLAG_CLEAR
            | LOOP_MERGE
            | SELECTION_MERGE
            | BRANCH
            | BRANCH_CONDITIONAL
            | SWITCH
            | KILL
            | RETURN
            | RETURN_VALUE
            | UNREACHABLE
            | TERMINATE_INVOCATION
            | MODULE_PROCESSED
    )
}

/// Opcodes that define a result id but carry no result type.
fn defines_untyped_result(opcode: u16) -> bool {
    matches!(
        opcode,
        STRING | EXT_INST_IMPORT | LABEL | DECORATION_GROUP
    ) || (TYPE_VOID..=TYPE_FORWARD_POINTER).contains(&opcode)
        || matches!(opcode, 4472 | 5341)
}

/// Whether words 0 and 1 of the operands are result type and result id.
pub fn has_result_type(opcode: u16) -> bool {
    !defines_nothing(opcode) && !defines_untyped_result(opcode)
}

pub fn has_result(opcode: u16) -> bool {
    !defines_nothing(opcode)
}

pub fn is_block_terminator(opcode: u16) -> bool {
    matches!(
        opcode,
        BRANCH
            | BRANCH_CONDITIONAL
            | SWITCH
            | KILL
            | RETURN
            | RETURN_VALUE
            | UNREACHABLE
            | TERMINATE_INVOCATION
    )
}

pub fn is_image_sample(opcode: u16) -> bool {
    (IMAGE_SAMPLE_IMPLICIT_LOD..=IMAGE_SAMPLE_PROJ_DREF_EXPLICIT_LOD).contains(&opcode)
        || matches!(opcode, IMAGE_GATHER | IMAGE_DREF_GATHER)
}

/// Operand index of the pointer for atomic instructions, `None` for everything else.
pub fn atomic_pointer_operand(opcode: u16) -> Option<usize> {
    match opcode {
        ATOMIC_STORE | ATOMIC_FLAG_CLEAR => Some(0),
        ATOMIC_LOAD..=ATOMIC_XOR
        | ATOMIC_FLAG_TEST_AND_SET
        | ATOMIC_F_MIN_EXT
        | ATOMIC_F_MAX_EXT
        | ATOMIC_F_ADD_EXT => Some(2),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_result_layout() {
        assert!(has_result_type(LOAD));
        assert!(!has_result(STORE));
        assert!(has_result(TYPE_INT) && !has_result_type(TYPE_INT));
        assert!(has_result(LABEL) && !has_result_type(LABEL));
        assert!(!has_result(TYPE_FORWARD_POINTER));
        assert_eq!(atomic_pointer_operand(ATOMIC_STORE), Some(0));
        assert_eq!(atomic_pointer_operand(234), Some(2));
        assert_eq!(atomic_pointer_operand(LOAD), None);
    }
}
