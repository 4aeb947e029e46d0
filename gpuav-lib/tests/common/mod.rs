// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![allow(dead_code)]

use std::sync::{Arc, Once};

use ash::vk::{self, Handle};
use gpuav_lib::device::DeviceChecks;
use gpuav_lib::prelude::*;
use gpuav_lib::registry::SubmissionIndex;
use gpuav_spirv::module::Header;
use gpuav_spirv::op::{self, decoration, storage};
use gpuav_spirv::{Instruction, Module};

pub const SET_LAYOUT: u64 = 0x10;
pub const PIPELINE_LAYOUT: u64 = 0x20;
pub const PIPELINE: u64 = 0x30;
pub const SET: u64 = 0x40;
pub const COMMAND_BUFFER: u64 = 0x50;

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .try_init();
    });
}

/// `buffer Block { uint data[]; } blocks[N];` at set 0 binding 0, loading `blocks[2].data[3]`.
pub fn shader(array_len: u32) -> Vec<u32> {
    let inst = |opcode: u16, operands: &[u32]| Instruction::new(opcode, operands.to_vec());
    let instructions = vec![
        inst(op::CAPABILITY, &[1]),
        inst(op::MEMORY_MODEL, &[0, 1]),
        inst(op::DECORATE, &[12, decoration::DESCRIPTOR_SET, 0]),
        inst(op::DECORATE, &[12, decoration::BINDING, 0]),
        inst(op::DECORATE, &[6, decoration::BLOCK]),
        inst(op::MEMBER_DECORATE, &[6, 0, decoration::OFFSET, 0]),
        inst(op::DECORATE, &[5, decoration::ARRAY_STRIDE, 4]),
        inst(op::TYPE_VOID, &[1]),
        inst(op::TYPE_FUNCTION, &[2, 1]),
        inst(op::TYPE_INT, &[3, 32, 0]),
        inst(op::TYPE_RUNTIME_ARRAY, &[5, 3]),
        inst(op::TYPE_STRUCT, &[6, 5]),
        inst(op::CONSTANT, &[3, 7, array_len]),
        inst(op::TYPE_ARRAY, &[8, 6, 7]),
        inst(op::TYPE_POINTER, &[9, storage::STORAGE_BUFFER, 8]),
        inst(op::TYPE_POINTER, &[10, storage::STORAGE_BUFFER, 3]),
        inst(op::CONSTANT, &[3, 11, 0]),
        inst(op::VARIABLE, &[9, 12, storage::STORAGE_BUFFER]),
        inst(op::CONSTANT, &[3, 13, 2]),
        inst(op::CONSTANT, &[3, 14, 3]),
        inst(op::FUNCTION, &[1, 20, 0, 2]),
        inst(op::LABEL, &[21]),
        inst(op::ACCESS_CHAIN, &[10, 24, 12, 13, 11, 14]),
        inst(op::LOAD, &[3, 25, 24]),
        inst(op::RETURN, &[]),
        inst(op::FUNCTION_END, &[]),
    ];
    Module {
        header: Header {
            version: 0x0001_0500,
            generator: 0,
            bound: 30,
            schema: 0,
        },
        instructions,
    }
    .assemble()
    .unwrap()
}

/// A context with one storage-buffer array binding, a pipeline reading it and one allocated set.
pub struct Fixture {
    pub context: ValidationContext,
    pub sink: Arc<CollectingSink>,
    /// Id of the check site guarding the shader's load.
    pub site: u32,
}

impl Fixture {
    pub fn new(array_len: u32) -> Self {
        Self::with(Settings::default(), array_len, vk::DescriptorBindingFlags::empty(), None)
    }

    pub fn with(
        settings: Settings,
        array_len: u32,
        flags: vk::DescriptorBindingFlags,
        variable_count: Option<u32>,
    ) -> Self {
        init_tracing();
        let capabilities = DeviceCapabilities {
            null_descriptor: true,
            buffer_device_address: true,
            runtime_descriptor_array: true,
            partially_bound: true,
            variable_descriptor_count: true,
        };
        let sink = Arc::new(CollectingSink::new());
        let context = ValidationContext::with_sink(settings, capabilities, sink.clone());

        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(array_len)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)];
        let set_layout = vk::DescriptorSetLayout::from_raw(SET_LAYOUT);
        context
            .create_descriptor_set_layout(set_layout, &bindings, &[flags])
            .unwrap();
        let pipeline_layout = vk::PipelineLayout::from_raw(PIPELINE_LAYOUT);
        context
            .create_pipeline_layout(pipeline_layout, &[set_layout])
            .unwrap();
        let instrumented = context
            .create_compute_pipeline(pipeline(), pipeline_layout, &shader(array_len))
            .unwrap();
        assert_eq!(instrumented.sites.len(), 1);
        context
            .allocate_descriptor_set(set(), set_layout, variable_count)
            .unwrap();

        Self {
            context,
            sink,
            site: instrumented.sites[0].id,
        }
    }

    pub fn buffer(&self, raw: u64, size: u64, device_address: Option<u64>) -> vk::Buffer {
        let buffer = vk::Buffer::from_raw(raw);
        self.context
            .create_buffer(
                buffer,
                BufferInfo {
                    size,
                    device_address,
                    memory: None,
                },
            )
            .unwrap();
        buffer
    }

    /// Write `buffers` to binding 0 starting at `first`, each bound whole.
    pub fn write(&self, first: u32, buffers: &[vk::Buffer]) {
        self.context
            .update_descriptor_sets(&[WriteInfo {
                dst_set: set(),
                binding: 0,
                first_array_element: first,
                descriptors: buffers
                    .iter()
                    .map(|&buffer| DescriptorInfo::Buffer {
                        buffer,
                        offset: 0,
                        range: vk::WHOLE_SIZE,
                    })
                    .collect(),
            }])
            .unwrap();
    }

    /// Record one dispatch with the set bound, submit it and hand back its checks.
    pub fn submit(&self) -> (SubmissionIndex, DeviceChecks) {
        let cb = command_buffer();
        self.context.begin_command_buffer(cb).unwrap();
        self.context.cmd_bind_pipeline(cb, pipeline()).unwrap();
        self.context
            .cmd_bind_descriptor_sets(cb, 0, &[set()])
            .unwrap();
        let dispatch = self.context.cmd_dispatch(cb).unwrap();
        let index = self.context.queue_submit(&[cb]).unwrap();
        let checks = self.context.device_checks(cb, dispatch).unwrap();
        (index, checks)
    }

    /// Complete the submission.  The sink must have seen exactly what was returned.
    pub fn complete(&self, index: SubmissionIndex) -> Vec<DiagnosticEvent> {
        let events = self.context.submission_complete(index).unwrap();
        assert_eq!(self.sink.take(), events);
        events
    }
}

pub fn pipeline() -> vk::Pipeline {
    vk::Pipeline::from_raw(PIPELINE)
}

pub fn set() -> vk::DescriptorSet {
    vk::DescriptorSet::from_raw(SET)
}

pub fn command_buffer() -> vk::CommandBuffer {
    vk::CommandBuffer::from_raw(COMMAND_BUFFER)
}
