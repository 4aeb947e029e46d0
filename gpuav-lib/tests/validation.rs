// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod common;

use ash::vk::{self, Handle};
use gpuav_feedback::{ChannelState, ErrorCode, decode_bytes};
use gpuav_lib::context::CopyInfo;
use gpuav_lib::coordinator::CommandBufferState;
use gpuav_lib::prelude::*;

use common::*;

#[test]
fn test_buffer_bound_short_of_access() {
    let fixture = Fixture::new(1);
    let buffer = fixture.buffer(1, 64, None);
    fixture
        .context
        .update_descriptor_sets(&[WriteInfo {
            dst_set: set(),
            binding: 0,
            first_array_element: 0,
            descriptors: vec![DescriptorInfo::Buffer {
                buffer,
                offset: 0,
                range: 16,
            }],
        }])
        .unwrap();

    let (index, checks) = fixture.submit();
    assert!(checks.check_descriptor(0, fixture.site, 0, 0, 0, 12, 4));
    assert!(!checks.check_descriptor(1, fixture.site, 0, 0, 0, 16, 4));

    let feedback = decode_bytes(&checks.channel.to_bytes()).unwrap();
    assert_eq!(feedback.records.len(), 1);
    let record = &feedback.records[0];
    assert_eq!(record.check_site_id, fixture.site);
    assert_eq!(record.code(), Ok(ErrorCode::BufferOutOfBounds));
    assert_eq!(record.invocation_id, 1);
    assert_eq!(record.observed_index, 0);
    assert_eq!(record.bound_length, 16);
    assert_eq!(record.accessed_offset, 16);

    let events = fixture.complete(index);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].category, Category::OutOfBounds);
    assert_eq!(events[0].check_site_id, Some(fixture.site));
    assert_eq!(events[0].object_handles[0], ObjectHandle::from(buffer));
    assert_eq!(events[0].object_handles[1], ObjectHandle::from(pipeline()));
    assert!(events[0].message.contains("the 16 bytes bound to descriptor 0.0[0]"));
}

#[test]
fn test_uninitialized_slot_reported_once() {
    let fixture = Fixture::new(6);
    let buffers: Vec<_> = (1..=5).map(|raw| fixture.buffer(raw, 256, None)).collect();
    fixture.write(0, &buffers);

    let (index, checks) = fixture.submit();
    for invocation in 0..5 {
        assert!(checks.check_descriptor(invocation, fixture.site, 0, 0, invocation as u32, 12, 4));
    }
    assert!(!checks.check_descriptor(10, fixture.site, 0, 0, 5, 12, 4));
    assert!(!checks.check_descriptor(11, fixture.site, 0, 0, 5, 12, 4));

    let events = fixture.complete(index);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].category, Category::UninitializedDescriptor);
    assert_eq!(events[0].check_site_id, Some(fixture.site));
    assert_eq!(events[0].occurrences, 2);
    assert!(events[0].message.contains("descriptor 0.0[5] was never written"));
    assert!(events[0].to_string().ends_with("(2 times)"));
}

#[test]
fn test_variable_count_statuses() {
    let flags = vk::DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT
        | vk::DescriptorBindingFlags::PARTIALLY_BOUND;
    let fixture = Fixture::with(Settings::default(), 16, flags, Some(4));
    let buffer = fixture.buffer(1, 64, None);
    fixture.write(0, &[buffer]);

    let (index, checks) = fixture.submit();
    assert!(checks.check_descriptor(0, fixture.site, 0, 0, 0, 0, 4));
    assert!(!checks.check_descriptor(1, fixture.site, 0, 0, 2, 0, 4));
    assert!(!checks.check_descriptor(2, fixture.site, 0, 0, 6, 0, 4));
    assert!(!checks.check_descriptor(3, fixture.site, 0, 0, 16, 0, 4));

    let codes: Vec<_> = decode_bytes(&checks.channel.to_bytes())
        .unwrap()
        .records
        .iter()
        .map(|r| (r.code().unwrap(), r.observed_index, r.bound_length))
        .collect();
    assert_eq!(
        codes,
        vec![
            (ErrorCode::DescriptorUninitialized, 2, 0),
            (ErrorCode::DescriptorBeyondCount, 6, 4),
            (ErrorCode::DescriptorIndexOutOfBounds, 16, 16),
        ]
    );

    let events = fixture.complete(index);
    let categories: Vec<_> = events.iter().map(|e| (e.category, e.occurrences)).collect();
    assert_eq!(
        categories,
        vec![
            (Category::UninitializedDescriptor, 2),
            (Category::OutOfBounds, 1),
        ]
    );
}

#[test]
fn test_concurrent_overflow() {
    let settings = Settings {
        feedback_capacity: 8,
        ..Settings::default()
    };
    let fixture = Fixture::with(settings, 4, vk::DescriptorBindingFlags::empty(), None);
    let (index, checks) = fixture.submit();

    std::thread::scope(|s| {
        for invocation in 0..20 {
            let checks = &checks;
            let site = fixture.site;
            s.spawn(move || {
                assert!(!checks.check_descriptor(invocation, site, 0, 0, 1, 0, 4));
            });
        }
    });

    let feedback = decode_bytes(&checks.channel.to_bytes()).unwrap();
    assert_eq!(feedback.records.len(), 8);
    assert_eq!(feedback.reserved, 20);
    assert_eq!(feedback.dropped(), 12);
    let mut invocations: Vec<_> = feedback.records.iter().map(|r| r.invocation_id).collect();
    invocations.sort();
    invocations.dedup();
    assert_eq!(invocations.len(), 8);

    let events = fixture.complete(index);
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].category, Category::UninitializedDescriptor);
    assert_eq!(events[0].occurrences, 8);
    assert_eq!(events[1].category, Category::Truncated);
    assert_eq!(events[1].occurrences, 12);
    assert_eq!(events[1].check_site_id, None);
}

#[test]
fn test_destroyed_while_in_flight() {
    let fixture = Fixture::new(1);
    let buffer = fixture.buffer(1, 64, Some(0x1_0000));
    fixture.write(0, &[buffer]);

    let (index, checks) = fixture.submit();
    assert!(checks.check_address(0, 99, 0x1_0010, 4, 4));
    fixture.context.destroy_resource(buffer).unwrap();

    // In bounds, so anything but destruction would pass.
    assert!(!checks.check_descriptor(1, fixture.site, 0, 0, 0, 0, 4));
    assert!(!checks.check_address(2, 99, 0x1_0010, 4, 4));

    let events = fixture.complete(index);
    let categories: Vec<_> = events.iter().map(|e| e.category).collect();
    assert_eq!(
        categories,
        vec![Category::DestroyedResource, Category::DestroyedResource]
    );
    assert!(events[0].message.contains("VkBuffer 0x1 which was destroyed"));
    assert_eq!(events[1].check_site_id, Some(99));
    assert!(events[1].message.contains("hits VkBuffer 0x1"));
}

#[test]
fn test_address_registry_through_checks() {
    let fixture = Fixture::new(1);
    let a = fixture.buffer(1, 0x100, Some(0x1000));
    let b = fixture.buffer(2, 0x100, Some(0x2000));
    assert!(matches!(
        fixture.context.create_buffer(
            vk::Buffer::from_raw(3),
            BufferInfo {
                size: 0x100,
                device_address: Some(0x1080),
                memory: None,
            },
        ),
        Err(GpuavError::Registry(_))
    ));
    fixture.context.destroy_resource(b).unwrap();

    let (index, checks) = fixture.submit();
    assert!(checks.check_address(0, 1, 0x1000, 8, 8));
    assert!(checks.check_address(1, 1, 0x10f8, 8, 8));
    assert!(!checks.check_address(2, 2, 0x10fc, 8, 4));
    assert!(!checks.check_address(3, 3, 0x2000, 4, 4));
    assert!(!checks.check_address(4, 4, 0x3000, 4, 4));
    assert!(!checks.check_address(5, 5, 0x1002, 4, 4));
    assert!(!checks.check_address(6, 6, u64::MAX - 1, 4, 1));
    // Below a failed root, silently.
    assert!(!checks.check_address(7, 7, checks.sentinel + 8, 4, 4));

    let events = fixture.complete(index);
    let categories: Vec<_> = events.iter().map(|e| e.category).collect();
    assert_eq!(
        categories,
        vec![
            Category::OutOfBounds,
            Category::DestroyedResource,
            Category::OutOfBounds,
            Category::AlignmentViolation,
            Category::OverflowInAddressArithmetic,
        ]
    );
    assert_eq!(events[0].object_handles[0], ObjectHandle::from(a));
    assert!(events[2].message.contains("does not hit any buffer"));

    // Destroyed before the submission, so collected once it completed.
    let cb = command_buffer();
    fixture.context.begin_command_buffer(cb).unwrap();
    fixture.context.cmd_bind_pipeline(cb, pipeline()).unwrap();
    fixture.context.cmd_bind_descriptor_sets(cb, 0, &[set()]).unwrap();
    fixture.context.cmd_dispatch(cb).unwrap();
    let index = fixture.context.queue_submit(&[cb]).unwrap();
    let checks = fixture.context.device_checks(cb, 0).unwrap();
    assert!(!checks.check_address(0, 3, 0x2000, 4, 4));
    let events = fixture.complete(index);
    assert!(events[0].message.contains("does not hit any buffer"));
}

#[test]
fn test_channel_reset_after_completion() {
    let fixture = Fixture::new(1);
    let (index, checks) = fixture.submit();
    assert_eq!(
        fixture.context.command_buffer_state(command_buffer()).unwrap(),
        Some(CommandBufferState::Pending)
    );
    assert!(!checks.check_descriptor(0, fixture.site, 0, 0, 0, 0, 4));
    assert_eq!(checks.channel.reserved(), 1);

    assert_eq!(fixture.complete(index).len(), 1);
    assert_eq!(checks.channel.state(), ChannelState::Ready);
    assert_eq!(checks.channel.reserved(), 0);
    checks.channel.reset();
    assert_eq!(checks.channel.reserved(), 0);
    assert!(checks.channel.decode().records.is_empty());
    assert_eq!(
        fixture.context.command_buffer_state(command_buffer()).unwrap(),
        Some(CommandBufferState::Idle)
    );
}

#[test]
fn test_texel_buffer_bounds() {
    init_tracing();
    let context = ValidationContext::new(Settings::default(), DeviceCapabilities::default());
    let layout = vk::DescriptorSetLayout::from_raw(1);
    let bindings = [vk::DescriptorSetLayoutBinding::default()
        .binding(3)
        .descriptor_type(vk::DescriptorType::STORAGE_TEXEL_BUFFER)
        .descriptor_count(1)];
    context
        .create_descriptor_set_layout(layout, &bindings, &[])
        .unwrap();
    let pipeline_layout = vk::PipelineLayout::from_raw(2);
    context
        .create_pipeline_layout(pipeline_layout, &[layout])
        .unwrap();

    let buffer = vk::Buffer::from_raw(3);
    context
        .create_buffer(
            buffer,
            BufferInfo {
                size: 256,
                ..BufferInfo::default()
            },
        )
        .unwrap();
    let view = vk::BufferView::from_raw(4);
    context
        .create_buffer_view(view, buffer, 64, vk::WHOLE_SIZE, 16)
        .unwrap();

    let set = vk::DescriptorSet::from_raw(5);
    context.allocate_descriptor_set(set, layout, None).unwrap();
    assert!(matches!(
        context.update_descriptor_sets(&[WriteInfo {
            dst_set: set,
            binding: 3,
            first_array_element: 0,
            descriptors: vec![DescriptorInfo::Null],
        }]),
        Err(GpuavError::Descriptor(_))
    ));
    context
        .update_descriptor_sets(&[WriteInfo {
            dst_set: set,
            binding: 3,
            first_array_element: 0,
            descriptors: vec![DescriptorInfo::TexelBuffer(view)],
        }])
        .unwrap();

    // A pipeline whose shader touches nothing still dispatches.
    let pipeline = vk::Pipeline::from_raw(6);
    let words = shader(1);
    assert!(
        context
            .create_compute_pipeline(pipeline, pipeline_layout, &words)
            .unwrap()
            .sites
            .is_empty()
    );

    let cb = vk::CommandBuffer::from_raw(7);
    context.begin_command_buffer(cb).unwrap();
    context.cmd_bind_pipeline(cb, pipeline).unwrap();
    context.cmd_bind_descriptor_sets(cb, 0, &[set]).unwrap();
    context.cmd_dispatch(cb).unwrap();
    let index = context.queue_submit(&[cb]).unwrap();
    assert!(matches!(
        context.free_descriptor_set(set),
        Err(GpuavError::Descriptor(_))
    ));

    let checks = context.device_checks(cb, 0).unwrap();
    assert!(checks.check_texel(0, 1, 0, 3, 0, 11));
    assert!(!checks.check_texel(1, 1, 0, 3, 0, 12));
    let events = context.submission_complete(index).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].category, Category::OutOfBounds);
    assert!(events[0].message.contains("12 texels"));

    context.free_descriptor_set(set).unwrap();
    context.free_command_buffer(cb).unwrap();
    assert!(context.command_buffer_state(cb).unwrap().is_none());
}

#[test]
fn test_unknown_objects() {
    let fixture = Fixture::new(1);
    let cb = vk::CommandBuffer::from_raw(0x99);
    fixture.context.begin_command_buffer(cb).unwrap();
    assert!(matches!(
        fixture
            .context
            .cmd_bind_pipeline(cb, vk::Pipeline::from_raw(0x98)),
        Err(GpuavError::UnknownObject(_))
    ));
    assert!(matches!(
        fixture
            .context
            .cmd_bind_descriptor_sets(cb, 0, &[vk::DescriptorSet::from_raw(0x97)]),
        Err(GpuavError::UnknownObject(_))
    ));
    assert!(matches!(
        fixture.context.cmd_dispatch(cb),
        Err(GpuavError::Coordinator(_))
    ));
    assert!(matches!(
        fixture.context.destroy_resource(vk::Image::from_raw(0x96)),
        Err(GpuavError::UnknownObject(_))
    ));
    let buffer = fixture.buffer(1, 16, None);
    assert!(matches!(
        fixture.context.create_buffer(buffer, BufferInfo::default()),
        Err(GpuavError::DuplicateObject(_))
    ));
}

#[test]
fn test_copied_image_descriptor_destroyed() {
    init_tracing();
    let context = ValidationContext::new(Settings::default(), DeviceCapabilities::default());
    let layout = vk::DescriptorSetLayout::from_raw(1);
    let bindings = [
        vk::DescriptorSetLayoutBinding::default()
            .binding(1)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .descriptor_count(2),
        vk::DescriptorSetLayoutBinding::default()
            .binding(2)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .descriptor_count(1),
    ];
    context
        .create_descriptor_set_layout(layout, &bindings, &[])
        .unwrap();
    let pipeline_layout = vk::PipelineLayout::from_raw(2);
    context
        .create_pipeline_layout(pipeline_layout, &[layout])
        .unwrap();
    let pipeline = vk::Pipeline::from_raw(3);
    context
        .create_compute_pipeline(pipeline, pipeline_layout, &shader(1))
        .unwrap();

    let a = vk::DescriptorSet::from_raw(4);
    let b = vk::DescriptorSet::from_raw(5);
    context.allocate_descriptor_set(a, layout, None).unwrap();
    context.allocate_descriptor_set(b, layout, None).unwrap();
    assert_ne!(context.set_id(a).unwrap(), context.set_id(b).unwrap());

    let image = vk::Image::from_raw(6);
    let view = vk::ImageView::from_raw(7);
    let sampler = vk::Sampler::from_raw(8);
    context.create_image(image).unwrap();
    context.create_image_view(view, image).unwrap();
    context.create_sampler(sampler).unwrap();
    context
        .update_descriptor_sets(&[
            WriteInfo {
                dst_set: a,
                binding: 1,
                first_array_element: 0,
                descriptors: vec![DescriptorInfo::Image(view)],
            },
            WriteInfo {
                dst_set: a,
                binding: 2,
                first_array_element: 0,
                descriptors: vec![DescriptorInfo::Sampler(sampler)],
            },
        ])
        .unwrap();
    context
        .copy_descriptor_sets(&[CopyInfo {
            src_set: a,
            src_binding: 1,
            src_array_element: 0,
            dst_set: b,
            dst_binding: 1,
            dst_array_element: 1,
            count: 1,
        }])
        .unwrap();
    context.destroy_resource(image).unwrap();

    let cb = vk::CommandBuffer::from_raw(9);
    context.begin_command_buffer(cb).unwrap();
    context.cmd_bind_pipeline(cb, pipeline).unwrap();
    context.cmd_bind_descriptor_sets(cb, 0, &[b, a]).unwrap();
    context.cmd_dispatch(cb).unwrap();
    let index = context.queue_submit(&[cb]).unwrap();

    let checks = context.device_checks(cb, 0).unwrap();
    assert!(!checks.check_descriptor(0, 1, 0, 1, 1, 0, 0));
    assert!(!checks.check_descriptor(1, 2, 0, 1, 0, 0, 0));
    assert!(checks.check_descriptor(2, 3, 1, 2, 0, 0, 0));
    assert!(!checks.check_descriptor(3, 4, 1, 1, 0, 0, 0));

    let categories: Vec<_> = context
        .submission_complete(index)
        .unwrap()
        .iter()
        .map(|e| e.category)
        .collect();
    assert_eq!(
        categories,
        vec![
            Category::DestroyedResource,
            Category::UninitializedDescriptor,
            Category::DestroyedResource,
        ]
    );
}

#[test]
fn test_freed_set_makes_dispatch_unverifiable() {
    let fixture = Fixture::new(1);
    let buffer = fixture.buffer(1, 64, None);
    fixture.write(0, &[buffer]);
    let spare = vk::DescriptorSet::from_raw(0x41);
    let spare_id = fixture
        .context
        .allocate_descriptor_set(spare, vk::DescriptorSetLayout::from_raw(SET_LAYOUT), None)
        .unwrap();

    let cb = command_buffer();
    fixture.context.begin_command_buffer(cb).unwrap();
    fixture.context.cmd_bind_pipeline(cb, pipeline()).unwrap();
    fixture
        .context
        .cmd_bind_descriptor_sets(cb, 0, &[set(), spare])
        .unwrap();
    let dispatch = fixture.context.cmd_dispatch(cb).unwrap();
    // Nothing is in flight before the submit.
    fixture.context.free_descriptor_set(spare).unwrap();

    let index = fixture.context.queue_submit(&[cb]).unwrap();
    assert!(matches!(
        fixture.context.device_checks(cb, dispatch),
        Err(GpuavError::Coordinator(_))
    ));
    // The surviving set is not held by a dispatch that goes unchecked.
    fixture.write(0, &[buffer]);

    let events = fixture.complete(index);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].category, Category::Unverifiable);
    assert!(events[0].message.contains("dispatch 0"));
    assert!(
        events[0]
            .message
            .contains(&format!("({spare_id} is not allocated)"))
    );
    fixture.context.free_descriptor_set(set()).unwrap();
}
