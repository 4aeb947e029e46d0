// Copyright 2026 The MuTate Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use ash::vk;

/// Enabled device features that change what the validator accepts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceCapabilities {
    /// `nullDescriptor` from `VK_EXT_robustness2`.  Allows explicit null writes.
    pub null_descriptor: bool,
    pub buffer_device_address: bool,
    pub runtime_descriptor_array: bool,
    pub partially_bound: bool,
    pub variable_descriptor_count: bool,
}

impl DeviceCapabilities {
    pub fn from_features(
        robustness2: &vk::PhysicalDeviceRobustness2FeaturesEXT<'_>,
        buffer_device_address: &vk::PhysicalDeviceBufferDeviceAddressFeatures<'_>,
        indexing: &vk::PhysicalDeviceDescriptorIndexingFeatures<'_>,
    ) -> Self {
        Self {
            null_descriptor: robustness2.null_descriptor == vk::TRUE,
            buffer_device_address: buffer_device_address.buffer_device_address == vk::TRUE,
            runtime_descriptor_array: indexing.runtime_descriptor_array == vk::TRUE,
            partially_bound: indexing.descriptor_binding_partially_bound == vk::TRUE,
            variable_descriptor_count: indexing.descriptor_binding_variable_descriptor_count
                == vk::TRUE,
        }
    }
}
