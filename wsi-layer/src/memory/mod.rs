// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Memory backing the swapchain images.
//!
//! Swapchain images are backed in one of two ways:
//!
//! - By DMA-buf file descriptors obtained from a [`DmaBufAllocator`] and imported into the device
//!   by [`ExternalMemory`]. The same descriptors are then handed to the window system or to the
//!   bridge, so that no copy is needed.
//! - By host-visible device memory that the layer maps and copies from when presenting through
//!   shared memory.

pub use self::{
    allocator::{
        AllocationError, DmaBufAllocation, DmaBufAllocator, DmaBufFormat, DmaBufPlane,
        DmaHeapAllocator, GbmAllocator,
    },
    external::{ExternalMemory, ReleaseStats},
};
pub(crate) use self::allocator::page_size;
use ash::vk;

pub mod allocator;
pub mod external;

/// Returns the index of the first memory type allowed by `memory_type_bits` whose property flags
/// contain `flags`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    memory_type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    memory_properties
        .memory_types_as_slice()
        .iter()
        .enumerate()
        .find(|&(index, memory_type)| {
            memory_type_bits & (1 << index) != 0 && memory_type.property_flags.contains(flags)
        })
        .map(|(index, _)| index as u32)
}
