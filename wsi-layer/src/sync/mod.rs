// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Synchronization with the device.
//!
//! The layer has no command buffers of its own. It synchronizes with the application's work
//! through empty queue submissions: one per present, which waits on the application's
//! semaphores and signals the image's [`PresentFence`], and one per acquire that asks for a
//! semaphore or fence to be signaled.

pub use self::fence::PresentFence;
use crate::{device::DeviceData, VulkanError};
use ash::vk;

mod fence;

/// Signals `semaphore` and `fence`, either of which may be null, with an empty submission on the
/// device's internal queue.
pub(crate) fn signal_acquire(
    device: &DeviceData,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
) -> Result<(), VulkanError> {
    if semaphore == vk::Semaphore::null() && fence == vk::Fence::null() {
        return Ok(());
    }

    let queue = device.internal_queue();

    if queue == vk::Queue::null() {
        log::error!("cannot signal acquire semaphore or fence: no internal queue");
        return Err(VulkanError::InitializationFailed);
    }

    let signal_semaphores: &[vk::Semaphore] = if semaphore == vk::Semaphore::null() {
        &[]
    } else {
        std::slice::from_ref(&semaphore)
    };

    device
        .driver()
        .queue_submit(queue, &[], signal_semaphores, fence)
}
