// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use crate::{device::DeviceData, VulkanError, VulkanObject};
use ash::vk;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

/// The fence a swapchain image waits on before it is handed to the window system.
///
/// Presenting an image first submits an empty batch that waits on the application's semaphores
/// and signals this fence. That batch is the image's payload. The backend only reads the image
/// once the payload has completed.
#[derive(Debug)]
pub struct PresentFence {
    handle: vk::Fence,
    device: Arc<DeviceData>,

    // If true, a submission signaling the fence was made and has not been waited for yet.
    has_payload: AtomicBool,
}

impl PresentFence {
    /// Creates a new unsignaled `PresentFence`.
    #[inline]
    pub fn new(device: Arc<DeviceData>) -> Result<PresentFence, VulkanError> {
        let handle = device.driver().create_fence()?;

        Ok(PresentFence {
            handle,
            device,
            has_payload: AtomicBool::new(false),
        })
    }

    /// Returns true if a payload was set and not waited for yet.
    #[inline]
    pub fn has_payload(&self) -> bool {
        self.has_payload.load(Ordering::Acquire)
    }

    /// Submits an empty batch to `queue` that waits on `wait_semaphores` and signals the fence.
    ///
    /// A previous payload that was never waited for is waited for first.
    pub fn set_payload(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<(), VulkanError> {
        self.wait_payload(None)?;

        let driver = self.device.driver();
        driver.reset_fence(self.handle)?;
        driver.queue_submit(queue, wait_semaphores, &[], self.handle)?;
        self.has_payload.store(true, Ordering::Release);

        Ok(())
    }

    /// Waits until the payload has completed.
    ///
    /// Returns `Timeout` if `timeout` elapsed first. Without a payload this returns immediately.
    pub fn wait_payload(&self, timeout: Option<Duration>) -> Result<(), VulkanError> {
        if !self.has_payload() {
            return Ok(());
        }

        let timeout_ns = if let Some(timeout) = timeout {
            timeout
                .as_secs()
                .saturating_mul(1_000_000_000)
                .saturating_add(u64::from(timeout.subsec_nanos()))
        } else {
            u64::MAX
        };

        if self.device.driver().wait_fence(self.handle, timeout_ns)? {
            self.has_payload.store(false, Ordering::Release);
            Ok(())
        } else {
            Err(VulkanError::Timeout)
        }
    }
}

impl Drop for PresentFence {
    #[inline]
    fn drop(&mut self) {
        if let Err(err) = self.wait_payload(None) {
            log::warn!("failed to wait for present fence {:?}: {}", self.handle, err);
        }

        self.device.driver().destroy_fence(self.handle);
    }
}

unsafe impl VulkanObject for PresentFence {
    type Handle = vk::Fence;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::PresentFence;
    use crate::{
        tests::{mock_device, MockDriver},
        VulkanError, VulkanObject,
    };
    use ash::vk::{self, Handle};
    use std::{sync::Arc, time::Duration};

    #[test]
    fn payload_is_submitted_and_waited() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device(driver.clone());
        let fence = PresentFence::new(device).unwrap();
        let semaphore = vk::Semaphore::from_raw(0x77);

        assert!(!fence.has_payload());
        fence
            .set_payload(vk::Queue::from_raw(1), &[semaphore])
            .unwrap();
        assert!(fence.has_payload());

        {
            let state = driver.state();
            assert_eq!(state.submits.len(), 1);
            assert_eq!(state.submits[0].wait_semaphores, vec![semaphore]);
            assert_eq!(state.submits[0].fence, fence.handle());
        }

        fence.wait_payload(Some(Duration::ZERO)).unwrap();
        assert!(!fence.has_payload());
    }

    #[test]
    fn unsignaled_payload_times_out() {
        let driver = Arc::new(MockDriver::new());
        driver.state().signal_on_submit = false;
        let device = mock_device(driver.clone());
        let fence = PresentFence::new(device).unwrap();

        fence.set_payload(vk::Queue::from_raw(1), &[]).unwrap();
        assert_eq!(
            fence.wait_payload(Some(Duration::from_millis(1))),
            Err(VulkanError::Timeout)
        );
        assert!(fence.has_payload());

        driver.signal_fence(fence.handle());
        fence.wait_payload(None).unwrap();
    }

    #[test]
    fn drop_destroys_fence() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device(driver.clone());
        let handle = {
            let fence = PresentFence::new(device).unwrap();
            fence.handle()
        };
        assert!(!driver.state().fences.contains_key(&handle));
    }
}
