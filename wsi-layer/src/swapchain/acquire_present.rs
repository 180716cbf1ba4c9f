// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    backend::{BackendKind, Delivery},
    image::PendingCompletion,
    ImageStatus, PresentMode, Swapchain,
};
use crate::{device::validation_error, sync::signal_acquire, Validated, VulkanError};
use ash::vk;
use smallvec::SmallVec;
use std::{
    num::NonZeroU64,
    time::{Duration, Instant},
};

/// An image handed out by [`Swapchain::acquire_next_image`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    pub image_index: u32,

    /// The swapchain still works but no longer matches the surface exactly.
    pub suboptimal: bool,
}

impl Swapchain {
    /// Waits for a free image, marks it as acquired and returns its index.
    ///
    /// A `timeout` of `None` waits forever. A zero timeout only polls, and returns `NotReady`
    /// if no image is free.
    ///
    /// If `semaphore` or `fence` is not null, it is signaled by an empty submission once the
    /// image is acquired.
    pub fn acquire_next_image(
        &self,
        timeout: Option<Duration>,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<AcquiredImage, VulkanError> {
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = self.shared.state.lock();

        let image_index = loop {
            if self.is_retired() {
                return Err(VulkanError::OutOfDate);
            }

            if let Some(err) = state.error {
                return Err(err);
            }

            if let Some(index) = state.images.acquire_free() {
                break index;
            }

            if !state.running {
                return Err(VulkanError::OutOfDate);
            }

            if timeout == Some(Duration::ZERO) {
                return Err(VulkanError::NotReady);
            }

            match deadline {
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut state, deadline).timed_out()
                        && state.images.count(ImageStatus::Free) == 0
                    {
                        return Err(VulkanError::Timeout);
                    }
                }
                None => self.shared.cond.wait(&mut state),
            }
        };

        drop(state);

        if let Err(err) = signal_acquire(self.device(), semaphore, fence) {
            let mut state = self.shared.state.lock();
            state.images.set_status(image_index, ImageStatus::Free);
            self.shared.cond.notify_all();

            return Err(err);
        }

        log::trace!("image {} acquired", image_index);

        Ok(AcquiredImage {
            image_index,
            suboptimal: false,
        })
    }

    /// Presents one image of this swapchain.
    ///
    /// `wait_semaphores` are waited on before the backend reads the image.
    pub(crate) fn present(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        info: &SwapchainPresentInfo,
    ) -> Result<(), Validated<VulkanError>> {
        self.validate_present(info)?;

        let &SwapchainPresentInfo {
            swapchain: _,
            image_index,
            present_id,
            present_mode,
            fence,
            _ne: _,
        } = info;
        let present_id = present_id.map_or(0, NonZeroU64::get);

        let mut present_state = self.present_state.lock();

        {
            let state = self.shared.state.lock();

            if state.images.status(image_index) != Some(ImageStatus::Acquired) {
                return Err(validation_error(
                    "image_index",
                    "the image is not acquired",
                    &["VUID-VkPresentInfoKHR-pImageIndices-01430"],
                )
                .into());
            }

            if let Some(err) = state.error {
                return Err(err.into());
            }
        }

        if let Some(present_mode) = present_mode {
            if present_mode != self.present_mode() {
                log::trace!("present {} uses {:?}", present_id, present_mode);
            }
        }

        let slot = &present_state.slots[image_index as usize];

        if let Err(err) = slot.fence.set_payload(queue, wait_semaphores) {
            self.give_back(image_index);
            return Err(err.into());
        }

        self.shared
            .state
            .lock()
            .images
            .set_status(image_index, ImageStatus::Presented);

        if let Err(err) = slot.fence.wait_payload(None) {
            self.give_back(image_index);
            return Err(err.into());
        }

        let serial = present_state.next_serial;
        present_state.next_serial = serial.wrapping_add(1);

        // Registered before the hand-off, so that the completion cannot be polled first.
        let tracked = present_state.backend.kind() != BackendKind::Bridge;
        if tracked {
            self.shared
                .state
                .lock()
                .images
                .push_pending(image_index, PendingCompletion { serial, present_id });
            self.shared.cond.notify_all();
        }

        let present_state = &mut *present_state;
        let slot = &mut present_state.slots[image_index as usize];
        let result = present_state
            .backend
            .present(slot, image_index, serial, self.image_extent());

        let mut state = self.shared.state.lock();

        match result {
            Ok(Delivery::Pending) => debug_assert!(tracked),
            Ok(Delivery::Released(released)) => {
                for index in released {
                    state.images.unpresent(index);
                }
                state.record_completed(present_id);
            }
            Err(err) => {
                let err = state.set_error(err);

                for index in present_state.backend.drain_delayed_release() {
                    state.images.unpresent(index);
                }
                state.images.unpresent(image_index);
                self.shared.cond.notify_all();

                return Err(err.into());
            }
        }

        state.last_present_id = state.last_present_id.max(present_id);
        self.shared.cond.notify_all();
        drop(state);

        if let Some(fence) = fence {
            self.device()
                .driver()
                .queue_submit(queue, &[], &[], fence)?;
        }

        Ok(())
    }

    fn validate_present(&self, info: &SwapchainPresentInfo) -> Result<(), Validated<VulkanError>> {
        let features = self.device().enabled_features();

        if info.image_index >= self.image_count() {
            return Err(validation_error(
                "image_index",
                "is not less than the number of images in the swapchain",
                &["VUID-VkPresentInfoKHR-pImageIndices-01430"],
            )
            .into());
        }

        if info.present_id.is_some() && !features.present_id {
            return Err(validation_error(
                "present_id",
                "is `Some`, but the `present_id` feature is not enabled",
                &["VUID-VkPresentIdKHR-presentIds-04999"],
            )
            .into());
        }

        if let Some(present_mode) = info.present_mode {
            if !features.swapchain_maintenance1 {
                return Err(validation_error(
                    "present_mode",
                    "is `Some`, but the `swapchain_maintenance1` feature is not enabled",
                    &["VUID-VkSwapchainPresentModeInfoEXT-presentMode-07761"],
                )
                .into());
            }

            if !self.present_modes().contains(&present_mode) {
                return Err(validation_error(
                    "present_mode",
                    "is not one of the present modes of the swapchain",
                    &["VUID-VkSwapchainPresentModeInfoEXT-pPresentModes-07761"],
                )
                .into());
            }
        }

        if info.fence.is_some() && !features.swapchain_maintenance1 {
            return Err(validation_error(
                "fence",
                "is `Some`, but the `swapchain_maintenance1` feature is not enabled",
                &["VUID-VkSwapchainPresentFenceInfoEXT-swapchainMaintenance1-07757"],
            )
            .into());
        }

        Ok(())
    }

    /// Returns an acquired image whose present failed before reaching the backend.
    fn give_back(&self, image_index: u32) {
        let mut state = self.shared.state.lock();
        state.images.unpresent(image_index);
        self.shared.cond.notify_all();
    }

    /// Waits until the present with id `present_id`, or a later one, has completed.
    ///
    /// A `timeout` of `None` waits forever.
    pub fn wait_for_present(
        &self,
        present_id: NonZeroU64,
        timeout: Option<Duration>,
    ) -> Result<(), Validated<VulkanError>> {
        if !self.device().enabled_features().present_wait {
            return Err(validation_error(
                "present_wait",
                "the `present_wait` feature is not enabled",
                &["VUID-vkWaitForPresentKHR-presentWait-06234"],
            )
            .into());
        }

        let present_id = present_id.get();
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        let mut state = self.shared.state.lock();

        loop {
            if state.last_completed_present_id >= present_id {
                return Ok(());
            }

            if let Some(err) = state.error {
                return Err(err.into());
            }

            if !state.running {
                return Err(VulkanError::OutOfDate.into());
            }

            match deadline {
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut state, deadline).timed_out()
                        && state.last_completed_present_id < present_id
                    {
                        return Err(VulkanError::Timeout.into());
                    }
                }
                None => self.shared.cond.wait(&mut state),
            }
        }
    }
}

/// Parameters to present images.
#[derive(Clone, Debug, Default)]
pub struct PresentInfo {
    /// The semaphores to wait for before beginning the execution of the present operations.
    ///
    /// The default value is empty.
    pub wait_semaphores: SmallVec<[vk::Semaphore; 4]>,

    /// The present operations to perform.
    ///
    /// The default value is empty.
    pub swapchain_infos: SmallVec<[SwapchainPresentInfo; 1]>,

    pub _ne: crate::NonExhaustive,
}

/// Parameters for a single present operation on a swapchain.
#[derive(Clone, Debug)]
pub struct SwapchainPresentInfo {
    /// The swapchain to present to.
    ///
    /// There is no default value.
    pub swapchain: vk::SwapchainKHR,

    /// The index of the swapchain image to present to.
    ///
    /// The image must have been acquired first; this is the index that `acquire_next_image`
    /// returns.
    ///
    /// There is no default value.
    pub image_index: u32,

    /// An id used to identify this present operation.
    ///
    /// If `present_id` is `Some`, the [`present_id`](crate::device::PresentFeatures::present_id)
    /// feature must be enabled on the device. The id must be greater than any id previously
    /// used for `swapchain`.
    ///
    /// [`Swapchain::wait_for_present`] waits on it.
    ///
    /// The default value is `None`.
    pub present_id: Option<NonZeroU64>,

    /// The present mode to use for this present.
    ///
    /// If this is `Some`, it must be one of the present modes of the swapchain, and the
    /// `swapchain_maintenance1` feature must be enabled.
    ///
    /// The default value is `None`.
    pub present_mode: Option<PresentMode>,

    /// A fence signaled once the image has been handed to the window system.
    ///
    /// If this is `Some`, the `swapchain_maintenance1` feature must be enabled.
    ///
    /// The default value is `None`.
    pub fence: Option<vk::Fence>,

    pub _ne: crate::NonExhaustive,
}

impl SwapchainPresentInfo {
    /// Returns a `SwapchainPresentInfo` with the specified `swapchain` and `image_index`.
    #[inline]
    pub fn swapchain_image_index(swapchain: vk::SwapchainKHR, image_index: u32) -> Self {
        Self {
            swapchain,
            image_index,
            present_id: None,
            present_mode: None,
            fence: None,
            _ne: crate::NonExhaustive(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PresentInfo, SwapchainPresentInfo};
    use crate::{
        device::{DeviceData, DeviceDataCreateInfo, PresentFeatures},
        platform::WindowSystem,
        swapchain::{ImageStatus, PresentMode, SwapchainCreateInfo},
        tests::{mock_device, mock_device_from, MockDriver, MockWindowSystem},
        Validated, VulkanError,
    };
    use ash::vk::{self, Handle};
    use smallvec::smallvec;
    use std::{
        num::NonZeroU64,
        sync::Arc,
        thread,
        time::{Duration, Instant},
    };

    const QUEUE: u64 = 0x51;

    fn create_info(min_image_count: u32) -> SwapchainCreateInfo {
        SwapchainCreateInfo {
            min_image_count,
            image_format: vk::Format::B8G8R8A8_UNORM,
            image_extent: [8, 8],
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            present_modes: smallvec![PresentMode::Fifo, PresentMode::Mailbox],
            ..Default::default()
        }
    }

    fn all_features(driver: Arc<MockDriver>) -> Arc<DeviceData> {
        mock_device_from(
            driver,
            DeviceDataCreateInfo {
                enabled_features: PresentFeatures {
                    present_id: true,
                    present_wait: true,
                    swapchain_maintenance1: true,
                },
                ..Default::default()
            },
        )
    }

    fn present_one(
        device: &DeviceData,
        info: SwapchainPresentInfo,
    ) -> Result<(), Validated<VulkanError>> {
        let present_info = PresentInfo {
            swapchain_infos: smallvec![info],
            ..Default::default()
        };
        let mut results = device
            .queue_present(vk::Queue::from_raw(QUEUE), &present_info)
            .results;

        results.pop().unwrap()
    }

    fn wait_for_status(
        device: &DeviceData,
        swapchain: vk::SwapchainKHR,
        index: u32,
        status: ImageStatus,
    ) {
        let swapchain = device.swapchain(swapchain).unwrap();
        let start = Instant::now();
        while swapchain.image_status(index) != Some(status) {
            assert!(start.elapsed() < Duration::from_secs(5), "image never became {:?}", status);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn acquire_present_complete_cycle() {
        let driver = Arc::new(MockDriver::new());
        let device = all_features(driver.clone());
        let surface = Arc::new(MockWindowSystem::new());
        let handle = device
            .create_swapchain(surface.clone() as Arc<dyn WindowSystem>, create_info(3))
            .unwrap();
        let swapchain = device.swapchain(handle).unwrap();

        let acquired = swapchain
            .acquire_next_image(Some(Duration::ZERO), vk::Semaphore::null(), vk::Fence::null())
            .unwrap();
        assert_eq!(
            swapchain.image_status(acquired.image_index),
            Some(ImageStatus::Acquired)
        );

        let semaphore = vk::Semaphore::from_raw(0x99);
        let present_info = PresentInfo {
            wait_semaphores: smallvec![semaphore],
            swapchain_infos: smallvec![SwapchainPresentInfo {
                present_id: NonZeroU64::new(42),
                ..SwapchainPresentInfo::swapchain_image_index(handle, acquired.image_index)
            }],
            ..Default::default()
        };
        let results = device.queue_present(vk::Queue::from_raw(QUEUE), &present_info);
        assert!(!results.forwarded);
        assert_eq!(results.result(), vk::Result::SUCCESS);
        assert_eq!(driver.state().submits[0].wait_semaphores, vec![semaphore]);

        swapchain
            .wait_for_present(NonZeroU64::new(42).unwrap(), Some(Duration::from_secs(5)))
            .unwrap();
        wait_for_status(&device, handle, acquired.image_index, ImageStatus::Free);
        assert_eq!(surface.state().shm_puts.len(), 1);
    }

    #[test]
    fn one_image_can_be_presented_repeatedly() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device(driver);
        let surface = Arc::new(MockWindowSystem::new());
        let handle = device
            .create_swapchain(surface.clone() as Arc<dyn WindowSystem>, create_info(1))
            .unwrap();
        let swapchain = device.swapchain(handle).unwrap();

        for _ in 0..200 {
            let acquired = swapchain
                .acquire_next_image(
                    Some(Duration::from_secs(5)),
                    vk::Semaphore::null(),
                    vk::Fence::null(),
                )
                .unwrap();
            assert_eq!(acquired.image_index, 0);

            present_one(&device, SwapchainPresentInfo::swapchain_image_index(handle, 0)).unwrap();
        }

        wait_for_status(&device, handle, 0, ImageStatus::Free);

        let puts = surface.state().shm_puts.clone();
        assert_eq!(puts.len(), 200);
        assert!(puts.windows(2).all(|pair| pair[1].1 == pair[0].1 + 1));
    }

    #[test]
    fn zero_timeout_without_free_image_is_not_ready() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device(driver);
        let surface = Arc::new(MockWindowSystem::new());
        let handle = device
            .create_swapchain(surface as Arc<dyn WindowSystem>, create_info(1))
            .unwrap();
        let swapchain = device.swapchain(handle).unwrap();

        swapchain
            .acquire_next_image(Some(Duration::ZERO), vk::Semaphore::null(), vk::Fence::null())
            .unwrap();
        assert_eq!(
            swapchain.acquire_next_image(
                Some(Duration::ZERO),
                vk::Semaphore::null(),
                vk::Fence::null()
            ),
            Err(VulkanError::NotReady)
        );
        assert_eq!(
            swapchain.acquire_next_image(
                Some(Duration::from_millis(5)),
                vk::Semaphore::null(),
                vk::Fence::null()
            ),
            Err(VulkanError::Timeout)
        );
    }

    #[test]
    fn infinite_acquire_unblocks_on_completion() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device(driver);
        let surface = Arc::new(MockWindowSystem::new());
        surface.state().auto_complete = false;
        let handle = device
            .create_swapchain(surface.clone() as Arc<dyn WindowSystem>, create_info(1))
            .unwrap();
        let swapchain = device.swapchain(handle).unwrap();

        let acquired = swapchain
            .acquire_next_image(None, vk::Semaphore::null(), vk::Fence::null())
            .unwrap();
        present_one(
            &device,
            SwapchainPresentInfo::swapchain_image_index(handle, acquired.image_index),
        )
        .unwrap();
        assert_eq!(swapchain.image_status(0), Some(ImageStatus::Presented));

        let waiter = {
            let swapchain = swapchain.clone();
            thread::spawn(move || {
                swapchain.acquire_next_image(None, vk::Semaphore::null(), vk::Fence::null())
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        let serial = surface.state().shm_puts[0].1;
        surface.state().completed.push_back(serial);

        let acquired = waiter.join().unwrap().unwrap();
        assert_eq!(acquired.image_index, 0);
    }

    #[test]
    fn acquire_signals_semaphore_and_fence() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device(driver.clone());
        let surface = Arc::new(MockWindowSystem::new());
        let handle = device
            .create_swapchain(surface as Arc<dyn WindowSystem>, create_info(2))
            .unwrap();
        let swapchain = device.swapchain(handle).unwrap();

        let semaphore = vk::Semaphore::from_raw(0x10);
        let fence = vk::Fence::from_raw(0x20);
        swapchain
            .acquire_next_image(Some(Duration::ZERO), semaphore, fence)
            .unwrap();

        let state = driver.state();
        let submit = state.submits.last().unwrap();
        assert_eq!(submit.queue, device.internal_queue());
        assert_eq!(submit.signal_semaphores, vec![semaphore]);
        assert_eq!(submit.fence, fence);
    }

    #[test]
    fn present_of_unacquired_image_is_rejected() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device(driver.clone());
        let surface = Arc::new(MockWindowSystem::new());
        let handle = device
            .create_swapchain(surface.clone() as Arc<dyn WindowSystem>, create_info(2))
            .unwrap();

        let err = present_one(&device, SwapchainPresentInfo::swapchain_image_index(handle, 1))
            .unwrap_err();
        let Validated::ValidationError(err) = err else {
            panic!("expected a validation error");
        };
        assert_eq!(err.vuids, ["VUID-VkPresentInfoKHR-pImageIndices-01430"]);

        assert!(driver.state().submits.is_empty());
        assert!(surface.state().shm_puts.is_empty());
        assert_eq!(
            device.swapchain(handle).unwrap().image_status(1),
            Some(ImageStatus::Free)
        );
    }

    #[test]
    fn present_extensions_require_features() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device(driver);
        let surface = Arc::new(MockWindowSystem::new());
        let handle = device
            .create_swapchain(surface as Arc<dyn WindowSystem>, create_info(2))
            .unwrap();
        let swapchain = device.swapchain(handle).unwrap();
        swapchain
            .acquire_next_image(Some(Duration::ZERO), vk::Semaphore::null(), vk::Fence::null())
            .unwrap();

        let err = present_one(
            &device,
            SwapchainPresentInfo {
                present_id: NonZeroU64::new(1),
                ..SwapchainPresentInfo::swapchain_image_index(handle, 0)
            },
        )
        .unwrap_err();
        assert!(matches!(err, Validated::ValidationError(_)));

        assert!(matches!(
            swapchain.wait_for_present(NonZeroU64::new(1).unwrap(), None),
            Err(Validated::ValidationError(_))
        ));
    }

    #[test]
    fn present_mode_override_must_be_listed() {
        let driver = Arc::new(MockDriver::new());
        let device = all_features(driver);
        let surface = Arc::new(MockWindowSystem::new());
        let handle = device
            .create_swapchain(surface as Arc<dyn WindowSystem>, create_info(2))
            .unwrap();
        let swapchain = device.swapchain(handle).unwrap();
        let acquired = swapchain
            .acquire_next_image(Some(Duration::ZERO), vk::Semaphore::null(), vk::Fence::null())
            .unwrap();

        let err = present_one(
            &device,
            SwapchainPresentInfo {
                present_mode: Some(PresentMode::Immediate),
                ..SwapchainPresentInfo::swapchain_image_index(handle, acquired.image_index)
            },
        )
        .unwrap_err();
        assert!(matches!(err, Validated::ValidationError(_)));

        present_one(
            &device,
            SwapchainPresentInfo {
                present_mode: Some(PresentMode::Mailbox),
                ..SwapchainPresentInfo::swapchain_image_index(handle, acquired.image_index)
            },
        )
        .unwrap();
    }

    #[test]
    fn present_fence_is_signaled_after_delivery() {
        let driver = Arc::new(MockDriver::new());
        let device = all_features(driver.clone());
        let surface = Arc::new(MockWindowSystem::new());
        let handle = device
            .create_swapchain(surface.clone() as Arc<dyn WindowSystem>, create_info(2))
            .unwrap();
        let swapchain = device.swapchain(handle).unwrap();
        let acquired = swapchain
            .acquire_next_image(Some(Duration::ZERO), vk::Semaphore::null(), vk::Fence::null())
            .unwrap();

        let fence = vk::Fence::from_raw(0xfe);
        present_one(
            &device,
            SwapchainPresentInfo {
                fence: Some(fence),
                ..SwapchainPresentInfo::swapchain_image_index(handle, acquired.image_index)
            },
        )
        .unwrap();

        let state = driver.state();
        let submit = state.submits.last().unwrap();
        assert_eq!(submit.fence, fence);
        assert!(submit.wait_semaphores.is_empty());
        assert_eq!(surface.state().shm_puts.len(), 1);
    }

    #[test]
    fn window_system_failure_is_sticky() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device(driver);
        let surface = Arc::new(MockWindowSystem::new());
        surface.state().fail_present = Some(VulkanError::SurfaceLost);
        let handle = device
            .create_swapchain(surface as Arc<dyn WindowSystem>, create_info(2))
            .unwrap();
        let swapchain = device.swapchain(handle).unwrap();

        let acquired = swapchain
            .acquire_next_image(Some(Duration::ZERO), vk::Semaphore::null(), vk::Fence::null())
            .unwrap();
        let err = present_one(
            &device,
            SwapchainPresentInfo::swapchain_image_index(handle, acquired.image_index),
        )
        .unwrap_err();
        assert!(matches!(err, Validated::Error(VulkanError::SurfaceLost)));

        assert_eq!(
            swapchain.image_status(acquired.image_index),
            Some(ImageStatus::Free)
        );
        assert_eq!(swapchain.status(), Err(VulkanError::SurfaceLost));
        assert_eq!(
            swapchain.acquire_next_image(None, vk::Semaphore::null(), vk::Fence::null()),
            Err(VulkanError::SurfaceLost)
        );
    }

    #[test]
    fn completion_source_failure_is_sticky() {
        let driver = Arc::new(MockDriver::new());
        let device = all_features(driver);
        let surface = Arc::new(MockWindowSystem::new());
        {
            let mut state = surface.state();
            state.auto_complete = false;
            state.fail_poll = Some(VulkanError::SurfaceLost);
        }
        let handle = device
            .create_swapchain(surface as Arc<dyn WindowSystem>, create_info(2))
            .unwrap();
        let swapchain = device.swapchain(handle).unwrap();

        let acquired = swapchain
            .acquire_next_image(Some(Duration::ZERO), vk::Semaphore::null(), vk::Fence::null())
            .unwrap();
        present_one(
            &device,
            SwapchainPresentInfo {
                present_id: NonZeroU64::new(3),
                ..SwapchainPresentInfo::swapchain_image_index(handle, acquired.image_index)
            },
        )
        .unwrap();

        assert!(matches!(
            swapchain.wait_for_present(NonZeroU64::new(3).unwrap(), Some(Duration::from_secs(5))),
            Err(Validated::Error(VulkanError::SurfaceLost))
        ));
        assert_eq!(
            swapchain.acquire_next_image(None, vk::Semaphore::null(), vk::Fence::null()),
            Err(VulkanError::SurfaceLost)
        );
    }

    #[test]
    fn wait_for_present_times_out() {
        let driver = Arc::new(MockDriver::new());
        let device = all_features(driver);
        let surface = Arc::new(MockWindowSystem::new());
        surface.state().auto_complete = false;
        let handle = device
            .create_swapchain(surface as Arc<dyn WindowSystem>, create_info(2))
            .unwrap();
        let swapchain = device.swapchain(handle).unwrap();

        assert!(matches!(
            swapchain.wait_for_present(NonZeroU64::new(7).unwrap(), Some(Duration::ZERO)),
            Err(Validated::Error(VulkanError::Timeout))
        ));
    }

    #[test]
    fn retired_swapchain_is_out_of_date() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device(driver);
        let surface: Arc<dyn WindowSystem> = Arc::new(MockWindowSystem::new());
        let old = device.create_swapchain(surface.clone(), create_info(2)).unwrap();
        device
            .create_swapchain(
                surface,
                SwapchainCreateInfo {
                    old_swapchain: Some(old),
                    ..create_info(2)
                },
            )
            .unwrap();

        assert_eq!(
            device.swapchain(old).unwrap().acquire_next_image(
                Some(Duration::ZERO),
                vk::Semaphore::null(),
                vk::Fence::null()
            ),
            Err(VulkanError::OutOfDate)
        );
    }

    #[test]
    fn requests_are_processed_independently() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device(driver.clone());
        let surface: Arc<dyn WindowSystem> = Arc::new(MockWindowSystem::new());
        let first = device.create_swapchain(surface.clone(), create_info(2)).unwrap();
        let second = device.create_swapchain(surface, create_info(2)).unwrap();

        device
            .swapchain(second)
            .unwrap()
            .acquire_next_image(Some(Duration::ZERO), vk::Semaphore::null(), vk::Fence::null())
            .unwrap();

        let semaphore = vk::Semaphore::from_raw(0x31);
        let present_info = PresentInfo {
            wait_semaphores: smallvec![semaphore],
            swapchain_infos: smallvec![
                SwapchainPresentInfo::swapchain_image_index(first, 0),
                SwapchainPresentInfo::swapchain_image_index(second, 0),
            ],
            ..Default::default()
        };
        let results = device.queue_present(vk::Queue::from_raw(QUEUE), &present_info);

        assert!(matches!(results.results[0], Err(Validated::ValidationError(_))));
        assert!(results.results[1].is_ok());
        assert_eq!(results.result(), vk::Result::ERROR_UNKNOWN);

        // The semaphores are waited for once, for both requests.
        let state = driver.state();
        assert_eq!(state.submits[0].wait_semaphores, vec![semaphore]);
        assert!(state.submits[1].wait_semaphores.is_empty());
    }

    #[test]
    fn foreign_swapchain_forwards_the_whole_present() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device(driver.clone());
        let surface: Arc<dyn WindowSystem> = Arc::new(MockWindowSystem::new());
        let owned = device.create_swapchain(surface, create_info(2)).unwrap();
        let foreign = vk::SwapchainKHR::from_raw(0xdead_0000);

        let present_info = PresentInfo {
            swapchain_infos: smallvec![
                SwapchainPresentInfo::swapchain_image_index(owned, 0),
                SwapchainPresentInfo::swapchain_image_index(foreign, 1),
            ],
            ..Default::default()
        };
        let results = device.queue_present(vk::Queue::from_raw(QUEUE), &present_info);

        assert!(results.forwarded);
        assert_eq!(results.results.len(), 2);
        assert_eq!(
            driver.state().forwarded_presents,
            [(vec![owned, foreign], vec![0, 1])]
        );
    }
}
