// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{
    backend::{BackendKind, ImageResources, PresentBackend},
    completion::{SurfaceCompletions, SwapchainShared},
    ImageStatus, PresentMode, MAX_SWAPCHAIN_IMAGE_COUNT,
};
use crate::{
    device::{validation_error, DeviceData},
    platform::WindowSystem,
    Handle, Validated, ValidationError, VulkanError, VulkanObject,
};
use ash::vk;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

/// A swapchain owned by the layer.
pub struct Swapchain {
    handle: vk::SwapchainKHR,
    device: Arc<DeviceData>,
    surface: Arc<dyn WindowSystem>,

    flags: vk::SwapchainCreateFlagsKHR,
    image_format: vk::Format,
    image_color_space: vk::ColorSpaceKHR,
    image_extent: [u32; 2],
    image_array_layers: u32,
    image_usage: vk::ImageUsageFlags,
    present_mode: PresentMode,
    present_modes: SmallVec<[PresentMode; 4]>,
    backend_kind: BackendKind,

    images: Box<[vk::Image]>,
    pub(super) shared: Arc<SwapchainShared>,
    pub(super) present_state: Mutex<PresentState>,
    thread: Mutex<Option<JoinHandle<()>>>,
    retired: AtomicBool,
}

/// State only touched while presenting.
pub(super) struct PresentState {
    pub(super) backend: PresentBackend,
    pub(super) slots: Vec<ImageResources>,
    pub(super) next_serial: u32,
}

impl Swapchain {
    /// Creates the swapchain's images and starts its completion thread.
    ///
    /// `handle` is the handle the application will know the swapchain by.
    pub(crate) fn new(
        device: Arc<DeviceData>,
        handle: vk::SwapchainKHR,
        surface: Arc<dyn WindowSystem>,
        create_info: SwapchainCreateInfo,
    ) -> Result<Arc<Swapchain>, Validated<VulkanError>> {
        create_info
            .validate()
            .map_err(|err| err.add_context("create_info"))?;

        let backend = PresentBackend::select(&device, &surface, &create_info)?;
        let backend_kind = backend.kind();

        let image_count = if backend_kind == BackendKind::Bridge {
            MAX_SWAPCHAIN_IMAGE_COUNT
        } else {
            create_info
                .min_image_count
                .clamp(1, MAX_SWAPCHAIN_IMAGE_COUNT)
        };

        let mut present_mode = create_info.present_mode;

        if let Some(bridge) = backend.bridge() {
            if matches!(present_mode, PresentMode::Mailbox | PresentMode::Immediate)
                && !bridge.client().config().allow_mailbox
            {
                log::info!("{:?} downgraded to FIFO for the bridge", present_mode);
                present_mode = PresentMode::Fifo;
            }
        }

        let slots = (0..image_count)
            .map(|index| {
                backend
                    .create_image_resources(&device, &create_info)
                    .inspect_err(|err| {
                        log::error!("failed to create swapchain image {}: {}", index, err);
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let images = slots.iter().map(|slot| slot.image).collect();

        let shared = Arc::new(SwapchainShared::new(
            image_count,
            Box::new(SurfaceCompletions(surface.clone())),
        ));
        shared.state.lock().images.mark_all_free();

        let thread = shared
            .spawn(format!("wsi-swapchain-{:#x}", handle.as_raw()))
            .map_err(|err| {
                log::error!("failed to start the completion thread: {}", err);
                VulkanError::InitializationFailed
            })?;

        let SwapchainCreateInfo {
            flags,
            image_format,
            image_color_space,
            image_extent,
            image_array_layers,
            image_usage,
            present_modes,
            ..
        } = create_info;

        let present_modes = if present_modes.is_empty() {
            SmallVec::from_elem(present_mode, 1)
        } else {
            present_modes
        };

        log::info!(
            "swapchain {:#x}: {} images of {:?} {:?}, {:?} backend, {:?}",
            handle.as_raw(),
            image_count,
            image_extent,
            image_format,
            backend_kind,
            present_mode,
        );

        Ok(Arc::new(Swapchain {
            handle,
            device,
            surface,
            flags,
            image_format,
            image_color_space,
            image_extent,
            image_array_layers,
            image_usage,
            present_mode,
            present_modes,
            backend_kind,
            images,
            shared,
            present_state: Mutex::new(PresentState {
                backend,
                slots,
                next_serial: 1,
            }),
            thread: Mutex::new(Some(thread)),
            retired: AtomicBool::new(false),
        }))
    }

    #[inline]
    pub fn device(&self) -> &Arc<DeviceData> {
        &self.device
    }

    #[inline]
    pub fn surface(&self) -> &Arc<dyn WindowSystem> {
        &self.surface
    }

    #[inline]
    pub fn flags(&self) -> vk::SwapchainCreateFlagsKHR {
        self.flags
    }

    /// Returns the handles of the swapchain's images, in index order.
    #[inline]
    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    #[inline]
    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    #[inline]
    pub fn image_format(&self) -> vk::Format {
        self.image_format
    }

    #[inline]
    pub fn image_color_space(&self) -> vk::ColorSpaceKHR {
        self.image_color_space
    }

    #[inline]
    pub fn image_extent(&self) -> [u32; 2] {
        self.image_extent
    }

    #[inline]
    pub fn image_array_layers(&self) -> u32 {
        self.image_array_layers
    }

    #[inline]
    pub fn image_usage(&self) -> vk::ImageUsageFlags {
        self.image_usage
    }

    /// The present mode in effect, which may differ from the requested one.
    #[inline]
    pub fn present_mode(&self) -> PresentMode {
        self.present_mode
    }

    /// The present modes a present may switch to.
    #[inline]
    pub fn present_modes(&self) -> &[PresentMode] {
        &self.present_modes
    }

    #[inline]
    pub fn backend_kind(&self) -> BackendKind {
        self.backend_kind
    }

    /// Returns the status of the image at `index`, or `None` if it is out of range.
    #[inline]
    pub fn image_status(&self, index: u32) -> Option<ImageStatus> {
        self.shared.state.lock().images.status(index)
    }

    /// Returns the error the swapchain is stuck in, if any.
    #[inline]
    pub fn status(&self) -> Result<(), VulkanError> {
        match self.shared.state.lock().error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Marks the swapchain as replaced by a newer one. Acquiring from it then returns
    /// `OutOfDate`.
    #[inline]
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
        self.shared.cond.notify_all();
    }

    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Binds `image`, created by the application with this swapchain as its memory source, to
    /// the memory of the swapchain image at `image_index`.
    pub fn bind_swapchain_image(
        &self,
        image: vk::Image,
        image_index: u32,
    ) -> Result<(), Validated<VulkanError>> {
        if image_index >= self.image_count() {
            return Err(validation_error(
                "image_index",
                "is not less than the number of images in the swapchain",
                &["VUID-VkBindImageMemorySwapchainInfoKHR-imageIndex-01644"],
            )
            .into());
        }

        let present_state = self.present_state.lock();
        present_state.slots[image_index as usize]
            .memory
            .bind_swapchain_image_memory(image)?;

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<SwapchainShared> {
        &self.shared
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.shared.request_stop();

        if let Some(thread) = self.thread.get_mut().take() {
            if thread.join().is_err() {
                log::error!(
                    "completion thread of swapchain {:#x} panicked",
                    self.handle.as_raw(),
                );
            }
        }

        let present_state = self.present_state.get_mut();
        let released = present_state.backend.drain_delayed_release();

        {
            let mut state = self.shared.state.lock();
            for index in released {
                state.images.unpresent(index);
            }
        }

        present_state.backend.stop_stream();
        present_state.slots.clear();
        self.shared.state.lock().images.invalidate_all();

        log::debug!("swapchain {:#x} destroyed", self.handle.as_raw());
    }
}

unsafe impl VulkanObject for Swapchain {
    type Handle = vk::SwapchainKHR;

    #[inline]
    fn handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Debug for Swapchain {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("Swapchain")
            .field("handle", &self.handle)
            .field("image_format", &self.image_format)
            .field("image_extent", &self.image_extent)
            .field("image_count", &self.images.len())
            .field("present_mode", &self.present_mode)
            .field("backend_kind", &self.backend_kind)
            .field("retired", &self.is_retired())
            .finish_non_exhaustive()
    }
}

/// Parameters to create a new `Swapchain`.
#[derive(Clone, Debug)]
pub struct SwapchainCreateInfo {
    /// Additional properties of the swapchain.
    ///
    /// The default value is empty.
    pub flags: vk::SwapchainCreateFlagsKHR,

    /// The minimum number of images that will be created.
    ///
    /// The number is clamped to between 1 and [`MAX_SWAPCHAIN_IMAGE_COUNT`]. Under the bridge,
    /// [`MAX_SWAPCHAIN_IMAGE_COUNT`] images are always created.
    ///
    /// The default value is `2`.
    pub min_image_count: u32,

    /// The format of the created images.
    ///
    /// The default value is `Format::UNDEFINED`, which must be overridden.
    pub image_format: vk::Format,

    /// The color space of the created images.
    ///
    /// The default value is `ColorSpaceKHR::SRGB_NONLINEAR`.
    pub image_color_space: vk::ColorSpaceKHR,

    /// The extent of the created images.
    ///
    /// The default value is `[0, 0]`, which must be overridden.
    pub image_extent: [u32; 2],

    /// The number of array layers of the created images.
    ///
    /// The default value is `1`.
    pub image_array_layers: u32,

    /// How the created images will be used.
    ///
    /// The default value is empty, which must be overridden.
    pub image_usage: vk::ImageUsageFlags,

    /// Whether the images are owned by one queue family at a time.
    ///
    /// The default value is `SharingMode::EXCLUSIVE`.
    pub image_sharing_mode: vk::SharingMode,

    /// The queue families sharing the images, with `SharingMode::CONCURRENT`.
    ///
    /// The default value is empty.
    pub queue_family_indices: SmallVec<[u32; 2]>,

    /// How the swapchain should behave when multiple images are waiting in the queue to be
    /// presented.
    ///
    /// The default value is [`PresentMode::Fifo`].
    pub present_mode: PresentMode,

    /// Alternative present modes that can be used with this swapchain. The mode specified in
    /// `present_mode` is the default mode, but can be changed for future present operations by
    /// specifying it when presenting.
    ///
    /// If this is not empty, then it must include `present_mode`.
    ///
    /// The default value is empty.
    pub present_modes: SmallVec<[PresentMode; 4]>,

    /// The swapchain this one replaces, which is retired.
    ///
    /// The default value is `None`.
    pub old_swapchain: Option<vk::SwapchainKHR>,

    pub _ne: crate::NonExhaustive,
}

impl Default for SwapchainCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            flags: vk::SwapchainCreateFlagsKHR::empty(),
            min_image_count: 2,
            image_format: vk::Format::UNDEFINED,
            image_color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            image_extent: [0, 0],
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::empty(),
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            queue_family_indices: SmallVec::new(),
            present_mode: PresentMode::Fifo,
            present_modes: SmallVec::new(),
            old_swapchain: None,
            _ne: crate::NonExhaustive(()),
        }
    }
}

impl SwapchainCreateInfo {
    pub(crate) fn validate(&self) -> Result<(), Box<ValidationError>> {
        let &Self {
            flags: _,
            min_image_count,
            image_format,
            image_color_space: _,
            image_extent,
            image_array_layers,
            image_usage,
            image_sharing_mode,
            ref queue_family_indices,
            present_mode,
            ref present_modes,
            old_swapchain: _,
            _ne: _,
        } = self;

        if min_image_count == 0 {
            return Err(validation_error(
                "min_image_count",
                "is 0",
                &["VUID-VkSwapchainCreateInfoKHR-minImageCount-01272"],
            ));
        }

        if image_format == vk::Format::UNDEFINED {
            return Err(validation_error(
                "image_format",
                "is `Format::UNDEFINED`",
                &["VUID-VkSwapchainCreateInfoKHR-imageFormat-parameter"],
            ));
        }

        if image_extent.contains(&0) {
            return Err(validation_error(
                "image_extent",
                "one or more elements are zero",
                &["VUID-VkSwapchainCreateInfoKHR-imageExtent-01689"],
            ));
        }

        if image_array_layers == 0 {
            return Err(validation_error(
                "image_array_layers",
                "is zero",
                &["VUID-VkSwapchainCreateInfoKHR-imageArrayLayers-01275"],
            ));
        }

        if image_usage.is_empty() {
            return Err(validation_error(
                "image_usage",
                "is empty",
                &["VUID-VkSwapchainCreateInfoKHR-imageUsage-requiredbitmask"],
            ));
        }

        if image_sharing_mode == vk::SharingMode::CONCURRENT && queue_family_indices.len() < 2 {
            return Err(validation_error(
                "queue_family_indices",
                "`image_sharing_mode` is `SharingMode::CONCURRENT`, but fewer than two queue \
                families are given",
                &["VUID-VkSwapchainCreateInfoKHR-imageSharingMode-01278"],
            ));
        }

        if !present_modes.is_empty() && !present_modes.contains(&present_mode) {
            return Err(validation_error(
                "present_modes",
                "is not empty, but does not contain `present_mode`",
                &["VUID-VkSwapchainPresentModesCreateInfoEXT-presentMode-07764"],
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::SwapchainCreateInfo;
    use crate::{
        device::{DeviceDataCreateInfo, PresentFeatures},
        format::DRM_FORMAT_MOD_LINEAR,
        memory::DmaBufAllocator,
        platform::WindowSystem,
        swapchain::{
            backend::BackendKind, ImageStatus, PresentInfo, PresentMode, SwapchainPresentInfo,
            MAX_SWAPCHAIN_IMAGE_COUNT,
        },
        tests::{
            mock_device_from, mock_device_with, unreachable_bridge, MockAllocator, MockDriver,
            MockWindowSystem,
        },
        Validated, VulkanError,
    };
    use ash::vk::{self, Handle};
    use smallvec::smallvec;
    use std::{sync::Arc, time::Duration};

    fn create_info() -> SwapchainCreateInfo {
        SwapchainCreateInfo {
            min_image_count: 3,
            image_format: vk::Format::B8G8R8A8_UNORM,
            image_extent: [32, 16],
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ..Default::default()
        }
    }

    #[test]
    fn validation_rejects_bad_parameters() {
        assert!(create_info().validate().is_ok());

        let err = SwapchainCreateInfo {
            image_extent: [0, 16],
            ..create_info()
        }
        .validate()
        .unwrap_err();
        assert_eq!(err.context, "image_extent");

        let err = SwapchainCreateInfo {
            image_usage: vk::ImageUsageFlags::empty(),
            ..create_info()
        }
        .validate()
        .unwrap_err();
        assert_eq!(err.vuids, ["VUID-VkSwapchainCreateInfoKHR-imageUsage-requiredbitmask"]);

        let err = SwapchainCreateInfo {
            present_mode: PresentMode::Mailbox,
            present_modes: smallvec![PresentMode::Fifo],
            ..create_info()
        }
        .validate()
        .unwrap_err();
        assert_eq!(err.context, "present_modes");

        assert!(SwapchainCreateInfo {
            image_sharing_mode: vk::SharingMode::CONCURRENT,
            queue_family_indices: smallvec![0],
            ..create_info()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn created_images_are_all_free() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device_with(driver.clone(), None, None);
        let surface = Arc::new(MockWindowSystem::new());

        let handle = device
            .create_swapchain(surface as Arc<dyn WindowSystem>, create_info())
            .unwrap();
        let swapchain = device.swapchain(handle).unwrap();

        assert_eq!(swapchain.backend_kind(), BackendKind::Shm);
        assert_eq!(swapchain.image_count(), 3);
        assert_eq!(swapchain.images().len(), 3);
        for index in 0..3 {
            assert_eq!(swapchain.image_status(index), Some(ImageStatus::Free));
        }
        assert_eq!(swapchain.status(), Ok(()));
        assert_eq!(swapchain.present_modes(), &[PresentMode::Fifo]);
    }

    #[test]
    fn image_count_is_clamped() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device_with(driver, None, None);
        let surface: Arc<dyn WindowSystem> = Arc::new(MockWindowSystem::new());

        let handle = device
            .create_swapchain(
                surface,
                SwapchainCreateInfo {
                    min_image_count: 50,
                    ..create_info()
                },
            )
            .unwrap();
        assert_eq!(
            device.swapchain(handle).unwrap().image_count(),
            MAX_SWAPCHAIN_IMAGE_COUNT
        );
    }

    #[test]
    fn dmabuf_backend_is_chosen_when_the_window_accepts_a_modifier() {
        let driver = Arc::new(MockDriver::new());
        driver.state().modifiers = vec![(0, 1, true)];
        let device = mock_device_with(
            driver,
            Some(Arc::new(MockAllocator::new()) as Arc<dyn DmaBufAllocator>),
            None,
        );
        let surface = Arc::new(MockWindowSystem::new());
        surface.state().modifiers = vec![0];

        let handle = device
            .create_swapchain(surface.clone() as Arc<dyn WindowSystem>, create_info())
            .unwrap();
        assert_eq!(
            device.swapchain(handle).unwrap().backend_kind(),
            BackendKind::DmaBuf
        );
        assert_eq!(surface.state().imported.len(), 3);
    }

    #[test]
    fn missing_shm_and_dmabuf_fails_creation() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device_with(driver, None, None);
        let surface = Arc::new(MockWindowSystem::new());
        surface.state().supports_shm = false;

        let err = device
            .create_swapchain(surface as Arc<dyn WindowSystem>, create_info())
            .unwrap_err();
        assert!(matches!(
            err,
            Validated::Error(VulkanError::InitializationFailed)
        ));
    }

    #[test]
    fn image_creation_failure_releases_earlier_images() {
        let driver = Arc::new(MockDriver::new());
        driver.state().fail_image_create_at = Some(2);
        let device = mock_device_with(driver.clone(), None, None);
        let surface = Arc::new(MockWindowSystem::new());

        let err = device
            .create_swapchain(surface.clone() as Arc<dyn WindowSystem>, create_info())
            .unwrap_err();
        assert!(matches!(err, Validated::Error(VulkanError::OutOfDeviceMemory)));

        let state = driver.state();
        assert_eq!(state.destroyed_images.len(), 2);
        assert_eq!(state.freed.len(), 2);
        assert_eq!(surface.state().detached.len(), 2);
    }

    #[test]
    fn teardown_invalidates_every_image() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device_with(driver.clone(), None, None);
        let surface = Arc::new(MockWindowSystem::new());

        let handle = device
            .create_swapchain(surface as Arc<dyn WindowSystem>, create_info())
            .unwrap();
        let swapchain = device.swapchain(handle).unwrap();
        let shared = swapchain.shared().clone();
        drop(swapchain);

        device.destroy_swapchain(handle);

        let state = shared.state.lock();
        assert!(!state.running);
        assert_eq!(state.images.count(ImageStatus::Invalid), 3);
        assert_eq!(driver.state().destroyed_images.len(), 3);
    }

    #[test]
    fn old_swapchain_is_retired() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device_with(driver, None, None);
        let surface: Arc<dyn WindowSystem> = Arc::new(MockWindowSystem::new());

        let old = device
            .create_swapchain(surface.clone(), create_info())
            .unwrap();
        let new = device
            .create_swapchain(
                surface,
                SwapchainCreateInfo {
                    old_swapchain: Some(old),
                    ..create_info()
                },
            )
            .unwrap();

        assert_ne!(old.as_raw(), new.as_raw());
        assert!(device.swapchain(old).unwrap().is_retired());
        assert!(!device.swapchain(new).unwrap().is_retired());
    }

    #[test]
    fn bridge_failure_falls_back_on_recreation() {
        let driver = Arc::new(MockDriver::new());
        driver.state().modifiers = vec![(DRM_FORMAT_MOD_LINEAR, 1, true)];
        let bridge = unreachable_bridge();
        let device = mock_device_with(
            driver,
            Some(Arc::new(MockAllocator::new()) as Arc<dyn DmaBufAllocator>),
            Some(bridge.clone()),
        );
        let surface: Arc<dyn WindowSystem> = Arc::new(MockWindowSystem::new());

        let old = device
            .create_swapchain(
                surface.clone(),
                SwapchainCreateInfo {
                    present_mode: PresentMode::Mailbox,
                    ..create_info()
                },
            )
            .unwrap();
        let swapchain = device.swapchain(old).unwrap();
        assert_eq!(swapchain.backend_kind(), BackendKind::Bridge);
        assert_eq!(swapchain.image_count(), MAX_SWAPCHAIN_IMAGE_COUNT);
        assert_eq!(swapchain.present_mode(), PresentMode::Fifo);

        let acquired = swapchain
            .acquire_next_image(Some(Duration::ZERO), vk::Semaphore::null(), vk::Fence::null())
            .unwrap();
        let present_info = PresentInfo {
            swapchain_infos: smallvec![SwapchainPresentInfo::swapchain_image_index(
                old,
                acquired.image_index
            )],
            ..Default::default()
        };
        let results = device.queue_present(vk::Queue::from_raw(1), &present_info);
        assert!(matches!(
            results.results[0],
            Err(Validated::Error(VulkanError::OutOfDate))
        ));
        assert!(bridge.is_unavailable());
        assert_eq!(swapchain.status(), Err(VulkanError::OutOfDate));

        let new = device
            .create_swapchain(
                surface,
                SwapchainCreateInfo {
                    old_swapchain: Some(old),
                    ..create_info()
                },
            )
            .unwrap();
        assert_eq!(
            device.swapchain(new).unwrap().backend_kind(),
            BackendKind::Shm
        );
    }

    #[test]
    fn bridge_downgrade_is_reflected_in_present_modes() {
        let driver = Arc::new(MockDriver::new());
        driver.state().modifiers = vec![(DRM_FORMAT_MOD_LINEAR, 1, true)];
        let bridge = unreachable_bridge();
        let device = mock_device_from(
            driver,
            DeviceDataCreateInfo {
                enabled_features: PresentFeatures {
                    swapchain_maintenance1: true,
                    ..Default::default()
                },
                dmabuf_allocator: Some(Arc::new(MockAllocator::new()) as Arc<dyn DmaBufAllocator>),
                bridge: Some(bridge.clone()),
                ..Default::default()
            },
        );
        let surface: Arc<dyn WindowSystem> = Arc::new(MockWindowSystem::new());

        let handle = device
            .create_swapchain(
                surface,
                SwapchainCreateInfo {
                    present_mode: PresentMode::Mailbox,
                    ..create_info()
                },
            )
            .unwrap();
        let swapchain = device.swapchain(handle).unwrap();
        assert_eq!(swapchain.backend_kind(), BackendKind::Bridge);
        assert_eq!(swapchain.present_mode(), PresentMode::Fifo);
        assert_eq!(swapchain.present_modes(), &[PresentMode::Fifo]);

        let acquired = swapchain
            .acquire_next_image(Some(Duration::ZERO), vk::Semaphore::null(), vk::Fence::null())
            .unwrap();
        let present_info = PresentInfo {
            swapchain_infos: smallvec![SwapchainPresentInfo {
                present_mode: Some(PresentMode::Mailbox),
                ..SwapchainPresentInfo::swapchain_image_index(handle, acquired.image_index)
            }],
            ..Default::default()
        };
        let results = device.queue_present(vk::Queue::from_raw(1), &present_info);
        assert!(matches!(
            results.results[0],
            Err(Validated::ValidationError(_))
        ));
        assert!(!bridge.is_unavailable());
        assert_eq!(
            swapchain.image_status(acquired.image_index),
            Some(ImageStatus::Acquired)
        );
    }
}
