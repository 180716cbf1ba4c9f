// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Presentation backends.
//!
//! A backend creates the resources of each swapchain image and gets presented images to the
//! window. The three backends differ in where image memory lives and in how a present is
//! delivered:
//!
//! | backend  | image memory               | present                          | completion        |
//! |----------|----------------------------|----------------------------------|-------------------|
//! | `Shm`    | host-visible, linear       | copy to a SysV segment           | window system     |
//! | `DmaBuf` | imported DMA-buf           | present a pixmap of the DMA-buf  | window system     |
//! | `Bridge` | imported DMA-buf           | send the descriptors to a socket | delayed release   |

pub(crate) use self::{bridge::BridgePresenter, dmabuf::DmaBufPresenter, shm::ShmPresenter};
use self::{dmabuf::PixmapHandle, shm::ShmSegment};
use super::SwapchainCreateInfo;
use crate::{
    device::DeviceData,
    fns::{ExternalImageQuery, ImageCreateDesc, ImageTiling},
    format::{drm_fourcc_bpp, is_linear, vk_to_drm_fourcc},
    memory::{DmaBufAllocator, DmaBufFormat, ExternalMemory},
    platform::WindowSystem,
    sync::PresentFence,
    VulkanError,
};
use ash::vk;
use smallvec::SmallVec;
use std::sync::Arc;

pub mod bridge;
mod dmabuf;
mod shm;

/// The kind of backend a swapchain presents with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Shm,
    DmaBuf,
    Bridge,
}

/// What happened to an image handed to a backend.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// The window system reads the image until it reports completion of the serial.
    Pending,
    /// The backend no longer needs these images, which may not include the presented one.
    Released(SmallVec<[u32; 4]>),
}

/// Everything a swapchain image owns.
pub(crate) struct ImageResources {
    pub(crate) image: vk::Image,
    pub(crate) memory: ExternalMemory,
    pub(crate) fence: PresentFence,
    pub(crate) backing: ImageBacking,
    device: Arc<DeviceData>,
}

/// The window-system object an image is presented through.
pub(crate) enum ImageBacking {
    None,
    Shm(ShmSegment),
    Pixmap(PixmapHandle),
}

impl Drop for ImageResources {
    fn drop(&mut self) {
        if let Err(err) = self.fence.wait_payload(None) {
            log::warn!("failed to wait for image {:?} before release: {}", self.image, err);
        }

        self.backing = ImageBacking::None;
        self.device.driver().destroy_image(self.image);
        self.memory.release();
    }
}

pub(crate) enum PresentBackend {
    Shm(ShmPresenter),
    DmaBuf(DmaBufPresenter),
    Bridge(BridgePresenter),
}

impl PresentBackend {
    /// Picks the backend of a new swapchain: the bridge if it is requested and available, then
    /// DMA-buf pixmaps if the window system and the device agree on a format, then shared
    /// memory.
    pub(crate) fn select(
        device: &Arc<DeviceData>,
        surface: &Arc<dyn WindowSystem>,
        create_info: &SwapchainCreateInfo,
    ) -> Result<Self, VulkanError> {
        let allocator = device.dmabuf_allocator();

        if let (Some(client), Some(allocator)) = (device.bridge(), allocator) {
            if client.is_unavailable() {
                log::info!("bridge disabled after an earlier failure");
            } else {
                let candidates = probe_importable_formats(device, create_info);

                match select_format(
                    allocator.as_ref(),
                    &candidates,
                    client.config().prefer_linear,
                ) {
                    Some(format) => {
                        log::info!(
                            "window {:#x}: presenting through the bridge ({:?})",
                            surface.window_id(),
                            format,
                        );

                        return Ok(PresentBackend::Bridge(BridgePresenter::new(
                            client.clone(),
                            allocator.clone(),
                            surface.window_id(),
                            format,
                        )));
                    }
                    None => log::warn!("no DMA-buf format for the bridge, not using it"),
                }
            }
        }

        let geometry = surface.geometry()?;

        if let Some(allocator) = allocator {
            let bpp = vk_to_drm_fourcc(create_info.image_format)
                .and_then(drm_fourcc_bpp)
                .unwrap_or(0);
            let modifiers = if bpp != 0 {
                surface.dmabuf_modifiers(geometry.depth, bpp as u8)
            } else {
                Vec::new()
            };

            let candidates: SmallVec<[_; 8]> = probe_importable_formats(device, create_info)
                .into_iter()
                .filter(|format| modifiers.contains(&format.modifier))
                .collect();

            if let Some(format) = select_format(allocator.as_ref(), &candidates, false) {
                log::info!(
                    "window {:#x}: presenting DMA-buf pixmaps ({:?})",
                    surface.window_id(),
                    format,
                );

                return Ok(PresentBackend::DmaBuf(DmaBufPresenter::new(
                    surface.clone(),
                    allocator.clone(),
                    format,
                    geometry.depth,
                    bpp as u8,
                )));
            }
        }

        if surface.supports_shm() {
            log::info!("window {:#x}: presenting through shared memory", surface.window_id());

            return Ok(PresentBackend::Shm(ShmPresenter::new(
                surface.clone(),
                geometry.depth,
            )));
        }

        log::error!(
            "window {:#x}: no presentation backend is available",
            surface.window_id(),
        );

        Err(VulkanError::InitializationFailed)
    }

    #[inline]
    pub(crate) fn kind(&self) -> BackendKind {
        match self {
            PresentBackend::Shm(_) => BackendKind::Shm,
            PresentBackend::DmaBuf(_) => BackendKind::DmaBuf,
            PresentBackend::Bridge(_) => BackendKind::Bridge,
        }
    }

    /// Returns the bridge presenter, if this is the bridge.
    #[inline]
    pub(crate) fn bridge(&self) -> Option<&BridgePresenter> {
        match self {
            PresentBackend::Bridge(presenter) => Some(presenter),
            _ => None,
        }
    }

    pub(crate) fn create_image_resources(
        &self,
        device: &Arc<DeviceData>,
        create_info: &SwapchainCreateInfo,
    ) -> Result<ImageResources, VulkanError> {
        match self {
            PresentBackend::Shm(presenter) => presenter.create_image_resources(device, create_info),
            PresentBackend::DmaBuf(presenter) => {
                presenter.create_image_resources(device, create_info)
            }
            PresentBackend::Bridge(presenter) => {
                presenter.create_image_resources(device, create_info)
            }
        }
    }

    /// Hands the image to the window system, tagged with `serial`.
    pub(crate) fn present(
        &mut self,
        resources: &mut ImageResources,
        image_index: u32,
        serial: u32,
        extent: [u32; 2],
    ) -> Result<Delivery, VulkanError> {
        match self {
            PresentBackend::Shm(presenter) => presenter.present(resources, serial, extent),
            PresentBackend::DmaBuf(presenter) => presenter.present(resources, serial),
            PresentBackend::Bridge(presenter) => presenter.present(resources, image_index, extent),
        }
    }

    /// Returns the images held back for delayed release, emptying the queue.
    pub(crate) fn drain_delayed_release(&mut self) -> SmallVec<[u32; 4]> {
        match self {
            PresentBackend::Bridge(presenter) => presenter.drain_delayed_release(),
            _ => SmallVec::new(),
        }
    }

    /// Tells the window that no more frames will come.
    pub(crate) fn stop_stream(&self) {
        if let PresentBackend::Bridge(presenter) = self {
            presenter.stop_stream();
        }
    }
}

/// Lists the DRM modifiers of the swapchain format that the device can import a DMA-buf with,
/// for images of the swapchain's size and usage.
pub(crate) fn probe_importable_formats(
    device: &DeviceData,
    create_info: &SwapchainCreateInfo,
) -> Vec<DmaBufFormat> {
    let Some(fourcc) = vk_to_drm_fourcc(create_info.image_format) else {
        log::info!(
            "{:?} has no DRM fourcc, DMA-buf presentation unavailable",
            create_info.image_format,
        );
        return Vec::new();
    };

    let driver = device.driver();
    let mut formats = Vec::new();

    for properties in driver.drm_format_modifier_properties(create_info.image_format) {
        let disjoint_supported = properties
            .drm_format_modifier_tiling_features
            .contains(vk::FormatFeatureFlags::DISJOINT);
        let flags = if properties.drm_format_modifier_plane_count > 1 && disjoint_supported {
            vk::ImageCreateFlags::DISJOINT
        } else {
            vk::ImageCreateFlags::empty()
        };

        let query = ExternalImageQuery {
            format: create_info.image_format,
            modifier: properties.drm_format_modifier,
            flags,
            usage: create_info.image_usage,
            sharing_mode: create_info.image_sharing_mode,
            queue_family_indices: create_info.queue_family_indices.clone(),
        };

        let support = match driver.external_image_format_properties(&query) {
            Ok(Some(support)) => support,
            Ok(None) => continue,
            Err(err) => {
                log::debug!(
                    "modifier {:#x} query failed: {}",
                    properties.drm_format_modifier,
                    err,
                );
                continue;
            }
        };

        let limits = &support.image_format_properties;
        let [width, height] = create_info.image_extent;

        if !support
            .external_memory_features
            .contains(vk::ExternalMemoryFeatureFlags::IMPORTABLE)
            || limits.max_extent.width < width
            || limits.max_extent.height < height
            || limits.max_mip_levels < 1
            || limits.max_array_layers < create_info.image_array_layers
        {
            continue;
        }

        formats.push(DmaBufFormat {
            fourcc: fourcc as u32,
            modifier: properties.drm_format_modifier,
            plane_count: properties.drm_format_modifier_plane_count,
            disjoint_supported,
        });
    }

    formats
}

/// Orders the candidates by modifier preference: linear ones first if `prefer_linear` is set,
/// non-linear ones first otherwise. Returns the preferred subset followed by the rest.
pub(crate) fn prefer_modifiers(
    candidates: &[DmaBufFormat],
    prefer_linear: bool,
) -> (SmallVec<[DmaBufFormat; 8]>, SmallVec<[DmaBufFormat; 8]>) {
    candidates
        .iter()
        .copied()
        .partition(|format| is_linear(format.modifier) == prefer_linear)
}

fn select_format(
    allocator: &dyn DmaBufAllocator,
    candidates: &[DmaBufFormat],
    prefer_linear: bool,
) -> Option<DmaBufFormat> {
    if candidates.is_empty() {
        return None;
    }

    let (preferred, _) = prefer_modifiers(candidates, prefer_linear);

    if !preferred.is_empty() {
        if let Some(format) = allocator.select_format(&preferred) {
            return Some(format);
        }
    }

    allocator.select_format(candidates)
}

fn image_desc(create_info: &SwapchainCreateInfo, tiling: ImageTiling) -> ImageCreateDesc {
    let mut flags = vk::ImageCreateFlags::empty();

    if create_info
        .flags
        .contains(vk::SwapchainCreateFlagsKHR::MUTABLE_FORMAT)
    {
        flags |= vk::ImageCreateFlags::MUTABLE_FORMAT;
    }

    ImageCreateDesc {
        flags,
        format: create_info.image_format,
        extent: create_info.image_extent,
        array_layers: create_info.image_array_layers,
        usage: create_info.image_usage,
        sharing_mode: create_info.image_sharing_mode,
        queue_family_indices: create_info.queue_family_indices.clone(),
        tiling,
    }
}

/// Creates a swapchain image over `memory` and binds it.
pub(crate) fn create_dmabuf_image(
    device: &Arc<DeviceData>,
    create_info: &SwapchainCreateInfo,
    mut memory: ExternalMemory,
    backing: impl FnOnce(&ExternalMemory) -> Result<ImageBacking, VulkanError>,
) -> Result<ImageResources, VulkanError> {
    let Some(allocation) = memory.dmabuf() else {
        return Err(VulkanError::InvalidExternalHandle);
    };

    let mut desc = image_desc(
        create_info,
        ImageTiling::DrmFormatModifier {
            modifier: allocation.format.modifier,
            plane_layouts: memory.plane_layouts(),
        },
    );

    if memory.is_disjoint() {
        desc.flags |= vk::ImageCreateFlags::DISJOINT;
    }

    let driver = device.driver();
    let image = driver.create_image(&desc)?;

    if let Err(err) = memory.import_memory_and_bind(image) {
        driver.destroy_image(image);
        return Err(err);
    }

    finish_image(device, image, memory, backing)
}

/// Creates a linear swapchain image with host-visible memory.
pub(crate) fn create_host_image(
    device: &Arc<DeviceData>,
    create_info: &SwapchainCreateInfo,
    backing: impl FnOnce(&ExternalMemory) -> Result<ImageBacking, VulkanError>,
) -> Result<ImageResources, VulkanError> {
    let desc = image_desc(create_info, ImageTiling::Linear);
    let driver = device.driver();
    let image = driver.create_image(&desc)?;

    let mut memory = ExternalMemory::configure_for_host_visible(
        device.clone(),
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT
            | vk::MemoryPropertyFlags::HOST_CACHED,
    );

    if let Err(err) = memory.allocate_and_bind(image) {
        driver.destroy_image(image);
        return Err(err);
    }

    finish_image(device, image, memory, backing)
}

fn finish_image(
    device: &Arc<DeviceData>,
    image: vk::Image,
    memory: ExternalMemory,
    backing: impl FnOnce(&ExternalMemory) -> Result<ImageBacking, VulkanError>,
) -> Result<ImageResources, VulkanError> {
    let driver = device.driver();

    let fence = match PresentFence::new(device.clone()) {
        Ok(fence) => fence,
        Err(err) => {
            driver.destroy_image(image);
            return Err(err);
        }
    };

    let mut resources = ImageResources {
        image,
        memory,
        fence,
        backing: ImageBacking::None,
        device: device.clone(),
    };
    resources.backing = backing(&resources.memory)?;

    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::{prefer_modifiers, probe_importable_formats, select_format};
    use crate::{
        format::DRM_FORMAT_MOD_LINEAR,
        memory::DmaBufFormat,
        swapchain::SwapchainCreateInfo,
        tests::{mock_device, MockAllocator, MockDriver},
    };
    use ash::vk;
    use std::sync::Arc;

    const TILED: u64 = 0x0100_0000_0000_0001;

    fn format(modifier: u64) -> DmaBufFormat {
        DmaBufFormat {
            fourcc: drm_fourcc::DrmFourcc::Argb8888 as u32,
            modifier,
            plane_count: 1,
            disjoint_supported: false,
        }
    }

    fn create_info() -> SwapchainCreateInfo {
        SwapchainCreateInfo {
            image_format: vk::Format::B8G8R8A8_UNORM,
            image_extent: [64, 32],
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ..Default::default()
        }
    }

    #[test]
    fn modifier_preference_partitions() {
        let candidates = [format(TILED), format(DRM_FORMAT_MOD_LINEAR)];

        let (preferred, rest) = prefer_modifiers(&candidates, true);
        assert_eq!(preferred.as_slice(), &[format(DRM_FORMAT_MOD_LINEAR)]);
        assert_eq!(rest.as_slice(), &[format(TILED)]);

        let (preferred, _) = prefer_modifiers(&candidates, false);
        assert_eq!(preferred.as_slice(), &[format(TILED)]);
    }

    #[test]
    fn selection_falls_back_to_all_candidates() {
        // The allocator only handles linear buffers.
        let allocator = MockAllocator::linear_only();
        let candidates = [format(TILED), format(DRM_FORMAT_MOD_LINEAR)];

        assert_eq!(
            select_format(&allocator, &candidates, false),
            Some(format(DRM_FORMAT_MOD_LINEAR))
        );
        assert_eq!(select_format(&allocator, &[], false), None);
    }

    #[test]
    fn probe_keeps_importable_modifiers_within_limits() {
        let driver = Arc::new(MockDriver::new());
        {
            let mut state = driver.state();
            state.modifiers = vec![
                (DRM_FORMAT_MOD_LINEAR, 1, true),
                (TILED, 1, true),
                (0x0200_0000_0000_0002, 1, false),
            ];
            state.max_extent = [4096, 4096];
        }
        let device = mock_device(driver.clone());

        let formats = probe_importable_formats(&device, &create_info());
        let modifiers: Vec<_> = formats.iter().map(|f| f.modifier).collect();
        assert_eq!(modifiers, [DRM_FORMAT_MOD_LINEAR, TILED]);
        assert_eq!(formats[0].fourcc, drm_fourcc::DrmFourcc::Argb8888 as u32);

        driver.state().max_extent = [32, 32];
        assert!(probe_importable_formats(&device, &create_info()).is_empty());
    }

    #[test]
    fn probe_without_fourcc_is_empty() {
        let driver = Arc::new(MockDriver::new());
        driver.state().modifiers = vec![(DRM_FORMAT_MOD_LINEAR, 1, true)];
        let device = mock_device(driver);

        let create_info = SwapchainCreateInfo {
            image_format: vk::Format::R16G16B16A16_SFLOAT,
            ..create_info()
        };
        assert!(probe_importable_formats(&device, &create_info).is_empty());
    }
}
