// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{create_dmabuf_image, Delivery, ImageBacking, ImageResources};
use crate::{
    device::DeviceData,
    memory::{DmaBufAllocator, DmaBufFormat, ExternalMemory},
    platform::{DmaBufPixmapInfo, WindowSystem},
    swapchain::SwapchainCreateInfo,
    VulkanError,
};
use std::sync::Arc;

/// Presents pixmaps created from each image's DMA-buf, without copying.
pub(crate) struct DmaBufPresenter {
    surface: Arc<dyn WindowSystem>,
    allocator: Arc<dyn DmaBufAllocator>,
    format: DmaBufFormat,
    depth: u8,
    bpp: u8,
}

impl DmaBufPresenter {
    pub(crate) fn new(
        surface: Arc<dyn WindowSystem>,
        allocator: Arc<dyn DmaBufAllocator>,
        format: DmaBufFormat,
        depth: u8,
        bpp: u8,
    ) -> Self {
        DmaBufPresenter {
            surface,
            allocator,
            format,
            depth,
            bpp,
        }
    }

    pub(crate) fn create_image_resources(
        &self,
        device: &Arc<DeviceData>,
        create_info: &SwapchainCreateInfo,
    ) -> Result<ImageResources, VulkanError> {
        let allocation = self
            .allocator
            .allocate(&self.format, create_info.image_extent)?;
        let memory = ExternalMemory::from_dmabuf(device.clone(), allocation);

        create_dmabuf_image(device, create_info, memory, |memory| {
            let allocation = memory.dmabuf().ok_or(VulkanError::InvalidExternalHandle)?;
            let pixmap = self.surface.import_dmabuf(&DmaBufPixmapInfo {
                extent: create_info.image_extent,
                depth: self.depth,
                bpp: self.bpp,
                modifier: allocation.format.modifier,
                planes: &allocation.planes,
            })?;

            Ok(ImageBacking::Pixmap(PixmapHandle {
                surface: self.surface.clone(),
                pixmap,
            }))
        })
    }

    pub(crate) fn present(
        &self,
        resources: &ImageResources,
        serial: u32,
    ) -> Result<Delivery, VulkanError> {
        let ImageBacking::Pixmap(pixmap) = &resources.backing else {
            log::error!("image {:?} has no pixmap", resources.image);
            return Err(VulkanError::Unknown);
        };

        self.surface.present_pixmap(pixmap.id(), serial)?;

        Ok(Delivery::Pending)
    }
}

/// A window-system pixmap, freed on drop.
pub(crate) struct PixmapHandle {
    surface: Arc<dyn WindowSystem>,
    pixmap: u32,
}

impl PixmapHandle {
    #[inline]
    pub(crate) fn id(&self) -> u32 {
        self.pixmap
    }
}

impl Drop for PixmapHandle {
    fn drop(&mut self) {
        self.surface.free_pixmap(self.pixmap);
    }
}
