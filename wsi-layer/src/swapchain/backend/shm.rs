// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::{create_host_image, Delivery, ImageBacking, ImageResources};
use crate::{
    device::DeviceData, memory::page_size, platform::WindowSystem,
    swapchain::SwapchainCreateInfo, VulkanError,
};
use ash::vk;
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    ptr::{self, NonNull},
    sync::Arc,
};

const BYTES_PER_PIXEL: usize = 4;

/// Presents by copying each image into a shared-memory segment the window system reads.
pub(crate) struct ShmPresenter {
    surface: Arc<dyn WindowSystem>,
    depth: u8,
}

impl ShmPresenter {
    pub(crate) fn new(surface: Arc<dyn WindowSystem>, depth: u8) -> Self {
        ShmPresenter { surface, depth }
    }

    pub(crate) fn create_image_resources(
        &self,
        device: &Arc<DeviceData>,
        create_info: &SwapchainCreateInfo,
    ) -> Result<ImageResources, VulkanError> {
        let [width, height] = create_info.image_extent;
        let size = width as usize * height as usize * BYTES_PER_PIXEL;

        create_host_image(device, create_info, |_| {
            ShmSegment::new(self.surface.clone(), size).map(ImageBacking::Shm)
        })
    }

    pub(crate) fn present(
        &self,
        resources: &mut ImageResources,
        serial: u32,
        extent: [u32; 2],
    ) -> Result<Delivery, VulkanError> {
        let ImageBacking::Shm(segment) = &resources.backing else {
            log::error!("image {:?} has no shared-memory segment", resources.image);
            return Err(VulkanError::Unknown);
        };

        let layout = *resources
            .memory
            .subresource_layout()
            .ok_or(VulkanError::Unknown)?;
        let src = resources.memory.map()?;

        unsafe { segment.copy_from_image(src, &layout, extent) };

        self.surface
            .put_shm_image(segment.id(), extent, self.depth, serial)?;

        Ok(Delivery::Pending)
    }
}

/// A SysV shared-memory segment attached to the window system.
///
/// The segment is marked for removal as soon as the window system has attached it, so that it
/// does not outlive the process.
pub(crate) struct ShmSegment {
    surface: Arc<dyn WindowSystem>,
    segment: u32,
    addr: NonNull<u8>,
    size: usize,
}

// The mapping is only written under the swapchain's present lock.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Creates a segment of at least `size` bytes, rounded up to the page size.
    pub(crate) fn new(surface: Arc<dyn WindowSystem>, size: usize) -> Result<Self, VulkanError> {
        let page_size = page_size() as usize;
        let size = size.max(1).div_ceil(page_size) * page_size;

        let shmid = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };

        if shmid < 0 {
            log::error!(
                "shmget of {} bytes failed: {}",
                size,
                std::io::Error::last_os_error(),
            );
            return Err(VulkanError::OutOfHostMemory);
        }

        let addr = unsafe { libc::shmat(shmid, ptr::null(), 0) };

        if addr as isize == -1 {
            log::error!("shmat failed: {}", std::io::Error::last_os_error());
            unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) };
            return Err(VulkanError::OutOfHostMemory);
        }

        let segment = surface.attach_shm(shmid);
        unsafe { libc::shmctl(shmid, libc::IPC_RMID, ptr::null_mut()) };

        let segment = match segment {
            Ok(segment) => segment,
            Err(err) => {
                unsafe { libc::shmdt(addr) };
                return Err(err);
            }
        };

        Ok(ShmSegment {
            surface,
            segment,
            addr: NonNull::new(addr.cast::<u8>()).ok_or(VulkanError::OutOfHostMemory)?,
            size,
        })
    }

    /// The window system's id of the segment.
    #[inline]
    pub(crate) fn id(&self) -> u32 {
        self.segment
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Copies `extent` pixels of the image at `src` into the segment, packed.
    ///
    /// # Safety
    ///
    /// - `src` must point to mapped image memory described by `layout`, holding at least
    ///   `extent` pixels.
    unsafe fn copy_from_image(
        &self,
        src: NonNull<u8>,
        layout: &vk::SubresourceLayout,
        extent: [u32; 2],
    ) {
        let [width, height] = extent.map(|x| x as usize);
        let dst_pitch = width * BYTES_PER_PIXEL;
        let row_bytes = dst_pitch.min(layout.row_pitch as usize);
        let rows = height.min(self.size / dst_pitch.max(1));

        let src = unsafe { src.as_ptr().add(layout.offset as usize) };
        let dst = self.addr.as_ptr();

        for row in 0..rows {
            unsafe {
                ptr::copy_nonoverlapping(
                    src.add(row * layout.row_pitch as usize),
                    dst.add(row * dst_pitch),
                    row_bytes,
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn contents(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.addr.as_ptr(), self.size) }
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        self.surface.detach_shm(self.segment);

        if unsafe { libc::shmdt(self.addr.as_ptr().cast()) } != 0 {
            log::warn!(
                "shmdt of segment {:#x} failed: {}",
                self.segment,
                std::io::Error::last_os_error(),
            );
        }
    }
}

impl Debug for ShmSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("ShmSegment")
            .field("segment", &self.segment)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{ShmPresenter, ShmSegment};
    use crate::{
        memory::page_size,
        platform::WindowSystem,
        swapchain::{
            backend::{Delivery, ImageBacking},
            SwapchainCreateInfo,
        },
        tests::{mock_device, MockDriver, MockWindowSystem},
    };
    use ash::vk;
    use std::sync::Arc;

    #[test]
    fn segment_is_page_rounded_and_detached_on_drop() {
        let surface = Arc::new(MockWindowSystem::new());
        let segment = ShmSegment::new(surface.clone(), 10).unwrap();
        assert_eq!(segment.size(), page_size() as usize);
        assert_eq!(surface.state().attached.len(), 1);

        let id = segment.id();
        drop(segment);
        assert_eq!(surface.state().detached, [id]);
    }

    #[test]
    fn present_copies_rows_and_tags_serial() {
        let driver = Arc::new(MockDriver::new());
        let device = mock_device(driver.clone());
        let surface = Arc::new(MockWindowSystem::new());
        let presenter = ShmPresenter::new(surface.clone() as Arc<dyn WindowSystem>, 24);
        let create_info = SwapchainCreateInfo {
            image_format: vk::Format::B8G8R8A8_UNORM,
            image_extent: [4, 2],
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            ..Default::default()
        };

        let mut resources = presenter
            .create_image_resources(&device, &create_info)
            .unwrap();
        assert!(resources.memory.is_host_visible());
        // HOST_VISIBLE | HOST_COHERENT | HOST_CACHED
        assert_eq!(driver.state().allocations[0].memory_type_index, 2);

        let pixels = resources.memory.map().unwrap();
        for i in 0..32 {
            unsafe { pixels.as_ptr().add(i).write(i as u8) };
        }

        let delivery = presenter.present(&mut resources, 77, [4, 2]).unwrap();
        assert_eq!(delivery, Delivery::Pending);

        let ImageBacking::Shm(segment) = &resources.backing else {
            panic!("no segment");
        };
        let expected: Vec<u8> = (0..32).collect();
        assert_eq!(&segment.contents()[..32], expected.as_slice());

        let puts = surface.state().shm_puts.clone();
        assert_eq!(puts, [(segment.id(), 77)]);
    }
}
