// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Binding swapchain images to external or host-visible memory.
//!
//! An [`ExternalMemory`] owns everything backing one swapchain image: the device memory objects,
//! and for DMA-buf images the [`DmaBufAllocation`] whose descriptors were imported.
//!
//! # DMA-buf images
//!
//! Importing a descriptor hands it to the driver, so the binder imports a duplicate and keeps the
//! original, which is later given to the window system or the bridge. A disjoint image gets one
//! memory object per distinct descriptor, and planes sharing a descriptor share the memory
//! object. A non-disjoint image is imported from a single descriptor; if its planes reference
//! more than one, the import fails with `InvalidExternalHandle`.
//!
//! # Host-visible images
//!
//! Images presented through shared memory are linear and backed by memory the CPU can map. The
//! memory type is chosen by trying the optimal property flags first and the required ones after.

use super::{find_memory_type, DmaBufAllocation};
use crate::{device::DeviceData, fns::PlaneMemoryBind, DeviceSize, VulkanError};
use ash::vk;
use nix::unistd::{dup, lseek, Whence};
use smallvec::SmallVec;
use std::{
    fmt::{Debug, Error as FmtError, Formatter},
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
    ptr::NonNull,
    sync::Arc,
};

const DMA_BUF_HANDLE_TYPE: vk::ExternalMemoryHandleTypeFlags =
    vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT;

const MEMORY_PLANE_ASPECTS: [vk::ImageAspectFlags; 4] = [
    vk::ImageAspectFlags::MEMORY_PLANE_0_EXT,
    vk::ImageAspectFlags::MEMORY_PLANE_1_EXT,
    vk::ImageAspectFlags::MEMORY_PLANE_2_EXT,
    vk::ImageAspectFlags::MEMORY_PLANE_3_EXT,
];

/// The memory of one swapchain image.
pub struct ExternalMemory {
    device: Arc<DeviceData>,
    memories: SmallVec<[vk::DeviceMemory; 4]>,
    kind: MemoryKind,
}

enum MemoryKind {
    DmaBuf {
        allocation: DmaBufAllocation,
    },
    HostVisible {
        required: vk::MemoryPropertyFlags,
        optimal: vk::MemoryPropertyFlags,
        layout: vk::SubresourceLayout,
        mapped: Option<NonNull<u8>>,
    },
}

// The mapped pointer is only dereferenced by the owner of the swapchain image, under the
// swapchain's present lock.
unsafe impl Send for ExternalMemory {}
unsafe impl Sync for ExternalMemory {}

/// What [`ExternalMemory::release`] gave back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReleaseStats {
    pub memories_freed: usize,
    pub fds_closed: usize,
}

impl ExternalMemory {
    /// Memory that will be imported from `allocation`.
    pub fn from_dmabuf(device: Arc<DeviceData>, allocation: DmaBufAllocation) -> Self {
        ExternalMemory {
            device,
            memories: SmallVec::new(),
            kind: MemoryKind::DmaBuf { allocation },
        }
    }

    /// Memory that will be allocated from a host-visible type.
    ///
    /// `optimal` is tried first, then `required`.
    pub fn configure_for_host_visible(
        device: Arc<DeviceData>,
        required: vk::MemoryPropertyFlags,
        optimal: vk::MemoryPropertyFlags,
    ) -> Self {
        ExternalMemory {
            device,
            memories: SmallVec::new(),
            kind: MemoryKind::HostVisible {
                required,
                optimal,
                layout: vk::SubresourceLayout::default(),
                mapped: None,
            },
        }
    }

    #[inline]
    pub fn is_host_visible(&self) -> bool {
        matches!(self.kind, MemoryKind::HostVisible { .. })
    }

    /// Returns whether the image binds each memory plane separately.
    #[inline]
    pub fn is_disjoint(&self) -> bool {
        match &self.kind {
            MemoryKind::DmaBuf { allocation } => allocation.is_disjoint,
            MemoryKind::HostVisible { .. } => false,
        }
    }

    /// The DMA-buf being imported, if this is DMA-buf memory.
    #[inline]
    pub fn dmabuf(&self) -> Option<&DmaBufAllocation> {
        match &self.kind {
            MemoryKind::DmaBuf { allocation } => Some(allocation),
            MemoryKind::HostVisible { .. } => None,
        }
    }

    /// The device memory objects, once imported or allocated.
    #[inline]
    pub fn memories(&self) -> &[vk::DeviceMemory] {
        &self.memories
    }

    /// Plane layouts to create a DMA-buf image with, from the allocation's offsets and strides.
    pub fn plane_layouts(&self) -> SmallVec<[vk::SubresourceLayout; 4]> {
        self.dmabuf()
            .map(|allocation| {
                allocation
                    .planes
                    .iter()
                    .map(|plane| vk::SubresourceLayout {
                        offset: DeviceSize::from(plane.offset),
                        row_pitch: DeviceSize::from(plane.stride),
                        ..Default::default()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Layout of the host-visible image, valid after [`allocate_and_bind`].
    ///
    /// [`allocate_and_bind`]: Self::allocate_and_bind
    #[inline]
    pub fn subresource_layout(&self) -> Option<&vk::SubresourceLayout> {
        match &self.kind {
            MemoryKind::HostVisible { layout, .. } => Some(layout),
            MemoryKind::DmaBuf { .. } => None,
        }
    }

    /// Gives `image` its memory: imports and binds DMA-buf memory, or allocates and binds
    /// host-visible memory.
    pub fn allocate_and_bind(&mut self, image: vk::Image) -> Result<(), VulkanError> {
        match self.kind {
            MemoryKind::DmaBuf { .. } => self.import_memory_and_bind(image),
            MemoryKind::HostVisible { .. } => self.allocate_host_visible_and_bind(image),
        }
    }

    /// Imports the DMA-buf planes and binds them to `image`.
    pub fn import_memory_and_bind(&mut self, image: vk::Image) -> Result<(), VulkanError> {
        self.import_plane_memories()?;
        self.bind_swapchain_image_memory(image)
    }

    /// Imports each distinct plane descriptor as one memory object.
    ///
    /// If any import fails, the memory objects already imported are freed.
    pub fn import_plane_memories(&mut self) -> Result<(), VulkanError> {
        let MemoryKind::DmaBuf { allocation } = &self.kind else {
            return Err(VulkanError::InvalidExternalHandle);
        };

        let fds = allocation.distinct_fds();

        if fds.is_empty() {
            log::error!("DMA-buf allocation has no valid plane descriptor");
            return Err(VulkanError::InvalidExternalHandle);
        }

        if !allocation.is_disjoint && fds.len() > 1 {
            log::error!(
                "non-disjoint DMA-buf references {} descriptors, expected 1",
                fds.len(),
            );
            return Err(VulkanError::InvalidExternalHandle);
        }

        let driver = self.device.driver().clone();
        let mut memories = SmallVec::new();

        for &fd in &fds {
            match import_fd(&self.device, fd) {
                Ok(memory) => memories.push(memory),
                Err(err) => {
                    for memory in memories {
                        driver.free_memory(memory);
                    }

                    return Err(err);
                }
            }
        }

        self.memories = memories;

        Ok(())
    }

    /// Binds the memory to `image`.
    ///
    /// This is also used for images the application creates with a swapchain as their memory
    /// source, which alias the swapchain's own image.
    pub fn bind_swapchain_image_memory(&self, image: vk::Image) -> Result<(), VulkanError> {
        let driver = self.device.driver();

        let Some(&first_memory) = self.memories.first() else {
            log::error!("binding image {:?} before its memory was created", image);
            return Err(VulkanError::Unknown);
        };

        match &self.kind {
            MemoryKind::DmaBuf { allocation } if allocation.is_disjoint => {
                let fds = allocation.distinct_fds();
                let binds: SmallVec<[_; 4]> = fds
                    .iter()
                    .zip(&self.memories)
                    .zip(MEMORY_PLANE_ASPECTS)
                    .map(|((&fd, &memory), aspect)| {
                        let offset = allocation
                            .planes
                            .iter()
                            .find(|plane| plane.fd == fd)
                            .map_or(0, |plane| plane.offset);

                        PlaneMemoryBind {
                            image,
                            memory,
                            offset: DeviceSize::from(offset),
                            aspect,
                        }
                    })
                    .collect();

                driver.bind_image_memory2(&binds)
            }
            MemoryKind::DmaBuf { allocation } => {
                let offset = allocation.planes.first().map_or(0, |plane| plane.offset);

                driver.bind_image_memory(image, first_memory, DeviceSize::from(offset))
            }
            MemoryKind::HostVisible { .. } => driver.bind_image_memory(image, first_memory, 0),
        }
    }

    fn allocate_host_visible_and_bind(&mut self, image: vk::Image) -> Result<(), VulkanError> {
        let MemoryKind::HostVisible {
            required,
            optimal,
            ref mut layout,
            ..
        } = self.kind
        else {
            return Err(VulkanError::Unknown);
        };

        let driver = self.device.driver().clone();
        let requirements = driver.image_memory_requirements(image);
        let memory_properties = self.device.memory_properties();

        let memory_type_index = [optimal, required]
            .into_iter()
            .find_map(|flags| {
                find_memory_type(memory_properties, requirements.memory_type_bits, flags)
            })
            .ok_or_else(|| {
                log::error!(
                    "no memory type with {:?} for host-visible image (type bits {:#b})",
                    required,
                    requirements.memory_type_bits,
                );
                VulkanError::FormatNotSupported
            })?;

        let memory = driver.allocate_memory(requirements.size, memory_type_index)?;

        if let Err(err) = driver.bind_image_memory(image, memory, 0) {
            driver.free_memory(memory);
            return Err(err);
        }

        *layout = driver.image_subresource_layout(image, vk::ImageAspectFlags::COLOR);
        self.memories.push(memory);

        Ok(())
    }

    /// Maps the host-visible memory. Mapping an already mapped memory returns the same pointer.
    pub fn map(&mut self) -> Result<NonNull<u8>, VulkanError> {
        let MemoryKind::HostVisible { mapped, .. } = &mut self.kind else {
            return Err(VulkanError::MemoryMapFailed);
        };

        if let Some(ptr) = *mapped {
            return Ok(ptr);
        }

        let &memory = self.memories.first().ok_or(VulkanError::MemoryMapFailed)?;
        let ptr = self.device.driver().map_memory(memory)?;
        let ptr = NonNull::new(ptr.cast::<u8>()).ok_or(VulkanError::MemoryMapFailed)?;
        *mapped = Some(ptr);

        Ok(ptr)
    }

    /// Unmaps the host-visible memory if it is mapped.
    pub fn unmap(&mut self) {
        if let MemoryKind::HostVisible { mapped, .. } = &mut self.kind {
            if mapped.take().is_some() {
                if let Some(&memory) = self.memories.first() {
                    self.device.driver().unmap_memory(memory);
                }
            }
        }
    }

    /// Frees every memory object and closes the DMA-buf descriptors.
    pub fn release(&mut self) -> ReleaseStats {
        self.unmap();

        let driver = self.device.driver();
        let memories_freed = self.memories.len();

        for memory in self.memories.drain(..) {
            driver.free_memory(memory);
        }

        let fds_closed = match &mut self.kind {
            MemoryKind::DmaBuf { allocation } => allocation.close_fds(),
            MemoryKind::HostVisible { .. } => 0,
        };

        ReleaseStats {
            memories_freed,
            fds_closed,
        }
    }
}

impl Drop for ExternalMemory {
    fn drop(&mut self) {
        self.release();
    }
}

impl Debug for ExternalMemory {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        let mut debug = f.debug_struct("ExternalMemory");
        debug.field("memories", &self.memories);

        match &self.kind {
            MemoryKind::DmaBuf { allocation } => debug.field("dmabuf", allocation),
            MemoryKind::HostVisible {
                required, optimal, ..
            } => debug
                .field("required", required)
                .field("optimal", optimal),
        };

        debug.finish_non_exhaustive()
    }
}

// Imports a duplicate of `fd` into the first memory type the driver accepts for it.
fn import_fd(device: &DeviceData, fd: RawFd) -> Result<vk::DeviceMemory, VulkanError> {
    let driver = device.driver();
    let memory_type_bits = driver.memory_fd_type_bits(DMA_BUF_HANDLE_TYPE, fd)?;

    if memory_type_bits == 0 {
        log::error!("driver accepts no memory type for DMA-buf fd {}", fd);
        return Err(VulkanError::InvalidExternalHandle);
    }

    let memory_type_index = memory_type_bits.trailing_zeros();

    let import_fd = dup(fd).map_err(|err| {
        log::error!("failed to dup DMA-buf fd {} for import: {}", fd, err);
        VulkanError::OutOfHostMemory
    })?;
    let import_fd = unsafe { OwnedFd::from_raw_fd(import_fd) };

    let size = match lseek(import_fd.as_raw_fd(), 0, Whence::SeekEnd) {
        Ok(size) if size > 0 => size as DeviceSize,
        Ok(_) => {
            log::error!("DMA-buf fd {} reports zero size", fd);
            return Err(VulkanError::OutOfHostMemory);
        }
        Err(err) => {
            log::error!("failed to get the size of DMA-buf fd {}: {}", fd, err);
            return Err(VulkanError::OutOfHostMemory);
        }
    };

    let memory = driver
        .import_memory_fd(
            DMA_BUF_HANDLE_TYPE,
            import_fd.as_raw_fd(),
            size,
            memory_type_index,
        )
        .inspect_err(|err| log::error!("failed to import DMA-buf fd {}: {}", fd, err))?;

    // The driver owns the duplicate once the import succeeded.
    let _ = import_fd.into_raw_fd();

    Ok(memory)
}
