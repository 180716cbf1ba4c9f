// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! DMA-buf allocation.

use crate::{
    format::{drm_fourcc_bpp, is_linear},
    VulkanError,
};
use drm_fourcc::{DrmFourcc, DrmModifier};
use gbm::BufferObjectFlags;
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    error::Error,
    fmt::{Debug, Display, Error as FmtError, Formatter},
    fs::{File, OpenOptions},
    io, iter,
    os::fd::{AsRawFd, IntoRawFd, RawFd},
    path::Path,
};

/// Path of the system DMA heap.
pub const DMA_HEAP_SYSTEM_PATH: &str = "/dev/dma_heap/system";

/// Path of the first DRM render node.
pub const DRM_RENDER_NODE_PATH: &str = "/dev/dri/renderD128";

const STRIDE_ALIGNMENT: u32 = 256;

/// A format/modifier pair that the device can import.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaBufFormat {
    /// DRM fourcc code.
    pub fourcc: u32,
    pub modifier: u64,
    /// Number of memory planes of the modifier.
    pub plane_count: u32,
    /// Whether the device can bind each plane to its own memory object.
    pub disjoint_supported: bool,
}

/// One plane of a DMA-buf allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaBufPlane {
    pub fd: RawFd,
    pub offset: u32,
    pub stride: u32,
}

/// A DMA-buf allocation. The plane file descriptors are owned by this object.
///
/// Several planes may share a descriptor. On drop, each distinct descriptor is closed once.
#[derive(Debug)]
pub struct DmaBufAllocation {
    pub format: DmaBufFormat,
    pub planes: SmallVec<[DmaBufPlane; 4]>,
    pub is_disjoint: bool,
}

impl DmaBufAllocation {
    /// Closes every distinct plane descriptor and marks all planes with `-1`.
    ///
    /// Returns the number of descriptors closed. Calling this again does nothing.
    pub fn close_fds(&mut self) -> usize {
        let mut closed = 0;

        for index in 0..self.planes.len() {
            let fd = self.planes[index].fd;

            if fd < 0 {
                continue;
            }

            if let Err(err) = nix::unistd::close(fd) {
                log::warn!("failed to close DMA-buf fd {}: {}", fd, err);
            }

            closed += 1;

            for plane in &mut self.planes[index..] {
                if plane.fd == fd {
                    plane.fd = -1;
                }
            }
        }

        closed
    }

    /// Returns the distinct descriptors, in order of their first plane.
    pub fn distinct_fds(&self) -> SmallVec<[RawFd; 4]> {
        let mut fds = SmallVec::new();

        for plane in &self.planes {
            if plane.fd >= 0 && !fds.contains(&plane.fd) {
                fds.push(plane.fd);
            }
        }

        fds
    }
}

impl Drop for DmaBufAllocation {
    fn drop(&mut self) {
        self.close_fds();
    }
}

/// Allocates DMA-bufs for swapchain images.
pub trait DmaBufAllocator: Send + Sync {
    /// Picks the format to allocate among `candidates`, or `None` if none can be allocated.
    fn select_format(&self, candidates: &[DmaBufFormat]) -> Option<DmaBufFormat>;

    /// Allocates a buffer of `extent` pixels in `format`.
    fn allocate(
        &self,
        format: &DmaBufFormat,
        extent: [u32; 2],
    ) -> Result<DmaBufAllocation, AllocationError>;
}

mod ioctl {
    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default)]
    pub struct DmaHeapAllocationData {
        pub len: u64,
        pub fd: u32,
        pub fd_flags: u32,
        pub heap_flags: u64,
    }

    nix::ioctl_readwrite!(dma_heap_alloc, b'H', 0, DmaHeapAllocationData);
}

/// Allocates linear single-plane buffers from a Linux DMA heap.
#[derive(Debug)]
pub struct DmaHeapAllocator {
    heap: File,
}

impl DmaHeapAllocator {
    /// Opens the system heap.
    #[inline]
    pub fn open() -> Result<Self, AllocationError> {
        Self::open_path(DMA_HEAP_SYSTEM_PATH)
    }

    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, AllocationError> {
        let heap = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(AllocationError::HeapUnavailable)?;

        Ok(DmaHeapAllocator { heap })
    }
}

impl DmaBufAllocator for DmaHeapAllocator {
    fn select_format(&self, candidates: &[DmaBufFormat]) -> Option<DmaBufFormat> {
        candidates
            .iter()
            .find(|format| linear_layout(format, [1, 1]).is_some())
            .copied()
    }

    fn allocate(
        &self,
        format: &DmaBufFormat,
        extent: [u32; 2],
    ) -> Result<DmaBufAllocation, AllocationError> {
        let (stride, len) = linear_layout(format, extent).ok_or(
            AllocationError::UnsupportedFormat {
                fourcc: format.fourcc,
                modifier: format.modifier,
            },
        )?;

        let mut data = ioctl::DmaHeapAllocationData {
            len,
            fd: 0,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            heap_flags: 0,
        };

        unsafe { ioctl::dma_heap_alloc(self.heap.as_raw_fd(), &mut data) }
            .map_err(AllocationError::AllocationFailed)?;

        log::debug!(
            "allocated {}x{} DMA-buf: fd {}, stride {}, {} bytes",
            extent[0],
            extent[1],
            data.fd,
            stride,
            len,
        );

        Ok(DmaBufAllocation {
            format: *format,
            planes: SmallVec::from_elem(
                DmaBufPlane {
                    fd: data.fd as RawFd,
                    offset: 0,
                    stride,
                },
                1,
            ),
            is_disjoint: false,
        })
    }
}

/// Allocates buffers through GBM on a DRM render node, with any modifier the GPU supports.
///
/// All planes of a buffer share one descriptor, so allocations are never disjoint.
pub struct GbmAllocator {
    device: Mutex<gbm::Device<File>>,
}

impl GbmAllocator {
    /// Opens the first render node.
    #[inline]
    pub fn open() -> Result<Self, AllocationError> {
        Self::open_path(DRM_RENDER_NODE_PATH)
    }

    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, AllocationError> {
        let node = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(AllocationError::DeviceUnavailable)?;
        let device = gbm::Device::new(node).map_err(AllocationError::DeviceUnavailable)?;

        Ok(GbmAllocator {
            device: Mutex::new(device),
        })
    }
}

impl Debug for GbmAllocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("GbmAllocator").finish_non_exhaustive()
    }
}

impl DmaBufAllocator for GbmAllocator {
    fn select_format(&self, candidates: &[DmaBufFormat]) -> Option<DmaBufFormat> {
        let device = self.device.lock();

        candidates
            .iter()
            .find(|format| {
                DrmFourcc::try_from(format.fourcc).is_ok_and(|fourcc| {
                    device.is_format_supported(fourcc, BufferObjectFlags::RENDERING)
                })
            })
            .copied()
    }

    fn allocate(
        &self,
        format: &DmaBufFormat,
        extent: [u32; 2],
    ) -> Result<DmaBufAllocation, AllocationError> {
        let unsupported = || AllocationError::UnsupportedFormat {
            fourcc: format.fourcc,
            modifier: format.modifier,
        };
        let fourcc = DrmFourcc::try_from(format.fourcc).map_err(|_| unsupported())?;

        let bo = self
            .device
            .lock()
            .create_buffer_object_with_modifiers2::<()>(
                extent[0],
                extent[1],
                fourcc,
                iter::once(DrmModifier::from(format.modifier)),
                BufferObjectFlags::RENDERING,
            )
            .map_err(AllocationError::BufferCreationFailed)?;

        let plane_count = bo.plane_count();
        if u64::from(bo.modifier()) != format.modifier || plane_count != format.plane_count {
            log::debug!(
                "GBM returned modifier {:#x} with {} planes, wanted {:#x} with {}",
                u64::from(bo.modifier()),
                plane_count,
                format.modifier,
                format.plane_count,
            );
            return Err(unsupported());
        }

        let fd = bo.fd().map_err(|_| AllocationError::ExportFailed)?;
        let planes = shared_fd_planes(
            fd.into_raw_fd(),
            (0..plane_count as i32).map(|plane| (bo.offset(plane), bo.stride_for_plane(plane))),
        );

        log::debug!(
            "allocated {}x{} GBM buffer: modifier {:#x}, planes {:?}",
            extent[0],
            extent[1],
            format.modifier,
            planes,
        );

        Ok(DmaBufAllocation {
            format: *format,
            planes,
            is_disjoint: false,
        })
    }
}

// One plane per `(offset, stride)`, all on `fd`.
fn shared_fd_planes(
    fd: RawFd,
    layouts: impl IntoIterator<Item = (u32, u32)>,
) -> SmallVec<[DmaBufPlane; 4]> {
    layouts
        .into_iter()
        .map(|(offset, stride)| DmaBufPlane { fd, offset, stride })
        .collect()
}

// Stride and total size of a linear single-plane buffer, if the format is one.
fn linear_layout(format: &DmaBufFormat, extent: [u32; 2]) -> Option<(u32, u64)> {
    if !is_linear(format.modifier) || format.plane_count != 1 {
        return None;
    }

    let fourcc = DrmFourcc::try_from(format.fourcc).ok()?;
    let bpp = drm_fourcc_bpp(fourcc)?;
    let stride = (extent[0].checked_mul(bpp)? / 8).checked_next_multiple_of(STRIDE_ALIGNMENT)?;
    let page_size = page_size();
    let len = (u64::from(stride) * u64::from(extent[1])).checked_next_multiple_of(page_size)?;

    Some((stride, len))
}

pub(crate) fn page_size() -> u64 {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map_or(4096, |size| size as u64)
}

/// Error that can happen when allocating a DMA-buf.
#[derive(Debug)]
pub enum AllocationError {
    /// The DMA heap could not be opened.
    HeapUnavailable(io::Error),

    /// The DRM render node could not be opened as a GBM device.
    DeviceUnavailable(io::Error),

    /// The allocator cannot produce buffers in this format.
    UnsupportedFormat { fourcc: u32, modifier: u64 },

    /// The allocation ioctl failed.
    AllocationFailed(nix::Error),

    /// GBM failed to create the buffer.
    BufferCreationFailed(io::Error),

    /// The buffer could not be exported as a DMA-buf.
    ExportFailed,
}

impl Error for AllocationError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::HeapUnavailable(err)
            | Self::DeviceUnavailable(err)
            | Self::BufferCreationFailed(err) => Some(err),
            Self::AllocationFailed(err) => Some(err),
            Self::UnsupportedFormat { .. } | Self::ExportFailed => None,
        }
    }
}

impl Display for AllocationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::HeapUnavailable(_) => write!(f, "the DMA heap could not be opened"),
            Self::DeviceUnavailable(_) => write!(f, "the DRM render node could not be opened"),
            Self::UnsupportedFormat { fourcc, modifier } => write!(
                f,
                "the allocator does not support fourcc {:#010x} with modifier {:#x}",
                fourcc, modifier,
            ),
            Self::AllocationFailed(_) => write!(f, "the DMA heap allocation failed"),
            Self::BufferCreationFailed(_) => write!(f, "GBM failed to create the buffer"),
            Self::ExportFailed => write!(f, "the buffer could not be exported as a DMA-buf"),
        }
    }
}

impl From<AllocationError> for VulkanError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::HeapUnavailable(_) | AllocationError::DeviceUnavailable(_) => {
                VulkanError::InitializationFailed
            }
            AllocationError::UnsupportedFormat { .. } => VulkanError::FormatNotSupported,
            AllocationError::AllocationFailed(_) | AllocationError::BufferCreationFailed(_) => {
                VulkanError::OutOfDeviceMemory
            }
            AllocationError::ExportFailed => VulkanError::OutOfHostMemory,
        }
    }
}
