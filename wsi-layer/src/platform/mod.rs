// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Window-system connections used by the presentation backends.
//!
//! A [`WindowSystem`] is bound to one window. It exposes the three ways the layer can get pixels
//! to that window: a shared-memory segment copied by the server, a pixmap created from DMA-buf
//! descriptors, and, for both, completion events telling the layer when the server no longer
//! reads an image.
//!
//! Completions are reported as the serials given to [`put_shm_image`] and [`present_pixmap`].
//!
//! [`put_shm_image`]: WindowSystem::put_shm_image
//! [`present_pixmap`]: WindowSystem::present_pixmap

use crate::{memory::DmaBufPlane, VulkanError};

#[cfg(all(feature = "x11", unix))]
pub mod x11;

/// Size and depth of a window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowGeometry {
    pub extent: [u32; 2],
    pub depth: u8,
}

/// Parameters of a pixmap created from DMA-buf planes.
#[derive(Clone, Copy, Debug)]
pub struct DmaBufPixmapInfo<'a> {
    pub extent: [u32; 2],
    pub depth: u8,
    pub bpp: u8,
    pub modifier: u64,
    /// At most four planes. The descriptors are duplicated; the caller keeps ownership.
    pub planes: &'a [DmaBufPlane],
}

/// A connection to the window system, bound to one window.
pub trait WindowSystem: Send + Sync {
    /// The identifier of the window, as sent to the bridge.
    fn window_id(&self) -> u32;

    fn geometry(&self) -> Result<WindowGeometry, VulkanError>;

    /// Returns whether shared-memory images are supported.
    fn supports_shm(&self) -> bool;

    /// Returns the DRM format modifiers usable for pixmaps of `depth` and `bpp` on the window.
    /// Empty if DMA-buf pixmaps are not supported.
    fn dmabuf_modifiers(&self, depth: u8, bpp: u8) -> Vec<u64>;

    /// Attaches the SysV shared memory segment `shmid` and returns the server-side segment id.
    fn attach_shm(&self, shmid: i32) -> Result<u32, VulkanError>;

    fn detach_shm(&self, segment: u32);

    /// Copies the segment to the window. Completion is reported with `serial`.
    fn put_shm_image(
        &self,
        segment: u32,
        extent: [u32; 2],
        depth: u8,
        serial: u32,
    ) -> Result<(), VulkanError>;

    /// Creates a pixmap backed by the DMA-buf planes.
    fn import_dmabuf(&self, info: &DmaBufPixmapInfo<'_>) -> Result<u32, VulkanError>;

    fn free_pixmap(&self, pixmap: u32);

    /// Presents the pixmap on the window. Completion is reported with `serial` once the server
    /// no longer reads the pixmap.
    fn present_pixmap(&self, pixmap: u32, serial: u32) -> Result<(), VulkanError>;

    /// Appends the serials completed since the last call to `completed`. Does not block.
    fn poll_completions(&self, completed: &mut Vec<u32>) -> Result<(), VulkanError>;
}
