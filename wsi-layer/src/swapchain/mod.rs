// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Swapchains owned by the layer.
//!
//! A swapchain has a fixed number of images, each in one of the [`ImageStatus`] states:
//!
//! ```text
//! Invalid -> Free -> Acquired -> Presented -> Free -> ... -> Invalid
//! ```
//!
//! Images become `Free` when the swapchain is created and `Invalid` again when it is destroyed.
//! [`Swapchain::acquire_next_image`] hands out a free image. Presenting it (through
//! [`DeviceData::queue_present`]) first waits for the application's semaphores, then gives the
//! image to the swapchain's presentation backend. The image stays `Presented` until the window
//! system reports that it no longer reads it; the completion thread then makes it `Free` again.
//!
//! # Backends
//!
//! The backend is chosen once, when the swapchain is created:
//!
//! - The **bridge**, if `XWL_DMABUF_BRIDGE` names a socket and the bridge was not disabled by an
//!   earlier failure. Each present sends the image's DMA-buf descriptors to the process on the
//!   other end of the socket.
//! - **DMA-buf**, if a DMA-buf allocator is available and the window system can create pixmaps
//!   from a format and modifier the device can import.
//! - **Shared memory** otherwise. Each present copies the image into a segment shared with the
//!   window system.
//!
//! # Errors
//!
//! A failure of the window system or of the bridge puts the swapchain in an error state. From
//! then on, every acquire and present on it returns that error, as does
//! [`Swapchain::status`].
//!
//! [`DeviceData::queue_present`]: crate::device::DeviceData::queue_present

pub use self::{
    acquire_present::{AcquiredImage, PresentInfo, SwapchainPresentInfo},
    backend::{
        bridge::{BridgeClient, BridgeError},
        BackendKind,
    },
    completion::{CompletionSource, SurfaceCompletions},
    image::ImageStatus,
    swapchain::{Swapchain, SwapchainCreateInfo},
};
use ash::vk;

mod acquire_present;
pub(crate) mod backend;
mod completion;
mod image;
mod swapchain;

/// The number of images of a swapchain is clamped to this.
pub const MAX_SWAPCHAIN_IMAGE_COUNT: u32 = 6;

/// The way presenting a swapchain is accomplished.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PresentMode {
    /// Immediately shows the image to the user. May result in visible tearing.
    Immediate,

    /// The action of presenting an image puts it in wait. When the next vertical blanking period
    /// happens, the waiting image is effectively shown to the user. If an image is presented
    /// while another one is waiting, it is replaced.
    Mailbox,

    /// The action of presenting an image adds it to a queue of images. At each vertical blanking
    /// period, the queue is popped and an image is presented.
    ///
    /// Guaranteed to be always supported.
    Fifo,

    /// Same as `Fifo`, except that if the queue was empty during the previous vertical blanking
    /// period then it is equivalent to `Immediate`.
    FifoRelaxed,
}

impl From<PresentMode> for vk::PresentModeKHR {
    #[inline]
    fn from(val: PresentMode) -> Self {
        match val {
            PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
            PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
            PresentMode::Fifo => vk::PresentModeKHR::FIFO,
            PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
        }
    }
}

impl TryFrom<vk::PresentModeKHR> for PresentMode {
    type Error = ();

    #[inline]
    fn try_from(val: vk::PresentModeKHR) -> Result<Self, Self::Error> {
        Ok(match val {
            vk::PresentModeKHR::IMMEDIATE => PresentMode::Immediate,
            vk::PresentModeKHR::MAILBOX => PresentMode::Mailbox,
            vk::PresentModeKHR::FIFO => PresentMode::Fifo,
            vk::PresentModeKHR::FIFO_RELAXED => PresentMode::FifoRelaxed,
            _ => return Err(()),
        })
    }
}
