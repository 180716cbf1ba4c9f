// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Presenting through an external process over a local socket.
//!
//! Instead of giving images to the window system, each present sends the image's DMA-buf
//! descriptors to a bridge process, which composites them into the window identified by the
//! packet's `xid`. The bridge does not report when it stops reading an image. Images are instead
//! released in the order they were presented, once enough newer images were sent after them.
//!
//! Presents are paced to a fixed rate. If the bridge announced support for it, each frame also
//! waits for the bridge's acknowledgment.

pub use self::client::{BridgeClient, BridgeError, BridgeFrame};
use super::{create_dmabuf_image, Delivery, ImageBacking, ImageResources};
use crate::{
    device::DeviceData,
    format::opaque_fourcc,
    memory::{DmaBufAllocator, DmaBufFormat, ExternalMemory},
    swapchain::{SwapchainCreateInfo, MAX_SWAPCHAIN_IMAGE_COUNT},
    VulkanError,
};
use smallvec::SmallVec;
use std::{
    collections::VecDeque,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

pub mod client;
pub mod packet;

/// Presents through the bridge.
pub(crate) struct BridgePresenter {
    client: Arc<BridgeClient>,
    allocator: Arc<dyn DmaBufAllocator>,
    xid: u32,
    format: DmaBufFormat,
    pacer: FramePacer,
    release_queue: VecDeque<u32>,
    release_lag: usize,
}

impl BridgePresenter {
    pub(crate) fn new(
        client: Arc<BridgeClient>,
        allocator: Arc<dyn DmaBufAllocator>,
        xid: u32,
        format: DmaBufFormat,
    ) -> Self {
        let pacer = FramePacer::new(client.config().present_interval());

        BridgePresenter {
            client,
            allocator,
            xid,
            format,
            pacer,
            release_queue: VecDeque::new(),
            release_lag: (MAX_SWAPCHAIN_IMAGE_COUNT as usize - 1).max(1),
        }
    }

    #[inline]
    pub(crate) fn client(&self) -> &Arc<BridgeClient> {
        &self.client
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

        create_dmabuf_image(device, create_info, memory, |_| Ok(ImageBacking::None))
    }

    /// Sends the image to the bridge. Returns the images that are no longer held.
    ///
    /// A transport failure disables the bridge for the whole process and returns `OutOfDate`.
    pub(crate) fn present(
        &mut self,
        resources: &ImageResources,
        image_index: u32,
        extent: [u32; 2],
    ) -> Result<Delivery, VulkanError> {
        let allocation = resources
            .memory
            .dmabuf()
            .ok_or(VulkanError::InvalidExternalHandle)?;

        self.pacer.wait();

        let frame = BridgeFrame {
            xid: self.xid,
            extent,
            fourcc: opaque_fourcc(allocation.format.fourcc),
            modifier: allocation.format.modifier,
            planes: &allocation.planes,
        };

        if let Err(err) = self.client.present_frame(&frame) {
            if !self.client.mark_unavailable() {
                log::error!("bridge present failed, disabling the bridge: {}", err);
            }

            return Err(VulkanError::OutOfDate);
        }

        self.release_queue.push_back(image_index);

        let mut released = SmallVec::new();
        while self.release_queue.len() > self.release_lag {
            released.extend(self.release_queue.pop_front());
        }

        Ok(Delivery::Released(released))
    }

    pub(crate) fn drain_delayed_release(&mut self) -> SmallVec<[u32; 4]> {
        self.release_queue.drain(..).collect()
    }

    pub(crate) fn stop_stream(&self) {
        self.client.stop_stream(self.xid);
    }
}

/// Spaces presents at least `interval` apart.
#[derive(Debug)]
pub(crate) struct FramePacer {
    interval: Option<Duration>,
    next: Option<Instant>,
}

impl FramePacer {
    /// `None` disables pacing.
    pub(crate) fn new(interval: Option<Duration>) -> Self {
        FramePacer {
            interval,
            next: None,
        }
    }

    /// Sleeps until the next slot. The first call only sets the baseline.
    pub(crate) fn wait(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };

        if let Some(next) = self.next {
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            }
        }

        self.next = Some(Instant::now() + interval);
    }
}
