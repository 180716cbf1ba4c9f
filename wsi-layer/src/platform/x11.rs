// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! X11 window system, over a connection of the layer's own.
//!
//! The application's connection is never used: events the layer waits for would otherwise be
//! stolen from the application's event loop, and the reverse.

use super::{DmaBufPixmapInfo, WindowGeometry, WindowSystem};
use crate::VulkanError;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    fmt::Display,
    os::fd::{BorrowedFd, OwnedFd},
};
use x11rb::{
    connection::Connection,
    protocol::{
        dri3::ConnectionExt as _,
        present::{self, ConnectionExt as _},
        shm::ConnectionExt as _,
        xproto::{ConnectionExt as _, CreateGCAux, ImageFormat},
        Event,
    },
    rust_connection::RustConnection,
};

/// A window on an X server.
pub struct X11Surface {
    connection: RustConnection,
    window: u32,
    gc: u32,
    has_shm: bool,
    has_dri3_modifiers: bool,
    state: Mutex<SurfaceState>,
}

#[derive(Default)]
struct SurfaceState {
    // Serials of the pending ShmPutImage requests, per segment.
    shm_serials: HashMap<u32, VecDeque<u32>>,
}

impl X11Surface {
    /// Opens a connection to `display` (or `$DISPLAY`) and binds it to `window`.
    pub fn connect(display: Option<&str>, window: u32) -> Result<Self, VulkanError> {
        let (connection, _screen) = x11rb::connect(display).map_err(|err| {
            log::error!("failed to connect to the X server: {}", err);
            VulkanError::InitializationFailed
        })?;

        let has_shm = connection
            .shm_query_version()
            .ok()
            .and_then(|cookie| cookie.reply().ok())
            .is_some();

        let has_dri3_modifiers = connection
            .dri3_query_version(1, 2)
            .ok()
            .and_then(|cookie| cookie.reply().ok())
            .is_some_and(|reply| (reply.major_version, reply.minor_version) >= (1, 2));

        let has_present = connection
            .present_query_version(1, 2)
            .ok()
            .and_then(|cookie| cookie.reply().ok())
            .is_some();

        let gc = connection.generate_id().map_err(lost)?;
        connection
            .create_gc(gc, window, &CreateGCAux::new().graphics_exposures(0))
            .map_err(lost)?;

        if has_present {
            let event_id = connection.generate_id().map_err(lost)?;
            connection
                .present_select_input(event_id, window, present::EventMask::IDLE_NOTIFY)
                .map_err(lost)?;
        }

        connection.flush().map_err(lost)?;

        log::info!(
            "X11 window {:#x}: MIT-SHM {}, DRI3 1.2 {}, Present {}",
            window,
            has_shm,
            has_dri3_modifiers,
            has_present,
        );

        Ok(X11Surface {
            connection,
            window,
            gc,
            has_shm,
            has_dri3_modifiers: has_dri3_modifiers && has_present,
            state: Mutex::new(SurfaceState::default()),
        })
    }
}

impl WindowSystem for X11Surface {
    fn window_id(&self) -> u32 {
        self.window
    }

    fn geometry(&self) -> Result<WindowGeometry, VulkanError> {
        let reply = self
            .connection
            .get_geometry(self.window)
            .map_err(lost)?
            .reply()
            .map_err(lost)?;

        Ok(WindowGeometry {
            extent: [u32::from(reply.width), u32::from(reply.height)],
            depth: reply.depth,
        })
    }

    fn supports_shm(&self) -> bool {
        self.has_shm
    }

    fn dmabuf_modifiers(&self, depth: u8, bpp: u8) -> Vec<u64> {
        if !self.has_dri3_modifiers {
            return Vec::new();
        }

        let reply = self
            .connection
            .dri3_get_supported_modifiers(self.window, depth, bpp)
            .ok()
            .and_then(|cookie| cookie.reply().ok());

        match reply {
            Some(reply) => {
                let mut modifiers = reply.window_modifiers;
                for modifier in reply.screen_modifiers {
                    if !modifiers.contains(&modifier) {
                        modifiers.push(modifier);
                    }
                }
                modifiers
            }
            None => Vec::new(),
        }
    }

    fn attach_shm(&self, shmid: i32) -> Result<u32, VulkanError> {
        let segment = self.connection.generate_id().map_err(lost)?;
        self.connection
            .shm_attach(segment, shmid as u32, false)
            .map_err(lost)?
            .check()
            .map_err(lost)?;

        Ok(segment)
    }

    fn detach_shm(&self, segment: u32) {
        self.state.lock().shm_serials.remove(&segment);

        if let Err(err) = self.connection.shm_detach(segment) {
            log::warn!("failed to detach shm segment {:#x}: {}", segment, err);
        }
        flushed(self.connection.flush(), "shm detach");
    }

    fn put_shm_image(
        &self,
        segment: u32,
        extent: [u32; 2],
        depth: u8,
        serial: u32,
    ) -> Result<(), VulkanError> {
        let [width, height] = extent.map(|x| x.min(u32::from(u16::MAX)) as u16);

        self.state
            .lock()
            .shm_serials
            .entry(segment)
            .or_default()
            .push_back(serial);

        self.connection
            .shm_put_image(
                self.window,
                self.gc,
                width,
                height,
                0,
                0,
                width,
                height,
                0,
                0,
                depth,
                ImageFormat::Z_PIXMAP.into(),
                true,
                segment,
                0,
            )
            .map_err(lost)?;
        self.connection.flush().map_err(lost)?;

        Ok(())
    }

    fn import_dmabuf(&self, info: &DmaBufPixmapInfo<'_>) -> Result<u32, VulkanError> {
        if info.planes.is_empty() || info.planes.len() > 4 {
            return Err(VulkanError::InvalidExternalHandle);
        }

        // The connection closes the descriptors after sending them.
        let fds = info
            .planes
            .iter()
            .map(|plane| {
                unsafe { BorrowedFd::borrow_raw(plane.fd) }
                    .try_clone_to_owned()
                    .map_err(|err| {
                        log::error!("failed to dup DMA-buf fd {}: {}", plane.fd, err);
                        VulkanError::OutOfHostMemory
                    })
            })
            .collect::<Result<Vec<OwnedFd>, _>>()?;

        let mut strides = info.planes.iter().map(|plane| plane.stride);
        let mut offsets = info.planes.iter().map(|plane| plane.offset);
        let pixmap = self.connection.generate_id().map_err(lost)?;

        self.connection
            .dri3_pixmap_from_buffers(
                pixmap,
                self.window,
                info.extent[0] as u16,
                info.extent[1] as u16,
                strides.next().unwrap_or(x11rb::NONE),
                offsets.next().unwrap_or(x11rb::NONE),
                strides.next().unwrap_or(x11rb::NONE),
                offsets.next().unwrap_or(x11rb::NONE),
                strides.next().unwrap_or(x11rb::NONE),
                offsets.next().unwrap_or(x11rb::NONE),
                strides.next().unwrap_or(x11rb::NONE),
                offsets.next().unwrap_or(x11rb::NONE),
                info.depth,
                info.bpp,
                info.modifier,
                fds,
            )
            .map_err(lost)?
            .check()
            .map_err(lost)?;

        Ok(pixmap)
    }

    fn free_pixmap(&self, pixmap: u32) {
        if let Err(err) = self.connection.free_pixmap(pixmap) {
            log::warn!("failed to free pixmap {:#x}: {}", pixmap, err);
        }
        flushed(self.connection.flush(), "pixmap free");
    }

    fn present_pixmap(&self, pixmap: u32, serial: u32) -> Result<(), VulkanError> {
        self.connection
            .present_pixmap(
                self.window,
                pixmap,
                serial,
                x11rb::NONE,
                x11rb::NONE,
                0,
                0,
                x11rb::NONE,
                x11rb::NONE,
                x11rb::NONE,
                present::Option::NONE.into(),
                0,
                0,
                0,
                &[],
            )
            .map_err(lost)?;
        self.connection.flush().map_err(lost)?;

        Ok(())
    }

    fn poll_completions(&self, completed: &mut Vec<u32>) -> Result<(), VulkanError> {
        while let Some(event) = self.connection.poll_for_event().map_err(lost)? {
            match event {
                Event::ShmCompletion(event) => {
                    let mut state = self.state.lock();
                    if let Some(serial) = state
                        .shm_serials
                        .get_mut(&event.shmseg)
                        .and_then(VecDeque::pop_front)
                    {
                        completed.push(serial);
                    }
                }
                Event::PresentIdleNotify(event) => completed.push(event.serial),
                Event::Error(err) => {
                    log::warn!("X11 error on window {:#x}: {:?}", self.window, err);
                }
                _ => {}
            }
        }

        Ok(())
    }
}

impl Drop for X11Surface {
    fn drop(&mut self) {
        if let Err(err) = self.connection.free_gc(self.gc) {
            log::debug!("failed to free GC {:#x}: {}", self.gc, err);
        }
        flushed(self.connection.flush(), "surface teardown");
    }
}

// For requests nobody waits on. A broken connection surfaces on the next checked request.
fn flushed<E: Display>(result: Result<(), E>, what: &str) -> bool {
    match result {
        Ok(()) => true,
        Err(err) => {
            log::debug!("X11 flush after {} failed: {}", what, err);
            false
        }
    }
}

fn lost(err: impl Display) -> VulkanError {
    log::error!("X11 connection failed: {}", err);
    VulkanError::SurfaceLost
}
