// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! The completion thread of a swapchain.
//!
//! The thread sleeps on the swapchain's condition variable while no image waits for a
//! completion. Otherwise it polls the [`CompletionSource`] every [`POLL_INTERVAL`], with the
//! state lock released, and frees the images whose completions all arrived.

use super::image::ImagePool;
use crate::{platform::WindowSystem, VulkanError};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Reports the serials of presents the window system is done with.
pub trait CompletionSource: Send + Sync {
    /// Appends the serials completed since the last call. Must not block.
    fn poll_completed(&self, completed: &mut Vec<u32>) -> Result<(), VulkanError>;
}

/// Completions reported by the window system's event stream.
pub struct SurfaceCompletions(pub Arc<dyn WindowSystem>);

impl CompletionSource for SurfaceCompletions {
    #[inline]
    fn poll_completed(&self, completed: &mut Vec<u32>) -> Result<(), VulkanError> {
        self.0.poll_completions(completed)
    }
}

#[derive(Debug)]
pub(crate) struct SwapchainState {
    pub(crate) images: ImagePool,
    /// Whether the completion thread runs.
    pub(crate) running: bool,
    pub(crate) stop: bool,
    /// Once set, returned by every acquire and present.
    pub(crate) error: Option<VulkanError>,
    pub(crate) last_present_id: u64,
    pub(crate) last_completed_present_id: u64,
}

impl SwapchainState {
    #[inline]
    pub(crate) fn set_error(&mut self, err: VulkanError) -> VulkanError {
        *self.error.get_or_insert(err)
    }

    #[inline]
    pub(crate) fn record_completed(&mut self, present_id: u64) {
        self.last_completed_present_id = self.last_completed_present_id.max(present_id);
    }
}

/// The part of a swapchain shared with its completion thread.
pub(crate) struct SwapchainShared {
    pub(crate) state: Mutex<SwapchainState>,
    pub(crate) cond: Condvar,
    source: Box<dyn CompletionSource>,
}

impl SwapchainShared {
    pub(crate) fn new(image_count: u32, source: Box<dyn CompletionSource>) -> Self {
        SwapchainShared {
            state: Mutex::new(SwapchainState {
                images: ImagePool::new(image_count as usize),
                running: false,
                stop: false,
                error: None,
                last_present_id: 0,
                last_completed_present_id: 0,
            }),
            cond: Condvar::new(),
            source,
        }
    }

    /// Starts the completion thread.
    pub(crate) fn spawn(self: &Arc<Self>, name: String) -> io::Result<JoinHandle<()>> {
        self.state.lock().running = true;

        let shared = self.clone();
        let result = thread::Builder::new()
            .name(name)
            .spawn(move || shared.run());

        if result.is_err() {
            self.state.lock().running = false;
        }

        result
    }

    pub(crate) fn request_stop(&self) {
        self.state.lock().stop = true;
        self.cond.notify_all();
    }

    fn run(&self) {
        let mut completed = Vec::new();
        let mut state = self.state.lock();

        loop {
            while !state.stop && !state.images.has_pending() {
                self.cond.wait(&mut state);
            }

            if state.stop {
                break;
            }

            completed.clear();
            let result =
                MutexGuard::unlocked(&mut state, || self.source.poll_completed(&mut completed));

            if let Err(err) = result {
                log::error!("completion source failed: {}", err);
                state.set_error(err);
                break;
            }

            if completed.is_empty() {
                MutexGuard::unlocked(&mut state, || thread::sleep(POLL_INTERVAL));
                continue;
            }

            let progress = state.images.complete(&completed);

            if let Some(present_id) = progress.present_id {
                state.record_completed(present_id);
            }

            if !progress.freed.is_empty() {
                log::trace!("images {:?} completed", progress.freed);
            }

            self.cond.notify_all();
        }

        state.running = false;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::{CompletionSource, SwapchainShared};
    use crate::{
        swapchain::image::{ImageStatus, PendingCompletion},
        VulkanError,
    };
    use parking_lot::Mutex;
    use std::{collections::VecDeque, sync::Arc, time::Duration};

    #[derive(Default)]
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Vec<u32>, VulkanError>>>,
    }

    impl ScriptedSource {
        fn push(&self, batch: Result<Vec<u32>, VulkanError>) {
            self.script.lock().push_back(batch);
        }
    }

    impl CompletionSource for Arc<ScriptedSource> {
        fn poll_completed(&self, completed: &mut Vec<u32>) -> Result<(), VulkanError> {
            match self.script.lock().pop_front() {
                Some(Ok(serials)) => {
                    completed.extend(serials);
                    Ok(())
                }
                Some(Err(err)) => Err(err),
                None => Ok(()),
            }
        }
    }

    fn shared(source: &Arc<ScriptedSource>) -> Arc<SwapchainShared> {
        let shared = Arc::new(SwapchainShared::new(2, Box::new(source.clone())));
        shared.state.lock().images.mark_all_free();
        shared
    }

    fn present(shared: &SwapchainShared, index: u32, serial: u32, present_id: u64) {
        let mut state = shared.state.lock();
        state.images.set_status(index, ImageStatus::Presented);
        state
            .images
            .push_pending(index, PendingCompletion { serial, present_id });
        shared.cond.notify_all();
    }

    #[test]
    fn completion_frees_image_and_advances_present_id() {
        let source = Arc::new(ScriptedSource::default());
        let shared = shared(&source);
        let thread = shared.spawn("test-completion".into()).unwrap();

        source.push(Ok(vec![]));
        source.push(Ok(vec![3]));
        present(&shared, 1, 3, 42);

        {
            let mut state = shared.state.lock();
            while state.images.status(1) != Some(ImageStatus::Free) {
                let result = shared.cond.wait_for(&mut state, Duration::from_secs(5));
                assert!(!result.timed_out());
            }
            assert_eq!(state.last_completed_present_id, 42);
        }

        shared.request_stop();
        thread.join().unwrap();
        assert!(!shared.state.lock().running);
    }

    #[test]
    fn source_error_stops_the_thread() {
        let source = Arc::new(ScriptedSource::default());
        let shared = shared(&source);
        let thread = shared.spawn("test-completion".into()).unwrap();

        source.push(Err(VulkanError::SurfaceLost));
        present(&shared, 0, 1, 0);
        thread.join().unwrap();

        let state = shared.state.lock();
        assert!(!state.running);
        assert_eq!(state.error, Some(VulkanError::SurfaceLost));
        assert_eq!(state.images.status(0), Some(ImageStatus::Presented));
    }

    #[test]
    fn stop_joins_with_completions_pending_forever() {
        let source = Arc::new(ScriptedSource::default());
        let shared = shared(&source);
        let thread = shared.spawn("test-completion".into()).unwrap();

        present(&shared, 0, 1, 0);
        std::thread::sleep(Duration::from_millis(5));
        shared.request_stop();
        thread.join().unwrap();

        assert!(!shared.state.lock().running);
    }
}
