// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Per-device private data and the registry that finds it.
//!
//! The layer receives raw dispatchable handles from the loader. All handles created from one
//! device (the device itself and its queues) share the same dispatch table pointer, which is
//! stored in the first word of the object the handle points to. [`DispatchKey`] is that
//! pointer, and [`Registry`] maps it to the device's [`DeviceData`].
//!
//! Some compatibility shims wrap dispatchable objects, so that the dispatch key seen by the
//! layer differs from the one it recorded at device creation. For those, [`Registry::get`]
//! falls back to a scan comparing the raw handle value against the handle recorded for each
//! entry.

use crate::{
    fns::{DriverFunctions, ForwardedPresent},
    memory::{DmaBufAllocator, DmaHeapAllocator, GbmAllocator},
    platform::WindowSystem,
    swapchain::{BridgeClient, PresentInfo, Swapchain, SwapchainCreateInfo},
    Handle, Validated, ValidationError, VulkanError,
};
use ash::vk;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::{
    collections::HashMap,
    fmt::{Debug, Error as FmtError, Formatter},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

/// The loader's dispatch table pointer of a dispatchable handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DispatchKey(usize);

impl DispatchKey {
    /// Reads the dispatch key of `handle`.
    ///
    /// # Safety
    ///
    /// - `handle` must be a valid dispatchable handle created through the Vulkan loader.
    #[inline]
    pub unsafe fn of<H: Handle>(handle: H) -> Self {
        let object = handle.as_raw() as usize as *const usize;

        DispatchKey(unsafe { object.read() })
    }

    #[inline]
    pub const fn from_raw(key: usize) -> Self {
        DispatchKey(key)
    }
}

struct RegistryEntry<T> {
    handle: u64,
    data: Arc<T>,
}

/// Maps dispatch keys to private data.
pub struct Registry<T> {
    entries: RwLock<HashMap<DispatchKey, RegistryEntry<T>>>,
}

impl<T> Registry<T> {
    #[inline]
    pub fn new() -> Self {
        Registry {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Associates `data` with `key`. `handle` is remembered for the fallback lookup.
    ///
    /// Returns the data previously associated with `key`, if any.
    pub fn insert(&self, key: DispatchKey, handle: impl Handle, data: Arc<T>) -> Option<Arc<T>> {
        let entry = RegistryEntry {
            handle: handle.as_raw(),
            data,
        };

        self.entries.write().insert(key, entry).map(|old| old.data)
    }

    /// Looks up the data for a handle whose dispatch key is `key`.
    ///
    /// If nothing is registered under `key`, the entries are scanned for one whose recorded
    /// handle equals `handle`.
    pub fn get(&self, key: DispatchKey, handle: impl Handle) -> Option<Arc<T>> {
        let entries = self.entries.read();

        if let Some(entry) = entries.get(&key) {
            return Some(entry.data.clone());
        }

        let raw = handle.as_raw();
        let found = entries
            .values()
            .find(|entry| entry.handle == raw)
            .map(|entry| entry.data.clone());

        if found.is_some() {
            log::debug!(
                "private data for handle {:#x} found by value instead of dispatch key {:#x}",
                raw,
                key.0,
            );
        }

        found
    }

    pub fn remove(&self, key: DispatchKey) -> Option<Arc<T>> {
        self.entries.write().remove(&key).map(|entry| entry.data)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }
}

impl<T> Default for Registry<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide registry of devices the layer intercepts.
pub fn devices() -> &'static Registry<DeviceData> {
    static DEVICES: OnceLock<Registry<DeviceData>> = OnceLock::new();

    DEVICES.get_or_init(Registry::new)
}

/// Device features relevant to presentation that the application enabled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PresentFeatures {
    pub present_id: bool,
    pub present_wait: bool,
    pub swapchain_maintenance1: bool,
}

/// Parameters to create a [`DeviceData`].
#[derive(Clone)]
pub struct DeviceDataCreateInfo {
    /// A queue of the device used for the layer's own empty submissions, such as signaling the
    /// semaphore and fence passed to an acquire.
    ///
    /// The default value is a null handle, in which case acquire semaphores and fences are not
    /// supported.
    pub internal_queue: vk::Queue,

    /// The default value is all `false`.
    pub enabled_features: PresentFeatures,

    /// The allocator used by the DMA-buf backends. Without one, only the shared-memory backend
    /// is available.
    ///
    /// The default value is `None`.
    pub dmabuf_allocator: Option<Arc<dyn DmaBufAllocator>>,

    /// The bridge client, if the bridge was requested.
    ///
    /// The default value is `None`.
    pub bridge: Option<Arc<BridgeClient>>,

    pub _ne: crate::NonExhaustive,
}

impl Default for DeviceDataCreateInfo {
    #[inline]
    fn default() -> Self {
        Self {
            internal_queue: vk::Queue::null(),
            enabled_features: PresentFeatures::default(),
            dmabuf_allocator: None,
            bridge: None,
            _ne: crate::NonExhaustive(()),
        }
    }
}

impl DeviceDataCreateInfo {
    /// Installs the stderr logger, then fills the allocator and the bridge from the running
    /// system.
    ///
    /// The allocator is GBM on the render node if it opens, which allows tiled modifiers.
    /// Otherwise it is the system DMA heap, which only produces linear buffers. The bridge is
    /// the process-wide client, if the environment requests one.
    pub fn with_system_defaults(mut self) -> Self {
        crate::logging::init();

        if self.dmabuf_allocator.is_none() {
            self.dmabuf_allocator = system_allocator();
        }

        if self.bridge.is_none() {
            self.bridge = BridgeClient::global();
        }

        self
    }
}

fn system_allocator() -> Option<Arc<dyn DmaBufAllocator>> {
    match GbmAllocator::open() {
        Ok(allocator) => return Some(Arc::new(allocator)),
        Err(err) => log::info!("GBM allocator unavailable, trying the DMA heap: {}", err),
    }

    match DmaHeapAllocator::open() {
        Ok(allocator) => Some(Arc::new(allocator)),
        Err(err) => {
            log::info!("DMA-buf backends unavailable: {}", err);
            None
        }
    }
}

/// Private data the layer keeps for each device.
pub struct DeviceData {
    handle: vk::Device,
    driver: Arc<dyn DriverFunctions>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    internal_queue: vk::Queue,
    enabled_features: PresentFeatures,
    dmabuf_allocator: Option<Arc<dyn DmaBufAllocator>>,
    bridge: Option<Arc<BridgeClient>>,

    swapchains: Mutex<HashMap<vk::SwapchainKHR, Arc<Swapchain>>>,
    next_swapchain_handle: AtomicU64,
}

impl DeviceData {
    pub fn new(
        handle: vk::Device,
        driver: Arc<dyn DriverFunctions>,
        create_info: DeviceDataCreateInfo,
    ) -> Arc<Self> {
        let DeviceDataCreateInfo {
            internal_queue,
            enabled_features,
            dmabuf_allocator,
            bridge,
            _ne: _,
        } = create_info;

        Arc::new(DeviceData {
            handle,
            memory_properties: driver.memory_properties(),
            driver,
            internal_queue,
            enabled_features,
            dmabuf_allocator,
            bridge,
            swapchains: Mutex::new(HashMap::new()),
            next_swapchain_handle: AtomicU64::new(1),
        })
    }

    #[inline]
    pub fn handle(&self) -> vk::Device {
        self.handle
    }

    #[inline]
    pub fn driver(&self) -> &Arc<dyn DriverFunctions> {
        &self.driver
    }

    #[inline]
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    #[inline]
    pub fn internal_queue(&self) -> vk::Queue {
        self.internal_queue
    }

    #[inline]
    pub fn enabled_features(&self) -> &PresentFeatures {
        &self.enabled_features
    }

    #[inline]
    pub fn dmabuf_allocator(&self) -> Option<&Arc<dyn DmaBufAllocator>> {
        self.dmabuf_allocator.as_ref()
    }

    #[inline]
    pub fn bridge(&self) -> Option<&Arc<BridgeClient>> {
        self.bridge.as_ref()
    }

    /// Creates a swapchain on `surface` and returns the handle given to the application.
    pub fn create_swapchain(
        self: &Arc<Self>,
        surface: Arc<dyn WindowSystem>,
        create_info: SwapchainCreateInfo,
    ) -> Result<vk::SwapchainKHR, Validated<VulkanError>> {
        if let Some(old_swapchain) = create_info.old_swapchain {
            if let Some(old) = self.swapchain(old_swapchain) {
                old.retire();
            }
        }

        let handle =
            vk::SwapchainKHR::from_raw(self.next_swapchain_handle.fetch_add(1, Ordering::Relaxed));
        let swapchain = Swapchain::new(self.clone(), handle, surface, create_info)?;
        self.swapchains.lock().insert(handle, swapchain);

        Ok(handle)
    }

    /// Forgets the swapchain. It is torn down once the last reference to it is gone.
    pub fn destroy_swapchain(&self, handle: vk::SwapchainKHR) {
        let swapchain = self.swapchains.lock().remove(&handle);
        drop(swapchain);
    }

    #[inline]
    pub fn swapchain(&self, handle: vk::SwapchainKHR) -> Option<Arc<Swapchain>> {
        self.swapchains.lock().get(&handle).cloned()
    }

    /// Returns whether `handle` was created by this layer.
    #[inline]
    pub fn layer_owns_swapchain(&self, handle: vk::SwapchainKHR) -> bool {
        self.swapchains.lock().contains_key(&handle)
    }

    /// Returns whether every handle in `handles` was created by this layer.
    pub fn layer_owns_all_swapchains(&self, handles: &[vk::SwapchainKHR]) -> bool {
        let swapchains = self.swapchains.lock();

        handles.iter().all(|handle| swapchains.contains_key(handle))
    }

    /// Presents every request of `present_info` on `queue`.
    ///
    /// Requests are processed in order, each independently of the others. If any swapchain was
    /// not created by this layer, the whole present is forwarded to the driver.
    pub fn queue_present(&self, queue: vk::Queue, present_info: &PresentInfo) -> PresentResults {
        let handles: SmallVec<[_; 4]> = present_info
            .swapchain_infos
            .iter()
            .map(|info| info.swapchain)
            .collect();

        if !self.layer_owns_all_swapchains(&handles) {
            return self.forward_present(queue, present_info, &handles);
        }

        let mut wait_semaphores = present_info.wait_semaphores.as_slice();

        // With several swapchains, one submission waits for everything so that each image only
        // has to signal its own fence.
        if handles.len() > 1 && !wait_semaphores.is_empty() {
            if let Err(err) = self
                .driver
                .queue_submit(queue, wait_semaphores, &[], vk::Fence::null())
            {
                log::error!("failed to submit present wait semaphores: {}", err);

                return PresentResults::from_results(
                    handles.iter().map(|_| Err(err.into())).collect(),
                );
            }

            wait_semaphores = &[];
        }

        let mut results = SmallVec::new();

        for (index, info) in present_info.swapchain_infos.iter().enumerate() {
            let result = match self.swapchain(info.swapchain) {
                Some(swapchain) => swapchain.present(queue, wait_semaphores, info),
                None => Err(VulkanError::SurfaceLost.into()),
            }
            .map_err(|err| match err {
                Validated::ValidationError(err) => {
                    err.add_context(format!("swapchain_infos[{}]", index)).into()
                }
                err => err,
            });

            if let Err(err) = &result {
                log::error!(
                    "present failed for swapchain_infos[{}] (image {}): {}",
                    index,
                    info.image_index,
                    DisplayValidated(err),
                );
            }

            results.push(result);
        }

        PresentResults::from_results(results)
    }

    fn forward_present(
        &self,
        queue: vk::Queue,
        present_info: &PresentInfo,
        handles: &[vk::SwapchainKHR],
    ) -> PresentResults {
        static WARNED: AtomicBool = AtomicBool::new(false);

        if !WARNED.swap(true, Ordering::Relaxed) {
            log::warn!("present forwarded to the driver: a swapchain is not owned by the layer");
        }

        let image_indices: SmallVec<[_; 4]> = present_info
            .swapchain_infos
            .iter()
            .map(|info| info.image_index)
            .collect();
        let mut results_vk: SmallVec<[_; 4]> = handles.iter().map(|_| vk::Result::SUCCESS).collect();

        let present = ForwardedPresent {
            wait_semaphores: &present_info.wait_semaphores,
            swapchains: handles,
            image_indices: &image_indices,
        };
        let result = self.driver.queue_present(queue, &present, &mut results_vk);

        PresentResults {
            results: results_vk
                .iter()
                .map(|&result_vk| match result_vk {
                    vk::Result::SUCCESS | vk::Result::SUBOPTIMAL_KHR => Ok(()),
                    err => Err(VulkanError::from(err).into()),
                })
                .collect(),
            result,
            forwarded: true,
        }
    }
}

impl Debug for DeviceData {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("DeviceData")
            .field("handle", &self.handle)
            .field("enabled_features", &self.enabled_features)
            .field("swapchains", &self.swapchains.lock().len())
            .finish_non_exhaustive()
    }
}

/// Outcome of [`DeviceData::queue_present`].
#[derive(Debug)]
pub struct PresentResults {
    /// One result per request, in request order.
    pub results: SmallVec<[Result<(), Validated<VulkanError>>; 2]>,

    /// Whether the present was handed to the driver instead of being handled by the layer.
    pub forwarded: bool,

    result: vk::Result,
}

impl PresentResults {
    fn from_results(results: SmallVec<[Result<(), Validated<VulkanError>>; 2]>) -> Self {
        let result = results
            .iter()
            .find_map(|result| result.as_ref().err())
            .map_or(vk::Result::SUCCESS, Validated::to_vk);

        PresentResults {
            results,
            result,
            forwarded: false,
        }
    }

    /// The value returned to the application: the first failure, or success.
    #[inline]
    pub fn result(&self) -> vk::Result {
        self.result
    }
}

struct DisplayValidated<'a>(&'a Validated<VulkanError>);

impl std::fmt::Display for DisplayValidated<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self.0 {
            Validated::Error(err) => write!(f, "{}", err),
            Validated::ValidationError(err) => write!(f, "{}", err),
        }
    }
}

pub(crate) fn validation_error(
    context: &'static str,
    problem: impl Into<std::borrow::Cow<'static, str>>,
    vuids: &'static [&'static str],
) -> Box<ValidationError> {
    Box::new(ValidationError {
        context: context.into(),
        problem: problem.into(),
        vuids,
    })
}
