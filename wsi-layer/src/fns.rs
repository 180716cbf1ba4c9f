// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Driver entry points used by the layer.
//!
//! The layer never talks to the driver directly; every call goes through [`DriverFunctions`].
//! [`AshDriver`] forwards to the real driver through `ash` function tables.

use crate::{DeviceSize, VulkanError};
use ash::vk;
use smallvec::SmallVec;
use std::{ffi::c_void, os::fd::RawFd};

/// Tiling of an image created by the layer.
#[derive(Clone, Debug)]
pub enum ImageTiling {
    Optimal,
    Linear,
    /// Explicit DRM format modifier layout, backed by imported DMA-buf memory.
    DrmFormatModifier {
        modifier: u64,
        plane_layouts: SmallVec<[vk::SubresourceLayout; 4]>,
    },
}

/// Parameters of an image created by the layer for a swapchain.
#[derive(Clone, Debug)]
pub struct ImageCreateDesc {
    pub flags: vk::ImageCreateFlags,
    pub format: vk::Format,
    pub extent: [u32; 2],
    pub array_layers: u32,
    pub usage: vk::ImageUsageFlags,
    pub sharing_mode: vk::SharingMode,
    pub queue_family_indices: SmallVec<[u32; 2]>,
    pub tiling: ImageTiling,
}

/// One entry of a multi-plane memory bind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlaneMemoryBind {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub offset: DeviceSize,
    pub aspect: vk::ImageAspectFlags,
}

/// Format query for an image backed by external DMA-buf memory.
#[derive(Clone, Debug)]
pub struct ExternalImageQuery {
    pub format: vk::Format,
    pub modifier: u64,
    pub flags: vk::ImageCreateFlags,
    pub usage: vk::ImageUsageFlags,
    pub sharing_mode: vk::SharingMode,
    pub queue_family_indices: SmallVec<[u32; 2]>,
}

/// Answer to an [`ExternalImageQuery`].
#[derive(Clone, Copy, Debug)]
pub struct ExternalImageSupport {
    pub image_format_properties: vk::ImageFormatProperties,
    pub external_memory_features: vk::ExternalMemoryFeatureFlags,
}

/// A present forwarded untouched to the driver's own `vkQueuePresentKHR`.
#[derive(Clone, Debug, Default)]
pub struct ForwardedPresent<'a> {
    pub wait_semaphores: &'a [vk::Semaphore],
    pub swapchains: &'a [vk::SwapchainKHR],
    pub image_indices: &'a [u32],
}

/// The driver functions the layer depends on, for one device.
///
/// Handles passed to these functions must belong to the device the implementation was created
/// for.
pub trait DriverFunctions: Send + Sync {
    fn create_image(&self, create_info: &ImageCreateDesc) -> Result<vk::Image, VulkanError>;

    fn destroy_image(&self, image: vk::Image);

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements;

    /// Layout of mip level 0, array layer 0 of `aspect`.
    fn image_subresource_layout(
        &self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
    ) -> vk::SubresourceLayout;

    fn allocate_memory(
        &self,
        allocation_size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, VulkanError>;

    /// Imports `fd` as device memory. The driver takes ownership of `fd` only on success.
    fn import_memory_fd(
        &self,
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        fd: RawFd,
        allocation_size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, VulkanError>;

    /// Returns the `memoryTypeBits` the driver accepts for importing `fd`.
    fn memory_fd_type_bits(
        &self,
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        fd: RawFd,
    ) -> Result<u32, VulkanError>;

    fn free_memory(&self, memory: vk::DeviceMemory);

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError>;

    /// Binds every plane in one call.
    fn bind_image_memory2(&self, binds: &[PlaneMemoryBind]) -> Result<(), VulkanError>;

    /// Maps the whole memory object.
    fn map_memory(&self, memory: vk::DeviceMemory) -> Result<*mut c_void, VulkanError>;

    fn unmap_memory(&self, memory: vk::DeviceMemory);

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties;

    fn drm_format_modifier_properties(
        &self,
        format: vk::Format,
    ) -> Vec<vk::DrmFormatModifierPropertiesEXT>;

    /// Returns `None` if the combination is not supported at all.
    fn external_image_format_properties(
        &self,
        query: &ExternalImageQuery,
    ) -> Result<Option<ExternalImageSupport>, VulkanError>;

    /// Creates an unsignaled fence.
    fn create_fence(&self) -> Result<vk::Fence, VulkanError>;

    fn destroy_fence(&self, fence: vk::Fence);

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), VulkanError>;

    /// Returns `false` if `timeout_ns` elapsed before the fence was signaled.
    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool, VulkanError>;

    /// Submits an empty batch.
    fn queue_submit(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<(), VulkanError>;

    /// Calls the driver's own present, filling one result per swapchain.
    fn queue_present(
        &self,
        queue: vk::Queue,
        present: &ForwardedPresent<'_>,
        results: &mut [vk::Result],
    ) -> vk::Result;
}

/// Forwards to the driver through `ash`.
pub struct AshDriver {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    external_memory_fd: ash::khr::external_memory_fd::Device,
    swapchain: ash::khr::swapchain::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl AshDriver {
    /// # Safety
    ///
    /// - `device` must have been created from `physical_device`, which must belong to
    ///   `instance`.
    /// - `VK_KHR_external_memory_fd`, `VK_EXT_external_memory_dma_buf` and
    ///   `VK_EXT_image_drm_format_modifier` must be enabled on `device`.
    /// - Everything must outlive the returned object.
    pub unsafe fn new(
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        let external_memory_fd = ash::khr::external_memory_fd::Device::new(&instance, &device);
        let swapchain = ash::khr::swapchain::Device::new(&instance, &device);
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        AshDriver {
            instance,
            physical_device,
            device,
            external_memory_fd,
            swapchain,
            memory_properties,
        }
    }
}

impl DriverFunctions for AshDriver {
    fn create_image(&self, create_info: &ImageCreateDesc) -> Result<vk::Image, VulkanError> {
        let &ImageCreateDesc {
            flags,
            format,
            extent,
            array_layers,
            usage,
            sharing_mode,
            ref queue_family_indices,
            ref tiling,
        } = create_info;

        let (tiling_vk, modifier, plane_layouts): (_, _, &[vk::SubresourceLayout]) = match tiling {
            ImageTiling::Optimal => (vk::ImageTiling::OPTIMAL, None, &[][..]),
            ImageTiling::Linear => (vk::ImageTiling::LINEAR, None, &[][..]),
            ImageTiling::DrmFormatModifier {
                modifier,
                plane_layouts,
            } => (
                vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT,
                Some(*modifier),
                plane_layouts.as_slice(),
            ),
        };

        let mut explicit_modifier_vk = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
            .drm_format_modifier(modifier.unwrap_or_default())
            .plane_layouts(plane_layouts);
        let mut external_memory_vk = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

        let mut create_info_vk = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent[0],
                height: extent[1],
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(array_layers)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(tiling_vk)
            .usage(usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(queue_family_indices)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        if modifier.is_some() {
            create_info_vk = create_info_vk
                .push_next(&mut explicit_modifier_vk)
                .push_next(&mut external_memory_vk);
        }

        unsafe { self.device.create_image(&create_info_vk, None) }.map_err(VulkanError::from)
    }

    fn destroy_image(&self, image: vk::Image) {
        unsafe { self.device.destroy_image(image, None) }
    }

    fn image_memory_requirements(&self, image: vk::Image) -> vk::MemoryRequirements {
        unsafe { self.device.get_image_memory_requirements(image) }
    }

    fn image_subresource_layout(
        &self,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
    ) -> vk::SubresourceLayout {
        let subresource = vk::ImageSubresource {
            aspect_mask: aspect,
            mip_level: 0,
            array_layer: 0,
        };

        unsafe { self.device.get_image_subresource_layout(image, subresource) }
    }

    fn allocate_memory(
        &self,
        allocation_size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, VulkanError> {
        let allocate_info_vk = vk::MemoryAllocateInfo::default()
            .allocation_size(allocation_size)
            .memory_type_index(memory_type_index);

        unsafe { self.device.allocate_memory(&allocate_info_vk, None) }.map_err(VulkanError::from)
    }

    fn import_memory_fd(
        &self,
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        fd: RawFd,
        allocation_size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<vk::DeviceMemory, VulkanError> {
        let mut import_info_vk = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(handle_type)
            .fd(fd);
        let allocate_info_vk = vk::MemoryAllocateInfo::default()
            .allocation_size(allocation_size)
            .memory_type_index(memory_type_index)
            .push_next(&mut import_info_vk);

        unsafe { self.device.allocate_memory(&allocate_info_vk, None) }.map_err(VulkanError::from)
    }

    fn memory_fd_type_bits(
        &self,
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        fd: RawFd,
    ) -> Result<u32, VulkanError> {
        let mut properties_vk = vk::MemoryFdPropertiesKHR::default();
        let fns = self.external_memory_fd.fp();

        unsafe {
            (fns.get_memory_fd_properties_khr)(
                self.device.handle(),
                handle_type,
                fd,
                &mut properties_vk,
            )
        }
        .result()
        .map_err(VulkanError::from)?;

        Ok(properties_vk.memory_type_bits)
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) }
    }

    fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: DeviceSize,
    ) -> Result<(), VulkanError> {
        unsafe { self.device.bind_image_memory(image, memory, offset) }.map_err(VulkanError::from)
    }

    fn bind_image_memory2(&self, binds: &[PlaneMemoryBind]) -> Result<(), VulkanError> {
        let mut plane_infos_vk: SmallVec<[_; 4]> = binds
            .iter()
            .map(|bind| vk::BindImagePlaneMemoryInfo::default().plane_aspect(bind.aspect))
            .collect();
        let bind_infos_vk: SmallVec<[_; 4]> = binds
            .iter()
            .zip(plane_infos_vk.iter_mut())
            .map(|(bind, plane_info_vk)| {
                vk::BindImageMemoryInfo::default()
                    .image(bind.image)
                    .memory(bind.memory)
                    .memory_offset(bind.offset)
                    .push_next(plane_info_vk)
            })
            .collect();

        unsafe { self.device.bind_image_memory2(&bind_infos_vk) }.map_err(VulkanError::from)
    }

    fn map_memory(&self, memory: vk::DeviceMemory) -> Result<*mut c_void, VulkanError> {
        unsafe {
            self.device
                .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .map_err(VulkanError::from)
    }

    fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.unmap_memory(memory) }
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        self.memory_properties
    }

    fn drm_format_modifier_properties(
        &self,
        format: vk::Format,
    ) -> Vec<vk::DrmFormatModifierPropertiesEXT> {
        let mut list_vk = vk::DrmFormatModifierPropertiesListEXT::default();
        let mut format_properties_vk = vk::FormatProperties2::default().push_next(&mut list_vk);
        unsafe {
            self.instance.get_physical_device_format_properties2(
                self.physical_device,
                format,
                &mut format_properties_vk,
            )
        };

        let count = list_vk.drm_format_modifier_count as usize;
        let mut properties = vec![vk::DrmFormatModifierPropertiesEXT::default(); count];

        let mut list_vk =
            vk::DrmFormatModifierPropertiesListEXT::default().drm_format_modifier_properties(&mut properties);
        let mut format_properties_vk = vk::FormatProperties2::default().push_next(&mut list_vk);
        unsafe {
            self.instance.get_physical_device_format_properties2(
                self.physical_device,
                format,
                &mut format_properties_vk,
            )
        };
        let count = list_vk.drm_format_modifier_count as usize;

        properties.truncate(count);
        properties
    }

    fn external_image_format_properties(
        &self,
        query: &ExternalImageQuery,
    ) -> Result<Option<ExternalImageSupport>, VulkanError> {
        let mut external_info_vk = vk::PhysicalDeviceExternalImageFormatInfo::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);
        let mut modifier_info_vk = vk::PhysicalDeviceImageDrmFormatModifierInfoEXT::default()
            .drm_format_modifier(query.modifier)
            .sharing_mode(query.sharing_mode)
            .queue_family_indices(&query.queue_family_indices);
        let format_info_vk = vk::PhysicalDeviceImageFormatInfo2::default()
            .format(query.format)
            .ty(vk::ImageType::TYPE_2D)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(query.usage)
            .flags(query.flags)
            .push_next(&mut modifier_info_vk)
            .push_next(&mut external_info_vk);

        let mut external_properties_vk = vk::ExternalImageFormatProperties::default();
        let mut properties_vk =
            vk::ImageFormatProperties2::default().push_next(&mut external_properties_vk);

        let result = unsafe {
            self.instance.get_physical_device_image_format_properties2(
                self.physical_device,
                &format_info_vk,
                &mut properties_vk,
            )
        };

        match result {
            Ok(()) => {
                let image_format_properties = properties_vk.image_format_properties;

                Ok(Some(ExternalImageSupport {
                    image_format_properties,
                    external_memory_features: external_properties_vk
                        .external_memory_properties
                        .external_memory_features,
                }))
            }
            Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => Ok(None),
            Err(err) => Err(VulkanError::from(err)),
        }
    }

    fn create_fence(&self) -> Result<vk::Fence, VulkanError> {
        let create_info_vk = vk::FenceCreateInfo::default();

        unsafe { self.device.create_fence(&create_info_vk, None) }.map_err(VulkanError::from)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<(), VulkanError> {
        unsafe { self.device.reset_fences(&[fence]) }.map_err(VulkanError::from)
    }

    fn wait_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool, VulkanError> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(VulkanError::from(err)),
        }
    }

    fn queue_submit(
        &self,
        queue: vk::Queue,
        wait_semaphores: &[vk::Semaphore],
        signal_semaphores: &[vk::Semaphore],
        fence: vk::Fence,
    ) -> Result<(), VulkanError> {
        let wait_stages: SmallVec<[_; 4]> = wait_semaphores
            .iter()
            .map(|_| vk::PipelineStageFlags::ALL_COMMANDS)
            .collect();
        let submit_info_vk = vk::SubmitInfo::default()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(signal_semaphores);

        unsafe { self.device.queue_submit(queue, &[submit_info_vk], fence) }
            .map_err(VulkanError::from)
    }

    fn queue_present(
        &self,
        queue: vk::Queue,
        present: &ForwardedPresent<'_>,
        results: &mut [vk::Result],
    ) -> vk::Result {
        let present_info_vk = vk::PresentInfoKHR::default()
            .wait_semaphores(present.wait_semaphores)
            .swapchains(present.swapchains)
            .image_indices(present.image_indices)
            .results(results);
        let fns = self.swapchain.fp();

        unsafe { (fns.queue_present_khr)(queue, &present_info_vk) }
    }
}
