// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Vulkan swapchain implementation for platforms whose driver has no window-system integration.
//!
//! # Brief summary
//!
//! - [`DeviceData`](crate::device::DeviceData) is the per-device private data the layer keeps.
//!   It owns the [driver dispatch](crate::fns::DriverFunctions) and the set of swapchains the
//!   layer created on that device. Per-device records are found through a
//!   [`Registry`](crate::device::Registry).
//!
//! - A [`Swapchain`](crate::swapchain::Swapchain) owns a fixed pool of images. Images are handed
//!   out by [`acquire_next_image`](crate::swapchain::Swapchain::acquire_next_image) and given
//!   back by [`queue_present`](crate::device::DeviceData::queue_present). A background
//!   completion thread returns presented images to the pool once the window system is done
//!   with them.
//!
//! - Each swapchain picks one presentation backend when it is created: a shared-memory blit, a
//!   direct DMA-buf hand-off to the window system, or a bridge that forwards DMA-buf
//!   descriptors to an external compositor helper over a local socket.
//!
//! - Image memory comes from the [external memory binder](crate::memory::ExternalMemory), which
//!   either imports DMA-buf file descriptors or allocates host-visible linear memory.

pub use ash::vk::Handle;
use std::{
    borrow::Cow,
    error::Error,
    fmt::{Display, Error as FmtError, Formatter},
};

pub mod config;
pub mod device;
pub mod fns;
pub mod format;
pub mod logging;
pub mod memory;
pub mod platform;
pub mod swapchain;
pub mod sync;

/// Represents memory size and offset values on a Vulkan device.
pub use ash::vk::DeviceSize;

/// Gives access to the internal identifier of an object.
pub unsafe trait VulkanObject {
    /// The type of the object.
    type Handle: ash::vk::Handle;

    /// Returns the raw Vulkan handle of the object.
    fn handle(&self) -> Self::Handle;
}

/// Error type returned by the driver and by the layer's own operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VulkanError {
    NotReady,
    Timeout,
    OutOfHostMemory,
    OutOfDeviceMemory,
    InitializationFailed,
    DeviceLost,
    MemoryMapFailed,
    ExtensionNotPresent,
    FeatureNotPresent,
    FormatNotSupported,
    Unknown,
    InvalidExternalHandle,
    SurfaceLost,
    OutOfDate,
    InvalidDrmFormatModifierPlaneLayout,
    /// A result code with no dedicated variant.
    Unnamed(ash::vk::Result),
}

impl VulkanError {
    /// Converts the error back into the raw result code returned to the application.
    pub fn to_vk(self) -> ash::vk::Result {
        match self {
            VulkanError::NotReady => ash::vk::Result::NOT_READY,
            VulkanError::Timeout => ash::vk::Result::TIMEOUT,
            VulkanError::OutOfHostMemory => ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            VulkanError::OutOfDeviceMemory => ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            VulkanError::InitializationFailed => ash::vk::Result::ERROR_INITIALIZATION_FAILED,
            VulkanError::DeviceLost => ash::vk::Result::ERROR_DEVICE_LOST,
            VulkanError::MemoryMapFailed => ash::vk::Result::ERROR_MEMORY_MAP_FAILED,
            VulkanError::ExtensionNotPresent => ash::vk::Result::ERROR_EXTENSION_NOT_PRESENT,
            VulkanError::FeatureNotPresent => ash::vk::Result::ERROR_FEATURE_NOT_PRESENT,
            VulkanError::FormatNotSupported => ash::vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
            VulkanError::Unknown => ash::vk::Result::ERROR_UNKNOWN,
            VulkanError::InvalidExternalHandle => ash::vk::Result::ERROR_INVALID_EXTERNAL_HANDLE,
            VulkanError::SurfaceLost => ash::vk::Result::ERROR_SURFACE_LOST_KHR,
            VulkanError::OutOfDate => ash::vk::Result::ERROR_OUT_OF_DATE_KHR,
            VulkanError::InvalidDrmFormatModifierPlaneLayout => {
                ash::vk::Result::ERROR_INVALID_DRM_FORMAT_MODIFIER_PLANE_LAYOUT_EXT
            }
            VulkanError::Unnamed(result) => result,
        }
    }
}

impl From<ash::vk::Result> for VulkanError {
    fn from(val: ash::vk::Result) -> VulkanError {
        match val {
            ash::vk::Result::NOT_READY => Self::NotReady,
            ash::vk::Result::TIMEOUT => Self::Timeout,
            ash::vk::Result::ERROR_OUT_OF_HOST_MEMORY => Self::OutOfHostMemory,
            ash::vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Self::OutOfDeviceMemory,
            ash::vk::Result::ERROR_INITIALIZATION_FAILED => Self::InitializationFailed,
            ash::vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            ash::vk::Result::ERROR_MEMORY_MAP_FAILED => Self::MemoryMapFailed,
            ash::vk::Result::ERROR_EXTENSION_NOT_PRESENT => Self::ExtensionNotPresent,
            ash::vk::Result::ERROR_FEATURE_NOT_PRESENT => Self::FeatureNotPresent,
            ash::vk::Result::ERROR_FORMAT_NOT_SUPPORTED => Self::FormatNotSupported,
            ash::vk::Result::ERROR_UNKNOWN => Self::Unknown,
            ash::vk::Result::ERROR_INVALID_EXTERNAL_HANDLE => Self::InvalidExternalHandle,
            ash::vk::Result::ERROR_SURFACE_LOST_KHR => Self::SurfaceLost,
            ash::vk::Result::ERROR_OUT_OF_DATE_KHR => Self::OutOfDate,
            ash::vk::Result::ERROR_INVALID_DRM_FORMAT_MODIFIER_PLANE_LAYOUT_EXT => {
                Self::InvalidDrmFormatModifierPlaneLayout
            }
            result => Self::Unnamed(result),
        }
    }
}

impl Error for VulkanError {}

impl Display for VulkanError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            VulkanError::NotReady => write!(f, "A fence or query has not yet completed."),
            VulkanError::Timeout => write!(
                f,
                "A wait operation has not completed in the specified time.",
            ),
            VulkanError::OutOfHostMemory => write!(f, "A host memory allocation has failed."),
            VulkanError::OutOfDeviceMemory => write!(f, "A device memory allocation has failed."),
            VulkanError::InitializationFailed => write!(
                f,
                "Initialization of an object could not be completed for implementation-specific \
                reasons.",
            ),
            VulkanError::DeviceLost => write!(f, "The logical or physical device has been lost."),
            VulkanError::MemoryMapFailed => write!(f, "Mapping of a memory object has failed."),
            VulkanError::ExtensionNotPresent => {
                write!(f, "A requested extension is not supported.")
            }
            VulkanError::FeatureNotPresent => write!(f, "A requested feature is not supported."),
            VulkanError::FormatNotSupported => write!(
                f,
                "A requested format is not supported on this device.",
            ),
            VulkanError::Unknown => write!(
                f,
                "An unknown error has occurred; either the application has provided invalid \
                input, or an implementation failure has occurred.",
            ),
            VulkanError::InvalidExternalHandle => write!(
                f,
                "An external handle is not a valid handle of the specified type.",
            ),
            VulkanError::SurfaceLost => write!(f, "A surface is no longer available."),
            VulkanError::OutOfDate => write!(
                f,
                "A surface has changed in such a way that it is no longer compatible with the \
                swapchain, and further presentation requests using the swapchain will fail.",
            ),
            VulkanError::InvalidDrmFormatModifierPlaneLayout => write!(
                f,
                "The requested DRM format modifier plane layout is invalid.",
            ),
            VulkanError::Unnamed(result) => write!(
                f,
                "Unnamed error, VkResult value {}",
                result.as_raw(),
            ),
        }
    }
}

/// A wrapper for error types of functions that can return validation errors.
#[derive(Clone, Debug)]
pub enum Validated<E> {
    /// A non-validation error occurred.
    Error(E),

    /// A validation error occurred.
    ValidationError(Box<ValidationError>),
}

impl<E> Validated<E> {
    /// Maps the inner `Error` value using the provided function, or does nothing if the value is
    /// `ValidationError`.
    #[inline]
    pub fn map<F>(self, op: impl FnOnce(E) -> F) -> Validated<F> {
        match self {
            Self::Error(err) => Validated::Error(op(err)),
            Self::ValidationError(err) => Validated::ValidationError(err),
        }
    }

    /// Returns the inner `Error` value, or panics if it contains `ValidationError`.
    #[inline(always)]
    #[track_caller]
    pub fn unwrap(self) -> E {
        match self {
            Self::Error(err) => err,
            Self::ValidationError(err) => {
                panic!(
                    "called `Validated::unwrap` on a `ValidationError` value: {:?}",
                    err
                )
            }
        }
    }
}

impl Validated<VulkanError> {
    /// Converts into the raw result code returned to the application. Validation errors have no
    /// dedicated code and are reported as `VK_ERROR_UNKNOWN`.
    pub fn to_vk(&self) -> ash::vk::Result {
        match self {
            Self::Error(err) => err.to_vk(),
            Self::ValidationError(_) => ash::vk::Result::ERROR_UNKNOWN,
        }
    }
}

impl<E> Error for Validated<E>
where
    E: Error + 'static,
{
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Error(err) => Some(err),
            Self::ValidationError(err) => Some(err),
        }
    }
}

impl<E> Display for Validated<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::Error(_) => write!(f, "a non-validation error occurred"),
            Self::ValidationError(_) => write!(f, "a validation error occurred"),
        }
    }
}

impl<E> From<Box<ValidationError>> for Validated<E> {
    fn from(err: Box<ValidationError>) -> Self {
        Self::ValidationError(err)
    }
}

impl From<VulkanError> for Validated<VulkanError> {
    fn from(err: VulkanError) -> Self {
        Self::Error(err)
    }
}

/// The arguments or other context of a call to a Vulkan function were not valid.
#[derive(Clone, Debug, Default)]
pub struct ValidationError {
    /// The context in which the problem exists (e.g. a specific parameter).
    pub context: Cow<'static, str>,

    /// A description of the problem.
    pub problem: Cow<'static, str>,

    /// Identifiers of the valid usage rules that were violated.
    pub vuids: &'static [&'static str],
}

impl ValidationError {
    pub(crate) fn add_context(mut self: Box<Self>, context: impl Into<Cow<'static, str>>) -> Box<Self> {
        if self.context.is_empty() {
            self.context = context.into();
        } else {
            self.context = format!("{}.{}", context.into(), self.context).into();
        }

        self
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        if self.context.is_empty() {
            write!(f, "{}", self.problem)?;
        } else {
            write!(f, "{}: {}", self.context, self.problem)?;
        }

        if !self.vuids.is_empty() {
            write!(f, "\n\nVulkan VUIDs:")?;

            for vuid in self.vuids {
                write!(f, "\n    {}", vuid)?;
            }
        }

        Ok(())
    }
}

impl Error for ValidationError {}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a field of this type can
/// only be constructed by calling a constructor function or `Default::default()`. The effect is
/// similar to the standard Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)] // add traits as needed
pub struct NonExhaustive(pub(crate) ());

#[cfg(test)]
mod error_tests {
    use super::{ValidationError, Validated, VulkanError};

    #[test]
    fn vk_result_round_trips_named_codes() {
        for err in [
            VulkanError::OutOfDate,
            VulkanError::SurfaceLost,
            VulkanError::FormatNotSupported,
            VulkanError::Timeout,
        ] {
            assert_eq!(VulkanError::from(err.to_vk()), err);
        }
    }

    #[test]
    fn unnamed_code_is_preserved() {
        let err = VulkanError::from(ash::vk::Result::ERROR_FRAGMENTED_POOL);
        assert_eq!(err, VulkanError::Unnamed(ash::vk::Result::ERROR_FRAGMENTED_POOL));
        assert_eq!(err.to_vk(), ash::vk::Result::ERROR_FRAGMENTED_POOL);
    }

    #[test]
    fn validation_error_context_is_prefixed() {
        let err = Box::new(ValidationError {
            context: "image_index".into(),
            problem: "is out of range".into(),
            ..Default::default()
        })
        .add_context("swapchain_infos[1]");
        assert_eq!(err.context, "swapchain_infos[1].image_index");

        let validated: Validated<VulkanError> = err.into();
        assert_eq!(validated.to_vk(), ash::vk::Result::ERROR_UNKNOWN);
    }
}
