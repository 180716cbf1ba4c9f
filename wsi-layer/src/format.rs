// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Mapping between Vulkan formats and DRM fourcc codes.

use ash::vk;
use drm_fourcc::{DrmFourcc, DrmModifier};

/// The linear (untiled) DRM format modifier.
pub const DRM_FORMAT_MOD_LINEAR: u64 = 0;

/// Returns the DRM fourcc whose memory layout matches `format`, if any.
///
/// Vulkan names components from the lowest memory address while DRM names them from the most
/// significant bit of a little-endian word, so `B8G8R8A8` is `ARGB8888`.
pub fn vk_to_drm_fourcc(format: vk::Format) -> Option<DrmFourcc> {
    Some(match format {
        vk::Format::B8G8R8A8_UNORM | vk::Format::B8G8R8A8_SRGB => DrmFourcc::Argb8888,
        vk::Format::R8G8B8A8_UNORM | vk::Format::R8G8B8A8_SRGB => DrmFourcc::Abgr8888,
        vk::Format::A2R10G10B10_UNORM_PACK32 => DrmFourcc::Argb2101010,
        vk::Format::A2B10G10R10_UNORM_PACK32 => DrmFourcc::Abgr2101010,
        vk::Format::R5G6B5_UNORM_PACK16 => DrmFourcc::Rgb565,
        _ => return None,
    })
}

/// Bits per pixel of the packed single-plane fourccs the layer presents.
pub fn drm_fourcc_bpp(fourcc: DrmFourcc) -> Option<u32> {
    match fourcc {
        DrmFourcc::Argb8888
        | DrmFourcc::Xrgb8888
        | DrmFourcc::Abgr8888
        | DrmFourcc::Xbgr8888
        | DrmFourcc::Argb2101010
        | DrmFourcc::Xrgb2101010
        | DrmFourcc::Abgr2101010
        | DrmFourcc::Xbgr2101010 => Some(32),
        DrmFourcc::Rgb565 => Some(16),
        _ => None,
    }
}

/// Drops the alpha channel from 8-bit RGBA fourccs.
///
/// Compositors treat the alpha of a toplevel window as meaningful, while Vulkan applications
/// commonly leave garbage in it.
pub fn opaque_fourcc(fourcc: u32) -> u32 {
    if fourcc == DrmFourcc::Argb8888 as u32 {
        DrmFourcc::Xrgb8888 as u32
    } else if fourcc == DrmFourcc::Abgr8888 as u32 {
        DrmFourcc::Xbgr8888 as u32
    } else {
        fourcc
    }
}

/// Returns whether `modifier` describes the linear layout.
#[inline]
pub fn is_linear(modifier: u64) -> bool {
    modifier == DRM_FORMAT_MOD_LINEAR || DrmModifier::from(modifier) == DrmModifier::Linear
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgra_maps_to_argb() {
        assert_eq!(
            vk_to_drm_fourcc(vk::Format::B8G8R8A8_SRGB),
            Some(DrmFourcc::Argb8888)
        );
        assert_eq!(
            vk_to_drm_fourcc(vk::Format::R8G8B8A8_UNORM),
            Some(DrmFourcc::Abgr8888)
        );
        assert_eq!(vk_to_drm_fourcc(vk::Format::D32_SFLOAT), None);
    }

    #[test]
    fn alpha_is_remapped_for_8bit_formats_only() {
        assert_eq!(
            opaque_fourcc(DrmFourcc::Argb8888 as u32),
            DrmFourcc::Xrgb8888 as u32
        );
        assert_eq!(
            opaque_fourcc(DrmFourcc::Abgr8888 as u32),
            DrmFourcc::Xbgr8888 as u32
        );
        assert_eq!(
            opaque_fourcc(DrmFourcc::Argb2101010 as u32),
            DrmFourcc::Argb2101010 as u32
        );
    }

    #[test]
    fn bpp() {
        assert_eq!(drm_fourcc_bpp(DrmFourcc::Xrgb8888), Some(32));
        assert_eq!(drm_fourcc_bpp(DrmFourcc::Rgb565), Some(16));
        assert_eq!(drm_fourcc_bpp(DrmFourcc::Nv12), None);
        assert!(is_linear(0));
        assert!(!is_linear(0x0100_0000_0000_0001));
    }
}
