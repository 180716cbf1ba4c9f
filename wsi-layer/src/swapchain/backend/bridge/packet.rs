// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

//! Wire format of the bridge protocol.
//!
//! Every message is one fixed-size [`BridgePacket`] in native byte order. FRAME packets carry
//! the plane descriptors as `SCM_RIGHTS` ancillary data, one descriptor per plane.

use bytemuck::{Pod, Zeroable};

pub const BRIDGE_MAGIC: u32 = 0x5844_4246;
pub const BRIDGE_VERSION: u16 = 1;

pub const OP_FRAME: u16 = 1;
pub const OP_STOP: u16 = 2;
pub const OP_HELLO: u16 = 3;
pub const OP_FEEDBACK: u16 = 4;

/// The remote could not use the frame.
pub const FEEDBACK_FAILED: u32 = 1 << 0;
/// Answer to HELLO: the remote acknowledges every frame.
pub const FEEDBACK_CAP_SYNC: u32 = 1 << 16;

/// The id carried by HELLO, "HELO" in ASCII.
pub const HELLO_FRAME_ID: u32 = 0x4845_4c4f;

pub const MAX_PLANES: usize = 4;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BridgePlane {
    pub offset: u32,
    pub stride: u32,
    pub modifier_hi: u32,
    pub modifier_lo: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BridgePacket {
    pub magic: u32,
    pub version: u16,
    pub opcode: u16,
    pub xid: u32,
    pub width: u32,
    pub height: u32,
    /// DRM fourcc.
    pub format: u32,
    pub flags: u32,
    pub num_planes: u32,
    /// Frame id for FRAME and FEEDBACK, [`HELLO_FRAME_ID`] for HELLO.
    pub reserved: u32,
    pub planes: [BridgePlane; MAX_PLANES],
}

pub const PACKET_SIZE: usize = size_of::<BridgePacket>();

/// One plane of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramePlane {
    pub offset: u32,
    pub stride: u32,
}

/// Header of a FRAME packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub xid: u32,
    pub extent: [u32; 2],
    pub fourcc: u32,
    pub modifier: u64,
}

impl BridgePacket {
    fn with_opcode(opcode: u16) -> Self {
        BridgePacket {
            magic: BRIDGE_MAGIC,
            version: BRIDGE_VERSION,
            opcode,
            ..Zeroable::zeroed()
        }
    }

    /// A FRAME packet. Returns `None` if there are no planes or more than [`MAX_PLANES`].
    pub fn frame(header: &FrameHeader, planes: &[FramePlane], frame_id: u32) -> Option<Self> {
        if planes.is_empty() || planes.len() > MAX_PLANES {
            return None;
        }

        let mut packet = Self::with_opcode(OP_FRAME);
        packet.xid = header.xid;
        packet.width = header.extent[0];
        packet.height = header.extent[1];
        packet.format = header.fourcc;
        packet.num_planes = planes.len() as u32;
        packet.reserved = frame_id;

        for (dst, src) in packet.planes.iter_mut().zip(planes) {
            *dst = BridgePlane {
                offset: src.offset,
                stride: src.stride,
                modifier_hi: (header.modifier >> 32) as u32,
                modifier_lo: header.modifier as u32,
            };
        }

        Some(packet)
    }

    pub fn stop(xid: u32) -> Self {
        BridgePacket {
            xid,
            ..Self::with_opcode(OP_STOP)
        }
    }

    pub fn hello() -> Self {
        BridgePacket {
            reserved: HELLO_FRAME_ID,
            ..Self::with_opcode(OP_HELLO)
        }
    }

    pub fn feedback(frame_id: u32, xid: u32, flags: u32) -> Self {
        BridgePacket {
            xid,
            flags,
            reserved: frame_id,
            ..Self::with_opcode(OP_FEEDBACK)
        }
    }

    /// The modifier of the first plane.
    #[inline]
    pub fn modifier(&self) -> u64 {
        (u64::from(self.planes[0].modifier_hi) << 32) | u64::from(self.planes[0].modifier_lo)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Decodes a received message as the FEEDBACK for `frame_id`.
    ///
    /// Messages of the wrong size, magic, version or opcode, or for another frame, yield `None`.
    pub fn decode_feedback(bytes: &[u8], frame_id: u32) -> Option<Feedback> {
        let packet: BridgePacket = bytemuck::try_pod_read_unaligned(bytes).ok()?;

        if packet.magic != BRIDGE_MAGIC
            || packet.version != BRIDGE_VERSION
            || packet.opcode != OP_FEEDBACK
            || packet.reserved != frame_id
        {
            return None;
        }

        Some(Feedback {
            flags: packet.flags,
            xid: packet.xid,
        })
    }
}

/// A FEEDBACK answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Feedback {
    pub flags: u32,
    pub xid: u32,
}

impl Feedback {
    #[inline]
    pub fn failed(&self) -> bool {
        self.flags & FEEDBACK_FAILED != 0
    }

    #[inline]
    pub fn supports_sync(&self) -> bool {
        self.flags & FEEDBACK_CAP_SYNC != 0
    }
}
