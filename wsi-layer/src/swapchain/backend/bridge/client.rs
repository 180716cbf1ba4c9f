// Copyright (c) 2016 The vulkano developers
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or https://opensource.org/licenses/MIT>,
// at your option. All files in the project carrying such
// notice may not be copied, modified, or distributed except
// according to those terms.

use super::packet::{
    BridgePacket, Feedback, FrameHeader, FramePlane, HELLO_FRAME_ID, MAX_PLANES, PACKET_SIZE,
};
use crate::{config::BridgeConfig, memory::DmaBufPlane, VulkanError};
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
    sys::socket::{
        connect, recv, sendmsg, socket, AddressFamily, ControlMessage, MsgFlags, SockFlag,
        SockType, UnixAddr,
    },
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::{
    error::Error,
    fmt::{Debug, Display, Error as FmtError, Formatter},
    io::IoSlice,
    os::fd::{AsFd, AsRawFd, OwnedFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

/// How long the connect-time HELLO waits for an answer.
pub const HELLO_TIMEOUT: Duration = Duration::from_millis(100);

/// A frame to hand to the bridge.
#[derive(Clone, Copy, Debug)]
pub struct BridgeFrame<'a> {
    pub xid: u32,
    pub extent: [u32; 2],
    /// DRM fourcc, already stripped of alpha.
    pub fourcc: u32,
    pub modifier: u64,
    pub planes: &'a [DmaBufPlane],
}

/// Client side of the bridge socket.
///
/// There is one client per process, shared by every swapchain. The socket is connected lazily
/// by the first packet sent. If connecting fails once, it is never retried.
///
/// Once any swapchain fails to hand a frame to the bridge, the client is marked unavailable and
/// swapchains created afterwards no longer select the bridge.
pub struct BridgeClient {
    config: BridgeConfig,
    unavailable: AtomicBool,
    connection: Mutex<Connection>,
}

struct Connection {
    socket: Option<OwnedFd>,
    connect_failed: bool,
    probe_done: bool,
    sync_feedback: bool,
    next_frame_id: u32,
}

impl BridgeClient {
    /// Returns the process-wide client, if the environment requests the bridge.
    pub fn global() -> Option<Arc<BridgeClient>> {
        static CLIENT: OnceLock<Option<Arc<BridgeClient>>> = OnceLock::new();

        CLIENT
            .get_or_init(|| {
                let config = BridgeConfig::from_env();
                config
                    .socket_path
                    .is_some()
                    .then(|| Arc::new(BridgeClient::new(config)))
            })
            .clone()
    }

    /// Creates a client that connects to `config.socket_path` on first use.
    pub fn new(config: BridgeConfig) -> Self {
        BridgeClient {
            config,
            unavailable: AtomicBool::new(false),
            connection: Mutex::new(Connection {
                socket: None,
                connect_failed: false,
                probe_done: false,
                sync_feedback: false,
                next_frame_id: 1,
            }),
        }
    }

    /// Creates a client over an already connected `SOCK_SEQPACKET` socket.
    ///
    /// The HELLO probe is sent with the first packet. Once the socket is reset, the client
    /// reconnects to `config.socket_path` if there is one.
    pub fn from_socket(socket: OwnedFd, config: BridgeConfig) -> Self {
        let client = Self::new(config);
        client.connection.lock().socket = Some(socket);
        client
    }

    #[inline]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Returns whether a transport failure disabled the bridge for this process.
    #[inline]
    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::Acquire)
    }

    /// Disables the bridge for this process. Returns whether it was already disabled.
    #[inline]
    pub fn mark_unavailable(&self) -> bool {
        self.unavailable.swap(true, Ordering::AcqRel)
    }

    /// Returns whether the remote acknowledges each frame on the current connection.
    #[inline]
    pub fn is_feedback_sync_enabled(&self) -> bool {
        self.connection.lock().sync_feedback
    }

    /// Sends a FRAME with the plane descriptors.
    ///
    /// With acknowledgment pacing enabled, this then waits for the remote's FEEDBACK. If the
    /// wait times out, acknowledgment pacing is turned off for the connection and the frame is
    /// still considered delivered.
    pub fn present_frame(&self, frame: &BridgeFrame<'_>) -> Result<(), BridgeError> {
        if frame.planes.is_empty()
            || frame.planes.len() > MAX_PLANES
            || frame.planes.iter().any(|plane| plane.fd < 0)
        {
            return Err(BridgeError::InvalidFrame);
        }

        let mut connection = self.connection.lock();
        self.ensure_connected(&mut connection)?;

        let frame_id = connection.next_frame_id();
        let planes: SmallVec<[_; MAX_PLANES]> = frame
            .planes
            .iter()
            .map(|plane| FramePlane {
                offset: plane.offset,
                stride: plane.stride,
            })
            .collect();
        let header = FrameHeader {
            xid: frame.xid,
            extent: frame.extent,
            fourcc: frame.fourcc,
            modifier: frame.modifier,
        };
        let packet =
            BridgePacket::frame(&header, &planes, frame_id).ok_or(BridgeError::InvalidFrame)?;
        let fds: SmallVec<[RawFd; MAX_PLANES]> =
            frame.planes.iter().map(|plane| plane.fd).collect();

        connection.send(&packet, &fds)?;

        if !connection.sync_feedback {
            return Ok(());
        }

        match connection.wait_for_feedback(frame_id, self.config.feedback_timeout) {
            Some(feedback) if feedback.failed() => {
                log::warn!(
                    "bridge rejected frame {} for window {:#x} (ack window {:#x})",
                    frame_id,
                    frame.xid,
                    feedback.xid,
                );
            }
            Some(_) => {}
            None => {
                log::warn!(
                    "timed out waiting for bridge feedback (frame {}, window {:#x}), disabling \
                    sync feedback",
                    frame_id,
                    frame.xid,
                );
                connection.sync_feedback = false;
            }
        }

        Ok(())
    }

    /// Tells the remote that no more frames will come for `xid`.
    pub fn stop_stream(&self, xid: u32) {
        let mut connection = self.connection.lock();

        let result = self
            .ensure_connected(&mut connection)
            .and_then(|()| connection.send(&BridgePacket::stop(xid), &[]));

        if let Err(err) = result {
            log::debug!("bridge STOP for window {:#x} not sent: {}", xid, err);
        }
    }

    fn ensure_connected(&self, connection: &mut Connection) -> Result<(), BridgeError> {
        if connection.socket.is_some() {
            if !connection.probe_done {
                connection.probe_feedback_support();
            }

            return Ok(());
        }

        if connection.connect_failed {
            return Err(BridgeError::ConnectFailed);
        }

        let path = self
            .config
            .socket_path
            .as_ref()
            .ok_or(BridgeError::NotConfigured)?;

        let socket = UnixAddr::new(path.as_path()).and_then(|addr| {
            let socket = socket(
                AddressFamily::Unix,
                SockType::SeqPacket,
                SockFlag::SOCK_CLOEXEC,
                None,
            )?;
            connect(socket.as_raw_fd(), &addr)?;

            Ok(socket)
        });

        match socket {
            Ok(socket) => {
                log::info!("connected to DMA-buf bridge at {}", path.display());
                connection.socket = Some(socket);
                connection.probe_done = false;
                connection.sync_feedback = false;
                connection.probe_feedback_support();

                Ok(())
            }
            Err(err) => {
                log::warn!("connecting to bridge at {} failed: {}", path.display(), err);
                connection.connect_failed = true;

                Err(BridgeError::Connect(err))
            }
        }
    }
}

impl Debug for BridgeClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.debug_struct("BridgeClient")
            .field("config", &self.config)
            .field("unavailable", &self.is_unavailable())
            .finish_non_exhaustive()
    }
}

impl Connection {
    fn next_frame_id(&mut self) -> u32 {
        let mut frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);

        if frame_id == 0 {
            frame_id = self.next_frame_id;
            self.next_frame_id = self.next_frame_id.wrapping_add(1);
        }

        frame_id
    }

    fn reset(&mut self) {
        self.socket = None;
        self.probe_done = false;
        self.sync_feedback = false;
    }

    fn probe_feedback_support(&mut self) {
        self.probe_done = true;

        if self.send(&BridgePacket::hello(), &[]).is_err() {
            return;
        }

        match self.wait_for_feedback(HELLO_FRAME_ID, HELLO_TIMEOUT) {
            Some(feedback) if feedback.supports_sync() => {
                log::info!("bridge sync feedback enabled");
                self.sync_feedback = true;
            }
            _ => log::info!("bridge sync feedback unsupported, using fixed-rate pacing"),
        }
    }

    fn send(&mut self, packet: &BridgePacket, fds: &[RawFd]) -> Result<(), BridgeError> {
        let socket = self.socket.as_ref().ok_or(BridgeError::NotConnected)?;
        let bytes = packet.as_bytes();
        let iov = [IoSlice::new(bytes)];
        let rights = [ControlMessage::ScmRights(fds)];
        let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };

        match sendmsg::<()>(socket.as_raw_fd(), &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None) {
            Ok(sent) if sent == bytes.len() => Ok(()),
            Ok(sent) => {
                log::warn!("bridge short send: expected {} sent {}", bytes.len(), sent);
                self.reset();

                Err(BridgeError::ShortSend {
                    sent,
                    expected: bytes.len(),
                })
            }
            Err(err) => {
                log::warn!("bridge sendmsg failed: {}", err);
                self.reset();

                Err(BridgeError::Send(err))
            }
        }
    }

    // Returns `None` on timeout, or if the connection was lost while waiting.
    fn wait_for_feedback(&mut self, frame_id: u32, timeout: Duration) -> Option<Feedback> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; PACKET_SIZE];

        loop {
            let socket = self.socket.as_ref()?;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && !timeout.is_zero() {
                return None;
            }
            let remaining_ms = match remaining.as_millis() {
                0 if !timeout.is_zero() => 1,
                ms => ms.min(u128::from(u16::MAX)) as u16,
            };

            let mut fds = [PollFd::new(socket.as_fd(), PollFlags::POLLIN)];
            let revents = match poll(&mut fds, PollTimeout::from(remaining_ms)) {
                Ok(0) => return None,
                Ok(_) => fds[0].revents().unwrap_or(PollFlags::empty()),
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    log::warn!("bridge poll failed while waiting for feedback: {}", err);
                    self.reset();
                    return None;
                }
            };

            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                log::warn!("bridge feedback channel closed ({:?})", revents);
                self.reset();
                return None;
            }

            if !revents.contains(PollFlags::POLLIN) {
                continue;
            }

            match recv(socket.as_raw_fd(), &mut buf, MsgFlags::MSG_DONTWAIT) {
                Ok(0) => {
                    self.reset();
                    return None;
                }
                Ok(received) => {
                    if received != PACKET_SIZE {
                        log::warn!(
                            "bridge feedback size mismatch: expected {} got {}",
                            PACKET_SIZE,
                            received,
                        );
                        continue;
                    }

                    if let Some(feedback) = BridgePacket::decode_feedback(&buf, frame_id) {
                        return Some(feedback);
                    }
                }
                Err(Errno::EINTR | Errno::EAGAIN) => continue,
                Err(err) => {
                    log::warn!("bridge recv failed while waiting for feedback: {}", err);
                    self.reset();
                    return None;
                }
            }
        }
    }
}

/// Error that can happen when talking to the bridge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BridgeError {
    /// No socket path is configured.
    NotConfigured,

    /// Connecting failed.
    Connect(Errno),

    /// Connecting failed earlier and is not retried.
    ConnectFailed,

    /// The connection was reset and could not be restored.
    NotConnected,

    /// The frame has no planes, too many planes, or an invalid descriptor.
    InvalidFrame,

    /// `sendmsg` failed.
    Send(Errno),

    /// `sendmsg` sent part of the packet.
    ShortSend { sent: usize, expected: usize },
}

impl Error for BridgeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Connect(err) | Self::Send(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for BridgeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        match self {
            Self::NotConfigured => write!(f, "no bridge socket is configured"),
            Self::Connect(_) => write!(f, "connecting to the bridge failed"),
            Self::ConnectFailed => write!(f, "connecting to the bridge failed earlier"),
            Self::NotConnected => write!(f, "the bridge connection was lost"),
            Self::InvalidFrame => write!(f, "the frame cannot be described to the bridge"),
            Self::Send(_) => write!(f, "sending to the bridge failed"),
            Self::ShortSend { sent, expected } => write!(
                f,
                "the bridge accepted {} of {} bytes",
                sent, expected,
            ),
        }
    }
}

impl From<BridgeError> for VulkanError {
    fn from(_: BridgeError) -> Self {
        VulkanError::OutOfDate
    }
}

#[cfg(test)]
mod tests {
    use super::{BridgeClient, BridgeError, BridgeFrame};
    use crate::{
        config::BridgeConfig,
        memory::DmaBufPlane,
        swapchain::backend::bridge::packet::{
            BridgePacket, FEEDBACK_CAP_SYNC, HELLO_FRAME_ID, OP_FRAME, OP_HELLO, OP_STOP,
            PACKET_SIZE,
        },
        tests::temp_fd,
    };
    use nix::sys::socket::{
        recv, send, socketpair, AddressFamily, MsgFlags, SockFlag, SockType,
    };
    use std::{
        os::fd::{AsRawFd, OwnedFd},
        thread,
        time::{Duration, Instant},
    };

    fn pair() -> (OwnedFd, OwnedFd) {
        socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap()
    }

    fn read_packet(remote: &OwnedFd) -> BridgePacket {
        let mut buf = [0u8; PACKET_SIZE];
        let received = recv(remote.as_raw_fd(), &mut buf, MsgFlags::empty()).unwrap();
        assert_eq!(received, PACKET_SIZE);
        bytemuck::pod_read_unaligned(&buf)
    }

    fn write_packet(remote: &OwnedFd, packet: &BridgePacket) {
        send(remote.as_raw_fd(), packet.as_bytes(), MsgFlags::empty()).unwrap();
    }

    fn config(feedback_timeout: Duration) -> BridgeConfig {
        BridgeConfig {
            feedback_timeout,
            ..Default::default()
        }
    }

    fn plane(fd: i32) -> DmaBufPlane {
        DmaBufPlane {
            fd,
            offset: 0,
            stride: 256,
        }
    }

    #[test]
    fn frames_are_numbered_from_one() {
        let (local, remote) = pair();
        let client = BridgeClient::from_socket(local, config(Duration::from_millis(50)));
        let planes = [plane(temp_fd(4096))];
        let frame = BridgeFrame {
            xid: 0x20_0003,
            extent: [64, 16],
            fourcc: 0x3432_5258,
            modifier: 0,
            planes: &planes,
        };

        client.present_frame(&frame).unwrap();
        client.present_frame(&frame).unwrap();
        client.stop_stream(0x20_0003);

        let hello = read_packet(&remote);
        assert_eq!(hello.opcode, OP_HELLO);
        assert_eq!(hello.reserved, HELLO_FRAME_ID);

        let first = read_packet(&remote);
        assert_eq!(first.opcode, OP_FRAME);
        assert_eq!(first.reserved, 1);
        assert_eq!(first.xid, 0x20_0003);
        assert_eq!([first.width, first.height], [64, 16]);
        assert_eq!(read_packet(&remote).reserved, 2);
        assert_eq!(read_packet(&remote).opcode, OP_STOP);

        assert!(!client.is_feedback_sync_enabled());
    }

    #[test]
    fn acknowledged_frames_keep_sync_enabled() {
        let (local, remote) = pair();
        let client = BridgeClient::from_socket(local, config(Duration::from_secs(2)));

        let server = thread::spawn(move || {
            let hello = read_packet(&remote);
            write_packet(&remote, &BridgePacket::feedback(hello.reserved, 0, FEEDBACK_CAP_SYNC));

            for _ in 0..2 {
                let frame = read_packet(&remote);
                // A stale answer first, which must be ignored.
                write_packet(&remote, &BridgePacket::feedback(frame.reserved + 100, 0, 0));
                write_packet(&remote, &BridgePacket::feedback(frame.reserved, frame.xid, 0));
            }
        });

        let planes = [plane(temp_fd(4096))];
        let frame = BridgeFrame {
            xid: 7,
            extent: [8, 8],
            fourcc: 0,
            modifier: 0,
            planes: &planes,
        };
        client.present_frame(&frame).unwrap();
        client.present_frame(&frame).unwrap();
        assert!(client.is_feedback_sync_enabled());

        server.join().unwrap();
    }

    #[test]
    fn missing_feedback_downgrades_after_one_timeout() {
        let (local, remote) = pair();
        let timeout = Duration::from_millis(30);
        let client = BridgeClient::from_socket(local, config(timeout));

        let server = thread::spawn(move || {
            let hello = read_packet(&remote);
            write_packet(&remote, &BridgePacket::feedback(hello.reserved, 0, FEEDBACK_CAP_SYNC));
            // Never acknowledge frames, but keep the socket open until both were received.
            read_packet(&remote);
            read_packet(&remote);
        });

        let planes = [plane(temp_fd(4096))];
        let frame = BridgeFrame {
            xid: 7,
            extent: [8, 8],
            fourcc: 0,
            modifier: 0,
            planes: &planes,
        };

        let start = Instant::now();
        client.present_frame(&frame).unwrap();
        assert!(start.elapsed() >= timeout);
        assert!(!client.is_feedback_sync_enabled());

        let start = Instant::now();
        client.present_frame(&frame).unwrap();
        assert!(start.elapsed() < timeout);

        server.join().unwrap();
    }

    #[test]
    fn closed_remote_fails_the_send() {
        let (local, remote) = pair();
        let client = BridgeClient::from_socket(local, config(Duration::from_millis(10)));
        drop(remote);

        let planes = [plane(temp_fd(4096))];
        let frame = BridgeFrame {
            xid: 7,
            extent: [8, 8],
            fourcc: 0,
            modifier: 0,
            planes: &planes,
        };
        assert!(client.present_frame(&frame).is_err());
        // No socket path to reconnect to.
        assert_eq!(
            client.present_frame(&frame),
            Err(BridgeError::NotConfigured)
        );
    }

    #[test]
    fn connect_failure_is_sticky() {
        let client = BridgeClient::new(BridgeConfig {
            socket_path: Some("/nonexistent/bridge.sock".into()),
            ..Default::default()
        });
        let planes = [plane(temp_fd(4096))];
        let frame = BridgeFrame {
            xid: 1,
            extent: [1, 1],
            fourcc: 0,
            modifier: 0,
            planes: &planes,
        };

        assert!(matches!(
            client.present_frame(&frame),
            Err(BridgeError::Connect(_))
        ));
        assert_eq!(
            client.present_frame(&frame),
            Err(BridgeError::ConnectFailed)
        );
    }

    #[test]
    fn invalid_frames_are_rejected_before_sending() {
        let client = BridgeClient::new(BridgeConfig::default());
        let frame = BridgeFrame {
            xid: 1,
            extent: [1, 1],
            fourcc: 0,
            modifier: 0,
            planes: &[plane(-1)],
        };
        assert_eq!(client.present_frame(&frame), Err(BridgeError::InvalidFrame));
    }

    #[test]
    fn unavailable_flag_is_sticky() {
        let client = BridgeClient::new(BridgeConfig::default());
        assert!(!client.is_unavailable());
        assert!(!client.mark_unavailable());
        assert!(client.mark_unavailable());
        assert!(client.is_unavailable());
    }
}
