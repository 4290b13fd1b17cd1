//! MAVLink frame boundary detection.
//!
//! The link layer carries opaque bytes. This module only finds frame
//! boundaries and validates checksums so inbound traffic can be attributed to
//! a vehicle; payload meaning is left to downstream consumers.

mod frame;
mod scanner;

pub use frame::{encode_heartbeat, frame_length, MavFrame};
pub use scanner::{FrameScanner, ScannerStats};

pub use mavlink::MavlinkVersion;

/// MAVLink 1 start-of-frame marker.
pub const MAV_STX_V1: u8 = 0xFE;

/// MAVLink 2 start-of-frame marker.
pub const MAV_STX_V2: u8 = 0xFD;

/// Largest possible MAVLink frame (v2, 255-byte payload, signed).
pub const MAX_FRAME_LEN: usize = V2_HEADER_LEN + 255 + CHECKSUM_LEN + SIGNATURE_LEN;

/// Message id of HEARTBEAT.
pub const HEARTBEAT_MSG_ID: u32 = 0;

pub(crate) const V1_HEADER_LEN: usize = 6;
pub(crate) const V2_HEADER_LEN: usize = 10;
pub(crate) const CHECKSUM_LEN: usize = 2;
pub(crate) const SIGNATURE_LEN: usize = 13;
pub(crate) const IFLAG_SIGNED: u8 = 0x01;
