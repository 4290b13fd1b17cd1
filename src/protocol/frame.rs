//! Validated MAVLink frames.

use std::io::Cursor;

use bytes::Bytes;
use mavlink::ardupilotmega::{
    MavAutopilot, MavMessage, MavModeFlag, MavState, MavType, HEARTBEAT_DATA,
};
use mavlink::{MavHeader, MavlinkVersion, Message};

use super::{
    CHECKSUM_LEN, HEARTBEAT_MSG_ID, IFLAG_SIGNED, MAV_STX_V1, MAV_STX_V2, SIGNATURE_LEN,
    V1_HEADER_LEN, V2_HEADER_LEN,
};
use crate::error::{Error, Result};
use crate::types::VehicleId;

/// A checksum-validated MAVLink frame with its raw bytes.
#[derive(Debug, Clone)]
pub struct MavFrame {
    pub version: MavlinkVersion,
    pub system_id: u8,
    pub component_id: u8,
    pub sequence: u8,
    pub message_id: u32,
    /// Complete frame including header, checksum and signature.
    pub raw: Bytes,
}

impl MavFrame {
    /// Validate `raw` as exactly one frame of `version`.
    ///
    /// The frame must start at `raw[0]` and span all of `raw`; the checksum is
    /// verified over that exact slice.
    pub(crate) fn parse(raw: Bytes, version: MavlinkVersion) -> Option<Self> {
        let (expected_len, _) = frame_length(&raw)?;
        if expected_len != raw.len() {
            return None;
        }

        let header_len = match version {
            MavlinkVersion::V1 => V1_HEADER_LEN,
            MavlinkVersion::V2 => V2_HEADER_LEN,
        };
        let payload_len = usize::from(raw[1]);
        let crc_at = header_len + payload_len;
        let (sequence, system_id, component_id, message_id) = match version {
            MavlinkVersion::V1 => (raw[2], raw[3], raw[4], u32::from(raw[5])),
            MavlinkVersion::V2 => (
                raw[4],
                raw[5],
                raw[6],
                u32::from_le_bytes([raw[7], raw[8], raw[9], 0]),
            ),
        };

        let checksum = u16::from_le_bytes([raw[crc_at], raw[crc_at + 1]]);
        let expected = mavlink::calculate_crc(&raw[1..crc_at], MavMessage::extra_crc(message_id));
        if checksum != expected {
            return None;
        }
        // Unknown message ids and malformed payloads are not frames
        MavMessage::parse(version, message_id, &raw[header_len..crc_at]).ok()?;

        Some(Self {
            version,
            system_id,
            component_id,
            sequence,
            message_id,
            raw,
        })
    }

    /// Vehicle this frame belongs to.
    pub fn vehicle(&self) -> VehicleId {
        VehicleId(self.system_id)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.message_id == HEARTBEAT_MSG_ID
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// Total length of the frame starting at `buf[0]`.
///
/// Returns `None` when `buf` does not start with a start-of-frame marker or the
/// header is not complete yet.
pub fn frame_length(buf: &[u8]) -> Option<(usize, MavlinkVersion)> {
    match *buf.first()? {
        MAV_STX_V1 => {
            let payload = usize::from(*buf.get(1)?);
            Some((V1_HEADER_LEN + payload + CHECKSUM_LEN, MavlinkVersion::V1))
        }
        MAV_STX_V2 => {
            let payload = usize::from(*buf.get(1)?);
            let incompat = *buf.get(2)?;
            let signature = if incompat & IFLAG_SIGNED != 0 { SIGNATURE_LEN } else { 0 };
            Some((
                V2_HEADER_LEN + payload + CHECKSUM_LEN + signature,
                MavlinkVersion::V2,
            ))
        }
        _ => None,
    }
}

/// Encode a MAVLink 2 HEARTBEAT as sent by a simulated autopilot.
pub fn encode_heartbeat(system_id: u8, sequence: u8) -> Result<Vec<u8>> {
    let header = MavHeader {
        system_id,
        component_id: 1,
        sequence,
    };
    let message = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_QUADROTOR,
        autopilot: MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA,
        base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
        system_status: MavState::MAV_STATE_STANDBY,
        mavlink_version: 3,
    });

    let mut buf = Cursor::new(Vec::with_capacity(32));
    mavlink::write_v2_msg(&mut buf, header, &message)
        .map_err(|e| Error::Internal(format!("heartbeat encoding failed: {e:?}")))?;
    Ok(buf.into_inner())
}
