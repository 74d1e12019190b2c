use uuid::Uuid;

use crate::error::SensorError;

pub mod params;

/**
 * The UUID of the Bluetooth BLE service exposed by the probe.
 */
pub const PROBE_SERVICE: &str = "7b9a1c00-63d4-49e2-8f1b-200000000000";

/**
 * The UUID of the remote GATT characteristic commands are written to.
 */
pub const PROBE_DOWN_CHARACTERISTIC: &str = "7b9a1c00-63d4-49e2-8f1b-200000000001";

/**
 * The UUID of the remote GATT characteristic response/notification frames
 * arrive on.
 */
pub const PROBE_UP_CHARACTERISTIC: &str = "7b9a1c00-63d4-49e2-8f1b-200000000002";

pub fn make_probe_service_uuid() -> Uuid {
    Uuid::parse_str(PROBE_SERVICE).unwrap()
}

pub fn make_probe_down_uuid() -> Uuid {
    Uuid::parse_str(PROBE_DOWN_CHARACTERISTIC).unwrap()
}

pub fn make_probe_up_uuid() -> Uuid {
    Uuid::parse_str(PROBE_UP_CHARACTERISTIC).unwrap()
}

pub const HEAD_TO_SENSOR: u8 = 0x50;
pub const HEAD_FROM_SENSOR: u8 = 0xA0;

// head + opcode + u16 length + trailing checksum
pub const FRAME_OVERHEAD: usize = 5;

pub mod opcode {
    /// Start an acquisition (vibration one-shot or temperature stream).
    pub const ACQUIRE: u8 = 0x01;
    /// Stop a running acquisition.
    pub const STOP_SAMPLE: u8 = 0x05;
    pub const SET_SYSTEM_PARAMS: u8 = 0x06;
    pub const PREPARE_UPGRADE: u8 = 0x07;
    pub const UPGRADE_DATA: u8 = 0x08;
    pub const CALIBRATE_VIBRATION: u8 = 0x09;
    pub const SELF_CHECK: u8 = 0x0A;
    pub const SET_TEMP_CALIBRATION: u8 = 0x0B;
    pub const GET_SYSTEM_PARAMS: u8 = 0x0C;
    pub const GET_TEMP_LINEAR: u8 = 0x0D;
    pub const SET_TEMP_LINEAR: u8 = 0x0E;
    pub const GET_TEMP_CALIBRATION: u8 = 0x0F;
    /// Unsolicited temperature notification while a temp stream is active.
    pub const TEMP_DATA: u8 = 0x15;
}

/// Wrapping byte sum over everything before the checksum position.
fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Wraps a payload into a host→sensor frame.
pub fn pack_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let total = payload.len() + FRAME_OVERHEAD;
    let mut frame = Vec::with_capacity(total);
    frame.push(HEAD_TO_SENSOR);
    frame.push(opcode);
    frame.extend_from_slice(&(total as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    frame
}

/// Verifies head, length and checksum of a sensor→host frame and returns
/// its opcode and payload.
pub fn unpack_frame(frame: &[u8]) -> Result<(u8, &[u8]), SensorError> {
    unpack_with_head(frame, HEAD_FROM_SENSOR)
}

/// The device side of [`pack_frame`]: parses a host→sensor frame. Used by
/// the mock transport to interpret written commands.
pub fn unpack_host_frame(frame: &[u8]) -> Result<(u8, &[u8]), SensorError> {
    unpack_with_head(frame, HEAD_TO_SENSOR)
}

fn unpack_with_head(frame: &[u8], head: u8) -> Result<(u8, &[u8]), SensorError> {
    if frame.len() < FRAME_OVERHEAD {
        return Err(SensorError::Protocol(format!("frame too short: {} bytes", frame.len())));
    }
    if frame[0] != head {
        return Err(SensorError::Protocol(format!("unexpected head byte 0x{:02X}", frame[0])));
    }
    let declared = u16::from_le_bytes([frame[2], frame[3]]) as usize;
    if declared != frame.len() {
        return Err(SensorError::Protocol(format!(
            "frame length mismatch: declared {}, received {}",
            declared,
            frame.len(),
        )));
    }
    let cs = checksum(&frame[..frame.len() - 1]);
    if cs != frame[frame.len() - 1] {
        return Err(SensorError::Protocol(format!(
            "checksum mismatch: computed 0x{:02X}, received 0x{:02X}",
            cs,
            frame[frame.len() - 1],
        )));
    }
    Ok((frame[1], &frame[4..frame.len() - 1]))
}

/// Builds a sensor→host frame. The probe side of the codec, used by the
/// mock transport and the tests.
pub fn pack_response(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let total = payload.len() + FRAME_OVERHEAD;
    let mut frame = Vec::with_capacity(total);
    frame.push(HEAD_FROM_SENSOR);
    frame.push(opcode);
    frame.extend_from_slice(&(total as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.push(checksum(&frame));
    frame
}

/// CRC32 (reflected, polynomial 0xEDB88320) over a firmware image; the
/// probe verifies it after the last upgrade frame lands.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for byte in data {
        let mut temp = (crc & 0xFF) ^ u32::from(*byte);
        for _ in 0..8 {
            temp = if temp & 0x1 != 0 {
                (temp >> 1) ^ 0xEDB8_8320
            } else {
                temp >> 1
            };
        }
        crc = (crc >> 8) ^ temp;
    }
    crc ^ 0xFFFF_FFFF
}
