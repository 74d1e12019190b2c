//! Fixed-width payload codecs, one per command type. All fields are
//! little-endian; offsets are relative to the unwrapped frame payload.

use crate::error::SensorError;

pub const ACK_LEN: usize = 1;
pub const ACK_OK: u8 = 0x01;

pub const SYSTEM_PARAMS_READ_LEN: usize = 28;
pub const SYSTEM_PARAMS_WRITE_LEN: usize = 20;
pub const TEMP_CALIBRATION_LEN: usize = 12;
pub const LINEAR_COEFFICIENTS_LEN: usize = 84;
pub const TEMP_READING_LEN: usize = 16;
pub const SELF_CHECK_LEN: usize = 13;
pub const ACQUIRE_LEN: usize = 13;
pub const CALIBRATE_LEN: usize = 8;
pub const CALIBRATE_RESULT_LEN: usize = 4;
pub const UPGRADE_PREPARE_LEN: usize = 17;
pub const UPGRADE_FRAME_ACK_LEN: usize = 5;

/// Payload bytes of firmware carried per upgrade frame.
pub const UPGRADE_CHUNK_SIZE: usize = 236;

pub const ACQUIRE_VIBRATION: u8 = 0x00;
pub const ACQUIRE_TEMPERATURE: u8 = 0x01;

fn short_payload(what: &str, want: usize, got: usize) -> SensorError {
    SensorError::Protocol(format!("{} payload: expected {} bytes, got {}", what, want, got))
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_f32(bytes: &[u8], at: usize) -> f32 {
    f32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Decodes a plain status acknowledgement. Anything other than `ACK_OK` is a
/// device-side refusal.
pub fn decode_ack(payload: &[u8], what: &str) -> Result<(), SensorError> {
    if payload.len() != ACK_LEN {
        return Err(short_payload(what, ACK_LEN, payload.len()));
    }
    if payload[0] != ACK_OK {
        return Err(SensorError::Rejected(format!("{}: device replied status 0x{:02X}", what, payload[0])));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemParams {
    pub sn: u32,
    pub accel_coefficient: f32,
    pub emissivity: f32,
    pub standby_minutes: u32,
    pub hardware_version: f32,
    pub main_version_unit: u16,
    pub sub_version_unit: u16,
    pub main_version_temp: u16,
    pub sub_version_temp: u16,
}

impl SystemParams {
    pub fn decode(payload: &[u8]) -> Result<Self, SensorError> {
        if payload.len() != SYSTEM_PARAMS_READ_LEN {
            return Err(short_payload("system params", SYSTEM_PARAMS_READ_LEN, payload.len()));
        }
        Ok(SystemParams {
            sn: read_u32(payload, 0),
            accel_coefficient: read_f32(payload, 4),
            emissivity: read_f32(payload, 8),
            standby_minutes: read_u32(payload, 12),
            hardware_version: read_f32(payload, 16),
            main_version_unit: read_u16(payload, 20),
            sub_version_unit: read_u16(payload, 22),
            main_version_temp: read_u16(payload, 24),
            sub_version_temp: read_u16(payload, 26),
        })
    }

    /// Firmware version of the main unit, e.g. "3.12".
    pub fn unit_version(&self) -> String {
        format!("{}.{}", self.main_version_unit, self.sub_version_unit)
    }

    /// Firmware version of the temperature module.
    pub fn temp_version(&self) -> String {
        format!("{}.{}", self.main_version_temp, self.sub_version_temp)
    }
}

/// Encodes the writable subset of the system params.
pub fn encode_system_params(
    sn: u32,
    accel_coefficient: f32,
    emissivity: f32,
    standby_minutes: u32,
    hardware_version: f32,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(SYSTEM_PARAMS_WRITE_LEN);
    payload.extend_from_slice(&sn.to_le_bytes());
    payload.extend_from_slice(&accel_coefficient.to_le_bytes());
    payload.extend_from_slice(&emissivity.to_le_bytes());
    payload.extend_from_slice(&standby_minutes.to_le_bytes());
    payload.extend_from_slice(&hardware_version.to_le_bytes());
    payload
}

/// The guarded-write precondition: system params may only be rewritten while
/// the probe carries a factory serial, exactly 8 decimal digits with a
/// leading 9.
pub fn sn_allows_write(sn: u32) -> bool {
    (90_000_000..=99_999_999).contains(&sn)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempCalibration {
    pub offset: f32,
    pub env_temp: f32,
    pub target: f32,
}

impl TempCalibration {
    pub fn decode(payload: &[u8]) -> Result<Self, SensorError> {
        if payload.len() != TEMP_CALIBRATION_LEN {
            return Err(short_payload("temp calibration", TEMP_CALIBRATION_LEN, payload.len()));
        }
        Ok(TempCalibration {
            offset: read_f32(payload, 0),
            env_temp: read_f32(payload, 4),
            target: read_f32(payload, 8),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(TEMP_CALIBRATION_LEN);
        payload.extend_from_slice(&self.offset.to_le_bytes());
        payload.extend_from_slice(&self.env_temp.to_le_bytes());
        payload.extend_from_slice(&self.target.to_le_bytes());
        payload
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinearCoefficients {
    pub coe1: [f32; 7],
    pub coe2: [f32; 7],
    pub offset: [f32; 7],
}

impl LinearCoefficients {
    pub fn decode(payload: &[u8]) -> Result<Self, SensorError> {
        if payload.len() != LINEAR_COEFFICIENTS_LEN {
            return Err(short_payload("linear coefficients", LINEAR_COEFFICIENTS_LEN, payload.len()));
        }
        let mut result = LinearCoefficients {
            coe1: [0.0; 7],
            coe2: [0.0; 7],
            offset: [0.0; 7],
        };
        for i in 0..7 {
            result.coe1[i] = read_f32(payload, i * 4);
            result.coe2[i] = read_f32(payload, 28 + i * 4);
            result.offset[i] = read_f32(payload, 56 + i * 4);
        }
        Ok(result)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(LINEAR_COEFFICIENTS_LEN);
        for v in &self.coe1 {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        for v in &self.coe2 {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        for v in &self.offset {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        payload
    }
}

/**
 * A single temperature notification. Besides the temperature the probe
 * reports its serial and battery figures with every value.
 */
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempReading {
    pub sn: u32,
    pub temp: f32,
    pub battery_voltage: f32,
    pub battery_current: f32,
}

impl TempReading {
    pub fn decode(payload: &[u8]) -> Result<Self, SensorError> {
        if payload.len() != TEMP_READING_LEN {
            return Err(short_payload("temp reading", TEMP_READING_LEN, payload.len()));
        }
        Ok(TempReading {
            sn: read_u32(payload, 0),
            temp: read_f32(payload, 4),
            battery_voltage: read_f32(payload, 8),
            battery_current: read_f32(payload, 12),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Normal,
    Abnormal,
}

impl From<u8> for ModuleStatus {
    fn from(status: u8) -> Self {
        if status == 0 { ModuleStatus::Normal } else { ModuleStatus::Abnormal }
    }
}

/// Hardware self-test report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfCheckReport {
    pub node_type: u8,
    pub sn: u32,
    pub rtc: ModuleStatus,
    pub ad: ModuleStatus,
    pub mems: ModuleStatus,
    pub flash: ModuleStatus,
    pub temp: ModuleStatus,
    pub radio: ModuleStatus,
    pub radio_signal: i8,
    pub bt_signal: i8,
}

impl SelfCheckReport {
    pub fn decode(payload: &[u8]) -> Result<Self, SensorError> {
        if payload.len() != SELF_CHECK_LEN {
            return Err(short_payload("self check", SELF_CHECK_LEN, payload.len()));
        }
        Ok(SelfCheckReport {
            node_type: payload[0],
            sn: read_u32(payload, 1),
            rtc: payload[5].into(),
            ad: payload[6].into(),
            mems: payload[7].into(),
            flash: payload[8].into(),
            temp: payload[9].into(),
            radio: payload[10].into(),
            radio_signal: payload[11] as i8,
            bt_signal: payload[12] as i8,
        })
    }

    pub fn all_normal(&self) -> bool {
        [self.rtc, self.ad, self.mems, self.flash, self.temp, self.radio]
            .iter()
            .all(|s| *s == ModuleStatus::Normal)
    }
}

/// Encodes an acquisition start. Vibration runs pass the block length and
/// analysis frequency; temperature runs pass the emissivity.
pub fn encode_acquire(length: u32, frequency: u32, mode: u8, emissivity: f32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(ACQUIRE_LEN);
    payload.extend_from_slice(&length.to_le_bytes());
    payload.extend_from_slice(&frequency.to_le_bytes());
    payload.push(mode);
    payload.extend_from_slice(&emissivity.to_le_bytes());
    payload
}

pub fn encode_calibrate(length: u32, frequency: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(CALIBRATE_LEN);
    payload.extend_from_slice(&length.to_le_bytes());
    payload.extend_from_slice(&frequency.to_le_bytes());
    payload
}

pub fn decode_calibrate_result(payload: &[u8]) -> Result<f32, SensorError> {
    if payload.len() != CALIBRATE_RESULT_LEN {
        return Err(short_payload("calibration result", CALIBRATE_RESULT_LEN, payload.len()));
    }
    Ok(read_f32(payload, 0))
}

/// A raw vibration block: `coefficient` followed by i16 samples.
pub fn decode_vib_block(payload: &[u8], expected_samples: usize) -> Result<(f32, Vec<i16>), SensorError> {
    let want = 4 + expected_samples * 2;
    if payload.len() != want {
        return Err(short_payload("vibration block", want, payload.len()));
    }
    let coefficient = read_f32(payload, 0);
    let mut samples = Vec::with_capacity(expected_samples);
    for i in 0..expected_samples {
        let at = 4 + i * 2;
        samples.push(i16::from_le_bytes([payload[at], payload[at + 1]]));
    }
    Ok((coefficient, samples))
}

pub fn encode_upgrade_prepare(sn: u32, image_len: u32, crc: u32, frame_count: u32, target: u8) -> Vec<u8> {
    let mut payload = Vec::with_capacity(UPGRADE_PREPARE_LEN);
    payload.extend_from_slice(&sn.to_le_bytes());
    payload.extend_from_slice(&image_len.to_le_bytes());
    payload.extend_from_slice(&crc.to_le_bytes());
    payload.extend_from_slice(&frame_count.to_le_bytes());
    payload.push(target);
    payload
}

/// One upgrade frame: index plus a fixed-size chunk, the last one padded
/// with zeroes out to `UPGRADE_CHUNK_SIZE`.
pub fn encode_upgrade_frame(image: &[u8], index: usize) -> Vec<u8> {
    let start = index * UPGRADE_CHUNK_SIZE;
    let end = (start + UPGRADE_CHUNK_SIZE).min(image.len());
    let mut payload = Vec::with_capacity(4 + UPGRADE_CHUNK_SIZE);
    payload.extend_from_slice(&(index as u32).to_le_bytes());
    payload.extend_from_slice(&image[start..end]);
    payload.resize(4 + UPGRADE_CHUNK_SIZE, 0);
    payload
}

pub fn decode_upgrade_frame_ack(payload: &[u8]) -> Result<u32, SensorError> {
    if payload.len() != UPGRADE_FRAME_ACK_LEN {
        return Err(short_payload("upgrade frame ack", UPGRADE_FRAME_ACK_LEN, payload.len()));
    }
    let index = read_u32(payload, 0);
    if payload[4] != ACK_OK {
        return Err(SensorError::Rejected(format!(
            "upgrade frame {}: device replied status 0x{:02X}",
            index, payload[4],
        )));
    }
    Ok(index)
}
