//! Shared fixtures: a scripted probe wired into a client.
#![allow(dead_code)]

use std::sync::Arc;

use vibrotherm::protocol::{self, opcode, params};
use vibrotherm::transport::mock::MockTransport;
use vibrotherm::{ClientConfig, Device, SensorClient};

pub fn ack(op: u8) -> Vec<u8> {
    protocol::pack_response(op, &[params::ACK_OK])
}

pub fn refuse(op: u8) -> Vec<u8> {
    protocol::pack_response(op, &[0x00])
}

pub fn system_params_payload(sn: u32) -> Vec<u8> {
    let mut payload = params::encode_system_params(sn, 9.806, 0.97, 30, 2.1);
    payload.extend_from_slice(&3u16.to_le_bytes());
    payload.extend_from_slice(&12u16.to_le_bytes());
    payload.extend_from_slice(&1u16.to_le_bytes());
    payload.extend_from_slice(&4u16.to_le_bytes());
    payload
}

pub fn temp_frame(temp: f32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&91_000_001u32.to_le_bytes());
    payload.extend_from_slice(&temp.to_le_bytes());
    payload.extend_from_slice(&3.7f32.to_le_bytes());
    payload.extend_from_slice(&0.012f32.to_le_bytes());
    protocol::pack_response(opcode::TEMP_DATA, &payload)
}

fn self_check_payload() -> Vec<u8> {
    let mut payload = vec![0x02];
    payload.extend_from_slice(&91_000_001u32.to_le_bytes());
    payload.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    payload.push(-60i8 as u8);
    payload.push(-42i8 as u8);
    payload
}

fn vib_block(len: usize) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&0.5f32.to_le_bytes());
    for i in 0..len {
        payload.extend_from_slice(&(i as i16).to_le_bytes());
    }
    payload
}

/// A well-behaved probe with the given serial: answers every command the
/// way the firmware would.
pub fn standard_probe(sn: u32) -> impl FnMut(u8, &[u8]) -> Vec<Vec<u8>> + Send + 'static {
    move |op, payload| match op {
        opcode::GET_SYSTEM_PARAMS => {
            vec![protocol::pack_response(op, &system_params_payload(sn))]
        }
        opcode::SET_SYSTEM_PARAMS => vec![ack(op)],
        opcode::ACQUIRE => {
            let len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
            if payload[8] == params::ACQUIRE_TEMPERATURE {
                vec![ack(op)]
            } else {
                vec![protocol::pack_response(op, &vib_block(len as usize))]
            }
        }
        opcode::STOP_SAMPLE => vec![ack(op)],
        opcode::CALIBRATE_VIBRATION => {
            vec![protocol::pack_response(op, &1.25f32.to_le_bytes())]
        }
        opcode::SELF_CHECK => vec![protocol::pack_response(op, &self_check_payload())],
        opcode::GET_TEMP_CALIBRATION => {
            let calibration = params::TempCalibration {
                offset: 0.5,
                env_temp: 21.0,
                target: 36.6,
            };
            vec![protocol::pack_response(op, &calibration.encode())]
        }
        opcode::SET_TEMP_CALIBRATION | opcode::SET_TEMP_LINEAR => vec![ack(op)],
        opcode::GET_TEMP_LINEAR => {
            let coefficients = params::LinearCoefficients {
                coe1: [1.0; 7],
                coe2: [2.0; 7],
                offset: [0.0; 7],
            };
            vec![protocol::pack_response(op, &coefficients.encode())]
        }
        opcode::PREPARE_UPGRADE => vec![ack(op)],
        opcode::UPGRADE_DATA => {
            let mut response = payload[0..4].to_vec();
            response.push(params::ACK_OK);
            vec![protocol::pack_response(op, &response)]
        }
        _ => Vec::new(),
    }
}

pub fn fresh_client() -> (SensorClient, MockTransport, Device) {
    let (transport, discovered) = MockTransport::with_sample_device();
    let client = SensorClient::initialize(ClientConfig::default(), Arc::new(transport.clone()))
        .expect("config must validate");
    (client, transport, Device::from(&discovered))
}

/// Client already connected to a probe with the given serial.
pub async fn connected_client(sn: u32) -> (SensorClient, MockTransport, Device) {
    let (client, transport, device) = fresh_client();
    transport.set_responder(standard_probe(sn));
    client.connect(&device).await.expect("connect must succeed");
    (client, transport, device)
}
