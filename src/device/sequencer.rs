//! Per-device command sequencer.
//!
//! Every connected device gets one of these tasks. All traffic to the device
//! funnels through its mailbox, which yields single-flight ordering, the
//! enforced gap between consecutive writes and arrival-order correlation
//! without any shared locks. Sequencers of different devices run
//! independently.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::SensorError;
use crate::protocol::{self, opcode};
use crate::protocol::params::TempReading;
use crate::transport::Transport;

/// Park interval for the timer branches while they have nothing to wake for.
const IDLE_PARK: Duration = Duration::from_secs(3600);

pub(crate) struct CommandRequest {
    pub opcode: u8,
    pub payload: Vec<u8>,
    /// Payload length the correlated response must have.
    pub expect_len: usize,
    pub timeout: Duration,
    pub reply: oneshot::Sender<Result<Vec<u8>, SensorError>>,
}

pub(crate) enum SequencerInput {
    Command(CommandRequest),
    /// Registers the temperature subscriber for unsolicited readings.
    SetTempSink(mpsc::Sender<TempReading>),
    /// Silences local delivery only; the device keeps sending.
    MuteTempSink,
    /// Forgets the subscriber entirely (after a network-level stop).
    ClearTempSink,
}

struct InFlight {
    opcode: u8,
    expect_len: usize,
    deadline: Instant,
    timeout: Duration,
    reply: oneshot::Sender<Result<Vec<u8>, SensorError>>,
}

struct TempSink {
    tx: mpsc::Sender<TempReading>,
    muted: bool,
}

pub(crate) fn spawn_sequencer(
    mac: String,
    transport: Arc<dyn Transport>,
    notifications: mpsc::Receiver<Vec<u8>>,
    write_gap: Duration,
    cancel: CancellationToken,
    loss_tx: mpsc::Sender<String>,
) -> mpsc::Sender<SequencerInput> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(run(mac, transport, notifications, rx, write_gap, cancel, loss_tx));
    tx
}

async fn run(
    mac: String,
    transport: Arc<dyn Transport>,
    mut notifications: mpsc::Receiver<Vec<u8>>,
    mut inputs: mpsc::Receiver<SequencerInput>,
    write_gap: Duration,
    cancel: CancellationToken,
    loss_tx: mpsc::Sender<String>,
) {
    let mut queue: VecDeque<CommandRequest> = VecDeque::new();
    let mut in_flight: Option<InFlight> = None;
    let mut temp_sink: Option<TempSink> = None;
    let mut next_write_at = Instant::now();
    let mut link_lost = false;

    loop {
        let dispatch_ready = in_flight.is_none() && !queue.is_empty();
        let response_deadline = in_flight
            .as_ref()
            .map(|flight| flight.deadline)
            .unwrap_or_else(|| Instant::now() + IDLE_PARK);

        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },

            input = inputs.recv() => match input {
                Some(SequencerInput::Command(request)) => {
                    queue.push_back(request);
                },
                Some(SequencerInput::SetTempSink(tx)) => {
                    temp_sink = Some(TempSink { tx, muted: false });
                },
                Some(SequencerInput::MuteTempSink) => {
                    if let Some(sink) = temp_sink.as_mut() {
                        sink.muted = true;
                    }
                },
                Some(SequencerInput::ClearTempSink) => {
                    temp_sink = None;
                },
                None => {
                    break;
                },
            },

            frame = notifications.recv() => match frame {
                Some(frame) => {
                    route_frame(&mac, &frame, &mut in_flight, &mut temp_sink);
                },
                None => {
                    // the transport dropped the stream: the link is gone
                    link_lost = true;
                    break;
                },
            },

            _ = time::sleep_until(response_deadline), if in_flight.is_some() => {
                let flight = in_flight.take().expect("timeout fired without in-flight command");
                warn!(
                    "Device {}: command 0x{:02X} timed out after {:?}",
                    mac, flight.opcode, flight.timeout,
                );
                let _ = flight.reply.send(Err(SensorError::Timeout(flight.timeout)));
            },

            _ = time::sleep_until(next_write_at), if dispatch_ready => {
                let request = queue.pop_front().expect("dispatch fired with an empty queue");
                // the gap is measured write-to-write; an early response must
                // not shorten it
                next_write_at = Instant::now() + write_gap;
                let frame = protocol::pack_frame(request.opcode, &request.payload);
                match transport.write(&mac, &frame).await {
                    Ok(()) => {
                        in_flight = Some(InFlight {
                            opcode: request.opcode,
                            expect_len: request.expect_len,
                            deadline: Instant::now() + request.timeout,
                            timeout: request.timeout,
                            reply: request.reply,
                        });
                    },
                    Err(source) => {
                        let _ = request.reply.send(Err(SensorError::Transport { source }));
                    },
                }
            },
        }
    }

    if link_lost {
        let _ = loss_tx.try_send(mac.clone());
    }

    let reason = if link_lost { "connection dropped" } else { "connection closed" };
    if let Some(flight) = in_flight.take() {
        let _ = flight.reply.send(Err(SensorError::LinkLost(reason.to_string())));
    }
    for request in queue.drain(..) {
        let _ = request.reply.send(Err(SensorError::LinkLost(reason.to_string())));
    }
    inputs.close();
    while let Ok(input) = inputs.try_recv() {
        if let SequencerInput::Command(request) = input {
            let _ = request.reply.send(Err(SensorError::LinkLost(reason.to_string())));
        }
    }
    debug!("Device {}: sequencer stopped", mac);
}

/// Routes one inbound frame: temperature notifications go to the subscriber,
/// everything else correlates to the oldest outstanding request. The
/// protocol has no sequence numbers, arrival order is all there is.
fn route_frame(
    mac: &str,
    frame: &[u8],
    in_flight: &mut Option<InFlight>,
    temp_sink: &mut Option<TempSink>,
) {
    let (op, payload) = match protocol::unpack_frame(frame) {
        Ok(v) => v,
        Err(err) => {
            if let Some(flight) = in_flight.take() {
                let _ = flight.reply.send(Err(err));
            } else {
                warn!("Device {}: dropping malformed frame: {}", mac, err);
            }
            return;
        }
    };

    if op == opcode::TEMP_DATA {
        match temp_sink {
            Some(sink) => match TempReading::decode(payload) {
                Ok(reading) => {
                    if !sink.muted {
                        let _ = sink.tx.try_send(reading);
                    }
                }
                Err(err) => warn!("Device {}: bad temp notification: {}", mac, err),
            },
            // the stop command was acknowledged (or never issued); late
            // values on the wire are expected and dropped here
            None => debug!("Device {}: temp frame without subscriber", mac),
        }
        return;
    }

    match in_flight.take() {
        Some(flight) => {
            let result = if op != flight.opcode {
                Err(SensorError::Protocol(format!(
                    "expected response opcode 0x{:02X}, got 0x{:02X}",
                    flight.opcode, op,
                )))
            } else if payload.len() != flight.expect_len {
                Err(SensorError::Protocol(format!(
                    "response 0x{:02X}: expected {} payload bytes, got {}",
                    op,
                    flight.expect_len,
                    payload.len(),
                )))
            } else {
                Ok(payload.to_vec())
            };
            let _ = flight.reply.send(result);
        }
        None => {
            debug!("Device {}: unsolicited frame 0x{:02X} dropped", mac, op);
        }
    }
}
