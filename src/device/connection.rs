//! Connection lifecycle: the connected set, the "current" device, link-loss
//! detection and the per-device sequencer handles.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::device::sequencer::{spawn_sequencer, CommandRequest, SequencerInput};
use crate::device::types::{ConnectionEvent, Device};
use crate::error::SensorError;
use crate::transport::Transport;

/// Cheap handle onto one connected device's sequencer.
#[derive(Clone)]
pub(crate) struct DeviceLink {
    pub device: Device,
    commands: mpsc::Sender<SequencerInput>,
}

impl DeviceLink {
    /// Queues a one-shot command and waits for its settled outcome.
    pub async fn request(
        &self,
        opcode: u8,
        payload: Vec<u8>,
        expect_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, SensorError> {
        let (reply, settled) = oneshot::channel();
        let request = CommandRequest {
            opcode,
            payload,
            expect_len,
            timeout,
            reply,
        };
        self.commands
            .send(SequencerInput::Command(request))
            .await
            .map_err(|_| SensorError::NotConnected(format!("device {} is gone", self.device.mac)))?;
        settled
            .await
            .map_err(|_| SensorError::LinkLost(String::from("connection dropped before the command settled")))?
    }

    pub async fn control(&self, input: SequencerInput) -> Result<(), SensorError> {
        self.commands
            .send(input)
            .await
            .map_err(|_| SensorError::NotConnected(format!("device {} is gone", self.device.mac)))
    }
}

struct LinkEntry {
    link: DeviceLink,
    cancel: CancellationToken,
}

struct ManagerState {
    links: HashMap<String, LinkEntry>,
    current: Option<String>,
    /// Serial last decoded from each device's system params; feeds the
    /// guarded-write precondition.
    serials: HashMap<String, u32>,
    /// Macs with an upgrade session running.
    upgrades: HashSet<String>,
    event_senders: Vec<mpsc::Sender<ConnectionEvent>>,
}

struct ManagerInner {
    transport: Arc<dyn Transport>,
    delay_floor: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
    loss_tx: mpsc::Sender<String>,
    state: Mutex<ManagerState>,
}

#[derive(Clone)]
pub(crate) struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        delay_floor: Duration,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (loss_tx, mut loss_rx) = mpsc::channel::<String>(16);
        let inner = Arc::new(ManagerInner {
            transport,
            delay_floor,
            poll_interval,
            cancel: cancel.clone(),
            loss_tx,
            state: Mutex::new(ManagerState {
                links: HashMap::new(),
                current: None,
                serials: HashMap::new(),
                upgrades: HashSet::new(),
                event_senders: Vec::new(),
            }),
        });

        // one place handles every loss report, whether it came from a
        // sequencer seeing its stream end or from a link monitor poll
        let loss_inner = Arc::clone(&inner);
        spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    mac = loss_rx.recv() => match mac {
                        Some(mac) => handle_link_loss(&loss_inner, &mac),
                        None => break,
                    },
                }
            }
        });

        ConnectionManager { inner }
    }

    pub fn subscribe_events(&self) -> mpsc::Receiver<ConnectionEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.inner.state.lock().unwrap().event_senders.push(tx);
        rx
    }

    pub async fn connect(&self, device: &Device) -> Result<(), SensorError> {
        let inner = &self.inner;
        emit(inner, ConnectionEvent::ConnectStart(device.clone()));

        if self.is_connected(&device.mac) {
            emit(inner, ConnectionEvent::ConnectSuccess(device.clone()));
            return Ok(());
        }

        let link_info = match inner.transport.connect(&device.mac).await {
            Ok(v) => v,
            Err(source) => {
                warn!("Connecting to {} failed: {}", device.mac, source);
                emit(inner, ConnectionEvent::ConnectFail(device.clone(), source.to_string()));
                return Err(SensorError::Transport { source });
            }
        };

        let notifications = match inner.transport.subscribe(&device.mac).await {
            Ok(v) => v,
            Err(source) => {
                warn!("Subscribing to {} failed: {}", device.mac, source);
                if let Err(err) = inner.transport.disconnect(&device.mac).await {
                    debug!("Cleanup disconnect of {} failed: {}", device.mac, err);
                }
                emit(inner, ConnectionEvent::ConnectFail(device.clone(), source.to_string()));
                return Err(SensorError::Transport { source });
            }
        };

        // the link-layer exchange interval is the floor for the write gap
        let write_gap = inner.delay_floor.max(link_info.min_exchange_interval);
        let link_cancel = inner.cancel.child_token();
        let commands = spawn_sequencer(
            device.mac.clone(),
            Arc::clone(&inner.transport),
            notifications,
            write_gap,
            link_cancel.clone(),
            inner.loss_tx.clone(),
        );

        {
            let mut state = inner.state.lock().unwrap();
            state.links.insert(
                device.mac.clone(),
                LinkEntry {
                    link: DeviceLink {
                        device: device.clone(),
                        commands,
                    },
                    cancel: link_cancel.clone(),
                },
            );
            state.current = Some(device.mac.clone());
        }
        info!("Connected to {} ({}), write gap {:?}", device.mac, device.name, write_gap);
        emit(inner, ConnectionEvent::ConnectSuccess(device.clone()));

        // watch for unsolicited loss the same way the device is polled for
        // liveness on connect-oriented stacks
        let monitor_inner = Arc::clone(inner);
        let mac = device.mac.clone();
        spawn(async move {
            loop {
                tokio::select! {
                    _ = link_cancel.cancelled() => break,
                    _ = sleep(monitor_inner.poll_interval) => {
                        if !monitor_inner.transport.is_connected(&mac).await {
                            warn!("Connection to {} lost", mac);
                            let _ = monitor_inner.loss_tx.try_send(mac.clone());
                            break;
                        }
                    },
                }
            }
        });

        Ok(())
    }

    pub async fn disconnect(&self, device: &Device) -> Result<(), SensorError> {
        let inner = &self.inner;
        emit(inner, ConnectionEvent::DisconnectStart(device.clone()));

        let entry = {
            let mut state = inner.state.lock().unwrap();
            let entry = state.links.remove(&device.mac);
            if entry.is_some() {
                if state.current.as_deref() == Some(device.mac.as_str()) {
                    state.current = None;
                }
                state.upgrades.remove(&device.mac);
            }
            entry
        };

        // disconnecting a device that is not connected is a no-op success
        if let Some(entry) = entry {
            entry.cancel.cancel();
            if let Err(err) = inner.transport.disconnect(&device.mac).await {
                warn!("Disconnect of {} reported: {}", device.mac, err);
            }
        }

        emit(inner, ConnectionEvent::DisconnectEnd(device.clone()));
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let devices: Vec<Device> = {
            let state = self.inner.state.lock().unwrap();
            state.links.values().map(|entry| entry.link.device.clone()).collect()
        };
        for device in devices {
            let _ = self.disconnect(&device).await;
        }
    }

    pub fn is_connected(&self, mac: &str) -> bool {
        self.inner.state.lock().unwrap().links.contains_key(mac)
    }

    pub fn connected_devices(&self) -> Vec<Device> {
        let state = self.inner.state.lock().unwrap();
        state.links.values().map(|entry| entry.link.device.clone()).collect()
    }

    pub fn current_device(&self) -> Option<Device> {
        let state = self.inner.state.lock().unwrap();
        state
            .current
            .as_ref()
            .and_then(|mac| state.links.get(mac))
            .map(|entry| entry.link.device.clone())
    }

    /// The link commands operate on: the device of the most recent
    /// successful connect.
    pub fn current_link(&self) -> Result<DeviceLink, SensorError> {
        let state = self.inner.state.lock().unwrap();
        state
            .current
            .as_ref()
            .and_then(|mac| state.links.get(mac))
            .map(|entry| entry.link.clone())
            .ok_or_else(|| SensorError::NotConnected(String::from("no probe is connected")))
    }

    pub fn note_serial(&self, mac: &str, sn: u32) {
        self.inner.state.lock().unwrap().serials.insert(mac.to_string(), sn);
    }

    pub fn serial_of(&self, mac: &str) -> Option<u32> {
        self.inner.state.lock().unwrap().serials.get(mac).copied()
    }

    /// Claims the single upgrade session slot of a connection.
    pub fn begin_upgrade(&self, mac: &str) -> Result<UpgradeGuard, SensorError> {
        let mut state = self.inner.state.lock().unwrap();
        if !state.upgrades.insert(mac.to_string()) {
            return Err(SensorError::Busy(format!("an upgrade is already running on {}", mac)));
        }
        Ok(UpgradeGuard {
            inner: Arc::clone(&self.inner),
            mac: mac.to_string(),
        })
    }

    pub async fn shutdown(&self) {
        self.disconnect_all().await;
        self.inner.cancel.cancel();
    }
}

/// Releases the upgrade session slot when the session ends, however it ends.
pub(crate) struct UpgradeGuard {
    inner: Arc<ManagerInner>,
    mac: String,
}

impl Drop for UpgradeGuard {
    fn drop(&mut self) {
        self.inner.state.lock().unwrap().upgrades.remove(&self.mac);
    }
}

fn handle_link_loss(inner: &Arc<ManagerInner>, mac: &str) {
    let entry = {
        let mut state = inner.state.lock().unwrap();
        let entry = state.links.remove(mac);
        if entry.is_some() {
            if state.current.as_deref() == Some(mac) {
                state.current = None;
            }
            state.upgrades.remove(mac);
        }
        entry
    };

    // a loss may be reported twice (sequencer and monitor); only the first
    // report still finds the link
    if let Some(entry) = entry {
        entry.cancel.cancel();
        emit(inner, ConnectionEvent::Disconnected(entry.link.device));
    }
}

fn emit(inner: &Arc<ManagerInner>, event: ConnectionEvent) {
    let mut state = inner.state.lock().unwrap();
    state.event_senders.retain(|sender| {
        match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Dropping connection event for a slow subscriber");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    });
}
