//! Scripted in-memory transport, used by the test suites and usable for
//! simulation when no radio is around.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::ScanFilter;
use crate::error::TransportError;
use crate::protocol;
use crate::transport::{DiscoveredDevice, LinkInfo, Transport};

/// A command frame the host wrote, with the (tokio) instant it was written.
#[derive(Debug, Clone)]
pub struct WriteRecord {
    pub mac: String,
    pub frame: Vec<u8>,
    pub at: Instant,
}

type Responder = Box<dyn FnMut(u8, &[u8]) -> Vec<Vec<u8>> + Send>;

struct MockInner {
    devices: Vec<DiscoveredDevice>,
    scan_tx: Option<mpsc::Sender<DiscoveredDevice>>,
    connected: HashMap<String, Option<mpsc::Sender<Vec<u8>>>>,
    refuse_connect: Vec<String>,
    writes: Vec<WriteRecord>,
    responder: Option<Responder>,
    min_exchange_interval: Duration,
}

#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockInner>>,
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            inner: Arc::new(Mutex::new(MockInner {
                devices: Vec::new(),
                scan_tx: None,
                connected: HashMap::new(),
                refuse_connect: Vec::new(),
                writes: Vec::new(),
                responder: None,
                min_exchange_interval: Duration::from_millis(30),
            })),
        }
    }

    /// A transport that knows a single probe, in the mould of real
    /// advertisement data.
    pub fn with_sample_device() -> (Self, DiscoveredDevice) {
        let device = DiscoveredDevice {
            mac: String::from("C4:64:E3:A0:00:01"),
            name: String::from("VTP-30_91000001"),
            rssi: -58,
            services: vec![protocol::make_probe_service_uuid()],
        };
        let transport = Self::new();
        transport.add_device(device.clone());
        (transport, device)
    }

    pub fn add_device(&self, device: DiscoveredDevice) {
        self.inner.lock().unwrap().devices.push(device);
    }

    /// Makes `connect` fail for the given mac.
    pub fn refuse_connect(&self, mac: &str) {
        self.inner.lock().unwrap().refuse_connect.push(mac.to_string());
    }

    /// Installs the device-side behaviour: a function from (opcode, request
    /// payload) to the raw frames the probe sends back. No responder means
    /// every command times out.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(u8, &[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        self.inner.lock().unwrap().responder = Some(Box::new(responder));
    }

    pub fn set_min_exchange_interval(&self, interval: Duration) {
        self.inner.lock().unwrap().min_exchange_interval = interval;
    }

    /// Pushes an unsolicited notification frame, as the probe does for
    /// temperature values.
    pub fn inject(&self, mac: &str, frame: Vec<u8>) {
        let tx = {
            let inner = self.inner.lock().unwrap();
            inner.connected.get(mac).and_then(|tx| tx.clone())
        };
        if let Some(tx) = tx {
            let _ = tx.try_send(frame);
        }
    }

    /// Simulates an unsolicited link loss: the device is gone and its
    /// notification stream ends.
    pub fn drop_link(&self, mac: &str) {
        self.inner.lock().unwrap().connected.remove(mac);
    }

    /// Feeds another advertisement into a running scan.
    pub fn announce(&self, device: DiscoveredDevice) {
        let tx = self.inner.lock().unwrap().scan_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.try_send(device);
        }
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.inner.lock().unwrap().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.inner.lock().unwrap().writes.len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start_scan(
        &self,
        _filter: &ScanFilter,
    ) -> Result<mpsc::Receiver<DiscoveredDevice>, TransportError> {
        let (tx, rx) = mpsc::channel(64);
        let devices = {
            let mut inner = self.inner.lock().unwrap();
            inner.scan_tx = Some(tx.clone());
            inner.devices.clone()
        };
        // the backend ignores the filter on purpose; the scan controller
        // must re-check every filter locally
        for device in devices {
            let _ = tx.try_send(device);
        }
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.inner.lock().unwrap().scan_tx = None;
        Ok(())
    }

    async fn connect(&self, mac: &str) -> Result<LinkInfo, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.refuse_connect.iter().any(|m| m == mac) {
            return Err(TransportError::ConnectFailed(
                mac.to_string(),
                String::from("refused by mock"),
            ));
        }
        if !inner.devices.iter().any(|d| d.mac == mac) {
            return Err(TransportError::UnknownDevice(mac.to_string()));
        }
        inner.connected.insert(mac.to_string(), None);
        Ok(LinkInfo {
            min_exchange_interval: inner.min_exchange_interval,
        })
    }

    async fn disconnect(&self, mac: &str) -> Result<(), TransportError> {
        self.inner.lock().unwrap().connected.remove(mac);
        Ok(())
    }

    async fn write(&self, mac: &str, frame: &[u8]) -> Result<(), TransportError> {
        let (tx, responses) = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.connected.contains_key(mac) {
                return Err(TransportError::WriteFailed(
                    mac.to_string(),
                    String::from("not connected"),
                ));
            }
            inner.writes.push(WriteRecord {
                mac: mac.to_string(),
                frame: frame.to_vec(),
                at: Instant::now(),
            });
            let responses = match (inner.responder.as_mut(), protocol::unpack_host_frame(frame)) {
                (Some(responder), Ok((opcode, payload))) => responder(opcode, payload),
                _ => Vec::new(),
            };
            let tx = inner.connected.get(mac).and_then(|tx| tx.clone());
            (tx, responses)
        };
        if let Some(tx) = tx {
            for response in responses {
                let _ = tx.try_send(response);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, mac: &str) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.connected.get_mut(mac) {
            Some(slot) => {
                let (tx, rx) = mpsc::channel(64);
                *slot = Some(tx);
                Ok(rx)
            }
            None => Err(TransportError::UnknownDevice(mac.to_string())),
        }
    }

    async fn is_connected(&self, mac: &str) -> bool {
        self.inner.lock().unwrap().connected.contains_key(mac)
    }
}
