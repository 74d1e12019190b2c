//! btleplug-backed transport. This is the only module that touches the real
//! radio; everything above it goes through the [`Transport`] trait.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, Characteristic, Manager as _, Peripheral as _, WriteType};
use btleplug::api::ScanFilter as BtleScanFilter;
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::config::ScanFilter;
use crate::error::TransportError;
use crate::protocol::{make_probe_down_uuid, make_probe_service_uuid, make_probe_up_uuid};
use crate::transport::{DiscoveredDevice, LinkInfo, Transport};

/**
 * How often (milliseconds) to poll the adapters for newly advertised
 * peripherals while scanning.
 */
const SCAN_POLL_DELAY: u64 = 500;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
const WRITE_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) checking if the peripheral is still connected may
 * take.
 */
const IS_CONNECTED_DEADLINE: u64 = 2000;

/**
 * btleplug does not expose the negotiated connection interval, so the link
 * reports the BLE default upper bound as its exchange-interval floor.
 */
const MIN_EXCHANGE_INTERVAL: Duration = Duration::from_millis(50);

struct BtleState {
    adapters: Vec<Adapter>,
    peripherals: HashMap<String, Peripheral>,
    links: HashMap<String, BtleLink>,
    scan_cancel: Option<CancellationToken>,
}

struct BtleLink {
    peripheral: Peripheral,
    data_char: Characteristic,
    notify_cancel: CancellationToken,
}

pub struct BtleTransport {
    manager: Manager,
    state: Arc<Mutex<BtleState>>,
}

impl BtleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        Ok(BtleTransport {
            manager,
            state: Arc::new(Mutex::new(BtleState {
                adapters: Vec::new(),
                peripherals: HashMap::new(),
                links: HashMap::new(),
                scan_cancel: None,
            })),
        })
    }

    fn peripheral(&self, mac: &str) -> Result<Peripheral, TransportError> {
        let state = self.state.lock().unwrap();
        state
            .peripherals
            .get(mac)
            .cloned()
            .ok_or_else(|| TransportError::UnknownDevice(mac.to_string()))
    }

    fn link(&self, mac: &str) -> Result<(Peripheral, Characteristic), TransportError> {
        let state = self.state.lock().unwrap();
        state
            .links
            .get(mac)
            .map(|link| (link.peripheral.clone(), link.data_char.clone()))
            .ok_or_else(|| TransportError::UnknownDevice(mac.to_string()))
    }
}

async fn poll_adapters(
    adapters: &[Adapter],
    state: &Arc<Mutex<BtleState>>,
    tx: &mpsc::Sender<DiscoveredDevice>,
) {
    for adapter in adapters {
        let peripherals = match adapter.peripherals().await {
            Ok(v) => v,
            Err(err) => {
                warn!("Failed to query BLE adapter for peripherals: {}", err);
                continue;
            }
        };

        for peripheral in peripherals {
            let properties = peripheral.properties().await;

            match properties {
                Err(err) => {
                    warn!("Could not query peripheral for properties: {:?}", err);
                }
                Ok(None) => {
                    warn!("Peripheral has no properties");
                }
                Ok(Some(properties)) => {
                    let mac = properties.address.to_string();
                    let device = DiscoveredDevice {
                        mac: mac.clone(),
                        name: properties.local_name.unwrap_or_default(),
                        rssi: properties.rssi.unwrap_or(0),
                        services: properties.services,
                    };
                    state.lock().unwrap().peripherals.insert(mac, peripheral.clone());
                    let _ = tx.try_send(device);
                }
            }
        }
    }
}

async fn connect_peripheral(peripheral: &Peripheral) -> Result<Characteristic, TransportError> {
    let probe_service_uuid = make_probe_service_uuid();
    let probe_down_uuid = make_probe_down_uuid();
    let probe_up_uuid = make_probe_up_uuid();

    info!("Connecting to peripheral...");
    peripheral.connect().await?;

    info!("Connected; Discovering services...");
    peripheral.discover_services().await?;

    let mut data_char: Option<Characteristic> = None;
    for service in peripheral.services() {
        if !service.uuid.eq(&probe_service_uuid) {
            continue;
        }

        for characteristic in &service.characteristics {
            if characteristic.uuid.eq(&probe_up_uuid) {
                info!("Subscribing to characteristic {:?} {:?}", service.uuid, characteristic.uuid);
                peripheral.subscribe(characteristic).await?;
            }
            if characteristic.uuid.eq(&probe_down_uuid) {
                data_char = Some(characteristic.clone());
            }
        }
    }

    data_char.ok_or(TransportError::MissingCharacteristic)
}

#[async_trait]
impl Transport for BtleTransport {
    async fn start_scan(
        &self,
        filter: &ScanFilter,
    ) -> Result<mpsc::Receiver<DiscoveredDevice>, TransportError> {
        let adapters = self.manager.adapters().await?;
        if adapters.is_empty() {
            return Err(TransportError::NoAdapter);
        }

        let btle_filter = BtleScanFilter {
            services: filter.services.clone(),
        };
        for adapter in &adapters {
            info!(
                "Scanning using adapter {}...",
                adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()),
            );
            adapter.start_scan(btle_filter.clone()).await?;
        }

        let cancel = CancellationToken::new();
        {
            let mut state = self.state.lock().unwrap();
            state.adapters = adapters.clone();
            state.scan_cancel = Some(cancel.clone());
        }

        let (tx, rx) = mpsc::channel(64);
        let state = Arc::clone(&self.state);
        spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    _ = sleep(Duration::from_millis(SCAN_POLL_DELAY)) => {
                        poll_adapters(&adapters, &state, &tx).await;
                    },
                }
            }
        });

        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let (cancel, adapters) = {
            let mut state = self.state.lock().unwrap();
            (state.scan_cancel.take(), state.adapters.clone())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        for adapter in &adapters {
            if let Err(err) = adapter.stop_scan().await {
                warn!("Failed to stop scanning: {:?}", err);
            }
        }
        Ok(())
    }

    async fn connect(&self, mac: &str) -> Result<LinkInfo, TransportError> {
        let peripheral = self.peripheral(mac)?;

        let data_char = match connect_peripheral(&peripheral).await {
            Ok(v) => v,
            Err(TransportError::Btle { source }) => {
                return Err(TransportError::ConnectFailed(mac.to_string(), source.to_string()));
            }
            Err(err) => return Err(err),
        };

        info!("Peripheral {} ready", mac);
        let mut state = self.state.lock().unwrap();
        state.links.insert(
            mac.to_string(),
            BtleLink {
                peripheral,
                data_char,
                notify_cancel: CancellationToken::new(),
            },
        );

        Ok(LinkInfo {
            min_exchange_interval: MIN_EXCHANGE_INTERVAL,
        })
    }

    async fn disconnect(&self, mac: &str) -> Result<(), TransportError> {
        let link = self.state.lock().unwrap().links.remove(mac);
        if let Some(link) = link {
            link.notify_cancel.cancel();
            link.peripheral.disconnect().await?;
        }
        Ok(())
    }

    async fn write(&self, mac: &str, frame: &[u8]) -> Result<(), TransportError> {
        let (peripheral, data_char) = self.link(mac)?;

        let fut = peripheral.write(&data_char, frame, WriteType::WithResponse);

        tokio::select! {
            _ = sleep(Duration::from_millis(WRITE_DEADLINE)) => {
                warn!("Sending to data characteristic took too long");
                Err(TransportError::WriteFailed(mac.to_string(), String::from("write deadline exceeded")))
            }
            result = fut => {
                result.map_err(|err| TransportError::WriteFailed(mac.to_string(), err.to_string()))
            }
        }
    }

    async fn subscribe(&self, mac: &str) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let (peripheral, cancel) = {
            let state = self.state.lock().unwrap();
            let link = state
                .links
                .get(mac)
                .ok_or_else(|| TransportError::UnknownDevice(mac.to_string()))?;
            (link.peripheral.clone(), link.notify_cancel.clone())
        };

        let probe_up_uuid = make_probe_up_uuid();
        let mut notification_stream = peripheral.notifications().await?;
        let (tx, rx) = mpsc::channel(64);

        spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    notification = notification_stream.next() => match notification {
                        Some(data) => {
                            if data.uuid.eq(&probe_up_uuid) {
                                if tx.send(data.value).await.is_err() {
                                    break 'mainloop;
                                }
                            }
                        },
                        None => {
                            break 'mainloop;
                        },
                    },
                }
            }
            debug!("Notification stream closed");
        });

        Ok(rx)
    }

    async fn is_connected(&self, mac: &str) -> bool {
        let peripheral = match self.peripheral(mac) {
            Ok(v) => v,
            Err(_) => return false,
        };

        tokio::select! {
            _ = sleep(Duration::from_millis(IS_CONNECTED_DEADLINE)) => {
                // macOS
                warn!("Checking for connection status took too long");
                false
            }
            result = peripheral.is_connected() => match result {
                Err(err) => {
                    warn!("Error checking for connection state: {:?}", err);
                    false
                },
                Ok(connected) => connected,
            }
        }
    }
}
