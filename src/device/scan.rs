//! Throttled discovery of candidate probes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use indexmap::IndexMap;
use log::{debug, warn};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::ScanFilter;
use crate::device::types::{Device, ScanEvent};
use crate::error::SensorError;
use crate::transport::{DiscoveredDevice, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Scanning,
    Stopping,
}

struct ScanState {
    phase: Phase,
    cooldown_until: Option<Instant>,
    devices: IndexMap<String, Device>,
    cancel: Option<CancellationToken>,
}

struct ScanInner {
    transport: Arc<dyn Transport>,
    filter: ScanFilter,
    timeout: Duration,
    cooldown: Duration,
    state: Mutex<ScanState>,
}

#[derive(Clone)]
pub(crate) struct ScanController {
    inner: Arc<ScanInner>,
}

impl ScanController {
    pub fn new(
        transport: Arc<dyn Transport>,
        filter: ScanFilter,
        timeout: Duration,
        cooldown: Duration,
    ) -> Self {
        ScanController {
            inner: Arc::new(ScanInner {
                transport,
                filter,
                timeout,
                cooldown,
                state: Mutex::new(ScanState {
                    phase: Phase::Idle,
                    cooldown_until: None,
                    devices: IndexMap::new(),
                    cancel: None,
                }),
            }),
        }
    }

    /// Starts a scan with the configured filter and timeout. `connected`
    /// seeds the known-set, so devices that are connected right now survive
    /// scan restarts.
    pub async fn start(&self, connected: Vec<Device>) -> Result<mpsc::Receiver<ScanEvent>, SensorError> {
        self.start_with(self.inner.filter.clone(), self.inner.timeout, connected).await
    }

    pub async fn start_with(
        &self,
        filter: ScanFilter,
        timeout: Duration,
        connected: Vec<Device>,
    ) -> Result<mpsc::Receiver<ScanEvent>, SensorError> {
        let inner = &self.inner;
        let cancel = {
            let mut state = inner.state.lock().unwrap();
            if state.phase != Phase::Idle {
                return Err(SensorError::Busy(String::from("a scan is already active")));
            }
            if let Some(until) = state.cooldown_until {
                if Instant::now() < until {
                    return Err(SensorError::Busy(String::from("scan cooldown has not elapsed yet")));
                }
            }
            state.phase = Phase::Starting;
            state.devices.clear();
            for device in connected {
                state.devices.insert(device.mac.clone(), device);
            }
            let cancel = CancellationToken::new();
            state.cancel = Some(cancel.clone());
            cancel
        };

        let stream = match inner.transport.start_scan(&filter).await {
            Ok(v) => v,
            Err(source) => {
                let mut state = inner.state.lock().unwrap();
                state.phase = Phase::Idle;
                state.cancel = None;
                return Err(SensorError::Transport { source });
            }
        };
        inner.state.lock().unwrap().phase = Phase::Scanning;

        let (tx, rx) = mpsc::channel(64);
        let _ = tx.try_send(ScanEvent::Started);

        let task_inner = Arc::clone(inner);
        spawn(run_scan(task_inner, stream, tx, filter, timeout, cancel));

        Ok(rx)
    }

    /// Cancels a running scan. The cooldown starts once the scan has wound
    /// down; stopping an idle controller does nothing.
    pub fn stop(&self) {
        let cancel = {
            let state = self.inner.state.lock().unwrap();
            match state.phase {
                Phase::Starting | Phase::Scanning => state.cancel.clone(),
                Phase::Idle | Phase::Stopping => None,
            }
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    /// Snapshot of the known-set, freshest rssi per device.
    pub fn devices(&self) -> Vec<Device> {
        self.inner.state.lock().unwrap().devices.values().cloned().collect()
    }
}

async fn run_scan(
    inner: Arc<ScanInner>,
    mut stream: mpsc::Receiver<DiscoveredDevice>,
    tx: mpsc::Sender<ScanEvent>,
    filter: ScanFilter,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let deadline = Instant::now() + timeout;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = time::sleep_until(deadline) => break,
            discovered = stream.recv() => match discovered {
                Some(discovered) => {
                    // backends may ignore parts of the filter, so every
                    // filter is checked again here
                    if !filter_matches(&filter, &discovered) {
                        continue;
                    }
                    let device = Device::from(&discovered);
                    let first_sighting = {
                        let mut state = inner.state.lock().unwrap();
                        match state.devices.get_mut(&device.mac) {
                            Some(known) => {
                                // most recent advertisement wins
                                known.rssi = device.rssi;
                                known.name = device.name.clone();
                                false
                            }
                            None => {
                                state.devices.insert(device.mac.clone(), device.clone());
                                true
                            }
                        }
                    };
                    if first_sighting {
                        debug!("Discovered {} ({}) rssi {}", device.mac, device.name, device.rssi);
                        if tx.send(ScanEvent::Discovered(device)).await.is_err() {
                            break;
                        }
                    }
                },
                None => break,
            },
        }
    }

    inner.state.lock().unwrap().phase = Phase::Stopping;
    if let Err(err) = inner.transport.stop_scan().await {
        warn!("Stopping scan reported: {}", err);
    }
    {
        let mut state = inner.state.lock().unwrap();
        state.phase = Phase::Idle;
        state.cancel = None;
        state.cooldown_until = Some(Instant::now() + inner.cooldown);
    }
    let _ = tx.send(ScanEvent::Ended).await;
}

/// All populated filters must pass (AND semantics).
fn filter_matches(filter: &ScanFilter, device: &DiscoveredDevice) -> bool {
    if !filter.services.is_empty()
        && !device.services.iter().any(|s| filter.services.contains(s))
    {
        return false;
    }
    if filter.names_enabled && !filter.names.iter().any(|n| n == &device.name) {
        return false;
    }
    if let Some(mac) = &filter.mac {
        if !mac.eq_ignore_ascii_case(&device.mac) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn device(name: &str, mac: &str, services: Vec<Uuid>) -> DiscoveredDevice {
        DiscoveredDevice {
            mac: mac.to_string(),
            name: name.to_string(),
            rssi: -60,
            services,
        }
    }

    fn service() -> Uuid {
        crate::protocol::make_probe_service_uuid()
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = ScanFilter::default();
        assert!(filter_matches(&filter, &device("anything", "00:11:22:33:44:55", vec![])));
    }

    #[test]
    fn service_allowlist() {
        let filter = ScanFilter {
            services: vec![service()],
            ..ScanFilter::default()
        };
        assert!(filter_matches(&filter, &device("a", "00:11:22:33:44:55", vec![service()])));
        assert!(!filter_matches(&filter, &device("a", "00:11:22:33:44:55", vec![])));
        assert!(!filter_matches(&filter, &device("a", "00:11:22:33:44:55", vec![Uuid::nil()])));
    }

    #[test]
    fn name_allowlist_only_applies_while_enabled() {
        let mut filter = ScanFilter {
            names: vec![String::from("VTP-30_91000001")],
            names_enabled: false,
            ..ScanFilter::default()
        };
        assert!(filter_matches(&filter, &device("other", "00:11:22:33:44:55", vec![])));

        filter.names_enabled = true;
        assert!(!filter_matches(&filter, &device("other", "00:11:22:33:44:55", vec![])));
        assert!(filter_matches(&filter, &device("VTP-30_91000001", "00:11:22:33:44:55", vec![])));
    }

    #[test]
    fn mac_filter_is_exact_but_case_insensitive() {
        let filter = ScanFilter {
            mac: Some(String::from("C4:64:E3:A0:00:01")),
            ..ScanFilter::default()
        };
        assert!(filter_matches(&filter, &device("a", "c4:64:e3:a0:00:01", vec![])));
        assert!(!filter_matches(&filter, &device("a", "C4:64:E3:A0:00:02", vec![])));
    }

    #[test]
    fn filters_combine_with_and_semantics() {
        let filter = ScanFilter {
            services: vec![service()],
            names: vec![String::from("VTP-30_91000001")],
            names_enabled: true,
            mac: Some(String::from("C4:64:E3:A0:00:01")),
        };
        let good = device("VTP-30_91000001", "C4:64:E3:A0:00:01", vec![service()]);
        assert!(filter_matches(&filter, &good));

        let mut wrong_name = good.clone();
        wrong_name.name = String::from("VTP-30_91000002");
        assert!(!filter_matches(&filter, &wrong_name));

        let mut wrong_mac = good.clone();
        wrong_mac.mac = String::from("C4:64:E3:A0:00:02");
        assert!(!filter_matches(&filter, &wrong_mac));

        let mut wrong_service = good;
        wrong_service.services.clear();
        assert!(!filter_matches(&filter, &wrong_service));
    }
}
