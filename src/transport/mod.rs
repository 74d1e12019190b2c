use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ScanFilter;
use crate::error::TransportError;

pub mod btle;
pub mod mock;

/// A device seen while scanning, before any filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub mac: String,
    pub name: String,
    pub rssi: i16,
    pub services: Vec<Uuid>,
}

/// Properties of an established link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    /// Negotiated minimum time between consecutive exchanges on the link.
    /// Sets the floor for the inter-command delay.
    pub min_exchange_interval: Duration,
}

/**
 * The radio seam. The protocol engine depends on exactly these primitives;
 * `btle` talks to real hardware through btleplug and `mock` is scripted
 * from tests.
 *
 * Notification and discovery streams end (the receiver yields `None`) when
 * the underlying link or scan goes away.
 */
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Begins discovery. The service filter is pushed down where the backend
    /// supports it; callers must still re-check all filters themselves.
    async fn start_scan(&self, filter: &ScanFilter)
        -> Result<mpsc::Receiver<DiscoveredDevice>, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, mac: &str) -> Result<LinkInfo, TransportError>;

    async fn disconnect(&self, mac: &str) -> Result<(), TransportError>;

    /// Delivers one raw command frame. Resolves once the link has
    /// acknowledged delivery, not once the device has responded.
    async fn write(&self, mac: &str, frame: &[u8]) -> Result<(), TransportError>;

    /// Stream of raw notification frames from the device.
    async fn subscribe(&self, mac: &str) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    async fn is_connected(&self, mac: &str) -> bool;
}
