//! The public operation surface: one explicit handle per process, built on
//! an injected transport.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::device::connection::ConnectionManager;
use crate::device::scan::ScanController;
use crate::device::sequencer::SequencerInput;
use crate::device::types::{
    ConnectionEvent, Device, ScanEvent, UpgradeEvent, UpgradeTarget, VibrationSample,
};
use crate::device::upgrade::spawn_upgrade;
use crate::error::{ConfigError, SensorError};
use crate::protocol::opcode;
use crate::protocol::params::{
    self, LinearCoefficients, SelfCheckReport, SystemParams, TempCalibration, TempReading,
};
use crate::transport::Transport;

/// Hard limit on one vibration block: 256K samples.
pub const MAX_VIB_SAMPLES: u32 = 256 * 1024;

/// Hard limit on the analysis frequency of the probe's front end.
pub const MAX_ANALYSIS_FREQ: u32 = 40_000;

pub const EMISSIVITY_MIN: f32 = 0.01;
pub const EMISSIVITY_MAX: f32 = 1.0;

struct ClientInner {
    config: ClientConfig,
    scan: ScanController,
    connections: ConnectionManager,
    cancel: CancellationToken,
}

/**
 * Handle onto one probe fleet. Construct it once with [`SensorClient::initialize`]
 * and clone it freely; [`SensorClient::shutdown`] tears down every link and
 * background task.
 *
 * Must be created inside a tokio runtime.
 */
#[derive(Clone)]
pub struct SensorClient {
    inner: Arc<ClientInner>,
}

impl SensorClient {
    pub fn initialize(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<SensorClient, ConfigError> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let connections = ConnectionManager::new(
            Arc::clone(&transport),
            config.inter_command_delay(),
            config.link_poll(),
            cancel.child_token(),
        );
        let scan = ScanController::new(
            Arc::clone(&transport),
            config.scan_filter.clone(),
            config.scan_timeout(),
            config.scan_cooldown(),
        );
        info!("Sensor client initialized");
        Ok(SensorClient {
            inner: Arc::new(ClientInner {
                config,
                scan,
                connections,
                cancel,
            }),
        })
    }

    pub async fn shutdown(&self) {
        self.inner.scan.stop();
        self.inner.connections.shutdown().await;
        self.inner.cancel.cancel();
        info!("Sensor client shut down");
    }

    // ---- scanning -------------------------------------------------------

    /// Starts discovery with the configured filter and timeout. The stream
    /// yields Started, each device once, then Ended.
    pub async fn start_scan(&self) -> Result<mpsc::Receiver<ScanEvent>, SensorError> {
        self.inner.scan.start(self.inner.connections.connected_devices()).await
    }

    pub fn stop_scan(&self) {
        self.inner.scan.stop();
    }

    pub fn discovered_devices(&self) -> Vec<Device> {
        self.inner.scan.devices()
    }

    // ---- connections ----------------------------------------------------

    pub fn connection_events(&self) -> mpsc::Receiver<ConnectionEvent> {
        self.inner.connections.subscribe_events()
    }

    pub async fn connect(&self, device: &Device) -> Result<(), SensorError> {
        self.inner.connections.connect(device).await
    }

    pub async fn disconnect(&self, device: &Device) -> Result<(), SensorError> {
        self.inner.connections.disconnect(device).await
    }

    pub async fn disconnect_all(&self) {
        self.inner.connections.disconnect_all().await
    }

    pub fn is_connected(&self, mac: &str) -> bool {
        self.inner.connections.is_connected(mac)
    }

    pub fn is_connected_device(&self, device: &Device) -> bool {
        self.inner.connections.is_connected(&device.mac)
    }

    /// The device of the most recent successful connect, if still connected.
    pub fn current_device(&self) -> Option<Device> {
        self.inner.connections.current_device()
    }

    // ---- one-shot operations -------------------------------------------

    pub async fn get_system_params(&self) -> Result<SystemParams, SensorError> {
        let link = self.inner.connections.current_link()?;
        let payload = link
            .request(
                opcode::GET_SYSTEM_PARAMS,
                Vec::new(),
                params::SYSTEM_PARAMS_READ_LEN,
                self.inner.config.response_timeout(),
            )
            .await?;
        let system = SystemParams::decode(&payload)?;
        self.inner.connections.note_serial(&link.device.mac, system.sn);
        Ok(system)
    }

    /// Writes the system params. The probe only accepts the write while its
    /// current serial is a factory one (8 digits, leading 9); that
    /// precondition is checked against the serial learned from the last
    /// `get_system_params`, so a doomed write never touches the link.
    pub async fn set_system_params(
        &self,
        sn: u32,
        accel_coefficient: f32,
        emissivity: f32,
        standby_minutes: u32,
        hardware_version: f32,
    ) -> Result<(), SensorError> {
        check_emissivity(emissivity)?;
        let link = self.inner.connections.current_link()?;

        let current_sn = match self.inner.connections.serial_of(&link.device.mac) {
            Some(sn) => sn,
            None => self.get_system_params().await?.sn,
        };
        if !params::sn_allows_write(current_sn) {
            return Err(SensorError::Rejected(format!(
                "system params are locked: current sn {} is not a writable serial",
                current_sn,
            )));
        }

        let payload = params::encode_system_params(
            sn,
            accel_coefficient,
            emissivity,
            standby_minutes,
            hardware_version,
        );
        let response = link
            .request(
                opcode::SET_SYSTEM_PARAMS,
                payload,
                params::ACK_LEN,
                self.inner.config.response_timeout(),
            )
            .await?;
        params::decode_ack(&response, "set system params")?;
        self.inner.connections.note_serial(&link.device.mac, sn);
        Ok(())
    }

    /// Acquires one raw vibration block. Validated locally before anything
    /// is written; the timeout budgets the probe's acquisition run plus the
    /// transfer of the block.
    pub async fn sample_vib(&self, len: u32, freq: u32) -> Result<VibrationSample, SensorError> {
        check_acquisition(len, freq)?;
        let link = self.inner.connections.current_link()?;

        let payload = params::encode_acquire(len, freq, params::ACQUIRE_VIBRATION, 0.0);
        let expect = 4 + len as usize * 2;
        let timeout = acquisition_time(len, freq) + transfer_time(len) + self.inner.config.response_timeout();
        let response = link.request(opcode::ACQUIRE, payload, expect, timeout).await?;
        let (coefficient, raw) = params::decode_vib_block(&response, len as usize)?;
        Ok(VibrationSample { raw, coefficient })
    }

    /// Runs the closed-loop vibration calibration. The device performs a
    /// full acquisition internally before answering, hence the extended
    /// timeout.
    pub async fn vib_calibrate(&self, len: u32, freq: u32) -> Result<f32, SensorError> {
        check_acquisition(len, freq)?;
        let link = self.inner.connections.current_link()?;

        let payload = params::encode_calibrate(len, freq);
        let timeout = acquisition_time(len, freq) + self.inner.config.response_timeout();
        let response = link
            .request(opcode::CALIBRATE_VIBRATION, payload, params::CALIBRATE_RESULT_LEN, timeout)
            .await?;
        params::decode_calibrate_result(&response)
    }

    pub async fn self_check(&self) -> Result<SelfCheckReport, SensorError> {
        let link = self.inner.connections.current_link()?;
        let payload = link
            .request(
                opcode::SELF_CHECK,
                Vec::new(),
                params::SELF_CHECK_LEN,
                self.inner.config.response_timeout(),
            )
            .await?;
        SelfCheckReport::decode(&payload)
    }

    pub async fn get_temperature_calibration_coefficient(&self) -> Result<TempCalibration, SensorError> {
        let link = self.inner.connections.current_link()?;
        let payload = link
            .request(
                opcode::GET_TEMP_CALIBRATION,
                Vec::new(),
                params::TEMP_CALIBRATION_LEN,
                self.inner.config.response_timeout(),
            )
            .await?;
        TempCalibration::decode(&payload)
    }

    pub async fn set_temperature_calibration_coefficient(
        &self,
        offset: f32,
        env_temp: f32,
        target: f32,
    ) -> Result<(), SensorError> {
        let link = self.inner.connections.current_link()?;
        let calibration = TempCalibration { offset, env_temp, target };
        let response = link
            .request(
                opcode::SET_TEMP_CALIBRATION,
                calibration.encode(),
                params::ACK_LEN,
                self.inner.config.response_timeout(),
            )
            .await?;
        params::decode_ack(&response, "set temperature calibration")
    }

    pub async fn get_temperature_linear_coefficient(&self) -> Result<LinearCoefficients, SensorError> {
        let link = self.inner.connections.current_link()?;
        let payload = link
            .request(
                opcode::GET_TEMP_LINEAR,
                Vec::new(),
                params::LINEAR_COEFFICIENTS_LEN,
                self.inner.config.response_timeout(),
            )
            .await?;
        LinearCoefficients::decode(&payload)
    }

    pub async fn set_temperature_linear_coefficient(
        &self,
        coefficients: &LinearCoefficients,
    ) -> Result<(), SensorError> {
        let link = self.inner.connections.current_link()?;
        let response = link
            .request(
                opcode::SET_TEMP_LINEAR,
                coefficients.encode(),
                params::ACK_LEN,
                self.inner.config.response_timeout(),
            )
            .await?;
        params::decode_ack(&response, "set temperature linear coefficients")
    }

    // ---- temperature subscription --------------------------------------

    /// Starts continuous temperature sampling. Readings keep arriving on the
    /// returned stream until a network-level stop is acknowledged.
    pub async fn sample_temp(&self, emissivity: f32) -> Result<mpsc::Receiver<TempReading>, SensorError> {
        check_emissivity(emissivity)?;
        let link = self.inner.connections.current_link()?;

        let (tx, rx) = mpsc::channel(32);
        // register the sink first so the earliest notification cannot slip by
        link.control(SequencerInput::SetTempSink(tx)).await?;

        let payload = params::encode_acquire(0, 0, params::ACQUIRE_TEMPERATURE, emissivity);
        let started = link
            .request(opcode::ACQUIRE, payload, params::ACK_LEN, self.inner.config.response_timeout())
            .await
            .and_then(|response| params::decode_ack(&response, "start temp sampling"));

        match started {
            Ok(()) => Ok(rx),
            Err(err) => {
                let _ = link.control(SequencerInput::ClearTempSink).await;
                Err(err)
            }
        }
    }

    /// Silences local delivery only. No stop is sent, so the device keeps
    /// transmitting and values may still arrive on the link afterwards; a
    /// clean stop additionally needs [`SensorClient::stop_sample_temp`].
    pub async fn remove_sample_temp_callback(&self) -> Result<(), SensorError> {
        let link = self.inner.connections.current_link()?;
        link.control(SequencerInput::MuteTempSink).await
    }

    /// Sends the network-level stop. Only its acknowledgement guarantees
    /// that no further reading is delivered.
    pub async fn stop_sample_temp(&self) -> Result<(), SensorError> {
        let link = self.inner.connections.current_link()?;
        let response = link
            .request(
                opcode::STOP_SAMPLE,
                Vec::new(),
                params::ACK_LEN,
                self.inner.config.response_timeout(),
            )
            .await?;
        params::decode_ack(&response, "stop sampling")?;
        link.control(SequencerInput::ClearTempSink).await
    }

    // ---- firmware upgrade ----------------------------------------------

    /// Streams a firmware image to the selected target. Progress and the
    /// single terminal result arrive on the returned stream; a second
    /// session on the same connection fails Busy until the first ends.
    pub async fn upgrade(
        &self,
        sn: u32,
        image: &[u8],
        target: UpgradeTarget,
    ) -> Result<mpsc::Receiver<UpgradeEvent>, SensorError> {
        if image.is_empty() {
            return Err(SensorError::Validation(String::from("firmware image is empty")));
        }
        let link = self.inner.connections.current_link()?;
        let guard = self.inner.connections.begin_upgrade(&link.device.mac)?;
        Ok(spawn_upgrade(
            link,
            sn,
            image.to_vec(),
            target,
            self.inner.config.response_timeout(),
            guard,
        ))
    }
}

fn check_emissivity(emissivity: f32) -> Result<(), SensorError> {
    if !(EMISSIVITY_MIN..=EMISSIVITY_MAX).contains(&emissivity) {
        return Err(SensorError::Validation(format!(
            "emissivity {} outside [{}, {}]",
            emissivity, EMISSIVITY_MIN, EMISSIVITY_MAX,
        )));
    }
    Ok(())
}

fn check_acquisition(len: u32, freq: u32) -> Result<(), SensorError> {
    if len == 0 || len > MAX_VIB_SAMPLES {
        return Err(SensorError::Validation(format!(
            "sample length {} outside 1..={}",
            len, MAX_VIB_SAMPLES,
        )));
    }
    if freq == 0 || freq > MAX_ANALYSIS_FREQ {
        return Err(SensorError::Validation(format!(
            "analysis frequency {} outside 1..={}",
            freq, MAX_ANALYSIS_FREQ,
        )));
    }
    Ok(())
}

/// How long the probe itself acquires: it samples at 2.56 times the analysis
/// frequency.
fn acquisition_time(len: u32, freq: u32) -> Duration {
    Duration::from_millis((f64::from(len) / 2.56 / f64::from(freq) * 1000.0) as u64)
}

/// Transfer estimate for a block: 2 bytes per sample at roughly 4 bytes/ms.
fn transfer_time(len: u32) -> Duration {
    Duration::from_millis(u64::from(len) * 2 / 4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emissivity_bounds() {
        assert!(check_emissivity(0.01).is_ok());
        assert!(check_emissivity(0.97).is_ok());
        assert!(check_emissivity(1.0).is_ok());
        assert!(check_emissivity(0.0).is_err());
        assert!(check_emissivity(1.01).is_err());
    }

    #[test]
    fn acquisition_bounds() {
        assert!(check_acquisition(1024, 1000).is_ok());
        assert!(check_acquisition(MAX_VIB_SAMPLES, MAX_ANALYSIS_FREQ).is_ok());
        assert!(check_acquisition(300_000, 1000).is_err());
        assert!(check_acquisition(0, 1000).is_err());
        assert!(check_acquisition(1024, 50_000).is_err());
        assert!(check_acquisition(1024, 0).is_err());
    }

    #[test]
    fn acquisition_time_follows_the_sampling_ratio() {
        // 2560 samples at 1 kHz analysis frequency: one second of sampling
        assert_eq!(acquisition_time(2560, 1000), Duration::from_millis(1000));
    }
}
