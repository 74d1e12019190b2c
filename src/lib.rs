use std::env;

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod protocol;
pub mod signal;
pub mod transport;

pub use client::SensorClient;
pub use config::{ClientConfig, ScanFilter};
pub use device::types::{
    ConnectionEvent, Device, ScanEvent, UpgradeEvent, UpgradeTarget, VibrationSample,
};
pub use error::{ConfigError, SensorError, TransportError};
pub use protocol::params::{
    LinearCoefficients, ModuleStatus, SelfCheckReport, SystemParams, TempCalibration, TempReading,
};
pub use signal::Spectrum;

pub fn init_logging() {
    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stderr());

    if let Ok(log_file) = env::var("LOG_FILE") {
        dispatch = dispatch.chain(
            fern::log_file(log_file).expect("Failed to open LOG_FILE")
        );
    }

    dispatch.apply().expect("Failed to initialize logger");

}
