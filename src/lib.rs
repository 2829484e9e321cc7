//! `ruuvi-prometheus` library.
//!
//! A Prometheus exporter for RuuviTag BLE sensor beacons. The binary
//! (`src/main.rs`) is responsible for CLI parsing, logging setup and process
//! exit codes. The core lives in [`crate::metrics`] (per-device metric
//! lifecycle) and [`crate::app`] (supervision), where it can be tested
//! deterministically with an injected scanner.

pub mod app;
pub mod mac_address;
pub mod metrics;
pub mod reading;
pub mod scanner;
pub mod sweeper;

#[cfg(test)]
pub mod test_utils;

// Flat re-exports of the names most callers need.
pub use app::{Options, RealScanner, RunError, Scanner};
pub use mac_address::MacAddress;
pub use metrics::{DeviceRegistry, InvalidReading};
pub use reading::SensorReading;
pub use scanner::{Backend, DecodeError, ScanError, decode_frame};
pub use sweeper::{SweepConfig, parse_duration};
