//! BLE scanning backends and RuuviTag frame decoding.
//!
//! Backends deliver decoded [`SensorReading`] values over a channel; frames
//! that fail to decode are logged and dropped, never forwarded. The decode
//! path is shared, only advertisement transport differs per backend.

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::mac_address::MacAddress;
use crate::reading::SensorReading;
use ruuvi_sensor_protocol::{
    Acceleration, BatteryPotential, Humidity, MeasurementSequenceNumber, MovementCounter,
    Pressure, SensorValues, Temperature, TransmitterPower,
};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failures while decoding a RuuviTag payload.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Data format byte other than 3 or 5
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Frame that cannot carry a format byte at all
    #[error("Invalid data: {0}")]
    InvalidData(String),
    /// Decoder library rejected the payload
    #[error("Decoder error: {0}")]
    DecoderError(String),
}

/// Error type for scanner startup.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Backend failure, with the backend's own message
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// The requested adapter does not exist on this host
    #[error("Bluetooth adapter '{0}' not found")]
    AdapterNotFound(String),
    /// Device argument that is not an `hci<N>` name
    #[error("Invalid device name '{0}': expected hci<N>")]
    InvalidDevice(String),
}

/// Ruuvi Innovations company id as the little-endian bytes BLE puts on the
/// wire, for advertisement pattern matching.
#[cfg(feature = "bluer")]
pub const RUUVI_MANUFACTURER_ID_BYTES: [u8; 2] = [0x99, 0x04];

/// Ruuvi Innovations company id (0x0499) for manufacturer-data lookup.
pub const RUUVI_MANUFACTURER_ID: u16 = 0x0499;

/// Manufacturer-specific data AD type
#[cfg(feature = "bluer")]
pub const MANUFACTURER_DATA_TYPE: u8 = 0xff;

/// Channel buffer size for decoded readings.
pub const READING_CHANNEL_BUFFER_SIZE: usize = 100;

/// Which transport to read advertisements from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// Discover through the bluetoothd daemon over D-Bus
    #[cfg(feature = "bluer")]
    #[value(alias = "bluez")]
    Bluer,
    /// Read a raw HCI socket, no daemon needed
    #[cfg(feature = "hci")]
    #[value(alias = "raw")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("at least one scanner backend feature must be enabled");
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => "bluer",
            #[cfg(feature = "hci")]
            Backend::Hci => "hci",
        };
        f.write_str(name)
    }
}

/// Decode a RuuviTag advertisement frame into a [`SensorReading`].
///
/// Takes the manufacturer-specific data bytes (without the company ID
/// prefix) together with the signal strength the transport observed, and
/// returns a reading with all values in export units. Formats 3 and 5 are
/// supported; the first payload byte selects the format.
///
/// The protocol crate hands back integer fixed-point values; this converts
/// them to Celsius, a 0..=1 humidity ratio, hPa, g and Volts.
pub fn decode_frame(
    mac: MacAddress,
    rssi: i16,
    data: &[u8],
) -> Result<SensorReading, DecodeError> {
    if data.is_empty() {
        return Err(DecodeError::InvalidData("Empty data".into()));
    }

    match data[0] {
        3 | 5 => decode_sensor_values(mac, rssi, data),
        _ => Err(DecodeError::UnsupportedFormat(format!(
            "RuuviTag data format {} (only formats 3 and 5 supported)",
            data[0]
        ))),
    }
}

fn decode_sensor_values(
    mac: MacAddress,
    rssi: i16,
    data: &[u8],
) -> Result<SensorReading, DecodeError> {
    let values = SensorValues::from_manufacturer_specific_data(RUUVI_MANUFACTURER_ID, data)
        .map_err(|e| {
            DecodeError::DecoderError(format!("Failed to decode RuuviTag data: {e:?}"))
        })?;

    let acceleration = values.acceleration_vector_as_milli_g().map(|v| {
        (
            f64::from(v.0) / 1000.0,
            f64::from(v.1) / 1000.0,
            f64::from(v.2) / 1000.0,
        )
    });

    Ok(SensorReading {
        device: mac.to_string(),
        rssi,
        humidity: values
            .humidity_as_ppm()
            .map(|ppm| f64::from(ppm) / 1_000_000.0),
        temperature: values
            .temperature_as_millicelsius()
            .map(|mc| f64::from(mc) / 1000.0),
        pressure: values.pressure_as_pascals().map(|pa| f64::from(pa) / 100.0),
        acceleration,
        battery: values
            .battery_potential_as_millivolts()
            .map(|mv| f64::from(mv) / 1000.0),
        tx_power: values.tx_power_as_dbm(),
        movement_counter: values.movement_counter(),
        measurement_sequence: values.measurement_sequence_number(),
    })
}

/// Start scanning with the chosen backend on the named adapter.
///
/// Dispatches to the backend implementation and hands back its channel of
/// decoded readings. The channel closes when scanning ends.
pub async fn start_scan(
    backend: Backend,
    device: &str,
) -> Result<mpsc::Receiver<SensorReading>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan(device).await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan(device).await,
    }
}
