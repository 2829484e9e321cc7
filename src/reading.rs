//! Decoded RuuviTag sensor observation.

/// One decoded sensor observation from a RuuviTag.
///
/// Values are stored in export units:
/// - Temperature in Celsius
/// - Relative humidity as a ratio (0.0 to 1.0)
/// - Pressure in hPa
/// - Acceleration in g (standard gravity)
/// - Battery voltage in Volts
/// - TX power in dBm
///
/// Every field other than the device id and the signal strength is optional.
/// The RuuviTag protocol has several variants and a tag may omit fields
/// depending on which one it broadcasts; a reading with every optional field
/// absent is still a valid observation.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    /// Stable device identifier, the tag's MAC address as text
    pub device: String,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Relative humidity as a ratio (0.0 to 1.0)
    pub humidity: Option<f64>,
    /// Temperature in Celsius
    pub temperature: Option<f64>,
    /// Atmospheric pressure in hPa
    pub pressure: Option<f64>,
    /// Acceleration vector (x, y, z) in g
    pub acceleration: Option<(f64, f64, f64)>,
    /// Battery voltage in Volts
    pub battery: Option<f64>,
    /// TX power in dBm
    pub tx_power: Option<i8>,
    /// Movement counter
    pub movement_counter: Option<u32>,
    /// Measurement sequence number
    pub measurement_sequence: Option<u32>,
}

impl SensorReading {
    /// Classify which protocol variant this reading came from.
    ///
    /// TX power, the movement counter and the sequence number only exist in
    /// data format 5. A frame carrying none of them is classified as the
    /// older format 3. The classification looks at this reading alone, never
    /// at earlier readings from the same device.
    pub fn format_version(&self) -> u8 {
        if self.tx_power.is_none()
            && self.movement_counter.is_none()
            && self.measurement_sequence.is_none()
        {
            3
        } else {
            5
        }
    }
}
