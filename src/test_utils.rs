use crate::reading::SensorReading;

/// Build a `SensorReading` with every optional field set to `None`.
///
/// Tests can override just the fields they care about.
pub fn base_reading(device: &str) -> SensorReading {
    SensorReading {
        device: device.to_string(),
        rssi: -72,
        humidity: None,
        temperature: None,
        pressure: None,
        acceleration: None,
        battery: None,
        tx_power: None,
        movement_counter: None,
        measurement_sequence: None,
    }
}

/// Build a `SensorReading` with every field populated.
pub fn full_reading(device: &str) -> SensorReading {
    SensorReading {
        device: device.to_string(),
        rssi: -72,
        humidity: Some(0.55),
        temperature: Some(21.3),
        pressure: Some(1000.44),
        acceleration: Some((0.004, -0.004, 1.036)),
        battery: Some(2.977),
        tx_power: Some(4),
        movement_counter: Some(66),
        measurement_sequence: Some(205),
    }
}
