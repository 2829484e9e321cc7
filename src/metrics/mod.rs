//! Per-device metric lifecycle management.
//!
//! [`DeviceRegistry`] is the single source of truth for the current state of
//! every live RuuviTag. The ingest loop feeds it decoded readings, the expiry
//! sweeper removes devices that have gone silent, and the scrape endpoint
//! renders a snapshot on demand. All three paths synchronize on one mutex so
//! that a device's metric set is always updated and deleted as a unit.

pub mod exporter;

use prometheus_client::encoding::text;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::reading::SensorReading;

/// Error for a reading that cannot be attributed to a device.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Invalid reading: missing device id")]
pub struct InvalidReading;

/// Labels shared by all per-device metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct DeviceLabels {
    device: String,
}

/// Acceleration axis label values.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum Axis {
    X,
    Y,
    Z,
}

const AXES: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

/// Labels for the 3-axis acceleration gauge.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct AccelerationLabels {
    device: String,
    axis: Axis,
}

/// Floating point gauge, for physical quantities.
type GaugeF64 = Gauge<f64, AtomicU64>;

/// Everything guarded by the registry mutex.
///
/// The last-seen table and the metric families live under the same lock so
/// that expiring a device removes its timestamp and all of its label sets in
/// one step, without an interleaved observe resurrecting half of them.
struct Inner {
    registry: Registry,
    last_seen: HashMap<String, Instant>,
    frames: Family<DeviceLabels, Counter>,
    humidity: Family<DeviceLabels, GaugeF64>,
    temperature: Family<DeviceLabels, GaugeF64>,
    pressure: Family<DeviceLabels, GaugeF64>,
    acceleration: Family<AccelerationLabels, GaugeF64>,
    battery: Family<DeviceLabels, GaugeF64>,
    rssi: Family<DeviceLabels, Gauge>,
    format: Family<DeviceLabels, Gauge>,
    tx_power: Family<DeviceLabels, Gauge>,
    movement: Family<DeviceLabels, Gauge>,
    sequence: Family<DeviceLabels, Gauge>,
}

impl Inner {
    fn new() -> Self {
        let mut registry = Registry::default();

        let frames = Family::<DeviceLabels, Counter>::default();
        // Registered without the _total suffix; the encoder appends it to
        // counter samples.
        registry.register("ruuvi_frames", "Total Ruuvi frames received", frames.clone());

        let humidity = Family::<DeviceLabels, GaugeF64>::default();
        registry.register(
            "ruuvi_humidity_ratio",
            "Ruuvi tag sensor relative humidity",
            humidity.clone(),
        );

        let temperature = Family::<DeviceLabels, GaugeF64>::default();
        registry.register(
            "ruuvi_temperature_celsius",
            "Ruuvi tag sensor temperature",
            temperature.clone(),
        );

        let pressure = Family::<DeviceLabels, GaugeF64>::default();
        registry.register(
            "ruuvi_pressure_hpa",
            "Ruuvi tag sensor air pressure",
            pressure.clone(),
        );

        let acceleration = Family::<AccelerationLabels, GaugeF64>::default();
        registry.register(
            "ruuvi_acceleration_g",
            "Ruuvi tag sensor acceleration X/Y/Z",
            acceleration.clone(),
        );

        let battery = Family::<DeviceLabels, GaugeF64>::default();
        registry.register(
            "ruuvi_battery_volts",
            "Ruuvi tag battery voltage",
            battery.clone(),
        );

        let rssi = Family::<DeviceLabels, Gauge>::default();
        registry.register(
            "ruuvi_rssi_dbm",
            "Ruuvi tag received signal strength RSSI",
            rssi.clone(),
        );

        let format = Family::<DeviceLabels, Gauge>::default();
        registry.register(
            "ruuvi_format",
            "Ruuvi frame format version (e.g. 3 or 5)",
            format.clone(),
        );

        let tx_power = Family::<DeviceLabels, Gauge>::default();
        registry.register(
            "ruuvi_txpower_dbm",
            "Ruuvi transmit power in dBm",
            tx_power.clone(),
        );

        let movement = Family::<DeviceLabels, Gauge>::default();
        registry.register("ruuvi_movecount_total", "Ruuvi movement counter", movement.clone());

        let sequence = Family::<DeviceLabels, Gauge>::default();
        registry.register(
            "ruuvi_seqno_current",
            "Ruuvi frame sequence number",
            sequence.clone(),
        );

        Self {
            registry,
            last_seen: HashMap::new(),
            frames,
            humidity,
            temperature,
            pressure,
            acceleration,
            battery,
            rssi,
            format,
            tx_power,
            movement,
            sequence,
        }
    }

    /// Remove every label set belonging to `device`, then its timestamp.
    fn remove_device(&mut self, device: &str) {
        let labels = DeviceLabels {
            device: device.to_string(),
        };
        self.frames.remove(&labels);
        self.humidity.remove(&labels);
        self.temperature.remove(&labels);
        self.pressure.remove(&labels);
        self.battery.remove(&labels);
        self.rssi.remove(&labels);
        self.format.remove(&labels);
        self.tx_power.remove(&labels);
        self.movement.remove(&labels);
        self.sequence.remove(&labels);
        for axis in AXES {
            self.acceleration.remove(&AccelerationLabels {
                device: device.to_string(),
                axis,
            });
        }
        self.last_seen.remove(device);
    }
}

/// Current metric state of every recently seen RuuviTag.
///
/// A device entry exists exactly as long as at least one reading for it
/// arrived within the freshness window; [`DeviceRegistry::expire`] drops
/// silent devices entirely so no stale series remain in the scrape output.
/// Constructed once at startup and shared between the ingest loop, the
/// sweeper and the scrape endpoint.
pub struct DeviceRegistry {
    inner: Mutex<Inner>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Record one decoded reading.
    ///
    /// Increments the frame counter and refreshes the device's last-seen
    /// time. Signal strength and the format version gauge are always set;
    /// every other gauge is only overwritten when the reading carries the
    /// field. An absent field keeps its previously exported value, so a tag
    /// alternating between protocol variants does not flap its gauges.
    ///
    /// Readings without a device id are rejected and change nothing.
    pub fn observe(&self, reading: &SensorReading) -> Result<(), InvalidReading> {
        if reading.device.is_empty() {
            return Err(InvalidReading);
        }

        let labels = DeviceLabels {
            device: reading.device.clone(),
        };
        let mut inner = self.inner.lock().expect("device registry lock poisoned");

        inner.frames.get_or_create(&labels).inc();
        inner.rssi.get_or_create(&labels).set(i64::from(reading.rssi));

        if let Some(battery) = reading.battery {
            inner.battery.get_or_create(&labels).set(battery);
        }
        if let Some(pressure) = reading.pressure {
            inner.pressure.get_or_create(&labels).set(pressure);
        }
        if let Some(temperature) = reading.temperature {
            inner.temperature.get_or_create(&labels).set(temperature);
        }
        if let Some(humidity) = reading.humidity {
            inner.humidity.get_or_create(&labels).set(humidity);
        }
        if let Some((x, y, z)) = reading.acceleration {
            for (axis, value) in [(Axis::X, x), (Axis::Y, y), (Axis::Z, z)] {
                inner
                    .acceleration
                    .get_or_create(&AccelerationLabels {
                        device: reading.device.clone(),
                        axis,
                    })
                    .set(value);
            }
        }

        inner
            .format
            .get_or_create(&labels)
            .set(i64::from(reading.format_version()));

        if let Some(tx_power) = reading.tx_power {
            inner.tx_power.get_or_create(&labels).set(i64::from(tx_power));
        }
        if let Some(count) = reading.movement_counter {
            inner.movement.get_or_create(&labels).set(i64::from(count));
        }
        if let Some(sequence) = reading.measurement_sequence {
            inner.sequence.get_or_create(&labels).set(i64::from(sequence));
        }

        inner.last_seen.insert(reading.device.clone(), Instant::now());
        Ok(())
    }

    /// Drop every device not seen for longer than `freshness`.
    ///
    /// Removal is all-or-nothing per device: the counter, every gauge
    /// including the three acceleration axes, and the last-seen entry go in
    /// the same critical section. Returns how many devices were dropped.
    pub fn expire(&self, now: Instant, freshness: Duration) -> usize {
        let mut inner = self.inner.lock().expect("device registry lock poisoned");

        let expired: Vec<String> = inner
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > freshness)
            .map(|(device, _)| device.clone())
            .collect();

        for device in &expired {
            inner.remove_device(device);
        }

        expired.len()
    }

    /// Render the current state in the OpenMetrics text format.
    pub fn export(&self) -> Result<String, fmt::Error> {
        let inner = self.inner.lock().expect("device registry lock poisoned");
        let mut out = String::new();
        text::encode(&mut out, &inner.registry)?;
        Ok(out)
    }

    /// Number of devices currently tracked.
    pub fn device_count(&self) -> usize {
        self.inner
            .lock()
            .expect("device registry lock poisoned")
            .last_seen
            .len()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.device_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{base_reading, full_reading};

    #[test]
    fn observe_full_reading_exports_all_series() {
        let registry = DeviceRegistry::new();
        registry.observe(&full_reading("AA:BB")).unwrap();

        let exported = registry.export().unwrap();
        assert!(exported.contains("ruuvi_frames_total{device=\"AA:BB\"} 1"));
        assert!(exported.contains("ruuvi_humidity_ratio{device=\"AA:BB\"} 0.55"));
        assert!(exported.contains("ruuvi_temperature_celsius{device=\"AA:BB\"} 21.3"));
        assert!(exported.contains("ruuvi_pressure_hpa{device=\"AA:BB\"} 1000.44"));
        assert!(exported.contains("ruuvi_acceleration_g{device=\"AA:BB\",axis=\"X\"} 0.004"));
        assert!(exported.contains("ruuvi_acceleration_g{device=\"AA:BB\",axis=\"Y\"} -0.004"));
        assert!(exported.contains("ruuvi_acceleration_g{device=\"AA:BB\",axis=\"Z\"} 1.036"));
        assert!(exported.contains("ruuvi_battery_volts{device=\"AA:BB\"} 2.977"));
        assert!(exported.contains("ruuvi_rssi_dbm{device=\"AA:BB\"} -72"));
        assert!(exported.contains("ruuvi_format{device=\"AA:BB\"} 5"));
        assert!(exported.contains("ruuvi_txpower_dbm{device=\"AA:BB\"} 4"));
        assert!(exported.contains("ruuvi_movecount_total{device=\"AA:BB\"} 66"));
        assert!(exported.contains("ruuvi_seqno_current{device=\"AA:BB\"} 205"));
    }

    #[test]
    fn observe_minimal_reading_exports_only_mandatory_series() {
        let registry = DeviceRegistry::new();
        registry.observe(&base_reading("AA:BB")).unwrap();

        let exported = registry.export().unwrap();
        assert!(exported.contains("ruuvi_frames_total{device=\"AA:BB\"} 1"));
        assert!(exported.contains("ruuvi_rssi_dbm{device=\"AA:BB\"} -72"));
        assert!(exported.contains("ruuvi_format{device=\"AA:BB\"} 3"));
        assert!(!exported.contains("ruuvi_humidity_ratio{"));
        assert!(!exported.contains("ruuvi_temperature_celsius{"));
        assert!(!exported.contains("ruuvi_acceleration_g{"));
        assert!(!exported.contains("ruuvi_battery_volts{"));
        assert!(!exported.contains("ruuvi_txpower_dbm{"));
    }

    #[test]
    fn absent_fields_keep_their_last_value() {
        let registry = DeviceRegistry::new();
        registry.observe(&full_reading("AA:BB")).unwrap();

        let mut follow_up = base_reading("AA:BB");
        follow_up.rssi = -80;
        registry.observe(&follow_up).unwrap();

        let exported = registry.export().unwrap();
        // Present fields updated
        assert!(exported.contains("ruuvi_frames_total{device=\"AA:BB\"} 2"));
        assert!(exported.contains("ruuvi_rssi_dbm{device=\"AA:BB\"} -80"));
        // Absent fields unchanged from the first reading
        assert!(exported.contains("ruuvi_humidity_ratio{device=\"AA:BB\"} 0.55"));
        assert!(exported.contains("ruuvi_battery_volts{device=\"AA:BB\"} 2.977"));
        // The format gauge is reclassified from the current reading alone
        assert!(exported.contains("ruuvi_format{device=\"AA:BB\"} 3"));
    }

    #[test]
    fn format_gauge_follows_any_later_variant_field() {
        let registry = DeviceRegistry::new();
        let mut reading = base_reading("AA:BB");
        reading.movement_counter = Some(1);
        registry.observe(&reading).unwrap();

        let exported = registry.export().unwrap();
        assert!(exported.contains("ruuvi_format{device=\"AA:BB\"} 5"));
    }

    #[test]
    fn observe_rejects_empty_device_id() {
        let registry = DeviceRegistry::new();
        assert_eq!(registry.observe(&base_reading("")), Err(InvalidReading));
        assert_eq!(registry.device_count(), 0);
        assert!(!registry.export().unwrap().contains("device="));
    }

    #[test]
    fn expire_removes_every_series_of_a_silent_device() {
        let registry = DeviceRegistry::new();
        registry.observe(&full_reading("CC:DD")).unwrap();
        assert_eq!(registry.device_count(), 1);

        let dropped = registry.expire(
            Instant::now() + Duration::from_secs(61),
            Duration::from_secs(60),
        );

        assert_eq!(dropped, 1);
        assert_eq!(registry.device_count(), 0);
        let exported = registry.export().unwrap();
        assert!(!exported.contains("device=\"CC:DD\""));
        assert!(!exported.contains("axis="));
    }

    #[test]
    fn expire_keeps_devices_inside_the_freshness_window() {
        let registry = DeviceRegistry::new();
        registry.observe(&full_reading("AA:BB")).unwrap();

        let dropped = registry.expire(Instant::now(), Duration::from_secs(60));

        assert_eq!(dropped, 0);
        assert_eq!(registry.device_count(), 1);
        assert!(
            registry
                .export()
                .unwrap()
                .contains("ruuvi_frames_total{device=\"AA:BB\"} 1")
        );
    }

    #[test]
    fn expire_drops_only_silent_devices() {
        let registry = DeviceRegistry::new();
        registry.observe(&full_reading("OL:DD")).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        registry.observe(&full_reading("NE:WW")).unwrap();

        let dropped = registry.expire(Instant::now(), Duration::from_millis(25));

        assert_eq!(dropped, 1);
        let exported = registry.export().unwrap();
        assert!(!exported.contains("device=\"OL:DD\""));
        assert!(exported.contains("device=\"NE:WW\""));
    }

    #[test]
    fn expire_is_idempotent() {
        let registry = DeviceRegistry::new();
        registry.observe(&full_reading("AA:BB")).unwrap();

        let now = Instant::now() + Duration::from_secs(120);
        assert_eq!(registry.expire(now, Duration::from_secs(60)), 1);
        assert_eq!(registry.expire(now, Duration::from_secs(60)), 0);
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn reobserved_device_starts_a_fresh_frame_count() {
        let registry = DeviceRegistry::new();
        registry.observe(&full_reading("AA:BB")).unwrap();
        registry.observe(&full_reading("AA:BB")).unwrap();
        registry.expire(
            Instant::now() + Duration::from_secs(61),
            Duration::from_secs(60),
        );

        registry.observe(&full_reading("AA:BB")).unwrap();

        let exported = registry.export().unwrap();
        assert!(exported.contains("ruuvi_frames_total{device=\"AA:BB\"} 1"));
    }

    #[test]
    fn concurrent_observes_and_sweeps_stay_consistent() {
        let registry = DeviceRegistry::new();
        let devices: Vec<String> = (0..8).map(|i| format!("DE:VI:CE:00:00:{i:02X}")).collect();

        std::thread::scope(|scope| {
            let registry = &registry;
            for device in &devices {
                scope.spawn(move || {
                    for _ in 0..100 {
                        registry.observe(&full_reading(device)).unwrap();
                    }
                });
            }
            // A sweeper that never finds anything stale, racing the writers
            scope.spawn(move || {
                for _ in 0..50 {
                    registry.expire(Instant::now(), Duration::from_secs(60));
                    std::thread::sleep(Duration::from_micros(100));
                }
            });
            // A scraper racing both
            scope.spawn(move || {
                for _ in 0..50 {
                    let _ = registry.export().unwrap();
                }
            });
        });

        assert_eq!(registry.device_count(), devices.len());
        let exported = registry.export().unwrap();
        for device in &devices {
            // Every device has its full, consistent metric set
            assert!(exported.contains(&format!("ruuvi_frames_total{{device=\"{device}\"}} 100")));
            assert!(exported.contains(&format!("ruuvi_format{{device=\"{device}\"}} 5")));
            let accel_z = format!("ruuvi_acceleration_g{{device=\"{device}\",axis=\"Z\"}} 1.036");
            assert!(exported.contains(&accel_z));
        }

        registry.expire(
            Instant::now() + Duration::from_secs(120),
            Duration::from_secs(60),
        );
        assert_eq!(registry.device_count(), 0);
        assert!(!registry.export().unwrap().contains("device="));
    }
}
