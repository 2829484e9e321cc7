//! BlueZ D-Bus backend.
//!
//! Talks to the bluetoothd daemon through the `bluer` crate and registers a
//! passive advertisement monitor, so scanning coexists with other BlueZ
//! clients.

use super::{
    MANUFACTURER_DATA_TYPE, READING_CHANNEL_BUFFER_SIZE, RUUVI_MANUFACTURER_ID,
    RUUVI_MANUFACTURER_ID_BYTES, ScanError, decode_frame,
};
use crate::mac_address::MacAddress;
use crate::reading::SensorReading;
use bluer::monitor::{Monitor, MonitorEvent, MonitorHandle, MonitorManager, Pattern};
use bluer::{Adapter, Address, Session};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Monitor pattern matching the Ruuvi manufacturer id at the start of the
/// manufacturer-data AD structure.
fn ruuvi_pattern() -> Pattern {
    Pattern {
        data_type: MANUFACTURER_DATA_TYPE,
        start_position: 0,
        content: RUUVI_MANUFACTURER_ID_BYTES.to_vec(),
    }
}

/// Look up an adapter by its BlueZ name and power it on.
async fn powered_adapter(session: &Session, device: &str) -> Result<Adapter, ScanError> {
    let known = session.adapter_names().await?;
    if !known.iter().any(|name| name == device) {
        return Err(ScanError::AdapterNotFound(device.to_string()));
    }
    let adapter = session.adapter(device)?;
    adapter.set_powered(true).await?;
    Ok(adapter)
}

/// Start scanning for RuuviTag frames via BlueZ.
///
/// Registers a passive monitor for Ruuvi manufacturer data on the adapter
/// named by `device` (e.g. `hci0`) and spawns a task that decodes matching
/// devices into the returned channel.
pub async fn start_scan(device: &str) -> Result<mpsc::Receiver<SensorReading>, ScanError> {
    let session = Session::new().await?;
    let adapter = powered_adapter(&session, device).await?;

    let manager = adapter.monitor().await?;
    let events = manager
        .register(Monitor {
            patterns: Some(vec![ruuvi_pattern()]),
            ..Default::default()
        })
        .await?;

    let (tx, rx) = mpsc::channel(READING_CHANNEL_BUFFER_SIZE);
    tokio::spawn(event_loop(session, manager, events, adapter, tx));

    Ok(rx)
}

/// Forward discovered devices from the monitor stream until it ends.
///
/// The session and monitor manager move in here; dropping either would tear
/// down the registration while the stream is still live.
async fn event_loop(
    _session: Session,
    _manager: MonitorManager,
    mut events: MonitorHandle,
    adapter: Adapter,
    tx: mpsc::Sender<SensorReading>,
) {
    while let Some(event) = events.next().await {
        if let MonitorEvent::DeviceFound(device_id) = event
            && let Err(e) = process_device(&adapter, device_id.device, &tx).await
        {
            debug!(error = %e, "device processing failed");
        }
    }
    debug!("discovery event stream ended");
}

/// Pull manufacturer data and signal strength off a discovered device and
/// forward the decoded reading. Non-Ruuvi devices and undecodable frames
/// are skipped.
async fn process_device(
    adapter: &Adapter,
    address: Address,
    tx: &mpsc::Sender<SensorReading>,
) -> Result<(), ScanError> {
    let device = adapter.device(address)?;
    let mac: MacAddress = address.into();

    let Some(manufacturer_data) = device.manufacturer_data().await? else {
        return Ok(());
    };
    let Some(frame) = manufacturer_data.get(&RUUVI_MANUFACTURER_ID) else {
        // Some other vendor slipped past the monitor pattern
        return Ok(());
    };

    // RSSI is a device property here, not part of the payload; it can be
    // momentarily unavailable right after discovery.
    let rssi = device.rssi().await?.unwrap_or(0);

    match decode_frame(mac, rssi, frame) {
        Ok(reading) => {
            let _ = tx.send(reading).await;
        }
        Err(e) => debug!(device = %mac, error = %e, "undecodable frame"),
    }

    Ok(())
}
