//! Raw HCI socket backend.
//!
//! Scans for BLE advertisements straight off a Linux HCI socket, with no
//! BlueZ daemon in the path. Needs CAP_NET_RAW and CAP_NET_ADMIN (or root).

use super::{
    DecodeError, READING_CHANNEL_BUFFER_SIZE, RUUVI_MANUFACTURER_ID, ScanError, decode_frame,
};
use crate::mac_address::MacAddress;
use crate::reading::SensorReading;
use libc::{
    AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_RAW, c_int, c_void, sockaddr, socklen_t,
};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use tokio::io::unix::AsyncFd;
use tokio::sync::mpsc;
use tracing::debug;

// Socket-level constants missing from libc
const BTPROTO_HCI: c_int = 1;
const SOL_HCI: c_int = 0;
const HCI_FILTER: c_int = 2;
const HCI_CHANNEL_RAW: u16 = 0;

// Packet types
const HCI_COMMAND_PKT: u8 = 0x01;
const HCI_EVENT_PKT: u8 = 0x04;

// Events
const EVT_LE_META_EVENT: u8 = 0x3E;
const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;

// LE controller commands
const OGF_LE_CTL: u16 = 0x08;
const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;

// Scan parameter values
const LE_SCAN_PASSIVE: u8 = 0x00;
const LE_PUBLIC_ADDRESS: u8 = 0x00;
const FILTER_POLICY_ACCEPT_ALL: u8 = 0x00;

// AD types
const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

// Packet type + event code + parameter length + 255 parameter octets
const MAX_EVENT_PACKET_SIZE: usize = 258;

/// Kernel HCI socket address
#[repr(C)]
struct SockaddrHci {
    hci_family: u16,
    hci_dev: u16,
    hci_channel: u16,
}

/// Kernel HCI socket filter
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

impl HciFilter {
    /// Filter that passes only LE meta events.
    fn le_meta_events() -> Self {
        let event_bit = EVT_LE_META_EVENT as usize;
        let mut event_mask = [0u32; 2];
        event_mask[event_bit / 32] = 1 << (event_bit % 32);
        Self {
            type_mask: 1 << u32::from(HCI_EVENT_PKT),
            event_mask,
            opcode: 0,
        }
    }
}

fn socket_error(context: &str) -> ScanError {
    ScanError::Bluetooth(format!("{}: {}", context, io::Error::last_os_error()))
}

/// Raw HCI socket bound to one adapter.
struct HciSocket {
    fd: OwnedFd,
}

impl HciSocket {
    /// Open a raw non-blocking HCI socket and bind it to the adapter with
    /// the given kernel index.
    fn open(dev_id: u16) -> Result<Self, ScanError> {
        // Straight libc, there is no BTPROTO_HCI support in std.
        // SOCK_NONBLOCK so AsyncFd can poll the fd.
        let fd = unsafe {
            libc::socket(
                AF_BLUETOOTH,
                SOCK_RAW | SOCK_CLOEXEC | SOCK_NONBLOCK,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(socket_error("Failed to create HCI socket"));
        }
        let socket = Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };

        let addr = SockaddrHci {
            hci_family: AF_BLUETOOTH as u16,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_RAW,
        };
        let ret = unsafe {
            libc::bind(
                socket.as_raw_fd(),
                ptr::from_ref(&addr).cast::<sockaddr>(),
                size_of::<SockaddrHci>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(socket_error("Failed to bind HCI socket"));
        }
        Ok(socket)
    }

    /// Restrict delivery on this socket to LE meta events.
    fn filter_le_meta_events(&self) -> Result<(), ScanError> {
        let filter = HciFilter::le_meta_events();
        let ret = unsafe {
            libc::setsockopt(
                self.as_raw_fd(),
                SOL_HCI,
                HCI_FILTER,
                ptr::from_ref(&filter).cast::<c_void>(),
                size_of::<HciFilter>() as socklen_t,
            )
        };
        if ret < 0 {
            return Err(socket_error("Failed to set HCI filter"));
        }
        Ok(())
    }

    /// Issue one LE controller command.
    fn send_command(&self, ocf: u16, params: &[u8]) -> Result<(), ScanError> {
        let packet = command_packet(OGF_LE_CTL, ocf, params);
        let ret =
            unsafe { libc::write(self.as_raw_fd(), packet.as_ptr().cast::<c_void>(), packet.len()) };
        if ret < 0 {
            return Err(socket_error("Failed to send HCI command"));
        }
        Ok(())
    }

    /// Start passive LE scanning on the bound adapter.
    fn enable_le_scan(&self) -> Result<(), ScanError> {
        // Passive scan, 10ms interval and window (0.625ms units), public own
        // address, no allowlist. Multi-octet fields are little-endian.
        let params = [
            LE_SCAN_PASSIVE,
            0x10,
            0x00,
            0x10,
            0x00,
            LE_PUBLIC_ADDRESS,
            FILTER_POLICY_ACCEPT_ALL,
        ];
        self.send_command(OCF_LE_SET_SCAN_PARAMETERS, &params)?;
        // Enable, duplicate reports kept: repeat frames must keep reaching
        // the frame counter and the last-seen clock.
        self.send_command(OCF_LE_SET_SCAN_ENABLE, &[0x01, 0x00])
    }

    /// Non-blocking read of one HCI packet.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let ret =
            unsafe { libc::read(self.as_raw_fd(), buf.as_mut_ptr().cast::<c_void>(), buf.len()) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(ret as usize)
        }
    }
}

impl AsRawFd for HciSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Resolve an `hci<N>` device name to its kernel index.
fn parse_device_index(device: &str) -> Result<u16, ScanError> {
    device
        .strip_prefix("hci")
        .and_then(|n| n.parse::<u16>().ok())
        .ok_or_else(|| ScanError::InvalidDevice(device.to_string()))
}

/// Assemble an HCI command packet: packet type, opcode (little-endian),
/// parameter length, parameters.
fn command_packet(ogf: u16, ocf: u16, params: &[u8]) -> Vec<u8> {
    let opcode = (ogf << 10) | ocf;
    let mut packet = vec![
        HCI_COMMAND_PKT,
        opcode as u8,
        (opcode >> 8) as u8,
        params.len() as u8,
    ];
    packet.extend_from_slice(params);
    packet
}

fn is_le_advertising_report(packet: &[u8]) -> bool {
    packet.len() >= 4
        && packet[0] == HCI_EVENT_PKT
        && packet[1] == EVT_LE_META_EVENT
        && packet[3] == EVT_LE_ADVERTISING_REPORT
}

/// Walk the AD structures in an advertisement and return the payload of a
/// Ruuvi manufacturer-data entry, if any.
fn find_ruuvi_payload(ad_data: &[u8]) -> Option<&[u8]> {
    let mut offset = 0;
    while offset + 2 <= ad_data.len() {
        let len = ad_data[offset] as usize;
        if len == 0 || offset + 1 + len > ad_data.len() {
            return None;
        }
        if ad_data[offset + 1] == AD_TYPE_MANUFACTURER_DATA
            && len >= 3
            && u16::from_le_bytes([ad_data[offset + 2], ad_data[offset + 3]])
                == RUUVI_MANUFACTURER_ID
        {
            return Some(&ad_data[offset + 4..offset + 1 + len]);
        }
        offset += 1 + len;
    }
    None
}

/// Parse an LE advertising report event and extract the RuuviTag reading.
///
/// Returns `None` for reports that are not Ruuvi advertisements and for
/// malformed reports; returns `Some(Err(..))` when a Ruuvi frame was found
/// but its payload could not be decoded.
fn parse_advertising_report(packet: &[u8]) -> Option<Result<SensorReading, DecodeError>> {
    // Event header: packet type, event code, parameter length, subevent.
    let report = packet.get(4..)?;
    // Layout: num_reports, event_type, addr_type, 6 address octets, data length.
    if report.len() < 10 || report[0] == 0 {
        return None;
    }

    // Addresses arrive in little-endian octet order.
    let addr: [u8; 6] = report[3..9].try_into().ok()?;
    let mac = MacAddress::from_le_bytes(addr);

    let data_len = report[9] as usize;
    let ad_data = report.get(10..10 + data_len)?;
    // The RSSI octet trails the AD payload; some controllers omit it.
    let rssi = report.get(10 + data_len).map_or(0, |&b| i16::from(b as i8));

    let payload = find_ruuvi_payload(ad_data)?;
    Some(decode_frame(mac, rssi, payload))
}

/// Read HCI events off the socket and forward decoded readings until the
/// receiver is dropped or the socket fails. The command socket rides along
/// so the kernel keeps the scan configured.
async fn event_loop(
    events: AsyncFd<HciSocket>,
    _commands: HciSocket,
    tx: mpsc::Sender<SensorReading>,
) {
    let mut buf = [0u8; MAX_EVENT_PACKET_SIZE];
    loop {
        let mut guard = match events.readable().await {
            Ok(guard) => guard,
            Err(_) => return,
        };
        // Drain everything that is ready before polling again.
        loop {
            let n = match guard.try_io(|inner| inner.get_ref().recv(&mut buf)) {
                Ok(Ok(0)) | Ok(Err(_)) => return,
                Ok(Ok(n)) => n,
                // Would block; wait for readiness again.
                Err(_) => break,
            };
            let packet = &buf[..n];
            if is_le_advertising_report(packet)
                && let Some(result) = parse_advertising_report(packet)
            {
                match result {
                    Ok(reading) => {
                        if tx.send(reading).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => debug!(error = %e, "undecodable frame"),
                }
            }
        }
    }
}

/// Start scanning for RuuviTag frames on a raw HCI socket.
///
/// Binds to the adapter named by `device` (`hci<N>`), enables passive LE
/// scanning, and spawns a task that decodes advertising reports into the
/// returned channel. Scanning continues until the receiver is dropped.
pub async fn start_scan(device: &str) -> Result<mpsc::Receiver<SensorReading>, ScanError> {
    let dev_id = parse_device_index(device)?;

    // One socket receives events, a second one issues the scan commands so
    // the event filter does not swallow the command completions.
    let events = HciSocket::open(dev_id)?;
    events.filter_le_meta_events()?;
    let commands = HciSocket::open(dev_id)?;
    commands.enable_le_scan()?;

    let events = AsyncFd::new(events)
        .map_err(|e| ScanError::Bluetooth(format!("Failed to register HCI socket: {e}")))?;
    let (tx, rx) = mpsc::channel(READING_CHANNEL_BUFFER_SIZE);
    tokio::spawn(event_loop(events, commands, tx));

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v5_payload() -> Vec<u8> {
        vec![
            0x05, 0x12, 0xFC, 0x53, 0x94, 0xC3, 0x7C, 0x00, 0x04, 0xFF, 0xFC, 0x04, 0x0C, 0xAC,
            0x36, 0x42, 0x00, 0xCD, 0xCB, 0xB8, 0x33, 0x4C, 0x88, 0x4F,
        ]
    }

    /// Build a full HCI LE advertising report event carrying a Ruuvi frame.
    fn advertising_report(payload: &[u8], rssi: i8, with_rssi_byte: bool) -> Vec<u8> {
        let ad_len = (3 + payload.len()) as u8; // type byte + mfg id + payload
        let data_len = ad_len + 1; // length byte + AD structure

        let mut report = Vec::new();
        report.push(1); // num_reports
        report.push(0x00); // event_type
        report.push(0x00); // addr_type
        // Address, little-endian for AA:BB:CC:DD:EE:FF
        report.extend_from_slice(&[0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        report.push(data_len);
        report.push(ad_len);
        report.push(AD_TYPE_MANUFACTURER_DATA);
        report.extend_from_slice(&[0x99, 0x04]); // Ruuvi, little-endian
        report.extend_from_slice(payload);
        if with_rssi_byte {
            report.push(rssi as u8);
        }

        let mut packet = vec![
            HCI_EVENT_PKT,
            EVT_LE_META_EVENT,
            (report.len() + 1) as u8,
            EVT_LE_ADVERTISING_REPORT,
        ];
        packet.extend_from_slice(&report);
        packet
    }

    #[test]
    fn test_parse_device_index() {
        assert_eq!(parse_device_index("hci0").unwrap(), 0);
        assert_eq!(parse_device_index("hci12").unwrap(), 12);
        assert!(matches!(
            parse_device_index("eth0"),
            Err(ScanError::InvalidDevice(_))
        ));
        assert!(matches!(
            parse_device_index("hci"),
            Err(ScanError::InvalidDevice(_))
        ));
    }

    #[test]
    fn test_parse_advertising_report_with_rssi() {
        let packet = advertising_report(&v5_payload(), -72, true);
        let reading = parse_advertising_report(&packet).unwrap().unwrap();

        assert_eq!(reading.device, "AA:BB:CC:DD:EE:FF");
        assert_eq!(reading.rssi, -72);
        assert_eq!(reading.movement_counter, Some(66));
        assert_eq!(reading.format_version(), 5);
    }

    #[test]
    fn test_parse_advertising_report_without_rssi_byte() {
        let packet = advertising_report(&v5_payload(), 0, false);
        let reading = parse_advertising_report(&packet).unwrap().unwrap();
        assert_eq!(reading.rssi, 0);
    }

    #[test]
    fn test_parse_advertising_report_too_short() {
        assert!(parse_advertising_report(&[0x04, 0x3E, 0x02, 0x02]).is_none());
    }

    #[test]
    fn test_parse_advertising_report_non_ruuvi() {
        let mut packet = advertising_report(&v5_payload(), -72, true);
        // Rewrite the manufacturer id to some other vendor
        let mfg_pos = 4 + 12;
        packet[mfg_pos] = 0x4C;
        packet[mfg_pos + 1] = 0x00;
        assert!(parse_advertising_report(&packet).is_none());
    }

    #[test]
    fn test_parse_advertising_report_undecodable_payload() {
        let packet = advertising_report(&[0x05, 0x12], -72, true);
        let result = parse_advertising_report(&packet).unwrap();
        assert!(matches!(result, Err(DecodeError::DecoderError(_))));
    }

    #[test]
    fn test_find_ruuvi_payload_skips_leading_structures() {
        // Flags entry first, then manufacturer data with the Ruuvi id
        let mut ad = vec![0x02, 0x01, 0x06];
        ad.push(5); // type byte + mfg id + 2 payload bytes
        ad.push(AD_TYPE_MANUFACTURER_DATA);
        ad.extend_from_slice(&[0x99, 0x04, 0xAA, 0xBB]);
        assert_eq!(find_ruuvi_payload(&ad), Some(&[0xAA, 0xBB][..]));
    }

    #[test]
    fn test_find_ruuvi_payload_rejects_overrun_entry() {
        // Claims 10 octets but only 3 follow
        let ad = [0x0A, 0xFF, 0x99, 0x04];
        assert_eq!(find_ruuvi_payload(&ad), None);
    }

    #[test]
    fn test_le_meta_event_filter() {
        let filter = HciFilter::le_meta_events();

        // Packet type 0x04 is bit 4 of the type mask
        assert_eq!(filter.type_mask, 1 << HCI_EVENT_PKT);
        // Event 0x3E is bit 30 of the second mask word
        assert_eq!(filter.event_mask[0], 0);
        assert_eq!(filter.event_mask[1], 1 << (EVT_LE_META_EVENT % 32));
    }

    #[test]
    fn test_command_packet_layout() {
        let packet = command_packet(OGF_LE_CTL, OCF_LE_SET_SCAN_ENABLE, &[0x01, 0x00]);

        assert_eq!(packet[0], HCI_COMMAND_PKT);
        // Opcode 0x200C on the wire little-endian
        assert_eq!(&packet[1..3], &[0x0C, 0x20]);
        assert_eq!(packet[3], 2); // parameter length
        assert_eq!(packet.len(), 6);
    }
}
