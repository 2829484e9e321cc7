//! Compact MAC address type for Bluetooth devices.
//!
//! Device identity throughout the exporter is the MAC address rendered as
//! uppercase colon-separated text. This module holds the 6-byte form the
//! scanner backends work with and its canonical text rendering, decoupled
//! from any specific Bluetooth library.

use std::fmt;

/// A Bluetooth MAC address as a 6-byte array, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// Build an address from the little-endian byte order used in HCI
    /// advertising reports.
    pub fn from_le_bytes(mut bytes: [u8; 6]) -> Self {
        bytes.reverse();
        Self(bytes)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}
