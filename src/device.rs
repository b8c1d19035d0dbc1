//! # Device Model Module
//!
//! What the scanner knows about an advertiser: the raw `Advertisement` from
//! the radio, the `DiscoveredDevice` reported to callers, and the
//! `NameFilter` that decides which advertisements are reported.

use chrono::{DateTime, Local};

/// One advertisement as delivered by the radio backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// 48-bit Bluetooth address in the low bits
    pub address: u64,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub name: Option<String>,
    pub address: String,
    pub rssi: Option<i16>,
    pub discovered_at: DateTime<Local>,
}

impl DiscoveredDevice {
    pub fn from_advertisement(adv: &Advertisement) -> Self {
        // Some stacks report an empty name instead of none
        Self {
            name: adv.local_name.clone().filter(|name| !name.is_empty()),
            address: format_address(adv.address),
            rssi: adv.rssi,
            discovered_at: Local::now(),
        }
    }
}

/// Which advertisements get reported.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NameFilter {
    #[default]
    Any,
    /// Case-sensitive local-name prefix; nameless advertisements never match
    Prefix(String),
}

impl NameFilter {
    pub fn matches(&self, name: Option<&str>) -> bool {
        match self {
            NameFilter::Any => true,
            NameFilter::Prefix(prefix) => name.is_some_and(|name| name.starts_with(prefix.as_str())),
        }
    }
}

/// Formats a Bluetooth address as `AA:BB:CC:DD:EE:FF`, most significant octet first.
pub fn format_address(address: u64) -> String {
    let bytes = address.to_be_bytes();
    // Top two bytes are outside the 48-bit address
    bytes[2..]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
