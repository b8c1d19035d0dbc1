//! Bluetooth Low Energy advertisement scanning behind a flat C ABI.
//!
//! The host Bluetooth stack (through `btleplug`) does the radio work. This
//! crate owns the watch lifecycle, filters advertisements by local-name
//! prefix and reports matches to a callback. Rust callers use [`Scanner`]
//! directly; C callers go through the `niox_ble_*` functions in [`ffi`].

pub mod config;
pub mod device;
pub mod error;
pub mod ffi;
pub mod radio;
pub mod scanner;

pub use config::ScannerConfig;
pub use device::{format_address, Advertisement, DiscoveredDevice, NameFilter};
pub use error::{ConfigError, ScanError};
pub use radio::{BluetoothState, BtleplugRadio, Radio};
pub use scanner::{ScanRequest, Scanner};
