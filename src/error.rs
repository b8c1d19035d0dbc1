//! # Error Types Module
//!
//! Centralized error handling for the scanner library.
//!
//! ## Error Types
//! - `ScanError`: Bluetooth manager, adapter and scan lifecycle failures
//! - `ConfigError`: Configuration file I/O and parsing errors
//!
//! The C layer never exposes these directly; it logs them and maps them to
//! integer return codes.

use std::fmt;

/// Errors that can occur while talking to the radio or running a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    /// Bluetooth manager initialization failed
    ManagerInit(String),
    /// No Bluetooth adapters available
    NoAdapters,
    /// A scan is already running on this scanner
    AlreadyScanning,
    /// Failed to create the async runtime
    Runtime(String),
    /// Scan duration was negative
    InvalidDuration(i64),
    /// Scan operation failed
    ScanFailed(String),
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanError::ManagerInit(msg) => {
                write!(f, "Failed to initialize Bluetooth manager: {}", msg)
            }
            ScanError::NoAdapters => {
                write!(f, "No Bluetooth adapters found")
            }
            ScanError::AlreadyScanning => {
                write!(f, "A scan is already in progress")
            }
            ScanError::Runtime(msg) => {
                write!(f, "Failed to create async runtime: {}", msg)
            }
            ScanError::InvalidDuration(ms) => {
                write!(f, "Invalid scan duration: {} ms", ms)
            }
            ScanError::ScanFailed(msg) => {
                write!(f, "Scan operation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ScanError {}

impl From<btleplug::Error> for ScanError {
    fn from(err: btleplug::Error) -> Self {
        ScanError::ScanFailed(err.to_string())
    }
}

/// Errors from loading or saving `ScannerConfig`. The C layer never fails
/// on these; it falls back to the default prefix and duration.
#[derive(Debug)]
pub enum ConfigError {
    /// config.toml exists but could not be read
    ReadFailed(std::io::Error),
    /// The config directory or a fresh default config.toml could not be written
    WriteFailed(std::io::Error),
    /// config.toml is not valid TOML, or a key has the wrong type
    ParseFailed(toml::de::Error),
    SerializeFailed(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => write!(f, "Cannot read scanner config: {}", e),
            ConfigError::WriteFailed(e) => write!(f, "Cannot write scanner config: {}", e),
            ConfigError::ParseFailed(e) => write!(f, "Invalid scanner config: {}", e),
            ConfigError::SerializeFailed(e) => {
                write!(f, "Cannot encode scanner config: {}", e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
        }
    }
}
