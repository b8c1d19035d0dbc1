//! # Radio Module
//!
//! The host Bluetooth stack, seen from the scanner. `Radio` is the only seam
//! between scan lifecycle code and the OS: production code goes through
//! `BtleplugRadio`, tests script their own advertisements.

use crate::device::Advertisement;
use crate::error::ScanError;
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter,
};
use btleplug::platform::{Adapter, Manager, PeripheralId};
use futures::stream::{BoxStream, StreamExt};

pub type AdvertisementStream = BoxStream<'static, Advertisement>;

/// Radio availability as reported to C callers. The discriminants are ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BluetoothState {
    Enabled = 0,
    Disabled = 1,
    Unsupported = 2,
    Unknown = 3,
}

impl From<CentralState> for BluetoothState {
    fn from(state: CentralState) -> Self {
        match state {
            CentralState::PoweredOn => BluetoothState::Enabled,
            CentralState::PoweredOff => BluetoothState::Disabled,
            _ => BluetoothState::Unknown,
        }
    }
}

#[async_trait]
pub trait Radio: Send + Sync + 'static {
    async fn state(&self) -> BluetoothState;

    /// Start an active advertisement watch.
    async fn watch(&self) -> Result<AdvertisementStream, ScanError>;

    async fn stop(&self) -> Result<(), ScanError>;
}

/// Radio backed by the first adapter `btleplug` finds.
pub struct BtleplugRadio {
    adapter: Option<Adapter>,
}

impl BtleplugRadio {
    pub async fn new() -> Result<Self, ScanError> {
        let manager = Manager::new()
            .await
            .map_err(|e| ScanError::ManagerInit(e.to_string()))?;

        let adapter = manager
            .adapters()
            .await
            .map_err(|e| ScanError::ManagerInit(e.to_string()))?
            .into_iter()
            .next();

        match &adapter {
            Some(adapter) => match adapter.adapter_info().await {
                Ok(info) => log::info!("Using Bluetooth adapter {}", info),
                Err(e) => log::debug!("Could not describe Bluetooth adapter: {}", e),
            },
            None => log::warn!("No Bluetooth adapter found"),
        }

        Ok(Self { adapter })
    }

    fn adapter(&self) -> Result<&Adapter, ScanError> {
        self.adapter.as_ref().ok_or(ScanError::NoAdapters)
    }
}

#[async_trait]
impl Radio for BtleplugRadio {
    async fn state(&self) -> BluetoothState {
        let Some(adapter) = &self.adapter else {
            return BluetoothState::Unsupported;
        };

        match adapter.adapter_state().await {
            Ok(state) => state.into(),
            Err(e) => {
                log::warn!("Could not query adapter state: {}", e);
                BluetoothState::Unknown
            }
        }
    }

    async fn watch(&self) -> Result<AdvertisementStream, ScanError> {
        let adapter = self.adapter()?.clone();

        // Subscribe first so nothing reported right after start_scan is lost
        let events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;

        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        read_advertisement(&adapter, &id).await
                    }
                    _ => None,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn stop(&self) -> Result<(), ScanError> {
        self.adapter()?.stop_scan().await?;
        Ok(())
    }
}

async fn read_advertisement(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(e) => {
            log::debug!("Peripheral {:?} vanished: {}", id, e);
            return None;
        }
    };

    match peripheral.properties().await {
        Ok(Some(props)) => Some(to_advertisement(props)),
        Ok(None) => None,
        Err(e) => {
            log::debug!("Could not read properties of {:?}: {}", id, e);
            None
        }
    }
}

fn to_advertisement(props: PeripheralProperties) -> Advertisement {
    let mut raw = [0u8; 8];
    raw[2..].copy_from_slice(&props.address.into_inner());

    Advertisement {
        address: u64::from_be_bytes(raw),
        local_name: props.local_name,
        rssi: props.rssi,
    }
}
