//! # C ABI Module
//!
//! Flat `extern "C"` surface over one process-wide [`Scanner`].
//!
//! Return conventions: `0` is success and `-1` is failure, except
//! `niox_ble_check_bluetooth_state`, which returns a [`BluetoothState`]
//! discriminant. Every entry point catches panics so nothing unwinds into C.
//! See `include/niox_ble.h` for the C declarations.

use crate::config::ScannerConfig;
use crate::device::DiscoveredDevice;
use crate::error::ScanError;
use crate::radio::BluetoothState;
use crate::scanner::{ScanRequest, Scanner};
use std::ffi::{c_char, c_int, c_void, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Device record handed to C. Strings are NUL-terminated UTF-8.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BleDevice {
    /// Null when the advertisement carried no local name
    pub name: *mut c_char,
    pub address: *mut c_char,
    pub rssi: c_int,
    pub has_rssi: c_int,
}

pub type DeviceFoundCallback = extern "C" fn(device: BleDevice, user_data: *mut c_void);

/// Library-owned copy of a reported device. Its strings back the
/// `BleDevice` passed to the callback and live until the next scan.
struct DeviceRecord {
    name: *mut c_char,
    address: *mut c_char,
    rssi: Option<i16>,
}

// The pointers are uniquely owned and only freed in Drop
unsafe impl Send for DeviceRecord {}

impl DeviceRecord {
    fn new(device: &DiscoveredDevice) -> Self {
        Self {
            name: device.name.as_deref().map_or(ptr::null_mut(), to_c_string),
            address: to_c_string(&device.address),
            rssi: device.rssi,
        }
    }

    fn view(&self) -> BleDevice {
        BleDevice {
            name: self.name,
            address: self.address,
            rssi: self.rssi.map_or(0, c_int::from),
            has_rssi: c_int::from(self.rssi.is_some()),
        }
    }
}

impl Drop for DeviceRecord {
    fn drop(&mut self) {
        unsafe {
            free_c_string(self.name);
            free_c_string(self.address);
        }
    }
}

fn to_c_string(s: &str) -> *mut c_char {
    let c_string = CString::new(s).unwrap_or_else(|e| {
        let mut bytes = e.into_vec();
        bytes.retain(|&b| b != 0);
        CString::new(bytes).unwrap_or_default()
    });
    c_string.into_raw()
}

/// # Safety
/// `s` must be null or come from `to_c_string` and not have been freed.
unsafe fn free_c_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

#[derive(Clone, Copy)]
struct CallbackTarget {
    callback: Option<DeviceFoundCallback>,
    user_data: *mut c_void,
}

// user_data is opaque to us; thread-safety of what it points to is the caller's contract
unsafe impl Send for CallbackTarget {}
unsafe impl Sync for CallbackTarget {}

impl CallbackTarget {
    fn invoke(&self, device: BleDevice) {
        if let Some(callback) = self.callback {
            callback(device, self.user_data);
        }
    }
}

struct Library {
    // Shared so stop can wait on the session without holding LIBRARY
    scanner: Arc<Scanner>,
    records: Arc<Mutex<Vec<DeviceRecord>>>,
}

impl Library {
    fn new(scanner: Scanner) -> Self {
        Self {
            scanner: Arc::new(scanner),
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn create() -> Result<Self, ScanError> {
        init_logging();
        let config = ScannerConfig::load().unwrap_or_else(|e| {
            log::warn!("Using default scanner config: {}", e);
            ScannerConfig::default()
        });
        Ok(Self::new(Scanner::new(config)?))
    }

    fn start_scan(
        &self,
        duration_ms: c_int,
        niox_only: bool,
        target: CallbackTarget,
    ) -> Result<(), ScanError> {
        if self.scanner.is_scanning() {
            return Err(ScanError::AlreadyScanning);
        }
        let request = ScanRequest::from_millis(duration_ms.into(), niox_only, self.scanner.config())?;

        lock(&self.records).clear();
        let records = self.records.clone();
        self.scanner.start_scan(request, move |device| {
            let view = {
                let record = DeviceRecord::new(device);
                let view = record.view();
                lock(&records).push(record);
                view
            };
            target.invoke(view);
        })
    }
}

static LIBRARY: Mutex<Option<Library>> = Mutex::new(None);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn init_logging() {
    // The host may already have installed a logger
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

fn ensure_initialized(slot: &mut Option<Library>) -> Result<&Library, ScanError> {
    if slot.is_none() {
        *slot = Some(Library::create()?);
        log::info!("niox-ble initialized");
    }
    slot.as_ref()
        .ok_or_else(|| ScanError::Runtime("library not initialized".to_string()))
}

fn guarded<T>(name: &str, fallback: T, f: impl FnOnce() -> T) -> T {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| {
        log::error!("{}: panic caught at the C boundary", name);
        fallback
    })
}

/// Initializes logging, configuration and the Bluetooth backend. Idempotent.
#[no_mangle]
pub extern "C" fn niox_ble_initialize() -> c_int {
    guarded("niox_ble_initialize", -1, || {
        match ensure_initialized(&mut lock(&LIBRARY)) {
            Ok(_) => 0,
            Err(e) => {
                log::error!("Initialization failed: {}", e);
                -1
            }
        }
    })
}

/// Stops any scan and releases every library resource, including the
/// strings previously handed to the callback.
#[no_mangle]
pub extern "C" fn niox_ble_cleanup() {
    guarded("niox_ble_cleanup", (), || {
        // Released outside the lock so callbacks still running can call back in
        let library = lock(&LIBRARY).take();
        if let Some(library) = library {
            drop(library);
            log::info!("niox-ble cleaned up");
        }
    })
}

/// Returns 0 (enabled), 1 (disabled), 2 (unsupported) or 3 (unknown).
#[no_mangle]
pub extern "C" fn niox_ble_check_bluetooth_state() -> c_int {
    guarded(
        "niox_ble_check_bluetooth_state",
        BluetoothState::Unknown as c_int,
        || {
            let mut slot = lock(&LIBRARY);
            let state = match ensure_initialized(&mut slot) {
                Ok(library) => library.scanner.bluetooth_state(),
                Err(e) => {
                    log::error!("Initialization failed: {}", e);
                    BluetoothState::Unknown
                }
            };
            state as c_int
        },
    )
}

/// Starts a scan of `duration_ms` milliseconds (0 = configured default).
/// With `niox_only` non-zero only devices whose name starts with the
/// configured prefix are reported. `callback` may be null.
#[no_mangle]
pub extern "C" fn niox_ble_start_scan(
    duration_ms: c_int,
    niox_only: c_int,
    callback: Option<DeviceFoundCallback>,
    user_data: *mut c_void,
) -> c_int {
    guarded("niox_ble_start_scan", -1, || {
        let target = CallbackTarget {
            callback,
            user_data,
        };
        let mut slot = lock(&LIBRARY);
        let result = ensure_initialized(&mut slot)
            .and_then(|library| library.start_scan(duration_ms, niox_only != 0, target));
        match result {
            Ok(()) => 0,
            Err(e) => {
                log::error!("Failed to start scan: {}", e);
                -1
            }
        }
    })
}

/// Stops the current scan. From a caller thread it returns once the watch
/// is stopped, so `niox_ble_start_scan` can follow immediately.
#[no_mangle]
pub extern "C" fn niox_ble_stop_scan() {
    guarded("niox_ble_stop_scan", (), || {
        let scanner = lock(&LIBRARY)
            .as_ref()
            .map(|library| library.scanner.clone());
        if let Some(scanner) = scanner {
            scanner.stop_scan();
        }
    })
}

#[no_mangle]
pub extern "C" fn niox_ble_is_scanning() -> c_int {
    guarded("niox_ble_is_scanning", 0, || {
        lock(&LIBRARY)
            .as_ref()
            .map_or(0, |library| c_int::from(library.scanner.is_scanning()))
    })
}

/// Number of devices reported by the latest scan.
#[no_mangle]
pub extern "C" fn niox_ble_discovered_count() -> c_int {
    guarded("niox_ble_discovered_count", 0, || {
        lock(&LIBRARY).as_ref().map_or(0, |library| {
            c_int::try_from(library.scanner.discovered().len()).unwrap_or(c_int::MAX)
        })
    })
}

/// Copies device `index` of the latest scan into `*out`. The strings are
/// newly allocated and must be released with `niox_ble_free_string`.
///
/// # Safety
/// `out` must be null or point to writable memory for one `BleDevice`.
#[no_mangle]
pub unsafe extern "C" fn niox_ble_get_device(index: c_int, out: *mut BleDevice) -> c_int {
    guarded("niox_ble_get_device", -1, || {
        if out.is_null() {
            return -1;
        }
        let Ok(index) = usize::try_from(index) else {
            return -1;
        };

        let device = match lock(&LIBRARY).as_ref() {
            Some(library) => library.scanner.discovered().into_iter().nth(index),
            None => None,
        };
        let Some(device) = device else {
            return -1;
        };

        let copy = BleDevice {
            name: device.name.as_deref().map_or(ptr::null_mut(), to_c_string),
            address: to_c_string(&device.address),
            rssi: device.rssi.map_or(0, c_int::from),
            has_rssi: c_int::from(device.rssi.is_some()),
        };
        out.write(copy);
        0
    })
}

/// Frees a string returned by this library. Null is ignored.
///
/// # Safety
/// `s` must be null or a string obtained from `niox_ble_get_device` that has
/// not been freed yet. Strings seen inside the callback are library-owned and
/// must not be passed here.
#[no_mangle]
pub unsafe extern "C" fn niox_ble_free_string(s: *mut c_char) {
    guarded("niox_ble_free_string", (), || free_c_string(s))
}
