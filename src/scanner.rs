//! # Scanner Module
//!
//! Owns the lifecycle of one advertisement watch at a time.
//!
//! ## Key Components
//! - `Scanner`: private Tokio runtime, radio handle, discovered-device list
//! - `ScanRequest`: how long to watch and which names to report
//! - Scan sessions: spawned tasks that pump advertisements into a sink until
//!   the duration elapses, `stop_scan` is called, or the radio stream ends
//!
//! The public API is blocking so that it can be driven from C threads that
//! know nothing about async Rust. Sinks run on runtime worker threads.

use crate::config::ScannerConfig;
use crate::device::{Advertisement, DiscoveredDevice, NameFilter};
use crate::error::ScanError;
use crate::radio::{AdvertisementStream, BluetoothState, BtleplugRadio, Radio};
use futures::StreamExt;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const STOP_GRACE: Duration = Duration::from_secs(2);

pub type DeviceSink = Box<dyn Fn(&DiscoveredDevice) + Send + Sync + 'static>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
    pub duration: Duration,
    pub filter: NameFilter,
}

impl ScanRequest {
    pub fn new(duration: Duration, filter: NameFilter) -> Self {
        Self { duration, filter }
    }

    /// Builds a request from C-style arguments. Zero means the configured
    /// default duration; `niox_only` filters on the configured name prefix.
    pub fn from_millis(
        duration_ms: i64,
        niox_only: bool,
        config: &ScannerConfig,
    ) -> Result<Self, ScanError> {
        let duration = match duration_ms {
            ms if ms < 0 => return Err(ScanError::InvalidDuration(ms)),
            0 => config.default_duration(),
            ms => Duration::from_millis(ms as u64),
        };

        let filter = if niox_only {
            NameFilter::Prefix(config.name_prefix.clone())
        } else {
            NameFilter::Any
        };

        Ok(Self::new(duration, filter))
    }
}

struct ActiveScan {
    id: u64,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ScanState {
    active: Option<ActiveScan>,
    next_id: u64,
    discovered: Vec<DiscoveredDevice>,
}

fn lock(state: &Mutex<ScanState>) -> MutexGuard<'_, ScanState> {
    // Sinks are run under catch_unwind; a poisoned lock still holds valid state
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Scanner {
    runtime: Option<Runtime>,
    radio: Arc<dyn Radio>,
    config: ScannerConfig,
    state: Arc<Mutex<ScanState>>,
}

impl Scanner {
    /// Creates a scanner over the first Bluetooth adapter of the host.
    pub fn new(config: ScannerConfig) -> Result<Self, ScanError> {
        let runtime = build_runtime()?;
        let radio = runtime.block_on(BtleplugRadio::new())?;
        Ok(Self::from_parts(runtime, config, Arc::new(radio)))
    }

    /// Creates a scanner over any radio implementation.
    pub fn with_radio<R: Radio>(config: ScannerConfig, radio: R) -> Result<Self, ScanError> {
        let runtime = build_runtime()?;
        Ok(Self::from_parts(runtime, config, Arc::new(radio)))
    }

    fn from_parts(runtime: Runtime, config: ScannerConfig, radio: Arc<dyn Radio>) -> Self {
        Self {
            runtime: Some(runtime),
            radio,
            config,
            state: Arc::new(Mutex::new(ScanState::default())),
        }
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    fn runtime(&self) -> Result<&Runtime, ScanError> {
        if Handle::try_current().is_ok() {
            return Err(ScanError::ScanFailed(
                "blocking scanner call made from inside an async context".to_string(),
            ));
        }
        self.runtime
            .as_ref()
            .ok_or_else(|| ScanError::Runtime("scanner has been shut down".to_string()))
    }

    pub fn bluetooth_state(&self) -> BluetoothState {
        match self.runtime() {
            Ok(runtime) => runtime.block_on(self.radio.state()),
            Err(e) => {
                log::warn!("Cannot query Bluetooth state: {}", e);
                BluetoothState::Unknown
            }
        }
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.state).active.is_some()
    }

    /// Devices reported by the latest scan, in report order.
    pub fn discovered(&self) -> Vec<DiscoveredDevice> {
        lock(&self.state).discovered.clone()
    }

    /// Starts watching for advertisements and returns immediately.
    ///
    /// Every advertisement that passes the request's filter is recorded in
    /// [`Scanner::discovered`] and then handed to `sink`. Must not be called
    /// from inside a sink.
    pub fn start_scan<F>(&self, request: ScanRequest, sink: F) -> Result<(), ScanError>
    where
        F: Fn(&DiscoveredDevice) + Send + Sync + 'static,
    {
        let runtime = self.runtime()?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let id = {
            let mut state = lock(&self.state);
            if state.active.is_some() {
                return Err(ScanError::AlreadyScanning);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.discovered.clear();
            state.active = Some(ActiveScan {
                id,
                stop: Some(stop_tx),
                handle: None,
            });
            id
        };

        let stream = match runtime.block_on(self.radio.watch()) {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("Failed to start advertisement watch: {}", e);
                lock(&self.state).active = None;
                return Err(e);
            }
        };

        log::info!(
            "Scan {} started for {:?} ({:?})",
            id,
            request.duration,
            request.filter
        );

        let session = Session {
            id,
            radio: self.radio.clone(),
            state: self.state.clone(),
            request,
            report_duplicates: self.config.report_duplicates,
            sink: Box::new(sink),
        };
        let handle = runtime.spawn(session.run(stream, stop_rx));

        let mut state = lock(&self.state);
        match state.active.as_mut() {
            Some(active) if active.id == id => active.handle = Some(handle),
            // Session already finished on its own
            _ => {}
        }

        Ok(())
    }

    /// Stops the active scan.
    ///
    /// From an ordinary thread this waits (up to a short grace period) until
    /// the radio watch is stopped, so a new scan can start right after it
    /// returns. From inside a sink it only signals the session.
    pub fn stop_scan(&self) {
        let blocking = Handle::try_current().is_err();
        let handle = {
            let mut state = lock(&self.state);
            let Some(active) = state.active.as_mut() else {
                return;
            };
            if let Some(stop) = active.stop.take() {
                log::debug!("Stop requested for scan {}", active.id);
                let _ = stop.send(());
            }
            if blocking {
                active.handle.take()
            } else {
                None
            }
        };

        if let (Some(handle), Some(runtime)) = (handle, self.runtime.as_ref()) {
            let finished =
                runtime.block_on(async { tokio::time::timeout(STOP_GRACE, handle).await });
            if finished.is_err() {
                log::warn!("Scan session did not finish within {:?}", STOP_GRACE);
            }
        }
    }

    /// Stops any scan and tears down the runtime. Called by `Drop`.
    pub fn shutdown(&mut self) {
        self.stop_scan();
        lock(&self.state).active = None;

        let Some(runtime) = self.runtime.take() else {
            return;
        };

        if Handle::try_current().is_ok() {
            // Dropped from a sink or a foreign runtime; blocking would panic
            runtime.shutdown_background();
            return;
        }
        runtime.shutdown_timeout(STOP_GRACE);
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_runtime() -> Result<Runtime, ScanError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("niox-ble")
        .enable_all()
        .build()
        .map_err(|e| ScanError::Runtime(e.to_string()))
}

struct Session {
    id: u64,
    radio: Arc<dyn Radio>,
    state: Arc<Mutex<ScanState>>,
    request: ScanRequest,
    report_duplicates: bool,
    sink: DeviceSink,
}

enum SessionEnd {
    Elapsed,
    Stopped,
    StreamEnded,
    SinkPanicked,
}

impl Session {
    async fn run(self, mut stream: AdvertisementStream, mut stop: oneshot::Receiver<()>) {
        let deadline = tokio::time::sleep(self.request.duration);
        tokio::pin!(deadline);
        let mut seen = HashSet::new();

        let end = loop {
            // Stop and deadline win over pending advertisements
            tokio::select! {
                biased;
                _ = &mut stop => break SessionEnd::Stopped,
                _ = &mut deadline => break SessionEnd::Elapsed,
                adv = stream.next() => match adv {
                    Some(adv) => {
                        if let Some(end) = self.report(&adv, &mut seen) {
                            break end;
                        }
                    }
                    None => break SessionEnd::StreamEnded,
                },
            }
        };

        match end {
            SessionEnd::Elapsed => {
                log::info!("Scan {} finished after {:?}", self.id, self.request.duration)
            }
            SessionEnd::Stopped => log::info!("Scan {} stopped", self.id),
            SessionEnd::StreamEnded => {
                log::warn!("Scan {}: advertisement stream ended", self.id)
            }
            SessionEnd::SinkPanicked => {
                log::error!("Scan {}: device sink panicked, scan aborted", self.id)
            }
        }

        drop(stream);
        if let Err(e) = self.radio.stop().await {
            log::warn!("Failed to stop advertisement watch: {}", e);
        }

        let mut state = lock(&self.state);
        if state.active.as_ref().is_some_and(|active| active.id == self.id) {
            state.active = None;
        }
    }

    /// Records and reports one advertisement. Returns how the session
    /// ends if the sink panicked.
    fn report(&self, adv: &Advertisement, seen: &mut HashSet<u64>) -> Option<SessionEnd> {
        let device = DiscoveredDevice::from_advertisement(adv);
        if !self.request.filter.matches(device.name.as_deref()) {
            return None;
        }
        if !self.report_duplicates && !seen.insert(adv.address) {
            return None;
        }

        log::debug!(
            "Found {} ({}) rssi {:?}",
            device.address,
            device.name.as_deref().unwrap_or("<unnamed>"),
            device.rssi
        );
        lock(&self.state).discovered.push(device.clone());

        // An unwinding sink would kill the task before the watch is stopped
        // and the active slot freed
        panic::catch_unwind(AssertUnwindSafe(|| (self.sink)(&device)))
            .err()
            .map(|_| SessionEnd::SinkPanicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    struct ScriptedRadio {
        script: Vec<Advertisement>,
        end_stream: bool,
        fail_watch: bool,
        /// Replay the script forever, one advertisement per interval
        interval: Option<Duration>,
        stops: Arc<AtomicUsize>,
    }

    impl ScriptedRadio {
        fn new(script: Vec<Advertisement>) -> Self {
            Self {
                script,
                end_stream: false,
                fail_watch: false,
                interval: None,
                stops: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Radio for ScriptedRadio {
        async fn state(&self) -> BluetoothState {
            BluetoothState::Enabled
        }

        async fn watch(&self) -> Result<AdvertisementStream, ScanError> {
            if self.fail_watch {
                return Err(ScanError::NoAdapters);
            }
            if let Some(interval) = self.interval {
                let script = self.script.clone();
                let ads = stream::unfold(0usize, move |i| {
                    let adv = script[i % script.len()].clone();
                    async move {
                        tokio::time::sleep(interval).await;
                        Some((adv, i + 1))
                    }
                });
                return Ok(ads.boxed());
            }
            let ads = stream::iter(self.script.clone());
            if self.end_stream {
                Ok(ads.boxed())
            } else {
                Ok(ads.chain(stream::pending()).boxed())
            }
        }

        async fn stop(&self) -> Result<(), ScanError> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn adv(address: u64, name: Option<&str>) -> Advertisement {
        Advertisement {
            address,
            local_name: name.map(str::to_string),
            rssi: Some(-50),
        }
    }

    fn script() -> Vec<Advertisement> {
        vec![
            adv(0x1, Some("NIOX PRO 070001")),
            adv(0x2, Some("Polar H10 1234")),
            adv(0x3, None),
            adv(0x1, Some("NIOX PRO 070001")),
        ]
    }

    fn wait_until_idle(scanner: &Scanner) -> bool {
        for _ in 0..300 {
            if !scanner.is_scanning() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn collect(rx: &mpsc::Receiver<DiscoveredDevice>, n: usize) -> Vec<DiscoveredDevice> {
        (0..n)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).expect("device not reported"))
            .collect()
    }

    fn long_niox_request() -> ScanRequest {
        ScanRequest::new(
            Duration::from_secs(30),
            NameFilter::Prefix("NIOX PRO".to_string()),
        )
    }

    #[test]
    fn test_reports_only_matching_devices() {
        let radio = ScriptedRadio::new(script());
        let stops = radio.stops.clone();
        let scanner = Scanner::with_radio(ScannerConfig::default(), radio).unwrap();
        let (tx, rx) = mpsc::channel();

        scanner
            .start_scan(long_niox_request(), move |d| {
                let _ = tx.send(d.clone());
            })
            .unwrap();
        assert!(scanner.is_scanning());

        let devices = collect(&rx, 2);
        assert!(devices.iter().all(|d| d.address == "00:00:00:00:00:01"));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        scanner.stop_scan();
        assert!(wait_until_idle(&scanner));
        assert_eq!(scanner.discovered().len(), 2);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_any_filter_reports_nameless_devices() {
        let scanner = Scanner::with_radio(ScannerConfig::default(), ScriptedRadio::new(script())).unwrap();
        let (tx, rx) = mpsc::channel();

        let request = ScanRequest::new(Duration::from_secs(30), NameFilter::Any);
        scanner
            .start_scan(request, move |d| {
                let _ = tx.send(d.clone());
            })
            .unwrap();

        let devices = collect(&rx, 4);
        assert_eq!(devices[2].name, None);
        assert_eq!(devices[2].address, "00:00:00:00:00:03");
    }

    #[test]
    fn test_duplicates_suppressed_when_configured() {
        let config = ScannerConfig {
            report_duplicates: false,
            ..ScannerConfig::default()
        };
        let scanner = Scanner::with_radio(config, ScriptedRadio::new(script())).unwrap();
        let (tx, rx) = mpsc::channel();

        let request = ScanRequest::new(Duration::from_secs(30), NameFilter::Any);
        scanner
            .start_scan(request, move |d| {
                let _ = tx.send(d.clone());
            })
            .unwrap();

        let devices = collect(&rx, 3);
        assert_eq!(devices[0].address, "00:00:00:00:00:01");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_second_start_is_rejected() {
        let scanner = Scanner::with_radio(ScannerConfig::default(), ScriptedRadio::new(script())).unwrap();

        scanner.start_scan(long_niox_request(), |_| {}).unwrap();
        assert_eq!(
            scanner.start_scan(long_niox_request(), |_| {}),
            Err(ScanError::AlreadyScanning)
        );
    }

    #[test]
    fn test_scan_stops_after_duration_and_can_restart() {
        let radio = ScriptedRadio::new(script());
        let stops = radio.stops.clone();
        let scanner = Scanner::with_radio(ScannerConfig::default(), radio).unwrap();

        let request = ScanRequest::new(Duration::from_millis(50), NameFilter::Any);
        scanner.start_scan(request, |_| {}).unwrap();
        assert!(wait_until_idle(&scanner));
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(scanner.discovered().len(), 4);

        let niox = ScanRequest::new(
            Duration::from_millis(50),
            NameFilter::Prefix("NIOX PRO".to_string()),
        );
        scanner.start_scan(niox, |_| {}).unwrap();
        assert!(wait_until_idle(&scanner));
        assert_eq!(scanner.discovered().len(), 2);
    }

    #[test]
    fn test_failed_watch_leaves_scanner_idle() {
        let mut radio = ScriptedRadio::new(script());
        radio.fail_watch = true;
        let scanner = Scanner::with_radio(ScannerConfig::default(), radio).unwrap();

        assert_eq!(
            scanner.start_scan(long_niox_request(), |_| {}),
            Err(ScanError::NoAdapters)
        );
        assert!(!scanner.is_scanning());
    }

    #[test]
    fn test_stream_end_finishes_scan() {
        let mut radio = ScriptedRadio::new(script());
        radio.end_stream = true;
        let scanner = Scanner::with_radio(ScannerConfig::default(), radio).unwrap();

        scanner.start_scan(long_niox_request(), |_| {}).unwrap();
        assert!(wait_until_idle(&scanner));
        assert_eq!(scanner.discovered().len(), 2);
    }

    #[test]
    fn test_stop_from_sink() {
        let radio = ScriptedRadio::new(script());
        let scanner = Arc::new(Scanner::with_radio(ScannerConfig::default(), radio).unwrap());
        let weak = Arc::downgrade(&scanner);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let request = ScanRequest::new(Duration::from_secs(30), NameFilter::Any);
        scanner
            .start_scan(request, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(scanner) = weak.upgrade() {
                    scanner.stop_scan();
                }
            })
            .unwrap();

        assert!(wait_until_idle(&scanner));
        // stop is observed at the next await point, before the next device
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let scanner = Scanner::with_radio(ScannerConfig::default(), ScriptedRadio::new(script())).unwrap();
        scanner.stop_scan();
        assert!(!scanner.is_scanning());
        assert_eq!(scanner.bluetooth_state(), BluetoothState::Enabled);
    }

    #[test]
    fn test_request_from_millis() {
        let config = ScannerConfig::default();

        let request = ScanRequest::from_millis(0, true, &config).unwrap();
        assert_eq!(request.duration, Duration::from_secs(10));
        assert_eq!(request.filter, NameFilter::Prefix("NIOX PRO".to_string()));

        let request = ScanRequest::from_millis(1500, false, &config).unwrap();
        assert_eq!(request.duration, Duration::from_millis(1500));
        assert_eq!(request.filter, NameFilter::Any);

        assert_eq!(
            ScanRequest::from_millis(-1, false, &config),
            Err(ScanError::InvalidDuration(-1))
        );
    }

    #[test]
    fn test_stop_then_immediate_restart() {
        let radio = ScriptedRadio::new(script());
        let stops = radio.stops.clone();
        let scanner = Scanner::with_radio(ScannerConfig::default(), radio).unwrap();

        scanner.start_scan(long_niox_request(), |_| {}).unwrap();
        scanner.stop_scan();

        assert!(!scanner.is_scanning());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert!(scanner.start_scan(long_niox_request(), |_| {}).is_ok());
    }

    #[test]
    fn test_panicking_sink_ends_scan() {
        let radio = ScriptedRadio::new(script());
        let stops = radio.stops.clone();
        let scanner = Scanner::with_radio(ScannerConfig::default(), radio).unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        scanner
            .start_scan(long_niox_request(), move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                panic!("sink failure");
            })
            .unwrap();

        assert!(wait_until_idle(&scanner));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stops.load(Ordering::SeqCst), 1);
        assert_eq!(scanner.discovered().len(), 1);
        assert!(scanner.start_scan(long_niox_request(), |_| {}).is_ok());
    }

    #[test]
    fn test_device_recorded_before_sink_sees_it() {
        let radio = ScriptedRadio::new(script());
        let scanner = Arc::new(Scanner::with_radio(ScannerConfig::default(), radio).unwrap());
        let weak = Arc::downgrade(&scanner);
        let (tx, rx) = mpsc::channel();

        let request = ScanRequest::new(Duration::from_secs(30), NameFilter::Any);
        scanner
            .start_scan(request, move |device| {
                let recorded = weak
                    .upgrade()
                    .map(|scanner| scanner.discovered().last() == Some(device))
                    .unwrap_or(false);
                let _ = tx.send(recorded);
            })
            .unwrap();

        for _ in 0..4 {
            assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
        }
    }

    #[test]
    fn test_no_reports_after_stop() {
        let mut radio = ScriptedRadio::new(script());
        radio.interval = Some(Duration::from_millis(5));
        let scanner = Scanner::with_radio(ScannerConfig::default(), radio).unwrap();
        let (tx, rx) = mpsc::channel();

        let request = ScanRequest::new(Duration::from_secs(30), NameFilter::Any);
        scanner
            .start_scan(request, move |d| {
                let _ = tx.send(d.clone());
            })
            .unwrap();
        collect(&rx, 3);

        scanner.stop_scan();
        assert!(!scanner.is_scanning());
        while rx.try_recv().is_ok() {}

        // The sink, and with it the sender, is gone once the session ends
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(mpsc::RecvTimeoutError::Disconnected)
        );
    }
}
