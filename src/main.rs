use clap::Parser;
use niox_ble::{BluetoothState, DiscoveredDevice, NameFilter, ScanRequest, Scanner, ScannerConfig};
use std::process::ExitCode;
use std::sync::mpsc;
use std::time::Duration;

/// Scan for nearby NIOX devices over Bluetooth Low Energy.
#[derive(Parser, Debug)]
#[command(name = "niox-scan", version)]
struct Args {
    /// Report every advertisement, not only NIOX devices
    #[arg(long)]
    all: bool,

    /// Name prefix to filter on (defaults to the configured prefix)
    #[arg(long, conflicts_with = "all")]
    prefix: Option<String>,

    /// Scan length in milliseconds (defaults to the configured duration)
    #[arg(long)]
    duration_ms: Option<u64>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = ScannerConfig::load().unwrap_or_else(|e| {
        log::warn!("Using default config: {}", e);
        ScannerConfig::default()
    });

    let filter = match (args.all, args.prefix) {
        (true, _) => NameFilter::Any,
        (false, Some(prefix)) => NameFilter::Prefix(prefix),
        (false, None) => NameFilter::Prefix(config.name_prefix.clone()),
    };
    let duration = args
        .duration_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| config.default_duration());

    let scanner = match Scanner::new(config) {
        Ok(scanner) => scanner,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match scanner.bluetooth_state() {
        BluetoothState::Enabled => {}
        state => {
            log::error!("Bluetooth is not available: {:?}", state);
            return ExitCode::FAILURE;
        }
    }

    // Devices arrive on a runtime worker thread; print them from here
    let (sender, receiver) = mpsc::channel::<DiscoveredDevice>();
    if let Err(e) = scanner.start_scan(ScanRequest::new(duration, filter), move |device| {
        let _ = sender.send(device.clone());
    }) {
        log::error!("{}", e);
        return ExitCode::FAILURE;
    }

    // The sender is dropped with the sink when the scan ends
    for device in receiver {
        println!("{}", describe(&device));
    }

    let discovered = scanner.discovered();
    println!("Scan finished: {} advertisement(s) reported", discovered.len());
    ExitCode::SUCCESS
}

fn describe(device: &DiscoveredDevice) -> String {
    let rssi = device
        .rssi
        .map(|rssi| format!("{} dBm", rssi))
        .unwrap_or_else(|| "n/a".to_string());
    format!(
        "{}  {}  {:<24}  {}",
        device.discovered_at.format("%H:%M:%S%.3f"),
        device.address,
        device.name.as_deref().unwrap_or("<unnamed>"),
        rssi
    )
}
