use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use waterrower_daemon::ble::CentralAdapter;
use waterrower_daemon::bluez::{BluezCentral, BluezPeripheral};
use waterrower_daemon::config;
use waterrower_daemon::driver::{DriverConfig, DriverEvent, S4Driver};
use waterrower_daemon::fit;
use waterrower_daemon::ftms::FtmsPeripheral;
use waterrower_daemon::hrm::{HrmClient, HrmEvent};
use waterrower_daemon::session::{Session, SessionState};
use waterrower_daemon::Result;

const DEFAULT_CONFIG: &str = "waterrower_config.json";

struct Args {
    config_path: String,
    data_dir: Option<String>,
    record: Option<String>,
    replay: Option<String>,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = parse_args();
    let cfg = config::load(&args.config_path).unwrap_or_default();
    let data_dir = PathBuf::from(args.data_dir.as_ref().unwrap_or(&cfg.data_dir));

    log::info!(
        "WaterRower daemon starting, config: {}, data dir: {}",
        args.config_path,
        data_dir.display()
    );

    let driver = S4Driver::new(DriverConfig {
        serial_port: cfg.serial_port.clone(),
        refresh_interval: Duration::from_millis(cfg.refresh_interval_ms),
        poll_registers: cfg.poll_registers.clone(),
        data_dir: data_dir.clone(),
    });

    let central = match BluezCentral::new().await {
        Ok(c) => Arc::new(c) as Arc<dyn CentralAdapter>,
        Err(e) => {
            log::error!("Bluetooth central unavailable: {}", e);
            return;
        }
    };
    let hrm = HrmClient::new(central);

    let peripheral = match BluezPeripheral::new().await {
        Ok(p) => Arc::new(p),
        Err(e) => {
            log::error!("Bluetooth peripheral unavailable: {}", e);
            return;
        }
    };
    let ftms = FtmsPeripheral::new(peripheral, cfg.ble_name.clone());

    let session = Session::new(driver.clone(), hrm.clone());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received shutdown signal");
        }
        result = run_serial(&driver, &session, &args) => {
            if let Err(e) = result {
                log::error!("Serial task exited with error: {}", e);
            }
        }
        result = ftms.run(driver.subscribe_datapoints()) => {
            if let Err(e) = result {
                log::error!("FTMS task exited with error: {}", e);
            }
        }
        result = run_hrm(&hrm, cfg.hrm_address.clone()) => {
            if let Err(e) = result {
                log::error!("HRM task exited with error: {}", e);
            }
        }
    }

    shutdown(&session, &ftms, &hrm, &driver, &data_dir).await;
    log::info!("WaterRower daemon shut down");
}

/// Drive the serial side: replay a recording, or connect to the monitor,
/// optionally record, and run a session once the monitor is initialised.
async fn run_serial(driver: &S4Driver, session: &Session, args: &Args) -> Result<()> {
    if let Some(name) = &args.replay {
        // Replay feeds the live streams (and thus the FTMS peripheral)
        // without a monitor attached; no session is run.
        log::info!("replaying recording {:?}", name);
        driver.play_recording(Some(name)).await?;
        log::info!("replay finished");
        return Ok(());
    }

    driver.connect().await?;
    if let Some(name) = &args.record {
        driver.start_recording(Some(name)).await?;
    }

    let mut events = driver.subscribe_events();
    loop {
        match events.recv().await {
            Ok(DriverEvent::Initialised) => {
                if session.state() == SessionState::Idle {
                    session.start().await?;
                }
            }
            Ok(DriverEvent::Error(e)) => {
                log::warn!("driver error: {}", e);
            }
            Ok(DriverEvent::Closed) => {
                log::info!("driver closed");
                return Ok(());
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

/// Keep the configured heart rate monitor connected, re-entering the
/// reconnect cycle whenever the transport drops.
async fn run_hrm(hrm: &HrmClient, address: Option<String>) -> Result<()> {
    let Some(address) = address else {
        // No monitor configured; nothing to drive.
        futures::future::pending::<()>().await;
        unreachable!()
    };

    loop {
        hrm.reconnect(&address).await?;
        let mut events = hrm.subscribe_events();
        loop {
            match events.recv().await {
                Ok(HrmEvent::Disconnected) => break,
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
        log::info!("heart rate monitor disconnected, reconnecting");
    }
}

/// Orderly teardown: session first, then the BLE surfaces, then the
/// driver. A finished session is exported as a FIT activity file.
async fn shutdown(
    session: &Session,
    ftms: &FtmsPeripheral,
    hrm: &HrmClient,
    driver: &S4Driver,
    data_dir: &PathBuf,
) {
    if matches!(
        session.state(),
        SessionState::Active | SessionState::Paused
    ) {
        match session.stop().await {
            Ok(samples) => {
                let summary = session.summary();
                if let Some(start) = session.start_time() {
                    let bytes = fit::encode_activity(&summary, &samples, start);
                    let path = data_dir
                        .join(format!("activity_{}.fit", start.format("%Y%m%d_%H%M%S")));
                    let write = async {
                        tokio::fs::create_dir_all(data_dir).await?;
                        tokio::fs::write(&path, &bytes).await
                    };
                    match write.await {
                        Ok(()) => log::info!("activity written to {}", path.display()),
                        Err(e) => log::warn!("failed to write activity file: {}", e),
                    }
                }
            }
            Err(e) => log::warn!("failed to stop session: {}", e),
        }
    }

    if let Err(e) = ftms.stop_advertising().await {
        log::warn!("failed to stop advertising: {}", e);
    }
    hrm.disconnect().await;
    driver.close().await;
}

fn parse_args() -> Args {
    let argv: Vec<String> = std::env::args().collect();
    let mut args = Args {
        config_path: DEFAULT_CONFIG.to_string(),
        data_dir: None,
        record: None,
        replay: None,
    };
    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--config" => {
                if let Some(path) = argv.get(i + 1) {
                    args.config_path = path.clone();
                    i += 1;
                }
            }
            "--data-dir" => {
                if let Some(dir) = argv.get(i + 1) {
                    args.data_dir = Some(dir.clone());
                    i += 1;
                }
            }
            "--record" => {
                if let Some(name) = argv.get(i + 1) {
                    args.record = Some(name.clone());
                    i += 1;
                }
            }
            "--replay" => {
                if let Some(name) = argv.get(i + 1) {
                    args.replay = Some(name.clone());
                    i += 1;
                }
            }
            other => {
                log::warn!("ignoring unknown argument {:?}", other);
            }
        }
        i += 1;
    }
    args
}
