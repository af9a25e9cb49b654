use std::path::PathBuf;
use std::time::Duration;
use futures::channel::mpsc::channel;
use log::{debug, error, info};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::io::ConfigIO;
use crate::config::types::Config;
use crate::device::btle::BtlePlatform;
use crate::device::engine::Engine;
use crate::device::platform::PlatformEvent;
use crate::device::router::Router;
use crate::device::session::{spawn_session, SessionHandle};
use crate::device::types::{Device, Snapshot};
use crate::error::AppRunError;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Config file to use instead of the default location.
    pub config: Option<PathBuf>,
    /// Scan for this long after startup. Zero disables scanning.
    pub scan_duration: Duration,
    /// Connect to the first discovered device whose name contains this text.
    pub auto_connect: Option<String>,
}

async fn load_config(config_io: &ConfigIO) -> Config {
    match config_io.read().await {
        Ok(config) => config,
        Err(err) => {
            if err.is_file_not_found_error() {
                info!("Config file not found, using defaults");
            } else {
                error!("Failed to load config, using defaults: {:?}", &err);
            }
            Config::default()
        },
    }
}

fn describe(device: &Device) -> String {
    let mut line = format!("{} \"{}\" {:?} rssi={}", device.id, device.name, device.state, device.signal_strength);
    let measurements = &device.measurements;

    if let Some(level) = measurements.battery_level {
        line += &format!(" battery={}%", level);
    }
    if let Some(heart_rate) = &measurements.heart_rate {
        line += &format!(" bpm={}", heart_rate.bpm);
    }
    if let Some(pressure) = &measurements.blood_pressure {
        line += &format!(" bp={}/{} {:?}", pressure.systolic, pressure.diastolic, pressure.unit);
        if let Some(pulse) = pressure.pulse {
            line += &format!(" pulse={}", pulse);
        }
    }
    if let Some(weight) = &measurements.weight {
        line += &format!(" weight={} {:?}", weight.weight, weight.unit);
    }
    if let Some(frame) = &measurements.qdg {
        line += &format!(" qdg(msg={} seq={} body={}B)", frame.header.message_id, frame.header.sequence, frame.body.len());
    }
    line
}

fn log_snapshot(snapshot: &Snapshot, previous: &Snapshot) {
    debug!("Snapshot {}: {:?}", snapshot.version, snapshot);

    if snapshot.adapter != previous.adapter {
        info!("Adapter is {:?}", snapshot.adapter);
    }
    if snapshot.scanning != previous.scanning {
        info!("Scanning {}", if snapshot.scanning { "started" } else { "stopped" });
    }
    for device in &snapshot.discovered {
        if !previous.discovered.contains(device) {
            info!("Discovered {}", describe(device));
        }
    }
    for device in &snapshot.connected {
        if !previous.connected.contains(device) {
            info!("Connected {}", describe(device));
        }
    }
    for diagnostic in snapshot.diagnostics.iter().skip(previous.diagnostics.len()) {
        info!("Diagnostic: {:?}", diagnostic);
    }
}

async fn watch_snapshots(cancel: CancellationToken, mut snapshots: watch::Receiver<Snapshot>, mut auto_connect: Option<String>, mut session: SessionHandle) {
    let mut previous = Snapshot::default();

    'mainloop: loop {
        let snapshot = snapshots.borrow_and_update().clone();
        log_snapshot(&snapshot, &previous);

        let target = auto_connect.as_ref().and_then(|pattern| {
            snapshot.discovered.iter()
                .find(|device| device.name.contains(pattern.as_str()) && device.state.can_connect())
                .map(|device| device.id.clone())
        });

        if let Some(id) = target {
            info!("Auto connecting to {}", id);
            match session.request_connect(id).await {
                Ok(()) => auto_connect = None,
                Err(err) => {
                    error!("Failed to request connect: {}", err);
                    break 'mainloop;
                },
            }
        }
        previous = snapshot;

        tokio::select! {
            _ = cancel.cancelled() => {
                break 'mainloop;
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break 'mainloop;
                }
            },
        }
    }
}

async fn run_session(options: RunOptions, config_io: ConfigIO) -> Result<(), AppRunError> {
    let config = load_config(&config_io).await;

    // this token is cancelled upon exit
    let app_cancel = CancellationToken::new();
    let (event_sender, event_receiver) = channel::<PlatformEvent>(128);

    let platform = BtlePlatform::new(app_cancel.child_token(), event_sender).await?;
    let router = Router::with_custom_routes(&config.custom_routes);
    let engine = Engine::new(platform, router, &config);
    let (mut session, session_task) = spawn_session(app_cancel.clone(), engine, event_receiver, config.expiry_poll());

    let watcher = tokio::spawn(watch_snapshots(
        app_cancel.clone(),
        session.snapshots(),
        options.auto_connect.clone(),
        session.clone(),
    ));

    // pick up devices that were connected before we started
    session.request_reconcile().await?;

    if !options.scan_duration.is_zero() {
        session.request_scan(true).await?;
        tokio::select! {
            _ = tokio::time::sleep(options.scan_duration) => {
                session.request_scan(false).await?;
                info!("Waiting for Ctrl-C");
                tokio::signal::ctrl_c().await?;
            },
            signal = tokio::signal::ctrl_c() => signal?,
        }
    } else {
        info!("Waiting for Ctrl-C");
        tokio::signal::ctrl_c().await?;
    }

    info!("Shutting down");
    app_cancel.cancel();
    if let Err(err) = session_task.await {
        error!("Session task failed: {}", err);
    }
    if let Err(err) = watcher.await {
        error!("Snapshot watcher failed: {}", err);
    }
    Ok(())
}

/// Owns the config lock and the tokio runtime for the lifetime of the bluetooth session.
pub fn run_application(options: RunOptions) -> Result<(), AppRunError> {
    let config_io = ConfigIO::new_sync(options.config.as_deref())?;
    let mut config_io_locker = config_io.locker()?;
    let _config_io_lock = config_io_locker.lock()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(run_session(options, config_io))
}
