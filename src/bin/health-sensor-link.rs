use std::path::PathBuf;
use std::time::Duration;
use clap::Parser;
use log::{error, info};
use health_sensor_link::{init_logging, run, RunOptions};
use health_sensor_link::error::{AppRunError, ConfigError};

#[derive(Parser, Debug)]
#[command(name = "health-sensor-link")]
#[command(about = "Connects to Bluetooth LE health sensors and logs their measurements")]
#[command(version)]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds to scan for devices after startup, 0 to skip scanning
    #[arg(short, long, default_value = "30")]
    scan_seconds: u64,

    /// Connect to the first discovered device whose name contains this text
    #[arg(long)]
    connect: Option<String>,
}

fn main() -> Result<(), AppRunError> {
    init_logging();
    info!(concat!("Health Sensor Link ", env!("CARGO_PKG_VERSION")));

    let args = Args::parse();
    let options = RunOptions {
        config: args.config,
        scan_duration: Duration::from_secs(args.scan_seconds),
        auto_connect: args.connect,
    };

    match run(options) {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("Another instance already owns the bluetooth session");
            Ok(())
        },
        Err(err) => {
            error!("Unexpected error: {}", err);
            Err(err)
        },
        Ok(_) => Ok(())
    }
}
