use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use yozakura_runtime::config::{self, RuntimeConfig};

/// Vehicle-side runtime for the Yozakura rescue robot
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Operator station address for commands
    #[arg(long, default_value = config::OPSTN_ADDR)]
    operator: SocketAddr,

    /// UDP port on the operator station that receives telemetry
    #[arg(long, default_value_t = config::TELEMETRY_PORT)]
    telemetry_port: u16,

    /// Serial device to try during the handshake (repeatable; default scans)
    #[arg(long = "serial")]
    serial: Vec<String>,

    /// Dynamixel bus for the arm servos
    #[arg(long)]
    servo_port: Option<String>,

    /// Control loop frequency
    #[arg(long, default_value_t = config::LOOP_HZ)]
    loop_hz: u64,

    /// Per-device handshake timeout, clamped to 200-1000 ms
    #[arg(long, default_value_t = config::HANDSHAKE_TIMEOUT.as_millis() as u64)]
    handshake_timeout_ms: u64,

    /// Log filter, e.g. "debug" or "yozakura_runtime::dynamixel=trace" (overrides RUST_LOG)
    #[arg(long)]
    log: Option<String>,
}

impl Cli {
    fn into_config(self) -> RuntimeConfig {
        let mut config = RuntimeConfig::new(self.operator);
        config.telemetry_port = self.telemetry_port;
        config.serial_candidates = self.serial;
        config.servo_port = self.servo_port;
        config.handshake_timeout = Duration::from_millis(self.handshake_timeout_ms);
        config.loop_config.period = Duration::from_millis(1000 / self.loop_hz.max(1));
        config
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging (set RUST_LOG=info or debug, or pass --log)
    let filter = match &cli.log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::from_default_env().add_directive("info".parse().unwrap()),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init(); // installs the subscriber globally

    let config = cli.into_config();

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping");
            flag.store(true, Ordering::Relaxed);
        }
    });

    // The control loop owns the serial ports and blocks; keep it off the async workers
    let result = tokio::task::spawn_blocking(move || yozakura_runtime::runtime::run(config, shutdown))
        .await;

    match result {
        Ok(Ok(())) => info!("Runtime stopped"),
        Ok(Err(e)) => {
            eprintln!("Runtime error: {}", e);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Runtime error: {}", e);
            std::process::exit(1);
        }
    }
}
