//! Energy meter bridge (`metersrv`)
//!
//! Polls a Modbus energy meter through an MQTT-tunneled RTU gateway and
//! publishes its registers as Home Assistant sensors.

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use common::CancellationToken;
use metersrv::config::MeterConfig;

/// Command-line arguments for metersrv
#[derive(Parser, Clone, Debug)]
#[command(
    name = "metersrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Energy meter Modbus to Home Assistant bridge",
    long_about = None
)]
struct Args {
    /// Configuration file (YAML)
    #[arg(short = 'c', long, env = "METERSRV_CONFIG", default_value = "config/metersrv.yaml")]
    config: String,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = MeterConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;

    let mut log_config = config.logging.clone();
    if let Some(level) = &args.log_level {
        log_config.level = level.clone();
    }
    common::logging::init_with_config(&log_config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
    info!("Loaded configuration from {}", args.config);

    if args.validate {
        info!(
            "Configuration valid: {} registers, {} groups",
            config.registers.len(),
            config.groups.len()
        );
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let signal_task = common::shutdown::cancel_on_shutdown(cancel.clone());
    // An explicit --log-level stays in force
    #[cfg(unix)]
    let _reload_task = args
        .log_level
        .is_none()
        .then(|| tokio::spawn(reload_log_level_on_hangup(args.config.clone(), cancel.clone())));

    let result = metersrv::service::run(config, cancel.clone()).await;

    cancel.cancel();
    if let Err(e) = signal_task.await {
        warn!("Signal task failed: {}", e);
    }
    result
}

/// Re-read the logging section on SIGHUP and swap the active filter
#[cfg(unix)]
async fn reload_log_level_on_hangup(config_path: String, cancel: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(sig) => sig,
        Err(e) => {
            warn!("Failed to install SIGHUP handler: {}", e);
            return;
        },
    };

    loop {
        tokio::select! {
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
            },
            _ = cancel.cancelled() => return,
        }

        let config = match MeterConfig::load(&config_path) {
            Ok(config) => config,
            Err(e) => {
                warn!("SIGHUP: keeping current log level, {}", e);
                continue;
            },
        };
        let rust_log = std::env::var("RUST_LOG").ok();
        let directive = common::logging::filter_directive(&config.logging, rust_log.as_deref());
        if let Err(e) = common::logging::set_log_level(&directive) {
            warn!("SIGHUP: {}", e);
        }
    }
}
