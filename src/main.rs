//! sdfwd: the resident DNS forwarder service
//!
//! Composition root: loads the settings document, wires the forwarder,
//! control state machine, adapter controller, health monitor and IPC
//! server, then runs until interrupted.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration path
//! sudo ./sdfwd
//!
//! # Run with a custom configuration document
//! sudo ./sdfwd -c /path/to/config.json
//!
//! # Validate the configuration and exit
//! ./sdfwd --check
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sdfw::adapter::{platform, AdapterController};
use sdfw::control::ControlService;
use sdfw::dns::forwarder::Forwarder;
use sdfw::dns::upstream::UpstreamTransport;
use sdfw::health::{HealthMonitor, HealthMonitorConfig};
use sdfw::ipc::server::default_endpoint;
use sdfw::ipc::{IpcHandler, IpcServer, IpcServerConfig};
use sdfw::settings::SettingsStore;

/// Join window for background tasks on shutdown
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Command-line arguments
struct Args {
    /// Settings document path
    config_path: PathBuf,
    /// IPC endpoint override
    endpoint: Option<PathBuf>,
    /// Validate the configuration and exit
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = default_config_path();
        let mut endpoint = None;
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "-e" | "--endpoint" => {
                    if let Some(path) = args.next() {
                        endpoint = Some(PathBuf::from(path));
                    }
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("sdfwd v{}", sdfw::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            endpoint,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r"sdfwd v{}

Host-local DNS forwarder with classical and DNS-over-HTTPS upstreams.

USAGE:
    sdfwd [OPTIONS]

OPTIONS:
    -c, --config <PATH>      Settings document path
    -e, --endpoint <PATH>    IPC endpoint (socket path or pipe name)
        --check              Validate the configuration and exit
    -v, --version            Print version
    -h, --help               Print help",
        sdfw::VERSION
    );
}

/// Platform's shared application-data location for the settings document
fn default_config_path() -> PathBuf {
    #[cfg(windows)]
    {
        let base = std::env::var("ProgramData").unwrap_or_else(|_| r"C:\ProgramData".into());
        PathBuf::from(base).join("Sdfw").join("config.json")
    }
    #[cfg(not(windows))]
    {
        PathBuf::from("/var/lib/sdfw/config.json")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // One process-wide TLS provider for the DoH path
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("TLS crypto provider was already installed");
    }

    let args = Args::parse();
    info!(version = sdfw::VERSION, config = %args.config_path.display(), "sdfwd starting");

    let settings = Arc::new(SettingsStore::load_or_default(&args.config_path));
    if args.check_config {
        let snapshot = settings.snapshot().await;
        for provider in &snapshot.providers {
            provider.validate()?;
        }
        println!(
            "Configuration OK: {} providers, enabled={}",
            snapshot.providers.len(),
            snapshot.enabled
        );
        return Ok(());
    }

    let transport = Arc::new(UpstreamTransport::new());
    let forwarder = Arc::new(Forwarder::new(Arc::clone(&transport)));
    let adapters = Arc::new(AdapterController::new(
        platform::native_ops(),
        Arc::clone(&settings),
    ));
    let control = Arc::new(ControlService::new(
        Arc::clone(&settings),
        Arc::clone(&forwarder),
        Arc::clone(&adapters),
        Arc::clone(&transport),
    ));

    let handler = Arc::new(IpcHandler::new(
        Arc::clone(&settings),
        Arc::clone(&control),
        Arc::clone(&adapters),
    ));
    let ipc_config = IpcServerConfig {
        endpoint: args.endpoint.unwrap_or_else(default_endpoint),
    };
    let ipc = Arc::new(IpcServer::new(ipc_config, handler));
    ipc.bridge_events(&control, &settings);

    let ipc_shutdown = ipc.shutdown_sender();
    let ipc_task = {
        let ipc = Arc::clone(&ipc);
        tokio::spawn(async move {
            if let Err(e) = ipc.run().await {
                error!(error = %e, "IPC server failed");
            }
        })
    };

    let monitor = HealthMonitor::new(Arc::clone(&control), HealthMonitorConfig::default());
    let monitor_task = monitor.spawn(ipc_shutdown.subscribe());

    // Last user intent: re-apply the default profile with the host
    let boot_settings = settings.snapshot().await;
    if boot_settings.enabled && boot_settings.apply_on_boot {
        if let Some(profile) = boot_settings.default_profile.clone() {
            info!(provider = %profile.provider_id, "re-applying default profile on boot");
            if let Err(e) = control.apply_profile(profile, true).await {
                error!(error = %e, "boot-time apply failed");
            }
        }
    }

    signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    // Stop forwarding; adapter backups stay persisted so DNS can be
    // restored through Disable or on the next run.
    control.stop().await;
    let _ = ipc_shutdown.send(());

    for (name, task) in [("ipc", ipc_task), ("health", monitor_task)] {
        if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, task).await.is_err() {
            warn!(task = name, "task did not stop within the join window");
        }
    }

    info!("sdfwd stopped");
    Ok(())
}
