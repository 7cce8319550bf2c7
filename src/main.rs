use clap::Parser;
use log::{error, info, warn};
use parapet::config::{self, AppConfig, RuntimeConfig};
use parapet::server;
use parapet::telemetry;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::signal;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[clap(short, long, value_name = "PATH")]
    conf: Option<PathBuf>,

    /// Default host for sites that do not name one
    #[clap(long, default_value = "")]
    host: String,

    /// Default port for sites that do not name one
    #[clap(long, default_value = config::DEFAULT_PORT)]
    port: String,

    /// Default site root
    #[clap(long, default_value = ".")]
    root: PathBuf,

    /// Seconds to wait for in-flight requests at shutdown
    #[clap(long, default_value_t = 5)]
    grace: u64,

    /// Enable verbose logging
    #[clap(short, long)]
    verbose: bool,

    /// Enable telemetry metrics
    #[clap(long)]
    telemetry: bool,

    /// Address of the plain-text metrics exporter
    #[clap(long, default_value = "0.0.0.0:9898")]
    metrics_addr: String,

    /// Parse and build the configuration, then exit
    #[clap(long)]
    validate: bool,

    /// List the known browser fingerprint checks and exit
    #[clap(long)]
    list_fingerprints: bool,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    if cli.list_fingerprints {
        println!("Known browser fingerprints:");
        for fp in parapet::mitm::known_fingerprints() {
            println!("- {}", fp);
        }
        return Ok(());
    }

    if cli.telemetry {
        telemetry::TELEMETRY_ENABLED.store(true, Ordering::Relaxed);
        telemetry::serve(&cli.metrics_addr);
    }

    let app = match &cli.conf {
        Some(path) => match AppConfig::from_file(path) {
            Ok(app) => app,
            Err(e) => {
                error!("Failed to load config {}: {}", path.display(), e);
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "invalid configuration",
                ));
            }
        },
        None => {
            // No config serves the working directory on the default port.
            let mut app = AppConfig::default();
            app.sites.push(Default::default());
            app
        }
    };
    if let Err(e) = app.validate() {
        error!("Config validation failed: {}", e);
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "invalid configuration",
        ));
    }

    let grace = app.grace().unwrap_or(Duration::from_secs(cli.grace));
    let metrics_addr = app.server.metrics.clone();
    if let Some(addr) = metrics_addr {
        if !cli.telemetry {
            telemetry::TELEMETRY_ENABLED.store(true, Ordering::Relaxed);
            telemetry::serve(&addr);
        }
    }

    let runtime = RuntimeConfig {
        default_host: cli.host.clone(),
        default_port: cli.port.clone(),
        default_root: cli.root.clone(),
        grace,
        ..RuntimeConfig::default()
    };

    let sites = match config::build_sites(app, &runtime) {
        Ok(sites) => sites,
        Err(e) => {
            error!("Cannot build sites: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "invalid configuration",
            ));
        }
    };
    let servers = match server::build_servers(sites, &runtime) {
        Ok(servers) => servers,
        Err(e) => {
            error!("Cannot build servers: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "invalid configuration",
            ));
        }
    };

    if cli.validate {
        println!("Configuration OK: {} listener(s)", servers.len());
        return Ok(());
    }
    if servers.is_empty() {
        warn!("No sites configured; nothing to serve");
        return Ok(());
    }

    let mut tasks = Vec::new();
    for srv in &servers {
        let srv = srv.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = srv.clone().serve().await {
                error!("Listener {} failed: {}", srv.addr, e);
            }
        }));
    }

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    for srv in &servers {
        srv.stop(runtime.grace).await;
    }
    for task in tasks {
        let _ = task.await;
    }

    if telemetry::TELEMETRY_ENABLED.load(Ordering::Relaxed) {
        telemetry::flush();
    }
    Ok(())
}
