//! lanlink CLI - run a switch or a point of the overlay network

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lanlink_auth::hash_password;
use lanlink_point::{Point, PointConfig, PointListener};
use lanlink_proto::RouteEntry;
use lanlink_switch::{Switch, SwitchConfig};
use lanlink_transport::{DeviceMode, VirtualDeviceFactory, VirtualDeviceHandle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// lanlink - layer-2 overlay network over TCP or UDP
#[derive(Parser, Debug)]
#[command(name = "lanlink")]
#[command(about = "lanlink - layer-2 overlay network over TCP or UDP")]
#[command(version, long_version = env!("LANLINK_LONG_VERSION"))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept points, authenticate them and lease their addresses
    #[command(long_about = r#"
Run a switch. Points log in with `name@network` credentials taken from the
configuration's `users` sections or from `users_file`.

EXAMPLES:
  lanlink switch --config switch.yaml
  lanlink switch --config switch.yaml --listen 0.0.0.0:10002
    "#)]
    Switch {
        /// Switch configuration (YAML or JSON)
        #[arg(short, long, env = "LANLINK_SWITCH_CONFIG")]
        config: PathBuf,

        /// Override the listen address
        #[arg(long)]
        listen: Option<String>,

        /// Seconds between statistics lines, 0 to disable
        #[arg(long, default_value = "60")]
        stats_interval: u64,
    },

    /// Join a switch and bridge the local device onto the overlay
    #[command(long_about = r#"
Run a point. Reconnects with a growing backoff when the switch goes away.

EXAMPLES:
  lanlink point --config point.yaml
  lanlink point --connection switch.example.com:10002 \
    --username hi@default --password $LANLINK_PASSWORD

ENVIRONMENT VARIABLES:
  LANLINK_CONNECTION  Switch address
  LANLINK_USERNAME    Credential, name@network
  LANLINK_PASSWORD    Password
    "#)]
    Point {
        /// Point configuration (YAML or JSON)
        #[arg(short, long, env = "LANLINK_POINT_CONFIG")]
        config: Option<PathBuf>,

        /// Switch address (e.g., switch.example.com:10002)
        #[arg(long, env = "LANLINK_CONNECTION")]
        connection: Option<String>,

        /// Credential, `name@network`
        #[arg(long, env = "LANLINK_USERNAME")]
        username: Option<String>,

        #[arg(long, env = "LANLINK_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Print an Argon2 hash for the credentials file
    Passwd {
        password: String,
    },
}

/// Setup logging; `RUST_LOG` wins over `--verbose`
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Host ends of the virtual devices; the OS device layer is not part of
/// this binary, so frames written to a device are only traced
fn drain_devices(mut handles: mpsc::UnboundedReceiver<VirtualDeviceHandle>) {
    tokio::spawn(async move {
        while let Some(mut handle) = handles.recv().await {
            info!(device = %handle.name(), "Device opened");
            tokio::spawn(async move {
                while let Some(frame) = handle.recv().await {
                    debug!(device = %handle.name(), len = frame.len(), "Frame to host");
                }
            });
        }
    });
}

/// Logs what the host would have to reprogram
struct LogListener;

impl PointListener for LogListener {
    fn add_addr(&self, cidr: &str) {
        info!(address = %cidr, "Address assigned");
    }

    fn del_addr(&self, cidr: &str) {
        info!(address = %cidr, "Address withdrawn");
    }

    fn add_routes(&self, routes: &[RouteEntry]) {
        for route in routes {
            info!(prefix = %route.prefix, nexthop = %route.nexthop, "Route added");
        }
    }

    fn del_routes(&self, routes: &[RouteEntry]) {
        for route in routes {
            info!(prefix = %route.prefix, nexthop = %route.nexthop, "Route removed");
        }
    }
}

async fn run_switch(config: PathBuf, listen: Option<String>, stats_interval: u64) -> Result<()> {
    let mut config = SwitchConfig::load(&config)
        .with_context(|| format!("Failed to load switch config {}", config.display()))?;
    if let Some(listen) = listen {
        config.listen = listen;
    }

    let credentials = config
        .credentials()
        .await
        .context("Failed to load credentials")?;
    let acceptor = config
        .bind()
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    info!(listen = %config.listen, protocol = ?config.protocol, "Listening");

    let (devices, handles) = VirtualDeviceFactory::new("lan", 1518, DeviceMode::Tap);
    drain_devices(handles);
    let switch = Switch::new(config, Arc::new(credentials), Arc::new(devices));

    if stats_interval > 0 {
        let switch = switch.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match serde_json::to_string(&switch.stats().await) {
                    Ok(stats) => info!(stats = %stats, "Switch statistics"),
                    Err(e) => warn!("Failed to encode statistics: {}", e),
                }
            }
        });
    }

    let server = tokio::spawn(switch.clone().run(acceptor));
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            switch.shutdown();
        }
        result = server => {
            match result {
                Ok(Ok(())) => info!("Switch stopped"),
                Ok(Err(e)) => {
                    error!("Switch error: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Switch task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }
    Ok(())
}

async fn run_point(
    config: Option<PathBuf>,
    connection: Option<String>,
    username: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let mut config = match &config {
        Some(path) => PointConfig::read(path)
            .with_context(|| format!("Failed to load point config {}", path.display()))?,
        None => PointConfig::default(),
    };
    if let Some(connection) = connection {
        config.connection = connection;
    }
    if let Some(username) = username {
        config.username = username;
    }
    if let Some(password) = password {
        config.password = password;
    }
    config.normalize();
    config.validate().context("Invalid point configuration")?;

    info!(switch = %config.connection, user = %config.id(), alias = %config.alias, "lanlink point starting...");
    let (devices, handles) = VirtualDeviceFactory::new(
        config.interface.name.clone(),
        config.interface.mtu,
        config.interface.mode,
    );
    drain_devices(handles);

    let connector = config.connector();
    let point = Point::start(config, connector, Arc::new(devices), Arc::new(LogListener));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, leaving...");
    point.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Switch {
            config,
            listen,
            stats_interval,
        } => run_switch(config, listen, stats_interval).await,
        Commands::Point {
            config,
            connection,
            username,
            password,
        } => run_point(config, connection, username, password).await,
        Commands::Passwd { password } => {
            let hash = hash_password(&password).context("Failed to hash password")?;
            println!("{}", hash);
            Ok(())
        }
    }
}
