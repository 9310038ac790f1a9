//! # Device Agent CLI
//!
//! Command-line tool for device operations:
//! - Register the device with the platform
//! - Log in and show the stored identity
//! - Post one property or event
//! - Run the agent: bring the session up and print incoming commands
//!
//! ## Usage
//!
//! ```bash
//! # Register and log in
//! device-agent --config agent.toml login
//!
//! # Report property 1 with two values
//! device-agent post-property --id 1 21.5 true
//!
//! # Stay connected until Ctrl-C, with a heartbeat every 60 s
//! device-agent run --command 7 --heartbeat-secs 60
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use device_agent::{CommandTable, Device};
use shared::{
    config::AgentConfig,
    constants::{ENV_DATA_PATH, ENV_DEVICE_NAME, ENV_PLATFORM_URL, ENV_PRODUCT_KEY},
    types::{Property, Value},
};

#[derive(Parser)]
#[command(name = "device-agent")]
#[command(about = "IoT device agent: provisioning, session and telemetry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Product key
    #[arg(long, env = ENV_PRODUCT_KEY)]
    product_key: Option<String>,

    /// Device name
    #[arg(long, env = ENV_DEVICE_NAME)]
    name: Option<String>,

    /// Platform base URL
    #[arg(long, env = ENV_PLATFORM_URL)]
    platform_url: Option<String>,

    /// Directory holding the identity document
    #[arg(long, env = ENV_DATA_PATH)]
    data_path: Option<PathBuf>,

    /// Retry registration, login and session setup until they succeed
    #[arg(long)]
    auto_retry: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Register this device with the platform
    Register,

    /// Register if needed, then log in
    Login,

    /// Show the stored device identity
    Show,

    /// Post a single property report
    PostProperty {
        /// Property id
        #[arg(long)]
        id: u16,

        /// Sub-device id
        #[arg(long, default_value = "")]
        sub_device: String,

        /// Values (true/false, integers, floats, anything else is a string)
        values: Vec<String>,
    },

    /// Post a single event report
    PostEvent {
        /// Event identifier
        #[arg(long)]
        identifier: String,

        /// Property id
        #[arg(long)]
        id: u16,

        /// Values
        values: Vec<String>,
    },

    /// Bring the session up and log incoming commands until Ctrl-C
    Run {
        /// Command ids to handle
        #[arg(long = "command")]
        commands: Vec<u16>,

        /// Post a heartbeat property every N seconds
        #[arg(long)]
        heartbeat_secs: Option<u64>,

        /// Property id of the heartbeat
        #[arg(long, default_value = "0")]
        heartbeat_property: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to install logger")?;

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    let device = Device::from_config(&config)
        .await
        .context("failed to build device")?;
    device
        .load_device_info()
        .await
        .context("failed to load stored identity")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            ctrl_c.cancel();
        }
    });

    match cli.command {
        Commands::Register => register(&device, &cancel).await?,
        Commands::Login => login(&device, &cancel).await?,
        Commands::Show => show(&device).await,
        Commands::PostProperty { id, sub_device, values } => {
            let property = Property::new(id, parse_values(&values)).for_sub_device(sub_device);
            device.auto_post_property(&property, &cancel).await?;
            println!("✓ Property {} posted", id);
        }
        Commands::PostEvent { identifier, id, values } => {
            device.auto_init(&cancel).await?;
            let property = Property::new(id, parse_values(&values));
            device.post_event(&identifier, &property).await?;
            println!("✓ Event '{}' posted", identifier);
        }
        Commands::Run {
            commands,
            heartbeat_secs,
            heartbeat_property,
        } => {
            let heartbeat = heartbeat_secs.map(|secs| (Duration::from_secs(secs.max(1)), heartbeat_property));
            run(&device, &commands, heartbeat, &cancel).await?
        }
    }

    device.close().await?;
    Ok(())
}

/// Defaults, then the config file, then environment and flags
fn build_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => AgentConfig::default(),
    };
    config.apply_env();

    if let Some(product_key) = &cli.product_key {
        config.device.product_key = product_key.clone();
    }
    if let Some(name) = &cli.name {
        config.device.name = name.clone();
    }
    if let Some(url) = &cli.platform_url {
        config.platform.base_url = url.clone();
    }
    if let Some(path) = &cli.data_path {
        config.storage.data_path = path.clone();
    }
    // A long-running agent keeps trying
    if cli.auto_retry || matches!(cli.command, Commands::Run { .. }) {
        config.retry = config.retry.enable_all();
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn parse_values(raw: &[String]) -> Vec<Value> {
    raw.iter().map(|v| Value::parse_literal(v)).collect()
}

async fn register(device: &Device, cancel: &CancellationToken) -> Result<()> {
    let identity = device.identity().await;
    if identity.is_registered() {
        println!("Device already registered!");
        println!("  ID: {}", identity.id);
        return Ok(());
    }

    device.register_with_retry(cancel).await?;

    let identity = device.identity().await;
    println!("\n✓ Device registered successfully!");
    println!("  ID: {}", identity.id);
    Ok(())
}

async fn login(device: &Device, cancel: &CancellationToken) -> Result<()> {
    device.login_with_retry(cancel).await?;

    let identity = device.identity().await;
    println!("\n✓ Device logged in!");
    println!("  ID: {}", identity.id);
    println!("  Access: {}", identity.access);
    Ok(())
}

async fn show(device: &Device) {
    let identity = device.identity().await;

    println!("\nDevice Identity:");
    println!("  Product key: {}", identity.product_key);
    println!("  Name: {}", identity.name);
    println!("  Version: {}", identity.version);

    if identity.is_registered() {
        println!("  ID: {}", identity.id);
    } else {
        println!("  Not registered. Run 'device-agent register'.");
    }

    if identity.has_session_credentials() {
        println!("  Access: {}", identity.access);
        println!("  Token stored: {} bytes", identity.token.len());
    }
}

async fn run(
    device: &Device,
    commands: &[u16],
    heartbeat: Option<(Duration, u16)>,
    cancel: &CancellationToken,
) -> Result<()> {
    device.auto_init(cancel).await?;

    let table = commands.iter().fold(CommandTable::new(), |table, &id| {
        table.on(id, move |params| info!(command = id, params = ?params, "Command received"))
    });
    if table.is_empty() {
        warn!("No command handlers registered");
    }
    device.on_command(table).await?;

    println!("\n✓ Agent running, press Ctrl-C to stop");

    let Some((period, property_id)) = heartbeat else {
        cancel.cancelled().await;
        return Ok(());
    };

    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let property = Property::new(property_id, vec![Value::Int(chrono::Utc::now().timestamp())]);
                if let Err(e) = device.auto_post_property(&property, cancel).await {
                    warn!(error = %e, category = e.category(), "Heartbeat not posted");
                }
            }
        }
    }
    Ok(())
}
