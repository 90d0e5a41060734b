mod codec;
mod config;
mod directory;
mod downlink;
mod envelope;
mod error;
mod lorawan;
mod publisher;
mod supervisor;
mod uplink;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lora-bridge")]
#[command(about = "Bridge between Semtech-UDP LoRaWAN gateways and an MQTT/HTTP IoT platform")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bridge (default if no subcommand is given).
    Run,
    /// Decrypt a single FRMPayload for field debugging.
    Decrypt {
        /// AppSKey, 32 hex chars.
        #[arg(long)]
        app_skey: String,
        /// DevAddr, 8 hex chars.
        #[arg(long)]
        dev_addr: String,
        /// Frame counter.
        #[arg(long)]
        fcnt: u32,
        /// Direction: "up" or "down".
        #[arg(long, default_value = "up")]
        direction: String,
        /// FRMPayload ciphertext, hex.
        #[arg(long)]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Decrypt {
            app_skey,
            dev_addr,
            fcnt,
            direction,
            payload,
        }) => {
            run_decrypt(&app_skey, &dev_addr, fcnt, &direction, &payload)?;
            return Ok(());
        }
        Some(Command::Run) | None => {}
    }

    let config = config::Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("warning: failed to load config from {:?}: {}", cli.config, e);
        eprintln!("using default configuration");
        config::Config::default()
    });

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)))
        .init();

    info!("lora-bridge v{}", env!("CARGO_PKG_VERSION"));

    let supervisor = match supervisor::Supervisor::new(config).await {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!("fatal startup error: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = supervisor.run().await {
        error!("fatal error: {e:#}");
        std::process::exit(1);
    }

    Ok(())
}

fn run_decrypt(app_skey_hex: &str, dev_addr_hex: &str, fcnt: u32, direction: &str, payload_hex: &str) -> anyhow::Result<()> {
    let app_skey_bytes = hex::decode(app_skey_hex)?;
    anyhow::ensure!(app_skey_bytes.len() == 16, "AppSKey must be 16 bytes");
    let mut app_skey = [0u8; 16];
    app_skey.copy_from_slice(&app_skey_bytes);

    let dev_addr_bytes = hex::decode(dev_addr_hex)?;
    anyhow::ensure!(dev_addr_bytes.len() == 4, "DevAddr must be 4 bytes");
    let dev_addr = u32::from_be_bytes(dev_addr_bytes.try_into().unwrap());

    let dir = match direction {
        "up" => lorawan::Direction::Up,
        "down" => lorawan::Direction::Down,
        other => anyhow::bail!("direction must be 'up' or 'down', got {other:?}"),
    };

    let ciphertext = hex::decode(payload_hex)?;
    let plaintext = lorawan::crypto::crypt_payload(&app_skey, dev_addr, fcnt, dir, &ciphertext);
    println!("{}", hex::encode(plaintext));
    Ok(())
}
