//! Basic user agent example
//!
//! Starts a user agent over the loopback engine, registers one account,
//! prints every event as JSON, waits, and shuts down cleanly.
//!
//! ```text
//! cargo run --example basic_agent -- --user alice --gateway sip.example.com --password secret
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use sipua_core::logging::{parse_log_level, setup_logging, LoggingConfig};
use sipua_core::{observer_fn, LoopbackEngine, UaConfig, UserAgent};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "basic_agent", about = "Register one SIP account and print events")]
struct Args {
    /// Account user name
    #[arg(long, default_value = "alice")]
    user: String,

    /// Registrar, host[:port]
    #[arg(long, default_value = "sip.example.com")]
    gateway: String,

    /// Account password
    #[arg(long, env = "SIPUA_PASSWORD", default_value = "secret")]
    password: String,

    /// Local signaling port
    #[arg(long, default_value_t = 5060)]
    port: u16,

    /// Seconds to stay registered before stopping
    #[arg(long, default_value_t = 3)]
    duration: u64,

    /// Optional TOML configuration file
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(
        LoggingConfig::new(parse_log_level(&args.log_level)?, "basic_agent").with_json(args.json_logs),
    )?;

    let config = match &args.config {
        Some(path) => UaConfig::from_file(path)?,
        None => UaConfig::new().with_bind_addr(SocketAddr::from(([0, 0, 0, 0], args.port))),
    };

    let agent = UserAgent::new(Arc::new(LoopbackEngine::new()), config);
    agent
        .start(observer_fn(|_kind, event| {
            println!("{}", serde_json::to_string(&event.to_json())?);
            Ok(())
        }))
        .await?;

    let account = agent.add_account(&args.user, &args.gateway, &args.password).await?;
    info!(%account, "Account added");

    tokio::time::sleep(Duration::from_secs(args.duration)).await;

    if let Err(e) = agent.stop().await {
        warn!("Shutdown was not clean: {}", e);
    }
    Ok(())
}
