use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use parlor_core::{AdvancePolicy, FormatterChain, RoomConfig};
use parlor_server::ServerConfig;
use parlor_telemetry::{LogFormat, TelemetryConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum AdvanceArg {
    Immediate,
    AllConfirm,
}

impl From<AdvanceArg> for AdvancePolicy {
    fn from(arg: AdvanceArg) -> Self {
        match arg {
            AdvanceArg::Immediate => Self::Immediate,
            AdvanceArg::AllConfirm => Self::AllConfirm,
        }
    }
}

/// Shared watch-party room server.
#[derive(Parser)]
#[command(name = "parlor", version, about)]
struct Args {
    /// Address to bind
    #[arg(long, env = "PARLOR_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind (0 picks a free port)
    #[arg(short, long, env = "PARLOR_PORT", default_value_t = 9091)]
    port: u16,

    /// Maximum registered users
    #[arg(long, env = "PARLOR_CAPACITY", default_value_t = parlor_core::config::DEFAULT_CAPACITY)]
    capacity: usize,

    /// Shared secret granting privileged controls (skip, theme)
    #[arg(long, env = "PARLOR_ADMIN_SECRET", hide_env_values = true)]
    admin_secret: Option<String>,

    /// How a finished entry advances the room
    #[arg(long, env = "PARLOR_ADVANCE_POLICY", value_enum, default_value_t = AdvanceArg::Immediate)]
    advance_policy: AdvanceArg,

    /// Force a pending all-confirm advance after this many seconds
    #[arg(long, env = "PARLOR_ADVANCE_TIMEOUT_SECS")]
    advance_timeout_secs: Option<u64>,

    /// Keep at most this many chat messages
    #[arg(long, env = "PARLOR_MESSAGE_HISTORY_LIMIT")]
    message_history_limit: Option<usize>,

    /// Seconds between getStatus heartbeats
    #[arg(long, env = "PARLOR_HEARTBEAT_SECS", default_value_t = 15)]
    heartbeat_secs: u64,

    /// Seconds of silence before a connection is reaped
    #[arg(long, env = "PARLOR_CLIENT_TIMEOUT_SECS", default_value_t = 45)]
    client_timeout_secs: u64,

    /// Disable image embedding and link rewriting in chat
    #[arg(long, env = "PARLOR_PLAIN_CHAT")]
    plain_chat: bool,

    /// Default log level (RUST_LOG overrides)
    #[arg(long, env = "PARLOR_LOG_LEVEL", default_value = "info")]
    log_level: tracing::Level,

    /// Log output format: json or pretty
    #[arg(long, env = "PARLOR_LOG_FORMAT", default_value = "json")]
    log_format: LogFormat,
}

impl Args {
    fn room_config(&self) -> RoomConfig {
        let config = RoomConfig {
            capacity: self.capacity,
            advance_policy: self.advance_policy.into(),
            message_history_limit: self.message_history_limit,
            ..RoomConfig::default()
        };
        match &self.admin_secret {
            Some(secret) if !secret.is_empty() => config.with_admin_secret(secret.clone()),
            _ => config,
        }
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            client_timeout: Duration::from_secs(self.client_timeout_secs.max(1)),
            advance_timeout: self.advance_timeout_secs.map(Duration::from_secs),
            ..ServerConfig::default()
        }
    }

    fn formatter(&self) -> anyhow::Result<FormatterChain> {
        if self.plain_chat {
            return Ok(FormatterChain::plain().with(parlor_core::format::EscapeHtml));
        }
        FormatterChain::standard().context("failed to compile chat formatters")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let telemetry = parlor_telemetry::init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        format: args.log_format,
        ..TelemetryConfig::default()
    });

    let handle = parlor_server::start(
        args.server_config(),
        args.room_config(),
        args.formatter()?,
        telemetry.metrics(),
    )
    .await
    .context("failed to start server")?;

    tracing::info!(addr = %handle.addr, "parlor ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    handle.shutdown().await;
    Ok(())
}
