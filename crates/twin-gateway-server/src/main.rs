//! Device-twin gateway binary.
//!
//! Runs the gateway core on the in-memory backend and accepts device
//! connections over WebSocket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use twin_gateway::Terminator;
use twin_gateway_server::{standalone, FileConfig, GatewayServer};

/// CoAP device-twin gateway.
#[derive(Parser, Debug, Clone)]
#[command(name = "twin-gateway")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long, env = "TWIN_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration file.
    #[arg(short, long, env = "TWIN_GATEWAY_BIND")]
    bind: Option<SocketAddr>,

    /// HMAC secret for access tokens, overrides the configuration file.
    #[arg(long, env = "TWIN_GATEWAY_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

/// Log output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Forwards heartbeat self-termination to the main task.
struct ExitOnLostLiveness(mpsc::Sender<String>);

impl Terminator for ExitOnLostLiveness {
    fn terminate(&self, reason: &str) {
        error!(reason, "gateway lost liveness, terminating");
        let _ = self.0.try_send(reason.to_string());
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<FileConfig> {
    let mut config = match cli.config {
        Some(ref path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file '{}'", path.display()))?;
            toml::from_str(&content).context("invalid configuration file")?
        }
        None => FileConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(ref secret) = cli.jwt_secret {
        config.auth.jwt_secret.clone_from(secret);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(&cli)?;
    let gateway = standalone(&config)?;
    let service = Arc::clone(&gateway.service);

    let (terminate_tx, mut terminate_rx) = mpsc::channel(1);
    let heartbeat = service.start(Arc::new(ExitOnLostLiveness(terminate_tx)));

    let server = Arc::new(GatewayServer::new(config.server_config(), Arc::clone(&service)));
    info!(
        addr = %config.server.bind,
        instance_id = %service.context().config.instance_id,
        "starting twin gateway"
    );
    let serving = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve().await })
    };

    let outcome = tokio::select! {
        result = serving => match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow::Error::new(e)),
            Err(e) => Err(anyhow::anyhow!("server task failed: {e}")),
        },
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for shutdown signal")?;
            info!("interrupted, shutting down");
            Ok(())
        }
        Some(reason) = terminate_rx.recv() => Err(anyhow::anyhow!("terminated: {reason}")),
    };

    server.shutdown();
    heartbeat.stop();
    service.shutdown().await;
    outcome
}
