mod acceptor;
mod buffer_pool;
mod cli;
mod config;
mod error;
mod headers;
mod redirect;
mod relay;
mod server;
mod session;
mod socks5;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use config::{LineConfig, TunnelConfig};
use server::TunnelClient;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity level
    let log_level = match cli.verbose {
        0 => "off",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    info!("Relay Tunnel v{}", env!("CARGO_PKG_VERSION"));

    let mut line_config = if std::path::Path::new(&cli.config).exists() {
        LineConfig::load(&cli.config)
            .with_context(|| format!("Failed to load configuration from {}", cli.config))?
    } else if has_overrides(&cli) {
        // 配置可以完全由命令行给出
        LineConfig::default()
    } else {
        anyhow::bail!("Configuration file not found: {}", cli.config);
    };

    // 命令行覆盖配置文件
    if let Some(listen) = &cli.listen {
        line_config.set("LocalAddr", listen.clone());
    }
    if let Some(dest) = &cli.dest {
        line_config.set("DestAddr", dest.clone());
    }
    if let Some(mode) = &cli.mode {
        line_config.set("Mode", mode.clone());
    }
    if let Some(headers) = &cli.headers {
        line_config.set("Headers", headers.clone());
    }
    if let Some(methods) = &cli.relay_methods {
        line_config.set("RelayMethods", methods.clone());
    }

    let config = TunnelConfig::from_line_config(&line_config)?;
    let client = TunnelClient::new(config);
    client.listen_and_serve().await?;

    Ok(())
}

/// 监听与目标地址都由命令行给出时允许缺省配置文件
fn has_overrides(cli: &Cli) -> bool {
    cli.listen.is_some() && cli.dest.is_some()
}
