use std::{net::SocketAddr, path::PathBuf};

use clap::{Parser, Subcommand};
use interceptproxy::{config::Config, logging};

#[derive(Debug, Parser)]
#[command(name = "interceptproxy")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the proxy and query API listeners.
    Serve {
        /// Optional path to config TOML. If omitted, default discovery is used.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override log level (trace, debug, info, warn, error, off).
        #[arg(long)]
        log_level: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, log_level } => {
            let config = Config::load(config.as_deref())?;
            logging::init(&config, log_level.as_deref())?;
            let proxy = interceptproxy::proxy::serve(&config).await?;
            eprintln!(
                "{}",
                startup_summary(&config, proxy.listen_addr, proxy.api_listen_addr)
            );
            tokio::signal::ctrl_c().await?;
            proxy.shutdown().await;
        }
    }

    Ok(())
}

fn startup_summary(
    config: &Config,
    listen_addr: SocketAddr,
    api_listen_addr: SocketAddr,
) -> String {
    format!(
        "startup config: proxy_listen={}, api_listen={}, storage_path={}, tls_cert={}, tls_key=[REDACTED]",
        listen_addr,
        api_listen_addr,
        config.storage.path.display(),
        config.tls.cert.display(),
    )
}
