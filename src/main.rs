use std::path::PathBuf;

use clap::{ArgGroup, Parser};
use mockrelay::{
    config::Config,
    logging,
    server::{self, Mode},
    storage::Store,
};

#[derive(Debug, Parser)]
#[command(name = "mockrelay")]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .args(["serve", "update", "reset"])
))]
struct Cli {
    /// Serve recorded responses; the upstream API is never contacted.
    #[arg(short = 's', long)]
    serve: bool,
    /// Reset the store, then proxy requests to the upstream API and record
    /// each exchange.
    #[arg(short = 'u', long)]
    update: bool,
    /// Delete the stored responses file and exit.
    #[arg(short = 'r', long)]
    reset: bool,
    /// Optional path to config TOML. If omitted, `mockrelay.toml` in the
    /// working directory is used.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the fixture file name (default `response`).
    #[arg(long)]
    name: Option<String>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    config.apply_fixture_name_override(cli.name.as_deref());
    logging::init(&config, cli.log_level.as_deref())?;

    if cli.reset {
        Store::from_config(&config, config.port).reset().await?;
        return Ok(());
    }

    let mode = if cli.update { Mode::Update } else { Mode::Serve };
    if mode == Mode::Update {
        // Recording starts from a clean slate.
        Store::from_config(&config, config.port).reset().await?;
    }

    let server = server::serve(&config, mode).await?;
    eprintln!("{}", startup_summary(&config, mode, server.listen_addr));
    tokio::signal::ctrl_c().await?;
    server.shutdown().await;

    Ok(())
}

fn startup_summary(config: &Config, mode: Mode, listen_addr: std::net::SocketAddr) -> String {
    let fixture = config.dir.join(&config.name).display().to_string();
    match mode {
        Mode::Serve => format!(
            "mockrelay serving recorded responses at http://{listen_addr}/ (fixture {fixture})"
        ),
        Mode::Update => format!(
            "mockrelay recording at http://{listen_addr}/ -> {} (fixture {fixture})",
            resolved_upstream_url(config)
        ),
    }
}

fn resolved_upstream_url(config: &Config) -> String {
    let port = config
        .api
        .port
        .map(|port| format!(":{port}"))
        .unwrap_or_default();
    let base = config.api.base.as_deref().unwrap_or("/");
    format!(
        "{}://{}{port}{base}",
        config.api.protocol.scheme(),
        config.api.hostname
    )
}
