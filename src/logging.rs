use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::INFO;

/// Initializes the global tracing subscriber from config, with an optional
/// CLI level override taking precedence.
pub fn init(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<()> {
    let level = resolve_level(config, cli_level_override)?;
    let format = config
        .logging
        .as_ref()
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json);

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true);
    match format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))?;

    Ok(())
}

fn resolve_level(config: &Config, cli_level_override: Option<&str>) -> anyhow::Result<LevelFilter> {
    let configured = config
        .logging
        .as_ref()
        .and_then(|logging| logging.level.as_deref());
    let Some(raw_level) = cli_level_override.or(configured) else {
        return Ok(DEFAULT_LOG_LEVEL);
    };

    raw_level.trim().parse::<LevelFilter>().map_err(|_| {
        anyhow!("invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off")
    })
}
