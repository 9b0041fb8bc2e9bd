/*!
 * Logger construction
 * The manager takes an injected `Dispatch`; nothing here touches the global default
 */

use tracing::Dispatch;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "LOG_LEVEL";

/// `debug`, `info` or `error`; anything else is `info`.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.trim().to_ascii_lowercase().as_str() {
        "debug" => LevelFilter::DEBUG,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    }
}

/// Filter admitting only the given crate targets at `level`, which keeps
/// third-party output out of our logs.
pub fn target_filter(level: LevelFilter, targets: &[&str]) -> EnvFilter {
    let directives = targets
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::new(directives)
}

/// JSON lines on stdout, seeded from `LOG_LEVEL`.
pub fn default_logger() -> Dispatch {
    let level = std::env::var(LOG_LEVEL_ENV)
        .map(|v| parse_level(&v))
        .unwrap_or(LevelFilter::INFO);
    json_logger(level)
}

pub fn json_logger(level: LevelFilter) -> Dispatch {
    let subscriber = tracing_subscriber::fmt()
        .json()
        .with_writer(std::io::stdout)
        .with_env_filter(target_filter(level, &["pitooth"]))
        .finish();
    Dispatch::new(subscriber)
}
