/*!
 * PiTooth command-line front end
 * Runs one action against the local Bluetooth controller and exits
 */

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Dispatch};

use pitooth::{logging, BluetoothManager, ManagerOptions};

mod config;

use config::{CliConfig, DEFAULT_CONNECTION_WINDOW};

#[derive(Parser, Debug)]
#[command(name = "pitooth")]
#[command(about = "Headless Bluetooth pairing and OBEX control for Raspberry Pi")]
#[command(version)]
struct Cli {
    /// Bluetooth device alias [default: PiToothDevice]
    #[arg(long)]
    alias: Option<String>,

    /// Log level: debug, info or error [default: info]
    #[arg(long)]
    log: Option<String>,

    /// Start the OBEX server (requires --obexPath)
    #[arg(long = "enableObex")]
    enable_obex: bool,

    /// Stop the OBEX server
    #[arg(long = "disableObex")]
    disable_obex: bool,

    /// Directory received files are written to
    #[arg(long = "obexPath", value_name = "DIR")]
    obex_path: Option<PathBuf>,

    /// Make the device discoverable and pairable for a while
    #[arg(long = "acceptConnections")]
    accept_connections: bool,

    /// Pairing window in seconds; non-positive means 30 [default: 30]
    #[arg(long = "connectionWindow", value_name = "SECONDS", allow_negative_numbers = true)]
    connection_window: Option<i64>,

    /// Configuration file path
    #[arg(long, default_value = "/etc/pitooth/pitooth.toml")]
    config: PathBuf,

    /// Print the session snapshot as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    EnableObex(PathBuf),
    DisableObex,
    AcceptConnections(Duration),
}

#[derive(Debug)]
enum UsageError {
    MissingObexPath,
    NoAction,
}

/// Picks the single action to run. Enabling OBEX wins over disabling it,
/// which wins over accepting connections.
fn resolve_action(cli: &Cli, config: &CliConfig) -> std::result::Result<Action, UsageError> {
    if cli.enable_obex {
        let path = cli
            .obex_path
            .clone()
            .or_else(|| config.obex_path.clone())
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(UsageError::MissingObexPath)?;
        return Ok(Action::EnableObex(path));
    }
    if cli.disable_obex {
        return Ok(Action::DisableObex);
    }
    if cli.accept_connections {
        let seconds = cli.connection_window.unwrap_or(config.connection_window);
        return Ok(Action::AcceptConnections(window(seconds)));
    }
    Err(UsageError::NoAction)
}

fn window(seconds: i64) -> Duration {
    match u64::try_from(seconds) {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => Duration::from_secs(DEFAULT_CONNECTION_WINDOW.unsigned_abs()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = CliConfig::load(&cli.config)?;

    // Nothing below this point may run for an invalid invocation.
    let action = match resolve_action(&cli, &config) {
        Ok(action) => action,
        Err(UsageError::MissingObexPath) => {
            let _ = Cli::command()
                .error(
                    ErrorKind::MissingRequiredArgument,
                    "--enableObex requires --obexPath <DIR>",
                )
                .print();
            anyhow::bail!("missing OBEX receive directory");
        }
        Err(UsageError::NoAction) => {
            eprintln!("{}", Cli::command().render_help());
            anyhow::bail!("no action specified");
        }
    };

    let level = cli.log.as_deref().unwrap_or(&config.log_level);
    let logger = init_logging(level)?;

    let alias = cli.alias.clone().unwrap_or_else(|| config.alias.clone());
    info!("PiTooth starting as {:?}", alias);

    let manager = BluetoothManager::new(&alias, ManagerOptions::new().logger(logger))
        .await
        .context("failed to set up Bluetooth")?;

    match action {
        Action::EnableObex(dir) => {
            manager
                .control_obex_server(true, &dir)
                .await
                .context("failed to start the OBEX server")?;
            println!("OBEX server controlled successfully.");
        }
        Action::DisableObex => {
            manager
                .control_obex_server(false, "")
                .await
                .context("failed to stop the OBEX server")?;
            println!("OBEX server controlled successfully.");
        }
        Action::AcceptConnections(window) => {
            let cancel = CancellationToken::new();
            let interrupt = tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Interrupted, closing the pairing window...");
                        cancel.cancel();
                    }
                }
            });

            let result = manager.accept_connections_until(window, &cancel).await;
            interrupt.abort();
            let snapshot = result.context("failed to accept connections")?;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            } else {
                println!("{} active connections.", snapshot.len());
            }
        }
    }

    Ok(())
}

fn init_logging(level: &str) -> Result<Dispatch> {
    let filter = logging::target_filter(logging::parse_level(level), &["pitooth", "pitooth_cli"]);
    let logger = Dispatch::new(tracing_subscriber::fmt().with_env_filter(filter).finish());
    tracing::dispatcher::set_global_default(logger.clone())
        .context("failed to install logger")?;
    Ok(logger)
}
