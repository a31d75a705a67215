//! sessionguard - sign in to an API, inspect and end the session.
//!
//! The session is kept between runs (cache file or OS keychain) and the
//! access credential is renewed transparently when the server reports it
//! expired.

mod commands;

use std::io;
use std::path::Path;

use anyhow::Result;
use sessionguard_core::{AuthClient, Config};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Log file name prefix in the cache directory (rotated daily)
const LOG_FILE_PREFIX: &str = "sessionguard.log";

const USAGE: &str = "Usage: sessionguard <command>

Commands:
  login [email]   Sign in and store the session
  whoami [--json] Show the signed-in user
  status          Show the stored session
  logout          End the session";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr and, when a log directory is available, to a daily
/// rolling file. The returned guard must live until exit to flush the file.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Help,
    Login,
    Whoami,
    Status,
    Logout,
}

impl Command {
    fn parse(arg: Option<&str>) -> Option<Self> {
        match arg.unwrap_or("") {
            "" | "-h" | "--help" | "help" => Some(Command::Help),
            "login" => Some(Command::Login),
            "whoami" => Some(Command::Whoami),
            "status" => Some(Command::Status),
            "logout" => Some(Command::Logout),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = Config::load()?;

    let log_dir = config.cache_dir().ok().map(|dir| dir.join("logs"));
    let log_guard = init_tracing(log_dir.as_deref());

    let args: Vec<String> = std::env::args().collect();
    let arg = args.get(1).map(String::as_str);
    let Some(command) = Command::parse(arg) else {
        eprintln!("Unknown command: {}\n\n{}", arg.unwrap_or_default(), USAGE);
        // exit skips destructors; flush the log file first
        drop(log_guard);
        std::process::exit(2);
    };

    if command == Command::Help {
        eprintln!("{}", USAGE);
        return Ok(());
    }

    info!(command = ?command, "sessionguard starting");
    let client = AuthClient::from_config(&config)?;

    match command {
        Command::Login => commands::login(&client, &mut config, args.get(2).cloned()).await,
        Command::Whoami => commands::whoami(&client, args.iter().any(|a| a == "--json")).await,
        Command::Status => commands::status(&client, &config).await,
        Command::Logout => commands::logout(&client).await,
        Command::Help => Ok(()),
    }
}
