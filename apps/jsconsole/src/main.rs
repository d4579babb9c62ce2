use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use jsconsole_core::config::SessionConfig;
use jsconsole_core::console;
use jsconsole_core::engine::DebugChannelEngine;
use jsconsole_core::session::DebugSession;
use jsconsole_core::logging::{self as logctl, LogConfig, LogLevel};
use tokio::io::{self, BufReader};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(
    name = "jsconsole",
    about = "Interactive JavaScript console over the V8 debugger protocol",
    author,
    version
)]
struct Cli {
    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "JSCONSOLE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "JSCONSOLE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    file: Option<PathBuf>,

    #[arg(
        long = "log-wire",
        env = "JSCONSOLE_LOG_WIRE",
        help = "Trace every protocol frame exchanged with the debug agent"
    )]
    wire: bool,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
            wire: self.wire,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach to a running engine's debug agent
    Attach(AttachArgs),
}

#[derive(Args, Debug)]
struct AttachArgs {
    #[arg(
        long,
        value_name = "URI",
        help = "Debug agent address (tcp://host:port, ws://host[:port]/path or wss://...)"
    )]
    uri: String,

    #[arg(
        long,
        value_name = "NAME",
        default_value = "console",
        help = "Session name; prefixes the virtual script names"
    )]
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("logging initialization failed")?;
    debug!(
        log_level = ?log_config.level,
        log_file = ?log_config.file,
        wire = log_config.wire,
        "logging configured"
    );

    match cli.command {
        Command::Attach(args) => attach(args).await,
    }
}

async fn attach(args: AttachArgs) -> Result<()> {
    let config = SessionConfig::from_env();
    let connection_id = Uuid::new_v4().to_string();
    let session = DebugSession::attach(
        args.name.as_str(),
        &args.uri,
        Arc::new(DebugChannelEngine::new()),
        config,
    )
    .await
    .with_context(|| format!("failed to attach to {}", args.uri))?;
    info!(connection_id = %connection_id, uri = %args.uri, "attached");
    eprintln!("attached to {} (type .help for commands)", args.uri);

    let input = BufReader::new(io::stdin());
    let outcome = tokio::select! {
        outcome = console::run(session.clone(), input, io::stdout()) => {
            outcome.context("console failed")
        }
        signal = tokio::signal::ctrl_c() => signal.context("failed to listen for ctrl-c"),
    };

    if let Err(err) = session.disconnect().await {
        warn!(connection_id = %connection_id, error = %err, "disconnect failed");
    }
    session.dispose().await;
    info!(connection_id = %connection_id, "detached");
    outcome
}
