//! peerload - console entry point
//!
//! Loads every torrent in the torrent directory and reads commands from
//! standard input until `exit`.

use anyhow::{Context, Result};
use peerload::{parse_command, CliArgs, Client, Command, Config, ProgressDisplay, TorrentError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

/// Log panics through tracing before the default hook runs
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at an unknown location"),
        }

        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized at {:?}", args.log_level());
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    init_logging(&args);
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args);
    config.validate().context("Invalid configuration")?;

    let client = Client::load(&config.torrent_dir, &config.download_dir, config.session_config())
        .await
        .with_context(|| format!("Failed to load torrents from {}", config.torrent_dir.display()))?;
    info!("peerload ready with {} torrents", client.sessions().len());

    let display = ProgressDisplay::new(config.quiet);
    display.print_status(&client.status().await)?;
    display.print_help()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read from stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                None
            }
        };
        let Some(line) = line else {
            break;
        };

        match parse_command(&line) {
            Ok(Command::Exit) => break,
            Ok(Command::Help) => display.print_help()?,
            Ok(Command::Status) => display.print_status(&client.status().await)?,
            Ok(Command::Toggle { number, files }) => match client.set_active(number, files) {
                Ok(()) => display.print_status(&client.status().await)?,
                Err(e) => report(&display, &e)?,
            },
            Err(e) => report(&display, &e)?,
        }
    }

    client.exit().await;
    Ok(())
}

fn report(display: &ProgressDisplay, err: &anyhow::Error) -> std::io::Result<()> {
    match err.downcast_ref::<TorrentError>() {
        Some(TorrentError::UserInputError { message }) => display.print_error(message),
        _ => {
            warn!("Command failed: {}", err);
            display.print_error(&err.to_string())
        }
    }
}
