pub mod commands;
pub mod config;
pub mod error;
pub mod market;
pub mod state;
pub mod telemetry;

pub use error::AppError;

use commands::console::{execute, render_status, render_view, ConsoleCommand};
use config::SyncArgs;
use market::MarketSynchronizer;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Reads configuration from the environment, starts the synchronizer and
/// drives it from stdin until EOF, `:quit` or ctrl-c.
pub async fn run() -> Result<(), AppError> {
    telemetry::init_tracing(telemetry::DEFAULT_LOG_FILTER);

    let config = SyncArgs::from_env()?.normalize()?;
    info!(
        debounce_ms = config.debounce.as_millis() as u64,
        merge_policy = ?config.merge_policy,
        stream_enabled = config.stream.is_some(),
        "starting market synchronizer"
    );

    let synchronizer = MarketSynchronizer::start(config)?;
    let mut views = synchronizer.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{}", render_view(&views.borrow_and_update()));
    println!("{}", render_status(&synchronizer.stream_status()));

    let outcome = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(%error, "ctrl-c handler failed");
                }
                break Ok(());
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let view = views.borrow_and_update().clone();
                println!("{}", render_view(&view));
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break Ok(()),
                    Err(error) => break Err(AppError::from(error)),
                };
                match execute(&synchronizer, ConsoleCommand::parse(&line)) {
                    Ok(Some(output)) if output.is_empty() => {}
                    Ok(Some(output)) => println!("{output}"),
                    Ok(None) => break Ok(()),
                    Err(error) => warn!(%error, "console command failed"),
                }
            }
        }
    };

    synchronizer.shutdown().await;
    outcome
}
