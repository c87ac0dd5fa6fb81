use crate::error::AppError;
use crate::market::types::{InstrumentSnapshot, LiveTrade, MarketView, StreamStatusSnapshot};
use crate::market::MarketSynchronizer;

/// One line of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Search(String),
    SearchNow(String),
    Refresh,
    Quotes,
    Series(String),
    History(String),
    Status,
    Json,
    Quit,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        let Some(directive) = trimmed.strip_prefix(':') else {
            return Self::Search(line.to_string());
        };

        let (name, argument) = match directive.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (directive, ""),
        };

        match name.to_ascii_lowercase().as_str() {
            "refresh" | "r" => Self::Refresh,
            "now" => Self::SearchNow(argument.to_string()),
            "quotes" | "q" => Self::Quotes,
            "series" => Self::Series(argument.to_string()),
            "history" | "h" => Self::History(argument.to_string()),
            "status" | "s" => Self::Status,
            "json" => Self::Json,
            "quit" | "exit" => Self::Quit,
            _ => Self::Search(line.to_string()),
        }
    }
}

/// Executes `command` and returns the text to print. `Ok(None)` means quit.
pub fn execute(
    synchronizer: &MarketSynchronizer,
    command: ConsoleCommand,
) -> Result<Option<String>, AppError> {
    let output = match command {
        ConsoleCommand::Search(raw_text) => {
            synchronizer.submit_search(&raw_text);
            String::new()
        }
        ConsoleCommand::SearchNow(raw_text) => {
            synchronizer.search_now(&raw_text);
            String::new()
        }
        ConsoleCommand::Refresh => {
            synchronizer.refresh();
            String::new()
        }
        ConsoleCommand::Quotes => {
            let mut lines = render_trades(&synchronizer.live_trades());
            let unmatched = synchronizer.unmatched_trades();
            if !unmatched.is_empty() {
                lines.push_str(&format!("\n{} ticker(s) not in the current view", unmatched.len()));
            }
            lines
        }
        ConsoleCommand::Series(ticker) => render_series(&ticker, &synchronizer.price_series(&ticker)),
        ConsoleCommand::History(symbol) => render_records(&synchronizer.history(&symbol)),
        ConsoleCommand::Status => render_status(&synchronizer.stream_status()),
        ConsoleCommand::Json => simd_json::serde::to_string(&synchronizer.view())?,
        ConsoleCommand::Quit => return Ok(None),
    };
    Ok(Some(output))
}

pub fn render_view(view: &MarketView) -> String {
    match view {
        MarketView::Idle => "idle: type one or more symbols, e.g. AAPL, MSFT".to_string(),
        MarketView::Loading { key, stale } => match stale {
            Some(records) => format!(
                "loading {key} (showing {} stale record(s))\n{}",
                records.len(),
                render_records(records)
            ),
            None => format!("loading {key}..."),
        },
        MarketView::Ready { key, records } => {
            if records.is_empty() {
                format!("{key}: no records in the configured date window")
            } else {
                format!("{key}\n{}", render_records(records))
            }
        }
        MarketView::Failed {
            key,
            reason,
            last_good,
        } => match last_good {
            Some(records) => format!(
                "failed {key}: {reason}\nlast good data:\n{}",
                render_records(records)
            ),
            None => format!("failed {key}: {reason}"),
        },
    }
}

pub fn render_records(records: &[InstrumentSnapshot]) -> String {
    records
        .iter()
        .map(|record| {
            let volume = record
                .volume
                .map(|volume| volume.to_string())
                .unwrap_or_else(|| "-".to_string());
            let mut line = format!(
                "{:<10} {:<16} open={:<8} high={:>10.2} low={:>10.2} close={:>10.2} vol={}",
                record.symbol, record.date, record.open, record.high, record.low, record.close, volume
            );
            if let Some(live) = &record.live {
                line.push_str(&format!(" live={}", format_price(live.last_price)));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_trades(trades: &[LiveTrade]) -> String {
    if trades.is_empty() {
        return "no live trades yet".to_string();
    }
    trades
        .iter()
        .map(|trade| {
            format!(
                "{:<10} {:<10} price={} size={} at {}",
                trade.ticker,
                trade.exchange,
                format_price(trade.last_price),
                format_price(trade.last_size),
                trade.updated_at.to_rfc3339()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_series(ticker: &str, prices: &[f64]) -> String {
    if prices.is_empty() {
        return format!("{}: no prices yet", ticker.to_uppercase());
    }
    let joined = prices
        .iter()
        .map(|price| format!("{price:.2}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!("{} [{}] {joined}", ticker.to_uppercase(), prices.len())
}

pub fn render_status(status: &StreamStatusSnapshot) -> String {
    let state = match status.state {
        Some(state) => format!("{state:?}").to_lowercase(),
        None => "disabled".to_string(),
    };
    let mut line = format!(
        "stream {state}: {} tick(s), {} dropped frame(s)",
        status.ticks_received, status.frames_dropped
    );
    if let Some(last_tick_at) = status.last_tick_at {
        line.push_str(&format!(", last tick {}", last_tick_at.to_rfc3339()));
    }
    if let Some(reason) = &status.reason {
        line.push_str(&format!(" ({reason})"));
    }
    line
}

fn format_price(value: Option<f64>) -> String {
    value
        .map(|value| format!("{value}"))
        .unwrap_or_else(|| "-".to_string())
}
