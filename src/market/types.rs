use crate::error::{FetchError, ParseError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::de::IgnoredAny;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

pub const UNKNOWN_EXCHANGE: &str = "UNKNOWN";
pub const UPDATE_MESSAGE_TYPE: &str = "A";
pub const HEARTBEAT_MESSAGE_TYPE: &str = "H";
pub const ERROR_MESSAGE_TYPE: &str = "E";
pub const TRADING_DATE_FORMAT: &str = "%a %b %d %Y";

/// Normalized search target: upper-cased tickers joined by commas.
/// An empty key means there is no active query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SearchKey(String);

impl SearchKey {
    pub fn normalize(raw: &str) -> Self {
        let symbols: Vec<String> = raw
            .split(|ch: char| ch == ',' || ch.is_whitespace())
            .filter(|token| !token.is_empty())
            .map(str::to_uppercase)
            .collect();
        Self(symbols.join(","))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn symbols(&self) -> Vec<String> {
        self.0
            .split(',')
            .filter(|symbol| !symbol.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl fmt::Display for SearchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MergePolicy {
    /// Ticks stay on the tick board; Ready records are never touched.
    #[default]
    Separate,
    /// Ticks are overlaid onto the matching Ready record.
    Unified,
}

impl MergePolicy {
    pub fn parse_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "separate" => Some(Self::Separate),
            "unified" => Some(Self::Unified),
            _ => None,
        }
    }
}

/// Last trade seen on the stream for one ticker.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LiveTrade {
    pub ticker: String,
    pub exchange: String,
    pub update_kind: String,
    pub last_price: Option<f64>,
    pub last_size: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

/// One end-of-day record as shown to presentation code.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentSnapshot {
    pub symbol: String,
    /// Human-readable calendar string, e.g. `Fri Jan 31 2025`.
    pub date: String,
    pub trading_date: Option<NaiveDate>,
    /// Populated from the upstream `exchange` field; the feed carries no open price.
    pub open: String,
    pub high: f64,
    /// Populated from the upstream `close` field.
    pub low: f64,
    pub close: f64,
    pub volume: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveTrade>,
}

#[derive(Debug, Deserialize)]
pub struct EodResponseWire {
    pub data: Vec<EodRecordWire>,
}

#[derive(Debug, Deserialize)]
pub struct EodRecordWire {
    pub symbol: String,
    pub date: Option<String>,
    pub exchange: Option<String>,
    pub volume: Option<f64>,
    pub close: Option<f64>,
    pub high: Option<f64>,
}

impl From<EodRecordWire> for InstrumentSnapshot {
    fn from(value: EodRecordWire) -> Self {
        let trading_date = value.date.as_deref().and_then(parse_trading_date);
        let date = match (trading_date, value.date) {
            (Some(day), _) => day.format(TRADING_DATE_FORMAT).to_string(),
            (None, Some(raw)) => raw,
            (None, None) => String::new(),
        };
        let open = value
            .exchange
            .filter(|exchange| !exchange.is_empty())
            .unwrap_or_else(|| UNKNOWN_EXCHANGE.to_string());
        let volume = value
            .volume
            .filter(|volume| volume.is_finite() && *volume >= 0.0)
            .map(|volume| volume.round() as u64);

        Self {
            symbol: value.symbol,
            date,
            trading_date,
            open,
            high: value.high.unwrap_or(0.0),
            low: value.close.unwrap_or(0.0),
            close: value.close.unwrap_or(0.0),
            volume,
            live: None,
        }
    }
}

pub fn parse_trading_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.date_naive());
    }
    if let Ok(parsed) = DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z") {
        return Some(parsed.date_naive());
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(parsed.date());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

/// Collapses a multi-day response to one record per symbol, keeping the most
/// recent trading date and the order in which symbols first appeared.
pub fn latest_per_symbol(records: &[InstrumentSnapshot]) -> Vec<InstrumentSnapshot> {
    let mut latest: Vec<InstrumentSnapshot> = Vec::new();
    let mut positions: HashMap<&str, usize> = HashMap::new();

    for record in records {
        match positions.get(record.symbol.as_str()) {
            Some(&position) => {
                if record.trading_date > latest[position].trading_date {
                    latest[position] = record.clone();
                }
            }
            None => {
                positions.insert(record.symbol.as_str(), latest.len());
                latest.push(record.clone());
            }
        }
    }

    latest
}

/// One inbound trade update from the streaming source.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentTick {
    pub ticker: String,
    pub update_kind: String,
    pub timestamp: DateTime<Utc>,
    pub exchange: String,
    pub last_size: Option<f64>,
    pub last_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct StreamFrameWire {
    #[serde(rename = "messageType")]
    message_type: String,
    #[serde(default)]
    data: Option<FramePayloadWire>,
    #[serde(default)]
    response: Option<FrameResponseWire>,
}

#[derive(Debug, Deserialize)]
struct FrameResponseWire {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FramePayloadWire {
    Sequence(Vec<Option<FrameCellWire>>),
    Other(IgnoredAny),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FrameCellWire {
    Number(f64),
    Text(String),
    Other(IgnoredAny),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Tick(InstrumentTick),
    Skipped { message_type: String },
    /// The server refused the subscription; the connection is unusable.
    Rejected { reason: String },
}

/// Decodes one stream frame. Only update frames carrying a positional
/// sequence produce a tick; everything else is reported as skipped.
pub fn parse_stream_frame(payload: &mut [u8]) -> Result<FrameOutcome, ParseError> {
    let frame: StreamFrameWire = simd_json::serde::from_slice(payload)?;
    if frame.message_type == ERROR_MESSAGE_TYPE {
        let response = frame.response.unwrap_or(FrameResponseWire {
            code: None,
            message: None,
        });
        let message = response
            .message
            .unwrap_or_else(|| "no message".to_string());
        let reason = match response.code {
            Some(code) => format!("{code} {message}"),
            None => message,
        };
        return Ok(FrameOutcome::Rejected { reason });
    }
    if frame.message_type != UPDATE_MESSAGE_TYPE {
        return Ok(FrameOutcome::Skipped {
            message_type: frame.message_type,
        });
    }

    match frame.data {
        Some(FramePayloadWire::Sequence(cells)) => tick_from_cells(cells).map(FrameOutcome::Tick),
        _ => Ok(FrameOutcome::Skipped {
            message_type: frame.message_type,
        }),
    }
}

// Positional layout: ticker, update kind, timestamp, exchange, last size, last price.
fn tick_from_cells(cells: Vec<Option<FrameCellWire>>) -> Result<InstrumentTick, ParseError> {
    if cells.len() < 4 {
        return Err(ParseError::Shape(format!(
            "expected at least 4 positional fields, found {}",
            cells.len()
        )));
    }

    let mut cells = cells.into_iter();
    let ticker = string_cell(0, cells.next().flatten())?;
    if ticker.trim().is_empty() {
        return Err(ParseError::Field {
            index: 0,
            reason: "ticker must not be empty".to_string(),
        });
    }
    let update_kind = string_cell(1, cells.next().flatten())?;
    let timestamp = timestamp_cell(2, cells.next().flatten())?;
    let exchange = string_cell(3, cells.next().flatten())?;
    let last_size = amount_cell(4, cells.next().flatten())?;
    let last_price = amount_cell(5, cells.next().flatten())?;

    Ok(InstrumentTick {
        ticker,
        update_kind,
        timestamp,
        exchange,
        last_size,
        last_price,
    })
}

fn string_cell(index: usize, cell: Option<FrameCellWire>) -> Result<String, ParseError> {
    match cell {
        Some(FrameCellWire::Text(value)) => Ok(value),
        _ => Err(ParseError::Field {
            index,
            reason: "expected a string".to_string(),
        }),
    }
}

fn timestamp_cell(index: usize, cell: Option<FrameCellWire>) -> Result<DateTime<Utc>, ParseError> {
    match cell {
        Some(FrameCellWire::Number(millis)) if millis.is_finite() => {
            DateTime::<Utc>::from_timestamp_millis(millis as i64).ok_or_else(|| {
                ParseError::Field {
                    index,
                    reason: format!("timestamp {millis} is out of range"),
                }
            })
        }
        Some(FrameCellWire::Text(raw)) => DateTime::parse_from_rfc3339(raw.trim())
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(|error| ParseError::Field {
                index,
                reason: format!("invalid timestamp '{raw}': {error}"),
            }),
        _ => Err(ParseError::Field {
            index,
            reason: "expected epoch millis or an RFC 3339 timestamp".to_string(),
        }),
    }
}

fn amount_cell(index: usize, cell: Option<FrameCellWire>) -> Result<Option<f64>, ParseError> {
    match cell {
        None => Ok(None),
        Some(FrameCellWire::Number(value)) if value.is_finite() && value >= 0.0 => Ok(Some(value)),
        Some(FrameCellWire::Number(value)) => Err(ParseError::Field {
            index,
            reason: format!("{value} must be finite and non-negative"),
        }),
        Some(_) => Err(ParseError::Field {
            index,
            reason: "expected a number".to_string(),
        }),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum MarketView {
    Idle,
    Loading {
        key: SearchKey,
        stale: Option<Arc<Vec<InstrumentSnapshot>>>,
    },
    Ready {
        key: SearchKey,
        records: Arc<Vec<InstrumentSnapshot>>,
    },
    Failed {
        key: SearchKey,
        reason: FetchError,
        #[serde(rename = "lastGood")]
        last_good: Option<Arc<Vec<InstrumentSnapshot>>>,
    },
}

impl MarketView {
    pub fn key(&self) -> Option<&SearchKey> {
        match self {
            Self::Idle => None,
            Self::Loading { key, .. } | Self::Ready { key, .. } | Self::Failed { key, .. } => {
                Some(key)
            }
        }
    }

    pub fn records(&self) -> Option<&[InstrumentSnapshot]> {
        match self {
            Self::Ready { records, .. } => Some(records.as_slice()),
            _ => None,
        }
    }

    /// Data a presentation layer may keep showing while loading or after a failure.
    pub fn last_good(&self) -> Option<&[InstrumentSnapshot]> {
        match self {
            Self::Ready { records, .. } => Some(records.as_slice()),
            Self::Loading { stale, .. } => stale.as_deref().map(Vec::as_slice),
            Self::Failed { last_good, .. } => last_good.as_deref().map(Vec::as_slice),
            Self::Idle => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ConnectorState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusSnapshot {
    pub state: Option<ConnectorState>,
    pub reason: Option<String>,
    pub ticks_received: u64,
    pub frames_dropped: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl StreamStatusSnapshot {
    pub fn disabled(reason: Option<String>) -> Self {
        Self {
            state: None,
            reason,
            ticks_received: 0,
            frames_dropped: 0,
            last_tick_at: None,
        }
    }
}
