use crate::error::AppError;
use crate::market::types::MergePolicy;
use chrono::NaiveDate;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_SNAPSHOT_URL: &str = "http://api.marketstack.com/v2/eod";
pub const DEFAULT_STREAM_URL: &str = "wss://api.tiingo.com/crypto";
pub const DEFAULT_DATE_FROM: &str = "2025-01-24";
pub const DEFAULT_DATE_TO: &str = "2025-02-03";
pub const DEFAULT_THRESHOLD_LEVEL: u8 = 2;
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 0;
pub const DEFAULT_SERIES_CAPACITY: usize = crate::market::quotes::DEFAULT_SERIES_CAPACITY;
pub const MIN_DEBOUNCE_MS: u64 = 50;
pub const MAX_DEBOUNCE_MS: u64 = 5_000;
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 1_000;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 20;
pub const MIN_SERIES_CAPACITY: usize = 16;
pub const MAX_SERIES_CAPACITY: usize = 4_096;

const ENV_PREFIX: &str = "MARKET_SYNC_";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncArgs {
    pub snapshot_url: Option<String>,
    pub access_key: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    pub stream_url: Option<String>,
    pub stream_token: Option<String>,
    pub threshold_level: Option<u8>,
    pub debounce_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub merge_policy: Option<MergePolicy>,
    pub reconnect_attempts: Option<u32>,
    pub series_capacity: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub base_url: Url,
    pub access_key: String,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub url: Url,
    pub token: String,
    pub threshold_level: u8,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub snapshot: SnapshotSettings,
    /// `None` when no stream token is configured.
    pub stream: Option<StreamSettings>,
    pub debounce: Duration,
    pub merge_policy: MergePolicy,
    pub reconnect_attempts: u32,
    pub series_capacity: usize,
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}"))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Result<Option<T>, AppError> {
    match env_value(name) {
        Some(raw) => raw.parse::<T>().map(Some).map_err(|_| {
            AppError::InvalidArgument(format!("{ENV_PREFIX}{name} has an invalid value '{raw}'"))
        }),
        None => Ok(None),
    }
}

fn parse_url(field: &str, raw: &str, schemes: &[&str]) -> Result<Url, AppError> {
    let url = Url::parse(raw)
        .map_err(|error| AppError::InvalidArgument(format!("{field} is not a valid url: {error}")))?;
    if !schemes.contains(&url.scheme()) {
        return Err(AppError::InvalidArgument(format!(
            "{field} must use one of the schemes {schemes:?}"
        )));
    }
    Ok(url)
}

fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|error| {
        AppError::InvalidArgument(format!("{field} must be an ISO date (YYYY-MM-DD): {error}"))
    })
}

impl SyncArgs {
    pub fn from_env() -> Result<Self, AppError> {
        let merge_policy = match env_value("MERGE_POLICY") {
            Some(raw) => Some(MergePolicy::parse_str(&raw).ok_or_else(|| {
                AppError::InvalidArgument(format!(
                    "{ENV_PREFIX}MERGE_POLICY must be 'separate' or 'unified', got '{raw}'"
                ))
            })?),
            None => None,
        };

        Ok(Self {
            snapshot_url: env_value("SNAPSHOT_URL"),
            access_key: env_value("ACCESS_KEY"),
            date_from: env_value("DATE_FROM"),
            date_to: env_value("DATE_TO"),
            stream_url: env_value("STREAM_URL"),
            stream_token: env_value("STREAM_TOKEN"),
            threshold_level: env_parsed("THRESHOLD_LEVEL")?,
            debounce_ms: env_parsed("DEBOUNCE_MS")?,
            request_timeout_ms: env_parsed("REQUEST_TIMEOUT_MS")?,
            merge_policy,
            reconnect_attempts: env_parsed("RECONNECT_ATTEMPTS")?,
            series_capacity: env_parsed("SERIES_CAPACITY")?,
        })
    }

    pub fn normalize(self) -> Result<SyncConfig, AppError> {
        let base_url = parse_url(
            "snapshotUrl",
            self.snapshot_url.as_deref().unwrap_or(DEFAULT_SNAPSHOT_URL),
            &["http", "https"],
        )?;

        let access_key = self
            .access_key
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        if access_key.is_empty() {
            return Err(AppError::InvalidArgument(
                "accessKey must be provided for snapshot requests".to_string(),
            ));
        }

        let date_from = parse_date(
            "dateFrom",
            self.date_from.as_deref().unwrap_or(DEFAULT_DATE_FROM),
        )?;
        let date_to = parse_date("dateTo", self.date_to.as_deref().unwrap_or(DEFAULT_DATE_TO))?;
        if date_from > date_to {
            return Err(AppError::InvalidArgument(format!(
                "dateFrom ({date_from}) must not be after dateTo ({date_to})"
            )));
        }

        let request_timeout_ms = self
            .request_timeout_ms
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS);
        if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&request_timeout_ms) {
            return Err(AppError::InvalidArgument(format!(
                "requestTimeoutMs must be between {MIN_REQUEST_TIMEOUT_MS} and {MAX_REQUEST_TIMEOUT_MS}"
            )));
        }

        let stream_token = self
            .stream_token
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let stream = match stream_token {
            Some(token) => Some(StreamSettings {
                url: parse_url(
                    "streamUrl",
                    self.stream_url.as_deref().unwrap_or(DEFAULT_STREAM_URL),
                    &["ws", "wss"],
                )?,
                token,
                threshold_level: self.threshold_level.unwrap_or(DEFAULT_THRESHOLD_LEVEL),
            }),
            None => None,
        };

        let debounce_ms = self.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS);
        if !(MIN_DEBOUNCE_MS..=MAX_DEBOUNCE_MS).contains(&debounce_ms) {
            return Err(AppError::InvalidArgument(format!(
                "debounceMs must be between {MIN_DEBOUNCE_MS} and {MAX_DEBOUNCE_MS}"
            )));
        }

        let reconnect_attempts = self
            .reconnect_attempts
            .unwrap_or(DEFAULT_RECONNECT_ATTEMPTS);
        if reconnect_attempts > MAX_RECONNECT_ATTEMPTS {
            return Err(AppError::InvalidArgument(format!(
                "reconnectAttempts must be at most {MAX_RECONNECT_ATTEMPTS}"
            )));
        }

        let series_capacity = self.series_capacity.unwrap_or(DEFAULT_SERIES_CAPACITY);
        if !(MIN_SERIES_CAPACITY..=MAX_SERIES_CAPACITY).contains(&series_capacity) {
            return Err(AppError::InvalidArgument(format!(
                "seriesCapacity must be between {MIN_SERIES_CAPACITY} and {MAX_SERIES_CAPACITY}"
            )));
        }

        Ok(SyncConfig {
            snapshot: SnapshotSettings {
                base_url,
                access_key,
                date_from,
                date_to,
                request_timeout: Duration::from_millis(request_timeout_ms),
            },
            stream,
            debounce: Duration::from_millis(debounce_ms),
            merge_policy: self.merge_policy.unwrap_or_default(),
            reconnect_attempts,
            series_capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_with_key() -> SyncArgs {
        SyncArgs {
            access_key: Some("test-key".to_string()),
            ..SyncArgs::default()
        }
    }

    #[test]
    fn normalizes_defaults() {
        let config = args_with_key().normalize().expect("defaults should be valid");

        assert_eq!(config.snapshot.base_url.as_str(), DEFAULT_SNAPSHOT_URL);
        assert_eq!(config.snapshot.access_key, "test-key");
        assert_eq!(config.snapshot.date_from, NaiveDate::from_ymd_opt(2025, 1, 24).expect("date"));
        assert_eq!(config.snapshot.date_to, NaiveDate::from_ymd_opt(2025, 2, 3).expect("date"));
        assert_eq!(
            config.snapshot.request_timeout,
            Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)
        );
        assert_eq!(config.debounce, Duration::from_millis(DEFAULT_DEBOUNCE_MS));
        assert_eq!(config.merge_policy, MergePolicy::Separate);
        assert_eq!(config.reconnect_attempts, DEFAULT_RECONNECT_ATTEMPTS);
        assert_eq!(config.series_capacity, DEFAULT_SERIES_CAPACITY);
        assert!(config.stream.is_none());
    }

    #[test]
    fn enables_stream_when_token_is_present() {
        let config = SyncArgs {
            stream_token: Some("  token  ".to_string()),
            threshold_level: Some(5),
            ..args_with_key()
        }
        .normalize()
        .expect("stream settings should be valid");

        let stream = config.stream.expect("stream should be enabled");
        assert_eq!(stream.token, "token");
        assert_eq!(stream.threshold_level, 5);
        assert_eq!(stream.url.as_str(), DEFAULT_STREAM_URL);
    }

    #[test]
    fn requires_access_key() {
        let result = SyncArgs {
            access_key: Some("   ".to_string()),
            ..SyncArgs::default()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_date_window() {
        let result = SyncArgs {
            date_from: Some("2025-02-10".to_string()),
            date_to: Some("2025-02-01".to_string()),
            ..args_with_key()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_debounce_range() {
        let result = SyncArgs {
            debounce_ms: Some(10),
            ..args_with_key()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn rejects_stream_url_with_http_scheme() {
        let result = SyncArgs {
            stream_token: Some("token".to_string()),
            stream_url: Some("https://api.tiingo.com/crypto".to_string()),
            ..args_with_key()
        }
        .normalize();

        assert!(result.is_err());
    }

    #[test]
    fn validates_reconnect_attempts_and_series_capacity() {
        let too_many_attempts = SyncArgs {
            reconnect_attempts: Some(MAX_RECONNECT_ATTEMPTS + 1),
            ..args_with_key()
        }
        .normalize();
        assert!(too_many_attempts.is_err());

        let tiny_series = SyncArgs {
            series_capacity: Some(2),
            ..args_with_key()
        }
        .normalize();
        assert!(tiny_series.is_err());
    }
}
