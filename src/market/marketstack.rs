use crate::config::SnapshotSettings;
use crate::error::{AppError, FetchError};
use crate::market::query::SnapshotSource;
use crate::market::types::{EodResponseWire, InstrumentSnapshot};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, Url};
use tracing::{debug, info};

const ISO_DATE_FORMAT: &str = "%Y-%m-%d";

fn eod_endpoint(
    base_url: &Url,
    access_key: &str,
    symbols: &[String],
    date_from: NaiveDate,
    date_to: NaiveDate,
) -> Url {
    let mut endpoint = base_url.clone();
    endpoint
        .query_pairs_mut()
        .append_pair("access_key", access_key)
        .append_pair("symbols", &symbols.join(","))
        .append_pair("date_from", &date_from.format(ISO_DATE_FORMAT).to_string())
        .append_pair("date_to", &date_to.format(ISO_DATE_FORMAT).to_string());
    endpoint
}

/// End-of-day snapshot client. Stateless apart from the shared HTTP client.
#[derive(Debug, Clone)]
pub struct MarketstackClient {
    client: Client,
    settings: SnapshotSettings,
}

impl MarketstackClient {
    pub fn new(settings: SnapshotSettings) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()?;
        Ok(Self { client, settings })
    }

    pub async fn fetch_end_of_day(
        &self,
        symbols: &[String],
    ) -> Result<Vec<InstrumentSnapshot>, FetchError> {
        let joined = symbols.join(",");
        let endpoint = eod_endpoint(
            &self.settings.base_url,
            &self.settings.access_key,
            symbols,
            self.settings.date_from,
            self.settings.date_to,
        );
        debug!(symbols = %joined, "requesting end-of-day snapshot");

        let response = self
            .client
            .get(endpoint)
            .send()
            .await
            .map_err(|error| FetchError::Transport {
                symbols: joined.clone(),
                message: error.without_url().to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                symbols: joined,
                status: status.as_u16(),
            });
        }

        let payload = response
            .json::<EodResponseWire>()
            .await
            .map_err(|error| FetchError::Decode {
                symbols: joined.clone(),
                message: error.without_url().to_string(),
            })?;

        let records: Vec<InstrumentSnapshot> = payload
            .data
            .into_iter()
            .map(InstrumentSnapshot::from)
            .collect();
        info!(symbols = %joined, records = records.len(), "end-of-day snapshot received");
        Ok(records)
    }
}

#[async_trait]
impl SnapshotSource for MarketstackClient {
    async fn fetch(&self, symbols: &[String]) -> Result<Vec<InstrumentSnapshot>, FetchError> {
        self.fetch_end_of_day(symbols).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn day(year: i32, month: u32, date: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, date).expect("valid calendar date")
    }

    fn settings_for(base_url: &str) -> SnapshotSettings {
        SnapshotSettings {
            base_url: Url::parse(base_url).expect("valid base url"),
            access_key: "secret".to_string(),
            date_from: day(2025, 1, 24),
            date_to: day(2025, 2, 3),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn symbols(list: &[&str]) -> Vec<String> {
        list.iter().map(|symbol| symbol.to_string()).collect()
    }

    #[test]
    fn endpoint_carries_key_symbols_and_window() {
        let base = Url::parse("http://api.marketstack.com/v2/eod").expect("valid url");
        let endpoint = eod_endpoint(
            &base,
            "secret",
            &symbols(&["AAPL", "BRK.A"]),
            day(2025, 1, 24),
            day(2025, 2, 3),
        );

        assert_eq!(endpoint.path(), "/v2/eod");
        let query = endpoint.query().expect("query string");
        assert!(query.contains("access_key=secret"));
        assert!(query.contains("symbols=AAPL%2CBRK.A"));
        assert!(query.contains("date_from=2025-01-24"));
        assert!(query.contains("date_to=2025-02-03"));
    }

    #[tokio::test]
    async fn maps_records_from_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2/eod"))
            .and(query_param("access_key", "secret"))
            .and(query_param("symbols", "AAPL,MSFT"))
            .and(query_param("date_from", "2025-01-24"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"pagination":{"count":2},"data":[
                    {"symbol":"AAPL","date":"2025-01-31T00:00:00+0000","exchange":"XNAS","volume":101075100.0,"close":236.0,"high":247.19},
                    {"symbol":"MSFT","date":"2025-01-31T00:00:00+0000","exchange":null,"volume":null,"close":null,"high":420.1}
                ]}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let client = MarketstackClient::new(settings_for(&format!("{}/v2/eod", server.uri())))
            .expect("client should build");
        let records = client
            .fetch_end_of_day(&symbols(&["AAPL", "MSFT"]))
            .await
            .expect("fetch should succeed");

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].symbol, "AAPL");
        assert_eq!(records[0].date, "Fri Jan 31 2025");
        assert_eq!(records[0].high, 247.19);
        assert_eq!(records[0].close, 236.0);
        assert_eq!(records[0].volume, Some(101_075_100));
        assert_eq!(records[1].open, "UNKNOWN");
        assert_eq!(records[1].volume, None);
        assert_eq!(records[1].low, 0.0);
    }

    #[tokio::test]
    async fn non_success_status_is_a_fetch_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let client = MarketstackClient::new(settings_for(&server.uri())).expect("client should build");
        let error = client
            .fetch_end_of_day(&symbols(&["TSLA"]))
            .await
            .expect_err("429 should fail");

        assert_eq!(
            error,
            FetchError::Status {
                symbols: "TSLA".to_string(),
                status: 429
            }
        );
    }

    #[tokio::test]
    async fn unparseable_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
            .mount(&server)
            .await;

        let client = MarketstackClient::new(settings_for(&server.uri())).expect("client should build");
        let error = client
            .fetch(&symbols(&["GOOG", "META"]))
            .await
            .expect_err("html body should fail");

        assert!(matches!(error, FetchError::Decode { .. }));
        assert_eq!(error.requested_symbols(), "GOOG,META");
    }
}
