use crate::market::types::{InstrumentSnapshot, InstrumentTick, LiveTrade};
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_SERIES_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum TickApplyOutcome {
    Applied,
    Stale { ticker: String },
}

#[derive(Debug, Clone)]
struct PriceSeries {
    values: VecDeque<f64>,
    capacity: usize,
}

impl PriceSeries {
    fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, value: f64) {
        if self.values.len() == self.capacity {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }
}

/// Latest trade per ticker plus a bounded recent-price series for charting.
/// Tickers are keyed case-insensitively and kept whether or not a snapshot
/// for them has been loaded.
#[derive(Debug)]
pub struct TickBoard {
    trades: HashMap<String, LiveTrade>,
    series: HashMap<String, PriceSeries>,
    series_capacity: usize,
}

impl Default for TickBoard {
    fn default() -> Self {
        Self::new(DEFAULT_SERIES_CAPACITY)
    }
}

impl TickBoard {
    pub fn new(series_capacity: usize) -> Self {
        Self {
            trades: HashMap::new(),
            series: HashMap::new(),
            series_capacity: series_capacity.max(1),
        }
    }

    pub fn apply(&mut self, tick: InstrumentTick) -> TickApplyOutcome {
        let board_key = tick.ticker.to_uppercase();

        if let Some(current) = self.trades.get_mut(&board_key) {
            if tick.timestamp < current.updated_at {
                return TickApplyOutcome::Stale {
                    ticker: tick.ticker,
                };
            }

            if tick.last_price.is_some() {
                current.last_price = tick.last_price;
            }
            if tick.last_size.is_some() {
                current.last_size = tick.last_size;
            }
            current.exchange = tick.exchange;
            current.update_kind = tick.update_kind;
            current.updated_at = tick.timestamp;
        } else {
            self.trades.insert(
                board_key.clone(),
                LiveTrade {
                    ticker: tick.ticker,
                    exchange: tick.exchange,
                    update_kind: tick.update_kind,
                    last_price: tick.last_price,
                    last_size: tick.last_size,
                    updated_at: tick.timestamp,
                },
            );
        }

        if let Some(price) = tick.last_price {
            let capacity = self.series_capacity;
            self.series
                .entry(board_key)
                .or_insert_with(|| PriceSeries::new(capacity))
                .push(price);
        }

        TickApplyOutcome::Applied
    }

    pub fn trade(&self, ticker: &str) -> Option<&LiveTrade> {
        self.trades.get(&ticker.to_uppercase())
    }

    pub fn trades(&self) -> Vec<LiveTrade> {
        let mut trades: Vec<LiveTrade> = self.trades.values().cloned().collect();
        trades.sort_by(|lhs, rhs| lhs.ticker.cmp(&rhs.ticker));
        trades
    }

    /// Recent prices for one ticker, oldest first.
    pub fn series(&self, ticker: &str) -> Vec<f64> {
        self.series
            .get(&ticker.to_uppercase())
            .map(|series| series.values.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Trades whose ticker matches none of the given snapshots.
    pub fn unmatched(&self, records: &[InstrumentSnapshot]) -> Vec<LiveTrade> {
        let mut trades: Vec<LiveTrade> = self
            .trades
            .iter()
            .filter(|(board_key, _)| {
                !records
                    .iter()
                    .any(|record| record.symbol.eq_ignore_ascii_case(board_key))
            })
            .map(|(_, trade)| trade.clone())
            .collect();
        trades.sort_by(|lhs, rhs| lhs.ticker.cmp(&rhs.ticker));
        trades
    }
}

/// Returns copies of `records` with the matching live trade attached.
/// Only the tick-carried fields are added; snapshot fields are left as fetched.
pub fn overlay_live(records: &[InstrumentSnapshot], board: &TickBoard) -> Vec<InstrumentSnapshot> {
    records
        .iter()
        .map(|record| {
            let mut merged = record.clone();
            if let Some(trade) = board.trade(&record.symbol) {
                merged.live = Some(trade.clone());
            }
            merged
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};

    fn sample_tick(ticker: &str, millis: i64, size: Option<f64>, price: Option<f64>) -> InstrumentTick {
        InstrumentTick {
            ticker: ticker.to_string(),
            update_kind: "trade".to_string(),
            timestamp: DateTime::<Utc>::from_timestamp_millis(millis).expect("valid millis"),
            exchange: "BINANCE".to_string(),
            last_size: size,
            last_price: price,
        }
    }

    fn sample_snapshot(symbol: &str) -> InstrumentSnapshot {
        InstrumentSnapshot {
            symbol: symbol.to_string(),
            date: "Fri Jan 31 2025".to_string(),
            trading_date: None,
            open: "XNAS".to_string(),
            high: 240.0,
            low: 236.0,
            close: 236.0,
            volume: Some(1_000),
            live: None,
        }
    }

    #[test]
    fn keeps_fields_the_tick_does_not_carry() {
        let mut board = TickBoard::default();
        board.apply(sample_tick("btcusd", 1_000, Some(0.5), Some(42_000.0)));
        board.apply(sample_tick("BTCUSD", 2_000, None, Some(42_100.0)));

        let trade = board.trade("BtcUsd").expect("trade should be retained");
        assert_eq!(trade.last_price, Some(42_100.0));
        assert_eq!(trade.last_size, Some(0.5));
        assert_eq!(trade.updated_at.timestamp_millis(), 2_000);
    }

    #[test]
    fn ignores_ticks_older_than_the_current_trade() {
        let mut board = TickBoard::default();
        board.apply(sample_tick("ETHUSD", 5_000, Some(1.0), Some(3_000.0)));

        let outcome = board.apply(sample_tick("ETHUSD", 4_000, Some(2.0), Some(2_900.0)));
        assert_eq!(
            outcome,
            TickApplyOutcome::Stale {
                ticker: "ETHUSD".to_string()
            }
        );
        assert_eq!(board.trade("ETHUSD").and_then(|trade| trade.last_price), Some(3_000.0));
        assert_eq!(board.series("ETHUSD"), vec![3_000.0]);
    }

    #[test]
    fn bounds_price_series() {
        let mut board = TickBoard::new(3);
        for step in 0..5 {
            board.apply(sample_tick("SOLUSD", step, None, Some(100.0 + step as f64)));
        }

        assert_eq!(board.series("solusd"), vec![102.0, 103.0, 104.0]);
        assert!(board.series("ADAUSD").is_empty());
    }

    #[test]
    fn overlays_matching_records_case_insensitively() {
        let mut board = TickBoard::default();
        board.apply(sample_tick("aapl", 1_000, Some(10.0), Some(237.5)));

        let records = vec![sample_snapshot("AAPL"), sample_snapshot("MSFT")];
        let merged = overlay_live(&records, &board);

        let live = merged[0].live.as_ref().expect("AAPL should carry a live trade");
        assert_eq!(live.last_price, Some(237.5));
        assert_eq!(merged[0].close, 236.0);
        assert!(merged[1].live.is_none());
    }

    #[test]
    fn retains_ticks_for_unknown_symbols() {
        let mut board = TickBoard::default();
        board.apply(sample_tick("BTCUSD", 1_000, Some(0.1), Some(42_000.0)));
        board.apply(sample_tick("AAPL", 1_000, Some(5.0), Some(237.0)));

        let unmatched = board.unmatched(&[sample_snapshot("AAPL")]);
        assert_eq!(unmatched.len(), 1);
        assert_eq!(unmatched[0].ticker, "BTCUSD");

        let merged = overlay_live(&[sample_snapshot("btcusd")], &board);
        assert!(merged[0].live.is_some());
    }
}
