use crate::error::FetchError;
use crate::market::types::{InstrumentSnapshot, SearchKey};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub type SnapshotBatch = Arc<Vec<InstrumentSnapshot>>;

/// Pull-based source of end-of-day records.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch(&self, symbols: &[String]) -> Result<Vec<InstrumentSnapshot>, FetchError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Idle,
    Ready(SnapshotBatch),
    Failed {
        error: FetchError,
        last_good: Option<SnapshotBatch>,
    },
}

type SharedFetch = Shared<BoxFuture<'static, Result<SnapshotBatch, FetchError>>>;

struct InFlight {
    generation: u64,
    fetch: SharedFetch,
}

#[derive(Default)]
struct QueryState {
    cache: HashMap<SearchKey, SnapshotBatch>,
    in_flight: HashMap<SearchKey, InFlight>,
    next_generation: u64,
    fetches_started: u64,
}

/// Caches the last good result per key and guarantees at most one
/// outstanding fetch per key; concurrent callers join the running fetch.
#[derive(Clone)]
pub struct QueryCoordinator {
    source: Arc<dyn SnapshotSource>,
    state: Arc<Mutex<QueryState>>,
}

impl QueryCoordinator {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self {
            source,
            state: Arc::new(Mutex::new(QueryState::default())),
        }
    }

    /// Returns the cached result when one exists, otherwise fetches.
    pub async fn request(&self, key: &SearchKey) -> QueryOutcome {
        self.run(key, false).await
    }

    /// Bypasses the cache. Still joins a fetch that is already running.
    pub async fn refetch(&self, key: &SearchKey) -> QueryOutcome {
        self.run(key, true).await
    }

    pub fn cached(&self, key: &SearchKey) -> Option<SnapshotBatch> {
        self.state.lock().cache.get(key).cloned()
    }

    pub fn is_in_flight(&self, key: &SearchKey) -> bool {
        self.state.lock().in_flight.contains_key(key)
    }

    pub fn fetches_started(&self) -> u64 {
        self.state.lock().fetches_started
    }

    async fn run(&self, key: &SearchKey, force: bool) -> QueryOutcome {
        if key.is_empty() {
            return QueryOutcome::Idle;
        }

        let fetch = {
            let mut writable = self.state.lock();
            if !force {
                if let Some(records) = writable.cache.get(key) {
                    debug!(key = %key, "serving snapshot from cache");
                    return QueryOutcome::Ready(Arc::clone(records));
                }
            }

            match writable.in_flight.get(key) {
                Some(existing) => {
                    debug!(key = %key, "joining in-flight snapshot fetch");
                    existing.fetch.clone()
                }
                None => {
                    let generation = writable.next_generation;
                    writable.next_generation = writable.next_generation.wrapping_add(1);
                    writable.fetches_started = writable.fetches_started.saturating_add(1);
                    let fetch = self.start_fetch(key.clone(), generation);
                    writable.in_flight.insert(
                        key.clone(),
                        InFlight {
                            generation,
                            fetch: fetch.clone(),
                        },
                    );
                    fetch
                }
            }
        };

        match fetch.await {
            Ok(records) => QueryOutcome::Ready(records),
            Err(error) => QueryOutcome::Failed {
                last_good: self.cached(key),
                error,
            },
        }
    }

    fn start_fetch(&self, key: SearchKey, generation: u64) -> SharedFetch {
        let source = Arc::clone(&self.source);
        let state = Arc::clone(&self.state);

        async move {
            let symbols = key.symbols();
            let result = source.fetch(&symbols).await.map(Arc::new);

            let mut writable = state.lock();
            let owns_slot = writable
                .in_flight
                .get(&key)
                .map(|in_flight| in_flight.generation == generation)
                .unwrap_or(false);
            if owns_slot {
                writable.in_flight.remove(&key);
            }

            match &result {
                Ok(records) => {
                    writable.cache.insert(key, Arc::clone(records));
                }
                Err(error) => {
                    warn!(key = %key, %error, "snapshot fetch failed; keeping last good entry");
                }
            }
            result
        }
        .boxed()
        .shared()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::market::types::EodRecordWire;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    pub(crate) fn snapshot(symbol: &str, close: f64) -> InstrumentSnapshot {
        InstrumentSnapshot::from(EodRecordWire {
            symbol: symbol.to_string(),
            date: Some("2025-01-31T00:00:00+0000".to_string()),
            exchange: Some("XNAS".to_string()),
            volume: Some(1_000.0),
            close: Some(close),
            high: Some(close + 1.0),
        })
    }

    /// Fake source whose fetches park until a permit is released.
    pub(crate) struct GatedSource {
        pub calls: AtomicUsize,
        pub fail: bool,
        gates: Mutex<HashMap<String, Arc<Semaphore>>>,
    }

    impl GatedSource {
        pub(crate) fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail,
                gates: Mutex::new(HashMap::new()),
            })
        }

        fn gate(&self, joined: &str) -> Arc<Semaphore> {
            Arc::clone(
                self.gates
                    .lock()
                    .entry(joined.to_string())
                    .or_insert_with(|| Arc::new(Semaphore::new(0))),
            )
        }

        pub(crate) fn release(&self, joined: &str) {
            self.gate(joined).add_permits(1);
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotSource for GatedSource {
        async fn fetch(&self, symbols: &[String]) -> Result<Vec<InstrumentSnapshot>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let joined = symbols.join(",");
            let gate = self.gate(&joined);
            let permit = gate.acquire().await.map_err(|error| FetchError::Transport {
                symbols: joined.clone(),
                message: error.to_string(),
            })?;
            permit.forget();

            if self.fail {
                return Err(FetchError::Status {
                    symbols: joined,
                    status: 500,
                });
            }
            Ok(symbols
                .iter()
                .enumerate()
                .map(|(index, symbol)| snapshot(symbol, 100.0 + index as f64))
                .collect())
        }
    }

    /// Fake source that answers immediately, succeeding or failing per call.
    struct ScriptedSource {
        calls: AtomicUsize,
        fail_from_call: usize,
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch(&self, symbols: &[String]) -> Result<Vec<InstrumentSnapshot>, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.fail_from_call {
                return Err(FetchError::Transport {
                    symbols: symbols.join(","),
                    message: "connection reset".to_string(),
                });
            }
            Ok(symbols.iter().map(|symbol| snapshot(symbol, 10.0)).collect())
        }
    }

    #[tokio::test]
    async fn empty_key_is_idle_without_fetching() {
        let source = GatedSource::new(false);
        let coordinator = QueryCoordinator::new(source.clone());

        let outcome = coordinator.request(&SearchKey::normalize("  ")).await;
        assert_eq!(outcome, QueryOutcome::Idle);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let source = GatedSource::new(false);
        let coordinator = QueryCoordinator::new(source.clone());
        let key = SearchKey::normalize("aapl");

        let first = tokio::spawn({
            let coordinator = coordinator.clone();
            let key = key.clone();
            async move { coordinator.request(&key).await }
        });
        let second = tokio::spawn({
            let coordinator = coordinator.clone();
            let key = key.clone();
            async move { coordinator.request(&key).await }
        });

        while source.calls() == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(coordinator.is_in_flight(&key));
        source.release("AAPL");

        let first = first.await.expect("first request task");
        let second = second.await.expect("second request task");
        assert!(matches!(first, QueryOutcome::Ready(_)));
        assert_eq!(first, second);
        assert_eq!(source.calls(), 1);
        assert_eq!(coordinator.fetches_started(), 1);
        assert!(!coordinator.is_in_flight(&key));
    }

    #[tokio::test]
    async fn serves_unchanged_key_from_cache() {
        let source = Arc::new(ScriptedSource {
            calls: AtomicUsize::new(0),
            fail_from_call: usize::MAX,
        });
        let coordinator = QueryCoordinator::new(source.clone());
        let key = SearchKey::normalize("msft");

        let first = coordinator.request(&key).await;
        let second = coordinator.request(&key).await;

        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refetch_bypasses_cache() {
        let source = Arc::new(ScriptedSource {
            calls: AtomicUsize::new(0),
            fail_from_call: usize::MAX,
        });
        let coordinator = QueryCoordinator::new(source.clone());
        let key = SearchKey::normalize("msft");

        let _ = coordinator.request(&key).await;
        let _ = coordinator.refetch(&key).await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_keeps_last_good_entry() {
        let source = Arc::new(ScriptedSource {
            calls: AtomicUsize::new(0),
            fail_from_call: 1,
        });
        let coordinator = QueryCoordinator::new(source);
        let key = SearchKey::normalize("tsla");

        let QueryOutcome::Ready(good) = coordinator.request(&key).await else {
            panic!("first fetch should succeed");
        };

        let outcome = coordinator.refetch(&key).await;
        let QueryOutcome::Failed { error, last_good } = outcome else {
            panic!("refetch should fail");
        };
        assert_eq!(error.requested_symbols(), "TSLA");
        assert_eq!(last_good, Some(Arc::clone(&good)));
        assert_eq!(coordinator.cached(&key), Some(good));
    }

    #[tokio::test]
    async fn failure_without_history_has_no_last_good() {
        let source = Arc::new(ScriptedSource {
            calls: AtomicUsize::new(0),
            fail_from_call: 0,
        });
        let coordinator = QueryCoordinator::new(source);
        let key = SearchKey::normalize("meta");

        let outcome = coordinator.request(&key).await;
        assert!(matches!(
            outcome,
            QueryOutcome::Failed {
                last_good: None,
                ..
            }
        ));
        assert!(coordinator.cached(&key).is_none());
    }
}
