use crate::config::{StreamSettings, SyncConfig};
use crate::error::{AppError, StreamError};
use crate::market::debounce::DebouncedInputGate;
use crate::market::marketstack::MarketstackClient;
use crate::market::query::{QueryCoordinator, QueryOutcome, SnapshotBatch, SnapshotSource};
use crate::market::quotes::{overlay_live, TickApplyOutcome, TickBoard};
use crate::market::tiingo::{StreamConnector, StreamEvent};
use crate::market::types::{
    latest_per_symbol, ConnectorState, InstrumentSnapshot, LiveTrade, MarketView, MergePolicy,
    SearchKey, StreamStatusSnapshot,
};
use crate::state::TaskHandle;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
enum Control {
    Search(SearchKey),
    Refresh,
}

struct FetchCompletion {
    generation: u64,
    key: SearchKey,
    outcome: QueryOutcome,
}

enum Wake {
    Cancelled,
    Search(SearchKey),
    Refresh,
    Fetched(FetchCompletion),
    Stream(Option<StreamEvent>),
    Reconnect,
}

/// Owns the presentation-facing [`MarketView`]. Search input flows through the
/// debounced gate into the query coordinator; stream ticks land on the tick
/// board and, under [`MergePolicy::Unified`], on the matching Ready records.
pub struct MarketSynchronizer {
    gate: DebouncedInputGate,
    control: mpsc::UnboundedSender<Control>,
    view: watch::Receiver<MarketView>,
    coordinator: QueryCoordinator,
    board: Arc<RwLock<TickBoard>>,
    stream_status: Arc<RwLock<StreamStatusSnapshot>>,
    task: TaskHandle,
}

impl MarketSynchronizer {
    pub fn start(config: SyncConfig) -> Result<Self, AppError> {
        let source = MarketstackClient::new(config.snapshot.clone())?;
        Ok(Self::with_source(config, Arc::new(source)))
    }

    pub fn with_source(config: SyncConfig, source: Arc<dyn SnapshotSource>) -> Self {
        let coordinator = QueryCoordinator::new(source);
        let (view_tx, view_rx) = watch::channel(MarketView::Idle);
        let (keys_tx, keys_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let board = Arc::new(RwLock::new(TickBoard::new(config.series_capacity)));
        let stream_status = Arc::new(RwLock::new(StreamStatusSnapshot::disabled(
            config
                .stream
                .is_none()
                .then(|| "no stream token configured".to_string()),
        )));

        let gate = DebouncedInputGate::spawn(config.debounce, keys_tx);
        let mut sync_loop = SyncLoop::new(
            coordinator.clone(),
            view_tx,
            Arc::clone(&board),
            Arc::clone(&stream_status),
            config.merge_policy,
            config.stream,
            config.reconnect_attempts,
        );

        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();
        let join_handle = tokio::spawn(async move {
            sync_loop.run(keys_rx, control_rx, task_token).await;
        });

        Self {
            gate,
            control: control_tx,
            view: view_rx,
            coordinator,
            board,
            stream_status,
            task: TaskHandle::new(cancellation_token, join_handle),
        }
    }

    /// Forwards one keystroke's worth of raw text to the debounced gate.
    pub fn submit_search(&self, raw_text: &str) {
        self.gate.submit(raw_text);
    }

    /// Applies a search key immediately, skipping the debounce interval.
    pub fn search_now(&self, raw_text: &str) {
        self.send_control(Control::Search(SearchKey::normalize(raw_text)));
    }

    /// Re-fetches the active key, bypassing the cache.
    pub fn refresh(&self) {
        self.send_control(Control::Refresh);
    }

    fn send_control(&self, control: Control) {
        if self.control.send(control).is_err() {
            debug!("synchronizer stopped; control message dropped");
        }
    }

    pub fn view(&self) -> MarketView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MarketView> {
        self.view.clone()
    }

    /// Last successful result for the active key, regardless of the current view.
    pub fn last_good(&self) -> Option<Vec<InstrumentSnapshot>> {
        let key = self.view.borrow().key().cloned()?;
        self.coordinator
            .cached(&key)
            .map(|batch| latest_per_symbol(&batch))
    }

    /// Every cached record for `symbol` under the active key, oldest first.
    pub fn history(&self, symbol: &str) -> Vec<InstrumentSnapshot> {
        let Some(key) = self.view.borrow().key().cloned() else {
            return Vec::new();
        };
        let Some(batch) = self.coordinator.cached(&key) else {
            return Vec::new();
        };

        let mut history: Vec<InstrumentSnapshot> = batch
            .iter()
            .filter(|record| record.symbol.eq_ignore_ascii_case(symbol))
            .cloned()
            .collect();
        history.sort_by_key(|record| record.trading_date);
        history
    }

    pub fn live_trades(&self) -> Vec<LiveTrade> {
        self.board.read().trades()
    }

    /// Live trades for tickers that have no record in the current view.
    pub fn unmatched_trades(&self) -> Vec<LiveTrade> {
        let records = self
            .view
            .borrow()
            .last_good()
            .map(<[InstrumentSnapshot]>::to_vec)
            .unwrap_or_default();
        self.board.read().unmatched(&records)
    }

    pub fn price_series(&self, ticker: &str) -> Vec<f64> {
        self.board.read().series(ticker)
    }

    pub fn stream_status(&self) -> StreamStatusSnapshot {
        self.stream_status.read().clone()
    }

    /// Cancels the pending debounce, closes the stream connection and stops
    /// the loop. No view update is published afterwards.
    pub async fn shutdown(self) {
        self.gate.shutdown().await;
        self.task.stop().await;
        info!("market synchronizer stopped");
    }
}

struct StreamSupervisor {
    settings: Option<StreamSettings>,
    connector: Option<StreamConnector>,
    events: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    max_reconnect_attempts: u32,
    reconnect_attempt: u32,
    retry_at: Option<Instant>,
}

struct SyncLoop {
    coordinator: QueryCoordinator,
    view: watch::Sender<MarketView>,
    board: Arc<RwLock<TickBoard>>,
    stream_status: Arc<RwLock<StreamStatusSnapshot>>,
    merge_policy: MergePolicy,
    generation: u64,
    active_key: SearchKey,
    base_records: Option<SnapshotBatch>,
    fetches: JoinSet<FetchCompletion>,
    stream: StreamSupervisor,
}

impl SyncLoop {
    fn new(
        coordinator: QueryCoordinator,
        view: watch::Sender<MarketView>,
        board: Arc<RwLock<TickBoard>>,
        stream_status: Arc<RwLock<StreamStatusSnapshot>>,
        merge_policy: MergePolicy,
        stream_settings: Option<StreamSettings>,
        max_reconnect_attempts: u32,
    ) -> Self {
        Self {
            coordinator,
            view,
            board,
            stream_status,
            merge_policy,
            generation: 0,
            active_key: SearchKey::default(),
            base_records: None,
            fetches: JoinSet::new(),
            stream: StreamSupervisor {
                settings: stream_settings,
                connector: None,
                events: None,
                max_reconnect_attempts,
                reconnect_attempt: 0,
                retry_at: None,
            },
        }
    }

    async fn run(
        &mut self,
        mut keys: mpsc::UnboundedReceiver<SearchKey>,
        mut control: mpsc::UnboundedReceiver<Control>,
        cancel_token: CancellationToken,
    ) {
        self.start_stream();

        loop {
            let retry_at = self.stream.retry_at;
            let wake = tokio::select! {
                biased;
                _ = cancel_token.cancelled() => Wake::Cancelled,
                Some(key) = keys.recv() => Wake::Search(key),
                Some(command) = control.recv() => match command {
                    Control::Search(key) => Wake::Search(key),
                    Control::Refresh => Wake::Refresh,
                },
                Some(joined) = self.fetches.join_next(), if !self.fetches.is_empty() => match joined {
                    Ok(completion) => Wake::Fetched(completion),
                    Err(error) => {
                        warn!(%error, "snapshot request task failed");
                        continue;
                    }
                },
                event = recv_stream_event(&mut self.stream.events), if self.stream.events.is_some() => {
                    Wake::Stream(event)
                }
                _ = sleep_until_retry(retry_at), if retry_at.is_some() => Wake::Reconnect,
            };

            match wake {
                Wake::Cancelled => break,
                Wake::Search(key) => self.on_search(key, false),
                Wake::Refresh => {
                    let key = self.active_key.clone();
                    self.on_search(key, true);
                }
                Wake::Fetched(completion) => self.on_fetch_completed(completion),
                Wake::Stream(Some(event)) => self.on_stream_event(event).await,
                Wake::Stream(None) => self.stream.events = None,
                Wake::Reconnect => {
                    self.stream.retry_at = None;
                    self.start_stream();
                }
            }
        }

        self.fetches.shutdown().await;
        if let Some(connector) = self.stream.connector.take() {
            connector.close().await;
            self.stream_status.write().state = Some(ConnectorState::Closed);
        }
        self.stream.events = None;
    }

    fn publish(&self, next: MarketView) {
        self.view.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn on_search(&mut self, key: SearchKey, force: bool) {
        self.generation = self.generation.wrapping_add(1);
        self.active_key = key.clone();

        if key.is_empty() {
            self.base_records = None;
            self.publish(MarketView::Idle);
            return;
        }

        let cached = self.coordinator.cached(&key);
        if !force {
            if let Some(batch) = cached {
                debug!(key = %key, "search key served from cache");
                self.show_ready(key, &batch);
                return;
            }
        }

        let already_loading = matches!(
            &*self.view.borrow(),
            MarketView::Loading { key: loading, .. } if *loading == key
        );
        if !already_loading {
            let stale = cached.map(|batch| Arc::new(latest_per_symbol(&batch)));
            self.publish(MarketView::Loading {
                key: key.clone(),
                stale,
            });
        }

        let coordinator = self.coordinator.clone();
        let generation = self.generation;
        self.fetches.spawn(async move {
            let outcome = if force {
                coordinator.refetch(&key).await
            } else {
                coordinator.request(&key).await
            };
            FetchCompletion {
                generation,
                key,
                outcome,
            }
        });
    }

    fn on_fetch_completed(&mut self, completion: FetchCompletion) {
        if completion.generation != self.generation {
            debug!(
                key = %completion.key,
                active = %self.active_key,
                "discarding snapshot result for a superseded search"
            );
            return;
        }

        match completion.outcome {
            QueryOutcome::Idle => {
                self.base_records = None;
                self.publish(MarketView::Idle);
            }
            QueryOutcome::Ready(batch) => self.show_ready(completion.key, &batch),
            QueryOutcome::Failed { error, last_good } => {
                self.base_records = None;
                self.publish(MarketView::Failed {
                    key: completion.key,
                    reason: error,
                    last_good: last_good.map(|batch| Arc::new(latest_per_symbol(&batch))),
                });
            }
        }
    }

    fn show_ready(&mut self, key: SearchKey, batch: &[InstrumentSnapshot]) {
        let records = Arc::new(latest_per_symbol(batch));
        self.base_records = Some(Arc::clone(&records));
        let rendered = self.render(&records);
        self.publish(MarketView::Ready {
            key,
            records: rendered,
        });
    }

    fn render(&self, records: &SnapshotBatch) -> SnapshotBatch {
        match self.merge_policy {
            MergePolicy::Separate => Arc::clone(records),
            MergePolicy::Unified => Arc::new(overlay_live(records, &self.board.read())),
        }
    }

    async fn on_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Opened => {
                let mut status = self.stream_status.write();
                status.state = Some(ConnectorState::Open);
                status.reason = None;
            }
            StreamEvent::Tick(tick) => {
                let ticker = tick.ticker.clone();
                let timestamp = tick.timestamp;
                let outcome = self.board.write().apply(tick);
                if let TickApplyOutcome::Stale { ticker } = outcome {
                    debug!(ticker = %ticker, "ignoring out-of-order tick");
                    return;
                }
                {
                    let mut status = self.stream_status.write();
                    status.ticks_received = status.ticks_received.saturating_add(1);
                    status.last_tick_at = status.last_tick_at.max(Some(timestamp));
                }
                // The reconnect budget resets only once the subscription has delivered data.
                self.stream.reconnect_attempt = 0;
                self.refresh_live_overlay(&ticker);
            }
            StreamEvent::FrameDropped { reason } => {
                debug!(reason = %reason, "stream frame dropped");
                let mut status = self.stream_status.write();
                status.frames_dropped = status.frames_dropped.saturating_add(1);
            }
            StreamEvent::Errored(error) => {
                let retryable = !matches!(error, StreamError::Protocol(_));
                self.on_stream_terminated(ConnectorState::Errored, Some(error.to_string()), retryable)
                    .await;
            }
            StreamEvent::Closed { reason } => {
                self.on_stream_terminated(ConnectorState::Closed, reason, true)
                    .await;
            }
        }
    }

    fn refresh_live_overlay(&mut self, ticker: &str) {
        if self.merge_policy != MergePolicy::Unified {
            return;
        }
        let Some(records) = self.base_records.clone() else {
            return;
        };
        if !records
            .iter()
            .any(|record| record.symbol.eq_ignore_ascii_case(ticker))
        {
            return;
        }

        let rendered = self.render(&records);
        self.publish(MarketView::Ready {
            key: self.active_key.clone(),
            records: rendered,
        });
    }

    async fn on_stream_terminated(
        &mut self,
        state: ConnectorState,
        reason: Option<String>,
        retryable: bool,
    ) {
        {
            let mut status = self.stream_status.write();
            status.state = Some(state);
            status.reason = reason.clone();
        }
        if let Some(connector) = self.stream.connector.take() {
            connector.close().await;
        }
        self.stream.events = None;

        if !retryable {
            warn!(
                reason = reason.as_deref().unwrap_or("none"),
                "stream subscription rejected; not reconnecting"
            );
            return;
        }
        if self.stream.reconnect_attempt >= self.stream.max_reconnect_attempts {
            warn!(
                state = ?state,
                reason = reason.as_deref().unwrap_or("none"),
                "stream ended; not reconnecting"
            );
            return;
        }

        self.stream.reconnect_attempt = self.stream.reconnect_attempt.saturating_add(1);
        let delay = reconnect_delay(self.stream.reconnect_attempt);
        warn!(
            attempt = self.stream.reconnect_attempt,
            max_attempts = self.stream.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            reason = reason.as_deref().unwrap_or("none"),
            "stream ended; scheduling reconnect"
        );
        self.stream.retry_at = Some(Instant::now() + delay);
    }

    fn start_stream(&mut self) {
        let Some(settings) = self.stream.settings.clone() else {
            info!("stream connector disabled: no stream token configured");
            return;
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.stream.connector = Some(StreamConnector::connect(settings, events_tx));
        self.stream.events = Some(events_rx);

        let mut status = self.stream_status.write();
        status.state = Some(ConnectorState::Connecting);
        status.reason = (self.stream.reconnect_attempt > 0)
            .then(|| format!("reconnect attempt {}", self.stream.reconnect_attempt));
    }
}

async fn recv_stream_event(
    events: &mut Option<mpsc::UnboundedReceiver<StreamEvent>>,
) -> Option<StreamEvent> {
    match events.as_mut() {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_retry(retry_at: Option<Instant>) {
    match retry_at {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = (now_unix_ms().unsigned_abs() % 250).min(249);
    Duration::from_millis((base_ms + jitter_ms).min(5_000))
}

fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
