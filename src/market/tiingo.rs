use crate::config::StreamSettings;
use crate::error::StreamError;
use crate::market::types::{parse_stream_frame, ConnectorState, FrameOutcome, InstrumentTick};
use crate::state::TaskHandle;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type TiingoWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle and data events reported to the connector's owner.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Opened,
    Tick(InstrumentTick),
    FrameDropped { reason: String },
    Errored(StreamError),
    Closed { reason: Option<String> },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeRequest<'a> {
    event_name: &'static str,
    authorization: &'a str,
    event_data: SubscribeEventData,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribeEventData {
    threshold_level: u8,
}

pub fn subscribe_message(settings: &StreamSettings) -> Result<String, StreamError> {
    let request = SubscribeRequest {
        event_name: "subscribe",
        authorization: &settings.token,
        event_data: SubscribeEventData {
            threshold_level: settings.threshold_level,
        },
    };
    simd_json::serde::to_string(&request).map_err(|error| StreamError::Handshake(error.to_string()))
}

async fn open_stream(settings: &StreamSettings) -> Result<TiingoWsStream, StreamError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };

    let (stream, _) = connect_async_with_config(settings.url.as_str(), Some(ws_config), true)
        .await
        .map_err(|error| StreamError::Connect(error.to_string()))?;
    Ok(stream)
}

/// Owns one subscription connection. Moves through
/// `Connecting -> Open -> {Closed | Errored}` exactly once and never reconnects;
/// a new connection needs a new connector.
#[derive(Debug)]
pub struct StreamConnector {
    state: Arc<RwLock<ConnectorState>>,
    task: TaskHandle,
}

impl StreamConnector {
    pub fn connect(settings: StreamSettings, events: mpsc::UnboundedSender<StreamEvent>) -> Self {
        let state = Arc::new(RwLock::new(ConnectorState::Connecting));
        let cancellation_token = CancellationToken::new();
        let task_state = Arc::clone(&state);
        let task_token = cancellation_token.clone();
        let join_handle = tokio::spawn(async move {
            run_connector(settings, task_state, events, task_token).await;
        });

        Self {
            state,
            task: TaskHandle::new(cancellation_token, join_handle),
        }
    }

    pub fn state(&self) -> ConnectorState {
        *self.state.read()
    }

    /// Sends a close frame if the socket is open and waits for the task to exit.
    pub async fn close(self) {
        self.task.stop().await;
    }
}

struct ConnectorContext<'a> {
    state: &'a Arc<RwLock<ConnectorState>>,
    events: &'a mpsc::UnboundedSender<StreamEvent>,
}

impl ConnectorContext<'_> {
    fn transition(&self, next: ConnectorState) {
        let mut writable = self.state.write();
        if writable.is_terminal() {
            return;
        }
        *writable = next;
    }

    fn emit(&self, event: StreamEvent) -> bool {
        self.events.send(event).is_ok()
    }

    fn fail(&self, error: StreamError) {
        warn!(%error, "stream connector errored");
        self.transition(ConnectorState::Errored);
        self.emit(StreamEvent::Errored(error));
    }

    fn close(&self, reason: Option<String>) {
        info!(reason = reason.as_deref().unwrap_or("none"), "stream connector closed");
        self.transition(ConnectorState::Closed);
        self.emit(StreamEvent::Closed { reason });
    }
}

async fn run_connector(
    settings: StreamSettings,
    state: Arc<RwLock<ConnectorState>>,
    events: mpsc::UnboundedSender<StreamEvent>,
    cancel_token: CancellationToken,
) {
    let context = ConnectorContext {
        state: &state,
        events: &events,
    };

    let connected = tokio::select! {
        _ = cancel_token.cancelled() => {
            context.close(Some("closed before the connection opened".to_string()));
            return;
        }
        result = open_stream(&settings) => result,
    };

    let mut websocket_stream = match connected {
        Ok(stream) => stream,
        Err(error) => {
            context.fail(error);
            return;
        }
    };

    context.transition(ConnectorState::Open);
    info!(url = %settings.url, "stream connector open");
    if !context.emit(StreamEvent::Opened) {
        let _ = websocket_stream.close(None).await;
        context.close(Some("owner went away".to_string()));
        return;
    }

    let handshake = match subscribe_message(&settings) {
        Ok(handshake) => handshake,
        Err(error) => {
            context.fail(error);
            return;
        }
    };
    if let Err(error) = websocket_stream.send(Message::Text(handshake)).await {
        context.fail(StreamError::Handshake(error.to_string()));
        return;
    }

    loop {
        let frame = tokio::select! {
            _ = cancel_token.cancelled() => {
                let _ = websocket_stream.close(None).await;
                context.close(Some("closed by owner".to_string()));
                return;
            }
            next_message = websocket_stream.next() => next_message,
        };

        let Some(frame_result) = frame else {
            context.close(Some("stream ended".to_string()));
            return;
        };

        let message = match frame_result {
            Ok(message) => message,
            Err(error) => {
                context.fail(StreamError::from(error));
                return;
            }
        };

        let handled = match message {
            Message::Text(text_payload) => {
                let mut owned_payload = text_payload.into_bytes();
                handle_payload(owned_payload.as_mut_slice(), &context)
            }
            Message::Binary(mut binary_payload) => {
                handle_payload(binary_payload.as_mut_slice(), &context)
            }
            Message::Close(close_frame) => {
                context.close(close_frame.map(|frame| frame.reason.to_string()));
                return;
            }
            _ => PayloadHandling::Continue,
        };

        match handled {
            PayloadHandling::Continue => {}
            PayloadHandling::OwnerGone => {
                let _ = websocket_stream.close(None).await;
                context.close(Some("owner went away".to_string()));
                return;
            }
            PayloadHandling::Rejected(reason) => {
                let _ = websocket_stream.close(None).await;
                context.fail(StreamError::Protocol(reason));
                return;
            }
        }
    }
}

enum PayloadHandling {
    Continue,
    OwnerGone,
    Rejected(String),
}

fn handle_payload(payload: &mut [u8], context: &ConnectorContext<'_>) -> PayloadHandling {
    let delivered = match parse_stream_frame(payload) {
        Ok(FrameOutcome::Tick(tick)) => context.emit(StreamEvent::Tick(tick)),
        Ok(FrameOutcome::Skipped { message_type }) => {
            debug!(message_type = %message_type, "skipping non-update frame");
            true
        }
        Ok(FrameOutcome::Rejected { reason }) => return PayloadHandling::Rejected(reason),
        Err(error) => {
            warn!(%error, "dropping malformed stream frame");
            context.emit(StreamEvent::FrameDropped {
                reason: error.to_string(),
            })
        }
    };

    if delivered {
        PayloadHandling::Continue
    } else {
        PayloadHandling::OwnerGone
    }
}
