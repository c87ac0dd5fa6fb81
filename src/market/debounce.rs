use crate::market::types::SearchKey;
use crate::state::TaskHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Turns a burst of raw keystrokes into a single [`SearchKey`] once input has
/// been quiet for the configured interval. Last write wins; nothing is emitted
/// after the gate is shut down.
#[derive(Debug)]
pub struct DebouncedInputGate {
    input: mpsc::UnboundedSender<String>,
    task: TaskHandle,
}

impl DebouncedInputGate {
    pub fn spawn(quiet_interval: Duration, output: mpsc::UnboundedSender<SearchKey>) -> Self {
        let (input, receiver) = mpsc::unbounded_channel();
        let cancellation_token = CancellationToken::new();
        let task_token = cancellation_token.clone();
        let join_handle = tokio::spawn(async move {
            run_gate(quiet_interval, receiver, output, task_token).await;
        });

        Self {
            input,
            task: TaskHandle::new(cancellation_token, join_handle),
        }
    }

    pub fn submit(&self, raw_text: impl Into<String>) {
        if self.input.send(raw_text.into()).is_err() {
            debug!("input gate already stopped; keystroke dropped");
        }
    }

    /// Cancels any pending emission and waits for the timer task to exit.
    pub async fn shutdown(self) {
        self.task.stop().await;
    }
}

async fn run_gate(
    quiet_interval: Duration,
    mut receiver: mpsc::UnboundedReceiver<String>,
    output: mpsc::UnboundedSender<SearchKey>,
    cancel_token: CancellationToken,
) {
    let mut pending: Option<String> = None;

    loop {
        match pending.take() {
            None => {
                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(raw_text) => pending = Some(raw_text),
                        None => break,
                    },
                }
            }
            Some(raw_text) => {
                tokio::select! {
                    biased;
                    _ = cancel_token.cancelled() => break,
                    next = receiver.recv() => match next {
                        Some(newer) => pending = Some(newer),
                        None => break,
                    },
                    _ = tokio::time::sleep(quiet_interval) => {
                        let key = SearchKey::normalize(&raw_text);
                        debug!(key = %key, "search input settled");
                        if output.send(key).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
}
