use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A spawned background task together with the token that stops it.
/// Dropping the handle cancels the task without waiting for it.
#[derive(Debug)]
pub struct TaskHandle {
    cancellation_token: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
}

impl TaskHandle {
    pub fn new(cancellation_token: CancellationToken, join_handle: JoinHandle<()>) -> Self {
        Self {
            cancellation_token,
            join_handle: Some(join_handle),
        }
    }

    /// Cancels the task and waits until it has exited.
    pub async fn stop(mut self) {
        self.cancellation_token.cancel();
        if let Some(join_handle) = self.join_handle.take() {
            let _ = join_handle.await;
        }
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
