//! Clarification wake-up channel: `waitForClarification` parks until
//! text arrives, or returns immediately if text is already pending.

use tokio::sync::Notify;
use std::sync::Mutex;

#[derive(Default)]
pub struct ClarificationChannel {
    pending: Mutex<Option<String>>,
    notify: Notify,
    released: Mutex<bool>,
}

impl ClarificationChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve immediately if text is already pending, otherwise park until
    /// `send` is called or the channel is released (terminal state).
    pub async fn wait(&self) -> Option<String> {
        loop {
            if let Some(text) = self.pending.lock().expect("mutex poisoned").take() {
                return Some(text);
            }
            if *self.released.lock().expect("mutex poisoned") {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn send(&self, text: impl Into<String>) {
        *self.pending.lock().expect("mutex poisoned") = Some(text.into());
        self.notify.notify_waiters();
    }

    /// Release any parked waiter with "no value". Called when the owning
    /// session enters a terminal state.
    pub fn release(&self) {
        *self.released.lock().expect("mutex poisoned") = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn returns_immediately_when_already_pending() {
        let channel = ClarificationChannel::new();
        channel.send("refocus on tests");
        let text = tokio::time::timeout(Duration::from_millis(50), channel.wait())
            .await
            .unwrap();
        assert_eq!(text.as_deref(), Some("refocus on tests"));
    }

    #[tokio::test]
    async fn parked_waiter_wakes_on_send() {
        let channel = Arc::new(ClarificationChannel::new());
        let waiter = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.wait().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.send("refocus on tests");

        let text = waiter.await.unwrap();
        assert_eq!(text.as_deref(), Some("refocus on tests"));
    }

    #[tokio::test]
    async fn release_wakes_waiter_with_none() {
        let channel = Arc::new(ClarificationChannel::new());
        let waiter = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.wait().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.release();

        let text = waiter.await.unwrap();
        assert_eq!(text, None);
    }
}
