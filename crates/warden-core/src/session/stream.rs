//! Response-stream fan-out, with a replay buffer for late-attaching sinks.
//!
//! Every part a worker's turn produces is forwarded to: the attached UI
//! sink (if any), every subscriber's event channel, the conversation log
//! (via the caller's debounced flush), and — only while no sink is attached
//! — a bounded replay buffer that is drained into the next attached sink.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    StreamStart,
    StreamPart { text: String },
    StreamEnd,
    Warning { message: String },
}

/// The external UI host (out of scope; seen only through this seam).
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn send(&self, event: StreamEvent) -> anyhow::Result<()>;
}

const DEFAULT_REPLAY_CAPACITY: usize = 1024;

struct ReplayBuffer {
    events: VecDeque<StreamEvent>,
    capacity: usize,
    truncated: bool,
}

impl ReplayBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            truncated: false,
        }
    }

    fn push(&mut self, event: StreamEvent) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
            self.truncated = true;
        }
        self.events.push_back(event);
    }

    fn drain(&mut self) -> Vec<StreamEvent> {
        let mut out: Vec<StreamEvent> = self.events.drain(..).collect();
        if self.truncated {
            out.push(StreamEvent::Warning {
                message: "response stream buffer overflowed; earlier parts were dropped".into(),
            });
            self.truncated = false;
        }
        out
    }
}

pub struct FanOutStream {
    sink: Mutex<Option<Arc<dyn ResponseSink>>>,
    subscribers: Mutex<Vec<mpsc::Sender<StreamEvent>>>,
    replay: Mutex<ReplayBuffer>,
}

impl Default for FanOutStream {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_CAPACITY)
    }
}

impl FanOutStream {
    pub fn new(replay_capacity: usize) -> Self {
        Self {
            sink: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            replay: Mutex::new(ReplayBuffer::new(replay_capacity)),
        }
    }

    /// Attach a real sink, draining and clearing the replay buffer into it
    /// in emission order.
    pub async fn attach_stream(&self, sink: Arc<dyn ResponseSink>) {
        let buffered = self.replay.lock().await.drain();
        for event in buffered {
            if let Err(e) = sink.send(event).await {
                warn!(error = %e, "replay to newly attached sink failed");
            }
        }
        *self.sink.lock().await = Some(sink);
    }

    pub async fn detach_stream(&self) {
        *self.sink.lock().await = None;
    }

    pub async fn subscribe(&self, buffer: usize) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(buffer);
        self.subscribers.lock().await.push(tx);
        rx
    }

    pub async fn emit(&self, event: StreamEvent) {
        {
            let subscribers = self.subscribers.lock().await;
            for sub in subscribers.iter() {
                let _ = sub.try_send(event.clone());
            }
        }

        let sink = self.sink.lock().await.clone();
        match sink {
            Some(sink) => {
                if let Err(e) = sink.send(event).await {
                    warn!(error = %e, "response sink send failed");
                }
            }
            None => self.replay.lock().await.push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as TokioMutex;

    struct RecordingSink {
        events: Arc<TokioMutex<Vec<StreamEvent>>>,
    }

    #[async_trait]
    impl ResponseSink for RecordingSink {
        async fn send(&self, event: StreamEvent) -> anyhow::Result<()> {
            self.events.lock().await.push(event);
            Ok(())
        }
    }

    #[tokio::test]
    async fn buffered_parts_replay_in_order_on_attach() {
        let stream = FanOutStream::default();
        stream.emit(StreamEvent::StreamStart).await;
        stream
            .emit(StreamEvent::StreamPart { text: "a".into() })
            .await;
        stream
            .emit(StreamEvent::StreamPart { text: "b".into() })
            .await;

        let events = Arc::new(TokioMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink {
            events: events.clone(),
        });
        stream.attach_stream(sink).await;

        let recorded = events.lock().await;
        assert_eq!(recorded.len(), 3);
        assert!(matches!(recorded[0], StreamEvent::StreamStart));
    }

    #[tokio::test]
    async fn attached_sink_receives_live_events_directly() {
        let stream = FanOutStream::default();
        let events = Arc::new(TokioMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink {
            events: events.clone(),
        });
        stream.attach_stream(sink).await;

        stream.emit(StreamEvent::StreamEnd).await;
        assert_eq!(events.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn overflow_appends_truncation_warning() {
        let stream = FanOutStream::new(2);
        for i in 0..5 {
            stream
                .emit(StreamEvent::StreamPart { text: i.to_string() })
                .await;
        }

        let events = Arc::new(TokioMutex::new(Vec::new()));
        let sink = Arc::new(RecordingSink {
            events: events.clone(),
        });
        stream.attach_stream(sink).await;

        let recorded = events.lock().await;
        assert_eq!(recorded.len(), 3); // 2 retained parts + 1 warning
        assert!(matches!(recorded.last(), Some(StreamEvent::Warning { .. })));
    }
}
