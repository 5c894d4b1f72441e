//! Process-wide operational events for the observability collaborator.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::{broadcast, RwLock};

#[derive(Debug, Clone)]
pub struct UpstreamErrorEvent {
    pub at: SystemTime,
    pub trace_id: String,
    pub account_id: i64,
    pub platform: String,
    pub status: u16,
    /// The status was outside the account's handled set and was forwarded
    /// to the client untouched.
    pub passthrough: bool,
    pub action: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct AccountHealthEvent {
    pub at: SystemTime,
    pub account_id: i64,
    pub schedulable: bool,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum Event {
    UpstreamError(UpstreamErrorEvent),
    AccountHealth(AccountHealthEvent),
}

pub trait EventSink: Send + Sync {
    fn write<'a>(&'a self, event: &'a Event) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Event>,
    sinks: RwLock<Vec<Arc<dyn EventSink>>>,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(Inner {
                tx,
                sinks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub async fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.inner.sinks.write().await.push(sink);
    }

    pub async fn emit(&self, event: Event) {
        let _ = self.inner.tx.send(event.clone());
        let sinks = self.inner.sinks.read().await.clone();
        for sink in sinks {
            let event = event.clone();
            tokio::spawn(async move {
                sink.write(&event).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let hub = EventHub::new(8);
        let mut rx = hub.subscribe();
        hub.emit(Event::AccountHealth(AccountHealthEvent {
            at: SystemTime::now(),
            account_id: 7,
            schedulable: false,
            reason: "rate_limited".to_string(),
        }))
        .await;
        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event,
            Event::AccountHealth(AccountHealthEvent { account_id: 7, .. })
        ));
    }
}
