//! Broadcast bus: fan-out of parameter-change events.
//!
//! Every successful mutation is published here by the dispatcher while it
//! still holds the instrument lock. In-process listeners (monitoring
//! widgets, pollers' consumers, tests) subscribe through a
//! `tokio::sync::broadcast` mirror; remote subscribers are attached by the
//! server's broadcast listener with a topic prefix and a bounded queue.
//!
//! Publication is non-blocking and best-effort: a full subscriber queue
//! drops the event rather than stalling the handler.

use std::sync::Mutex;

use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::wire::ParameterEvent;

struct RemoteSink {
    prefix: String,
    tx: mpsc::Sender<ParameterEvent>,
}

pub struct BroadcastBus {
    local: broadcast::Sender<ParameterEvent>,
    remotes: Mutex<Vec<RemoteSink>>,
}

impl BroadcastBus {
    pub fn new(local_capacity: usize) -> Self {
        let (local, _) = broadcast::channel(local_capacity);
        Self {
            local,
            remotes: Mutex::new(Vec::new()),
        }
    }

    /// Publish one event to every in-process and remote subscriber whose
    /// prefix matches. Never blocks.
    pub fn publish(&self, event: ParameterEvent) {
        // No local receiver is fine; the send result only reports that.
        let _ = self.local.send(event.clone());

        let mut remotes = match self.remotes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        remotes.retain(|sink| !sink.tx.is_closed());
        for sink in remotes.iter() {
            if !event.topic.starts_with(&sink.prefix) {
                continue;
            }
            match sink.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    debug!(
                        "subscriber queue full, dropping event for topic '{}'",
                        event.topic
                    );
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Subscribe from within the process.
    pub fn subscribe_local(&self) -> broadcast::Receiver<ParameterEvent> {
        self.local.subscribe()
    }

    /// Attach a remote subscriber with a topic prefix. The returned receiver
    /// is fed best-effort through a queue of the given depth.
    pub fn attach(&self, prefix: impl Into<String>, queue: usize) -> mpsc::Receiver<ParameterEvent> {
        let (tx, rx) = mpsc::channel(queue);
        let mut remotes = match self.remotes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        remotes.push(RemoteSink {
            prefix: prefix.into(),
            tx,
        });
        rx
    }

    #[cfg(test)]
    fn remote_count(&self) -> usize {
        self.remotes.lock().unwrap().len()
    }
}
