//! Subscriber: a handle around the broadcast socket that delivers decoded
//! events to a callback.
//!
//! Connects, sends the subscribe handshake with a topic prefix, then runs a
//! dedicated task reading `[topic, body]` frame pairs. The prefix is also
//! checked locally, so a subscriber behaves the same against servers that
//! fan out unfiltered.

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::wire::{self, ParameterChange, ParameterEvent, SubscribeRequest};
use crate::Result;

pub struct Subscriber {
    addr: String,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Subscriber {
    /// Connect to `addr` (`host:port` of a broadcast listener), subscribe to
    /// `prefix`, and deliver every matching event to `callback` from a
    /// dedicated task. The empty prefix receives all events.
    pub async fn start<F>(addr: &str, prefix: &str, callback: F) -> Result<Subscriber>
    where
        F: Fn(ParameterEvent) + Send + 'static,
    {
        let mut stream = TcpStream::connect(addr).await?;
        wire::write_json(
            &mut stream,
            &SubscribeRequest {
                subscribe: prefix.to_string(),
            },
        )
        .await?;
        info!("subscribed to '{}' at {}", prefix, addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let prefix = prefix.to_string();
        let task = tokio::spawn(deliver_loop(stream, prefix, callback, shutdown_rx));

        Ok(Subscriber {
            addr: addr.to_string(),
            shutdown_tx,
            task: Some(task),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Close the socket and join the delivery task within a grace period.
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(ServerConfig::SHUTDOWN_GRACE, task)
                .await
                .is_err()
            {
                debug!("subscriber task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn deliver_loop<F>(
    mut stream: TcpStream,
    prefix: String,
    callback: F,
    mut shutdown: watch::Receiver<bool>,
) where
    F: Fn(ParameterEvent) + Send + 'static,
{
    loop {
        let topic = tokio::select! {
            _ = shutdown.changed() => break,
            result = wire::read_frame(&mut stream) => match result {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    debug!("subscriber read failed: {}", e);
                    break;
                }
            },
        };
        let body = match wire::read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("subscriber read failed: {}", e);
                break;
            }
        };

        let topic = match String::from_utf8(topic) {
            Ok(topic) => topic,
            Err(_) => {
                debug!("skipping event with non-UTF-8 topic");
                continue;
            }
        };
        if !topic.starts_with(&prefix) {
            continue;
        }
        match serde_json::from_slice::<ParameterChange>(&body) {
            Ok(change) => callback(ParameterEvent { topic, change }),
            Err(e) => debug!("skipping undecodable event body on '{}': {}", topic, e),
        }
    }
    debug!("subscriber delivery loop ended");
}
