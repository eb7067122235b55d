//! The station server: request transport, worker pool, broadcast listener.
//!
//! One process-wide server owns the inbound request listeners (the only
//! sockets that read client bytes) and the broadcast listener (write-only
//! after the subscribe handshake). Each accepted request connection is a
//! client identity: its read half feeds the bounded worker pool, its write
//! half is a serialized reply queue, so replies always reach the connection
//! that sent the request and identities never outlive the connection.
//!
//! # Thread safety
//!
//! Workers share one job queue behind an async mutex and are the only
//! callers into instrument code. Per-instrument exclusion lives in the
//! registry entries; the bus is lock-free for publishers apart from a short
//! critical section around the subscriber list.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broadcast::BroadcastBus;
use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::registry::Registry;
use crate::wire::{self, epoch_seconds, ParameterChange, ParameterEvent, SubscribeRequest};
use crate::{LabrackError, Result};

/// A parameter polled in the background and published at a fixed interval.
#[derive(Debug, Clone)]
pub struct PollEntry {
    pub instrument: String,
    pub parameter: String,
    pub interval: Duration,
}

/// Everything needed to start a server.
pub struct ServerSettings {
    /// Request listener addresses; the first is the primary.
    pub bind: Vec<SocketAddr>,
    /// Broadcast listener address. Conventionally the request port plus one,
    /// but always explicit.
    pub broadcast_bind: SocketAddr,
    /// Optional `host:port` an outbound forwarder streams every event to.
    pub external_broadcast: Option<String>,
    /// Worker pool size.
    pub workers: usize,
    /// Background parameter polling.
    pub polling: Vec<PollEntry>,
}

impl ServerSettings {
    pub fn new(bind: SocketAddr, broadcast_bind: SocketAddr) -> Self {
        Self {
            bind: vec![bind],
            broadcast_bind,
            external_broadcast: None,
            workers: ServerConfig::WORKER_POOL_SIZE,
            polling: Vec::new(),
        }
    }

    /// Loopback settings with OS-assigned ports, for tests.
    pub fn loopback() -> Self {
        Self::new(
            "127.0.0.1:0".parse().expect("static address"),
            "127.0.0.1:0".parse().expect("static address"),
        )
    }

    pub fn with_extra_bind(mut self, addr: SocketAddr) -> Self {
        self.bind.push(addr);
        self
    }

    pub fn with_external_broadcast(mut self, addr: impl Into<String>) -> Self {
        self.external_broadcast = Some(addr.into());
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_polling(mut self, polling: Vec<PollEntry>) -> Self {
        self.polling = polling;
        self
    }
}

/// Handle to a running server. Dropping shuts it down.
pub struct ServerHandle {
    pub addrs: Vec<SocketAddr>,
    pub broadcast_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// The primary request address.
    pub fn addr(&self) -> SocketAddr {
        self.addrs[0]
    }

    /// Stop accepting, signal all connections, workers, and background
    /// tasks.
    pub fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct Job {
    payload: Vec<u8>,
    reply: mpsc::Sender<Vec<u8>>,
    peer: SocketAddr,
}

pub struct StationServer;

impl StationServer {
    /// Bind the listeners and spawn the server's tasks.
    ///
    /// The registry, worker pool, and bus are passed in explicitly; there is
    /// no process-wide state behind this function.
    pub async fn start(
        settings: ServerSettings,
        registry: Arc<Registry>,
        bus: Arc<BroadcastBus>,
    ) -> Result<ServerHandle> {
        if settings.bind.is_empty() {
            return Err(LabrackError::Config {
                message: "no bind address configured".into(),
            });
        }

        let mut listeners = Vec::new();
        let mut addrs = Vec::new();
        for addr in &settings.bind {
            let listener = TcpListener::bind(addr).await.map_err(|e| LabrackError::Io {
                message: format!("failed to bind {}", addr),
                path: None,
                source: Some(e),
            })?;
            addrs.push(listener.local_addr()?);
            listeners.push(listener);
        }
        let broadcast_listener =
            TcpListener::bind(settings.broadcast_bind)
                .await
                .map_err(|e| LabrackError::Io {
                    message: format!("failed to bind {}", settings.broadcast_bind),
                    path: None,
                    source: Some(e),
                })?;
        let broadcast_addr = broadcast_listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (job_tx, job_rx) = mpsc::channel::<Job>(ServerConfig::REQUEST_QUEUE);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), bus.clone()));

        let mut tasks = Vec::new();
        for worker_id in 0..settings.workers.max(1) {
            tasks.push(tokio::spawn(worker_loop(
                worker_id,
                job_rx.clone(),
                dispatcher.clone(),
                shutdown_rx.clone(),
            )));
        }
        for listener in listeners {
            tasks.push(tokio::spawn(accept_loop(
                listener,
                job_tx.clone(),
                shutdown_rx.clone(),
            )));
        }
        tasks.push(tokio::spawn(broadcast_accept_loop(
            broadcast_listener,
            bus.clone(),
            shutdown_rx.clone(),
        )));
        if let Some(target) = settings.external_broadcast.clone() {
            tasks.push(tokio::spawn(external_forwarder(
                target,
                bus.clone(),
                shutdown_rx.clone(),
            )));
        }
        for entry in settings.polling {
            tasks.push(tokio::spawn(poll_parameter(
                entry,
                registry.clone(),
                bus.clone(),
                shutdown_rx.clone(),
            )));
        }

        info!(
            "server listening on {:?}, broadcasting on {}",
            addrs, broadcast_addr
        );

        Ok(ServerHandle {
            addrs,
            broadcast_addr,
            shutdown_tx,
            tasks,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    jobs: mpsc::Sender<Job>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("client connected from {}", peer);
                    let jobs = jobs.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, jobs, shutdown).await {
                            debug!("connection {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => error!("accept error: {}", e),
            }
        }
    }
}

/// Read frames from one client and queue them on the worker pool. The write
/// half is drained by a dedicated task so workers can finish replies in any
/// order across connections without interleaving bytes within one.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    jobs: mpsc::Sender<Job>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<Vec<u8>>(16);

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = reply_rx.recv().await {
            if wire::write_frame(&mut writer, &bytes).await.is_err() {
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            result = wire::read_frame(&mut reader) => match result? {
                Some(frame) => frame,
                None => break,
            },
        };
        let job = Job {
            payload: frame,
            reply: reply_tx.clone(),
            peer,
        };
        if jobs.send(job).await.is_err() {
            break;
        }
    }

    // Let in-flight replies flush; the writer ends once the queued jobs have
    // dropped their senders.
    drop(reply_tx);
    let _ = writer_task.await;
    Ok(())
}

async fn worker_loop(
    worker_id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Job>>>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = {
            let mut queue = queue.lock().await;
            tokio::select! {
                _ = shutdown.changed() => None,
                job = queue.recv() => job,
            }
        };
        let Some(job) = job else { break };

        // The dispatcher contains driver panics behind its own task
        // boundary, so a misbehaving instrument cannot kill this worker.
        let response = dispatcher.dispatch_payload(&job.payload).await;
        let bytes = match serde_json::to_vec(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to encode response: {}", e);
                continue;
            }
        };
        if job.reply.send(bytes).await.is_err() {
            debug!("client {} went away before its reply", job.peer);
        }
    }
    debug!("worker {} stopped", worker_id);
}

async fn broadcast_accept_loop(
    listener: TcpListener,
    bus: Arc<BroadcastBus>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let bus = bus.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = subscriber_connection(stream, peer, bus, shutdown).await {
                            debug!("subscriber {} ended: {}", peer, e);
                        }
                    });
                }
                Err(e) => error!("broadcast accept error: {}", e),
            }
        }
    }
}

/// Serve one subscriber: read the subscribe handshake, then stream matching
/// events until the peer disconnects or the server shuts down.
async fn subscriber_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    bus: Arc<BroadcastBus>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let Some(frame) = wire::read_frame(&mut stream).await? else {
        return Ok(());
    };
    let request: SubscribeRequest = serde_json::from_slice(&frame)
        .map_err(|e| LabrackError::Protocol(format!("invalid subscribe frame: {}", e)))?;
    debug!("subscriber {} filtering on '{}'", peer, request.subscribe);

    let mut events = bus.attach(request.subscribe, ServerConfig::SUBSCRIBER_QUEUE);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                write_event(&mut stream, &event).await?;
            }
        }
    }
    Ok(())
}

/// Encode one event as its two frames: raw topic bytes, then the JSON body.
pub(crate) async fn write_event<W>(writer: &mut W, event: &ParameterEvent) -> Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
{
    wire::write_frame(writer, event.topic.as_bytes()).await?;
    wire::write_json(writer, &event.change).await
}

/// Dial a fixed external address and stream every event to it, reconnecting
/// with a delay. The remote end receives the same two-frame encoding as a
/// subscriber, without a handshake.
async fn external_forwarder(
    target: String,
    bus: Arc<BroadcastBus>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match TcpStream::connect(&target).await {
            Ok(mut stream) => {
                info!("forwarding broadcasts to {}", target);
                let mut events = bus.attach("", ServerConfig::SUBSCRIBER_QUEUE);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => return,
                        event = events.recv() => {
                            let Some(event) = event else { return };
                            if let Err(e) = write_event(&mut stream, &event).await {
                                warn!("external broadcast to {} failed: {}", target, e);
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => debug!("external broadcast target {} unreachable: {}", target, e),
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(ServerConfig::EXTERNAL_RECONNECT_DELAY) => {}
        }
    }
}

/// Periodically read one parameter under its instrument lock and publish the
/// value, so slow-moving hardware state reaches subscribers without client
/// traffic.
async fn poll_parameter(
    poll: PollEntry,
    registry: Arc<Registry>,
    bus: Arc<BroadcastBus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let topic = format!("{}.{}", poll.instrument, poll.parameter);

    let unit = match registry.get(&poll.instrument).await {
        Ok(entry) => {
            let guard = entry.lock().await;
            guard.describe().unit_of(&poll.parameter).unwrap_or_default()
        }
        Err(e) => {
            warn!("poller for '{}' disabled: {}", topic, e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(poll.interval) => {}
        }
        let Ok(entry) = registry.get(&poll.instrument).await else {
            debug!("poller: instrument '{}' is gone", poll.instrument);
            break;
        };
        let mut guard = entry.lock().await;
        match guard.read(&poll.parameter).await {
            Ok(value) => bus.publish(ParameterEvent {
                topic: topic.clone(),
                change: ParameterChange {
                    value,
                    unit: unit.clone(),
                    ts: epoch_seconds(),
                    action: None,
                },
            }),
            Err(e) => debug!("poll of '{}' failed: {}", topic, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InstrumentFactory;
    use crate::testing;
    use crate::wire::{Instruction, Response};
    use serde_json::json;

    async fn start_test_server() -> (ServerHandle, Arc<Registry>, Arc<BroadcastBus>) {
        let registry = Arc::new(Registry::new(InstrumentFactory::with_defaults()));
        let bus = Arc::new(BroadcastBus::new(ServerConfig::LOCAL_FANOUT_CAPACITY));
        let handle = StationServer::start(ServerSettings::loopback(), registry.clone(), bus.clone())
            .await
            .unwrap();
        (handle, registry, bus)
    }

    async fn roundtrip(stream: &mut TcpStream, instruction: &Instruction) -> Response {
        wire::write_json(stream, instruction).await.unwrap();
        let bytes = wire::read_frame(stream).await.unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_request_reply_over_socket() {
        let (mut handle, _registry, _bus) = start_test_server().await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let resp = roundtrip(&mut stream, &Instruction::list_instruments()).await;
        assert!(resp.ok);
        assert_eq!(resp.value.unwrap(), json!([]));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_pipelined_requests_on_one_connection() {
        let (mut handle, _registry, _bus) = start_test_server().await;
        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();

        let create = Instruction::create_instrument(
            "dmm",
            testing::DUMMY_DMM_CLASS,
            vec![],
            serde_json::Map::new(),
            true,
        );
        assert!(roundtrip(&mut stream, &create).await.ok);
        assert!(
            roundtrip(&mut stream, &Instruction::set("dmm", "voltage", json!(1.25)))
                .await
                .ok
        );
        let resp = roundtrip(&mut stream, &Instruction::get("dmm", "voltage")).await;
        assert_eq!(resp.value.unwrap(), json!(1.25));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_subscriber_handshake_and_event() {
        let (mut handle, _registry, bus) = start_test_server().await;

        let mut sub = TcpStream::connect(handle.broadcast_addr).await.unwrap();
        wire::write_json(
            &mut sub,
            &SubscribeRequest {
                subscribe: "dmm.".into(),
            },
        )
        .await
        .unwrap();
        // Give the server a moment to register the subscription.
        tokio::time::sleep(Duration::from_millis(50)).await;

        bus.publish(ParameterEvent {
            topic: "dmm.voltage".into(),
            change: ParameterChange {
                value: json!(1.0),
                unit: "V".into(),
                ts: 0.0,
                action: None,
            },
        });

        let topic = wire::read_frame(&mut sub).await.unwrap().unwrap();
        assert_eq!(String::from_utf8(topic).unwrap(), "dmm.voltage");
        let body = wire::read_frame(&mut sub).await.unwrap().unwrap();
        let change: ParameterChange = serde_json::from_slice(&body).unwrap();
        assert_eq!(change.value, json!(1.0));

        handle.shutdown();
    }
}
