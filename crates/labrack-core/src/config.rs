//! Centralized configuration constants for labrack.

use std::time::Duration;

/// Networking defaults shared by server and client.
pub struct NetConfig;

impl NetConfig {
    /// Default request port. The broadcast listener defaults to this plus
    /// [`NetConfig::BROADCAST_PORT_OFFSET`]; the offset is a convention, the
    /// broadcast port itself is an explicit setting.
    pub const DEFAULT_PORT: u16 = 5555;
    pub const BROADCAST_PORT_OFFSET: u16 = 1;

    /// Upper bound on a single wire frame.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Deadline for a single reply.
    pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Consecutive socket failures before a request surfaces `Disconnected`.
    pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

    /// Base delay of the exponential backoff applied at the `Client` layer.
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
}

/// Server-side tunables.
pub struct ServerConfig;

impl ServerConfig {
    /// Size of the bounded worker pool.
    pub const WORKER_POOL_SIZE: usize = 5;

    /// Depth of the queue between connection readers and the worker pool.
    pub const REQUEST_QUEUE: usize = 64;

    /// Per-subscriber event queue; events are dropped when it is full.
    pub const SUBSCRIBER_QUEUE: usize = 256;

    /// Capacity of the in-process broadcast mirror.
    pub const LOCAL_FANOUT_CAPACITY: usize = 1024;

    /// Grace period when joining background tasks on shutdown.
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

    /// Reconnect delay for the outbound external-broadcast forwarder.
    pub const EXTERNAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
}
