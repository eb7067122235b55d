//! labrack-core - Library for serving laboratory instruments over the
//! network.
//!
//! A labrack server exposes long-lived instrument objects (trees of typed,
//! validated parameters, callable methods, and nested sub-modules) to many
//! concurrent clients over a framed TCP request socket, and publishes every
//! parameter change on a second, broadcast socket. The client runtime
//! mirrors the server: a pipelined request client, proxy trees built from
//! blueprints, and a subscriber handle for the broadcast stream.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use labrack_core::{
//!     BroadcastBus, Client, InstrumentFactory, Registry, ServerSettings, StationServer,
//! };
//!
//! #[tokio::main]
//! async fn main() -> labrack_core::Result<()> {
//!     let registry = Arc::new(Registry::new(InstrumentFactory::with_defaults()));
//!     let bus = Arc::new(BroadcastBus::new(1024));
//!     let handle = StationServer::start(ServerSettings::loopback(), registry, bus).await?;
//!
//!     let client = Arc::new(Client::new("127.0.0.1", handle.addr().port()));
//!     let dmm = client
//!         .find_or_create_instrument(
//!             "dmm",
//!             "labrack.testing.DummyDmm",
//!             vec![],
//!             serde_json::Map::new(),
//!         )
//!         .await?;
//!     dmm.parameter("voltage").unwrap().set(1.25.into()).await?;
//!     Ok(())
//! }
//! ```

pub mod blueprint;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod instrument;
pub mod param;
pub mod params;
pub mod profile;
pub mod registry;
pub mod server;
pub mod startup;
pub mod subscriber;
pub mod testing;
pub mod wire;

// Re-export commonly used types
pub use blueprint::{InstrumentBlueprint, MethodBlueprint, ParameterBlueprint};
pub use broadcast::BroadcastBus;
pub use client::{Client, ClientStation, InstrumentProxy, MethodProxy, ParameterProxy};
pub use dispatch::Dispatcher;
pub use error::{LabrackError, Result};
pub use instrument::{Instrument, InstrumentTree, MethodSpec};
pub use param::{ParamKind, ParameterCell, Validator};
pub use params::ParameterManager;
pub use registry::{InstrumentFactory, InstrumentEntry, Registry};
pub use server::{PollEntry, ServerHandle, ServerSettings, StationServer};
pub use startup::StartupConfig;
pub use subscriber::Subscriber;
pub use wire::{
    ErrorKind, Instruction, Operation, ParameterChange, ParameterEvent, Response, SubscribeRequest,
};
