//! Client runtime: the request socket, typed helpers, and the proxy tree.
//!
//! A `Client` owns one connection and pipelines requests strictly: one
//! outstanding request at a time, each awaited with a deadline. On send
//! failure the socket is closed and reopened; after three consecutive
//! failures a `Disconnected` error surfaces. A receive timeout surfaces
//! `Timeout` immediately and drops the socket, so any late reply is
//! discarded with it. An optional exponential-backoff retry envelope wraps
//! whole requests, never the inside of one.
//!
//! # Thread safety
//!
//! The connection is guarded by an async mutex, so a shared `Arc<Client>`
//! serializes concurrent callers instead of corrupting the stream.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::blueprint::InstrumentBlueprint;
use crate::config::NetConfig;
use crate::param::{ParamKind, Validator};
use crate::wire::{self, Instruction, Response};
use crate::{LabrackError, Result};

#[derive(Debug)]
pub struct Client {
    host: String,
    port: u16,
    timeout: std::time::Duration,
    max_retries: u32,
    stream: Mutex<Option<TcpStream>>,
}

impl Client {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: NetConfig::RECV_TIMEOUT,
            max_retries: 0,
            stream: Mutex::new(None),
        }
    }

    /// Deadline for a single reply.
    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Number of whole-request retries with exponential backoff.
    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Send one instruction and await the typed result, applying the retry
    /// envelope around connection-level failures.
    pub async fn ask(&self, instruction: &Instruction) -> Result<Value> {
        let mut attempt = 0u32;
        loop {
            match self.request(instruction).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_retries && e.is_retryable() => {
                    let delay = NetConfig::RETRY_BASE_DELAY * 2u32.saturating_pow(attempt);
                    debug!(
                        "request failed ({}), retrying in {:?} ({}/{})",
                        e,
                        delay,
                        attempt + 1,
                        self.max_retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One request/reply exchange. Reconnects on socket failure, up to the
    /// consecutive-failure limit; a reply timeout surfaces immediately.
    async fn request(&self, instruction: &Instruction) -> Result<Value> {
        let payload = serde_json::to_vec(instruction)?;
        let mut slot = self.stream.lock().await;
        let mut failures = 0u32;

        // One iteration per socket attempt; a fresh socket is opened after
        // every failure until the consecutive-failure limit trips.
        loop {
            let mut fail = |message: String| -> Result<()> {
                failures += 1;
                debug!("{} ({}/{})", message, failures, NetConfig::MAX_CONSECUTIVE_FAILURES);
                if failures >= NetConfig::MAX_CONSECUTIVE_FAILURES {
                    Err(LabrackError::Disconnected(message))
                } else {
                    Ok(())
                }
            };

            if slot.is_none() {
                match tokio::time::timeout(
                    NetConfig::CONNECT_TIMEOUT,
                    TcpStream::connect((self.host.as_str(), self.port)),
                )
                .await
                {
                    Ok(Ok(stream)) => {
                        debug!("connected to {}", self.addr());
                        *slot = Some(stream);
                    }
                    Ok(Err(e)) => {
                        fail(format!("connect to {} failed: {}", self.addr(), e))?;
                        continue;
                    }
                    Err(_) => {
                        fail(format!("connect to {} timed out", self.addr()))?;
                        continue;
                    }
                }
            }
            let Some(stream) = slot.as_mut() else {
                continue;
            };

            if let Err(e) = wire::write_frame(stream, &payload).await {
                *slot = None;
                fail(format!("send failed: {}", e))?;
                continue;
            }

            match tokio::time::timeout(self.timeout, wire::read_frame(stream)).await {
                // The socket goes with the timeout, so a late reply can
                // never be mistaken for the next request's answer.
                Err(_) => {
                    *slot = None;
                    return Err(LabrackError::Timeout(self.timeout));
                }
                Ok(Err(e)) => {
                    *slot = None;
                    fail(format!("receive failed: {}", e))?;
                    continue;
                }
                Ok(Ok(None)) => {
                    *slot = None;
                    fail("server closed the connection".to_string())?;
                    continue;
                }
                Ok(Ok(Some(bytes))) => {
                    let response: Response = serde_json::from_slice(&bytes).map_err(|e| {
                        LabrackError::Protocol(format!("invalid response payload: {}", e))
                    })?;
                    return response.into_result();
                }
            }
        }
    }

    pub async fn list_instruments(&self) -> Result<Vec<String>> {
        let value = self.ask(&Instruction::list_instruments()).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_blueprint(&self, name: &str) -> Result<InstrumentBlueprint> {
        let value = self.ask(&Instruction::get_blueprint(name)).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_param(&self, target: &str, param: &str) -> Result<Value> {
        self.ask(&Instruction::get(target, param)).await
    }

    pub async fn set_param(&self, target: &str, param: &str, value: Value) -> Result<()> {
        self.ask(&Instruction::set(target, param, value)).await?;
        Ok(())
    }

    pub async fn call_method(
        &self,
        target: &str,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        self.ask(&Instruction::call(target, method, args, kwargs))
            .await
    }

    pub async fn snapshot(&self, target: &str) -> Result<BTreeMap<String, Value>> {
        let value = self.ask(&Instruction::snapshot(target)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Mirror an existing server-side instrument.
    pub async fn get_instrument(self: &Arc<Self>, name: &str) -> Result<InstrumentProxy> {
        let blueprint = self.get_blueprint(name).await?;
        Ok(InstrumentProxy::from_blueprint(self.clone(), &blueprint))
    }

    /// Create the instrument if it does not exist yet, then mirror it.
    pub async fn find_or_create_instrument(
        self: &Arc<Self>,
        name: &str,
        class_path: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<InstrumentProxy> {
        self.ask(&Instruction::create_instrument(
            name, class_path, args, kwargs, true,
        ))
        .await?;
        self.get_instrument(name).await
    }
}

/// Client-side mirror of a parameter. Metadata is cached; values are not.
#[derive(Clone, Debug)]
pub struct ParameterProxy {
    client: Arc<Client>,
    target: String,
    pub name: String,
    /// Dotted path within the instrument.
    pub path: String,
    pub kind: ParamKind,
    pub unit: String,
    pub validator: Validator,
    pub gettable: bool,
    pub settable: bool,
}

impl ParameterProxy {
    pub async fn get(&self) -> Result<Value> {
        if !self.gettable {
            return Err(LabrackError::Unsupported(format!(
                "parameter '{}' is not gettable",
                self.path
            )));
        }
        self.client.get_param(&self.target, &self.path).await
    }

    /// Validate against the cached descriptor, then forward. The server
    /// validates again authoritatively.
    pub async fn set(&self, value: Value) -> Result<()> {
        if !self.settable {
            return Err(LabrackError::Unsupported(format!(
                "parameter '{}' is not settable",
                self.path
            )));
        }
        self.validator.check(&value)?;
        self.client.set_param(&self.target, &self.path, value).await
    }
}

/// Client-side mirror of a method.
#[derive(Clone, Debug)]
pub struct MethodProxy {
    client: Arc<Client>,
    target: String,
    pub name: String,
    pub parameters: Vec<String>,
    pub returns: Option<String>,
}

impl MethodProxy {
    pub async fn call(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value> {
        self.client
            .call_method(&self.target, &self.name, args, kwargs)
            .await
    }
}

/// Client-side mirror of an instrument (or sub-module) built from a
/// blueprint. Leaves forward through the shared client; nothing holds live
/// server references.
#[derive(Clone, Debug)]
pub struct InstrumentProxy {
    client: Arc<Client>,
    target: String,
    pub name: String,
    pub parameters: BTreeMap<String, ParameterProxy>,
    pub methods: BTreeMap<String, MethodProxy>,
    pub submodules: BTreeMap<String, InstrumentProxy>,
}

impl InstrumentProxy {
    pub fn from_blueprint(client: Arc<Client>, blueprint: &InstrumentBlueprint) -> Self {
        Self::build(client, &blueprint.name, "", blueprint)
    }

    fn build(
        client: Arc<Client>,
        target: &str,
        prefix: &str,
        blueprint: &InstrumentBlueprint,
    ) -> Self {
        let join = |name: &str| {
            if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{}.{}", prefix, name)
            }
        };

        let parameters = blueprint
            .parameters
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    ParameterProxy {
                        client: client.clone(),
                        target: target.to_string(),
                        name: name.clone(),
                        path: join(name),
                        kind: p.kind,
                        unit: p.unit.clone(),
                        validator: p.validator.clone(),
                        gettable: p.gettable,
                        settable: p.settable,
                    },
                )
            })
            .collect();

        let methods = blueprint
            .methods
            .iter()
            .map(|(name, m)| {
                (
                    name.clone(),
                    MethodProxy {
                        client: client.clone(),
                        target: target.to_string(),
                        name: name.clone(),
                        parameters: m.parameters.clone(),
                        returns: m.returns.clone(),
                    },
                )
            })
            .collect();

        let submodules = blueprint
            .submodules
            .iter()
            .map(|(name, sub)| {
                (
                    name.clone(),
                    Self::build(client.clone(), target, &join(name), sub),
                )
            })
            .collect();

        Self {
            client,
            target: target.to_string(),
            name: blueprint.name.clone(),
            parameters,
            methods,
            submodules,
        }
    }

    /// Look up a parameter proxy by dotted path.
    pub fn parameter(&self, dotted: &str) -> Option<&ParameterProxy> {
        match dotted.split_once('.') {
            Some((module, rest)) => self.submodules.get(module)?.parameter(rest),
            None => self.parameters.get(dotted),
        }
    }

    pub fn method(&self, name: &str) -> Option<&MethodProxy> {
        self.methods.get(name)
    }

    pub fn submodule(&self, name: &str) -> Option<&InstrumentProxy> {
        self.submodules.get(name)
    }

    /// All parameter values, fetched fresh from the server.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, Value>> {
        self.client.snapshot(&self.target).await
    }
}

/// A named namespace of proxies backed by one server. Two stations on the
/// same server keep independent proxy trees but observe the same
/// authoritative state.
pub struct ClientStation {
    pub name: String,
    client: Arc<Client>,
    proxies: HashMap<String, InstrumentProxy>,
}

impl ClientStation {
    pub fn new(name: impl Into<String>, client: Arc<Client>) -> Self {
        Self {
            name: name.into(),
            client,
            proxies: HashMap::new(),
        }
    }

    /// The proxy for a server instrument, built on first use.
    pub async fn instrument(&mut self, name: &str) -> Result<&InstrumentProxy> {
        if !self.proxies.contains_key(name) {
            let proxy = self.client.get_instrument(name).await?;
            info!("station '{}' mirrored instrument '{}'", self.name, name);
            self.proxies.insert(name.to_string(), proxy);
        }
        self.proxies
            .get(name)
            .ok_or_else(|| LabrackError::Internal("proxy cache lookup failed".into()))
    }

    /// Drop the cached proxy so the next use rebuilds it from a fresh
    /// blueprint.
    pub fn forget(&mut self, name: &str) {
        self.proxies.remove(name);
    }

    pub fn cached(&self) -> Vec<String> {
        let mut names: Vec<_> = self.proxies.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastBus;
    use crate::config::ServerConfig;
    use crate::registry::{InstrumentFactory, Registry};
    use crate::server::{ServerSettings, StationServer};
    use crate::testing;
    use serde_json::json;

    async fn start_server() -> crate::server::ServerHandle {
        let registry = Arc::new(Registry::new(InstrumentFactory::with_defaults()));
        let bus = Arc::new(BroadcastBus::new(ServerConfig::LOCAL_FANOUT_CAPACITY));
        StationServer::start(ServerSettings::loopback(), registry, bus)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_to_dead_server_is_disconnected() {
        // Port 1 is never listening.
        let client = Client::new("127.0.0.1", 1);
        let err = client.list_instruments().await.unwrap_err();
        assert!(matches!(err, LabrackError::Disconnected(_)));
    }

    #[tokio::test]
    async fn test_proxy_tree_mirrors_server_shape() {
        let mut handle = start_server().await;
        let client = Arc::new(Client::new("127.0.0.1", handle.addr().port()));

        let dmm = client
            .find_or_create_instrument("dmm", testing::DUMMY_DMM_CLASS, vec![], Map::new())
            .await
            .unwrap();

        let voltage = dmm.parameter("voltage").unwrap();
        assert_eq!(voltage.unit, "V");
        assert!(voltage.settable);
        assert!(dmm.parameter("trigger.delay").is_some());
        assert!(dmm.method("reset").is_some());
        assert!(dmm.submodule("trigger").is_some());

        voltage.set(json!(1.25)).await.unwrap();
        assert_eq!(voltage.get().await.unwrap(), json!(1.25));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_proxy_rejects_locally_validated_values() {
        let mut handle = start_server().await;
        let client = Arc::new(Client::new("127.0.0.1", handle.addr().port()));
        let dmm = client
            .find_or_create_instrument("dmm", testing::DUMMY_DMM_CLASS, vec![], Map::new())
            .await
            .unwrap();

        let range = dmm.parameter("range").unwrap();
        let err = range.set(json!(5)).await.unwrap_err();
        assert!(matches!(err, LabrackError::Validation(_)));
        assert_eq!(range.get().await.unwrap(), json!(1.0));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_station_caches_proxies_independently() {
        let mut handle = start_server().await;
        let client = Arc::new(Client::new("127.0.0.1", handle.addr().port()));
        client
            .find_or_create_instrument("dmm", testing::DUMMY_DMM_CLASS, vec![], Map::new())
            .await
            .unwrap();

        let mut station_a = ClientStation::new("a", client.clone());
        let mut station_b = ClientStation::new("b", client.clone());

        station_a.instrument("dmm").await.unwrap();
        assert_eq!(station_a.cached(), vec!["dmm"]);
        assert!(station_b.cached().is_empty());

        // Both observe the same authoritative value.
        client.set_param("dmm", "voltage", json!(2.0)).await.unwrap();
        let a = station_a.instrument("dmm").await.unwrap();
        let b = station_b.instrument("dmm").await.unwrap();
        assert_eq!(a.parameter("voltage").unwrap().get().await.unwrap(), json!(2.0));
        assert_eq!(b.parameter("voltage").unwrap().get().await.unwrap(), json!(2.0));

        handle.shutdown();
    }
}
