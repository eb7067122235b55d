//! The dispatcher: decode an instruction, route it to a handler, return a
//! response.
//!
//! Operations that address an instrument hold that instrument's lock for the
//! entire handler; operations that address the registry only hold the
//! registry lock. Parameter-change events are published before the
//! instrument lock is released, so a subscriber never observes a reply
//! without its broadcast. Errors raised by instrument code never escape as
//! panics or raw messages; they are classified onto the wire error kinds.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, error};

use crate::broadcast::BroadcastBus;
use crate::registry::Registry;
use crate::wire::{Instruction, Operation, Response};
use crate::{LabrackError, Result};

pub struct Dispatcher {
    registry: Arc<Registry>,
    bus: Arc<BroadcastBus>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, bus: Arc<BroadcastBus>) -> Self {
        Self { registry, bus }
    }

    /// Full decode → handle → encode cycle for one request payload.
    ///
    /// The handler runs on its own task: a panicking driver is caught at
    /// the join and classified as `InstrumentFailure` instead of unwinding
    /// into (and killing) the worker that called here. The instrument lock
    /// is released during the unwind, so the instrument stays serviceable.
    pub async fn dispatch_payload(self: &Arc<Self>, payload: &[u8]) -> Response {
        let instruction: Instruction = match serde_json::from_slice(payload) {
            Ok(instruction) => instruction,
            Err(e) => {
                debug!("malformed request payload: {}", e);
                return Response::failure(
                    crate::wire::ErrorKind::ProtocolError,
                    format!("malformed request: {}", e),
                );
            }
        };

        debug!("dispatching {:?}", instruction.operation);
        let operation = instruction.operation;
        let dispatcher = self.clone();
        let outcome = tokio::spawn(async move { dispatcher.handle(&instruction).await }).await;

        let result = match outcome {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => Err(LabrackError::InstrumentFailure(
                panic_message(join_error.into_panic()),
            )),
            Err(join_error) => Err(LabrackError::Internal(format!(
                "handler task failed: {}",
                join_error
            ))),
        };

        match result {
            Ok(value) => Response::success(value),
            Err(e) => {
                match e.wire_kind() {
                    crate::wire::ErrorKind::Internal => {
                        error!("internal error while handling {:?}: {}", operation, e)
                    }
                    crate::wire::ErrorKind::InstrumentFailure => {
                        error!("instrument failure while handling {:?}: {}", operation, e)
                    }
                    _ => {}
                }
                Response::failure(e.wire_kind(), e.to_string())
            }
        }
    }

    pub async fn handle(&self, instruction: &Instruction) -> Result<Value> {
        match instruction.operation {
            Operation::ListInstruments => Ok(json!(self.registry.list().await)),

            Operation::CreateInstrument => {
                let target = required(&instruction.target, "target")?;
                let class_path = required(&instruction.name, "name (class path)")?;
                let find_or_create =
                    matches!(instruction.value, Some(Value::Bool(true)));
                let args = instruction.args.clone().unwrap_or_default();
                let kwargs = instruction.kwargs.clone().unwrap_or_default();
                let entry = self
                    .registry
                    .create(target, class_path, &args, &kwargs, find_or_create)
                    .await?;
                Ok(json!({ "name": entry.name, "class_path": entry.class_path }))
            }

            Operation::GetBlueprint => {
                let target = required(&instruction.target, "target")?;
                let entry = self.registry.get(target).await?;
                let guard = entry.lock().await;
                let blueprint = guard.describe();
                let node = match instruction.path.as_deref() {
                    Some(path) if !path.is_empty() => blueprint
                        .submodule_at(path)
                        .ok_or_else(|| {
                            LabrackError::NotFound(format!("sub-module '{}.{}'", target, path))
                        })?
                        .clone(),
                    _ => blueprint,
                };
                Ok(serde_json::to_value(node)?)
            }

            Operation::Get => {
                let target = required(&instruction.target, "target")?;
                let param = param_path(instruction)?;
                let entry = self.registry.get(target).await?;
                let mut guard = entry.lock().await;
                guard.read(&param).await
            }

            Operation::Set => {
                let target = required(&instruction.target, "target")?;
                let param = param_path(instruction)?;
                let value = instruction
                    .value
                    .clone()
                    .ok_or_else(|| LabrackError::Protocol("missing field 'value'".into()))?;
                let entry = self.registry.get(target).await?;
                let mut guard = entry.lock().await;
                guard.write(&param, value).await?;
                // Published before the lock drops, so the broadcast precedes
                // the reply.
                for event in guard.drain_events() {
                    self.bus.publish(event);
                }
                Ok(Value::Null)
            }

            Operation::Call => {
                let target = required(&instruction.target, "target")?;
                let method = required(&instruction.name, "name")?;
                let args = instruction.args.clone().unwrap_or_default();
                let kwargs = instruction.kwargs.clone().unwrap_or_else(Map::new);
                let entry = self.registry.get(target).await?;
                let mut guard = entry.lock().await;
                let result = guard.call(method, &args, &kwargs).await?;
                for event in guard.drain_events() {
                    self.bus.publish(event);
                }
                Ok(result)
            }

            Operation::Snapshot => {
                let target = required(&instruction.target, "target")?;
                let entry = self.registry.get(target).await?;
                let guard = entry.lock().await;
                Ok(serde_json::to_value(guard.snapshot())?)
            }
        }
    }
}

/// Driver-supplied panic text, when the payload carries any.
fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "instrument code panicked".to_string()
    }
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str> {
    field
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| LabrackError::Protocol(format!("missing field '{}'", name)))
}

/// Join the optional sub-module path and the parameter name into the dotted
/// path the instrument resolves.
fn param_path(instruction: &Instruction) -> Result<String> {
    let name = required(&instruction.name, "name")?;
    Ok(match instruction.path.as_deref() {
        Some(path) if !path.is_empty() => format!("{}.{}", path, name),
        _ => name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::registry::InstrumentFactory;
    use crate::testing;
    use crate::wire::ErrorKind;

    fn dispatcher() -> Arc<Dispatcher> {
        let registry = Arc::new(Registry::new(InstrumentFactory::with_defaults()));
        let bus = Arc::new(BroadcastBus::new(ServerConfig::LOCAL_FANOUT_CAPACITY));
        Arc::new(Dispatcher::new(registry, bus))
    }

    async fn create_dmm(d: &Dispatcher) {
        d.handle(&Instruction::create_instrument(
            "dmm",
            testing::DUMMY_DMM_CLASS,
            vec![],
            Map::new(),
            true,
        ))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_payload_is_protocol_error() {
        let d = dispatcher();
        let resp = d.dispatch_payload(b"not json at all").await;
        assert!(!resp.ok);
        assert_eq!(resp.error.unwrap().kind, ErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn test_missing_target_is_protocol_error() {
        let d = dispatcher();
        let resp = d
            .dispatch_payload(br#"{"operation": "get", "name": "voltage"}"#)
            .await;
        assert_eq!(resp.error.unwrap().kind, ErrorKind::ProtocolError);
    }

    #[tokio::test]
    async fn test_unknown_instrument_is_not_found() {
        let d = dispatcher();
        let err = d
            .handle(&Instruction::get("ghost", "voltage"))
            .await
            .unwrap_err();
        assert!(matches!(err, LabrackError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_set_then_get_roundtrip() {
        let d = dispatcher();
        create_dmm(&d).await;
        d.handle(&Instruction::set("dmm", "voltage", json!(1.25)))
            .await
            .unwrap();
        let value = d.handle(&Instruction::get("dmm", "voltage")).await.unwrap();
        assert_eq!(value, json!(1.25));
    }

    #[tokio::test]
    async fn test_set_publishes_before_reply() {
        let d = dispatcher();
        create_dmm(&d).await;
        let mut rx = d.bus.subscribe_local();
        d.handle(&Instruction::set("dmm", "voltage", json!(2.5)))
            .await
            .unwrap();
        // The event is already buffered by the time the reply exists.
        let event = rx.try_recv().unwrap();
        assert_eq!(event.topic, "dmm.voltage");
        assert_eq!(event.change.value, json!(2.5));
        assert_eq!(event.change.unit, "V");
    }

    #[tokio::test]
    async fn test_failed_set_emits_no_broadcast() {
        let d = dispatcher();
        create_dmm(&d).await;
        let mut rx = d.bus.subscribe_local();
        let err = d
            .handle(&Instruction::set("dmm", "range", json!(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, LabrackError::Validation(_)));
        assert!(rx.try_recv().is_err());
        // State unchanged.
        let value = d.handle(&Instruction::get("dmm", "range")).await.unwrap();
        assert_eq!(value, json!(1.0));
    }

    #[tokio::test]
    async fn test_snapshot_is_flat() {
        let d = dispatcher();
        create_dmm(&d).await;
        let snap = d.handle(&Instruction::snapshot("dmm")).await.unwrap();
        assert!(snap.get("voltage").is_some());
        assert!(snap.get("trigger.delay").is_some());
    }

    #[tokio::test]
    async fn test_blueprint_submodule_scoping() {
        let d = dispatcher();
        create_dmm(&d).await;
        let mut instruction = Instruction::get_blueprint("dmm");
        instruction.path = Some("trigger".into());
        let bp = d.handle(&instruction).await.unwrap();
        assert_eq!(bp["name"], json!("trigger"));
        assert!(bp["parameters"].get("delay").is_some());
    }

    #[tokio::test]
    async fn test_driver_fault_is_instrument_failure() {
        let d = dispatcher();
        d.handle(&Instruction::create_instrument(
            "flaky",
            testing::DUMMY_FAULTY_CLASS,
            vec![],
            Map::new(),
            true,
        ))
        .await
        .unwrap();

        let err = d
            .handle(&Instruction::call("flaky", "fail", vec![], Map::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, LabrackError::InstrumentFailure(_)));
    }

    #[tokio::test]
    async fn test_driver_panic_is_contained() {
        let d = dispatcher();
        d.handle(&Instruction::create_instrument(
            "flaky",
            testing::DUMMY_FAULTY_CLASS,
            vec![],
            Map::new(),
            true,
        ))
        .await
        .unwrap();

        let payload =
            serde_json::to_vec(&Instruction::call("flaky", "panic", vec![], Map::new())).unwrap();
        let resp = d.dispatch_payload(&payload).await;
        assert!(!resp.ok);
        let err = resp.error.unwrap();
        assert_eq!(err.kind, ErrorKind::InstrumentFailure);
        assert!(err.message.contains("simulated driver crash"));

        // The unwind released the instrument lock and the dispatcher is
        // still fully serviceable.
        let resp = d
            .dispatch_payload(
                &serde_json::to_vec(&Instruction::get("flaky", "status")).unwrap(),
            )
            .await;
        assert!(resp.ok);
        assert_eq!(resp.value.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_call_method() {
        let d = dispatcher();
        create_dmm(&d).await;
        d.handle(&Instruction::set("dmm", "voltage", json!(3.0)))
            .await
            .unwrap();
        d.handle(&Instruction::call("dmm", "reset", vec![], Map::new()))
            .await
            .unwrap();
        let value = d.handle(&Instruction::get("dmm", "voltage")).await.unwrap();
        assert_eq!(value, json!(0.0));
    }
}
