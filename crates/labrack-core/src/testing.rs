//! Dummy instruments for tests, demos, and driver-free deployments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::blueprint::InstrumentBlueprint;
use crate::instrument::{Instrument, InstrumentTree, MethodSpec};
use crate::param::{ParamKind, ParameterCell, Validator};
use crate::registry::InstrumentFactory;
use crate::wire::ParameterEvent;
use crate::{LabrackError, Result};

pub const DUMMY_DMM_CLASS: &str = "labrack.testing.DummyDmm";
pub const DUMMY_SOURCE_CLASS: &str = "labrack.testing.DummySource";
pub const DUMMY_FAULTY_CLASS: &str = "labrack.testing.DummyFaulty";

/// A fake digital multimeter: settable voltage, an enumerated range, a
/// read-only identity string, and a trigger sub-module.
pub struct DummyDmm {
    tree: InstrumentTree,
}

impl DummyDmm {
    pub fn new(name: &str) -> Self {
        let mut tree = InstrumentTree::new(name, DUMMY_DMM_CLASS);
        tree.add_parameter(
            "voltage",
            ParameterCell::new("voltage", ParamKind::Float, json!(0.0)).with_unit("V"),
        )
        .expect("static parameter layout");
        tree.add_parameter(
            "range",
            ParameterCell::new("range", ParamKind::Float, json!(1.0))
                .with_unit("V")
                .with_validator(Validator::Enumeration {
                    allowed: vec![json!(0.1), json!(1), json!(10), json!(100)],
                }),
        )
        .expect("static parameter layout");
        tree.add_parameter(
            "idn",
            ParameterCell::new("idn", ParamKind::String, json!("labrack dummy dmm")).read_only(),
        )
        .expect("static parameter layout");
        tree.add_parameter(
            "trigger.mode",
            ParameterCell::new("mode", ParamKind::Enum, json!("auto")).with_validator(
                Validator::Enumeration {
                    allowed: vec![json!("auto"), json!("single")],
                },
            ),
        )
        .expect("static parameter layout");
        tree.add_parameter(
            "trigger.delay",
            ParameterCell::new("delay", ParamKind::Float, json!(0.0))
                .with_unit("s")
                .with_validator(Validator::Numbers {
                    min: Some(0.0),
                    max: None,
                }),
        )
        .expect("static parameter layout");
        tree.register_method(MethodSpec {
            name: "reset".into(),
            parameters: vec![],
            returns: None,
        });
        tree.register_method(MethodSpec {
            name: "identify".into(),
            parameters: vec![],
            returns: Some("string".into()),
        });
        Self { tree }
    }
}

#[async_trait]
impl Instrument for DummyDmm {
    fn describe(&self) -> InstrumentBlueprint {
        self.tree.describe()
    }

    async fn read(&mut self, path: &str) -> Result<Value> {
        self.tree.read(path)
    }

    async fn write(&mut self, path: &str, value: Value) -> Result<()> {
        self.tree.write(path, value)
    }

    async fn call(
        &mut self,
        name: &str,
        _args: &[Value],
        _kwargs: &Map<String, Value>,
    ) -> Result<Value> {
        match name {
            "reset" => {
                self.tree.write("voltage", json!(0.0))?;
                self.tree.write("range", json!(1.0))?;
                self.tree.write("trigger.mode", json!("auto"))?;
                self.tree.write("trigger.delay", json!(0.0))?;
                Ok(Value::Null)
            }
            "identify" => self.tree.read("idn"),
            other => Err(LabrackError::NotFound(format!("method '{}'", other))),
        }
    }

    fn snapshot(&self) -> BTreeMap<String, Value> {
        self.tree.snapshot()
    }

    fn drain_events(&mut self) -> Vec<ParameterEvent> {
        self.tree.drain_events()
    }
}

/// A fake voltage source with a bounded output and a ramp method.
pub struct DummySource {
    tree: InstrumentTree,
}

impl DummySource {
    pub fn new(name: &str) -> Self {
        let mut tree = InstrumentTree::new(name, DUMMY_SOURCE_CLASS);
        tree.add_parameter(
            "voltage",
            ParameterCell::new("voltage", ParamKind::Float, json!(0.0))
                .with_unit("V")
                .with_validator(Validator::Numbers {
                    min: Some(-10.0),
                    max: Some(10.0),
                }),
        )
        .expect("static parameter layout");
        tree.add_parameter(
            "output_enabled",
            ParameterCell::new("output_enabled", ParamKind::Bool, json!(false)),
        )
        .expect("static parameter layout");
        tree.register_method(MethodSpec {
            name: "ramp".into(),
            parameters: vec!["target".into()],
            returns: Some("float".into()),
        });
        Self { tree }
    }
}

#[async_trait]
impl Instrument for DummySource {
    fn describe(&self) -> InstrumentBlueprint {
        self.tree.describe()
    }

    async fn read(&mut self, path: &str) -> Result<Value> {
        self.tree.read(path)
    }

    async fn write(&mut self, path: &str, value: Value) -> Result<()> {
        self.tree.write(path, value)
    }

    async fn call(
        &mut self,
        name: &str,
        args: &[Value],
        _kwargs: &Map<String, Value>,
    ) -> Result<Value> {
        match name {
            "ramp" => {
                let target = args
                    .first()
                    .and_then(Value::as_f64)
                    .ok_or_else(|| LabrackError::Validation("ramp needs a numeric target".into()))?;
                self.tree.write("voltage", json!(target))?;
                self.tree.read("voltage")
            }
            other => Err(LabrackError::NotFound(format!("method '{}'", other))),
        }
    }

    fn snapshot(&self) -> BTreeMap<String, Value> {
        self.tree.snapshot()
    }

    fn drain_events(&mut self) -> Vec<ParameterEvent> {
        self.tree.drain_events()
    }
}

/// A deliberately misbehaving driver for exercising failure paths: its
/// methods report hardware faults or crash outright, the way a broken VISA
/// backend would.
pub struct DummyFaulty {
    tree: InstrumentTree,
}

impl DummyFaulty {
    pub fn new(name: &str) -> Self {
        let mut tree = InstrumentTree::new(name, DUMMY_FAULTY_CLASS);
        tree.add_parameter(
            "status",
            ParameterCell::new("status", ParamKind::String, json!("ok")).read_only(),
        )
        .expect("static parameter layout");
        tree.register_method(MethodSpec {
            name: "fail".into(),
            parameters: vec![],
            returns: None,
        });
        tree.register_method(MethodSpec {
            name: "panic".into(),
            parameters: vec![],
            returns: None,
        });
        Self { tree }
    }
}

#[async_trait]
impl Instrument for DummyFaulty {
    fn describe(&self) -> InstrumentBlueprint {
        self.tree.describe()
    }

    async fn read(&mut self, path: &str) -> Result<Value> {
        self.tree.read(path)
    }

    async fn write(&mut self, path: &str, value: Value) -> Result<()> {
        self.tree.write(path, value)
    }

    async fn call(
        &mut self,
        name: &str,
        _args: &[Value],
        _kwargs: &Map<String, Value>,
    ) -> Result<Value> {
        match name {
            "fail" => Err(LabrackError::InstrumentFailure(
                "simulated hardware fault: bus timeout".into(),
            )),
            "panic" => panic!("simulated driver crash"),
            other => Err(LabrackError::NotFound(format!("method '{}'", other))),
        }
    }

    fn snapshot(&self) -> BTreeMap<String, Value> {
        self.tree.snapshot()
    }

    fn drain_events(&mut self) -> Vec<ParameterEvent> {
        self.tree.drain_events()
    }
}

/// Register the dummy classes with a factory.
pub fn register(factory: &mut InstrumentFactory) {
    factory.register(DUMMY_DMM_CLASS, |name, _args, _kwargs| {
        Ok(Box::new(DummyDmm::new(name)))
    });
    factory.register(DUMMY_SOURCE_CLASS, |name, _args, _kwargs| {
        Ok(Box::new(DummySource::new(name)))
    });
    factory.register(DUMMY_FAULTY_CLASS, |name, _args, _kwargs| {
        Ok(Box::new(DummyFaulty::new(name)))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dmm_shape() {
        let dmm = DummyDmm::new("dmm");
        let bp = dmm.describe();
        assert_eq!(bp.parameters["voltage"].unit, "V");
        assert!(bp.parameters["voltage"].settable);
        assert!(!bp.parameters["idn"].settable);
        assert!(bp.submodules.contains_key("trigger"));
        assert!(bp.methods.contains_key("reset"));
    }

    #[tokio::test]
    async fn test_dmm_reset_restores_defaults() {
        let mut dmm = DummyDmm::new("dmm");
        dmm.write("voltage", json!(3.3)).await.unwrap();
        dmm.write("trigger.mode", json!("single")).await.unwrap();
        dmm.call("reset", &[], &Map::new()).await.unwrap();
        assert_eq!(dmm.read("voltage").await.unwrap(), json!(0.0));
        assert_eq!(dmm.read("trigger.mode").await.unwrap(), json!("auto"));
    }

    #[tokio::test]
    async fn test_faulty_reports_instrument_failure() {
        let mut faulty = DummyFaulty::new("flaky");
        let err = faulty.call("fail", &[], &Map::new()).await.unwrap_err();
        match err {
            LabrackError::InstrumentFailure(msg) => assert!(msg.contains("bus timeout")),
            other => panic!("expected InstrumentFailure, got {:?}", other),
        }
        assert_eq!(faulty.read("status").await.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_source_ramp_clamps_to_validator() {
        let mut source = DummySource::new("src");
        let reached = source.call("ramp", &[json!(2.5)], &Map::new()).await.unwrap();
        assert_eq!(reached, json!(2.5));

        let err = source
            .call("ramp", &[json!(50.0)], &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LabrackError::Validation(_)));
        assert_eq!(source.read("voltage").await.unwrap(), json!(2.5));
    }
}
