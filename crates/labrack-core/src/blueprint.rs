//! Blueprints: transport-safe descriptions of an instrument's shape.
//!
//! A blueprint carries enough metadata for a client to build a faithful
//! proxy tree (paths, units, validator descriptors, flags, nesting) but no
//! current values and no live references back to the server. Construction
//! walks the tree depth-first; `BTreeMap` ordering makes the walk
//! alphabetical and therefore stable for a given instrument shape.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::instrument::{MethodSpec, ModuleNode};
use crate::param::{ParamKind, Validator};

/// Spec necessary for creating a parameter proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterBlueprint {
    pub name: String,
    /// Fully qualified dotted path, instrument name first.
    pub path: String,
    pub kind: ParamKind,
    pub unit: String,
    pub validator: Validator,
    pub gettable: bool,
    pub settable: bool,
}

/// Spec necessary for creating a method proxy. Reflection records the
/// declared parameter names; it never executes the method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodBlueprint {
    pub name: String,
    pub path: String,
    pub parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<String>,
}

/// Spec necessary for creating an instrument proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentBlueprint {
    pub name: String,
    pub path: String,
    pub class_path: String,
    pub parameters: BTreeMap<String, ParameterBlueprint>,
    pub methods: BTreeMap<String, MethodBlueprint>,
    pub submodules: BTreeMap<String, InstrumentBlueprint>,
}

impl InstrumentBlueprint {
    /// Descend into the sub-module at a dotted path. The empty path returns
    /// the node itself.
    pub fn submodule_at(&self, dotted: &str) -> Option<&InstrumentBlueprint> {
        if dotted.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for part in dotted.split('.') {
            node = node.submodules.get(part)?;
        }
        Some(node)
    }

    /// Look up a parameter blueprint by dotted path within the instrument.
    pub fn parameter_at(&self, dotted: &str) -> Option<&ParameterBlueprint> {
        match dotted.rsplit_once('.') {
            Some((module, name)) => self.submodule_at(module)?.parameters.get(name),
            None => self.parameters.get(dotted),
        }
    }

    /// Unit of a parameter, if it exists.
    pub fn unit_of(&self, dotted: &str) -> Option<String> {
        self.parameter_at(dotted).map(|p| p.unit.clone())
    }
}

/// Reflect a module node (and its method table, at the root) into a
/// blueprint. `path` is the fully qualified dotted path of the node.
pub(crate) fn from_node(
    name: &str,
    path: &str,
    class_path: &str,
    node: &ModuleNode,
    methods: &BTreeMap<String, MethodSpec>,
) -> InstrumentBlueprint {
    let parameters = node
        .parameters
        .iter()
        .map(|(pname, cell)| {
            (
                pname.clone(),
                ParameterBlueprint {
                    name: pname.clone(),
                    path: format!("{}.{}", path, pname),
                    kind: cell.kind,
                    unit: cell.unit.clone(),
                    validator: cell.validator.clone(),
                    gettable: cell.gettable,
                    settable: cell.settable,
                },
            )
        })
        .collect();

    let methods = methods
        .iter()
        .map(|(mname, spec)| {
            (
                mname.clone(),
                MethodBlueprint {
                    name: mname.clone(),
                    path: format!("{}.{}", path, mname),
                    parameters: spec.parameters.clone(),
                    returns: spec.returns.clone(),
                },
            )
        })
        .collect();

    let submodules = node
        .submodules
        .iter()
        .map(|(sname, sub)| {
            let sub_path = format!("{}.{}", path, sname);
            (
                sname.clone(),
                from_node(sname, &sub_path, class_path, sub, &BTreeMap::new()),
            )
        })
        .collect();

    InstrumentBlueprint {
        name: name.to_string(),
        path: path.to_string(),
        class_path: class_path.to_string(),
        parameters,
        methods,
        submodules,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::InstrumentTree;
    use crate::param::ParameterCell;
    use serde_json::json;

    fn sample_tree() -> InstrumentTree {
        let mut tree = InstrumentTree::new("dmm", "labrack.testing.DummyDmm");
        tree.add_parameter(
            "voltage",
            ParameterCell::new("voltage", ParamKind::Float, json!(0.0)).with_unit("V"),
        )
        .unwrap();
        tree.add_parameter(
            "trigger.delay",
            ParameterCell::new("delay", ParamKind::Float, json!(0.0)).with_unit("s"),
        )
        .unwrap();
        tree.register_method(MethodSpec {
            name: "reset".into(),
            parameters: vec![],
            returns: None,
        });
        tree
    }

    #[test]
    fn test_blueprint_paths_are_fully_qualified() {
        let bp = sample_tree().describe();
        assert_eq!(bp.parameters["voltage"].path, "dmm.voltage");
        assert_eq!(
            bp.submodules["trigger"].parameters["delay"].path,
            "dmm.trigger.delay"
        );
        assert_eq!(bp.methods["reset"].path, "dmm.reset");
    }

    #[test]
    fn test_blueprint_lookup_helpers() {
        let bp = sample_tree().describe();
        assert!(bp.parameter_at("voltage").is_some());
        assert!(bp.parameter_at("trigger.delay").is_some());
        assert!(bp.parameter_at("trigger.missing").is_none());
        assert_eq!(bp.unit_of("trigger.delay").as_deref(), Some("s"));
    }

    #[test]
    fn test_blueprint_is_deterministic() {
        let a = serde_json::to_string(&sample_tree().describe()).unwrap();
        let b = serde_json::to_string(&sample_tree().describe()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_blueprint_roundtrip() {
        let bp = sample_tree().describe();
        let text = serde_json::to_string(&bp).unwrap();
        let back: InstrumentBlueprint = serde_json::from_str(&text).unwrap();
        assert_eq!(back, bp);
    }
}
