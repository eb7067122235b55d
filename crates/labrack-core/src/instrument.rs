//! The instrument capability interface and the generic tree it is usually
//! backed by.
//!
//! The dispatcher depends only on the [`Instrument`] trait: describe the
//! tree, read/write parameters by dotted path, invoke named methods, and
//! hand over recorded parameter-change events. Drivers implement this trait;
//! nothing in the server knows any concrete hardware.
//!
//! [`InstrumentTree`] is the in-memory building block most implementations
//! wrap: nested modules of [`ParameterCell`]s plus a method table. Mutation
//! happens only while the owning instrument's lock is held (the registry
//! enforces that), so the tree itself carries no synchronization.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::blueprint::{self, InstrumentBlueprint};
use crate::param::ParameterCell;
use crate::wire::{epoch_seconds, ParameterChange, ParameterEvent};
use crate::{LabrackError, Result};

/// Capability interface every served instrument satisfies.
#[async_trait]
pub trait Instrument: Send {
    /// Transportable description of the tree. Built under the instrument
    /// lock so it observes a consistent snapshot.
    fn describe(&self) -> InstrumentBlueprint;

    /// Read the parameter at a dotted path.
    async fn read(&mut self, path: &str) -> Result<Value>;

    /// Validate and write the parameter at a dotted path.
    async fn write(&mut self, path: &str, value: Value) -> Result<()>;

    /// Invoke a named method.
    async fn call(&mut self, name: &str, args: &[Value], kwargs: &Map<String, Value>)
        -> Result<Value>;

    /// All parameter values as a flat dotted-path mapping.
    fn snapshot(&self) -> BTreeMap<String, Value>;

    /// Parameter-change events recorded since the last drain. The dispatcher
    /// publishes these before the instrument lock is released.
    fn drain_events(&mut self) -> Vec<ParameterEvent> {
        Vec::new()
    }
}

/// Declared shape of a callable method: positional parameter names and an
/// optional return-type tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    pub parameters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<String>,
}

/// One node of the parameter tree.
#[derive(Debug, Clone, Default)]
pub struct ModuleNode {
    pub parameters: BTreeMap<String, ParameterCell>,
    pub submodules: BTreeMap<String, ModuleNode>,
}

impl ModuleNode {
    fn node(&self, dotted: &str) -> Option<&ModuleNode> {
        if dotted.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for part in dotted.split('.') {
            node = node.submodules.get(part)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, dotted: &str) -> Option<&mut ModuleNode> {
        if dotted.is_empty() {
            return Some(self);
        }
        let mut node = self;
        for part in dotted.split('.') {
            node = node.submodules.get_mut(part)?;
        }
        Some(node)
    }

    fn param(&self, dotted: &str) -> Option<&ParameterCell> {
        let (module, name) = split_leaf(dotted);
        self.node(module)?.parameters.get(name)
    }

    fn param_mut(&mut self, dotted: &str) -> Option<&mut ParameterCell> {
        let (module, name) = split_leaf(dotted);
        self.node_mut(module)?.parameters.get_mut(name)
    }

    fn flatten(&self, prefix: &str, out: &mut BTreeMap<String, Value>) {
        for (name, cell) in &self.parameters {
            out.insert(join(prefix, name), cell.value.clone());
        }
        for (name, sub) in &self.submodules {
            sub.flatten(&join(prefix, name), out);
        }
    }

    fn prune_empty(&mut self) {
        for sub in self.submodules.values_mut() {
            sub.prune_empty();
        }
        self.submodules
            .retain(|_, sub| !(sub.parameters.is_empty() && sub.submodules.is_empty()));
    }
}

fn split_leaf(dotted: &str) -> (&str, &str) {
    match dotted.rsplit_once('.') {
        Some((module, name)) => (module, name),
        None => ("", dotted),
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Generic instrument state: a named tree of parameter cells, a method
/// table, and the pending parameter-change events.
#[derive(Debug, Clone)]
pub struct InstrumentTree {
    name: String,
    class_path: String,
    root: ModuleNode,
    methods: BTreeMap<String, MethodSpec>,
    pending: Vec<ParameterEvent>,
}

impl InstrumentTree {
    pub fn new(name: impl Into<String>, class_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_path: class_path.into(),
            root: ModuleNode::default(),
            methods: BTreeMap::new(),
            pending: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_path(&self) -> &str {
        &self.class_path
    }

    /// Insert a parameter at a dotted path, creating intermediate
    /// sub-modules on demand. The cell's name is normalized to the leaf
    /// segment of the path.
    pub fn add_parameter(&mut self, path: &str, mut cell: ParameterCell) -> Result<()> {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(LabrackError::Validation(format!(
                "invalid parameter path '{}'",
                path
            )));
        }
        let (module, leaf) = split_leaf(path);

        // Walk down, refusing to shadow an existing parameter with a module.
        let mut node = &mut self.root;
        if !module.is_empty() {
            for part in module.split('.') {
                if node.parameters.contains_key(part) {
                    return Err(LabrackError::Validation(format!(
                        "'{}' is a parameter and cannot have children",
                        part
                    )));
                }
                node = node.submodules.entry(part.to_string()).or_default();
            }
        }
        if node.parameters.contains_key(leaf) {
            return Err(LabrackError::Validation(format!(
                "parameter '{}' already exists",
                path
            )));
        }
        if node.submodules.contains_key(leaf) {
            return Err(LabrackError::Validation(format!(
                "'{}' is a sub-module and cannot be a parameter",
                path
            )));
        }
        cell.name = leaf.to_string();
        node.parameters.insert(leaf.to_string(), cell);
        Ok(())
    }

    /// Remove the parameter at a dotted path, pruning sub-modules left
    /// empty.
    pub fn remove_parameter(&mut self, path: &str) -> Result<ParameterCell> {
        let (module, leaf) = split_leaf(path);
        let node = self
            .root
            .node_mut(module)
            .ok_or_else(|| LabrackError::NotFound(format!("parameter '{}'", path)))?;
        let cell = node
            .parameters
            .remove(leaf)
            .ok_or_else(|| LabrackError::NotFound(format!("parameter '{}'", path)))?;
        self.root.prune_empty();
        Ok(cell)
    }

    pub fn parameter(&self, path: &str) -> Option<&ParameterCell> {
        self.root.param(path)
    }

    pub fn register_method(&mut self, spec: MethodSpec) {
        self.methods.insert(spec.name.clone(), spec);
    }

    /// Read a parameter value; `Unsupported` for non-gettable cells.
    pub fn read(&self, path: &str) -> Result<Value> {
        let cell = self
            .root
            .param(path)
            .ok_or_else(|| LabrackError::NotFound(format!("parameter '{}'", path)))?;
        if !cell.gettable {
            return Err(LabrackError::Unsupported(format!(
                "parameter '{}' is not gettable",
                path
            )));
        }
        Ok(cell.value.clone())
    }

    /// Validate and write a parameter value, recording a change event.
    /// `Unsupported` for non-settable cells; state is untouched on any
    /// rejection.
    pub fn write(&mut self, path: &str, value: Value) -> Result<()> {
        let cell = self
            .root
            .param_mut(path)
            .ok_or_else(|| LabrackError::NotFound(format!("parameter '{}'", path)))?;
        if !cell.settable {
            return Err(LabrackError::Unsupported(format!(
                "parameter '{}' is not settable",
                path
            )));
        }
        cell.validate(&value)?;
        cell.value = value.clone();
        let unit = cell.unit.clone();
        self.record_change(path, value, unit, None);
        Ok(())
    }

    /// Record a parameter-change event under this instrument's topic space.
    pub fn record_change(&mut self, path: &str, value: Value, unit: String, action: Option<String>) {
        self.pending.push(ParameterEvent {
            topic: format!("{}.{}", self.name, path),
            change: ParameterChange {
                value,
                unit,
                ts: epoch_seconds(),
                action,
            },
        });
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let mut out = BTreeMap::new();
        self.root.flatten("", &mut out);
        out
    }

    pub fn describe(&self) -> InstrumentBlueprint {
        blueprint::from_node(
            &self.name,
            &self.name,
            &self.class_path,
            &self.root,
            &self.methods,
        )
    }

    pub fn drain_events(&mut self) -> Vec<ParameterEvent> {
        std::mem::take(&mut self.pending)
    }
}
