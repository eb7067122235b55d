//! The parameter manager: a virtual instrument whose schema is user-defined
//! at runtime.
//!
//! Parameters are added and removed by dotted path; an element before a dot
//! is a sub-module, generated on demand, and sub-modules left empty by a
//! removal are pruned. The manager persists to a textual profile
//! ([`crate::profile`]) and emits synthetic broadcasts for structural
//! changes so monitors can track schema as well as values.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::blueprint::InstrumentBlueprint;
use crate::instrument::{Instrument, InstrumentTree, MethodSpec};
use crate::param::{ParamKind, ParameterCell, Validator};
use crate::profile::{self, Profile, ProfileEntry};
use crate::registry::InstrumentFactory;
use crate::wire::ParameterEvent;
use crate::{LabrackError, Result};

/// Action tags carried by structural broadcasts.
pub const ACTION_CREATED: &str = "parameter-creation";
pub const ACTION_REMOVED: &str = "parameter-removal";

pub struct ParameterManager {
    tree: InstrumentTree,
    profile_path: Option<PathBuf>,
}

impl ParameterManager {
    /// Default instrument name used by the console tools.
    pub const DEFAULT_NAME: &'static str = "parameter_manager";
    /// Class path the factory registers this instrument under.
    pub const CLASS_PATH: &'static str = "labrack.params.ParameterManager";

    pub fn new(name: &str) -> Self {
        let mut tree = InstrumentTree::new(name, Self::CLASS_PATH);
        tree.register_method(MethodSpec {
            name: "add_parameter".into(),
            parameters: vec!["path".into(), "value".into(), "unit".into()],
            returns: None,
        });
        tree.register_method(MethodSpec {
            name: "remove_parameter".into(),
            parameters: vec!["path".into()],
            returns: None,
        });
        tree.register_method(MethodSpec {
            name: "list_parameters".into(),
            parameters: vec![],
            returns: Some("json".into()),
        });
        tree.register_method(MethodSpec {
            name: "save".into(),
            parameters: vec!["path".into()],
            returns: None,
        });
        tree.register_method(MethodSpec {
            name: "load".into(),
            parameters: vec!["path".into()],
            returns: Some("json".into()),
        });
        Self {
            tree,
            profile_path: None,
        }
    }

    pub fn with_profile(name: &str, profile_path: impl Into<PathBuf>) -> Self {
        let mut pm = Self::new(name);
        pm.profile_path = Some(profile_path.into());
        pm
    }

    /// Add a parameter. Kind is inferred from the initial value unless the
    /// validator narrows it further.
    pub fn add(
        &mut self,
        path: &str,
        value: Value,
        unit: &str,
        validator: Option<Validator>,
    ) -> Result<()> {
        let validator = validator.unwrap_or(Validator::Anything);
        let kind = ParamKind::from_value(&value);
        let cell = ParameterCell::new("", kind, Value::Null)
            .with_unit(unit)
            .with_validator(validator);
        // The initial value passes through the same validation as any set.
        cell.validate(&value)?;
        let mut cell = cell;
        cell.value = value.clone();
        self.tree.add_parameter(path, cell)?;
        self.tree
            .record_change(path, value, unit.to_string(), Some(ACTION_CREATED.into()));
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        let cell = self.tree.remove_parameter(path)?;
        self.tree
            .record_change(path, Value::Null, cell.unit, Some(ACTION_REMOVED.into()));
        Ok(())
    }

    /// Dotted paths of all parameters, sorted.
    pub fn list(&self) -> Vec<String> {
        self.tree.snapshot().into_keys().collect()
    }

    fn resolve_profile_path<'a>(&'a self, explicit: Option<&'a Path>) -> Result<&'a Path> {
        explicit
            .or(self.profile_path.as_deref())
            .ok_or_else(|| LabrackError::Config {
                message: "no profile path configured".into(),
            })
    }

    /// Serialize every parameter to the profile file, atomically.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = self.resolve_profile_path(path)?;
        let mut out = Profile::new();
        for dotted in self.list() {
            if let Some(cell) = self.tree.parameter(&dotted) {
                out.insert(
                    dotted,
                    ProfileEntry::Full {
                        value: cell.value.clone(),
                        unit: cell.unit.clone(),
                    },
                );
            }
        }
        profile::write_profile(path, &out)?;
        info!("saved {} parameters to {}", out.len(), path.display());
        Ok(())
    }

    /// Load a profile, creating missing parameters and setting existing
    /// ones. Returns the number of parameters applied. Entries an existing
    /// parameter rejects are skipped with a warning, matching how profile
    /// restores tolerate partial mismatches.
    pub fn load(&mut self, path: Option<&Path>) -> Result<usize> {
        let path = self.resolve_profile_path(path)?.to_path_buf();
        let path = path.as_path();
        let profile = profile::read_profile(path)?.ok_or_else(|| LabrackError::Config {
            message: format!("profile {} does not exist", path.display()),
        })?;

        let mut applied = 0;
        for (dotted, entry) in &profile {
            let value = entry.value().clone();
            let result = if self.tree.parameter(dotted).is_some() {
                self.tree.write(dotted, value)
            } else {
                self.add(dotted, value, entry.unit(), None)
            };
            match result {
                Ok(()) => applied += 1,
                Err(e) => warn!("skipping profile entry '{}': {}", dotted, e),
            }
        }
        info!("loaded {} parameters from {}", applied, path.display());
        Ok(applied)
    }
}

#[async_trait]
impl Instrument for ParameterManager {
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
        kwargs: &Map<String, Value>,
    ) -> Result<Value> {
        match name {
            "add_parameter" => {
                let path = str_arg(args, 0, "path")?;
                let value = arg(args, 1, "value")?.clone();
                let unit = match args.get(2) {
                    Some(Value::String(u)) => u.clone(),
                    Some(other) => {
                        return Err(LabrackError::Validation(format!(
                            "unit must be a string, got {}",
                            other
                        )))
                    }
                    None => String::new(),
                };
                let validator = match kwargs.get("validator") {
                    Some(spec) => Some(serde_json::from_value(spec.clone()).map_err(|e| {
                        LabrackError::Validation(format!("invalid validator spec: {}", e))
                    })?),
                    None => None,
                };
                self.add(&path, value, &unit, validator)?;
                Ok(Value::Null)
            }
            "remove_parameter" => {
                let path = str_arg(args, 0, "path")?;
                self.remove(&path)?;
                Ok(Value::Null)
            }
            "list_parameters" => Ok(json!(self.list())),
            "save" => {
                let path = opt_path_arg(args)?;
                self.save(path.as_deref())?;
                Ok(Value::Null)
            }
            "load" => {
                let path = opt_path_arg(args)?;
                let applied = self.load(path.as_deref())?;
                Ok(json!(applied))
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

fn arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a Value> {
    args.get(index).ok_or_else(|| {
        LabrackError::Validation(format!("missing argument {} ('{}')", index, name))
    })
}

fn str_arg(args: &[Value], index: usize, name: &str) -> Result<String> {
    arg(args, index, name)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| LabrackError::Validation(format!("argument '{}' must be a string", name)))
}

fn opt_path_arg(args: &[Value]) -> Result<Option<PathBuf>> {
    match args.first() {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(PathBuf::from(s))),
        Some(other) => Err(LabrackError::Validation(format!(
            "path must be a string, got {}",
            other
        ))),
    }
}

/// Register the parameter manager with a factory. The profile path may be
/// passed at creation time through the `profile` kwarg.
pub fn register(factory: &mut InstrumentFactory) {
    factory.register(ParameterManager::CLASS_PATH, |name, _args, kwargs| {
        let pm = match kwargs.get("profile").and_then(Value::as_str) {
            Some(path) => ParameterManager::with_profile(name, path),
            None => ParameterManager::new(name),
        };
        Ok(Box::new(pm))
    });
}
