//! The instrument registry: the authoritative map from name to live
//! instrument, plus the factory that instantiates drivers by class path.
//!
//! Each entry owns its instrument's mutex, so "exactly one lock per
//! instrument" holds structurally. The map itself is guarded by a
//! registry-level lock distinct from the per-instrument locks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::instrument::Instrument;
use crate::{LabrackError, Result};

type Constructor =
    Box<dyn Fn(&str, &[Value], &Map<String, Value>) -> Result<Box<dyn Instrument>> + Send + Sync>;

/// Maps class paths to constructors. The registry delegates all concrete
/// instantiation here; it does not know how to build any particular driver.
pub struct InstrumentFactory {
    constructors: HashMap<String, Constructor>,
}

impl InstrumentFactory {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Factory pre-loaded with the built-in classes: the parameter manager
    /// and the dummy test instruments.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        crate::params::register(&mut factory);
        crate::testing::register(&mut factory);
        factory
    }

    pub fn register<F>(&mut self, class_path: impl Into<String>, ctor: F)
    where
        F: Fn(&str, &[Value], &Map<String, Value>) -> Result<Box<dyn Instrument>>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(class_path.into(), Box::new(ctor));
    }

    pub fn create(
        &self,
        class_path: &str,
        name: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
    ) -> Result<Box<dyn Instrument>> {
        let ctor = self
            .constructors
            .get(class_path)
            .ok_or_else(|| LabrackError::NotFound(format!("instrument class '{}'", class_path)))?;
        ctor(name, args, kwargs)
    }

    pub fn known_classes(&self) -> Vec<String> {
        let mut classes: Vec<_> = self.constructors.keys().cloned().collect();
        classes.sort();
        classes
    }
}

impl Default for InstrumentFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered instrument and its mutex.
pub struct InstrumentEntry {
    pub name: String,
    pub class_path: String,
    cell: Mutex<Box<dyn Instrument>>,
}

impl std::fmt::Debug for InstrumentEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentEntry")
            .field("name", &self.name)
            .field("class_path", &self.class_path)
            .finish()
    }
}

impl InstrumentEntry {
    /// Acquire the instrument's lock. Waiters are served in FIFO order, so
    /// within one instrument handlers complete in arrival order.
    pub async fn lock(&self) -> MutexGuard<'_, Box<dyn Instrument>> {
        self.cell.lock().await
    }
}

/// Process-wide mapping from instrument name to [`InstrumentEntry`].
pub struct Registry {
    factory: InstrumentFactory,
    inner: Mutex<BTreeMap<String, Arc<InstrumentEntry>>>,
}

impl Registry {
    pub fn new(factory: InstrumentFactory) -> Self {
        Self {
            factory,
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn list(&self) -> Vec<String> {
        self.inner.lock().await.keys().cloned().collect()
    }

    pub async fn get(&self, name: &str) -> Result<Arc<InstrumentEntry>> {
        self.inner
            .lock()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| LabrackError::NotFound(format!("instrument '{}'", name)))
    }

    /// Instantiate an instrument by class path and register it.
    ///
    /// With `find_or_create`, an existing instrument of the same class path
    /// is returned as-is; a class-path conflict fails with `Validation`, as
    /// does any duplicate name without `find_or_create`.
    pub async fn create(
        &self,
        name: &str,
        class_path: &str,
        args: &[Value],
        kwargs: &Map<String, Value>,
        find_or_create: bool,
    ) -> Result<Arc<InstrumentEntry>> {
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.get(name) {
            if !find_or_create {
                return Err(LabrackError::Validation(format!(
                    "instrument '{}' already exists",
                    name
                )));
            }
            if existing.class_path != class_path {
                return Err(LabrackError::Validation(format!(
                    "instrument '{}' already exists with class '{}', requested '{}'",
                    name, existing.class_path, class_path
                )));
            }
            debug!("instrument '{}' already exists, returning it", name);
            return Ok(existing.clone());
        }

        let instrument = self.factory.create(class_path, name, args, kwargs)?;
        let entry = Arc::new(InstrumentEntry {
            name: name.to_string(),
            class_path: class_path.to_string(),
            cell: Mutex::new(instrument),
        });
        inner.insert(name.to_string(), entry.clone());
        info!("created instrument '{}' ({})", name, class_path);
        Ok(entry)
    }

    /// Remove an instrument from the registry. In-flight handlers holding
    /// the entry keep it alive until they finish.
    pub async fn close(&self, name: &str) -> Result<()> {
        self.inner
            .lock()
            .await
            .remove(name)
            .map(|_| info!("closed instrument '{}'", name))
            .ok_or_else(|| LabrackError::NotFound(format!("instrument '{}'", name)))
    }
}
