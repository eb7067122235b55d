//! Startup configuration: the YAML file the server loads at boot.
//!
//! Top-level `instruments:` maps instrument names to their creation spec;
//! `networking:` optionally adds a listening address and an external
//! broadcast target. GUI sections are parsed and carried along for the
//! external front-ends but ignored by the core.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::registry::Registry;
use crate::server::PollEntry;
use crate::{LabrackError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartupConfig {
    #[serde(default)]
    pub instruments: BTreeMap<String, InstrumentConfig>,
    #[serde(default)]
    pub networking: NetworkingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentConfig {
    /// Driver class path, e.g. `labrack.testing.DummyDmm`.
    #[serde(rename = "type")]
    pub class_path: String,

    /// Whether to instantiate the instrument at startup.
    #[serde(default = "default_true")]
    pub initialize: bool,

    /// Hardware address, forwarded to the constructor as the `address`
    /// kwarg.
    #[serde(default)]
    pub address: Option<String>,

    /// Constructor keyword arguments.
    #[serde(default)]
    pub init: Map<String, Value>,

    /// Parameter name to polling interval in seconds.
    #[serde(default, rename = "pollingRate")]
    pub polling_rate: BTreeMap<String, f64>,

    /// GUI configuration for external front-ends; opaque to the core.
    #[serde(default)]
    pub gui: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkingConfig {
    /// Extra address the request listener also binds.
    #[serde(default, rename = "listeningAddress")]
    pub listening_address: Option<String>,

    /// `host:port` every broadcast is additionally forwarded to.
    #[serde(default, rename = "externalBroadcast")]
    pub external_broadcast: Option<String>,
}

fn default_true() -> bool {
    true
}

impl StartupConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| LabrackError::io_with_path(e, path))?;
        serde_yaml::from_str(&text).map_err(|e| LabrackError::Config {
            message: format!("failed to parse {}: {}", path.display(), e),
        })
    }

    /// Polling entries for the server's background poller.
    pub fn polling_entries(&self) -> Vec<PollEntry> {
        let mut entries = Vec::new();
        for (name, instrument) in &self.instruments {
            for (parameter, seconds) in &instrument.polling_rate {
                entries.push(PollEntry {
                    instrument: name.clone(),
                    parameter: parameter.clone(),
                    interval: Duration::from_secs_f64(*seconds),
                });
            }
        }
        entries
    }
}

/// Instantiate every configured instrument with `initialize: true`. Returns
/// the number created.
pub async fn apply(config: &StartupConfig, registry: &Registry) -> Result<usize> {
    let mut created = 0;
    for (name, instrument) in &config.instruments {
        if !instrument.initialize {
            debug!("skipping '{}' (initialize: false)", name);
            continue;
        }
        let mut kwargs = instrument.init.clone();
        if let Some(address) = &instrument.address {
            kwargs.insert("address".to_string(), Value::String(address.clone()));
        }
        registry
            .create(name, &instrument.class_path, &[], &kwargs, true)
            .await?;
        created += 1;
    }
    info!("initialized {} instruments from configuration", created);
    Ok(created)
}
