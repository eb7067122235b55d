//! Profile persistence for the parameter manager.
//!
//! A profile is a flat JSON object keyed by dotted parameter path. Values
//! are either `{"value": V, "unit": U}` objects or bare scalars; both shapes
//! are accepted on read. Writes are atomic:
//!
//! 1. Serialize to a temp sibling with a unique PID+TID suffix
//! 2. Validate by re-parsing
//! 3. fsync so the data reaches disk
//! 4. Atomic rename onto the target path

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;
use std::process;
use std::thread;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use crate::{LabrackError, Result};

/// One profile entry. The full shape carries a unit; the bare shape is just
/// the value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProfileEntry {
    Full {
        value: Value,
        #[serde(default)]
        unit: String,
    },
    Bare(Value),
}

impl ProfileEntry {
    pub fn value(&self) -> &Value {
        match self {
            ProfileEntry::Full { value, .. } => value,
            ProfileEntry::Bare(value) => value,
        }
    }

    pub fn unit(&self) -> &str {
        match self {
            ProfileEntry::Full { unit, .. } => unit,
            ProfileEntry::Bare(_) => "",
        }
    }
}

/// Flat mapping from dotted parameter path to entry.
pub type Profile = BTreeMap<String, ProfileEntry>;

/// Read and parse a profile. Returns `None` if the file doesn't exist.
pub fn read_profile(path: &Path) -> Result<Option<Profile>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path).map_err(|e| LabrackError::io_with_path(e, path))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .map_err(|e| LabrackError::io_with_path(e, path))?;

    let profile: Profile = serde_json::from_str(&contents).map_err(|e| LabrackError::Json {
        message: format!("failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(profile))
}

/// Write a profile atomically.
pub fn write_profile(path: &Path, profile: &Profile) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| LabrackError::io_with_path(e, parent))?;
        }
    }

    let pid = process::id();
    let tid = thread_id();
    let temp_path = path.with_extension(format!("json.{}.{}.tmp", pid, tid));

    let serialized = serde_json::to_string_pretty(profile)?;

    // Validate by re-parsing before anything touches the target path.
    serde_json::from_str::<Value>(&serialized).map_err(|e| LabrackError::Json {
        message: format!("profile validation failed: {}", e),
        source: Some(e),
    })?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| LabrackError::io_with_path(e, &temp_path))?;

        file.write_all(serialized.as_bytes())
            .map_err(|e| LabrackError::io_with_path(e, &temp_path))?;
        file.flush()
            .map_err(|e| LabrackError::io_with_path(e, &temp_path))?;

        #[cfg(unix)]
        {
            unsafe {
                libc::fsync(file.as_raw_fd());
            }
        }

        #[cfg(not(unix))]
        {
            file.sync_all()
                .map_err(|e| LabrackError::io_with_path(e, &temp_path))?;
        }
    }

    fs::rename(&temp_path, path).map_err(|e| LabrackError::io_with_path(e, path))?;

    debug!("wrote profile {}", path.display());
    Ok(())
}

fn thread_id() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    format!("{:?}", thread::current().id()).hash(&mut hasher);
    hasher.finish()
}
