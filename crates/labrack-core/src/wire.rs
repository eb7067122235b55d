//! Wire format shared by server and client.
//!
//! Every message is a frame: 4-byte big-endian length prefix followed by a
//! UTF-8 JSON payload.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Requests carry an [`Instruction`], replies a [`Response`]. Broadcast
//! events are sent as two consecutive frames: the raw topic bytes, then a
//! JSON [`ParameterChange`] body.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::NetConfig;
use crate::{LabrackError, Result};

/// Valid operations for the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Names of the instruments currently registered.
    ListInstruments,
    /// Full blueprint tree of an instrument (or one of its sub-modules).
    GetBlueprint,
    /// Read a parameter.
    Get,
    /// Validate and write a parameter, then broadcast the change.
    Set,
    /// Invoke a named method.
    Call,
    /// Instantiate an instrument by class path and register it.
    CreateInstrument,
    /// All parameter values of an instrument as a flat mapping.
    Snapshot,
}

/// A tagged request. Each instruction is independent; there is no session
/// state beyond socket connectedness.
///
/// Which fields are required depends on the operation. For
/// `create_instrument`, `name` carries the class path and `value: true`
/// requests find-or-create semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instruction {
    pub operation: Operation,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<Value>>,
    #[serde(default)]
    pub kwargs: Option<Map<String, Value>>,
    #[serde(default)]
    pub value: Option<Value>,
}

impl Instruction {
    fn bare(operation: Operation) -> Self {
        Self {
            operation,
            target: None,
            path: None,
            name: None,
            args: None,
            kwargs: None,
            value: None,
        }
    }

    pub fn list_instruments() -> Self {
        Self::bare(Operation::ListInstruments)
    }

    pub fn get_blueprint(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::bare(Operation::GetBlueprint)
        }
    }

    /// Read `param` (a dotted path within the instrument) on `target`.
    pub fn get(target: impl Into<String>, param: &str) -> Self {
        let (path, name) = split_param_path(param);
        Self {
            target: Some(target.into()),
            path,
            name: Some(name),
            ..Self::bare(Operation::Get)
        }
    }

    pub fn set(target: impl Into<String>, param: &str, value: Value) -> Self {
        let (path, name) = split_param_path(param);
        Self {
            target: Some(target.into()),
            path,
            name: Some(name),
            value: Some(value),
            ..Self::bare(Operation::Set)
        }
    }

    pub fn call(
        target: impl Into<String>,
        method: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Self {
        Self {
            target: Some(target.into()),
            name: Some(method.into()),
            args: Some(args),
            kwargs: Some(kwargs),
            ..Self::bare(Operation::Call)
        }
    }

    pub fn create_instrument(
        target: impl Into<String>,
        class_path: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        find_or_create: bool,
    ) -> Self {
        Self {
            target: Some(target.into()),
            name: Some(class_path.into()),
            args: Some(args),
            kwargs: Some(kwargs),
            value: Some(Value::Bool(find_or_create)),
            ..Self::bare(Operation::CreateInstrument)
        }
    }

    pub fn snapshot(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::bare(Operation::Snapshot)
        }
    }
}

/// Split a dotted parameter path into (sub-module path, leaf name).
fn split_param_path(param: &str) -> (Option<String>, String) {
    match param.rsplit_once('.') {
        Some((path, name)) => (Some(path.to_string()), name.to_string()),
        None => (None, param.to_string()),
    }
}

/// Error kinds surfaced on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    ProtocolError,
    NotFound,
    Validation,
    Unsupported,
    InstrumentFailure,
    Internal,
}

/// Structured error carried in a failed [`Response`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    pub message: String,
}

/// A tagged reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Response {
    pub fn success(value: Value) -> Self {
        Self {
            ok: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(WireError {
                kind,
                message: message.into(),
            }),
        }
    }

    /// Convert into a result, rebuilding a typed error on failure.
    pub fn into_result(self) -> Result<Value> {
        if self.ok {
            Ok(self.value.unwrap_or(Value::Null))
        } else {
            let err = self.error.unwrap_or(WireError {
                kind: ErrorKind::Internal,
                message: "response carried no error detail".to_string(),
            });
            Err(LabrackError::from_wire(err.kind, err.message))
        }
    }
}

/// Body of a broadcast frame. `action` is present only on structural events
/// emitted by the parameter manager (parameter creation/removal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterChange {
    pub value: Value,
    pub unit: String,
    pub ts: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

/// A broadcast event: fully qualified dotted topic plus change body.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterEvent {
    pub topic: String,
    pub change: ParameterChange,
}

/// First frame a subscriber sends after connecting to the broadcast socket.
/// The empty prefix subscribes to every topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub subscribe: String,
}

/// Seconds since the unix epoch, as a float.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Read a length-prefixed frame from an async reader.
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > NetConfig::MAX_FRAME_SIZE {
        return Err(LabrackError::Protocol(format!(
            "frame size {} exceeds maximum {}",
            len,
            NetConfig::MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Serialize a value and write it as one frame.
pub async fn write_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    write_frame(writer, &payload).await
}
