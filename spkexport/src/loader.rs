//! Speaker table loading.
//!
//! # Trust boundary
//!
//! The upstream `spk2info.pt` format is a pickle, and a stock unpickler runs
//! arbitrary code while loading one. This loader never does: every pickle is
//! decoded by [`crate::pickle`], which has no import or call capability.
//! Input files should still be treated as trusted local artifacts, since a
//! decoder that runs nothing can still be fed hostile sizes. Length
//! prefixes and tensor views are bounds-checked, and a decoded pickle is
//! capped in depth, node count and string payload (see
//! [`crate::pickle::MAX_PAYLOAD_EXPANSION`]).

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ExportError;
use crate::pickle::Unpickler;
use crate::value::Value;

/// Requested input format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    /// Detect from the file extension and content.
    #[default]
    Auto,
    /// A PyTorch checkpoint (zip or legacy).
    Torch,
    /// A bare pickle stream of plain data.
    Pickle,
    /// A JSON object.
    Json,
}

impl FromStr for InputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(InputFormat::Auto),
            "torch" | "pt" => Ok(InputFormat::Torch),
            "pickle" | "pkl" => Ok(InputFormat::Pickle),
            "json" => Ok(InputFormat::Json),
            other => Err(format!(
                "unknown input format {other:?} (expected auto, torch, pickle or json)"
            )),
        }
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InputFormat::Auto => "auto",
            InputFormat::Torch => "torch",
            InputFormat::Pickle => "pickle",
            InputFormat::Json => "json",
        })
    }
}

/// The container actually found in the input file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    TorchZip,
    TorchLegacy,
    Pickle,
    Json,
}

impl fmt::Display for SourceFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceFormat::TorchZip => "torch zip checkpoint",
            SourceFormat::TorchLegacy => "torch legacy checkpoint",
            SourceFormat::Pickle => "pickle",
            SourceFormat::Json => "json",
        })
    }
}

/// Root mapping entries in source order, plus the detected container.
#[derive(Debug)]
pub struct LoadedTable {
    pub format: SourceFormat,
    pub entries: Vec<(Value, Value)>,
}

const PROTO: u8 = 0x80;

/// Loads the root mapping of a serialized speaker table.
///
/// Fails with [`ExportError::InputNotFound`] before touching the file if
/// `path` does not exist, and with [`ExportError::Deserialization`] if the
/// content cannot be decoded or its root is not a mapping.
pub fn load_entries(path: &Path, format: InputFormat) -> Result<LoadedTable, ExportError> {
    if !path.exists() {
        return Err(ExportError::InputNotFound {
            path: path.to_path_buf(),
        });
    }
    let data = std::fs::read(path)?;
    let format = match format {
        InputFormat::Auto => detect(path, &data)?,
        InputFormat::Json => SourceFormat::Json,
        InputFormat::Pickle => SourceFormat::Pickle,
        InputFormat::Torch if is_zip(&data) => SourceFormat::TorchZip,
        InputFormat::Torch => SourceFormat::TorchLegacy,
    };
    tracing::debug!(path = %path.display(), %format, bytes = data.len(), "loading speaker table");

    let root = decode(&data, format)?;
    let entries = into_entries(root)?;
    Ok(LoadedTable { format, entries })
}

fn detect(path: &Path, data: &[u8]) -> Result<SourceFormat, ExportError> {
    let is_json_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let first = data.iter().copied().find(|b| !b.is_ascii_whitespace());

    if is_json_ext || first == Some(b'{') {
        return Ok(SourceFormat::Json);
    }
    if is_zip(data) {
        return Ok(SourceFormat::TorchZip);
    }
    if data.first() == Some(&PROTO) {
        let head = Unpickler::new(data).load()?;
        return Ok(if is_legacy_magic(&head) {
            SourceFormat::TorchLegacy
        } else {
            SourceFormat::Pickle
        });
    }
    Err(ExportError::deserialization(
        "unrecognized input format (expected a torch checkpoint, pickle or JSON)",
    ))
}

fn decode(data: &[u8], format: SourceFormat) -> Result<Value, ExportError> {
    match format {
        SourceFormat::Json => {
            let json: serde_json::Value = serde_json::from_slice(data)
                .map_err(|e| ExportError::deserialization(format!("invalid JSON: {e}")))?;
            Ok(Value::from(json))
        }
        SourceFormat::Pickle => {
            let root = Unpickler::new(data).load()?;
            if has_persistent(&root) {
                if !cfg!(feature = "torch") {
                    return Err(missing_torch());
                }
                return Err(ExportError::deserialization(
                    "pickle references external tensor storages; load the .pt checkpoint instead",
                ));
            }
            Ok(root)
        }
        SourceFormat::TorchZip | SourceFormat::TorchLegacy => decode_torch(data, format),
    }
}

fn missing_torch() -> ExportError {
    ExportError::MissingDependency {
        what: "PyTorch checkpoint support".into(),
        hint: "rebuild spkexport with --features torch".into(),
    }
}

fn into_entries(root: Value) -> Result<Vec<(Value, Value)>, ExportError> {
    match root {
        Value::Dict(entries) => Ok(entries),
        other => Err(ExportError::deserialization(format!(
            "unexpected spk2info format: expected dict, got {}",
            other.kind()
        ))),
    }
}

fn has_persistent(value: &Value) -> bool {
    match value {
        Value::Persistent(_) => true,
        Value::List(items) | Value::Tuple(items) => items.iter().any(has_persistent),
        Value::Dict(entries) => entries
            .iter()
            .any(|(k, v)| has_persistent(k) || has_persistent(v)),
        Value::Object { args, state, .. } => {
            has_persistent(args) || state.as_deref().is_some_and(has_persistent)
        }
        _ => false,
    }
}

#[cfg(feature = "torch")]
use crate::torch::{is_legacy_magic, is_zip};

#[cfg(feature = "torch")]
fn decode_torch(data: &[u8], format: SourceFormat) -> Result<Value, ExportError> {
    match format {
        SourceFormat::TorchZip => crate::torch::read_zip(data),
        _ => crate::torch::read_legacy(data),
    }
}

#[cfg(not(feature = "torch"))]
fn decode_torch(_data: &[u8], _format: SourceFormat) -> Result<Value, ExportError> {
    Err(missing_torch())
}

#[cfg(not(feature = "torch"))]
fn is_zip(data: &[u8]) -> bool {
    data.starts_with(b"PK\x03\x04")
}

#[cfg(not(feature = "torch"))]
fn is_legacy_magic(value: &Value) -> bool {
    matches!(value, Value::Int(0x1950a86a20f9469cfc6c))
}
