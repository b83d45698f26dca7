use indexmap::IndexMap;
use indexmap::map::Entry;
use serde::{Deserialize, Serialize};

use crate::ExportError;
use crate::normalize::{EmbeddingError, normalize};
use crate::value::Value;

/// One speaker's record in `spk2info.json`.
///
/// Unknown sibling keys are ignored when reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeakerInfo {
    pub embedding: Vec<f32>,
}

/// Ordered mapping from speaker id to its info. Iteration order is the
/// source table's order.
pub type SpeakerTable = IndexMap<String, SpeakerInfo>;

/// What to do when an entry cannot be normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Abort on the first failing entry.
    #[default]
    FailFast,
    /// Attempt every entry, then abort with all failures.
    CollectAll,
}

/// Resolves and normalizes the root mapping's entries into a table.
///
/// Each entry's embedding is `raw["embedding"]` when `raw` is a mapping
/// holding that key, otherwise `raw` itself. Keys are coerced to text.
pub fn resolve(
    entries: Vec<(Value, Value)>,
    policy: ErrorPolicy,
    expected_dim: Option<usize>,
) -> Result<SpeakerTable, ExportError> {
    let mut table = SpeakerTable::with_capacity(entries.len());
    let mut failures = Vec::new();

    for (key, raw) in entries {
        let result = speaker_id(&key).and_then(|id| {
            let embedding = resolve_entry(&id, &raw, expected_dim)?;
            Ok((id, embedding))
        });

        let failure = match result {
            Ok((id, embedding)) => match table.entry(id) {
                Entry::Occupied(e) => ExportError::DuplicateSpeaker(e.key().clone()),
                Entry::Vacant(e) => {
                    tracing::debug!(speaker = %e.key(), dim = embedding.len(), "resolved speaker");
                    e.insert(SpeakerInfo { embedding });
                    continue;
                }
            },
            Err(e) => e,
        };

        match policy {
            ErrorPolicy::FailFast => return Err(failure),
            ErrorPolicy::CollectAll => failures.push(failure),
        }
    }

    match failures.len() {
        0 => Ok(table),
        1 => Err(failures.remove(0)),
        _ => Err(ExportError::Multiple(failures)),
    }
}

fn resolve_entry(
    speaker: &str,
    raw: &Value,
    expected_dim: Option<usize>,
) -> Result<Vec<f32>, ExportError> {
    let embedding = raw.get("embedding").unwrap_or(raw);
    let values = normalize(embedding).map_err(|e| match e {
        EmbeddingError::Unsupported(kind) => ExportError::UnsupportedEmbeddingType {
            speaker: speaker.to_string(),
            kind,
        },
        EmbeddingError::NonFinite { index, value } => ExportError::NonFiniteValue {
            speaker: speaker.to_string(),
            index,
            value,
        },
    })?;

    if let Some(expected) = expected_dim {
        if values.len() != expected {
            return Err(ExportError::DimensionMismatch {
                speaker: speaker.to_string(),
                expected,
                got: values.len(),
            });
        }
    }
    Ok(values)
}

/// Coerces a mapping key to its canonical text form, matching Python's
/// `str()` for the key types a speaker table uses.
pub fn speaker_id(key: &Value) -> Result<String, ExportError> {
    match key {
        Value::Str(s) => Ok(s.clone()),
        Value::Int(n) => Ok(n.to_string()),
        Value::Bool(true) => Ok("True".into()),
        Value::Bool(false) => Ok("False".into()),
        Value::None => Ok("None".into()),
        Value::Float(f) => Ok(python_float_str(*f)),
        other => Err(ExportError::deserialization(format!(
            "unsupported speaker id type: {}",
            other.kind()
        ))),
    }
}

fn python_float_str(f: f64) -> String {
    if f.is_nan() {
        "nan".into()
    } else if f.is_infinite() {
        if f > 0.0 { "inf".into() } else { "-inf".into() }
    } else {
        // Shortest round-trip digits, e.g. "1.5e-5". Python switches to
        // exponent form below 1e-4 and from 1e16 up.
        let sci = format!("{f:e}");
        let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
        let exp: i32 = exp.parse().unwrap_or(0);
        if (-4..16).contains(&exp) {
            let plain = format!("{f}");
            if plain.contains('.') { plain } else { plain + ".0" }
        } else {
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exp.unsigned_abs())
        }
    }
}

/// Returns the common embedding length, or `None` if entries disagree or
/// the table is empty.
pub fn common_dim(table: &SpeakerTable) -> Option<usize> {
    let mut dims = table.values().map(|info| info.embedding.len());
    let first = dims.next()?;
    dims.all(|d| d == first).then_some(first)
}
