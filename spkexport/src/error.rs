use std::path::PathBuf;

use thiserror::Error;

use crate::pickle::PickleError;

/// Errors returned by spkexport operations.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("input not found: {}", path.display())]
    InputNotFound { path: PathBuf },

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unsupported embedding type for speaker {speaker:?}: {kind}")]
    UnsupportedEmbeddingType { speaker: String, kind: String },

    #[error("speaker {speaker:?}: element {index} ({value}) is not a finite f32")]
    NonFiniteValue {
        speaker: String,
        index: usize,
        value: f64,
    },

    #[error("speaker {speaker:?}: embedding has len={got}, expected {expected}")]
    DimensionMismatch {
        speaker: String,
        expected: usize,
        got: usize,
    },

    #[error("duplicate speaker id after string coercion: {0:?}")]
    DuplicateSpeaker(String),

    #[error("missing dependency: {what} ({hint})")]
    MissingDependency { what: String, hint: String },

    #[error("verification failed: {0}")]
    VerifyMismatch(String),

    #[error("{} speaker entries failed: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<ExportError>),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExportError {
    pub(crate) fn deserialization(msg: impl Into<String>) -> Self {
        ExportError::Deserialization(msg.into())
    }

    /// Returns the individual failures, flattening [`ExportError::Multiple`].
    pub fn failures(&self) -> Vec<&ExportError> {
        match self {
            ExportError::Multiple(errs) => errs.iter().flat_map(|e| e.failures()).collect(),
            other => vec![other],
        }
    }
}

impl From<PickleError> for ExportError {
    fn from(err: PickleError) -> Self {
        ExportError::Deserialization(err.to_string())
    }
}

#[cfg(feature = "torch")]
impl From<zip::result::ZipError> for ExportError {
    fn from(err: zip::result::ZipError) -> Self {
        ExportError::Deserialization(format!("zip archive: {err}"))
    }
}

fn join_errors(errs: &[ExportError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multiple_lists_every_failure() {
        let err = ExportError::Multiple(vec![
            ExportError::UnsupportedEmbeddingType {
                speaker: "a".into(),
                kind: "str".into(),
            },
            ExportError::DuplicateSpeaker("1".into()),
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 speaker entries failed"), "{msg}");
        assert!(msg.contains("\"a\""), "{msg}");
        assert!(msg.contains("duplicate speaker id"), "{msg}");
        assert_eq!(err.failures().len(), 2);
    }

    #[test]
    fn input_not_found_names_path() {
        let err = ExportError::InputNotFound {
            path: PathBuf::from("/nonexistent/spk2info.pt"),
        };
        assert_eq!(err.to_string(), "input not found: /nonexistent/spk2info.pt");
    }
}
