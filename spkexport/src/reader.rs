use std::path::Path;

use crate::ExportError;
use crate::table::SpeakerTable;

/// Reads an `spk2info.json` file the way the runtime consumes it.
///
/// Entry order follows the file. Sibling keys next to `embedding` are
/// ignored. With `expected_dim`, every embedding length is checked.
pub fn read_table(path: &Path, expected_dim: Option<usize>) -> Result<SpeakerTable, ExportError> {
    if !path.exists() {
        return Err(ExportError::InputNotFound {
            path: path.to_path_buf(),
        });
    }
    let data = std::fs::read(path)?;
    let table = parse_table(&data)?;

    if let Some(expected) = expected_dim {
        for (speaker, info) in &table {
            if info.embedding.len() != expected {
                return Err(ExportError::DimensionMismatch {
                    speaker: speaker.clone(),
                    expected,
                    got: info.embedding.len(),
                });
            }
        }
    }
    Ok(table)
}

/// Parses speaker table JSON from memory.
pub fn parse_table(data: &[u8]) -> Result<SpeakerTable, ExportError> {
    serde_json::from_slice(data)
        .map_err(|e| ExportError::deserialization(format!("invalid spk2info.json: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_order_and_ignores_extras() {
        let table = parse_table(
            br#"{"z": {"embedding": [1, 2.5], "name": "Z"}, "a": {"embedding": []}}"#,
        )
        .unwrap();
        let keys: Vec<_> = table.keys().map(String::as_str).collect();
        assert_eq!(keys, ["z", "a"]);
        assert_eq!(table["z"].embedding, vec![1.0, 2.5]);
        assert!(table["a"].embedding.is_empty());
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(parse_table(br#"{"a": [1, 2]}"#).is_err());
        assert!(parse_table(br#"{"a": {"embedding": "x"}}"#).is_err());
        assert!(parse_table(b"[]").is_err());
    }

    #[test]
    fn checks_expected_dim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spk2info.json");
        std::fs::write(&path, r#"{"a": {"embedding": [1, 2, 3]}}"#).unwrap();

        assert_eq!(read_table(&path, Some(3)).unwrap().len(), 1);
        let err = read_table(&path, Some(192)).unwrap_err();
        assert!(
            matches!(err, ExportError::DimensionMismatch { expected: 192, got: 3, .. }),
            "{err}"
        );
    }

    #[test]
    fn missing_file() {
        let err = read_table(Path::new("/nonexistent/spk2info.json"), None).unwrap_err();
        assert!(matches!(err, ExportError::InputNotFound { .. }));
    }
}
