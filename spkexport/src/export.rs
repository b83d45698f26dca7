use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ExportError;
use crate::loader::{InputFormat, SourceFormat, load_entries};
use crate::reader::read_table;
use crate::table::{ErrorPolicy, SpeakerTable, common_dim, resolve};
use crate::writer::write_table;

/// Conversion settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub format: InputFormat,
    /// Required embedding length. `None` accepts any length.
    pub expected_dim: Option<usize>,
    pub error_policy: ErrorPolicy,
    /// Re-read the written file and compare it with the in-memory table.
    pub verify: bool,
}

/// Result of a successful export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportSummary {
    pub input: PathBuf,
    pub output: PathBuf,
    pub format: SourceFormat,
    pub speakers: usize,
    /// Common embedding length, if every entry has the same one.
    pub dim: Option<usize>,
}

/// Converts the speaker table at `input` into `spk2info.json` at `output`.
///
/// Loading and normalization finish before the output is touched, so any
/// failure there leaves `output` as it was.
pub fn export(
    input: &Path,
    output: &Path,
    opts: &ExportOptions,
) -> Result<ExportSummary, ExportError> {
    let input = std::path::absolute(input)?;
    let output = std::path::absolute(output)?;

    let loaded = load_entries(&input, opts.format)?;
    tracing::debug!(format = %loaded.format, entries = loaded.entries.len(), "decoded root mapping");

    let table = resolve(loaded.entries, opts.error_policy, opts.expected_dim)?;
    write_table(&table, &output)?;

    if opts.verify {
        verify(&table, &output, opts.expected_dim)?;
    }

    Ok(ExportSummary {
        input,
        output,
        format: loaded.format,
        speakers: table.len(),
        dim: common_dim(&table),
    })
}

fn verify(
    expected: &SpeakerTable,
    path: &Path,
    expected_dim: Option<usize>,
) -> Result<(), ExportError> {
    let written = read_table(path, expected_dim)?;
    if written.len() != expected.len() {
        return Err(ExportError::VerifyMismatch(format!(
            "wrote {} speakers, read back {}",
            expected.len(),
            written.len()
        )));
    }
    for (i, ((want_id, want), (got_id, got))) in expected.iter().zip(&written).enumerate() {
        if want_id != got_id {
            return Err(ExportError::VerifyMismatch(format!(
                "entry {i}: expected speaker {want_id:?}, read back {got_id:?}"
            )));
        }
        if want != got {
            return Err(ExportError::VerifyMismatch(format!(
                "speaker {want_id:?}: embedding differs after round trip"
            )));
        }
    }
    tracing::debug!(path = %path.display(), "verified written table");
    Ok(())
}
