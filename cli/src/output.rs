//! Output utilities for the export summary.

use spkexport::ExportSummary;

/// Summary format on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// `wrote: <path> (spk_count=<N>)`.
    #[default]
    Text,
    /// The full summary as pretty JSON.
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json { OutputFormat::Json } else { OutputFormat::Text }
    }
}

/// Renders an export summary for stdout.
pub fn render_summary(summary: &ExportSummary, format: OutputFormat) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Text => format!(
            "wrote: {} (spk_count={})",
            summary.output.display(),
            summary.speakers
        ),
        OutputFormat::Json => serde_json::to_string_pretty(summary)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use spkexport::SourceFormat;
    use std::path::PathBuf;

    fn summary() -> ExportSummary {
        ExportSummary {
            input: PathBuf::from("/models/spk2info.pt"),
            output: PathBuf::from("/models/spk2info.json"),
            format: SourceFormat::TorchZip,
            speakers: 7,
            dim: Some(192),
        }
    }

    #[test]
    fn text_summary_line() {
        let line = render_summary(&summary(), OutputFormat::Text).unwrap();
        assert_eq!(line, "wrote: /models/spk2info.json (spk_count=7)");
    }

    #[test]
    fn json_summary() {
        let text = render_summary(&summary(), OutputFormat::from_json_flag(true)).unwrap();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["speakers"], 7);
        assert_eq!(v["dim"], 192);
        assert_eq!(v["format"], "torch_zip");
        assert_eq!(v["output"], "/models/spk2info.json");
    }
}
