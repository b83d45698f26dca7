use std::io::Write;
use std::path::Path;

use tempfile::{Builder, NamedTempFile};

use crate::ExportError;
use crate::table::SpeakerTable;

/// Serializes `table` as pretty-printed JSON with a trailing newline.
pub fn to_json_bytes(table: &SpeakerTable) -> Result<Vec<u8>, ExportError> {
    let mut buf = serde_json::to_vec_pretty(table)?;
    buf.push(b'\n');
    Ok(buf)
}

/// Writes `table` to `path` atomically.
///
/// Missing parent directories are created. The bytes go to a temporary file
/// next to `path` which is renamed over it once fully flushed, so a failure
/// never leaves a partial file at `path`. A replaced file keeps its
/// permissions. A new file gets the same mode `std::fs::write` would give it.
pub fn write_table(table: &SpeakerTable, path: &Path) -> Result<(), ExportError> {
    let bytes = to_json_bytes(table)?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = temp_file_in(dir)?;
    if let Ok(existing) = std::fs::metadata(path) {
        tmp.as_file().set_permissions(existing.permissions())?;
    }
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    tracing::info!(path = %path.display(), speakers = table.len(), bytes = bytes.len(), "wrote speaker table");
    Ok(())
}

fn temp_file_in(dir: &Path) -> std::io::Result<NamedTempFile> {
    let mut builder = Builder::new();
    builder.prefix(".spk2info").suffix(".tmp");
    // Same creation mode as `File::create`, so the umask applies.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o666));
    }
    builder.tempfile_in(dir)
}
