//! Crash-safe file replacement.

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{PatchlineError, Result};

/// Replace `path` with `data` via a synced temp file in the same directory.
///
/// Readers observe either the old content or the new content, never a
/// truncated file. Existing permissions on `path` are carried over.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|e| PatchlineError::io_at(parent, e))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(|e| PatchlineError::io_at(parent, e))?;
    if let Err(e) = write_synced(&mut tmp, data) {
        return Err(PatchlineError::io_at(tmp.path(), e));
    }

    if let Ok(meta) = fs::metadata(path) {
        fs::set_permissions(tmp.path(), meta.permissions())
            .map_err(|e| PatchlineError::io_at(tmp.path(), e))?;
    }

    tmp.persist(path)
        .map_err(|e| PatchlineError::io_at(path, e.error))?;

    debug!(path = %path.display(), bytes = data.len(), "atomic write completed");
    Ok(())
}

fn write_synced(tmp: &mut NamedTempFile, data: &[u8]) -> std::io::Result<()> {
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_creates_file_and_parent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("out.json");

        write_atomic(&path, b"[1]").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[1]");
    }

    #[test]
    fn test_write_replaces_and_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.json");
        fs::write(&path, "old content that is longer").unwrap();

        write_atomic(&path, b"new").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");

        let names: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_write_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("opencode.json");
        fs::write(&path, "{}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        write_atomic(&path, b"{\"a\":1}").unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
    }
}
