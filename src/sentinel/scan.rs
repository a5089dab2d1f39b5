use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// A directory entry that carries the artifact marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub path: PathBuf,
}

/// Returns the extension of `name` including the dot, taken from the last
/// `.` in the name. `"a.tar.exe"` → `".exe"`, `"README"` → `""`.
pub fn extension(name: &str) -> &str {
    name.rfind('.').map(|i| &name[i..]).unwrap_or("")
}

/// Case-sensitive exact comparison of the extension with the marker.
pub fn matches_marker(name: &str, marker: &str) -> bool {
    extension(name) == marker
}

/// Lists the entries of `dir` that carry `marker`, sorted by name.
///
/// Directories are skipped. Names that are not valid UTF-8 are compared
/// on their lossy form, so they can still match the marker.
pub fn scan(dir: &Path, marker: &str) -> Result<Vec<Candidate>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Error reading directory {}", dir.display()))?;

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("Error reading directory {}", dir.display()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !matches_marker(&name, marker) {
            continue;
        }
        // A failed file_type() leaves the entry in; execution will report it.
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        candidates.push(Candidate {
            path: dir.join(entry.file_name()),
            name,
        });
    }
    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(candidates)
}
