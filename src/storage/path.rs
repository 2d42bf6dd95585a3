use std::path::PathBuf;

use super::StorageError;

/// Expands a leading `~` or `$HOME` to the home directory.
pub(crate) fn expand_home_path(raw_path: &str) -> Result<PathBuf, StorageError> {
    let suffix = if raw_path == "~" || raw_path == "$HOME" {
        Some("")
    } else {
        raw_path
            .strip_prefix("~/")
            .or_else(|| raw_path.strip_prefix("$HOME/"))
    };

    let Some(suffix) = suffix else {
        return Ok(PathBuf::from(raw_path));
    };

    let home = std::env::var("HOME").map_err(|_| StorageError::HomeDirectoryUnavailable)?;
    let mut path = PathBuf::from(home);
    if !suffix.is_empty() {
        path.push(suffix);
    }
    Ok(path)
}
