//! Purpose: Resolve the snapshot directory the CLI reads from and compiles into.
//! Exports: `default_snapshot_dir`, `resolve_snapshot_dir`.
//! Role: Keep `--dir` / `--out` defaulting in one place.
//! Invariants: Default snapshot directory remains `~/.taxdb/snapshot`.

use std::path::{Path, PathBuf};

pub(crate) fn default_snapshot_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".taxdb").join("snapshot")
}

/// `explicit` wins; otherwise fall back to the global `--dir`.
pub(crate) fn resolve_snapshot_dir(explicit: Option<PathBuf>, dir: &Path) -> PathBuf {
    explicit.unwrap_or_else(|| dir.to_path_buf())
}
