//! Relative-path validation and atomic filesystem primitives.
//!
//! Every path that crosses a trust boundary in this crate — a filename
//! parsed out of a patch, a name read from `series`, a path recorded in a
//! backup tree — is wrapped in [`RelPath`] before it touches the
//! filesystem. Construction is the only place `..` segments, absolute
//! prefixes, and NUL bytes are rejected, so once a `RelPath` exists it is
//! safe to join under any base directory.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// A path relative to some base directory, validated not to escape it.
///
/// Internally stored with forward-slash separators (the on-disk form used
/// by `series` and `applied-patches`), regardless of host platform.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelPath(String);

/// Why a candidate path was rejected by [`RelPath::new`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("absolute path not allowed: {0:?}")]
    Absolute(String),
    #[error("path escapes base directory: {0:?}")]
    Escapes(String),
    #[error("path contains a NUL byte: {0:?}")]
    NulByte(String),
    #[error("not enough path components to strip {strip} from {path:?}")]
    NotEnoughComponents { path: String, strip: usize },
}

impl RelPath {
    /// Validate and construct a `RelPath` from a slash-separated string.
    ///
    /// Rejects: empty input, a leading `/`, any `..` segment, and NUL
    /// bytes. `.` segments are dropped; repeated slashes are collapsed.
    pub fn new(raw: &str) -> Result<Self, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        if raw.contains('\0') {
            return Err(PathError::NulByte(raw.to_string()));
        }
        if raw.starts_with('/') {
            return Err(PathError::Absolute(raw.to_string()));
        }

        let mut normalized: Vec<&str> = Vec::new();
        for segment in raw.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(PathError::Escapes(raw.to_string())),
                s => normalized.push(s),
            }
        }
        if normalized.is_empty() {
            return Err(PathError::Empty);
        }
        Ok(RelPath(normalized.join("/")))
    }

    /// Build a `RelPath` from pre-split components, used by the parser
    /// after it has already split a filename on `/`.
    pub fn from_components<I, S>(components: I) -> Result<Self, PathError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined = components
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("/");
        Self::new(&joined)
    }

    /// Drop `n` leading path components. Used to implement `strip` (spec
    /// §4.3 step 1).
    pub fn strip_prefix_components(&self, n: usize) -> Result<Self, PathError> {
        let parts: Vec<&str> = self.0.split('/').collect();
        if parts.len() <= n {
            return Err(PathError::NotEnoughComponents {
                path: self.0.clone(),
                strip: n,
            });
        }
        Ok(RelPath(parts[n..].join("/")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Join this path under `base`, using host path separators.
    pub fn to_path(&self, base: &Path) -> PathBuf {
        let mut p = base.to_path_buf();
        for part in self.0.split('/') {
            p.push(part);
        }
        p
    }
}

impl std::fmt::Display for RelPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Write `contents` to `path` by first writing a sibling temp file, fsyncing
/// it, then renaming it over `path`. The rename is atomic on the same
/// filesystem, so a crash mid-write never leaves `path` truncated or
/// half-written. Creates parent directories if needed.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp_path = sibling_tmp_path(path);
    {
        let mut tmp = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        tmp.write_all(contents)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tmp".to_string());
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    parent.join(format!(".{file_name}.tmp"))
}

/// Recursively enumerate every regular file under `dir`, relative to
/// `dir`, in sorted order. Used by `refresh` to walk a backup tree (spec
/// §4.5 `refresh`).
pub fn walk_files_sorted(dir: &Path) -> io::Result<Vec<RelPath>> {
    let mut out = Vec::new();
    if dir.is_dir() {
        walk_into(dir, Path::new(""), &mut out)?;
    }
    out.sort();
    Ok(out)
}

fn walk_into(base: &Path, rel: &Path, out: &mut Vec<RelPath>) -> io::Result<()> {
    let current = base.join(rel);
    for entry in fs::read_dir(&current)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let child_rel = rel.join(entry.file_name());
        if file_type.is_dir() {
            walk_into(base, &child_rel, out)?;
        } else if file_type.is_file() {
            let name = entry.file_name();
            if name == ".timestamp" {
                continue;
            }
            let rel_str = child_rel.to_string_lossy().replace('\\', "/");
            if let Ok(rp) = RelPath::new(&rel_str) {
                out.push(rp);
            }
        }
    }
    Ok(())
}
