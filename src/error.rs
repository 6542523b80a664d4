//! Top-level error taxonomy (spec §7).
//!
//! Each component has its own error type close to where it's raised
//! (`diff::ParseError`, `patcher::Conflict`, `path::PathError`); this module
//! is the umbrella `StackError` that `StackOps` returns, so a caller can
//! match on one enum regardless of which subsystem failed.

use std::path::PathBuf;

use crate::diff::ParseError;
use crate::patcher::{Conflict, PatchApplyError};
use crate::path::PathError;

/// Errors surfaced by [`crate::stack::StackOps`].
#[derive(Debug, thiserror::Error)]
pub enum StackError {
    /// Malformed diff bytes; see [`ParseError`] for the specific reason.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Apply failed against the working tree; see [`Conflict`].
    #[error(transparent)]
    Conflict(#[from] Conflict),

    /// A path failed validation before any filesystem mutation happened.
    #[error(transparent)]
    Path(#[from] PathError),

    /// `push` was requested but every patch in the series is already
    /// applied.
    #[error("all patches in series are applied")]
    AllPatchesApplied,

    /// `pop`, `refresh`, or `top` was requested with an empty applied
    /// stack.
    #[error("no patches applied")]
    NoPatchesApplied,

    /// There are no patches in the series at all (distinct from "all
    /// applied": series itself is empty).
    #[error("no patches in series")]
    NoPatchesInSeries,

    /// `new` or `import` named a patch that already exists in the series
    /// or is already applied.
    #[error("patch already exists: {0}")]
    PatchAlreadyExists(String),

    /// A named patch isn't present in the series.
    #[error("unknown patch: {0}")]
    UnknownPatch(String),

    /// `refresh` produced output byte-identical to the patch already on
    /// disk.
    #[error("nothing to refresh")]
    NothingToRefresh,

    /// `push` was blocked because the current top patch has a
    /// [`RefreshMarker`](crate::db::PatchDb) set and `force` wasn't given.
    #[error("applied patch {0} needs a refresh before the next patch can be pushed")]
    NeedsRefresh(String),

    /// Underlying filesystem error, other than the ENOENT/EEXIST cases
    /// each component already turns into a typed variant.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StackError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StackError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<PatchApplyError> for StackError {
    fn from(err: PatchApplyError) -> Self {
        match err {
            PatchApplyError::Conflict(c) => StackError::Conflict(c),
            PatchApplyError::Path(p) => StackError::Path(p),
            PatchApplyError::Io { path, source } => StackError::Io { path, source },
        }
    }
}
