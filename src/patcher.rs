//! Applies a parsed diff to a working tree (spec §4.3).
//!
//! Grounded in `original_source/quilt/patch.py`'s `_patch_tree`/
//! `_FilePatcher` for the base per-file algorithm (read src, stream
//! hunks, write a fresh temp file, rename over the target), extended with
//! the hunk-relocation search spec §4.3 requires and §9 note 1 always
//! enables. Unlike the Python original this crate works against an
//! in-memory line buffer per file rather than two open file handles; that
//! lets a failing file section be detected before any byte of this patch
//! is written to disk, which is what gives push its rollback-on-conflict
//! guarantee for free (spec §7) instead of needing an explicit undo log.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::diff::{FileSection, Hunk, HunkLine, ParsedDiff};
use crate::path::{self, PathError, RelPath};

/// Why applying a file section to the working tree failed (spec §4.3,
/// §7's `Conflict` kind). Matches the four reasons named in spec §7's
/// table and the message text of `original_source/quilt/patch.py`'s
/// `_FilePatcher` where practical.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum Conflict {
    #[error("{path}: target file missing")]
    FileMissing { path: String },
    #[error("{path}: target file already exists")]
    FileAlreadyExists { path: String },
    #[error("{path}: source line mismatch")]
    HunkNotFound { path: String },
    #[error("{path}: extra data in deleted file")]
    ExtraDataInDeletedFile { path: String },
}

/// Errors `apply_diff` can return: a structural [`Conflict`], a
/// [`PathError`] caught before any filesystem mutation, or a bare I/O
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum PatchApplyError {
    #[error(transparent)]
    Conflict(#[from] Conflict),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PatchApplyError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PatchApplyError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Controls one `apply_diff` call.
#[derive(Debug, Clone, Copy)]
pub struct ApplyOptions {
    /// Leading path components dropped from each patch-internal filename.
    pub strip: usize,
    /// Apply the patch's hunks in reverse (swap src/dest roles).
    pub reverse: bool,
    /// Compute conflicts but do not touch the filesystem.
    pub dry_run: bool,
}

/// What happened to one file as a result of applying a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOutcome {
    pub path: RelPath,
    pub created: bool,
    pub deleted: bool,
}

#[derive(Clone)]
struct LineRec {
    payload: Vec<u8>,
    has_newline: bool,
}

fn split_file_lines(content: &[u8]) -> Vec<LineRec> {
    if content.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut start = 0;
    while start < content.len() {
        match content[start..].iter().position(|&b| b == b'\n') {
            Some(rel) => {
                out.push(LineRec {
                    payload: content[start..start + rel].to_vec(),
                    has_newline: true,
                });
                start += rel + 1;
            }
            None => {
                out.push(LineRec {
                    payload: content[start..].to_vec(),
                    has_newline: false,
                });
                start = content.len();
            }
        }
    }
    out
}

fn join_file_lines(lines: &[LineRec]) -> Vec<u8> {
    let mut out = Vec::new();
    for line in lines {
        out.extend_from_slice(&line.payload);
        if line.has_newline {
            out.push(b'\n');
        }
    }
    out
}

/// A hunk's src/dest roles after the patch-level `reverse` flag has been
/// applied, and the derived flat list of expected src-side payloads used
/// for both the fast-path check and the relocation search.
struct EffectiveHunk<'a> {
    src_begin: usize,
    lines: &'a [HunkLine],
    reverse: bool,
}

impl<'a> EffectiveHunk<'a> {
    fn new(hunk: &'a Hunk, reverse: bool) -> Self {
        let src_begin = if reverse { hunk.dest_begin } else { hunk.src_begin };
        EffectiveHunk {
            src_begin,
            lines: &hunk.lines,
            reverse,
        }
    }

    fn in_src(&self, line: &HunkLine) -> bool {
        if self.reverse {
            line.in_dest
        } else {
            line.in_src
        }
    }

    fn in_dest(&self, line: &HunkLine) -> bool {
        if self.reverse {
            line.in_src
        } else {
            line.in_dest
        }
    }

    fn src_payloads(&self) -> Vec<&[u8]> {
        self.lines
            .iter()
            .filter(|l| self.in_src(l))
            .map(|l| l.payload.as_slice())
            .collect()
    }
}

fn window_matches(src: &[LineRec], start: usize, expected: &[&[u8]]) -> bool {
    if start + expected.len() > src.len() {
        return false;
    }
    src[start..start + expected.len()]
        .iter()
        .zip(expected.iter())
        .all(|(line, payload)| line.payload.as_slice() == *payload)
}

/// Find the best relocation offset for `expected` within `src`, searching
/// both directions from `declared` and preferring the nearer match (ties
/// broken forward), per spec §4.3 "Hunk relocation".
fn find_relocated_offset(src: &[LineRec], declared: usize, expected: &[&[u8]]) -> Option<usize> {
    if expected.is_empty() {
        return Some(declared.min(src.len()));
    }
    let max_start = src.len().saturating_sub(expected.len());
    let mut best: Option<(usize, usize)> = None; // (distance, offset)
    for start in 0..=max_start {
        if window_matches(src, start, expected) {
            let distance = start.abs_diff(declared);
            match best {
                None => best = Some((distance, start)),
                Some((best_distance, best_start)) => {
                    if distance < best_distance
                        || (distance == best_distance && start >= declared && best_start < declared)
                    {
                        best = Some((distance, start));
                    }
                }
            }
        }
    }
    best.map(|(_, start)| start)
}

/// Apply one hunk to `dest` starting from `src` at `src_cursor`, appending
/// context/inserted lines to `dest` and advancing `src_cursor` past the
/// consumed src lines. Performs relocation when the declared position
/// doesn't match and `dest_exists`.
fn apply_hunk(
    eff: &EffectiveHunk<'_>,
    src: &[LineRec],
    src_cursor: &mut usize,
    dest: &mut Vec<LineRec>,
    dest_exists: bool,
    path_display: &str,
) -> Result<(), Conflict> {
    let expected = eff.src_payloads();

    // Copy straight-through context up to the declared position first;
    // if relocation fires we'll have copied too much/little and redo it.
    let dest_len_before_context = dest.len();
    let cursor_before = *src_cursor;

    let mut start = eff.src_begin.max(*src_cursor);
    if !window_matches(src, start, &expected) {
        if !dest_exists {
            return Err(Conflict::HunkNotFound {
                path: path_display.to_string(),
            });
        }
        match find_relocated_offset(src, eff.src_begin, &expected) {
            Some(found) if found >= *src_cursor => {
                debug!(
                    "{}: relocated hunk from declared {} to {}",
                    path_display, eff.src_begin, found
                );
                start = found;
            }
            _ => {
                return Err(Conflict::HunkNotFound {
                    path: path_display.to_string(),
                });
            }
        }
    }

    dest.truncate(dest_len_before_context);
    *src_cursor = cursor_before;

    // Context before the (possibly relocated) hunk start.
    for line in &src[*src_cursor..start] {
        dest.push(line.clone());
    }
    *src_cursor = start;

    for line in eff.lines {
        if eff.in_src(line) {
            trace!("{}: consuming src line at {}", path_display, *src_cursor);
            *src_cursor += 1;
        }
        if eff.in_dest(line) {
            dest.push(LineRec {
                payload: line.payload.clone(),
                has_newline: line.has_newline,
            });
        }
    }

    Ok(())
}

/// Apply every file section of `diff` to `work_dir` according to
/// `options`. On success, returns one [`FileOutcome`] per section in
/// order. On the first conflict, nothing on disk has changed — the whole
/// patch is computed in memory before anything is written (spec §7's
/// rollback-on-conflict guarantee).
pub fn apply_diff(
    diff: &ParsedDiff,
    work_dir: &Path,
    backup_dir: Option<&Path>,
    options: &ApplyOptions,
) -> Result<Vec<FileOutcome>, PatchApplyError> {
    let mut planned = Vec::with_capacity(diff.sections.len());
    for section in &diff.sections {
        planned.push(plan_file(section, work_dir, backup_dir, options)?);
    }

    if !options.dry_run {
        for plan in &planned {
            commit_file(plan)?;
        }
    }

    Ok(planned.into_iter().map(|p| p.outcome).collect())
}

enum PlannedAction {
    Write(Vec<u8>),
    Delete,
}

enum BackupAction {
    StoreContent(Vec<u8>),
    StorePlaceholder,
}

struct PlannedFile {
    target_abs: PathBuf,
    action: PlannedAction,
    backup_path: Option<PathBuf>,
    backup_action: Option<BackupAction>,
    outcome: FileOutcome,
}

fn plan_file(
    section: &FileSection,
    work_dir: &Path,
    backup_dir: Option<&Path>,
    options: &ApplyOptions,
) -> Result<PlannedFile, PatchApplyError> {
    let rel = RelPath::from_components(&section.filename)?;
    let rel = rel.strip_prefix_components(options.strip)?;
    let target_abs = rel.to_path(work_dir);
    let path_display = rel.as_str().to_string();

    let eff_src_exists = if options.reverse {
        section.dest_exists
    } else {
        section.src_exists
    };
    let eff_dest_exists = if options.reverse {
        section.src_exists
    } else {
        section.dest_exists
    };

    let file_exists_on_disk = target_abs.is_file();

    let src_lines: Vec<LineRec> = if eff_src_exists {
        if !file_exists_on_disk {
            return Err(Conflict::FileMissing {
                path: path_display.clone(),
            }
            .into());
        }
        let bytes = fs::read(&target_abs).map_err(|e| PatchApplyError::io(&target_abs, e))?;
        split_file_lines(&bytes)
    } else {
        if file_exists_on_disk {
            return Err(Conflict::FileAlreadyExists {
                path: path_display.clone(),
            }
            .into());
        }
        Vec::new()
    };

    let mut dest_lines: Vec<LineRec> = Vec::new();
    let mut src_cursor = 0usize;

    for hunk in &section.hunks {
        let eff = EffectiveHunk::new(hunk, options.reverse);
        apply_hunk(
            &eff,
            &src_lines,
            &mut src_cursor,
            &mut dest_lines,
            eff_dest_exists,
            &path_display,
        )?;
    }

    // Remainder of src after the last hunk.
    if eff_dest_exists {
        for line in &src_lines[src_cursor..] {
            dest_lines.push(line.clone());
        }
        src_cursor = src_lines.len();
    }
    if eff_src_exists && src_cursor != src_lines.len() {
        return Err(Conflict::ExtraDataInDeletedFile {
            path: path_display.clone(),
        }
        .into());
    }

    let backup_path = backup_dir.map(|dir| rel.to_path(dir));
    let backup_action = match &backup_path {
        Some(bp) if !bp.exists() => Some(if eff_src_exists {
            BackupAction::StoreContent(join_file_lines(&src_lines))
        } else {
            BackupAction::StorePlaceholder
        }),
        _ => None,
    };

    let created = !eff_src_exists && eff_dest_exists;
    let deleted = eff_src_exists && !eff_dest_exists;

    let action = if eff_dest_exists {
        PlannedAction::Write(join_file_lines(&dest_lines))
    } else {
        PlannedAction::Delete
    };

    Ok(PlannedFile {
        target_abs,
        action,
        backup_path,
        backup_action,
        outcome: FileOutcome {
            path: rel,
            created,
            deleted,
        },
    })
}

fn commit_file(plan: &PlannedFile) -> Result<(), PatchApplyError> {
    if let (Some(backup_path), Some(backup_action)) = (&plan.backup_path, &plan.backup_action) {
        let bytes: &[u8] = match backup_action {
            BackupAction::StoreContent(bytes) => bytes,
            BackupAction::StorePlaceholder => &[],
        };
        path::atomic_write(backup_path, bytes).map_err(|e| PatchApplyError::io(backup_path, e))?;
    }

    match &plan.action {
        PlannedAction::Write(bytes) => {
            path::atomic_write(&plan.target_abs, bytes)
                .map_err(|e| PatchApplyError::io(&plan.target_abs, e))?;
        }
        PlannedAction::Delete => {
            if plan.target_abs.exists() {
                fs::remove_file(&plan.target_abs)
                    .map_err(|e| PatchApplyError::io(&plan.target_abs, e))?;
            }
        }
    }
    Ok(())
}
