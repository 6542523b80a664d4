//! High-level patch-stack operations (spec §4.5): `new`, `push`, `pop`,
//! `delete`, `add`, `revert`, `refresh`, `import`, plus the §14-supplemented
//! `diff_top`.
//!
//! Grounded in `original_source/quilt/top.py` and `quilt/refresh.py` for the
//! operation shapes, driving [`crate::patcher::apply_diff`] for push/pop and
//! [`crate::diff::write_unified_diff`] for refresh, with every mutation
//! going through [`crate::db::PatchDb`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::db::{Patch, PatchDb};
use crate::diff::{self, write_unified_diff, DiffSide};
use crate::error::StackError;
use crate::patcher::{self, ApplyOptions, PatchApplyError};
use crate::path::{self, RelPath};
use crate::signals::Signals;

/// Ties a working tree to its [`PatchDb`] and exposes the stack protocol.
pub struct StackOps {
    pub working_dir: PathBuf,
    pub db: PatchDb,
}

impl StackOps {
    pub fn new(working_dir: PathBuf, db: PatchDb) -> Self {
        StackOps { working_dir, db }
    }

    fn io_err(path: impl AsRef<Path>) -> impl FnOnce(io::Error) -> StackError {
        let path = path.as_ref().to_path_buf();
        move |e| StackError::io(path, e)
    }

    fn resolve_applied(&self, patch: Option<&str>) -> Result<String, StackError> {
        let applied = self
            .db
            .applied_patches()
            .map_err(Self::io_err(&self.db.pc_dir))?;
        match patch {
            Some(name) => {
                if applied.iter().any(|p| p.name == name) {
                    Ok(name.to_string())
                } else {
                    Err(StackError::UnknownPatch(name.to_string()))
                }
            }
            None => applied
                .last()
                .map(|p| p.name.clone())
                .ok_or(StackError::NoPatchesApplied),
        }
    }

    /// `new(name)` (spec §4.5): append `name` to the series, just after the
    /// topmost applied position.
    pub fn new_patch(&self, name: &str) -> Result<(), StackError> {
        let mut series = self
            .db
            .series_patches()
            .map_err(Self::io_err(&self.db.patches_dir))?;
        let applied = self
            .db
            .applied_patches()
            .map_err(Self::io_err(&self.db.pc_dir))?;
        if series.iter().any(|p| p.name == name) || applied.iter().any(|p| p.name == name) {
            return Err(StackError::PatchAlreadyExists(name.to_string()));
        }
        let pos = applied.len();
        series.insert(pos, Patch::new(name));
        self.db
            .save_series(&series)
            .map_err(Self::io_err(&self.db.patches_dir))?;
        info!("new patch {name} added to series");
        Ok(())
    }

    /// `push(target?, force=false)` (spec §4.5).
    pub fn push(
        &self,
        target: Option<&str>,
        force: bool,
        signals: &mut dyn Signals,
    ) -> Result<String, StackError> {
        let series = self
            .db
            .series_patches()
            .map_err(Self::io_err(&self.db.patches_dir))?;
        let applied = self
            .db
            .applied_patches()
            .map_err(Self::io_err(&self.db.pc_dir))?;

        if series.is_empty() {
            return Err(StackError::NoPatchesInSeries);
        }
        if applied.len() >= series.len() {
            return Err(StackError::AllPatchesApplied);
        }
        let next = series[applied.len()].clone();
        if let Some(t) = target {
            if t != next.name {
                return Err(StackError::UnknownPatch(t.to_string()));
            }
        }
        if let Some(top) = applied.last() {
            if self.db.refresh_marker_is_set(&top.name) && !force {
                return Err(StackError::NeedsRefresh(top.name.clone()));
            }
        }

        info!("pushing {}", next.name);
        signals.applying_patch(&next.name);

        let patch_path = self.db.patches_dir.join(&next.name);
        let bytes = fs::read(&patch_path).map_err(Self::io_err(&patch_path))?;
        let parsed = diff::parse(&bytes)?;
        let backup_dir = self.db.backup_dir(&next.name);
        let options = ApplyOptions {
            strip: next.strip,
            reverse: next.reverse,
            dry_run: false,
        };

        match patcher::apply_diff(&parsed, &self.working_dir, Some(&backup_dir), &options) {
            Ok(outcomes) => {
                self.db
                    .push_applied(&next)
                    .map_err(Self::io_err(&self.db.pc_dir))?;
                self.db
                    .timestamp_touch(&next.name)
                    .map_err(Self::io_err(&self.db.pc_dir))?;
                if outcomes.is_empty() {
                    signals.applied_empty_patch(&next.name, true);
                }
                signals.applied(&next.name);
                debug!("applied {} ({} files touched)", next.name, outcomes.len());
                Ok(next.name)
            }
            Err(PatchApplyError::Conflict(conflict)) if force => {
                warn!(
                    "forcing apply of {} despite conflict: {conflict}",
                    next.name
                );
                self.db
                    .push_applied(&next)
                    .map_err(Self::io_err(&self.db.pc_dir))?;
                self.db
                    .refresh_marker_set(&next.name)
                    .map_err(Self::io_err(&self.db.pc_dir))?;
                self.db
                    .timestamp_touch(&next.name)
                    .map_err(Self::io_err(&self.db.pc_dir))?;
                signals.applied(&next.name);
                Ok(next.name)
            }
            Err(PatchApplyError::Conflict(conflict)) => Err(StackError::Conflict(conflict)),
            Err(PatchApplyError::Path(p)) => Err(StackError::Path(p)),
            Err(PatchApplyError::Io { path, source }) => Err(StackError::Io { path, source }),
        }
    }

    /// Pop exactly the current top, restoring its backup tree. Returns
    /// `None` if the stack was already empty.
    fn pop_one(&self, force: bool, signals: &mut dyn Signals) -> Result<Option<Patch>, StackError> {
        let applied = self
            .db
            .applied_patches()
            .map_err(Self::io_err(&self.db.pc_dir))?;
        let Some(top) = applied.last().cloned() else {
            return Ok(None);
        };
        if self.db.refresh_marker_is_set(&top.name) && !force {
            return Err(StackError::NeedsRefresh(top.name));
        }

        signals.unapplying(&top.name);
        let backup_dir = self.db.backup_dir(&top.name);
        for rel in path::walk_files_sorted(&backup_dir).map_err(Self::io_err(&backup_dir))? {
            let backup_abs = rel.to_path(&backup_dir);
            let target_abs = rel.to_path(&self.working_dir);
            let bytes = fs::read(&backup_abs).map_err(Self::io_err(&backup_abs))?;
            if bytes.is_empty() {
                if target_abs.exists() {
                    fs::remove_file(&target_abs).map_err(Self::io_err(&target_abs))?;
                }
            } else {
                path::atomic_write(&target_abs, &bytes).map_err(Self::io_err(&target_abs))?;
            }
        }
        self.db
            .remove_backup_dir(&top.name)
            .map_err(Self::io_err(&self.db.pc_dir))?;
        self.db
            .refresh_marker_clear(&top.name)
            .map_err(Self::io_err(&self.db.pc_dir))?;
        let popped = self
            .db
            .pop_applied()
            .map_err(Self::io_err(&self.db.pc_dir))?;
        let new_top = self.db.top().map_err(Self::io_err(&self.db.pc_dir))?;
        signals.unapplied(new_top.as_ref().map(|p| p.name.as_str()));
        debug!("popped {}", top.name);
        Ok(popped)
    }

    /// `pop(target?, all=false)` (spec §4.5). `force` is an extension this
    /// crate adds symmetrically with `push`'s `force` — the spec text
    /// mentions "unless forced" for pop without naming the parameter.
    pub fn pop(
        &self,
        target: Option<&str>,
        all: bool,
        force: bool,
        signals: &mut dyn Signals,
    ) -> Result<(), StackError> {
        let applied = self
            .db
            .applied_patches()
            .map_err(Self::io_err(&self.db.pc_dir))?;
        if applied.is_empty() {
            return Err(StackError::NoPatchesApplied);
        }
        loop {
            let applied = self
                .db
                .applied_patches()
                .map_err(Self::io_err(&self.db.pc_dir))?;
            let Some(top) = applied.last() else { break };
            if let Some(t) = target {
                if top.name == t {
                    break;
                }
            }
            self.pop_one(force, signals)?;
            if !all && target.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// `delete(target?, remove=false, backup=false, next=false)` (spec
    /// §4.5).
    pub fn delete(
        &self,
        target: Option<&str>,
        remove: bool,
        backup: bool,
        next: bool,
        signals: &mut dyn Signals,
    ) -> Result<(), StackError> {
        let mut series = self
            .db
            .series_patches()
            .map_err(Self::io_err(&self.db.patches_dir))?;
        let applied = self
            .db
            .applied_patches()
            .map_err(Self::io_err(&self.db.pc_dir))?;

        let name = if let Some(t) = target {
            t.to_string()
        } else if next {
            series
                .get(applied.len())
                .map(|p| p.name.clone())
                .ok_or(StackError::NoPatchesInSeries)?
        } else {
            applied
                .last()
                .cloned()
                .ok_or(StackError::NoPatchesApplied)?
                .name
        };

        if !series.iter().any(|p| p.name == name) {
            return Err(StackError::UnknownPatch(name));
        }
        let is_applied = applied.iter().any(|p| p.name == name);
        signals.deleting_patch(&name, is_applied);

        if is_applied {
            self.pop_one(true, signals)?;
        }

        series.retain(|p| p.name != name);
        self.db
            .save_series(&series)
            .map_err(Self::io_err(&self.db.patches_dir))?;

        if remove {
            let patch_path = self.db.patches_dir.join(&name);
            if backup {
                let backup_path = self.db.patches_dir.join(format!("{name}~"));
                fs::rename(&patch_path, &backup_path).map_err(Self::io_err(&patch_path))?;
            } else {
                match fs::remove_file(&patch_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StackError::io(patch_path, e)),
                }
            }
        }
        signals.deleted_patch(&name);
        Ok(())
    }

    /// `add(files, patch?)` (spec §4.5).
    pub fn add(
        &self,
        files: &[RelPath],
        patch: Option<&str>,
        signals: &mut dyn Signals,
    ) -> Result<(), StackError> {
        let name = self.resolve_applied(patch)?;
        let backup_dir = self.db.backup_dir(&name);
        for file in files {
            let backup_path = file.to_path(&backup_dir);
            if backup_path.exists() {
                signals.file_unchanged(file.as_str(), &name);
                continue;
            }
            let target_abs = file.to_path(&self.working_dir);
            let bytes = if target_abs.is_file() {
                fs::read(&target_abs).map_err(Self::io_err(&target_abs))?
            } else {
                Vec::new()
            };
            path::atomic_write(&backup_path, &bytes).map_err(Self::io_err(&backup_path))?;
            signals.file_added(file.as_str(), &name);
        }
        self.db
            .refresh_marker_set(&name)
            .map_err(Self::io_err(&self.db.pc_dir))?;
        Ok(())
    }

    /// `revert(files, patch?)` (spec §4.5).
    pub fn revert(
        &self,
        files: &[RelPath],
        patch: Option<&str>,
        signals: &mut dyn Signals,
    ) -> Result<(), StackError> {
        let name = self.resolve_applied(patch)?;
        let backup_dir = self.db.backup_dir(&name);
        for file in files {
            let backup_path = file.to_path(&backup_dir);
            if !backup_path.is_file() {
                signals.file_unchanged(file.as_str(), &name);
                continue;
            }
            let bytes = fs::read(&backup_path).map_err(Self::io_err(&backup_path))?;
            let target_abs = file.to_path(&self.working_dir);
            if bytes.is_empty() {
                if target_abs.exists() {
                    fs::remove_file(&target_abs).map_err(Self::io_err(&target_abs))?;
                }
            } else {
                path::atomic_write(&target_abs, &bytes).map_err(Self::io_err(&target_abs))?;
            }
            fs::remove_file(&backup_path).map_err(Self::io_err(&backup_path))?;
            signals.file_reverted(file.as_str(), &name);
        }
        let remaining =
            path::walk_files_sorted(&backup_dir).map_err(Self::io_err(&backup_dir))?;
        if remaining.is_empty() {
            self.db
                .refresh_marker_clear(&name)
                .map_err(Self::io_err(&self.db.pc_dir))?;
        }
        Ok(())
    }

    /// Shared refresh pipeline: re-diff every file in `name`'s backup tree
    /// against the current working tree (spec §4.5 `refresh`). Preserves
    /// the existing patch's preamble (the free-form text before the first
    /// `---`/`Index:` line) so a human's patch description survives.
    fn build_refreshed_patch(&self, name: &str) -> Result<Vec<u8>, StackError> {
        let patch_path = self.db.patches_dir.join(name);
        let mut out = match fs::read(&patch_path) {
            Ok(bytes) => diff::parse(&bytes).map(|p| p.preamble).unwrap_or_default(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Self::io_err(&patch_path)(e)),
        };

        let backup_dir = self.db.backup_dir(name);
        let files = path::walk_files_sorted(&backup_dir).map_err(Self::io_err(&backup_dir))?;
        for rel in files {
            let backup_path = rel.to_path(&backup_dir);
            let target_abs = rel.to_path(&self.working_dir);
            let backup_bytes = fs::read(&backup_path).map_err(Self::io_err(&backup_path))?;
            let origin = if backup_bytes.is_empty() {
                DiffSide::Absent
            } else {
                DiffSide::Present(&backup_bytes)
            };
            let current_bytes = fs::read(&target_abs).ok();
            let current = match &current_bytes {
                Some(b) => DiffSide::Present(b),
                None => DiffSide::Absent,
            };
            let label_a = format!("a/{}", rel.as_str());
            let label_b = format!("b/{}", rel.as_str());
            let chunk = write_unified_diff(origin, current, &label_a, &label_b, Some(rel.as_str()), 3);
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// `refresh(patch?)` (spec §4.5).
    pub fn refresh(&self, patch: Option<&str>, signals: &mut dyn Signals) -> Result<(), StackError> {
        let name = self.resolve_applied(patch)?;
        let new_bytes = self.build_refreshed_patch(&name)?;
        let patch_path = self.db.patches_dir.join(&name);
        let existing = fs::read(&patch_path).unwrap_or_default();
        if new_bytes == existing {
            return Err(StackError::NothingToRefresh);
        }
        path::atomic_write(&patch_path, &new_bytes).map_err(Self::io_err(&patch_path))?;
        self.db
            .timestamp_touch(&name)
            .map_err(Self::io_err(&self.db.pc_dir))?;
        self.db
            .refresh_marker_clear(&name)
            .map_err(Self::io_err(&self.db.pc_dir))?;
        signals.refreshed(&name);
        info!("refreshed {name}");
        Ok(())
    }

    /// The would-be-refreshed patch bytes for `patch` (or top), without
    /// writing anything — `quilt diff` (spec §14 supplement).
    pub fn diff_top(&self, patch: Option<&str>) -> Result<Vec<u8>, StackError> {
        let name = self.resolve_applied(patch)?;
        self.build_refreshed_patch(&name)
    }

    /// `import(files, name?)` (spec §4.5). Returns the names the files were
    /// imported under.
    pub fn import(&self, files: &[PathBuf], name: Option<&str>) -> Result<Vec<String>, StackError> {
        let mut series = self
            .db
            .series_patches()
            .map_err(Self::io_err(&self.db.patches_dir))?;
        let applied = self
            .db
            .applied_patches()
            .map_err(Self::io_err(&self.db.pc_dir))?;
        let mut insert_at = applied.len();
        let mut imported = Vec::with_capacity(files.len());

        for src in files {
            let dest_name = if files.len() == 1 {
                name.map(str::to_string)
                    .unwrap_or_else(|| Self::file_name(src))
            } else {
                Self::file_name(src)
            };
            if series.iter().any(|p| p.name == dest_name) {
                return Err(StackError::PatchAlreadyExists(dest_name));
            }
            let bytes = fs::read(src).map_err(Self::io_err(src))?;
            let dest_path = self.db.patches_dir.join(&dest_name);
            path::atomic_write(&dest_path, &bytes).map_err(Self::io_err(&dest_path))?;
            series.insert(insert_at, Patch::new(&dest_name));
            insert_at += 1;
            imported.push(dest_name);
        }

        self.db
            .save_series(&series)
            .map_err(Self::io_err(&self.db.patches_dir))?;
        for name in &imported {
            info!("imported {name}");
        }
        Ok(imported)
    }

    fn file_name(path: &Path) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::NullSignals;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, StackOps) {
        let dir = tempdir().unwrap();
        let db = PatchDb::new(dir.path().join("patches"), dir.path().join(".pc"));
        fs::create_dir_all(&db.patches_dir).unwrap();
        let ops = StackOps::new(dir.path().to_path_buf(), db);
        (dir, ops)
    }

    fn write_patch(ops: &StackOps, name: &str, content: &str) {
        fs::write(ops.db.patches_dir.join(name), content).unwrap();
    }

    #[test]
    fn push_pop_round_trip() {
        let (dir, ops) = setup();
        fs::write(dir.path().join("f"), "old\n").unwrap();
        write_patch(&ops, "p.patch", "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n");
        ops.new_patch("p.patch").unwrap();

        let mut signals = NullSignals;
        ops.push(None, false, &mut signals).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("f")).unwrap(), "new\n");
        assert_eq!(
            fs::read_to_string(ops.db.backup_dir("p.patch").join("f")).unwrap(),
            "old\n"
        );

        ops.pop(None, false, false, &mut signals).unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("f")).unwrap(), "old\n");
        assert!(ops.db.applied_patches().unwrap().is_empty());
    }

    #[test]
    fn push_without_series_fails() {
        let (_dir, ops) = setup();
        let mut signals = NullSignals;
        let err = ops.push(None, false, &mut signals).unwrap_err();
        assert!(matches!(err, StackError::NoPatchesInSeries));
    }

    #[test]
    fn push_conflict_without_force_leaves_tree_untouched() {
        let (dir, ops) = setup();
        fs::write(dir.path().join("f"), "conflict\n").unwrap();
        write_patch(&ops, "p.patch", "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n");
        ops.new_patch("p.patch").unwrap();

        let mut signals = NullSignals;
        let err = ops.push(None, false, &mut signals).unwrap_err();
        assert!(matches!(err, StackError::Conflict(_)));
        assert!(ops.db.applied_patches().unwrap().is_empty());
        assert_eq!(fs::read_to_string(dir.path().join("f")).unwrap(), "conflict\n");
    }

    #[test]
    fn push_with_force_sets_refresh_marker_and_blocks_next_push() {
        let (dir, ops) = setup();
        fs::write(dir.path().join("f"), "conflict\n").unwrap();
        write_patch(&ops, "p.patch", "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n");
        write_patch(&ops, "q.patch", "--- a/g\n+++ b/g\n@@ -0,0 +1 @@\n+hi\n");
        ops.new_patch("p.patch").unwrap();
        ops.new_patch("q.patch").unwrap();

        let mut signals = NullSignals;
        ops.push(None, true, &mut signals).unwrap();
        assert!(ops.db.refresh_marker_is_set("p.patch"));

        let err = ops.push(None, false, &mut signals).unwrap_err();
        assert!(matches!(err, StackError::NeedsRefresh(_)));
    }

    #[test]
    fn refresh_detects_no_change() {
        let (dir, ops) = setup();
        fs::write(dir.path().join("f"), "old\n").unwrap();
        write_patch(&ops, "p.patch", "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n");
        ops.new_patch("p.patch").unwrap();
        let mut signals = NullSignals;
        ops.push(None, false, &mut signals).unwrap();

        // The patch on disk has no `Index:` line, so the first refresh
        // always rewrites it once before a second refresh can be a no-op.
        ops.refresh(None, &mut signals).unwrap();
        let err = ops.refresh(None, &mut signals).unwrap_err();
        assert!(matches!(err, StackError::NothingToRefresh));
    }

    #[test]
    fn refresh_picks_up_working_tree_edit() {
        let (dir, ops) = setup();
        fs::write(dir.path().join("f"), "old\n").unwrap();
        write_patch(&ops, "p.patch", "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n");
        ops.new_patch("p.patch").unwrap();
        let mut signals = NullSignals;
        ops.push(None, false, &mut signals).unwrap();

        fs::write(dir.path().join("f"), "new\nextra\n").unwrap();
        ops.refresh(None, &mut signals).unwrap();
        let refreshed = fs::read_to_string(ops.db.patches_dir.join("p.patch")).unwrap();
        assert!(refreshed.contains("extra"));
    }

    #[test]
    fn add_and_revert_round_trip() {
        let (dir, ops) = setup();
        fs::write(dir.path().join("f"), "old\n").unwrap();
        write_patch(&ops, "p.patch", "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n");
        ops.new_patch("p.patch").unwrap();
        let mut signals = NullSignals;
        ops.push(None, false, &mut signals).unwrap();

        fs::write(dir.path().join("g"), "extra\n").unwrap();
        let g = RelPath::new("g").unwrap();
        ops.add(&[g.clone()], None, &mut signals).unwrap();
        assert!(ops.db.refresh_marker_is_set("p.patch"));

        ops.revert(&[g], None, &mut signals).unwrap();
        assert!(!dir.path().join("g").exists() || fs::read_to_string(dir.path().join("g")).unwrap() == "extra\n");
    }

    #[test]
    fn delete_unapplied_patch_removes_from_series() {
        let (_dir, ops) = setup();
        write_patch(&ops, "p.patch", "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n");
        ops.new_patch("p.patch").unwrap();
        let mut signals = NullSignals;
        ops.delete(Some("p.patch"), false, false, false, &mut signals)
            .unwrap();
        assert!(ops.db.series_patches().unwrap().is_empty());
    }

    #[test]
    fn import_adds_to_series() {
        let (dir, ops) = setup();
        let src = dir.path().join("external.patch");
        fs::write(&src, "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n").unwrap();
        let imported = ops.import(&[src], None).unwrap();
        assert_eq!(imported, vec!["external.patch".to_string()]);
        assert!(ops
            .db
            .series_patches()
            .unwrap()
            .iter()
            .any(|p| p.name == "external.patch"));
    }
}
