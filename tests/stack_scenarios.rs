//! End-to-end scenarios against a real temp directory, covering the S1-S6
//! concrete scenarios and the path-safety/round-trip invariants.

use std::fs;

use patchstack::config::Config;
use patchstack::db::PatchDb;
use patchstack::diff::{self, write_unified_diff, DiffSide};
use patchstack::error::StackError;
use patchstack::signals::NullSignals;
use patchstack::stack::StackOps;
use indoc::indoc;
use tempfile::tempdir;

fn ops_for(dir: &std::path::Path) -> StackOps {
    let config = Config::new(dir);
    fs::create_dir_all(&config.patches_dir).unwrap();
    let db = PatchDb::new(config.patches_dir, config.pc_dir);
    StackOps::new(config.working_dir, db)
}

fn write_patch(ops: &StackOps, name: &str, content: &str) {
    fs::write(ops.db.patches_dir.join(name), content).unwrap();
}

// S1: push/pop round-trip.
#[test]
fn s1_push_pop_round_trip() {
    let dir = tempdir().unwrap();
    let ops = ops_for(dir.path());
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

// S2: file creation and deletion on pop.
#[test]
fn s2_push_creates_file_pop_deletes_it() {
    let dir = tempdir().unwrap();
    let ops = ops_for(dir.path());
    write_patch(&ops, "p.patch", "--- /dev/null\n+++ b/g\n@@ -0,0 +1 @@\n+hi\n");
    ops.new_patch("p.patch").unwrap();

    let mut signals = NullSignals;
    ops.push(None, false, &mut signals).unwrap();
    assert_eq!(fs::read_to_string(dir.path().join("g")).unwrap(), "hi\n");
    assert_eq!(fs::read(ops.db.backup_dir("p.patch").join("g")).unwrap(), Vec::<u8>::new());

    ops.pop(None, false, false, &mut signals).unwrap();
    assert!(!dir.path().join("g").exists());
}

// S3: refresh picks up a working-tree edit, then reports NothingToRefresh.
#[test]
fn s3_refresh_then_nothing_to_refresh() {
    let dir = tempdir().unwrap();
    let ops = ops_for(dir.path());
    fs::write(dir.path().join("f"), "old\n").unwrap();
    write_patch(&ops, "p.patch", "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n");
    ops.new_patch("p.patch").unwrap();
    let mut signals = NullSignals;
    ops.push(None, false, &mut signals).unwrap();

    let mut content = fs::read_to_string(dir.path().join("f")).unwrap();
    content.push_str("extra\n");
    fs::write(dir.path().join("f"), &content).unwrap();

    ops.refresh(None, &mut signals).unwrap();
    let refreshed = fs::read_to_string(ops.db.patches_dir.join("p.patch")).unwrap();
    assert!(refreshed.contains("-old\n"));
    assert!(refreshed.contains("+new\n"));
    assert!(refreshed.contains("extra\n"));

    let err = ops.refresh(None, &mut signals).unwrap_err();
    assert!(matches!(err, StackError::NothingToRefresh));
}

// S4: conflict without force leaves everything untouched.
#[test]
fn s4_conflict_without_force() {
    let dir = tempdir().unwrap();
    let ops = ops_for(dir.path());
    fs::write(dir.path().join("f"), "conflict\n").unwrap();
    write_patch(&ops, "p.patch", "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n");
    ops.new_patch("p.patch").unwrap();

    let mut signals = NullSignals;
    let err = ops.push(None, false, &mut signals).unwrap_err();
    assert!(matches!(err, StackError::Conflict(_)));
    assert!(ops.db.applied_patches().unwrap().is_empty());
    assert!(!ops.db.backup_dir("p.patch").exists());
    assert_eq!(fs::read_to_string(dir.path().join("f")).unwrap(), "conflict\n");
}

// S5: force apply sets a refresh marker and blocks the next push.
#[test]
fn s5_force_apply_blocks_next_push() {
    let dir = tempdir().unwrap();
    let ops = ops_for(dir.path());
    fs::write(dir.path().join("f"), "conflict\n").unwrap();
    write_patch(&ops, "p.patch", "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n");
    write_patch(&ops, "q.patch", "--- /dev/null\n+++ b/g\n@@ -0,0 +1 @@\n+hi\n");
    ops.new_patch("p.patch").unwrap();
    ops.new_patch("q.patch").unwrap();

    let mut signals = NullSignals;
    ops.push(None, true, &mut signals).unwrap();
    assert!(ops.db.refresh_marker_is_set("p.patch"));

    let err = ops.push(None, false, &mut signals).unwrap_err();
    assert!(matches!(err, StackError::NeedsRefresh(name) if name == "p.patch"));

    ops.refresh(Some("p.patch"), &mut signals).unwrap();
    assert!(!ops.db.refresh_marker_is_set("p.patch"));
    ops.push(None, false, &mut signals).unwrap();
    assert_eq!(fs::read_to_string(dir.path().join("g")).unwrap(), "hi\n");
}

// S6: relocation. 100-line file, hunk declares line 10, real content is at
// line 12.
#[test]
fn s6_hunk_relocation() {
    let dir = tempdir().unwrap();
    let ops = ops_for(dir.path());
    let mut content = String::new();
    for i in 0..100 {
        content.push_str(&format!("line{i}\n"));
    }
    fs::write(dir.path().join("f"), &content).unwrap();

    let patch = indoc! {"
        --- a/f
        +++ b/f
        @@ -10,3 +10,3 @@
         line10
        -line11
        +CHANGED
         line12
    "};
    write_patch(&ops, "p.patch", patch);
    ops.new_patch("p.patch").unwrap();

    let mut signals = NullSignals;
    ops.push(None, false, &mut signals).unwrap();
    let result = fs::read_to_string(dir.path().join("f")).unwrap();
    assert!(result.contains("CHANGED\n"));
    assert!(!result.contains("line11\n"));
}

// Invariant 6: path safety rejected before any filesystem mutation.
#[test]
fn path_safety_rejects_dotdot_before_touching_disk() {
    let dir = tempdir().unwrap();
    let ops = ops_for(dir.path());
    write_patch(
        &ops,
        "p.patch",
        "--- a/../escape\n+++ b/../escape\n@@ -1 +1 @@\n-a\n+b\n",
    );
    ops.new_patch("p.patch").unwrap();

    let mut signals = NullSignals;
    let err = ops.push(None, false, &mut signals).unwrap_err();
    assert!(matches!(err, StackError::Parse(_)));
    assert!(ops.db.applied_patches().unwrap().is_empty());
    assert!(!dir.path().join("escape").exists());
}

// Invariant 4: parser/writer round-trip.
#[test]
fn parser_writer_round_trip() {
    let a = b"line one\nline two\nline three\n";
    let b = b"line one\nCHANGED\nline three\nline four\n";
    let patch_bytes = write_unified_diff(
        DiffSide::Present(a),
        DiffSide::Present(b),
        "a/f",
        "b/f",
        None,
        3,
    );
    let parsed = diff::parse(&patch_bytes).unwrap();

    let dir = tempdir().unwrap();
    fs::write(dir.path().join("f"), a).unwrap();
    let outcomes = patchstack::patcher::apply_diff(
        &parsed,
        dir.path(),
        None,
        &patchstack::patcher::ApplyOptions {
            strip: 1,
            reverse: false,
            dry_run: false,
        },
    )
    .unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(fs::read(dir.path().join("f")).unwrap(), b);
}

#[test]
fn add_and_revert_round_trip() {
    let dir = tempdir().unwrap();
    let ops = ops_for(dir.path());
    fs::write(dir.path().join("f"), "old\n").unwrap();
    write_patch(&ops, "p.patch", "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n");
    ops.new_patch("p.patch").unwrap();
    let mut signals = NullSignals;
    ops.push(None, false, &mut signals).unwrap();

    fs::write(dir.path().join("g"), "untracked edit\n").unwrap();
    let g = patchstack::path::RelPath::new("g").unwrap();
    ops.add(&[g.clone()], None, &mut signals).unwrap();
    assert!(ops.db.refresh_marker_is_set("p.patch"));
    assert!(ops.db.backup_dir("p.patch").join("g").exists());

    ops.revert(&[g], None, &mut signals).unwrap();
    assert!(!ops.db.backup_dir("p.patch").join("g").exists());
}

#[test]
fn delete_pops_applied_patch_first() {
    let dir = tempdir().unwrap();
    let ops = ops_for(dir.path());
    fs::write(dir.path().join("f"), "old\n").unwrap();
    write_patch(&ops, "p.patch", "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n");
    ops.new_patch("p.patch").unwrap();
    let mut signals = NullSignals;
    ops.push(None, false, &mut signals).unwrap();

    ops.delete(Some("p.patch"), false, false, false, &mut signals)
        .unwrap();
    assert!(ops.db.series_patches().unwrap().is_empty());
    assert_eq!(fs::read_to_string(dir.path().join("f")).unwrap(), "old\n");
}

#[test]
fn diff_top_matches_refresh_output_without_writing() {
    let dir = tempdir().unwrap();
    let ops = ops_for(dir.path());
    fs::write(dir.path().join("f"), "old\n").unwrap();
    write_patch(&ops, "p.patch", "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n");
    ops.new_patch("p.patch").unwrap();
    let mut signals = NullSignals;
    ops.push(None, false, &mut signals).unwrap();
    fs::write(dir.path().join("f"), "new\nextra\n").unwrap();

    let preview = ops.diff_top(None).unwrap();
    let before = fs::read_to_string(ops.db.patches_dir.join("p.patch")).unwrap();
    ops.refresh(None, &mut signals).unwrap();
    let after = fs::read_to_string(ops.db.patches_dir.join("p.patch")).unwrap();

    assert_ne!(before, after);
    assert_eq!(preview, after.into_bytes());
}
