//! A "quilt"-style stacked patch manager core: parses unified diffs,
//! applies them to a working tree with conflict detection and hunk
//! relocation, tracks a push/pop stack of named patches with per-patch
//! backups, and regenerates patches by re-diffing the working tree against
//! the preserved originals.
//!
//! ## Layout
//!
//! - [`path`] — relative-path validation and atomic filesystem primitives
//!   every other module builds on.
//! - [`diff`] — streaming unified-diff parser ([`diff::parse`]) and writer
//!   ([`diff::write_unified_diff`]).
//! - [`patcher`] — [`patcher::apply_diff`], which applies a parsed diff to a
//!   working tree.
//! - [`db`] — [`db::PatchDb`], the on-disk series/applied-stack/backup-tree
//!   bookkeeping under `<pc_dir>/`.
//! - [`signals`] — the [`signals::Signals`] observer trait a caller
//!   implements to receive progress.
//! - [`stack`] — [`stack::StackOps`], the high-level push/pop/add/revert/
//!   refresh/import protocol.
//! - [`config`] — [`config::Config`], directory layout resolved from
//!   environment overrides.
//! - [`error`] — [`error::StackError`], the error type [`stack::StackOps`]
//!   returns.
//!
//! ## Example
//!
//! ```
//! use patchstack::config::Config;
//! use patchstack::db::PatchDb;
//! use patchstack::signals::NullSignals;
//! use patchstack::stack::StackOps;
//! use std::fs;
//! use tempfile::tempdir;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dir = tempdir()?;
//! fs::write(dir.path().join("f"), "old\n")?;
//!
//! let config = Config::new(dir.path());
//! fs::create_dir_all(&config.patches_dir)?;
//! fs::write(
//!     config.patches_dir.join("p.patch"),
//!     "--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n",
//! )?;
//!
//! let db = PatchDb::new(config.patches_dir.clone(), config.pc_dir.clone());
//! let ops = StackOps::new(config.working_dir.clone(), db);
//! ops.new_patch("p.patch")?;
//! ops.push(None, false, &mut NullSignals)?;
//!
//! assert_eq!(fs::read_to_string(dir.path().join("f"))?, "new\n");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod diff;
pub mod error;
pub mod patcher;
pub mod path;
pub mod signals;
pub mod stack;

pub use error::StackError;
