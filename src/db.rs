//! On-disk state: the patch series, the applied stack, and per-patch
//! backup/refresh bookkeeping under `<pc_dir>/` (spec §3, §4.4).
//!
//! Grounded in `original_source/quilt/patch.py` and `quilt/top.py` for the
//! file layout (`series`, `applied-patches`, `<name>/`, `<name>/.timestamp`,
//! `<name>~refresh`) and in the teacher's `path.rs`-equivalent atomic-write
//! pattern for every mutation.

use std::fs;
use std::io;
use std::path::PathBuf;

use crate::path;

/// An entry in the series or applied stack. Equality is name-only (spec
/// §3): `strip`/`reverse` are metadata, not identity.
#[derive(Debug, Clone)]
pub struct Patch {
    pub name: String,
    pub strip: usize,
    pub reverse: bool,
}

impl Patch {
    pub fn new(name: impl Into<String>) -> Self {
        Patch {
            name: name.into(),
            strip: 1,
            reverse: false,
        }
    }
}

impl PartialEq for Patch {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}
impl Eq for Patch {}

const APPLIED_PATCHES_FILE: &str = "applied-patches";
const SERIES_FILE: &str = "series";
const TIMESTAMP_FILE: &str = ".timestamp";

/// Handle to `<patches_dir>/` and `<pc_dir>/` for one working tree.
#[derive(Debug, Clone)]
pub struct PatchDb {
    pub patches_dir: PathBuf,
    pub pc_dir: PathBuf,
}

impl PatchDb {
    pub fn new(patches_dir: PathBuf, pc_dir: PathBuf) -> Self {
        PatchDb { patches_dir, pc_dir }
    }

    /// Parse a `NAME ( -pN )? ( -R )? ( #comment )?` line (spec §6). `None`
    /// for blank lines and lines starting with `#`.
    fn parse_series_line(line: &str) -> Option<Patch> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        let mut tokens = trimmed.split_whitespace();
        let name = tokens.next()?.to_string();
        let mut strip = 1usize;
        let mut reverse = false;
        for tok in tokens {
            if tok.starts_with('#') {
                break;
            } else if let Some(digits) = tok.strip_prefix("-p") {
                if let Ok(n) = digits.parse() {
                    strip = n;
                }
            } else if tok == "-R" {
                reverse = true;
            }
        }
        Some(Patch { name, strip, reverse })
    }

    fn format_series_line(patch: &Patch) -> String {
        let mut line = patch.name.clone();
        if patch.strip != 1 {
            line.push_str(&format!(" -p{}", patch.strip));
        }
        if patch.reverse {
            line.push_str(" -R");
        }
        line
    }

    /// Parse `<patches_dir>/series`. A missing file means an empty series.
    pub fn series_patches(&self) -> io::Result<Vec<Patch>> {
        let path = self.patches_dir.join(SERIES_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(content.lines().filter_map(Self::parse_series_line).collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Rewrite `<patches_dir>/series` atomically, preserving `-pN`/`-R`
    /// suffixes.
    pub fn save_series(&self, patches: &[Patch]) -> io::Result<()> {
        let mut content = String::new();
        for patch in patches {
            content.push_str(&Self::format_series_line(patch));
            content.push('\n');
        }
        path::atomic_write(&self.patches_dir.join(SERIES_FILE), content.as_bytes())
    }

    fn load_applied_names(&self) -> io::Result<Vec<String>> {
        let path = self.pc_dir.join(APPLIED_PATCHES_FILE);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn save_applied_names(&self, names: &[String]) -> io::Result<()> {
        let mut content = String::new();
        for name in names {
            content.push_str(name);
            content.push('\n');
        }
        path::atomic_write(&self.pc_dir.join(APPLIED_PATCHES_FILE), content.as_bytes())
    }

    /// Parse `<pc_dir>/applied-patches`, resolving each name's `strip`/
    /// `reverse` from the series (spec §3 "subset of Series"). A missing
    /// file means an empty stack.
    pub fn applied_patches(&self) -> io::Result<Vec<Patch>> {
        let names = self.load_applied_names()?;
        let series = self.series_patches()?;
        Ok(names
            .into_iter()
            .map(|name| {
                series
                    .iter()
                    .find(|p| p.name == name)
                    .cloned()
                    .unwrap_or_else(|| Patch::new(name))
            })
            .collect())
    }

    /// The last applied patch, or `None` if the stack is empty.
    pub fn top(&self) -> io::Result<Option<Patch>> {
        Ok(self.applied_patches()?.into_iter().last())
    }

    /// Append `patch` to the applied stack.
    pub fn push_applied(&self, patch: &Patch) -> io::Result<()> {
        let mut names = self.load_applied_names()?;
        names.push(patch.name.clone());
        self.save_applied_names(&names)
    }

    /// Remove and return the topmost applied patch.
    pub fn pop_applied(&self) -> io::Result<Option<Patch>> {
        let mut names = self.load_applied_names()?;
        let popped_name = names.pop();
        self.save_applied_names(&names)?;
        match popped_name {
            None => Ok(None),
            Some(name) => {
                let series = self.series_patches()?;
                Ok(Some(
                    series
                        .into_iter()
                        .find(|p| p.name == name)
                        .unwrap_or_else(|| Patch::new(name)),
                ))
            }
        }
    }

    /// `<pc_dir>/<name>/`, the backup tree's root for `name`.
    pub fn backup_dir(&self, name: &str) -> PathBuf {
        self.pc_dir.join(name)
    }

    fn timestamp_path(&self, name: &str) -> PathBuf {
        self.backup_dir(name).join(TIMESTAMP_FILE)
    }

    /// Write/refresh the `.timestamp` sentinel at the root of `name`'s
    /// backup tree.
    pub fn timestamp_touch(&self, name: &str) -> io::Result<()> {
        path::atomic_write(&self.timestamp_path(name), &[])
    }

    fn refresh_marker_path(&self, name: &str) -> PathBuf {
        self.pc_dir.join(format!("{name}~refresh"))
    }

    pub fn refresh_marker_is_set(&self, name: &str) -> bool {
        self.refresh_marker_path(name).exists()
    }

    pub fn refresh_marker_set(&self, name: &str) -> io::Result<()> {
        path::atomic_write(&self.refresh_marker_path(name), &[])
    }

    pub fn refresh_marker_clear(&self, name: &str) -> io::Result<()> {
        let path = self.refresh_marker_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove a patch's entire backup tree (used by `pop` once every file
    /// has been restored).
    pub fn remove_backup_dir(&self, name: &str) -> io::Result<()> {
        let dir = self.backup_dir(name);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
