//! Unified-diff generation (spec §4.2).
//!
//! Reuses `similar::udiff::unified_diff`, the same free function the
//! teacher crate calls for its dry-run preview
//! (`Romelium-mpatch/src/lib.rs`'s `apply_patch`), so hunk formatting,
//! context merging, and the `\ No newline at end of file` marker all come
//! from the same well-exercised code path rather than a hand-rolled
//! formatter.

use similar::Algorithm;

/// One side of a diff: either the file doesn't exist (`/dev/null`) or it
/// has byte content.
#[derive(Debug, Clone, Copy)]
pub enum DiffSide<'a> {
    Absent,
    Present(&'a [u8]),
}

fn text_of(side: DiffSide<'_>) -> (bool, String) {
    match side {
        DiffSide::Absent => (false, String::new()),
        DiffSide::Present(bytes) => (true, String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Produce unified-diff bytes for `origin -> current`, equivalent to
/// `diff -u --label LEFT --label RIGHT LEFT RIGHT`, optionally prefixed
/// with an `Index: <index_header>` line.
///
/// Returns an empty `Vec` when both sides are byte-equal (including both
/// absent), per spec §4.2 — the caller interprets that as "no change".
pub fn write_unified_diff(
    origin: DiffSide<'_>,
    current: DiffSide<'_>,
    left_label: &str,
    right_label: &str,
    index_header: Option<&str>,
    context_radius: usize,
) -> Vec<u8> {
    let (origin_exists, origin_text) = text_of(origin);
    let (current_exists, current_text) = text_of(current);

    if origin_exists == current_exists && origin_text == current_text {
        return Vec::new();
    }

    let left = if origin_exists { left_label } else { "/dev/null" };
    let right = if current_exists { right_label } else { "/dev/null" };

    let body = similar::udiff::unified_diff(
        Algorithm::default(),
        &origin_text,
        &current_text,
        context_radius,
        Some((left, right)),
    );

    let mut out = Vec::new();
    if let Some(index) = index_header {
        out.extend_from_slice(format!("Index: {index}\n").as_bytes());
    }
    out.extend_from_slice(body.as_bytes());
    out
}
