//! Streaming parser for unified diffs (spec §4.1).
//!
//! Grounded in `original_source/quilt/patch.py`'s `_Parser`/`_FilePatcher`
//! split (index line, filename pair, hunk range, hunk body), generalized
//! to produce an owned [`ParsedDiff`] value rather than driving a patcher
//! directly — `TreePatcher` consumes the same events from this module
//! instead of re-implementing the grammar.

use log::trace;

/// Reasons a byte stream fails to parse as a unified diff (spec §4.1).
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: invalid Index: line")]
    InvalidIndexLine { line: usize },
    #[error("line {line}: invalid source filename line")]
    InvalidSourceName { line: usize },
    #[error("line {line}: invalid destination filename line")]
    InvalidDestName { line: usize },
    #[error("line {line}: truncated patch header")]
    TruncatedHeader { line: usize },
    #[error("line {line}: truncated patch hunk")]
    TruncatedHunk { line: usize },
    #[error("line {line}: unexpected carriage return in patch file")]
    UnexpectedCR { line: usize },
    #[error("line {line}: absolute filename in patch")]
    AbsolutePath { line: usize },
    #[error("line {line}: patch filename escapes the working tree")]
    PathTraversal { line: usize },
    #[error("line {line}: invalid range for absent file")]
    InvalidRangeForAbsentFile { line: usize },
    #[error("line {line}: hunks out of order")]
    HunksOutOfOrder { line: usize },
}

/// One line inside a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HunkLine {
    /// Present on the source side (context or deletion).
    pub in_src: bool,
    /// Present on the destination side (context or addition).
    pub in_dest: bool,
    /// Line content, marker byte stripped, trailing `\n` stripped.
    pub payload: Vec<u8>,
    /// `false` if this line's content was followed by a
    /// `\ No newline at end of file` marker in the source patch.
    pub has_newline: bool,
}

/// A single `@@ ... @@` hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 0-based starting line on the source side.
    pub src_begin: usize,
    pub src_count: usize,
    /// 0-based starting line on the destination side.
    pub dest_begin: usize,
    pub dest_count: usize,
    pub lines: Vec<HunkLine>,
}

/// One `--- `/`+++ ` file section and its hunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSection {
    /// Path components of the resolved filename (`Index:` wins over
    /// `---`/`+++` per spec §9 note 2), not yet `strip`-adjusted.
    pub filename: Vec<String>,
    pub src_exists: bool,
    pub dest_exists: bool,
    pub hunks: Vec<Hunk>,
}

/// The parsed form of a whole patch file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedDiff {
    /// Free-form bytes preceding the first `Index:`/`---` line (a human
    /// comment header, per `original_source/quilt/patch.py`'s
    /// `Patch.get_header`). Preserved for round-tripping through refresh.
    pub preamble: Vec<u8>,
    pub sections: Vec<FileSection>,
}

struct RawLine<'a> {
    number: usize,
    bytes: &'a [u8],
    terminated: bool,
}

fn split_raw_lines(input: &[u8]) -> Vec<RawLine<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut number = 0;
    while start <= input.len() {
        if start == input.len() {
            break;
        }
        number += 1;
        match input[start..].iter().position(|&b| b == b'\n') {
            Some(rel) => {
                let end = start + rel;
                out.push(RawLine {
                    number,
                    bytes: &input[start..end],
                    terminated: true,
                });
                start = end + 1;
            }
            None => {
                out.push(RawLine {
                    number,
                    bytes: &input[start..],
                    terminated: false,
                });
                break;
            }
        }
    }
    out
}

/// Strip the container-format newline from a required patch-file line
/// (index/filename/hunk lines must be `\n`-terminated in the patch
/// container itself; only the *target file's* trailing newline is
/// optional, tracked separately via the `\ No newline` marker).
fn strip_container_newline(line: &RawLine<'_>) -> Result<&[u8], (usize, bool)> {
    if !line.terminated {
        return Err((line.number, false));
    }
    let mut bytes = line.bytes;
    if bytes.last() == Some(&b'\r') {
        bytes = &bytes[..bytes.len() - 1];
    }
    if bytes.contains(&b'\r') {
        return Err((line.number, true));
    }
    Ok(bytes)
}

/// Parse a byte stream into a [`ParsedDiff`] (spec §4.1).
pub fn parse(input: &[u8]) -> Result<ParsedDiff, ParseError> {
    let lines = split_raw_lines(input);
    let mut idx = 0usize;

    let mut preamble = Vec::new();
    while idx < lines.len() {
        let l = &lines[idx];
        if l.bytes.starts_with(b"Index:") || l.bytes.starts_with(b"---") {
            break;
        }
        preamble.extend_from_slice(l.bytes);
        preamble.push(b'\n');
        idx += 1;
    }

    let mut sections = Vec::new();
    let mut pending_index: Option<Vec<u8>> = None;

    while idx < lines.len() {
        let l = &lines[idx];

        if l.bytes.starts_with(b"Index:") {
            let content = match strip_container_newline(l) {
                Ok(c) => c,
                Err((line, is_cr)) => {
                    return Err(if is_cr {
                        ParseError::UnexpectedCR { line }
                    } else {
                        ParseError::TruncatedHeader { line }
                    })
                }
            };
            let prefix = b"Index: ";
            if !content.starts_with(prefix) {
                return Err(ParseError::InvalidIndexLine { line: l.number });
            }
            pending_index = Some(content[prefix.len()..].to_vec());
            idx += 1;
            continue;
        }

        if l.bytes.starts_with(b"---") {
            let (section, next_idx) = parse_file_section(&lines, idx, pending_index.take())?;
            sections.push(section);
            idx = next_idx;
            continue;
        }

        // Anything else between sections (diffstat text, separators,
        // comments) is ignored, matching classic quilt/patch tolerance.
        idx += 1;
    }

    Ok(ParsedDiff { preamble, sections })
}

fn parse_name_line<'a>(
    raw: &'a RawLine<'a>,
    prefix: &[u8],
    on_truncated: impl Fn(usize) -> ParseError,
    on_invalid: impl Fn(usize) -> ParseError,
) -> Result<(&'a [u8], bool), ParseError> {
    let content = match strip_container_newline(raw) {
        Ok(c) => c,
        Err((line, is_cr)) => {
            return Err(if is_cr {
                ParseError::UnexpectedCR { line }
            } else {
                on_truncated(line)
            })
        }
    };
    if !content.starts_with(prefix) {
        return Err(on_invalid(raw.number));
    }
    let rest = &content[prefix.len()..];
    // A real filename line may carry a tab-separated timestamp; only the
    // part before the first tab names the file.
    let name_part = match rest.iter().position(|&b| b == b'\t') {
        Some(p) => &rest[..p],
        None => rest,
    };
    Ok((name_part, true))
}

fn parse_file_section(
    lines: &[RawLine<'_>],
    dash_idx: usize,
    pending_index: Option<Vec<u8>>,
) -> Result<(FileSection, usize), ParseError> {
    let dash_line = &lines[dash_idx];
    let (src_name, _) = parse_name_line(
        dash_line,
        b"--- ",
        |l| ParseError::TruncatedHeader { line: l },
        |l| ParseError::InvalidSourceName { line: l },
    )?;
    let src_exists = src_name != b"/dev/null";
    let src_name = src_name.to_vec();

    let plus_idx = dash_idx + 1;
    if plus_idx >= lines.len() {
        return Err(ParseError::TruncatedHeader {
            line: dash_line.number,
        });
    }
    let plus_line = &lines[plus_idx];
    let (dest_name, _) = parse_name_line(
        plus_line,
        b"+++ ",
        |l| ParseError::TruncatedHeader { line: l },
        |l| ParseError::InvalidDestName { line: l },
    )?;
    let dest_exists = dest_name != b"/dev/null";
    let dest_name = dest_name.to_vec();

    let chosen_raw: Vec<u8> = if let Some(index) = pending_index {
        index
    } else if src_exists {
        src_name.clone()
    } else {
        dest_name.clone()
    };
    let chosen = String::from_utf8_lossy(&chosen_raw).into_owned();
    if chosen.starts_with('/') {
        return Err(ParseError::AbsolutePath {
            line: dash_line.number,
        });
    }
    let filename: Vec<String> = chosen.split('/').map(str::to_string).collect();
    if filename.iter().any(|c| c == "..") {
        return Err(ParseError::PathTraversal {
            line: dash_line.number,
        });
    }

    let mut idx = plus_idx + 1;
    let mut hunks = Vec::new();
    let mut last_src_end = 0usize;

    while idx < lines.len() && lines[idx].bytes.starts_with(b"@@ -") {
        let (hunk, next_idx) = parse_hunk(lines, idx, src_exists, dest_exists)?;
        if hunk.src_begin < last_src_end {
            return Err(ParseError::HunksOutOfOrder {
                line: lines[idx].number,
            });
        }
        last_src_end = hunk.src_begin + hunk.src_count;
        trace!(
            "parsed hunk src={},{} dest={},{}",
            hunk.src_begin,
            hunk.src_count,
            hunk.dest_begin,
            hunk.dest_count
        );
        hunks.push(hunk);
        idx = next_idx;
    }

    if hunks.is_empty() {
        return Err(ParseError::TruncatedHeader {
            line: dash_line.number,
        });
    }

    Ok((
        FileSection {
            filename,
            src_exists,
            dest_exists,
            hunks,
        },
        idx,
    ))
}

fn parse_range(spec: &[u8], exists: bool, line: usize) -> Result<(usize, usize), ParseError> {
    let text = std::str::from_utf8(spec).map_err(|_| ParseError::TruncatedHunk { line })?;
    let (begin_str, count) = match text.split_once(',') {
        Some((b, c)) => (
            b,
            c.parse::<usize>()
                .map_err(|_| ParseError::TruncatedHunk { line })?,
        ),
        None => (text, 1),
    };
    let mut begin: usize = begin_str
        .parse()
        .map_err(|_| ParseError::TruncatedHunk { line })?;
    if !exists && count != 0 {
        return Err(ParseError::InvalidRangeForAbsentFile { line });
    }
    if count != 0 {
        begin = begin.checked_sub(1).ok_or(ParseError::TruncatedHunk { line })?;
    }
    if !exists && begin != 0 {
        return Err(ParseError::InvalidRangeForAbsentFile { line });
    }
    Ok((begin, count))
}

fn parse_hunk(
    lines: &[RawLine<'_>],
    header_idx: usize,
    src_exists: bool,
    dest_exists: bool,
) -> Result<(Hunk, usize), ParseError> {
    let header = &lines[header_idx];
    let content = match strip_container_newline(header) {
        Ok(c) => c,
        Err((line, is_cr)) => {
            return Err(if is_cr {
                ParseError::UnexpectedCR { line }
            } else {
                ParseError::TruncatedHunk { line }
            })
        }
    };
    // "@@ -<src> +<dest> @@" possibly followed by trailing context text.
    let rest = &content[b"@@ -".len()..];
    let plus_pos = find(rest, b" +").ok_or(ParseError::TruncatedHunk {
        line: header.number,
    })?;
    let src_range = &rest[..plus_pos];
    let after_plus = &rest[plus_pos + 2..];
    let at_pos = find(after_plus, b" @@").ok_or(ParseError::TruncatedHunk {
        line: header.number,
    })?;
    let dest_range = &after_plus[..at_pos];

    let (src_begin, src_count) = parse_range(src_range, src_exists, header.number)?;
    let (dest_begin, dest_count) = parse_range(dest_range, dest_exists, header.number)?;

    let mut idx = header_idx + 1;
    let mut hunk_lines = Vec::new();
    let mut remaining_src = src_count;
    let mut remaining_dest = dest_count;

    while remaining_src > 0 || remaining_dest > 0 {
        if idx >= lines.len() {
            return Err(ParseError::TruncatedHunk {
                line: header.number,
            });
        }
        let raw = &lines[idx];
        if raw.bytes.starts_with(b"\\") {
            // "\ No newline at end of file" attaches to the previous line.
            if let Some(last) = hunk_lines.last_mut() {
                let last: &mut HunkLine = last;
                last.has_newline = false;
            }
            idx += 1;
            continue;
        }
        let content = match strip_container_newline(raw) {
            Ok(c) => c,
            Err((line, is_cr)) => {
                return Err(if is_cr {
                    ParseError::UnexpectedCR { line }
                } else {
                    ParseError::TruncatedHunk { line }
                })
            }
        };
        let (marker, payload): (Option<u8>, &[u8]) = if content.is_empty() {
            (None, content)
        } else {
            (Some(content[0]), &content[1..])
        };
        let in_src = matches!(marker, None | Some(b' ') | Some(b'-'));
        let in_dest = matches!(marker, None | Some(b' ') | Some(b'+'));
        if in_src {
            if remaining_src == 0 {
                return Err(ParseError::TruncatedHunk {
                    line: raw.number,
                });
            }
            remaining_src -= 1;
        }
        if in_dest {
            if remaining_dest == 0 {
                return Err(ParseError::TruncatedHunk {
                    line: raw.number,
                });
            }
            remaining_dest -= 1;
        }
        hunk_lines.push(HunkLine {
            in_src,
            in_dest,
            payload: payload.to_vec(),
            has_newline: true,
        });
        idx += 1;
    }

    // A "\ No newline at end of file" marker attached to the last hunk
    // line lands here, after the counters have already reached zero.
    if idx < lines.len() && lines[idx].bytes.starts_with(b"\\") {
        if let Some(last) = hunk_lines.last_mut() {
            last.has_newline = false;
        }
        idx += 1;
    }

    Ok((
        Hunk {
            src_begin,
            src_count,
            dest_begin,
            dest_count,
            lines: hunk_lines,
        },
        idx,
    ))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> ParsedDiff {
        parse(s.as_bytes()).unwrap()
    }

    #[test]
    fn parses_simple_modify() {
        let diff = p("--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n+new\n");
        assert_eq!(diff.sections.len(), 1);
        let s = &diff.sections[0];
        assert_eq!(s.filename, vec!["f"]);
        assert!(s.src_exists && s.dest_exists);
        assert_eq!(s.hunks.len(), 1);
        let h = &s.hunks[0];
        assert_eq!((h.src_begin, h.src_count), (0, 1));
        assert_eq!((h.dest_begin, h.dest_count), (0, 1));
        assert_eq!(h.lines.len(), 2);
        assert!(h.lines[0].in_src && !h.lines[0].in_dest);
        assert_eq!(h.lines[0].payload, b"old");
        assert!(!h.lines[1].in_src && h.lines[1].in_dest);
        assert_eq!(h.lines[1].payload, b"new");
    }

    #[test]
    fn parses_file_creation() {
        let diff = p("--- /dev/null\n+++ b/g\n@@ -0,0 +1 @@\n+hi\n");
        let s = &diff.sections[0];
        assert!(!s.src_exists);
        assert!(s.dest_exists);
        assert_eq!(s.filename, vec!["g"]);
        assert_eq!(s.hunks[0].src_count, 0);
        assert_eq!(s.hunks[0].dest_count, 1);
    }

    #[test]
    fn index_line_overrides_filename() {
        let diff = p("Index: real/path\n--- a/other\n+++ b/other\n@@ -1 +1 @@\n-x\n+y\n");
        assert_eq!(diff.sections[0].filename, vec!["real", "path"]);
    }

    #[test]
    fn no_newline_marker_attaches_to_previous_line() {
        let diff = p("--- a/f\n+++ b/f\n@@ -1 +1 @@\n-old\n\\ No newline at end of file\n+new\n");
        assert!(!diff.sections[0].hunks[0].lines[0].has_newline);
        assert!(diff.sections[0].hunks[0].lines[1].has_newline);
    }

    #[test]
    fn no_newline_marker_trailing_the_hunk_body() {
        let diff = p("--- /dev/null\n+++ b/g\n@@ -0,0 +1 @@\n+hi\n\\ No newline at end of file\n");
        assert!(!diff.sections[0].hunks[0].lines[0].has_newline);
    }

    #[test]
    fn absolute_path_is_rejected() {
        let err = parse(b"--- /etc/passwd\n+++ b/etc/passwd\n@@ -1 +1 @@\n-a\n+b\n").unwrap_err();
        assert!(matches!(err, ParseError::AbsolutePath { .. }));
    }

    #[test]
    fn dotdot_is_rejected() {
        let err = parse(b"--- a/../x\n+++ b/../x\n@@ -1 +1 @@\n-a\n+b\n").unwrap_err();
        assert!(matches!(err, ParseError::PathTraversal { .. }));
    }

    #[test]
    fn unexpected_cr_is_rejected() {
        let err = parse(b"--- a/f\n+++ b/f\n@@ -1 +1 @@\n-a\r\rb\n+c\n").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedCR { .. }));
    }

    #[test]
    fn truncated_hunk_is_rejected() {
        let err = parse(b"--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n-a\n").unwrap_err();
        assert!(matches!(err, ParseError::TruncatedHunk { .. }));
    }

    #[test]
    fn preamble_is_preserved() {
        let diff = p("Some description.\nMore text.\n--- a/f\n+++ b/f\n@@ -1 +1 @@\n-a\n+b\n");
        assert_eq!(diff.preamble, b"Some description.\nMore text.\n");
    }

    #[test]
    fn multiple_sections_in_one_patch() {
        let diff = p(
            "--- a/f1\n+++ b/f1\n@@ -1 +1 @@\n-a\n+b\n--- a/f2\n+++ b/f2\n@@ -1 +1 @@\n-c\n+d\n",
        );
        assert_eq!(diff.sections.len(), 2);
        assert_eq!(diff.sections[1].filename, vec!["f2"]);
    }

    #[test]
    fn blank_context_line_is_both_sided() {
        let diff = p("--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n a\n\n-b\n+c\n");
        let h = &diff.sections[0].hunks[0];
        assert!(h.lines[1].in_src && h.lines[1].in_dest);
        assert_eq!(h.lines[1].payload, b"");
    }
}
