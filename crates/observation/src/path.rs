//! Absolute repository paths
//!
//! Paths are `/`-separated strings rooted at `/`. A segment may carry a
//! same-name-sibling index suffix (`name[2]`); the first sibling's `[1]` is
//! implicit and is ignored when comparing paths.

use std::collections::BTreeSet;

pub const ROOT: &str = "/";

pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Non-empty segments of a path, `/` has none
pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn normalize_segment(segment: &str) -> &str {
    segment.strip_suffix("[1]").unwrap_or(segment)
}

/// Whether `candidate` is `path` or one of its ancestors.
///
/// Segments are compared one by one, with an explicit `[1]` suffix on
/// either side normalised away first.
pub fn is_ancestor(candidate: &str, path: &str) -> bool {
    let mut path_parts = segments(path);
    for c in segments(candidate) {
        match path_parts.next() {
            Some(p) if normalize_segment(c) == normalize_segment(p) => {}
            _ => return false,
        }
    }
    true
}

/// Whether either path lies on the other's ancestor line
pub fn overlaps(a: &str, b: &str) -> bool {
    is_ancestor(a, b) || is_ancestor(b, a)
}

pub fn depth(path: &str) -> usize {
    segments(path).count()
}

/// Parent of a path; `None` for the root
pub fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some(ROOT),
        Some(i) => Some(&trimmed[..i]),
        None => None,
    }
}

/// Last segment of a path, `""` for the root
pub fn name(path: &str) -> &str {
    segments(path).last().unwrap_or("")
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT || parent.is_empty() {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Split a segment into its name and 1-based sibling index
pub fn split_index(segment: &str) -> (&str, usize) {
    if let Some(open) = segment.rfind('[') {
        if let Some(index) = segment[open + 1..]
            .strip_suffix(']')
            .and_then(|i| i.parse::<usize>().ok())
        {
            return (&segment[..open], index);
        }
    }
    (segment, 1)
}

/// Segment name for a sibling: the index suffix is only written from 2 on
pub fn indexed_name(name: &str, index: usize) -> String {
    if index > 1 {
        format!("{}[{}]", name, index)
    } else {
        name.to_string()
    }
}

/// Drop every path that has a proper ancestor in the same set
pub fn prune_descendants(paths: &mut BTreeSet<String>) {
    let snapshot: Vec<String> = paths.iter().cloned().collect();
    paths.retain(|p| {
        !snapshot
            .iter()
            .any(|q| depth(q) < depth(p) && is_ancestor(q, p))
    });
}
