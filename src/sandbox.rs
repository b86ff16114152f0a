//! Path-traversal guard.
//!
//! Every user-influenced path in the crate goes through [`resolve`] before
//! any I/O happens. Resolution is purely lexical: the target may not exist
//! yet (uploads, staging destinations), so nothing is canonicalized on disk.

use std::path::{Component, Path, PathBuf};

use crate::error::{CareError, CareResult};

/// Resolve `relative` against `base` and make sure the result stays inside
/// `base`. Returns the normalized absolute path.
///
/// Backslashes are treated as separators on every platform, and absolute
/// inputs replace the base the same way `Path::join` does, which then fails
/// the containment check. Inner `..` segments are allowed as long as the
/// normalized result is still inside `base` (`a/../b` resolves to `b`).
pub fn resolve(base: &Path, relative: &str) -> CareResult<PathBuf> {
    let base = normalize(base);
    let relative = relative.replace('\\', "/");
    let candidate = normalize(&base.join(relative));

    if is_within(&base, &candidate) {
        Ok(candidate)
    } else {
        Err(CareError::InvalidPath {
            base,
            path: candidate,
        })
    }
}

/// Resolve several user supplied segments (e.g. date then folder) in one go.
pub fn resolve_segments(base: &Path, segments: &[&str]) -> CareResult<PathBuf> {
    let joined = segments
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/");
    resolve(base, &joined)
}

/// Lexically normalize a path: drop `.`, apply `..`, restart on a root.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => out = PathBuf::from(prefix.as_os_str()),
            Component::RootDir => {
                out = out
                    .components()
                    .take_while(|c| matches!(c, Component::Prefix(_)))
                    .collect();
                out.push(component.as_os_str());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() && !out.has_root() {
                    out.push("..");
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

fn is_within(base: &Path, candidate: &Path) -> bool {
    let mut base_parts = base.components();
    let mut candidate_parts = candidate.components();
    loop {
        match (base_parts.next(), candidate_parts.next()) {
            (None, _) => return true,
            (Some(_), None) => return false,
            (Some(b), Some(c)) => {
                if !same_component(b.as_os_str(), c.as_os_str()) {
                    return false;
                }
            }
        }
    }
}

#[cfg(any(windows, target_os = "macos"))]
fn same_component(a: &std::ffi::OsStr, b: &std::ffi::OsStr) -> bool {
    a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
}

#[cfg(not(any(windows, target_os = "macos")))]
fn same_component(a: &std::ffi::OsStr, b: &std::ffi::OsStr) -> bool {
    a == b
}
