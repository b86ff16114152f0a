//! Folder listings and recursive file enumeration inside a sandboxed base.

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{CareError, CareResult, IoContext};
use crate::layout::{self, StorageLayout};
use crate::sandbox;
use crate::sidecar::{self, DetectionFilter};

/// One child of a browsed folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub name: String,
    pub is_directory: bool,
    /// Path relative to the base the listing was resolved against.
    pub path: PathBuf,
}

/// List the children of `base/relative`, sorted by name.
///
/// With `ensure_scope` the folder is created first, so browsing an empty
/// scope yields an empty listing instead of `NotFound`.
pub fn list_dir(base: &Path, relative: &str, ensure_scope: bool) -> CareResult<Vec<Entry>> {
    let base = sandbox::normalize(base);
    let target = open_dir(&base, relative, ensure_scope)?;
    read_entries(&base, &target)
}

/// Like [`list_dir`], but files are kept only when their detection sidecar
/// passes `filter`. Folders are always listed.
pub fn list_dir_filtered(
    layout: &StorageLayout,
    base: &Path,
    relative: &str,
    ensure_scope: bool,
    filter: &DetectionFilter,
) -> CareResult<Vec<Entry>> {
    let base = sandbox::normalize(base);
    let target = open_dir(&base, relative, ensure_scope)?;
    let entries = read_entries(&base, &target)?;

    Ok(entries
        .into_iter()
        .filter(|entry| entry.is_directory || passes(layout, &base.join(&entry.path), filter))
        .collect())
}

/// Every regular file below `base/sub`, relative to `base`, depth-first in
/// file name order.
pub fn enumerate_files(base: &Path, sub: &str) -> CareResult<Vec<PathBuf>> {
    let base = sandbox::normalize(base);
    let target = open_dir(&base, sub, false)?;
    walk_files(&base, &target, |_| true)
}

/// [`enumerate_files`] restricted to files whose sidecar passes `filter`.
pub fn enumerate_files_filtered(
    layout: &StorageLayout,
    base: &Path,
    sub: &str,
    filter: &DetectionFilter,
) -> CareResult<Vec<PathBuf>> {
    let base = sandbox::normalize(base);
    let target = open_dir(&base, sub, false)?;
    walk_files(&base, &target, |path| passes(layout, path, filter))
}

fn passes(layout: &StorageLayout, file: &Path, filter: &DetectionFilter) -> bool {
    let detection = layout
        .sidecar_for(file)
        .and_then(|sidecar| sidecar::read_detection(&sidecar));
    filter.matches(detection.as_ref())
}

/// Resolve and validate a folder to browse.
fn open_dir(base: &Path, relative: &str, ensure_scope: bool) -> CareResult<PathBuf> {
    let target = sandbox::resolve(base, relative)?;
    if ensure_scope {
        layout::ensure(&target)?;
    }

    let metadata = match fs::metadata(&target) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CareError::not_found(format!("Directory {}", relative)));
        }
        Err(e) => return Err(CareError::io("stat", &target, e)),
    };

    if !metadata.is_dir() {
        return Err(CareError::NotADirectory { path: target });
    }

    Ok(target)
}

fn read_entries(base: &Path, target: &Path) -> CareResult<Vec<Entry>> {
    let prefix = target.strip_prefix(base).unwrap_or(Path::new(""));
    let mut entries = Vec::new();

    for entry in fs::read_dir(target).io_context("read directory", target)? {
        let entry = entry.io_context("read directory", target)?;
        let path = entry.path();
        let metadata = fs::metadata(&path).io_context("stat", &path)?;
        let name = entry.file_name().to_string_lossy().to_string();

        entries.push(Entry {
            path: prefix.join(&name),
            name,
            is_directory: metadata.is_dir(),
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn walk_files(
    base: &Path,
    target: &Path,
    mut keep: impl FnMut(&Path) -> bool,
) -> CareResult<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(target).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(target, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        if !keep(entry.path()) {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(base) {
            files.push(relative.to_path_buf());
        }
    }

    Ok(files)
}

fn walk_error(target: &Path, e: walkdir::Error) -> CareError {
    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| target.to_path_buf());
    let source = e
        .into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop"));
    CareError::io("walk directory", path, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sidecar::NO_DETECTION;
    use std::fs::{self, File};
    use tempfile::tempdir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        File::create(path).unwrap();
    }

    #[test]
    fn test_list_dir() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("trip1/cam1.jpg"));
        touch(&dir.path().join("a.jpg"));

        let entries = list_dir(dir.path(), "", false).unwrap();
        assert_eq!(
            entries,
            vec![
                Entry {
                    name: "a.jpg".to_string(),
                    is_directory: false,
                    path: PathBuf::from("a.jpg"),
                },
                Entry {
                    name: "trip1".to_string(),
                    is_directory: true,
                    path: PathBuf::from("trip1"),
                },
            ]
        );

        let entries = list_dir(dir.path(), "trip1", false).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, PathBuf::from("trip1/cam1.jpg"));
    }

    #[test]
    fn test_list_dir_errors() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("a.jpg"));

        assert_eq!(
            list_dir(dir.path(), "missing", false).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            list_dir(dir.path(), "a.jpg", false).unwrap_err().kind(),
            ErrorKind::NotADirectory
        );
        assert_eq!(
            list_dir(dir.path(), "../", false).unwrap_err().kind(),
            ErrorKind::InvalidPath
        );
    }

    #[test]
    fn test_list_dir_ensures_scope() {
        let dir = tempdir().unwrap();
        let scope = dir.path().join("data/image_uploaded/1");

        let entries = list_dir(&scope, "", true).unwrap();
        assert!(entries.is_empty());
        assert!(scope.is_dir());
    }

    #[test]
    fn test_enumerate_files() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("20240101/b.jpg"));
        touch(&dir.path().join("20240101/a/z.jpg"));
        touch(&dir.path().join("20240101/a/y.jpg"));
        touch(&dir.path().join("20240102/c.jpg"));
        fs::create_dir_all(dir.path().join("20240101/empty")).unwrap();

        let files = enumerate_files(dir.path(), "20240101").unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("20240101/a/y.jpg"),
                PathBuf::from("20240101/a/z.jpg"),
                PathBuf::from("20240101/b.jpg"),
            ]
        );

        let all = enumerate_files(dir.path(), "").unwrap();
        assert_eq!(all.len(), 4);

        // Restartable: a second walk over the same snapshot is identical
        assert_eq!(enumerate_files(dir.path(), "").unwrap(), all);
    }

    #[test]
    fn test_enumerate_files_rejects_escape() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("base");
        fs::create_dir_all(&base).unwrap();
        assert_eq!(
            enumerate_files(&base, "../").unwrap_err().kind(),
            ErrorKind::InvalidPath
        );
    }

    fn detected_layout() -> (tempfile::TempDir, StorageLayout) {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), "1");
        let marked = layout.marked(Some("20240101")).unwrap();
        let json = layout.cropped_json().join("20240101");

        touch(&marked.join("cam1.jpg"));
        touch(&marked.join("cam2.jpg"));
        touch(&marked.join("cam3.jpg"));
        touch(&marked.join("sub/cam4.jpg"));

        fs::create_dir_all(json.join("sub")).unwrap();
        fs::write(
            json.join("cam1.json"),
            r#"{"boxes":[{"label":"Stoat","confidence":0.82}]}"#,
        )
        .unwrap();
        fs::write(
            json.join("cam2.json"),
            r#"{"boxes":[{"label":null,"confidence":0.0}]}"#,
        )
        .unwrap();
        // cam3 has no sidecar
        fs::write(json.join("sub/cam4.json"), "{broken").unwrap();

        (dir, layout)
    }

    #[test]
    fn test_list_dir_filtered_by_label() {
        let (_dir, layout) = detected_layout();
        let base = layout.marked(Some("20240101")).unwrap();

        let entries =
            list_dir_filtered(&layout, &base, "", false, &DetectionFilter::new("Stoat", 0.5, 1.0))
                .unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["cam1.jpg", "sub"]);

        let entries =
            list_dir_filtered(&layout, &base, "", false, &DetectionFilter::new("Stoat", 0.5, 0.7))
                .unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["sub"]);
    }

    #[test]
    fn test_enumerate_no_detection() {
        let (_dir, layout) = detected_layout();
        let base = layout.marked(None).unwrap();

        let files = enumerate_files_filtered(
            &layout,
            &base,
            "20240101",
            &DetectionFilter::new(NO_DETECTION, 0.99, 1.0),
        )
        .unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("20240101/cam2.jpg"),
                PathBuf::from("20240101/cam3.jpg"),
                PathBuf::from("20240101/sub/cam4.jpg"),
            ]
        );

        let files =
            enumerate_files_filtered(&layout, &base, "", &DetectionFilter::any()).unwrap();
        assert_eq!(
            files,
            vec![
                PathBuf::from("20240101/cam1.jpg"),
                PathBuf::from("20240101/cam2.jpg"),
            ]
        );
    }
}
