//! ReID result index.
//!
//! Each ReID run writes `image_reid_output/<user>/<date>/<time>.json`, an
//! ordered object mapping a group id to the list of `originDate/relPath`
//! images (relative to the marked area) assigned to that individual.

use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Value};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::browse;
use crate::error::{CareError, CareResult, IoContext};
use crate::layout::StorageLayout;

/// One row of a ReID browse listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReidEntry {
    pub name: String,
    pub is_directory: bool,
    /// Virtual path `date/time/group/name`, as deep as the listing.
    pub path: PathBuf,
    pub date: Option<String>,
    pub time: Option<String>,
    #[serde(rename = "group_id")]
    pub group_id: Option<String>,
    /// Date folder the image was uploaded under.
    pub real_date: Option<String>,
    /// Image path below its date folder.
    pub real_path: Option<String>,
}

impl ReidEntry {
    fn folder(name: String, path: PathBuf) -> Self {
        Self {
            name,
            is_directory: true,
            path,
            date: None,
            time: None,
            group_id: None,
            real_date: None,
            real_path: None,
        }
    }
}

/// Groups of one ReID run, in file order.
pub type ReidGroups = Vec<(String, Vec<String>)>;

/// Split a stored `originDate/relPath` on its first separator.
pub fn split_origin(stored: &str) -> (&str, &str) {
    match stored.find(['/', '\\']) {
        Some(idx) => (&stored[..idx], &stored[idx + 1..]),
        None => (stored, ""),
    }
}

fn basename(stored: &str) -> &str {
    stored.rsplit(['/', '\\']).next().unwrap_or(stored)
}

/// Browse, rename and delete ReID results of one user.
pub struct ReidIndex {
    layout: StorageLayout,
    /// Serialises read-modify-write cycles on index files.
    write_lock: tokio::sync::Mutex<()>,
}

impl ReidIndex {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// List one level of the ReID hierarchy.
    ///
    /// * no date: the date folders (the output root is created if missing)
    /// * date: the runs of that day, by time
    /// * date + time: the group ids of that run
    /// * date + time + group: the images of that group
    pub fn browse(
        &self,
        date: Option<&str>,
        time: Option<&str>,
        group: Option<&str>,
    ) -> CareResult<Vec<ReidEntry>> {
        let base = self.layout.reid_output(None)?;
        let date = date.filter(|d| !d.is_empty());
        let time = time.filter(|t| !t.is_empty());
        let group = group.filter(|g| !g.is_empty());

        match (date, time, group) {
            (None, _, _) => {
                let entries = browse::list_dir(&base, "", true)?;
                Ok(entries
                    .into_iter()
                    .map(|entry| ReidEntry {
                        date: Some(entry.name.clone()),
                        is_directory: entry.is_directory,
                        ..ReidEntry::folder(entry.name, entry.path)
                    })
                    .collect())
            }
            (Some(date), None, _) => {
                let entries = browse::list_dir(&base, date, false)?;
                Ok(entries
                    .into_iter()
                    .filter(|entry| !entry.is_directory)
                    .filter_map(|entry| {
                        let stem = entry.name.strip_suffix(".json")?.to_string();
                        Some(ReidEntry {
                            date: Some(date.to_string()),
                            time: Some(stem.clone()),
                            ..ReidEntry::folder(stem.clone(), Path::new(date).join(&stem))
                        })
                    })
                    .collect())
            }
            (Some(date), Some(time), None) => {
                let index = self.read(date, time)?;
                Ok(index
                    .keys()
                    .map(|key| ReidEntry {
                        date: Some(date.to_string()),
                        time: Some(time.to_string()),
                        group_id: Some(key.clone()),
                        ..ReidEntry::folder(key.clone(), Path::new(date).join(time).join(key))
                    })
                    .collect())
            }
            (Some(date), Some(time), Some(group)) => {
                let path = self.layout.reid_index_file(date, time)?;
                let index = self.read(date, time)?;
                let value = index
                    .get(group)
                    .ok_or_else(|| CareError::not_found(format!("Key \"{}\"", group)))?;
                let images = image_list(&path, value)?;

                Ok(images
                    .iter()
                    .map(|stored| {
                        let name = basename(stored).to_string();
                        let (real_date, real_path) = split_origin(stored);
                        ReidEntry {
                            is_directory: false,
                            path: Path::new(date).join(time).join(group).join(&name),
                            date: Some(date.to_string()),
                            time: Some(time.to_string()),
                            group_id: Some(group.to_string()),
                            real_date: Some(real_date.to_string()),
                            real_path: Some(real_path.to_string()),
                            name,
                        }
                    })
                    .collect())
            }
        }
    }

    /// Every group of one run with its image list, in file order.
    pub fn groups(&self, date: &str, time: &str) -> CareResult<ReidGroups> {
        let path = self.layout.reid_index_file(date, time)?;
        let index = self.read(date, time)?;
        index
            .iter()
            .map(|(key, value)| Ok((key.clone(), image_list(&path, value)?)))
            .collect()
    }

    /// Remove one run, and its date folder if nothing else is left in it.
    pub async fn delete(&self, date: &str, time: &str) -> CareResult<String> {
        if date.is_empty() || time.is_empty() {
            return Err(CareError::MissingParams("date, time".to_string()));
        }
        let path = self.layout.reid_index_file(date, time)?;

        let _lock = self.write_lock.lock().await;

        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CareError::not_found(format!(
                    "ReID result (date = {}, time = {})",
                    date, time
                )));
            }
            Err(e) => return Err(CareError::io("remove file", &path, e)),
        }

        let scope = self.layout.reid_output(None)?;
        if let Some(date_dir) = path.parent().filter(|dir| *dir != scope) {
            let empty = fs::read_dir(date_dir)
                .io_context("read directory", date_dir)?
                .next()
                .is_none();
            if empty {
                fs::remove_dir(date_dir).io_context("remove directory", date_dir)?;
                debug!(path = %date_dir.display(), "Removed empty ReID date folder");
            }
        }

        info!(date, time, "Deleted ReID result");
        Ok(format!(
            "ReID result (date = {}, time = {}) deleted successfully.",
            date, time
        ))
    }

    /// Rename a group, keeping its position and every other group as is.
    pub async fn rename(
        &self,
        date: &str,
        time: &str,
        old_group: &str,
        new_group: &str,
    ) -> CareResult<String> {
        if [date, time, old_group, new_group].iter().any(|p| p.is_empty()) {
            return Err(CareError::MissingParams(
                "date, time, old_group_id, new_group_id".to_string(),
            ));
        }
        let path = self.layout.reid_index_file(date, time)?;

        let _lock = self.write_lock.lock().await;

        let index = self.read(date, time)?;
        if !index.contains_key(old_group) {
            return Err(CareError::not_found(format!("Key \"{}\"", old_group)));
        }
        if new_group == old_group {
            return Ok(
                "The new name is the same as the old name. The group name will not change."
                    .to_string(),
            );
        }
        if index.contains_key(new_group) {
            return Err(CareError::DuplicateKey {
                key: new_group.to_string(),
            });
        }

        let renamed: Map<String, Value> = index
            .into_iter()
            .map(|(key, value)| {
                if key == old_group {
                    (new_group.to_string(), value)
                } else {
                    (key, value)
                }
            })
            .collect();

        write_atomic(&path, &renamed)?;

        info!(date, time, old_group, new_group, "Renamed ReID group");
        Ok(format!(
            "Successfully renamed from {} to {}.",
            old_group, new_group
        ))
    }

    fn read(&self, date: &str, time: &str) -> CareResult<Map<String, Value>> {
        let path = self.layout.reid_index_file(date, time)?;
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CareError::not_found(format!(
                    "ReID result (date = {}, time = {})",
                    date, time
                )));
            }
            Err(e) => return Err(CareError::io("read", &path, e)),
        };

        serde_json::from_str(&content).map_err(|source| CareError::Json { path, source })
    }
}

fn image_list(path: &Path, value: &Value) -> CareResult<Vec<String>> {
    Vec::<String>::deserialize(value).map_err(|source| CareError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Write pretty JSON (4-space indent) next to `path`, then rename it over
/// `path`, so readers never see a partial file.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> CareResult<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut buf = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(b"    "));
    value
        .serialize(&mut serializer)
        .map_err(|source| CareError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    buf.push(b'\n');

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(
        ".{}.{}.{}.tmp",
        file_name,
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::SeqCst)
    ));

    fs::write(&temp, &buf).io_context("write", &temp)?;
    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(CareError::io("rename", path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    fn fixture(content: &str) -> (TempDir, StorageLayout, ReidIndex) {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), "1");
        let date_dir = layout.reid_output(Some("20240101")).unwrap();
        fs::create_dir_all(&date_dir).unwrap();
        fs::write(date_dir.join("1200.json"), content).unwrap();
        let index = ReidIndex::new(layout.clone());
        (dir, layout, index)
    }

    fn read_back(layout: &StorageLayout) -> Map<String, Value> {
        let path = layout.reid_index_file("20240101", "1200").unwrap();
        serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
    }

    const THREE_GROUPS: &str = r#"{
    "ID-0": ["20240101/a.jpg", "20240101/trip1/b.jpg"],
    "ID-1": ["20231231\\c.jpg"],
    "ID-2": []
}"#;

    #[test]
    fn test_split_origin() {
        assert_eq!(split_origin("20240101/trip1/a.jpg"), ("20240101", "trip1/a.jpg"));
        assert_eq!(split_origin("20240101\\trip1\\a.jpg"), ("20240101", "trip1\\a.jpg"));
        assert_eq!(split_origin("a.jpg"), ("a.jpg", ""));
        assert_eq!(basename("20240101\\trip1\\a.jpg"), "a.jpg");
    }

    #[test]
    fn test_browse_levels() {
        let (_dir, layout, index) = fixture(THREE_GROUPS);
        fs::write(
            layout.reid_output(Some("20240101")).unwrap().join("0930.json"),
            "{}",
        )
        .unwrap();

        let dates = index.browse(None, None, None).unwrap();
        assert_eq!(dates.len(), 1);
        assert_eq!(dates[0].name, "20240101");
        assert_eq!(dates[0].date.as_deref(), Some("20240101"));
        assert!(dates[0].is_directory);

        let times = index.browse(Some("20240101"), None, None).unwrap();
        let names: Vec<_> = times.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["0930", "1200"]);
        assert_eq!(times[1].path, PathBuf::from("20240101/1200"));
        assert_eq!(times[1].time.as_deref(), Some("1200"));

        let groups = index.browse(Some("20240101"), Some("1200"), None).unwrap();
        let names: Vec<_> = groups.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["ID-0", "ID-1", "ID-2"]);
        assert_eq!(groups[0].group_id.as_deref(), Some("ID-0"));

        let images = index
            .browse(Some("20240101"), Some("1200"), Some("ID-0"))
            .unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[1].name, "b.jpg");
        assert!(!images[1].is_directory);
        assert_eq!(images[1].path, PathBuf::from("20240101/1200/ID-0/b.jpg"));
        assert_eq!(images[1].real_date.as_deref(), Some("20240101"));
        assert_eq!(images[1].real_path.as_deref(), Some("trip1/b.jpg"));

        let images = index
            .browse(Some("20240101"), Some("1200"), Some("ID-1"))
            .unwrap();
        assert_eq!(images[0].name, "c.jpg");
        assert_eq!(images[0].real_date.as_deref(), Some("20231231"));
    }

    #[test]
    fn test_browse_root_is_created() {
        let dir = tempdir().unwrap();
        let layout = StorageLayout::new(dir.path(), "1");
        let index = ReidIndex::new(layout.clone());

        assert!(index.browse(None, None, None).unwrap().is_empty());
        assert!(layout.reid_output(None).unwrap().is_dir());
    }

    #[test]
    fn test_browse_errors() {
        let (_dir, _layout, index) = fixture(THREE_GROUPS);

        let err = index.browse(Some("20240102"), None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = index.browse(Some("20240101"), Some("1300"), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = index
            .browse(Some("20240101"), Some("1200"), Some("ID-9"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = index.browse(Some("../../.."), None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
    }

    #[test]
    fn test_corrupt_index() {
        let (_dir, _layout, index) = fixture("{not json");
        let err = index.browse(Some("20240101"), Some("1200"), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert!(matches!(err, CareError::Json { .. }));
    }

    #[test]
    fn test_groups_in_file_order() {
        let (_dir, _layout, index) = fixture(THREE_GROUPS);
        let groups = index.groups("20240101", "1200").unwrap();
        let keys: Vec<_> = groups.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["ID-0", "ID-1", "ID-2"]);
        assert_eq!(groups[0].1.len(), 2);
    }

    #[tokio::test]
    async fn test_rename_then_rename_again() {
        let (_dir, layout, index) = fixture(r#"{"ID-0":["20240101/a.jpg"]}"#);

        index.rename("20240101", "1200", "ID-0", "ID-1").await.unwrap();
        let data = read_back(&layout);
        assert_eq!(data.len(), 1);
        assert_eq!(data["ID-1"], serde_json::json!(["20240101/a.jpg"]));

        // Two concurrent renames of the same key: exactly one applies
        let index = Arc::new(index);
        let a = {
            let index = index.clone();
            tokio::spawn(async move { index.rename("20240101", "1200", "ID-1", "ID-2").await })
        };
        let b = {
            let index = index.clone();
            tokio::spawn(async move { index.rename("20240101", "1200", "ID-1", "ID-2").await })
        };
        let results = [a.await.unwrap(), b.await.unwrap()];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let failed = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(failed.kind(), ErrorKind::NotFound);

        let data = read_back(&layout);
        let keys: Vec<_> = data.keys().cloned().collect();
        assert_eq!(keys, vec!["ID-2"]);
    }

    #[tokio::test]
    async fn test_rename_preserves_order_and_format() {
        let (_dir, layout, index) = fixture(THREE_GROUPS);

        index.rename("20240101", "1200", "ID-1", "Stoat A").await.unwrap();

        let data = read_back(&layout);
        let keys: Vec<_> = data.keys().cloned().collect();
        assert_eq!(keys, vec!["ID-0", "Stoat A", "ID-2"]);

        let raw =
            fs::read_to_string(layout.reid_index_file("20240101", "1200").unwrap()).unwrap();
        assert!(raw.contains("\n    \"ID-0\": ["));

        // No temp files left behind
        let leftovers = fs::read_dir(layout.reid_output(Some("20240101")).unwrap())
            .unwrap()
            .count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_rename_to_same_name_twice() {
        let (_dir, layout, index) = fixture(THREE_GROUPS);
        let keys_before: Vec<_> = read_back(&layout).keys().cloned().collect();

        let first = index.rename("20240101", "1200", "ID-1", "ID-1").await.unwrap();
        let second = index.rename("20240101", "1200", "ID-1", "ID-1").await.unwrap();
        assert_eq!(first, second);
        assert!(second.contains("will not change"));

        let keys_after: Vec<_> = read_back(&layout).keys().cloned().collect();
        assert_eq!(keys_before, keys_after);
        assert_eq!(read_back(&layout)["ID-1"], serde_json::json!(["20231231\\c.jpg"]));
    }

    #[tokio::test]
    async fn test_rename_rules() {
        let (_dir, layout, index) = fixture(THREE_GROUPS);
        let before =
            fs::read_to_string(layout.reid_index_file("20240101", "1200").unwrap()).unwrap();

        let msg = index.rename("20240101", "1200", "ID-0", "ID-0").await.unwrap();
        assert!(msg.contains("same as the old name"));

        let err = index.rename("20240101", "1200", "ID-0", "ID-2").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DuplicateKey);

        let err = index.rename("20240101", "1200", "ID-7", "ID-8").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = index.rename("20240101", "1300", "ID-0", "ID-8").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = index.rename("20240101", "1200", "", "ID-8").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingParams);

        let after =
            fs::read_to_string(layout.reid_index_file("20240101", "1200").unwrap()).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_delete_removes_empty_date_folder() {
        let (_dir, layout, index) = fixture(THREE_GROUPS);
        let date_dir = layout.reid_output(Some("20240101")).unwrap();
        fs::write(date_dir.join("0930.json"), "{}").unwrap();

        index.delete("20240101", "1200").await.unwrap();
        assert!(date_dir.is_dir());

        let msg = index.delete("20240101", "0930").await.unwrap();
        assert!(msg.contains("deleted successfully"));
        assert!(!date_dir.exists());

        let err = index.delete("20240101", "0930").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = index.delete("", "0930").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingParams);
    }
}
