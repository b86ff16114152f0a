//! On-disk directory taxonomy.
//!
//! ```text
//! <root>/
//! ├── data/
//! │   ├── image_uploaded/<user>/<YYYYMMDD>/...
//! │   ├── image_marked/<user>/<YYYYMMDD>/...
//! │   ├── image_cropped_json/<user>/<YYYYMMDD>/... (mirrors image_marked, .json)
//! │   └── image_reid_output/<user>/<YYYYMMDD>/<time>.json
//! ├── temp/
//! │   ├── image_detection_pending/<user>
//! │   ├── image_reid_pending/<user>
//! │   └── image_cropped_reid_pending/<user>
//! └── logs/
//! ```

use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{CareResult, IoContext};
use crate::sandbox;

const UPLOADED: &str = "data/image_uploaded";
const MARKED: &str = "data/image_marked";
const CROPPED_JSON: &str = "data/image_cropped_json";
const REID_OUTPUT: &str = "data/image_reid_output";
const TEMP_DETECTION: &str = "temp/image_detection_pending";
const TEMP_REID: &str = "temp/image_reid_pending";
const TEMP_CROPPED_REID: &str = "temp/image_cropped_reid_pending";
const LOGS: &str = "logs";

/// Path builders for every storage area of one user.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    user: String,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>, user: impl Into<String>) -> Self {
        Self {
            root: sandbox::normalize(&root.into()),
            user: user.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.storage_root, &config.user_scope)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    fn scoped(&self, area: &str) -> PathBuf {
        self.root.join(area).join(&self.user)
    }

    /// `image_uploaded/<user>`, or one date folder below it.
    pub fn uploaded(&self, date: Option<&str>) -> CareResult<PathBuf> {
        self.dated(UPLOADED, date)
    }

    /// `image_marked/<user>`, or one date folder below it.
    pub fn marked(&self, date: Option<&str>) -> CareResult<PathBuf> {
        self.dated(MARKED, date)
    }

    pub fn cropped_json(&self) -> PathBuf {
        self.scoped(CROPPED_JSON)
    }

    /// `image_reid_output/<user>`, or one date folder below it.
    pub fn reid_output(&self, date: Option<&str>) -> CareResult<PathBuf> {
        self.dated(REID_OUTPUT, date)
    }

    /// The `<date>/<time>.json` index file of one ReID run.
    pub fn reid_index_file(&self, date: &str, time: &str) -> CareResult<PathBuf> {
        let file = format!("{}.json", time);
        sandbox::resolve_segments(&self.scoped(REID_OUTPUT), &[date, &file])
    }

    pub fn temp_detection_pending(&self) -> PathBuf {
        self.scoped(TEMP_DETECTION)
    }

    pub fn temp_reid_pending(&self) -> PathBuf {
        self.scoped(TEMP_REID)
    }

    pub fn temp_cropped_reid_pending(&self) -> PathBuf {
        self.scoped(TEMP_CROPPED_REID)
    }

    /// Shared by every user: the AI executable writes its own logs here.
    pub fn logs(&self) -> PathBuf {
        self.root.join(LOGS)
    }

    /// `image_marked`, shared by every user.
    pub fn marked_root(&self) -> PathBuf {
        self.root.join(MARKED)
    }

    /// `image_cropped_json`, shared by every user.
    pub fn cropped_json_root(&self) -> PathBuf {
        self.root.join(CROPPED_JSON)
    }

    /// Sidecar metadata file for a marked image: the path relative to the
    /// marked area is mirrored under the cropped-json area with a `.json`
    /// extension. `None` if `marked_file` is not inside the marked area.
    pub fn sidecar_for(&self, marked_file: &Path) -> Option<PathBuf> {
        let marked_root = self.marked_root();
        let relative = marked_file.strip_prefix(&marked_root).ok()?;
        let stem = relative.file_stem()?;
        let mut sidecar = self.cropped_json_root();
        if let Some(parent) = relative.parent() {
            sidecar.push(parent);
        }
        sidecar.push(stem);
        sidecar.set_extension("json");
        Some(sidecar)
    }

    fn dated(&self, area: &str, date: Option<&str>) -> CareResult<PathBuf> {
        let base = self.scoped(area);
        match date {
            Some(date) if !date.is_empty() => sandbox::resolve(&base, date),
            _ => Ok(base),
        }
    }
}

/// Create `path` and its parents. Idempotent.
pub fn ensure(path: &Path) -> CareResult<()> {
    std::fs::create_dir_all(path).io_context("create directory", path)
}

/// Remove a directory tree if present. Missing directories are fine.
pub fn remove_tree(path: &Path) -> CareResult<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(crate::error::CareError::io("remove directory", path, e)),
    }
}
