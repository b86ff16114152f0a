//! Front-end facing operations.
//!
//! Every method returns a [`Response`], which serialises to
//! `{ "ok": true, ...payload }` on success and
//! `{ "ok": false, "kind": "...", "error": "..." }` on failure.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::error;

use crate::archive::{self, ExportOutcome, SavePrompt};
use crate::browse::{self, Entry};
use crate::config::Config;
use crate::error::{CareError, CareResult, ErrorKind};
use crate::gallery::{self, ImageData};
use crate::jobs::{JobEvent, JobOutcome, JobRunner, JobStatus};
use crate::layout::{self, StorageLayout};
use crate::reid::{ReidEntry, ReidIndex};
use crate::sidecar::DetectionFilter;

/// Uniform result of a facade call.
#[derive(Debug, Serialize)]
pub struct Response<T> {
    pub ok: bool,
    #[serde(flatten)]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Response<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            kind: None,
            error: None,
        }
    }

    pub fn failure(err: &CareError) -> Self {
        Self {
            ok: false,
            data: None,
            kind: Some(err.kind()),
            error: Some(err.to_string()),
        }
    }

    fn from_result(op: &'static str, result: CareResult<T>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(err) => {
                error!(op, kind = ?err.kind(), "{}", err);
                Self::failure(&err)
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Files<T> {
    pub files: Vec<T>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectAllPaths {
    pub select_all_paths: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct Message {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct Termination {
    pub terminated: bool,
}

/// The application core: storage layout, the AI job slot and the ReID
/// index of one user, plus the save prompt used by exports.
pub struct CareService {
    config: Config,
    layout: StorageLayout,
    jobs: Arc<JobRunner>,
    reid: ReidIndex,
    prompt: Arc<dyn SavePrompt>,
}

impl CareService {
    pub fn new(config: Config, prompt: Arc<dyn SavePrompt>) -> Self {
        let jobs = JobRunner::from_config(&config);
        Self::with_jobs(config, jobs, prompt)
    }

    pub fn with_jobs(config: Config, jobs: JobRunner, prompt: Arc<dyn SavePrompt>) -> Self {
        let layout = StorageLayout::from_config(&config);
        Self {
            reid: ReidIndex::new(layout.clone()),
            jobs: Arc::new(jobs),
            layout,
            config,
            prompt,
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Shared handle on the job slot, e.g. for a signal handler.
    pub fn jobs(&self) -> Arc<JobRunner> {
        self.jobs.clone()
    }

    // Gallery

    /// Store an upload under today's date folder.
    pub async fn upload_image(&self, relative: &str, bytes: &[u8]) -> Response<()> {
        self.upload_image_on(&gallery::today(), relative, bytes).await
    }

    pub async fn upload_image_on(&self, date: &str, relative: &str, bytes: &[u8]) -> Response<()> {
        let result = self.layout.uploaded(Some(date)).and_then(|base| {
            gallery::upload(&base, relative, bytes, &self.config.gallery.upload_extensions)
        });
        Response::from_result("upload_image", result)
    }

    /// List the uploaded-images scope (no date) or a folder of one date.
    pub async fn browse_image(&self, date: &str, folder: &str) -> Response<Files<Entry>> {
        let result = self.browse_scope(self.layout.uploaded(None), date, folder, None);
        Response::from_result("browse_image", result.map(|files| Files { files }))
    }

    pub async fn view_image(&self, date: &str, relative: &str) -> Response<ImageData> {
        let result = self.view_in(self.layout.uploaded(Some(date)), date, relative);
        Response::from_result("view_image", result)
    }

    /// Every uploaded file below `folder`, relative to the user scope.
    pub async fn get_image_paths(&self, folder: &str) -> Response<SelectAllPaths> {
        let result = self.layout.uploaded(None).and_then(|base| {
            layout::ensure(&base)?;
            browse::enumerate_files(&base, folder)
        });
        Response::from_result(
            "get_image_paths",
            result.map(|select_all_paths| SelectAllPaths { select_all_paths }),
        )
    }

    pub async fn download_selected_gallery_images(
        &self,
        paths: &[String],
    ) -> Response<ExportOutcome> {
        let result = self.layout.uploaded(None).and_then(|base| {
            archive::export_files(
                self.prompt.as_ref(),
                &base,
                paths,
                &archive::suggested_name("gallery_images"),
            )
        });
        Response::from_result("download_selected_gallery_images", result)
    }

    // Detection

    pub async fn detect(
        &self,
        paths: &[String],
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Response<JobOutcome> {
        Response::from_result("detect", self.jobs.run_detection(paths, events).await)
    }

    pub async fn browse_detect_image(
        &self,
        date: &str,
        folder: &str,
        filter: &DetectionFilter,
    ) -> Response<Files<Entry>> {
        let result = self.browse_scope(self.layout.marked(None), date, folder, Some(filter));
        Response::from_result("browse_detect_image", result.map(|files| Files { files }))
    }

    pub async fn view_detect_image(&self, date: &str, relative: &str) -> Response<ImageData> {
        let result = self.view_in(self.layout.marked(Some(date)), date, relative);
        Response::from_result("view_detect_image", result)
    }

    pub async fn get_detect_image_paths(
        &self,
        folder: &str,
        filter: &DetectionFilter,
    ) -> Response<SelectAllPaths> {
        let result = self.detected_paths(folder, filter);
        Response::from_result(
            "get_detect_image_paths",
            result.map(|select_all_paths| SelectAllPaths { select_all_paths }),
        )
    }

    /// Export every marked image carrying `label`, at any confidence.
    pub async fn download_detect_images(&self, label: &str) -> Response<ExportOutcome> {
        let result = self.export_detected(label);
        Response::from_result("download_detect_images", result)
    }

    pub async fn download_selected_detect_images(
        &self,
        paths: &[String],
    ) -> Response<ExportOutcome> {
        let result = self.layout.marked(None).and_then(|base| {
            archive::export_files(
                self.prompt.as_ref(),
                &base,
                paths,
                &archive::suggested_name("detection_images"),
            )
        });
        Response::from_result("download_selected_detect_images", result)
    }

    // Re-identification

    pub async fn run_reid(
        &self,
        paths: &[String],
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> Response<JobOutcome> {
        Response::from_result("run_reid", self.jobs.run_reid(paths, events).await)
    }

    pub async fn browse_reid_image(
        &self,
        date: &str,
        time: &str,
        group: &str,
    ) -> Response<Files<ReidEntry>> {
        let result = self.reid.browse(Some(date), Some(time), Some(group));
        Response::from_result("browse_reid_image", result.map(|files| Files { files }))
    }

    /// Export one ReID run, one archive folder per group.
    pub async fn download_reid_images(&self, date: &str, time: &str) -> Response<ExportOutcome> {
        let result = self.export_reid(date, time);
        Response::from_result("download_reid_images", result)
    }

    pub async fn delete_reid_result(&self, date: &str, time: &str) -> Response<Message> {
        let result = self.reid.delete(date, time).await;
        Response::from_result("delete_reid_result", result.map(|message| Message { message }))
    }

    pub async fn rename_reid_group(
        &self,
        date: &str,
        time: &str,
        old_group: &str,
        new_group: &str,
    ) -> Response<Message> {
        let result = self.reid.rename(date, time, old_group, new_group).await;
        Response::from_result("rename_reid_group", result.map(|message| Message { message }))
    }

    // Jobs

    pub fn terminate_ai(&self) -> Response<Termination> {
        Response::success(Termination {
            terminated: self.jobs.terminate(),
        })
    }

    pub fn job_status(&self) -> Response<JobStatus> {
        Response::success(self.jobs.status())
    }

    fn browse_scope(
        &self,
        scope: CareResult<PathBuf>,
        date: &str,
        folder: &str,
        filter: Option<&DetectionFilter>,
    ) -> CareResult<Vec<Entry>> {
        let scope = scope?;
        let (base, relative, ensure_scope) = if date.is_empty() {
            (scope, "", true)
        } else {
            (crate::sandbox::resolve(&scope, date)?, folder, false)
        };

        match filter {
            Some(filter) => {
                browse::list_dir_filtered(&self.layout, &base, relative, ensure_scope, filter)
            }
            None => browse::list_dir(&base, relative, ensure_scope),
        }
    }

    fn view_in(
        &self,
        base: CareResult<PathBuf>,
        date: &str,
        relative: &str,
    ) -> CareResult<ImageData> {
        if date.is_empty() || relative.is_empty() {
            return Err(CareError::MissingParams("date, imagePath".to_string()));
        }
        gallery::view(&base?, relative)
    }

    fn detected_paths(&self, folder: &str, filter: &DetectionFilter) -> CareResult<Vec<PathBuf>> {
        let base = self.layout.marked(None)?;
        layout::ensure(&base)?;
        browse::enumerate_files_filtered(&self.layout, &base, folder, filter)
    }

    fn export_detected(&self, label: &str) -> CareResult<ExportOutcome> {
        let filter = DetectionFilter::new(label, 0.0, 1.0);
        let paths: Vec<String> = self
            .detected_paths("", &filter)?
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();

        archive::export_files(
            self.prompt.as_ref(),
            &self.layout.marked(None)?,
            &paths,
            &archive::suggested_name(&format!("detection_{}_images", label)),
        )
    }

    fn export_reid(&self, date: &str, time: &str) -> CareResult<ExportOutcome> {
        if date.is_empty() || time.is_empty() {
            return Err(CareError::MissingParams("date, time".to_string()));
        }
        let groups = self.reid.groups(date, time)?;
        archive::export_groups(
            self.prompt.as_ref(),
            &self.layout.marked(None)?,
            &groups,
            &archive::suggested_name("reid_images"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::AiLauncher;
    use std::fs;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    struct Recorder {
        destination: PathBuf,
        suggested: Mutex<Vec<String>>,
    }

    impl SavePrompt for Recorder {
        fn choose_destination(&self, _title: &str, suggested: &str) -> Option<PathBuf> {
            self.suggested.lock().unwrap().push(suggested.to_string());
            Some(self.destination.clone())
        }
    }

    fn service(launcher: AiLauncher) -> (TempDir, CareService, Arc<Recorder>) {
        let dir = tempdir().unwrap();
        let config = Config {
            storage_root: dir.path().join("root"),
            ..Config::default()
        };
        let prompt = Arc::new(Recorder {
            destination: dir.path().join("export.zip"),
            suggested: Mutex::new(Vec::new()),
        });
        let jobs = JobRunner::new(StorageLayout::from_config(&config), launcher);
        let service = CareService::with_jobs(config, jobs, prompt.clone());
        (dir, service, prompt)
    }

    fn json<T: Serialize>(response: &Response<T>) -> serde_json::Value {
        serde_json::to_value(response).unwrap()
    }

    #[tokio::test]
    async fn test_upload_browse_and_view() {
        let (_dir, service, _prompt) = service(AiLauncher::new("/bin/false"));

        // Empty scope is created on first browse
        let response = service.browse_image("", "").await;
        assert_eq!(json(&response), serde_json::json!({ "ok": true, "files": [] }));

        let response = service
            .upload_image_on("20240101", "trip1/cam1.jpg", &[0xFF, 0xD8])
            .await;
        assert!(response.ok);

        let response = service.browse_image("20240101", "").await;
        let value = json(&response);
        assert_eq!(value["files"].as_array().unwrap().len(), 1);
        assert_eq!(value["files"][0]["name"], "trip1");
        assert_eq!(value["files"][0]["isDirectory"], true);

        let response = service.browse_image("20240101", "trip1").await;
        let value = json(&response);
        assert_eq!(value["files"][0]["name"], "cam1.jpg");
        assert_eq!(value["files"][0]["isDirectory"], false);
        assert_eq!(value["files"][0]["path"], "trip1/cam1.jpg");

        let response = service.get_image_paths("").await;
        assert_eq!(
            json(&response),
            serde_json::json!({ "ok": true, "selectAllPaths": ["20240101/trip1/cam1.jpg"] })
        );

        let response = service.view_image("20240101", "trip1/cam1.jpg").await;
        assert_eq!(response.data.unwrap().mime, "image/jpeg");
    }

    #[tokio::test]
    async fn test_failures_are_tagged() {
        let (_dir, service, _prompt) = service(AiLauncher::new("/bin/false"));

        let response = service.upload_image("a.png", b"x").await;
        assert_eq!(
            json(&response),
            serde_json::json!({
                "ok": false,
                "kind": "invalid_input",
                "error": "Only .jpg files are allowed."
            })
        );

        let response = service.browse_image("20240101", "../../../..").await;
        assert_eq!(response.kind, Some(ErrorKind::InvalidPath));

        let response = service.view_image("", "a.jpg").await;
        assert_eq!(response.kind, Some(ErrorKind::MissingParams));

        let response = service.rename_reid_group("20240101", "1200", "ID-0", "ID-1").await;
        assert_eq!(response.kind, Some(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_detected_exports() {
        let (dir, service, prompt) = service(AiLauncher::new("/bin/false"));
        let layout = service.layout().clone();
        let marked = layout.marked(Some("20240101")).unwrap();
        let json_dir = layout.cropped_json().join("20240101");
        fs::create_dir_all(&marked).unwrap();
        fs::create_dir_all(&json_dir).unwrap();
        fs::write(marked.join("a.jpg"), b"a").unwrap();
        fs::write(marked.join("b.jpg"), b"b").unwrap();
        fs::write(
            json_dir.join("a.json"),
            r#"{"boxes":[{"label":"Stoat","confidence":0.9}]}"#,
        )
        .unwrap();

        let filter = DetectionFilter::new("Stoat", 0.5, 1.0);
        let response = service.browse_detect_image("20240101", "", &filter).await;
        let value = json(&response);
        assert_eq!(value["files"].as_array().unwrap().len(), 1);
        assert_eq!(value["files"][0]["name"], "a.jpg");

        let response = service.download_detect_images("Stoat").await;
        let value = json(&response);
        assert_eq!(value["ok"], true);
        assert_eq!(value["status"], "written");
        assert_eq!(value["written"], 1);
        assert!(dir.path().join("export.zip").is_file());

        let suggested = prompt.suggested.lock().unwrap();
        assert!(suggested[0].starts_with("detection_Stoat_images_"));
    }

    #[tokio::test]
    async fn test_reid_export_and_delete() {
        let (dir, service, _prompt) = service(AiLauncher::new("/bin/false"));
        let layout = service.layout().clone();
        let marked = layout.marked(Some("20240101")).unwrap();
        fs::create_dir_all(&marked).unwrap();
        fs::write(marked.join("a.jpg"), b"a").unwrap();
        let reid_dir = layout.reid_output(Some("20240101")).unwrap();
        fs::create_dir_all(&reid_dir).unwrap();
        fs::write(reid_dir.join("1200.json"), r#"{"ID-0":["20240101/a.jpg"]}"#).unwrap();

        let response = service.browse_reid_image("20240101", "1200", "").await;
        assert_eq!(json(&response)["files"][0]["group_id"], "ID-0");

        let response = service.download_reid_images("20240101", "1200").await;
        assert_eq!(json(&response)["written"], 1);
        assert!(dir.path().join("export.zip").is_file());

        let response = service.delete_reid_result("20240101", "1200").await;
        assert!(json(&response)["message"]
            .as_str()
            .unwrap()
            .contains("deleted successfully"));
        assert!(!reid_dir.exists());
    }

    #[tokio::test]
    async fn test_job_status_and_terminate_when_idle() {
        let (_dir, service, _prompt) = service(AiLauncher::new("/bin/false"));
        assert_eq!(
            json(&service.job_status()),
            serde_json::json!({ "ok": true, "state": "idle" })
        );
        assert_eq!(
            json(&service.terminate_ai()),
            serde_json::json!({ "ok": true, "terminated": false })
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_detect_reports_model_failure() {
        let (_dir, service, _prompt) = service(AiLauncher::new("/bin/false"));
        service
            .upload_image_on("20240101", "cam1.jpg", &[0xFF, 0xD8])
            .await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let response = service.detect(&["20240101/cam1.jpg".to_string()], tx).await;
        assert!(!response.ok);
        assert_eq!(response.kind, Some(ErrorKind::AiProcessError));
        assert!(!service.layout().temp_detection_pending().exists());
    }
}
