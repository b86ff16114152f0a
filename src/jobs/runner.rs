//! The single AI job slot.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::{AiLauncher, JobEvent, JobId, JobKind, JobOutcome, JobStatus, OutputStream, TaskProgress};
use crate::config::Config;
use crate::error::{CareError, CareResult, IoContext};
use crate::layout::{self, StorageLayout};
use crate::sandbox;

/// Owns the at-most-one running AI process.
///
/// Starting a job terminates any previous one and waits for its cleanup
/// before staging. [`JobRunner::terminate`] may be called from any task.
pub struct JobRunner {
    layout: StorageLayout,
    launcher: AiLauncher,
    forward_detection_stderr: bool,
    state: Arc<Mutex<SlotState>>,
    /// Held from terminating the previous job until the new process is
    /// registered, so staging sequences never interleave.
    launch: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct SlotState {
    active: Option<ActiveJob>,
    /// Kill switch of a job whose process has exited but whose output is
    /// still being read.
    draining: Option<(JobId, oneshot::Sender<()>)>,
    /// Flips to `true` once the most recently started job has cleaned up.
    last_finished: Option<watch::Receiver<bool>>,
}

struct ActiveJob {
    id: JobId,
    kind: JobKind,
    pid: Option<u32>,
    running: bool,
    kill: Option<oneshot::Sender<()>>,
}

/// Removes the job's temp areas, releases the slot and reports completion
/// when dropped, whichever way the job ends.
struct JobGuard {
    state: Arc<Mutex<SlotState>>,
    id: JobId,
    temp_dirs: Vec<PathBuf>,
    finished: watch::Sender<bool>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        for dir in &self.temp_dirs {
            if let Err(e) = layout::remove_tree(dir) {
                warn!(job = self.id.0, error = %e, "Failed to remove temp directory");
            }
        }

        {
            let mut state = lock(&self.state);
            if state.active.as_ref().map_or(false, |job| job.id == self.id) {
                state.active = None;
            }
            if state.draining.as_ref().map_or(false, |(id, _)| *id == self.id) {
                state.draining = None;
            }
        }

        self.finished.send_replace(true);
    }
}

fn lock(state: &Mutex<SlotState>) -> MutexGuard<'_, SlotState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl JobRunner {
    pub fn new(layout: StorageLayout, launcher: AiLauncher) -> Self {
        Self {
            layout,
            launcher,
            forward_detection_stderr: false,
            state: Arc::new(Mutex::new(SlotState::default())),
            launch: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            StorageLayout::from_config(config),
            AiLauncher::from_config(&config.ai),
        )
        .with_forwarded_detection_stderr(config.ai.forward_detection_stderr)
    }

    pub fn with_forwarded_detection_stderr(mut self, forward: bool) -> Self {
        self.forward_detection_stderr = forward;
        self
    }

    /// Stage `selected` (paths relative to the uploaded images of the user)
    /// and run the detection model over them.
    pub async fn run_detection(
        &self,
        selected: &[String],
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> CareResult<JobOutcome> {
        self.run(JobKind::Detection, selected, events).await
    }

    /// Stage `selected` and run re-identification over them.
    pub async fn run_reid(
        &self,
        selected: &[String],
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> CareResult<JobOutcome> {
        self.run(JobKind::Reid, selected, events).await
    }

    /// Kill the running job, if any. Returns whether there was one.
    ///
    /// The slot is cleared immediately; the killed job removes its own temp
    /// area once the process has exited. A job whose process already exited
    /// stops waiting for its output.
    pub fn terminate(&self) -> bool {
        let (job, draining) = {
            let mut state = lock(&self.state);
            (state.active.take(), state.draining.take())
        };
        if let Some((id, kill)) = draining {
            debug!(job = id.0, "Dropping output of exited AI process");
            let _ = kill.send(());
        }
        match job {
            Some(mut job) => {
                info!(job = job.id.0, kind = job.kind.keyword(), "Terminating AI job");
                if let Some(kill) = job.kill.take() {
                    let _ = kill.send(());
                }
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> JobStatus {
        match &lock(&self.state).active {
            None => JobStatus::Idle,
            Some(job) if job.running => JobStatus::Running {
                id: job.id,
                kind: job.kind,
                pid: job.pid,
            },
            Some(job) => JobStatus::Staging {
                id: job.id,
                kind: job.kind,
            },
        }
    }

    async fn run(
        &self,
        kind: JobKind,
        selected: &[String],
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> CareResult<JobOutcome> {
        if selected.is_empty() {
            return Err(CareError::MissingParams("no images selected".to_string()));
        }

        let launch = self.launch.lock().await;

        // At most one job: stop the previous one and let it clean up.
        self.terminate();
        let previous = lock(&self.state).last_finished.clone();
        if let Some(mut finished) = previous {
            let _ = finished.wait_for(|done| *done).await;
        }

        let id = JobId::new();
        let (kill_tx, mut kill_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = watch::channel(false);
        {
            let mut state = lock(&self.state);
            state.active = Some(ActiveJob {
                id,
                kind,
                pid: None,
                running: false,
                kill: Some(kill_tx),
            });
            state.last_finished = Some(finished_rx);
        }
        let _guard = JobGuard {
            state: self.state.clone(),
            id,
            temp_dirs: self.temp_dirs(kind),
            finished: finished_tx,
        };

        for dir in self.temp_dirs(kind) {
            layout::remove_tree(&dir)?;
        }

        let (staged, skipped) = self.stage(id, kind, selected).await?;
        let args = self.arguments(kind)?;

        if !matches!(kill_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            return Err(CareError::Terminated {
                task: kind.display_name().to_string(),
            });
        }

        info!(
            job = id.0,
            program = %self.launcher.program().display(),
            args = ?args,
            "Spawning AI process"
        );
        let mut child = self
            .launcher
            .command(&args)
            .spawn()
            .map_err(|source| CareError::Launch {
                program: self.launcher.program().to_path_buf(),
                source,
            })?;

        {
            let mut state = lock(&self.state);
            if let Some(job) = state.active.as_mut().filter(|job| job.id == id) {
                job.pid = child.id();
                job.running = true;
            }
        }
        drop(launch);

        let forward_stderr = kind == JobKind::Reid || self.forward_detection_stderr;
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(
                stdout,
                OutputStream::Stdout,
                events.clone(),
                true,
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(
                stderr,
                OutputStream::Stderr,
                events.clone(),
                forward_stderr,
            )));
        }

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = &mut kill_rx => None,
        };

        let status = match status {
            Some(status) => {
                // The process is gone; release the slot but keep a way to
                // stop reading if a descendant still holds the pipes.
                let mut state = lock(&self.state);
                if state.active.as_ref().map_or(false, |job| job.id == id) {
                    if let Some(kill) = state.active.take().and_then(|mut job| job.kill.take()) {
                        state.draining = Some((id, kill));
                    }
                }
                drop(state);
                status.io_context("wait for AI process", self.launcher.program())?
            }
            None => {
                if let Err(e) = child.kill().await {
                    warn!(job = id.0, error = %e, "Failed to kill AI process");
                }
                for reader in &readers {
                    reader.abort();
                }
                info!(job = id.0, "AI process terminated");
                return Err(CareError::Terminated {
                    task: kind.display_name().to_string(),
                });
            }
        };

        // Deliver every line before reporting the result.
        let delivered = tokio::select! {
            _ = async {
                for reader in readers.iter_mut() {
                    let _ = reader.await;
                }
            } => true,
            _ = &mut kill_rx => false,
        };
        if !delivered {
            for reader in &readers {
                reader.abort();
            }
            warn!(job = id.0, "Stopped reading output held open after AI process exit");
        }

        info!(job = id.0, code = ?status.code(), "AI process exited");
        if status.success() {
            Ok(JobOutcome {
                id,
                kind,
                staged,
                skipped,
            })
        } else {
            Err(CareError::AiProcess {
                task: kind.display_name().to_string(),
                code: status.code(),
            })
        }
    }

    fn temp_dirs(&self, kind: JobKind) -> Vec<PathBuf> {
        match kind {
            JobKind::Detection => vec![self.layout.temp_detection_pending()],
            JobKind::Reid => vec![
                self.layout.temp_reid_pending(),
                self.layout.temp_cropped_reid_pending(),
            ],
        }
    }

    fn staging_dir(&self, kind: JobKind) -> PathBuf {
        match kind {
            JobKind::Detection => self.layout.temp_detection_pending(),
            JobKind::Reid => self.layout.temp_reid_pending(),
        }
    }

    /// Copy the selected uploads into the staging area. Every path is
    /// validated before anything is copied; vanished files are skipped.
    async fn stage(
        &self,
        id: JobId,
        kind: JobKind,
        selected: &[String],
    ) -> CareResult<(usize, Vec<PathBuf>)> {
        let uploads = sandbox::normalize(&self.layout.uploaded(None)?);
        let sources = selected
            .iter()
            .map(|relative| sandbox::resolve(&uploads, relative))
            .collect::<CareResult<Vec<_>>>()?;

        let staging = self.staging_dir(kind);
        layout::ensure(&staging)?;

        let mut staged = 0;
        let mut skipped = Vec::new();

        for source in sources {
            let relative = source.strip_prefix(&uploads).unwrap_or(Path::new(""));
            match tokio::fs::metadata(&source).await {
                Ok(metadata) if metadata.is_file() => {
                    let destination = staging.join(relative);
                    if let Some(parent) = destination.parent() {
                        tokio::fs::create_dir_all(parent)
                            .await
                            .io_context("create directory", parent)?;
                    }
                    tokio::fs::copy(&source, &destination)
                        .await
                        .io_context("copy", &source)?;
                    staged += 1;
                }
                Ok(_) => {
                    warn!(job = id.0, path = %relative.display(), "Not a file, skipping");
                    skipped.push(relative.to_path_buf());
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(job = id.0, path = %relative.display(), "File not found, skipping");
                    skipped.push(relative.to_path_buf());
                }
                Err(e) => return Err(CareError::io("stat", &source, e)),
            }
        }

        info!(job = id.0, kind = kind.keyword(), staged, skipped = skipped.len(), "Staged images");
        Ok((staged, skipped))
    }

    /// Positional arguments of the AI executable. Output directories are
    /// created so the process never has to.
    fn arguments(&self, kind: JobKind) -> CareResult<Vec<OsString>> {
        let marked = self.layout.marked(None)?;
        let cropped_json = self.layout.cropped_json();
        let logs = self.layout.logs();

        let args = match kind {
            JobKind::Detection => {
                for dir in [&marked, &cropped_json, &logs] {
                    layout::ensure(dir)?;
                }
                vec![
                    OsString::from(kind.keyword()),
                    self.layout.temp_detection_pending().into_os_string(),
                    marked.into_os_string(),
                    cropped_json.into_os_string(),
                    logs.into_os_string(),
                ]
            }
            JobKind::Reid => {
                let cropped_pending = self.layout.temp_cropped_reid_pending();
                let reid_output = self.layout.reid_output(None)?;
                for dir in [&cropped_json, &cropped_pending, &reid_output, &logs] {
                    layout::ensure(dir)?;
                }
                vec![
                    OsString::from(kind.keyword()),
                    self.layout.temp_reid_pending().into_os_string(),
                    cropped_json.into_os_string(),
                    cropped_pending.into_os_string(),
                    reid_output.into_os_string(),
                    logs.into_os_string(),
                ]
            }
        };

        Ok(args)
    }
}

/// Forward one output stream line by line. Lines are always drained so the
/// child never blocks on a full pipe.
async fn forward_lines<R>(
    reader: R,
    stream: OutputStream,
    events: mpsc::UnboundedSender<JobEvent>,
    forward: bool,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']);
                debug!(?stream, "{}", line);
                if !forward {
                    continue;
                }
                let event = match TaskProgress::parse(line) {
                    Some(progress) => JobEvent::Progress(progress),
                    None => JobEvent::Output {
                        stream,
                        line: line.to_string(),
                    },
                };
                let _ = events.send(event);
            }
            Err(e) => {
                warn!(?stream, error = %e, "Failed to read AI process output");
                break;
            }
        }
    }
}
