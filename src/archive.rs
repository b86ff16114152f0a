//! Zip export of selected images.
//!
//! Archives are store-only: camera-trap JPEGs do not compress, and the
//! archive is meant to be unpacked elsewhere as is.

use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::{CareError, CareResult, IoContext};
use crate::reid::ReidGroups;
use crate::sandbox;

/// Title of the save dialog shown for every export.
pub const SAVE_TITLE: &str = "Save archive as";

/// Asks the user where to write an archive.
///
/// Implemented by whatever front end is driving the service; `None` means
/// the user cancelled.
pub trait SavePrompt: Send + Sync {
    fn choose_destination(&self, title: &str, suggested: &str) -> Option<PathBuf>;
}

/// What ended up in a written archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveSummary {
    pub destination: PathBuf,
    /// Number of files stored.
    pub written: usize,
    /// Requested files that were missing, relative to the source base.
    pub skipped: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExportOutcome {
    Cancelled,
    Written(ArchiveSummary),
}

/// Local time stamp used in suggested archive names.
pub fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// `<prefix>_<timestamp>.zip`
pub fn suggested_name(prefix: &str) -> String {
    format!("{}_{}.zip", prefix, timestamp())
}

/// A file scheduled for the archive.
struct Planned {
    source: PathBuf,
    name: String,
    /// Reported when the source is missing.
    requested: PathBuf,
}

/// Archive `rel_paths` (relative to `base`) keeping their folder structure.
pub fn export_files(
    prompt: &dyn SavePrompt,
    base: &Path,
    rel_paths: &[String],
    suggested: &str,
) -> CareResult<ExportOutcome> {
    if rel_paths.is_empty() {
        return Err(CareError::MissingParams("no image paths provided".to_string()));
    }
    if !base.exists() {
        return Err(CareError::not_found(format!(
            "Source folder {}",
            base.display()
        )));
    }

    let base = sandbox::normalize(base);
    let mut planned = Vec::with_capacity(rel_paths.len());
    for relative in rel_paths {
        let source = sandbox::resolve(&base, relative)?;
        let inner = source.strip_prefix(&base).unwrap_or(Path::new("")).to_path_buf();
        planned.push(Planned {
            name: entry_name(&inner),
            requested: inner,
            source,
        });
    }

    write_with_prompt(prompt, suggested, planned)
}

/// ReID variant: each group becomes a folder holding the basenames of its
/// images. Stored image paths are resolved against `base`.
pub fn export_groups(
    prompt: &dyn SavePrompt,
    base: &Path,
    groups: &ReidGroups,
    suggested: &str,
) -> CareResult<ExportOutcome> {
    let base = sandbox::normalize(base);
    let mut planned = Vec::new();

    for (group, images) in groups {
        for stored in images {
            let source = sandbox::resolve(&base, stored)?;
            let file_name = source
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            planned.push(Planned {
                name: format!("{}/{}", group, file_name),
                requested: PathBuf::from(stored),
                source,
            });
        }
    }

    write_with_prompt(prompt, suggested, planned)
}

fn write_with_prompt(
    prompt: &dyn SavePrompt,
    suggested: &str,
    planned: Vec<Planned>,
) -> CareResult<ExportOutcome> {
    let Some(destination) = prompt.choose_destination(SAVE_TITLE, suggested) else {
        info!(suggested, "Export cancelled");
        return Ok(ExportOutcome::Cancelled);
    };

    let summary = write_archive(&destination, planned)?;
    info!(
        destination = %summary.destination.display(),
        written = summary.written,
        skipped = summary.skipped.len(),
        "Archive written"
    );
    Ok(ExportOutcome::Written(summary))
}

/// Build the archive next to `destination` and move it into place once
/// complete, so a failed export never leaves a truncated file behind.
fn write_archive(destination: &Path, planned: Vec<Planned>) -> CareResult<ArchiveSummary> {
    let file_name = destination
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| CareError::InvalidInput("Archive destination has no file name".to_string()))?;
    let partial = destination.with_file_name(format!(".{}.{}.part", file_name, std::process::id()));

    match write_entries(&partial, planned) {
        Ok((written, skipped)) => {
            std::fs::rename(&partial, destination).io_context("rename", &partial)?;
            Ok(ArchiveSummary {
                destination: destination.to_path_buf(),
                written,
                skipped,
            })
        }
        Err(e) => {
            if let Err(remove) = std::fs::remove_file(&partial) {
                if remove.kind() != io::ErrorKind::NotFound {
                    warn!(path = %partial.display(), error = %remove, "Failed to remove partial archive");
                }
            }
            Err(e)
        }
    }
}

fn write_entries(destination: &Path, planned: Vec<Planned>) -> CareResult<(usize, Vec<PathBuf>)> {
    let file = File::create(destination).io_context("create archive", destination)?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);

    let mut written = 0;
    let mut skipped = Vec::new();

    for entry in planned {
        let mut source = match File::open(&entry.source) {
            Ok(f) if entry.source.is_file() => f,
            Ok(_) => {
                warn!(path = %entry.source.display(), "Not a file, skipping");
                skipped.push(entry.requested);
                continue;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %entry.source.display(), "File not found, skipping");
                skipped.push(entry.requested);
                continue;
            }
            Err(e) => return Err(CareError::io("open", &entry.source, e)),
        };

        zip.start_file(entry.name.as_str(), options)?;
        io::copy(&mut source, &mut zip).io_context("archive", &entry.source)?;
        written += 1;
    }

    let writer = zip.finish()?;
    let file = writer
        .into_inner()
        .map_err(|e| CareError::io("flush archive", destination, e.into_error()))?;
    file.sync_all().io_context("sync archive", destination)?;

    Ok((written, skipped))
}

/// Archive entry name: path components joined with `/`.
fn entry_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
