//! Uploading and viewing single images.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Serialize, Serializer};
use std::fs;
use std::io;
use std::path::Path;
use tracing::debug;

use crate::error::{CareError, CareResult, IoContext};
use crate::layout;
use crate::sandbox;

/// Date folder name for today, `YYYYMMDD` in local time.
pub fn today() -> String {
    chrono::Local::now().format("%Y%m%d").to_string()
}

/// Bytes of an image plus its MIME type. Serialised with the bytes as
/// standard base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageData {
    #[serde(serialize_with = "as_base64")]
    pub data: Vec<u8>,
    pub mime: String,
}

fn as_base64<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(data))
}

/// Store an uploaded image at `base/relative`, creating folders as needed.
///
/// `base` is the date folder the upload lands in. Only extensions listed
/// in `allowed` (compared case-insensitively, without the dot) are accepted.
pub fn upload(base: &Path, relative: &str, bytes: &[u8], allowed: &[String]) -> CareResult<()> {
    if bytes.is_empty() {
        return Err(CareError::InvalidInput("No file was uploaded.".to_string()));
    }

    let extension = Path::new(relative)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    if !allowed.iter().any(|a| a.eq_ignore_ascii_case(&extension)) {
        let list = allowed
            .iter()
            .map(|a| format!(".{}", a))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(CareError::InvalidInput(format!(
            "Only {} files are allowed.",
            list
        )));
    }

    let target = sandbox::resolve(base, relative)?;
    if target == sandbox::normalize(base) {
        return Err(CareError::InvalidInput("Missing file name.".to_string()));
    }
    if let Some(parent) = target.parent() {
        layout::ensure(parent)?;
    }

    fs::write(&target, bytes).io_context("write", &target)?;
    debug!(path = %target.display(), size = bytes.len(), "Stored upload");
    Ok(())
}

/// Read the image at `base/relative`.
pub fn view(base: &Path, relative: &str) -> CareResult<ImageData> {
    if relative.is_empty() {
        return Err(CareError::MissingParams("date, imagePath".to_string()));
    }

    let target = sandbox::resolve(base, relative)?;
    let metadata = match fs::metadata(&target) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CareError::not_found(format!("Image {}", relative)));
        }
        Err(e) => return Err(CareError::io("stat", &target, e)),
    };
    if metadata.is_dir() {
        return Err(CareError::NotAFile { path: target });
    }

    let mime = mime_guess::from_path(&target)
        .first()
        .filter(|m| m.type_() == mime_guess::mime::IMAGE)
        .ok_or_else(|| CareError::NotAnImage {
            path: target.clone(),
        })?;

    let data = fs::read(&target).io_context("read", &target)?;
    Ok(ImageData {
        data,
        mime: mime.to_string(),
    })
}
