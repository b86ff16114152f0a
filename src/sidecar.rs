//! Detection metadata sidecar files and the label/confidence filter.
//!
//! The detector writes one JSON file per marked image:
//! `{ "boxes": [ { "label": "Stoat", "confidence": 0.82, ... }, ... ] }`.
//! Only the first box is consulted.

use serde::Deserialize;
use std::path::Path;

/// Label value that selects images without any detection.
pub const NO_DETECTION: &str = "No Detection";

#[derive(Debug, Deserialize)]
struct SidecarFile {
    boxes: Vec<SidecarBox>,
}

#[derive(Debug, Deserialize)]
struct SidecarBox {
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// First box of a sidecar file.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub label: Option<String>,
    pub confidence: Option<f64>,
}

/// Read the first box of a sidecar. `None` when the file is missing,
/// unreadable, not JSON, or has no boxes.
pub fn read_detection(path: &Path) -> Option<Detection> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Sidecar not readable");
            return None;
        }
    };

    match serde_json::from_str::<SidecarFile>(&content) {
        Ok(file) => file.boxes.into_iter().next().map(|b| Detection {
            label: b.label,
            confidence: b.confidence,
        }),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Sidecar not parsable");
            None
        }
    }
}

/// Label and confidence criteria applied to marked images.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionFilter {
    /// Requested label; empty matches any label.
    pub label: String,
    pub conf_low: f64,
    pub conf_high: f64,
}

impl DetectionFilter {
    pub fn new(label: impl Into<String>, conf_low: f64, conf_high: f64) -> Self {
        Self {
            label: label.into(),
            conf_low,
            conf_high,
        }
    }

    /// Every detected image, any label, full confidence range.
    pub fn any() -> Self {
        Self::new("", 0.0, 1.0)
    }

    pub fn is_no_detection(&self) -> bool {
        self.label == NO_DETECTION
    }

    /// Whether an image with the given sidecar content passes.
    ///
    /// In "No Detection" mode an image passes when it has no usable sidecar
    /// or its label is null, and confidence is ignored. Otherwise the sidecar
    /// must be usable, the label must match (or the filter label be empty)
    /// and the confidence must lie in `[conf_low, conf_high]`.
    pub fn matches(&self, detection: Option<&Detection>) -> bool {
        if self.is_no_detection() {
            return detection.map_or(true, |d| d.label.is_none());
        }

        let Some(detection) = detection else {
            return false;
        };

        let label_matches =
            self.label.is_empty() || detection.label.as_deref() == Some(self.label.as_str());
        let confidence_matches = detection
            .confidence
            .map_or(false, |c| c >= self.conf_low && c <= self.conf_high);

        label_matches && confidence_matches
    }
}
