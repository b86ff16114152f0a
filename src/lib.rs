//! Storage and AI job orchestration for the CARE camera-trap image tool.

pub mod archive;
pub mod browse;
pub mod config;
pub mod error;
pub mod gallery;
pub mod jobs;
pub mod layout;
pub mod logging;
pub mod reid;
pub mod sandbox;
pub mod service;
pub mod sidecar;

pub use error::{CareError, CareResult, ErrorKind};
pub use service::{CareService, Response};
