use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base directory holding every data, temp and log subtree.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Tenant folder under each storage area. Single hard-coded user.
    #[serde(default = "default_user_scope")]
    pub user_scope: String,

    #[serde(default)]
    pub ai: AiConfig,

    #[serde(default)]
    pub gallery: GalleryConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AiConfig {
    /// Explicit path to the detection/re-identification executable.
    #[serde(default)]
    pub executable: Option<PathBuf>,

    /// Development mode: Python entry script run through an interpreter.
    #[serde(default)]
    pub script: Option<PathBuf>,

    /// Virtual environment providing the interpreter for `script`.
    #[serde(default)]
    pub venv: Option<PathBuf>,

    /// Conda environment name, derived from `device` when unset.
    #[serde(default)]
    pub conda_env: Option<String>,

    #[serde(default)]
    pub device: Device,

    /// Forward stderr of detection jobs to the caller (ReID always does).
    #[serde(default)]
    pub forward_detection_stderr: bool,
}

impl AiConfig {
    pub fn conda_env_name(&self) -> String {
        match &self.conda_env {
            Some(name) => name.clone(),
            None => match self.device {
                Device::Gpu => "CARE-GPU".to_string(),
                Device::Cpu => "CARE".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryConfig {
    /// Extensions accepted by uploads (compared case-insensitively).
    #[serde(default = "default_upload_extensions")]
    pub upload_extensions: Vec<String>,
}

fn default_upload_extensions() -> Vec<String> {
    vec!["jpg".to_string()]
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            upload_extensions: default_upload_extensions(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    #[cfg(windows)]
    {
        if let Some(appdata) = std::env::var_os("APPDATA").or_else(|| std::env::var_os("LOCALAPPDATA")) {
            return PathBuf::from(appdata).join("ml4sg-care");
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ml4sg-care")
}

fn default_user_scope() -> String {
    "1".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            user_scope: default_user_scope(),
            ai: AiConfig::default(),
            gallery: GalleryConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let mut config = if config_path.exists() {
            Self::read(&config_path)?
        } else {
            // Create default config
            let config = Config::default();
            config.save_to(&config_path)?;
            config
        };
        config.apply_env();
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::read(path)?;
        config.apply_env();
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Environment variables understood by the development launcher take
    /// precedence over the file.
    fn apply_env(&mut self) {
        if let Some(script) = std::env::var_os("PYTHON_SCRIPT_PATH") {
            self.ai.script = Some(PathBuf::from(script));
        }
        if let Some(venv) = std::env::var_os("VIRTUAL_ENV") {
            self.ai.venv = Some(PathBuf::from(venv));
        }
        if let Ok(device) = std::env::var("DEVICE") {
            if device.eq_ignore_ascii_case("gpu") {
                self.ai.device = Device::Gpu;
            } else if device.eq_ignore_ascii_case("cpu") {
                self.ai.device = Device::Cpu;
            }
        }
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("care")
    }

    fn config_path() -> PathBuf {
        if let Some(path) = std::env::var_os("CARE_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.user_scope, "1");
        assert!(config.storage_root.ends_with(".ml4sg-care") || config.storage_root.ends_with("ml4sg-care"));
        assert_eq!(config.gallery.upload_extensions, vec!["jpg".to_string()]);
        assert_eq!(config.ai.conda_env_name(), "CARE");
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            storage_root = "/srv/care"

            [ai]
            device = "gpu"
            "#,
        )
        .unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/srv/care"));
        assert_eq!(config.user_scope, "1");
        assert_eq!(config.ai.device, Device::Gpu);
        assert_eq!(config.ai.conda_env_name(), "CARE-GPU");
        assert!(config.ai.executable.is_none());
    }

    #[test]
    fn test_save_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.storage_root = dir.path().join("root");
        config.ai.executable = Some(PathBuf::from("/opt/care/care-detect-reid"));
        config.save_to(&path).unwrap();

        let loaded = Config::read(&path).unwrap();
        assert_eq!(loaded.storage_root, dir.path().join("root"));
        assert_eq!(
            loaded.ai.executable,
            Some(PathBuf::from("/opt/care/care-detect-reid"))
        );
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "storage_root = [").unwrap();

        let err = Config::read(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("config.toml"));
    }
}
