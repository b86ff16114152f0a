//! Locating the AI executable.
//!
//! Resolution order:
//! 1. an explicit `ai.executable`,
//! 2. a development script (`ai.script` / `PYTHON_SCRIPT_PATH`) run by a
//!    virtualenv interpreter, `conda run`, or `python3`,
//! 3. the packaged `care-detect-reid` binary shipped next to this program.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::config::AiConfig;

const PACKAGED_NAME: &str = "care-detect-reid";

/// Resolved program plus the arguments that precede the task arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiLauncher {
    program: PathBuf,
    prefix_args: Vec<OsString>,
}

impl AiLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.prefix_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn from_config(config: &AiConfig) -> Self {
        if let Some(executable) = &config.executable {
            return Self::new(executable);
        }

        if let Some(script) = &config.script {
            if let Some(venv) = &config.venv {
                tracing::info!(venv = %venv.display(), "Using virtualenv interpreter");
                return Self::new(venv_python(venv)).with_prefix_args([script.as_os_str()]);
            }
            if conda_available() {
                let env = config.conda_env_name();
                tracing::info!(env = %env, "Using conda interpreter");
                let python = if cfg!(windows) { "python" } else { "python3" };
                return Self::new("conda").with_prefix_args([
                    OsString::from("run"),
                    OsString::from("--no-capture-output"),
                    OsString::from("-n"),
                    OsString::from(env),
                    OsString::from(python),
                    script.clone().into_os_string(),
                ]);
            }
            let python = if cfg!(windows) { "python" } else { "python3" };
            return Self::new(python).with_prefix_args([script.as_os_str()]);
        }

        Self::new(packaged_executable())
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn prefix_args(&self) -> &[OsString] {
        &self.prefix_args
    }

    /// Build the command for one task. Output streams are piped and the
    /// child is killed if its handle is dropped.
    pub fn command(&self, args: &[OsString]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.prefix_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        command
    }
}

fn venv_python(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts").join("python")
    } else {
        venv.join("bin").join("python")
    }
}

fn conda_available() -> bool {
    std::process::Command::new("conda")
        .arg("info")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn packaged_executable() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    let name = if cfg!(windows) {
        format!("{}.exe", PACKAGED_NAME)
    } else {
        PACKAGED_NAME.to_string()
    };
    exe_dir.join("resources").join(PACKAGED_NAME).join(name)
}
