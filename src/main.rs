use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use care::archive::SavePrompt;
use care::config::Config;
use care::jobs::JobEvent;
use care::layout::StorageLayout;
use care::sidecar::DetectionFilter;
use care::{logging, CareService, Response};

enum Command {
    Browse { date: String, folder: String },
    Paths { folder: String },
    Upload { file: PathBuf, relative: Option<String>, date: Option<String> },
    Detect { paths: Vec<String> },
    Reid { paths: Vec<String> },
    DetectBrowse { date: String, folder: String, filter: DetectionFilter },
    DetectPaths { folder: String, filter: DetectionFilter },
    ReidBrowse { date: String, time: String, group: String },
    ReidRename { date: String, time: String, old: String, new: String },
    ReidDelete { date: String, time: String },
    ExportGallery { paths: Vec<String> },
    ExportDetect { label: Option<String>, paths: Vec<String> },
    ExportReid { date: String, time: String },
}

struct Cli {
    config_path: Option<PathBuf>,
    out: Option<PathBuf>,
    command: Command,
}

/// Writes archives to `--out`, or to the suggested name in the current
/// directory.
struct FixedDestination(Option<PathBuf>);

impl SavePrompt for FixedDestination {
    fn choose_destination(&self, _title: &str, suggested: &str) -> Option<PathBuf> {
        Some(self.0.clone().unwrap_or_else(|| PathBuf::from(suggested)))
    }
}

fn parse_args() -> Result<Cli> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config_path = None;
    let mut out = None;
    let mut date = None;
    let mut label = None;
    let mut conf = (0.0, 1.0);
    let mut positional = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("care {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                config_path = Some(PathBuf::from(value_of(&args, i, "--config")?));
                i += 1;
            }
            "--out" | "-o" => {
                out = Some(PathBuf::from(value_of(&args, i, "--out")?));
                i += 1;
            }
            "--date" => {
                date = Some(value_of(&args, i, "--date")?.to_string());
                i += 1;
            }
            "--label" => {
                label = Some(value_of(&args, i, "--label")?.to_string());
                i += 1;
            }
            "--conf" => {
                conf = (
                    confidence(value_of(&args, i, "--conf")?)?,
                    confidence(value_of(&args, i + 1, "--conf")?)?,
                );
                i += 2;
            }
            arg if arg.starts_with('-') && arg.len() > 1 => bail!("Unknown argument: {}", arg),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let Some((name, rest)) = positional.split_first() else {
        bail!("Missing command");
    };
    let arg = |n: usize| rest.get(n).cloned().unwrap_or_default();
    let required = |n: usize, what: &str| -> Result<String> {
        rest.get(n)
            .cloned()
            .with_context(|| format!("{} requires {}", name, what))
    };

    let command = match name.as_str() {
        "browse" => Command::Browse { date: arg(0), folder: arg(1) },
        "paths" => Command::Paths { folder: arg(0) },
        "upload" => Command::Upload {
            file: PathBuf::from(required(0, "a FILE")?),
            relative: rest.get(1).cloned(),
            date,
        },
        "detect" => Command::Detect { paths: rest.to_vec() },
        "reid" => Command::Reid { paths: rest.to_vec() },
        "detect-browse" => Command::DetectBrowse {
            date: arg(0),
            folder: arg(1),
            filter: DetectionFilter::new(label.clone().unwrap_or_default(), conf.0, conf.1),
        },
        "detect-paths" => Command::DetectPaths {
            folder: arg(0),
            filter: DetectionFilter::new(label.clone().unwrap_or_default(), conf.0, conf.1),
        },
        "reid-browse" => Command::ReidBrowse { date: arg(0), time: arg(1), group: arg(2) },
        "reid-rename" => Command::ReidRename {
            date: required(0, "DATE")?,
            time: required(1, "TIME")?,
            old: required(2, "OLD")?,
            new: required(3, "NEW")?,
        },
        "reid-delete" => Command::ReidDelete {
            date: required(0, "DATE")?,
            time: required(1, "TIME")?,
        },
        "export-gallery" => Command::ExportGallery { paths: rest.to_vec() },
        "export-detect" => Command::ExportDetect { label, paths: rest.to_vec() },
        "export-reid" => Command::ExportReid {
            date: required(0, "DATE")?,
            time: required(1, "TIME")?,
        },
        other => bail!("Unknown command: {}", other),
    };

    Ok(Cli {
        config_path,
        out,
        command,
    })
}

fn value_of<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .with_context(|| format!("{} requires a value", flag))
}

fn confidence(value: &str) -> Result<f64> {
    let parsed: f64 = value
        .parse()
        .with_context(|| format!("Invalid confidence: {}", value))?;
    if !(0.0..=1.0).contains(&parsed) {
        bail!("Confidence must be between 0 and 1: {}", value);
    }
    Ok(parsed)
}

fn print_help() {
    println!(
        r#"care - camera-trap image storage and AI job runner

USAGE:
    care [OPTIONS] <COMMAND> [ARGS...]

COMMANDS:
    browse [DATE [FOLDER]]          List uploaded images
    paths [FOLDER]                  Every uploaded file below FOLDER
    upload FILE [REL_PATH]          Upload a .jpg (--date YYYYMMDD, default today)
    detect PATH...                  Run detection on uploaded images
    reid PATH...                    Run re-identification on uploaded images
    detect-browse [DATE [FOLDER]]   List marked images (--label, --conf LO HI)
    detect-paths [FOLDER]           Every marked image below FOLDER matching the filter
    reid-browse [DATE [TIME [GROUP]]]
                                    List ReID results
    reid-rename DATE TIME OLD NEW   Rename a ReID group
    reid-delete DATE TIME           Delete a ReID result
    export-gallery PATH...          Zip uploaded images
    export-detect [PATH...]         Zip marked images (or all with --label LABEL)
    export-reid DATE TIME           Zip a ReID result, one folder per group

OPTIONS:
    --config, -c PATH   Path to config file
    --out, -o PATH      Archive destination for export commands
    --label LABEL       Detection label filter ("No Detection" for unmarked)
    --conf LO HI        Detection confidence range, default 0 1
    --version, -V       Show version
    --help, -h          Show this help message

ENVIRONMENT:
    CARE_CONFIG         Path to config file (overrides default location)
    CARE_LOG            Log filter (trace, debug, info, warn, error)
    PYTHON_SCRIPT_PATH  Run the AI from a Python script instead of the bundled binary
    VIRTUAL_ENV         Interpreter environment for PYTHON_SCRIPT_PATH
    DEVICE              cpu or gpu, selects the conda environment

Config file location: $XDG_CONFIG_HOME/care/config.toml"#
    );
}

/// Print a response as JSON. Returns whether it was a success.
fn emit<T: Serialize>(response: &Response<T>) -> Result<bool> {
    println!("{}", serde_json::to_string_pretty(response)?);
    Ok(response.ok)
}

/// Print job events on stderr while the job runs. The task ends once every
/// sender is gone.
fn spawn_event_printer() -> (mpsc::UnboundedSender<JobEvent>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                JobEvent::Progress(progress) => eprintln!(
                    "[{:>3}%] {}/{}",
                    progress.percent(),
                    progress.current,
                    progress.total
                ),
                JobEvent::Output { line, .. } => eprintln!("{}", line),
            }
        }
    });
    (tx, printer)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = match parse_args() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    let config = match &cli.config_path {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    if let Err(e) = logging::init(&StorageLayout::from_config(&config).logs()) {
        eprintln!("Warning: logging disabled: {}", e);
    }

    let service = CareService::new(config, Arc::new(FixedDestination(cli.out)));

    // Ctrl-C stops the running AI process; the job call then reports it.
    let jobs = service.jobs();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            jobs.terminate();
        }
    });

    let ok = match cli.command {
        Command::Browse { date, folder } => emit(&service.browse_image(&date, &folder).await)?,
        Command::Paths { folder } => emit(&service.get_image_paths(&folder).await)?,
        Command::Upload { file, relative, date } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let relative = match relative {
                Some(r) => r,
                None => file
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .context("FILE has no file name")?,
            };
            let response = match date {
                Some(date) => service.upload_image_on(&date, &relative, &bytes).await,
                None => service.upload_image(&relative, &bytes).await,
            };
            emit(&response)?
        }
        Command::Detect { paths } => {
            let (events, printer) = spawn_event_printer();
            let response = service.detect(&paths, events).await;
            let _ = printer.await;
            emit(&response)?
        }
        Command::Reid { paths } => {
            let (events, printer) = spawn_event_printer();
            let response = service.run_reid(&paths, events).await;
            let _ = printer.await;
            emit(&response)?
        }
        Command::DetectBrowse { date, folder, filter } => {
            emit(&service.browse_detect_image(&date, &folder, &filter).await)?
        }
        Command::DetectPaths { folder, filter } => {
            emit(&service.get_detect_image_paths(&folder, &filter).await)?
        }
        Command::ReidBrowse { date, time, group } => {
            emit(&service.browse_reid_image(&date, &time, &group).await)?
        }
        Command::ReidRename { date, time, old, new } => {
            emit(&service.rename_reid_group(&date, &time, &old, &new).await)?
        }
        Command::ReidDelete { date, time } => {
            emit(&service.delete_reid_result(&date, &time).await)?
        }
        Command::ExportGallery { paths } => {
            emit(&service.download_selected_gallery_images(&paths).await)?
        }
        Command::ExportDetect { label: Some(label), .. } => {
            emit(&service.download_detect_images(&label).await)?
        }
        Command::ExportDetect { label: None, paths } => {
            emit(&service.download_selected_detect_images(&paths).await)?
        }
        Command::ExportReid { date, time } => {
            emit(&service.download_reid_images(&date, &time).await)?
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
