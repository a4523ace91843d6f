use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use vidsr_core::backend::InferenceDevice;
use vidsr_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use vidsr_core::logging::{self, CrashHook, LogFileSink, LogSettings, DEFAULT_LOG_FILTER};
use vidsr_core::pipeline::{discover_inputs, BatchSummary, FfmpegVideoIo, Upscaler, VideoStatus};
use vidsr_core::{OnnxSuperResModel, PipelineError};

#[derive(Parser, Debug)]
#[command(
    name = "vidsr",
    version,
    about = "Upscale every video in a directory with an ESRGAN-style ONNX model"
)]
struct Cli {
    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, help = "Data directory holding config.toml and logs")]
    data_dir: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Config file (default: <data-dir>/config.toml)")]
    config: Option<PathBuf>,

    #[arg(short = 'i', long, help = "Directory to read input videos from")]
    input_dir: Option<PathBuf>,

    #[arg(long, help = "Glob matched against file names in the input directory")]
    pattern: Option<String>,

    #[arg(short = 'o', long, help = "Directory to write upscaled videos to")]
    output_dir: Option<PathBuf>,

    #[arg(short = 'm', long, help = "Path to the ONNX super-resolution model")]
    model: Option<PathBuf>,

    #[arg(long, help = "Inference device: cpu, cuda or tensorrt")]
    device: Option<String>,

    #[arg(long, help = "Process at most this many frames per video")]
    max_frames: Option<u64>,
}

/// How a run ended when no fatal error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// At least one input was skipped, aborted or truncated.
    PartialFailure,
}

impl RunOutcome {
    pub fn exit_code(self) -> ExitCode {
        match self {
            Self::Success => ExitCode::SUCCESS,
            Self::PartialFailure => ExitCode::from(2),
        }
    }
}

pub fn run_from_env() -> Result<RunOutcome> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_status = vidsr_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    vidsr_core::runtime::log_runtime_lib_status(&runtime_status);

    let cfg_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config_path(&resolved_data_dir));
    log_startup_metadata(&resolved_data_dir, &cfg_path);

    if cli.config.is_none() {
        if let Err(e) = initialize_data_dir(&resolved_data_dir) {
            warn!(error = %format!("{e:#}"), "Failed to initialize data directory");
        }
    }

    let mut config = AppConfig::load_from_path(&cfg_path).map_err(PipelineError::Config)?;
    apply_cli_overrides(&mut config, &cli);
    config.validate().map_err(PipelineError::Config)?;

    run_batch(&config, &resolved_data_dir)
}

fn apply_cli_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(dir) = &cli.input_dir {
        config.paths.input_dir = dir.clone();
    }
    if let Some(pattern) = &cli.pattern {
        config.input.pattern = pattern.clone();
    }
    if let Some(dir) = &cli.output_dir {
        config.paths.output_dir = dir.clone();
    }
    if let Some(model) = &cli.model {
        config.paths.model_path = model.clone();
    }
    if let Some(device) = &cli.device {
        config.inference.device = InferenceDevice::from_str_lossy(device);
    }
    if cli.max_frames.is_some() {
        config.max_frames = cli.max_frames;
    }
}

fn run_batch(config: &AppConfig, data_dir: &Path) -> Result<RunOutcome> {
    let model = OnnxSuperResModel::load(&config.model_config(data_dir))?;

    let inputs = discover_inputs(&config.paths.input_dir, &config.input.pattern)?;
    if inputs.is_empty() {
        warn!(
            input_dir = %config.paths.input_dir.display(),
            pattern = %config.input.pattern,
            "No input videos found"
        );
        return Ok(RunOutcome::Success);
    }
    info!(count = inputs.len(), "Discovered input videos");

    std::fs::create_dir_all(&config.paths.output_dir).with_context(|| {
        format!(
            "failed to create output directory {}",
            config.paths.output_dir.display()
        )
    })?;

    let mut upscaler =
        Upscaler::new(model, config.pipeline_options()).with_progress(make_progress_callback());

    let batch_started = Instant::now();
    let summary = upscaler.run_batch(&FfmpegVideoIo, &inputs, &config.paths.output_dir);
    eprintln!();
    print_summary(&summary, batch_started.elapsed().as_secs_f64());

    Ok(outcome_for(&summary))
}

fn outcome_for(summary: &BatchSummary) -> RunOutcome {
    if summary.has_failures() {
        RunOutcome::PartialFailure
    } else {
        RunOutcome::Success
    }
}

fn print_summary(summary: &BatchSummary, elapsed: f64) {
    for report in &summary.reports {
        match &report.status {
            VideoStatus::Completed => info!(
                output = %report.output.display(),
                frames = report.frames,
                size = %format!("{}x{}", report.width, report.height),
                "Wrote"
            ),
            VideoStatus::Truncated(err) => warn!(
                output = %report.output.display(),
                frames = report.frames,
                error = %err,
                "Wrote truncated output"
            ),
        }
    }
    for (input, err) in &summary.failures {
        error!(input = %input.display(), kind = err.kind(), error = %err, "Failed");
    }
    eprintln!(
        "Done: {} completed, {} truncated, {} failed, {} frames in {}",
        summary.completed(),
        summary.truncated(),
        summary.failed(),
        summary.total_frames(),
        format_duration(elapsed)
    );
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let crash_hook = logging::install_panic_hook(data_dir);

    let settings = LogSettings {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_filter: cli_log_filter.map(ToString::to_string),
        env_filter: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = settings.filters();
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    let file_fallback = match logging::open_log_file(&settings) {
        LogFileSink::Rolling { appender, .. } => {
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(appender)
                .with_filter(parse_env_filter_with_fallback(&filters.file, "file"));
            let subscriber = tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
            }
            None
        }
        LogFileSink::ConsoleOnly { dir, reason } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!("Failed to initialize tracing subscriber: {error}");
            }
            Some((dir, reason))
        }
    };

    if let Some((dir, reason)) = file_fallback {
        warn!(
            log_dir = ?dir,
            reason = %reason,
            "File logging unavailable; logging to console only"
        );
    }
    if let CrashHook::Unavailable { crash_dir, reason } = crash_hook {
        warn!(
            crash_dir = ?crash_dir,
            reason = %reason,
            "Crash reports will not be written"
        );
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(data_dir: &Path, cfg_path: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %cfg_path.display(),
        "Runtime startup metadata"
    );
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;
const FPS_WARMUP_FRAMES: u64 = 2;

fn progress_line(done: u64, total: Option<u64>, total_elapsed: f64, fps_elapsed: f64) -> String {
    let fps = compute_fps(done, fps_elapsed);

    match total {
        Some(total) if total > 0 => {
            let fraction = (done as f64 / total as f64).clamp(0.0, 1.0);
            let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
            let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
            let bar: String = "█".repeat(filled) + &"░".repeat(empty);

            let eta = if fps > 0.0 {
                let remaining = total.saturating_sub(done) as f64;
                format!(" | ETA: {}", format_duration(remaining / fps))
            } else {
                String::new()
            };

            format!(
                "[{}] {:5.1}% | Frame {}/{} | {:.1} fps | Elapsed: {}{}",
                bar,
                fraction * 100.0,
                done,
                total,
                fps,
                format_duration(total_elapsed),
                eta,
            )
        }
        _ => format!(
            "Frame {} | {:.1} fps | Elapsed: {}",
            done,
            fps,
            format_duration(total_elapsed),
        ),
    }
}

/// Frames per second, ignoring the first frames which include model warmup.
fn compute_fps(done: u64, elapsed: f64) -> f64 {
    if elapsed <= 0.0 || done <= FPS_WARMUP_FRAMES {
        return 0.0;
    }

    (done - FPS_WARMUP_FRAMES) as f64 / elapsed
}

fn make_progress_callback() -> Box<dyn FnMut(u64, Option<u64>) + Send> {
    let mut video_start = Instant::now();
    let mut fps_start: Option<Instant> = None;
    let mut videos_seen = 0u64;

    Box::new(move |done, total| {
        if done == 0 {
            if videos_seen > 0 {
                eprintln!();
            }
            videos_seen += 1;
            video_start = Instant::now();
            fps_start = None;
        }
        if fps_start.is_none() && done >= FPS_WARMUP_FRAMES {
            fps_start = Some(Instant::now());
        }
        // fps clock starts at the warmup boundary, so count frames after it.
        let fps_elapsed = fps_start
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let line = progress_line(done, total, video_start.elapsed().as_secs_f64(), fps_elapsed);
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "\r{line}    ");
        let _ = stderr.flush();
    })
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    #[test]
    fn parses_all_overrides() {
        let cli = Cli::try_parse_from([
            "vidsr",
            "-vv",
            "--data-dir",
            "/data",
            "-i",
            "in",
            "--pattern",
            "*.mp4",
            "-o",
            "out",
            "-m",
            "m.onnx",
            "--device",
            "trt",
            "--max-frames",
            "12",
        ])
        .expect("parse cli");
        assert_eq!(cli.verbose, 2);

        let mut config = AppConfig::default();
        apply_cli_overrides(&mut config, &cli);
        assert_eq!(config.paths.input_dir, PathBuf::from("in"));
        assert_eq!(config.input.pattern, "*.mp4");
        assert_eq!(config.paths.output_dir, PathBuf::from("out"));
        assert_eq!(config.paths.model_path, PathBuf::from("m.onnx"));
        assert_eq!(config.inference.device, InferenceDevice::Tensorrt);
        assert_eq!(config.max_frames, Some(12));
    }

    #[test]
    fn no_flags_keep_config_values() {
        let cli = Cli::try_parse_from(["vidsr"]).expect("parse cli");
        let mut config = AppConfig::default();
        config.max_frames = Some(3);
        apply_cli_overrides(&mut config, &cli);
        assert_eq!(config.max_frames, Some(3));
        assert_eq!(config, {
            let mut expected = AppConfig::default();
            expected.max_frames = Some(3);
            expected
        });
    }

    #[test]
    fn missing_model_is_fatal_even_without_inputs() {
        let root = tempfile::tempdir().expect("tempdir");
        let input_dir = root.path().join("in");
        std::fs::create_dir_all(&input_dir).expect("create input dir");

        let mut config = AppConfig::default();
        config.paths.input_dir = input_dir;
        config.paths.output_dir = root.path().join("out");
        config.paths.model_path = root.path().join("no_such_model.onnx");
        config.inference.device = InferenceDevice::Cpu;

        let err = run_batch(&config, root.path()).expect_err("missing model must fail");
        let pipeline_err = err
            .downcast_ref::<PipelineError>()
            .expect("typed pipeline error");
        assert_eq!(pipeline_err.kind(), "model_load");
        assert!(pipeline_err.is_fatal());
        assert!(!root.path().join("out").exists());
    }

    #[test]
    fn rejects_non_numeric_max_frames() {
        assert!(Cli::try_parse_from(["vidsr", "--max-frames", "many"]).is_err());
    }

    #[test]
    fn empty_summary_is_success() {
        assert_eq!(outcome_for(&BatchSummary::default()), RunOutcome::Success);
    }

    #[test]
    fn failed_input_maps_to_partial_failure() {
        let mut summary = BatchSummary::default();
        summary.failures.push((
            PathBuf::from("bad.mp4"),
            PipelineError::Open {
                path: PathBuf::from("bad.mp4"),
                source: anyhow::anyhow!("no video stream found"),
            },
        ));
        assert_eq!(outcome_for(&summary), RunOutcome::PartialFailure);
        assert_eq!(
            RunOutcome::PartialFailure.exit_code(),
            ExitCode::from(2)
        );
    }
}


#[cfg(test)]
mod log_filter_tests {
    use super::*;

    #[test]
    fn invalid_filter_falls_back_to_default() {
        let filter = parse_env_filter_with_fallback("vidsr_core=loud", "console");
        assert_eq!(filter.to_string(), DEFAULT_LOG_FILTER);
    }

    #[test]
    fn valid_filter_is_kept() {
        let filter = parse_env_filter_with_fallback("vidsr_core=debug", "console");
        assert_eq!(filter.to_string(), "vidsr_core=debug");
    }
}
