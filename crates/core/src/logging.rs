//! Log filter selection, the rolling log file, and crash reports.
//!
//! The subscriber itself is assembled by the binary. This module decides
//! which filters apply to the console and file layers, opens the file
//! appender, and installs a panic hook that leaves a report under
//! `<data_dir>/logs/crash`.

use std::any::Any;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fs;
use std::io::{self, Write};
use std::panic::{self, PanicHookInfo};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
pub const DEFAULT_LOG_RETENTION_DAYS: usize = 14;
pub const DEFAULT_LOG_DIR_NAME: &str = "logs";
pub const DEFAULT_CRASH_DIR_NAME: &str = "crash";
const LOG_FILE_PREFIX: &str = "vidsr";
const LOG_FILE_SUFFIX: &str = "log";

/// Targets that flood the output at the default level:
/// `(target, console level, file level)`.
const NOISY_TARGETS: [(&str, &str, &str); 3] = [
    ("ort", "error", "error"),
    ("ffmpeg_stderr", "error", "debug"),
    ("ffmpeg_encode_stderr", "error", "debug"),
];

static CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static CRASH_HOOK_LOCK: Mutex<()> = Mutex::new(());
static WRITING_CRASH_REPORT: AtomicBool = AtomicBool::new(false);
static CRASH_REPORT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Inputs to filter selection and file sink setup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub data_dir: Option<PathBuf>,
    /// Count of `-v` flags.
    pub verbose: u8,
    /// `--log-filter`.
    pub cli_filter: Option<String>,
    /// `RUST_LOG`.
    pub env_filter: Option<String>,
    pub retention_days: usize,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            verbose: 0,
            cli_filter: None,
            env_filter: None,
            retention_days: DEFAULT_LOG_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilters {
    pub console: String,
    pub file: String,
}

impl LogSettings {
    /// `--log-filter` wins, then `-v`/`-vv`, then `RUST_LOG`, then `info`.
    fn base_filter(&self) -> String {
        if let Some(filter) = &self.cli_filter {
            return filter.clone();
        }
        match self.verbose {
            0 => self
                .env_filter
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    }

    /// The noisy-target directives are only prepended when nothing was
    /// requested on the command line.
    pub fn filters(&self) -> LogFilters {
        let base = self.base_filter();
        if self.cli_filter.is_some() || self.verbose > 0 {
            return LogFilters {
                console: base.clone(),
                file: base,
            };
        }

        LogFilters {
            console: with_noise_directives(&base, false),
            file: with_noise_directives(&base, true),
        }
    }
}

fn with_noise_directives(base: &str, for_file: bool) -> String {
    let mut directives: Vec<String> = NOISY_TARGETS
        .iter()
        .map(|(target, console, file)| {
            format!("{target}={}", if for_file { file } else { console })
        })
        .collect();
    directives.push(base.to_string());
    directives.join(",")
}

#[derive(Debug)]
pub enum LogFileSink {
    Rolling {
        dir: PathBuf,
        appender: RollingFileAppender,
    },
    /// No file output; the caller logs `reason` once the console is up.
    ConsoleOnly {
        dir: Option<PathBuf>,
        reason: String,
    },
}

impl LogFileSink {
    pub fn dir(&self) -> Option<&Path> {
        match self {
            Self::Rolling { dir, .. } => Some(dir),
            Self::ConsoleOnly { dir, .. } => dir.as_deref(),
        }
    }
}

/// Daily `vidsr.<date>.log` under `<data_dir>/logs`, keeping
/// `retention_days` files.
pub fn open_log_file(settings: &LogSettings) -> LogFileSink {
    let Some(data_dir) = settings.data_dir.as_deref() else {
        return LogFileSink::ConsoleOnly {
            dir: None,
            reason: "no data directory".to_string(),
        };
    };

    let dir = data_dir.join(DEFAULT_LOG_DIR_NAME);
    if let Err(e) = fs::create_dir_all(&dir) {
        return LogFileSink::ConsoleOnly {
            dir: Some(dir),
            reason: format!("cannot create log directory: {e}"),
        };
    }

    let retention = match settings.retention_days {
        0 => DEFAULT_LOG_RETENTION_DAYS,
        n => n,
    };
    let built = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(&dir);

    match built {
        Ok(appender) => LogFileSink::Rolling { dir, appender },
        Err(e) => LogFileSink::ConsoleOnly {
            dir: Some(dir),
            reason: format!("cannot open rolling log file: {e}"),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashHook {
    Installed(PathBuf),
    AlreadyInstalled(PathBuf),
    Unavailable {
        crash_dir: Option<PathBuf>,
        reason: String,
    },
}

/// Chain a hook in front of the current panic hook that writes one report
/// per panic to `<data_dir>/logs/crash`. Idempotent for the process.
pub fn install_panic_hook(data_dir: Option<&Path>) -> CrashHook {
    if let Some(dir) = CRASH_DIR.get() {
        return CrashHook::AlreadyInstalled(dir.clone());
    }
    let Some(data_dir) = data_dir else {
        return CrashHook::Unavailable {
            crash_dir: None,
            reason: "no data directory".to_string(),
        };
    };

    let crash_dir = data_dir.join(DEFAULT_LOG_DIR_NAME).join(DEFAULT_CRASH_DIR_NAME);
    if let Err(e) = fs::create_dir_all(&crash_dir) {
        return CrashHook::Unavailable {
            crash_dir: Some(crash_dir),
            reason: format!("cannot create crash directory: {e}"),
        };
    }

    let _guard = CRASH_HOOK_LOCK.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(dir) = CRASH_DIR.get() {
        return CrashHook::AlreadyInstalled(dir.clone());
    }

    let previous = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_panic(&hook_dir, info);
        previous(info);
    }));
    let _ = CRASH_DIR.set(crash_dir.clone());

    CrashHook::Installed(crash_dir)
}

fn record_panic(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while writing the report must not re-enter here.
    if WRITING_CRASH_REPORT.swap(true, Ordering::AcqRel) {
        return;
    }

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_to(crash_dir)
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => eprintln!(
            "Warning: failed to write panic crash artifact under '{}': {e}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: crash report writer panicked under '{}'",
            crash_dir.display()
        ),
    }

    WRITING_CRASH_REPORT.store(false, Ordering::Release);
}

#[derive(Debug)]
struct CrashReport {
    at: DateTime<Utc>,
    thread: String,
    location: String,
    payload: String,
    backtrace: Backtrace,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        Self {
            at: Utc::now(),
            thread: std::thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: payload_text(info.payload()),
            backtrace: Backtrace::capture(),
        }
    }

    fn render(&self, out: &mut impl Write) -> io::Result<()> {
        let (policy, trace) = match self.backtrace.status() {
            BacktraceStatus::Captured => ("captured", self.backtrace.to_string()),
            BacktraceStatus::Disabled => (
                "disabled (set RUST_BACKTRACE=1 to enable)",
                "<disabled>".to_string(),
            ),
            BacktraceStatus::Unsupported => ("unsupported", "<unsupported>".to_string()),
            _ => ("unknown", "<unknown>".to_string()),
        };

        writeln!(out, "timestamp_utc={}", self.at.to_rfc3339())?;
        writeln!(out, "thread={}", self.thread)?;
        writeln!(out, "location={}", self.location)?;
        writeln!(out, "payload={}", self.payload)?;
        writeln!(out, "backtrace_policy={policy}")?;
        writeln!(out, "backtrace:")?;
        writeln!(out, "{trace}")
    }

    fn write_to(&self, crash_dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;
        let seq = CRASH_REPORT_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(format!(
            "panic-{}-{seq:06}.log",
            self.at.format("%Y%m%d-%H%M%S-%f")
        ));

        let mut file = fs::File::create(&path)?;
        self.render(&mut file)?;
        file.flush()?;
        Ok(path)
    }
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}
