//! Locating native runtime pieces: the ONNX Runtime shared library (loaded
//! dynamically by `ort`), its CUDA/cuDNN/TensorRT dependencies, and the
//! `ffmpeg`/`ffprobe` binaries.

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::io::{BufRead, BufReader};
use std::process::{ChildStderr, Command as ProcessCommand};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

#[cfg(unix)]
const ORT_LIB_NAME: &str = "libonnxruntime.so";
#[cfg(windows)]
const ORT_LIB_NAME: &str = "onnxruntime.dll";

const ORT_DYLIB_ENV: &str = "ORT_DYLIB_PATH";

/// Probed in order: `<exe_dir>/` (Windows), `<exe_dir>/lib`,
/// `<exe_dir>/../lib`, `<cwd>/lib`, then `/usr/local/lib` and `/usr/lib` on Unix.
fn candidate_lib_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            #[cfg(windows)]
            {
                dirs.push(exe_dir.to_path_buf());
            }
            dirs.push(exe_dir.join("lib"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("lib"));
            }
        }
    }
    if let Ok(cwd) = env::current_dir() {
        let cwd_lib = cwd.join("lib");
        if !dirs.contains(&cwd_lib) {
            dirs.push(cwd_lib);
        }
    }
    #[cfg(unix)]
    {
        dirs.push(PathBuf::from("/usr/local/lib"));
        dirs.push(PathBuf::from("/usr/lib"));
    }
    dirs
}

fn candidate_bin_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = env::current_exe().and_then(|p| p.canonicalize()) {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.to_path_buf());
            dirs.push(exe_dir.join("bin"));
            if let Some(parent) = exe_dir.parent() {
                dirs.push(parent.join("bin"));
            }
        }
    }

    if let Ok(cwd) = env::current_dir() {
        let cwd_bin = cwd.join("bin");
        if !dirs.contains(&cwd_bin) {
            dirs.push(cwd_bin);
        }
    }

    dirs
}

fn binary_file_name(binary: &str) -> String {
    if cfg!(windows) && !binary.to_ascii_lowercase().ends_with(".exe") {
        format!("{binary}.exe")
    } else {
        binary.to_string()
    }
}

fn find_binary_in_dirs(binary: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    let name = binary_file_name(binary);
    dirs.iter()
        .map(|dir| dir.join(&name))
        .find(|candidate| candidate.is_file())
}

/// `Command` for a bundled tool, falling back to a `PATH` lookup.
pub fn command_for(binary: &str) -> ProcessCommand {
    match find_binary_in_dirs(binary, &candidate_bin_dirs()) {
        Some(path) => ProcessCommand::new(path),
        None => ProcessCommand::new(binary),
    }
}

/// Which ffmpeg child a stderr stream belongs to. Each role logs under its
/// own target (`ffmpeg_stderr`, `ffmpeg_encode_stderr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfmpegRole {
    Decode,
    Encode,
}

/// Drain a child's stderr into `debug!` lines until the pipe closes. The
/// pipe must be drained or ffmpeg blocks once the OS buffer fills.
pub fn spawn_stderr_logger(stderr: ChildStderr, role: FfmpegRole) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            let line = match line {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => line,
                Err(e) => {
                    debug!(?role, error = %e, "stopped reading ffmpeg stderr");
                    break;
                }
            };
            match role {
                FfmpegRole::Decode => debug!(target: "ffmpeg_stderr", "{line}"),
                FfmpegRole::Encode => debug!(target: "ffmpeg_encode_stderr", "{line}"),
            }
        }
    })
}

fn find_ort_dylib_in_dirs(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.join(ORT_LIB_NAME))
        .find(|candidate| candidate.is_file())
}

/// Preload tier for GPU runtime libs, `None` for anything not preloaded.
/// ORT provider libs are skipped: they need symbols from `libonnxruntime`,
/// which `ort` loads itself later.
///
///   0: CUDA runtime (cudart, cublas, cublasLt, cufft, curand)
///   1: cuDNN
///   2: TensorRT (nvinfer, nvonnxparser)
fn load_priority(name: &str) -> Option<u8> {
    let name = name.to_ascii_lowercase();
    let name = name.strip_prefix("lib").unwrap_or(&name);
    if ["cudart", "cublas", "cufft", "curand"]
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        Some(0)
    } else if name.starts_with("cudnn") {
        Some(1)
    } else if name.starts_with("nvinfer") || name.starts_with("nvonnxparser") {
        Some(2)
    } else {
        None
    }
}

#[cfg(unix)]
fn is_candidate_lib(name: &str, path: &Path) -> bool {
    name.contains(".so") && !path.is_symlink()
}

#[cfg(windows)]
fn is_candidate_lib(_name: &str, path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("dll"))
}

/// GPU libs found in `dirs`, in load order. The first directory holding a
/// given file name wins.
fn collect_preload_libs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut seen_names: HashSet<String> = HashSet::new();
    let mut libs: Vec<(u8, String, PathBuf)> = Vec::new();

    for dir in dirs {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string();

            if !is_candidate_lib(&name, &path) || !seen_names.insert(name.clone()) {
                continue;
            }
            if let Some(priority) = load_priority(&name) {
                libs.push((priority, name, path));
            }
        }
    }

    libs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    libs.into_iter().map(|(_, _, path)| path).collect()
}

/// glibc caches `LD_LIBRARY_PATH` at startup, so libraries are opened by
/// absolute path with `RTLD_GLOBAL` instead.
#[cfg(unix)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::os::unix::Library::open(Some(path), libc::RTLD_LAZY | libc::RTLD_GLOBAL) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

#[cfg(windows)]
unsafe fn load_library(path: &Path) -> bool {
    match libloading::Library::new(path) {
        Ok(lib) => {
            std::mem::forget(lib);
            true
        }
        Err(_) => false,
    }
}

/// What [`setup_runtime_libs`] found. Logged once tracing is up.
#[derive(Debug, Clone, Default)]
pub struct RuntimeLibStatus {
    pub ort_dylib: Option<PathBuf>,
    pub ort_dylib_from_env: bool,
    pub preloaded: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

/// Configure runtime library paths before ORT initialization.
///
/// Call at the very start of `main()`, before any ORT or tracing init.
pub fn setup_runtime_libs() -> RuntimeLibStatus {
    let dirs = candidate_lib_dirs();
    let mut status = RuntimeLibStatus::default();

    match env::var_os(ORT_DYLIB_ENV) {
        Some(existing) => {
            status.ort_dylib = Some(PathBuf::from(existing));
            status.ort_dylib_from_env = true;
        }
        None => {
            if let Some(path) = find_ort_dylib_in_dirs(&dirs) {
                env::set_var(ORT_DYLIB_ENV, &path);
                status.ort_dylib = Some(path);
            }
        }
    }

    for lib in collect_preload_libs(&dirs) {
        if unsafe { load_library(&lib) } {
            status.preloaded.push(lib);
        } else {
            status.failed.push(lib);
        }
    }

    status
}

pub fn log_runtime_lib_status(status: &RuntimeLibStatus) {
    match status.ort_dylib.as_deref() {
        Some(path) if path.is_file() => info!(
            path = %path.display(),
            from_env = status.ort_dylib_from_env,
            "ORT library"
        ),
        Some(path) => warn!(path = %path.display(), "ORT_DYLIB_PATH set but file not found"),
        None => warn!("ORT_DYLIB_PATH not set; ORT will try default search paths"),
    }

    for lib in &status.preloaded {
        debug!(lib = %lib.display(), "Preloaded GPU runtime library");
    }
    for lib in &status.failed {
        warn!(lib = %lib.display(), "Failed to preload GPU runtime library");
    }

    for tool in ["ffmpeg", "ffprobe"] {
        match find_binary_in_dirs(tool, &candidate_bin_dirs()) {
            Some(path) => debug!(tool, path = %path.display(), "Using bundled binary"),
            None => debug!(tool, "Using binary from PATH"),
        }
    }
}
