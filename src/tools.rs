// External tool resolver and runner for ffprobe/ffmpeg/fpcalc
//
// Resolution order:
// 1) Environment variable override (VIDSIFT_FFPROBE_PATH, etc.)
// 2) Sidecar next to the executable (or its bin/ subdirectory)
// 3) PATH fallback
//
// Every invocation goes through run_tool_streaming so that cancellation and
// deadlines kill the child process instead of abandoning it.

use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::constants::TOOL_POLL_INTERVAL_MS;
use crate::error::{Result, SiftError};
use crate::jobs::JobContext;

/// Get the directory containing the current executable
fn exe_dir() -> Option<PathBuf> {
    env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.to_path_buf()))
}

/// Resolve a tool path.
fn resolve_tool(env_key: &str, default_name: &str) -> PathBuf {
    if let Ok(v) = env::var(env_key) {
        let p = PathBuf::from(&v);
        if p.exists() {
            return p;
        }
    }

    let mut filename = default_name.to_string();
    if cfg!(windows) && !filename.to_lowercase().ends_with(".exe") {
        filename.push_str(".exe");
    }

    if let Some(dir) = exe_dir() {
        let candidate = dir.join(&filename);
        if candidate.exists() {
            return candidate;
        }
        let bin_candidate = dir.join("bin").join(&filename);
        if bin_candidate.exists() {
            return bin_candidate;
        }
    }

    PathBuf::from(default_name)
}

/// Get path to ffprobe binary
pub fn ffprobe_path() -> PathBuf {
    resolve_tool("VIDSIFT_FFPROBE_PATH", "ffprobe")
}

/// Get path to ffmpeg binary
pub fn ffmpeg_path() -> PathBuf {
    resolve_tool("VIDSIFT_FFMPEG_PATH", "ffmpeg")
}

/// Get path to fpcalc (Chromaprint) binary
pub fn fpcalc_path() -> PathBuf {
    resolve_tool("VIDSIFT_FPCALC_PATH", "fpcalc")
}

/// Check if a tool is available at the resolved path
pub fn is_tool_available(tool: &str) -> bool {
    match tool {
        "ffprobe" => tool_responds(&ffprobe_path()),
        "ffmpeg" => tool_responds(&ffmpeg_path()),
        "fpcalc" => tool_responds(&fpcalc_path()),
        _ => false,
    }
}

fn tool_responds(path: &Path) -> bool {
    if path.exists() {
        return true;
    }

    Command::new(path)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// External tools that cannot be found right now.
pub fn missing_tools() -> Vec<&'static str> {
    ["ffprobe", "ffmpeg", "fpcalc"]
        .into_iter()
        .filter(|tool| !is_tool_available(tool))
        .collect()
}

/// Captured result of a finished tool invocation.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ToolOutput {
    /// Last few lines of stderr, for error messages.
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self.stderr.lines().collect();
        let start = lines.len().saturating_sub(5);
        lines[start..].join(" | ")
    }
}

/// Run a tool to completion, collecting stdout.
pub fn run_tool(cmd: Command, tool: &str, ctx: &JobContext) -> Result<ToolOutput> {
    let mut stdout = Vec::new();
    let (status, stderr) = run_tool_streaming(cmd, tool, ctx, |chunk| {
        stdout.extend_from_slice(chunk);
        Ok(())
    })?;
    Ok(ToolOutput { status, stdout, stderr })
}

/// Run a tool, handing stdout to `on_stdout` as it arrives.
///
/// The child is killed when the job is cancelled, when the deadline passes,
/// or when `on_stdout` returns an error. Cancellation is observed within one
/// poll interval.
pub fn run_tool_streaming<F>(
    mut cmd: Command,
    tool: &str,
    ctx: &JobContext,
    mut on_stdout: F,
) -> Result<(ExitStatus, String)>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    ctx.check()?;

    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SiftError::ToolNotFound(tool.to_string())
        } else {
            SiftError::Io(e)
        }
    })?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    let stdout_reader = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = [0u8; 64 * 1024];
            loop {
                match out.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        })
    });
    let stderr_reader = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut s = String::new();
            let _ = err.read_to_string(&mut s);
            s
        })
    });

    let poll = Duration::from_millis(TOOL_POLL_INTERVAL_MS);
    let mut failure: Option<SiftError> = None;
    let mut stdout_open = stdout_reader.is_some();

    loop {
        if let Err(e) = ctx.check() {
            failure = Some(e);
            break;
        }

        if stdout_open {
            match rx.recv_timeout(poll) {
                Ok(chunk) => {
                    if let Err(e) = on_stdout(&chunk) {
                        failure = Some(e);
                        break;
                    }
                    continue;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => stdout_open = false,
            }
        }

        match child.try_wait()? {
            Some(_) => break,
            None => thread::sleep(poll),
        }
    }

    if let Some(err) = failure {
        let _ = child.kill();
        let _ = child.wait();
        log::debug!("{} killed: {}", tool, err);
        return Err(err);
    }

    let status = child.wait()?;
    if let Some(handle) = stdout_reader {
        let _ = handle.join();
    }
    // Drain anything the reader pushed after the last recv
    for chunk in rx.try_iter() {
        on_stdout(&chunk)?;
    }
    let stderr = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    Ok((status, stderr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::CancelToken;
    use std::time::Instant;

    #[test]
    fn test_resolve_tool_fallback() {
        let path = resolve_tool("VIDSIFT_TEST_NONEXISTENT", "testcmd");
        assert_eq!(path, PathBuf::from("testcmd"));
    }

    #[test]
    fn test_env_override() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();

        std::env::set_var("VIDSIFT_TEST_TOOL", temp_file.path());
        let path = resolve_tool("VIDSIFT_TEST_TOOL", "default");
        assert_eq!(path, temp_file.path());

        std::env::remove_var("VIDSIFT_TEST_TOOL");
    }

    #[test]
    fn test_missing_binary_is_tool_not_found() {
        let ctx = JobContext::new(CancelToken::new(), 5);
        let cmd = Command::new("vidsift-definitely-not-a-real-binary");
        let err = run_tool(cmd, "fake", &ctx).unwrap_err();
        assert!(matches!(err, SiftError::ToolNotFound(_)));
    }

    #[test]
    fn test_cancelled_before_spawn() {
        let token = CancelToken::new();
        token.cancel();
        let ctx = JobContext::new(token, 5);
        let cmd = Command::new("vidsift-definitely-not-a-real-binary");
        let err = run_tool(cmd, "fake", &ctx).unwrap_err();
        assert!(matches!(err, SiftError::Cancelled(_)));
    }

    #[test]
    fn test_tool_availability() {
        let temp_file = tempfile::NamedTempFile::new().unwrap();
        assert!(tool_responds(temp_file.path()));
        assert!(!tool_responds(Path::new("vidsift-definitely-not-a-real-binary")));
        assert!(!is_tool_available("not-a-tool"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_cancel_kills_running_child() {
        let token = CancelToken::new();
        let ctx = JobContext::new(token.clone(), 30);
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo $$; exec sleep 5"]);

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            token.cancel();
            Instant::now()
        });

        let mut stdout = Vec::new();
        let err = run_tool_streaming(cmd, "sleep", &ctx, |chunk| {
            stdout.extend_from_slice(chunk);
            Ok(())
        })
        .unwrap_err();
        let returned = Instant::now();
        let cancelled_at = canceller.join().unwrap();

        assert!(matches!(err, SiftError::Cancelled(_)));
        let poll = Duration::from_millis(TOOL_POLL_INTERVAL_MS);
        assert!(returned.duration_since(cancelled_at) < poll * 2 + Duration::from_millis(200));

        // The child was killed and reaped
        let pid = String::from_utf8_lossy(&stdout).trim().to_string();
        assert!(!pid.is_empty());
        assert!(!Path::new(&format!("/proc/{}", pid)).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_child() {
        let ctx = JobContext::new(CancelToken::new(), 1);
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let started = Instant::now();
        let err = run_tool(cmd, "sleep", &ctx).unwrap_err();
        assert!(matches!(err, SiftError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
