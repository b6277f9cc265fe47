//! Child process execution for search engines, with a timeout and bounded output.

use std::env;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout as lossy UTF-8 lines.
    pub fn stdout_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.stdout)
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Run a command with a timeout, draining stdout/stderr on reader threads.
///
/// At most `output_limit_bytes` of each stream is kept; the rest is read and
/// discarded so the child never blocks on a full pipe. A timed-out child is
/// killed and reported through `timed_out`, not as an error.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_ms = timeout.as_millis() as u64))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, "failed to spawn command");
            return Err(err).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "command timed out, killing");
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, _) = join_output(stderr_handle).context("join stderr")?;
    if stdout_truncated > 0 {
        warn!(stdout_truncated, "search output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        timed_out,
    })
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        let keep = n.min(remaining);
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

/// First executable named `program` on `PATH`.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file() || path.with_extension("exe").is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn captures_stdout_and_truncates_beyond_limit() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf 'abcdef'");
        let out = run_command_with_timeout(cmd, Duration::from_secs(5), 4).expect("run");
        assert!(out.status.success());
        assert_eq!(out.stdout, b"abcd");
        assert_eq!(out.stdout_truncated, 2);
        assert!(!out.timed_out);
    }

    #[test]
    fn kills_child_after_timeout() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 5");
        let out = run_command_with_timeout(cmd, Duration::from_millis(100), 1024).expect("run");
        assert!(out.timed_out);
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let cmd = Command::new("definitely-not-a-real-program-xyz");
        assert!(run_command_with_timeout(cmd, Duration::from_secs(1), 16).is_err());
    }

    #[test]
    fn finds_shell_on_path() {
        assert!(find_on_path("sh").is_some());
        assert!(find_on_path("definitely-not-a-real-program-xyz").is_none());
    }
}
