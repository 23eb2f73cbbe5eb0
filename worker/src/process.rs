//! Low-level process spawning and output capture.
//!
//! Every external program the worker runs (git, ssh-agent, ssh-add) goes
//! through [`run_captured`]. Children are spawned with `kill_on_drop(true)` so
//! closing a connection mid-command does not leave orphans behind.

use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// Captured result of a finished child process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// Exit code, or `-1` if the process was killed by a signal.
    pub exit_code: i32,
    /// Full stdout, lossy UTF-8.
    pub stdout: String,
    /// Full stderr, lossy UTF-8.
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, the text git users expect to see on failure.
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len());
        out.push_str(&self.stdout);
        out.push_str(&self.stderr);
        out
    }
}

/// Errors that can occur during [`run_captured`].
#[derive(Debug)]
pub enum ProcessError {
    /// The binary could not be started (e.g. not found, permission denied).
    SpawnFailed(String),
    /// The child started but a pipe or `wait()` failed.
    ProcessFailed(String),
}

impl std::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessError::SpawnFailed(e) => write!(f, "Failed to spawn process: {e}"),
            ProcessError::ProcessFailed(e) => write!(f, "Process error: {e}"),
        }
    }
}

impl std::error::Error for ProcessError {}

/// Run `cmd` to completion and capture its output.
///
/// When `input` is `Some`, it is written to the child's stdin, which is then
/// closed. Stdout and stderr are read concurrently with the stdin write to
/// avoid pipe deadlock. There is no timeout: slow git operations (clone,
/// fetch) are allowed to run for as long as they need.
pub async fn run_captured(
    mut cmd: Command,
    input: Option<&[u8]>,
) -> Result<ProcessOutput, ProcessError> {
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProcessError::ProcessFailed("Failed to take stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProcessError::ProcessFailed("Failed to take stderr pipe".to_string()))?;
    let stdin = child.stdin.take();

    let write_input = async move {
        if let (Some(mut pipe), Some(bytes)) = (stdin, input) {
            // A child that exits without reading stdin is not an error here;
            // its exit code tells the real story.
            let _ = pipe.write_all(bytes).await;
            let _ = pipe.shutdown().await;
        }
    };

    let ((), stdout_data, stderr_data) = tokio::join!(
        write_input,
        read_all(&mut stdout),
        read_all(&mut stderr),
    );

    let status = child
        .wait()
        .await
        .map_err(|e| ProcessError::ProcessFailed(e.to_string()))?;

    Ok(ProcessOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: stdout_data,
        stderr: stderr_data,
    })
}

async fn read_all(reader: &mut (impl tokio::io::AsyncRead + Unpin)) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let out = run_captured(sh("echo out; echo err >&2; exit 3"), None)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout, "out\n");
        assert_eq!(out.stderr, "err\n");
        assert!(!out.success());
        assert_eq!(out.combined(), "out\nerr\n");
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let out = run_captured(sh("cat"), Some(b"hello\n")).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello\n");
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_failure() {
        let err = run_captured(Command::new("/nonexistent/gityak-test-bin"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::SpawnFailed(_)));
        assert!(err.to_string().starts_with("Failed to spawn process"));
    }

    #[tokio::test]
    async fn large_output_does_not_deadlock() {
        // 256 KiB on each stream, well past the pipe buffer size.
        let script = "head -c 262144 /dev/zero; head -c 262144 /dev/zero >&2";
        let out = run_captured(sh(script), None).await.unwrap();
        assert_eq!(out.stdout.len(), 262_144);
        assert_eq!(out.stderr.len(), 262_144);
    }
}
