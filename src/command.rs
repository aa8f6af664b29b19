//! Shell command execution for service lifecycle commands
//!
//! Start, stop and check commands are user-supplied shell strings evaluated
//! via `sh -c`, so pipes, backgrounding and redirection all work. The
//! executor never fails: spawn errors and timeouts are reported through the
//! exit code and captured output.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

/// Default timeout for a command invocation
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit code reported when the shell could not be spawned
const EXIT_SPAWN_FAILED: i32 = 127;

/// Exit code reported when the command exceeded its timeout
const EXIT_TIMED_OUT: i32 = 124;

/// How long to keep draining output pipes after the shell itself has exited.
/// Backgrounded grandchildren (`nohup … &`) inherit the pipes and would
/// otherwise hold the read open until they exit.
const PIPE_DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Options for a single command invocation
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Working directory for the shell
    pub cwd: Option<PathBuf>,
    /// Environment overlay, merged over the inherited environment
    pub env: HashMap<String, String>,
    /// Upper bound on the command's runtime
    pub timeout: Option<Duration>,
}

/// Outcome of a command invocation
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            exit_code: EXIT_SPAWN_FAILED,
            stdout: String::new(),
            stderr: message.into(),
        }
    }

    /// One-line summary of the captured output, for logs and error messages
    pub fn summary(&self) -> String {
        let text = if !self.stderr.trim().is_empty() {
            self.stderr.trim()
        } else {
            self.stdout.trim()
        };
        let mut line = text.lines().last().unwrap_or("").to_string();
        if line.len() > 512 {
            line.truncate(512);
        }
        line
    }
}

/// Runs user-supplied shell commands with bounded runtime
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Run `command` under `sh -c` and collect its exit code and output.
    ///
    /// Never returns an error: a failed spawn yields exit code 127 with the
    /// failure message in stderr, and a timeout kills the shell and yields
    /// exit code 124 with whatever output was captured up to that point.
    pub async fn run(&self, command: &str, opts: &ExecOptions) -> CommandOutput {
        let timeout = opts.timeout.unwrap_or(DEFAULT_COMMAND_TIMEOUT);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref cwd) = opts.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return CommandOutput::spawn_failure(format!("failed to spawn shell: {}", e));
            }
        };

        let stdout_buf = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        let stdout_task = spawn_drain(child.stdout.take(), Arc::clone(&stdout_buf));
        let stderr_task = spawn_drain(child.stderr.take(), Arc::clone(&stderr_buf));

        let (exit_code, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
            Ok(Err(e)) => {
                debug!(command, error = %e, "failed waiting for command");
                (-1, false)
            }
            Err(_) => {
                let _ = child.kill().await;
                (EXIT_TIMED_OUT, true)
            }
        };

        // Grandchildren may still hold the pipes open; take what has arrived.
        let _ = tokio::time::timeout(PIPE_DRAIN_GRACE, async {
            let _ = stdout_task.await;
            let _ = stderr_task.await;
        })
        .await;

        let stdout = String::from_utf8_lossy(&stdout_buf.lock()).into_owned();
        let mut stderr = String::from_utf8_lossy(&stderr_buf.lock()).into_owned();
        if timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!("command timed out after {:?}", timeout));
        }

        debug!(command, exit_code, timed_out, "command finished");

        CommandOutput {
            exit_code,
            stdout,
            stderr,
        }
    }

    /// Run `command` and report whether it exited zero
    pub async fn check(&self, command: &str, opts: &ExecOptions) -> bool {
        self.run(command, opts).await.success()
    }
}

fn spawn_drain<R>(pipe: Option<R>, buf: Arc<Mutex<Vec<u8>>>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else { return };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.lock().extend_from_slice(&chunk[..n]),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout() {
        let out = CommandExecutor::new()
            .run("echo hello", &ExecOptions::default())
            .await;
        assert_eq!(out.exit_code, 0);
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
        assert!(out.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_captures_stderr_and_exit_code() {
        let out = CommandExecutor::new()
            .run("echo oops >&2; exit 3", &ExecOptions::default())
            .await;
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_unknown_command_reports_nonzero() {
        let out = CommandExecutor::new()
            .run("definitely-not-a-command-xyz", &ExecOptions::default())
            .await;
        assert_ne!(out.exit_code, 0);
    }

    #[tokio::test]
    async fn test_shell_features_available() {
        let out = CommandExecutor::new()
            .run("printf 'a\\nb\\nc\\n' | wc -l", &ExecOptions::default())
            .await;
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "3");
    }

    #[tokio::test]
    async fn test_env_overlay() {
        let mut env = HashMap::new();
        env.insert("DYNAPM_TEST_VALUE".to_string(), "overlay".to_string());
        let opts = ExecOptions {
            env,
            ..Default::default()
        };
        let out = CommandExecutor::new()
            .run("echo $DYNAPM_TEST_VALUE", &opts)
            .await;
        assert_eq!(out.stdout.trim(), "overlay");
    }

    #[tokio::test]
    async fn test_working_directory() {
        let cwd = std::env::temp_dir().canonicalize().unwrap();
        let opts = ExecOptions {
            cwd: Some(cwd.clone()),
            ..Default::default()
        };
        let out = CommandExecutor::new().run("pwd", &opts).await;
        assert_eq!(out.stdout.trim(), cwd.to_string_lossy());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports() {
        let opts = ExecOptions {
            timeout: Some(Duration::from_millis(150)),
            ..Default::default()
        };
        let started = std::time::Instant::now();
        let out = CommandExecutor::new()
            .run("echo partial; sleep 5", &opts)
            .await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(out.exit_code, 124);
        assert_eq!(out.stdout.trim(), "partial");
        assert!(out.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_backgrounded_child_does_not_block() {
        // start commands typically background the real process
        let started = std::time::Instant::now();
        let out = CommandExecutor::new()
            .run("sleep 5 & echo started", &ExecOptions::default())
            .await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.trim(), "started");
    }

    #[tokio::test]
    async fn test_check_maps_exit_code() {
        let executor = CommandExecutor::new();
        assert!(executor.check("true", &ExecOptions::default()).await);
        assert!(!executor.check("false", &ExecOptions::default()).await);
    }

    #[test]
    fn test_summary_prefers_stderr() {
        let out = CommandOutput {
            exit_code: 1,
            stdout: "ignored".to_string(),
            stderr: "first\nlast error line\n".to_string(),
        };
        assert_eq!(out.summary(), "last error line");
    }
}
