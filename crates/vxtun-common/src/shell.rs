//! Shell command execution utilities.
//!
//! Every host mutation in vxtun goes through a [`CommandRunner`], so the
//! orchestrator can be driven against a recorded fake in tests. The
//! production runner, [`ShellRunner`], executes through `/bin/sh -c` and
//! all interpolated values are passed through [`shellquote`].
//!
//! # Example
//!
//! ```ignore
//! use vxtun_common::shell::{self, IP_CMD, shellquote};
//!
//! let cmd = format!("{} link show dev {}", IP_CMD, shellquote("vxlan10001"));
//! let result = shell::exec(&cmd).await?;
//! ```

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{TunnelError, TunnelResult};

/// Path to the `ip` command for interface and route configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `iptables` command for NAT/forwarding rules.
pub const IPTABLES_CMD: &str = "/sbin/iptables";

/// Path to the `sysctl` command.
pub const SYSCTL_CMD: &str = "/sbin/sysctl";

/// Path to `systemctl` for supervised proxy units.
pub const SYSTEMCTL_CMD: &str = "/bin/systemctl";

/// Path to `journalctl` for unit logs.
pub const JOURNALCTL_CMD: &str = "/bin/journalctl";

/// Path to `ss` for listening socket inspection.
pub const SS_CMD: &str = "/bin/ss";

/// Path to the `ps` command.
pub const PS_CMD: &str = "/bin/ps";

/// Path to the `kill` command.
pub const KILL_CMD: &str = "/bin/kill";

/// Path to the `tail` command.
pub const TAIL_CMD: &str = "/usr/bin/tail";

/// Path to the `id` command.
pub const ID_CMD: &str = "/usr/bin/id";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// This function wraps the string in double quotes and escapes any
/// characters that have special meaning inside double quotes.
///
/// # Example
///
/// ```
/// use vxtun_common::shell::shellquote;
///
/// assert_eq!(shellquote("vxlan10001"), "\"vxlan10001\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The trimmed stdout output.
    pub stdout: String,
    /// The trimmed stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Creates a successful result with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Creates a failed result with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Converts a non-zero exit into [`TunnelError::ShellCommandFailed`].
    pub fn into_stdout(self, cmd: &str) -> TunnelResult<String> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(TunnelError::ShellCommandFailed {
                command: cmd.to_string(),
                exit_code: self.exit_code,
                output: self.combined_output(),
            })
        }
    }
}

/// Executes shell commands on behalf of the provisioner and service managers.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a command and returns its exit status and output.
    ///
    /// Only spawn failures are errors; a non-zero exit is reported in the
    /// returned [`ExecResult`].
    async fn run(&self, cmd: &str) -> TunnelResult<ExecResult>;

    /// Runs a command and fails on non-zero exit, returning stdout.
    async fn run_checked(&self, cmd: &str) -> TunnelResult<String> {
        self.run(cmd).await?.into_stdout(cmd)
    }
}

/// [`CommandRunner`] backed by `/bin/sh -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, cmd: &str) -> TunnelResult<ExecResult> {
        exec(cmd).await
    }
}

/// Executes a shell command asynchronously.
///
/// This function runs the command through `/bin/sh -c` to support
/// shell features like pipes and redirects.
pub async fn exec(cmd: &str) -> TunnelResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| TunnelError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    let result = ExecResult {
        exit_code,
        stdout,
        stderr,
    };

    if result.success() {
        tracing::trace!(command = %cmd, exit_code = exit_code, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code = exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellquote_simple() {
        assert_eq!(shellquote("simple"), "\"simple\"");
        assert_eq!(shellquote("10.100.0.1/30"), "\"10.100.0.1/30\"");
    }

    #[test]
    fn test_shellquote_special_chars() {
        assert_eq!(shellquote("$HOME"), "\"\\$HOME\"");
        assert_eq!(shellquote("`whoami`"), "\"\\`whoami\\`\"");
        assert_eq!(shellquote("say \"hello\""), "\"say \\\"hello\\\"\"");
        assert_eq!(shellquote("path\\to"), "\"path\\\\to\"");
        assert_eq!(shellquote("line1\nline2"), "\"line1\\\nline2\"");
    }

    #[test]
    fn test_shellquote_empty() {
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_exec_result_combined() {
        let result = ExecResult {
            exit_code: 0,
            stdout: "stdout".to_string(),
            stderr: "stderr".to_string(),
        };
        assert_eq!(result.combined_output(), "stdout\nstderr");
        assert_eq!(ExecResult::failed(1, "boom").combined_output(), "boom");
    }

    #[test]
    fn test_into_stdout() {
        assert_eq!(ExecResult::ok("up").into_stdout("x").unwrap(), "up");
        match ExecResult::failed(2, "no such device").into_stdout("ip link show") {
            Err(TunnelError::ShellCommandFailed { exit_code, output, .. }) => {
                assert_eq!(exit_code, 2);
                assert_eq!(output, "no such device");
            }
            other => panic!("Expected ShellCommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let result = exec("echo hello").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_exec_failure() {
        let result = exec("exit 42").await.unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 42);
    }

    #[tokio::test]
    async fn test_shell_runner_checked() {
        let runner = ShellRunner;
        assert_eq!(runner.run_checked("echo ok").await.unwrap(), "ok");
        assert!(runner.run_checked("exit 1").await.is_err());
    }
}
