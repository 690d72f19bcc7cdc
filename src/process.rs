//! Time-boxed subprocess execution shared by fetchers and strategies.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::CommandError;

#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput {
    pub command: Vec<String>,
    pub returncode: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.returncode == 0
    }
}

/// Runs external commands with a per-command timeout.
///
/// On unix every command leads its own process group. When the command
/// times out, or its future is dropped because the stage ran out of budget,
/// the whole group is killed, so helpers forked by pip or git die with it.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Option<Duration>,
    env: BTreeMap<String, String>,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CommandRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run `command` and return its output regardless of exit status.
    pub async fn run<S: AsRef<str>>(
        &self,
        command: &[S],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, CommandError> {
        let command: Vec<String> = command.iter().map(|s| s.as_ref().to_string()).collect();
        let (program, args) = command.split_first().ok_or(CommandError::Empty)?;
        let rendered = command.join(" ");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        debug!(command = %rendered, cwd = ?cwd, "Spawning command");
        let start = Instant::now();
        let child = cmd.spawn().map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;
        let _group = ProcessGroup::of(&child);

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| CommandError::Timeout {
                    command: rendered.clone(),
                    timeout: limit,
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|source| CommandError::Io {
            command: rendered.clone(),
            source,
        })?;

        let result = CommandOutput {
            command,
            returncode: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        debug!(
            command = %rendered,
            returncode = result.returncode,
            duration_ms = result.duration_ms,
            "Command finished"
        );
        Ok(result)
    }

    /// Run `command` and fail with [`CommandError::Failed`] on a non-zero exit.
    pub async fn run_checked<S: AsRef<str>>(
        &self,
        command: &[S],
        cwd: Option<&Path>,
    ) -> Result<CommandOutput, CommandError> {
        let output = self.run(command, cwd).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(CommandError::Failed {
                command: output.command.join(" "),
                code: output.returncode,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Kills the process group led by a spawned command when dropped.
///
/// Dropping after a normal exit also kills background processes the command
/// left behind; an empty group makes the kill a no-op.
struct ProcessGroup {
    #[cfg(unix)]
    pgid: Option<libc::pid_t>,
}

impl ProcessGroup {
    #[cfg(unix)]
    fn of(child: &tokio::process::Child) -> Self {
        Self {
            pgid: child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()),
        }
    }

    #[cfg(not(unix))]
    fn of(_child: &tokio::process::Child) -> Self {
        Self {}
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if let Some(pgid) = self.pgid.filter(|pgid| *pgid > 0) {
                // SAFETY: killpg only sends a signal to a group we created.
                unsafe {
                    libc::killpg(pgid, libc::SIGKILL);
                }
            }
        }
    }
}

pub fn display_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
