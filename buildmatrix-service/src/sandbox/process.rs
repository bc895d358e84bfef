// Process Executor
// Runs a build script with the host shell; no isolation, for local runs and tests

use crate::sandbox::{ExecutionOutcome, ExecutionRequest, SandboxExecutor, SandboxFailure};
use crate::state::OutputSink;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;

/// Shell types supported by the process executor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// Default shell (sh on Unix, cmd on Windows)
    Default,
    Bash,
}

impl Shell {
    fn get_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    ("cmd", &["/C"])
                } else {
                    ("sh", &["-c"])
                }
            }
            Shell::Bash => ("bash", &["-c"]),
        }
    }
}

/// Runs `script` in the checkout directory with the environment exported.
///
/// On Unix each build gets its own process group so teardown reaches
/// everything the script started, not just the shell.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    script: String,
    shell: Shell,
    /// Process group of each running instance
    groups: Arc<Mutex<HashMap<String, u32>>>,
}

impl ProcessExecutor {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            shell: Shell::Default,
            groups: Arc::default(),
        }
    }

    pub fn with_shell(mut self, shell: Shell) -> Self {
        self.shell = shell;
        self
    }

    fn open_log(output: &OutputSink) -> std::io::Result<(Stdio, Stdio)> {
        let log = std::fs::File::create(output.log_path())?;
        let stderr = log.try_clone()?;
        Ok((Stdio::from(log), Stdio::from(stderr)))
    }

    fn track_group(&self, instance: &str, pgid: Option<u32>) {
        if let (Some(pgid), Ok(mut groups)) = (pgid, self.groups.lock()) {
            groups.insert(instance.to_string(), pgid);
        }
    }

    fn forget_group(&self, instance: &str) -> Option<u32> {
        self.groups.lock().ok()?.remove(instance)
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) -> std::io::Result<()> {
    let result = unsafe { libc::killpg(pgid as libc::pid_t, libc::SIGKILL) };
    if result == -1 {
        let err = std::io::Error::last_os_error();
        // ESRCH: the group already exited
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) -> std::io::Result<()> {
    Ok(())
}

#[async_trait::async_trait]
impl SandboxExecutor for ProcessExecutor {
    async fn execute(&self, request: &ExecutionRequest, output: &OutputSink) -> ExecutionOutcome {
        let (stdout, stderr) = match Self::open_log(output) {
            Ok(streams) => streams,
            Err(e) => {
                return ExecutionOutcome::SandboxFailure(SandboxFailure::Spawn(format!(
                    "cannot open log {}: {}",
                    output.log_path().display(),
                    e
                )))
            }
        };

        let (shell_cmd, shell_args) = self.shell.get_command();
        let artifacts = output.artifacts_dir().to_string_lossy().to_string();

        let mut cmd = Command::new(shell_cmd);
        cmd.args(shell_args)
            .arg(&self.script)
            .current_dir(&request.source.checkout)
            .envs(request.variables(&artifacts))
            .envs(request.environment.to_string_map())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        tracing::debug!(job = request.job_id, shell = shell_cmd, "spawning build process");

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::SandboxFailure(SandboxFailure::Spawn(format!(
                    "failed to spawn shell process '{}': {}",
                    shell_cmd, e
                )))
            }
        };

        // With process_group(0) the group id equals the shell's pid
        self.track_group(&request.instance, child.id());

        let waited = child.wait().await;
        self.forget_group(&request.instance);

        match waited {
            Ok(status) => match status.code() {
                Some(exit_status) => ExecutionOutcome::Completed { exit_status },
                None => ExecutionOutcome::SandboxFailure(SandboxFailure::Terminated(format!(
                    "process ended without exit code ({})",
                    status
                ))),
            },
            Err(e) => ExecutionOutcome::SandboxFailure(SandboxFailure::Terminated(e.to_string())),
        }
    }

    async fn teardown(&self, request: &ExecutionRequest) {
        let Some(pgid) = self.forget_group(&request.instance) else {
            return;
        };
        match kill_process_group(pgid) {
            Ok(()) => tracing::debug!(instance = %request.instance, pgid, "killed process group"),
            Err(e) => tracing::warn!(
                instance = %request.instance,
                pgid,
                error = %e,
                "failed to kill process group"
            ),
        }
    }
}
