// Container Executor
// Runs each job inside a throwaway Docker container

use crate::sandbox::{ExecutionOutcome, ExecutionRequest, SandboxExecutor, SandboxFailure};
use crate::state::OutputSink;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

/// Where the checkout is mounted inside the container (read-only)
pub const SOURCE_MOUNT: &str = "/buildmatrix/source";
/// Where the artifact directory is mounted inside the container
pub const ARTIFACTS_MOUNT: &str = "/buildmatrix/artifacts";

/// Image pull policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImagePullPolicy {
    /// Always pull the image
    Always,
    /// Pull only if not present locally
    IfNotPresent,
    /// Never pull (must be present locally)
    Never,
}

/// Configuration for container execution
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Image the build runs in; there is no usable default
    pub image: String,
    /// Entry command run inside the container; empty runs the image's own
    pub command: Vec<String>,
    pub pull_policy: ImagePullPolicy,
    /// Whether to remove containers after execution. Removal happens after the
    /// exit state is inspected, so `docker run --rm` is never used.
    pub auto_remove: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            command: Vec::new(),
            pull_policy: ImagePullPolicy::IfNotPresent,
            auto_remove: true,
        }
    }
}

/// Docker-backed sandbox
pub struct ContainerExecutor {
    config: ContainerConfig,
    docker: PathBuf,
}

impl ContainerExecutor {
    /// Create an executor, locating `docker` on the PATH
    pub fn new(config: ContainerConfig) -> Result<Self, SandboxFailure> {
        if config.image.trim().is_empty() {
            return Err(SandboxFailure::Unavailable(
                "no container image configured".to_string(),
            ));
        }
        let docker = which::which("docker")
            .map_err(|e| SandboxFailure::Unavailable(format!("docker not found: {}", e)))?;
        Ok(Self { config, docker })
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Check if the Docker daemon answers
    pub async fn is_available(&self) -> bool {
        let output = Command::new(&self.docker)
            .arg("version")
            .arg("--format")
            .arg("{{.Server.Version}}")
            .output()
            .await;

        output.map(|o| o.status.success()).unwrap_or(false)
    }

    /// Pull an image if needed based on pull policy
    async fn pull_image_if_needed(&self) -> Result<(), SandboxFailure> {
        let image = &self.config.image;
        match self.config.pull_policy {
            ImagePullPolicy::Never => Ok(()),
            ImagePullPolicy::Always => self.pull_image(image).await,
            ImagePullPolicy::IfNotPresent => {
                let output = Command::new(&self.docker)
                    .args(["image", "inspect", image])
                    .output()
                    .await
                    .map_err(|e| SandboxFailure::Unavailable(e.to_string()))?;

                if !output.status.success() {
                    self.pull_image(image).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), SandboxFailure> {
        tracing::info!(image, "pulling image");
        let output = Command::new(&self.docker)
            .args(["pull", image])
            .output()
            .await
            .map_err(|e| SandboxFailure::Unavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxFailure::Unavailable(format!(
                "failed to pull {}: {}",
                image,
                stderr.trim()
            )));
        }

        Ok(())
    }

    /// `docker run` arguments for one job
    fn run_args(&self, request: &ExecutionRequest, output: &OutputSink) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--name".to_string(),
            request.instance.clone(),
            "-w".to_string(),
            SOURCE_MOUNT.to_string(),
            "-v".to_string(),
            format!("{}:{}:ro", request.source.checkout.display(), SOURCE_MOUNT),
            "-v".to_string(),
            format!("{}:{}", output.artifacts_dir().display(), ARTIFACTS_MOUNT),
        ];

        // Values go through `-e NAME=VALUE` as separate argv entries, never a shell
        for (key, value) in request.variables(ARTIFACTS_MOUNT) {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.config.image.clone());
        args.extend(self.config.command.iter().cloned());
        args
    }

    /// Exit code of the container if it actually ran to completion
    async fn inspect_exit_code(&self, instance: &str) -> Option<i32> {
        let output = Command::new(&self.docker)
            .args(["inspect", "--format", "{{.State.Status}} {{.State.ExitCode}}", instance])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_container_state(&String::from_utf8_lossy(&output.stdout))
    }

    async fn remove_container(&self, instance: &str) {
        let result = Command::new(&self.docker)
            .args(["rm", "-f", instance])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => {
                tracing::debug!(instance, "removed container");
            }
            Ok(output) => tracing::warn!(
                instance,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "failed to remove container"
            ),
            Err(e) => tracing::warn!(instance, error = %e, "failed to run docker rm"),
        }
    }
}

/// Parse `<status> <exit code>` from `docker inspect`; only an exited
/// container has a meaningful exit code
fn parse_container_state(state: &str) -> Option<i32> {
    let mut parts = state.split_whitespace();
    let status = parts.next()?;
    let code = parts.next()?.parse().ok()?;
    (status == "exited").then_some(code)
}

#[async_trait::async_trait]
impl SandboxExecutor for ContainerExecutor {
    async fn execute(&self, request: &ExecutionRequest, output: &OutputSink) -> ExecutionOutcome {
        if let Err(failure) = self.pull_image_if_needed().await {
            return ExecutionOutcome::SandboxFailure(failure);
        }

        let (stdout, stderr) = match std::fs::File::create(output.log_path())
            .and_then(|log| Ok((log.try_clone()?, log)))
        {
            Ok((stdout, stderr)) => (Stdio::from(stdout), Stdio::from(stderr)),
            Err(e) => {
                return ExecutionOutcome::SandboxFailure(SandboxFailure::Spawn(format!(
                    "cannot open log {}: {}",
                    output.log_path().display(),
                    e
                )))
            }
        };

        let args = self.run_args(request, output);
        tracing::debug!(job = request.job_id, instance = %request.instance, "docker {}", args.join(" "));

        let mut child = match Command::new(&self.docker)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::SandboxFailure(SandboxFailure::Unavailable(e.to_string()))
            }
        };

        let outcome = match child.wait().await {
            // docker run reports its own failures with 125..=127, which a build
            // script can also return; the container state tells them apart
            Ok(status) => match status.code() {
                Some(code @ 125..=127) => match self.inspect_exit_code(&request.instance).await {
                    Some(exit_status) if exit_status == code => {
                        ExecutionOutcome::Completed { exit_status }
                    }
                    _ => ExecutionOutcome::SandboxFailure(SandboxFailure::Spawn(format!(
                        "docker run exited with {}",
                        code
                    ))),
                },
                Some(exit_status) => ExecutionOutcome::Completed { exit_status },
                None => ExecutionOutcome::SandboxFailure(SandboxFailure::Terminated(format!(
                    "docker client ended without exit code ({})",
                    status
                ))),
            },
            Err(e) => ExecutionOutcome::SandboxFailure(SandboxFailure::Terminated(e.to_string())),
        };

        if self.config.auto_remove {
            self.remove_container(&request.instance).await;
        }
        outcome
    }

    async fn teardown(&self, request: &ExecutionRequest) {
        self.remove_container(&request.instance).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{AxisValue, Environment};
    use crate::sandbox::{decode_environment, ENVIRONMENT_VAR};
    use crate::source::{RepositoryIdentity, SourceRef};
    use crate::state::StateStore;
    use tempfile::TempDir;

    fn executor(config: ContainerConfig) -> ContainerExecutor {
        ContainerExecutor {
            config,
            docker: PathBuf::from("docker"),
        }
    }

    #[test]
    fn test_run_args() {
        let dir = TempDir::new().unwrap();
        let set = StateStore::new(dir.path())
            .create_job_set_at(dir.path().join("run"), RepositoryIdentity::default())
            .unwrap();
        let job = set.add_job(&Environment::new(), 2).unwrap();
        let sink = job.output_sink();

        let environment: Environment =
            vec![("env".to_string(), AxisValue::from("A='x y'"))].into_iter().collect();
        let request = ExecutionRequest {
            job_id: 2,
            instance: "buildmatrix-run-2".to_string(),
            environment: environment.clone(),
            source: SourceRef {
                checkout: PathBuf::from("/work/app"),
                repository: RepositoryIdentity::default(),
            },
        };

        let config = ContainerConfig {
            image: "ruby:3.3".to_string(),
            command: vec!["./build.sh".to_string()],
            ..Default::default()
        };
        let args = executor(config).run_args(&request, &sink);

        assert_eq!(&args[..3], &["run", "--name", "buildmatrix-run-2"]);
        assert!(args.contains(&format!("/work/app:{}:ro", SOURCE_MOUNT)));
        assert!(!args.contains(&"--rm".to_string()));
        assert_eq!(args[args.len() - 2], "ruby:3.3");
        assert_eq!(args[args.len() - 1], "./build.sh");

        let prefix = format!("{}=", ENVIRONMENT_VAR);
        let encoded = args
            .iter()
            .find_map(|a| a.strip_prefix(&prefix))
            .unwrap();
        assert_eq!(decode_environment(encoded).unwrap(), environment);
    }

    #[test]
    fn test_container_state_exit_code() {
        assert_eq!(parse_container_state("exited 127\n"), Some(127));
        assert_eq!(parse_container_state("exited 0"), Some(0));
        // Start failures leave the container created, not exited
        assert_eq!(parse_container_state("created 127"), None);
        assert_eq!(parse_container_state("running 0"), None);
        assert_eq!(parse_container_state(""), None);
    }

    #[test]
    fn test_run_args_custom_command() {
        let dir = TempDir::new().unwrap();
        let set = StateStore::new(dir.path())
            .create_job_set_at(dir.path().join("run"), RepositoryIdentity::default())
            .unwrap();
        let job = set.add_job(&Environment::new(), 1).unwrap();
        let request = ExecutionRequest {
            job_id: 1,
            instance: "i".to_string(),
            environment: Environment::new(),
            source: SourceRef {
                checkout: PathBuf::from("/src"),
                repository: RepositoryIdentity::default(),
            },
        };

        let config = ContainerConfig {
            image: "alpine".to_string(),
            auto_remove: false,
            command: vec!["sh".to_string(), "-c".to_string(), "make test".to_string()],
            ..Default::default()
        };
        let args = executor(config).run_args(&request, &job.output_sink());

        assert!(!args.contains(&"--rm".to_string()));
        assert_eq!(&args[args.len() - 3..], &["sh", "-c", "make test"]);
    }

    #[test]
    fn test_pull_policy_serde() {
        let policy: ImagePullPolicy = serde_yaml::from_str("if-not-present").unwrap();
        assert_eq!(policy, ImagePullPolicy::IfNotPresent);
    }

    #[test]
    fn test_new_requires_image() {
        let err = ContainerExecutor::new(ContainerConfig::default()).err().unwrap();
        assert!(matches!(err, SandboxFailure::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_docker_availability_check() {
        let config = ContainerConfig {
            image: "alpine".to_string(),
            ..Default::default()
        };
        // Only verifies the check doesn't panic when docker is missing or down
        if let Ok(executor) = ContainerExecutor::new(config) {
            let _ = executor.is_available().await;
        }
    }
}
