// Sandbox Executors
// Contract between the scheduler and the isolated environments that run builds

pub mod container;
pub mod process;

pub use container::{ContainerConfig, ContainerExecutor, ImagePullPolicy};
pub use process::ProcessExecutor;

use crate::matrix::Environment;
use crate::source::SourceRef;
use crate::state::OutputSink;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::time::Duration;
use thiserror::Error;

/// Variable carrying the encoded environment into the sandbox
pub const ENVIRONMENT_VAR: &str = "BUILDMATRIX_ENVIRONMENT";
/// Variable carrying the job ordinal
pub const JOB_ID_VAR: &str = "BUILDMATRIX_JOB_ID";
/// Variable naming the artifact directory as seen from inside the sandbox
pub const ARTIFACTS_VAR: &str = "BUILDMATRIX_ARTIFACTS";
/// Variable carrying the full commit hash under test
pub const COMMIT_VAR: &str = "BUILDMATRIX_COMMIT";

/// Why a sandboxed execution did not run to completion
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SandboxFailure {
    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("sandbox unavailable: {0}")]
    Unavailable(String),

    #[error("failed to start sandbox: {0}")]
    Spawn(String),

    #[error("sandbox terminated abnormally: {0}")]
    Terminated(String),
}

/// Result of one sandboxed execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The build ran to completion with this exit status
    Completed { exit_status: i32 },
    /// The sandbox itself failed, crashed or timed out
    SandboxFailure(SandboxFailure),
}

impl ExecutionOutcome {
    /// Only a zero exit status passes
    pub fn passed(&self) -> bool {
        matches!(self, ExecutionOutcome::Completed { exit_status: 0 })
    }

    pub fn exit_status(&self) -> Option<i32> {
        match self {
            ExecutionOutcome::Completed { exit_status } => Some(*exit_status),
            ExecutionOutcome::SandboxFailure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&SandboxFailure> {
        match self {
            ExecutionOutcome::Completed { .. } => None,
            ExecutionOutcome::SandboxFailure(failure) => Some(failure),
        }
    }
}

/// Everything a sandbox needs to run one job
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub job_id: u32,
    /// Unique name for the sandbox instance, used for teardown
    pub instance: String,
    pub environment: Environment,
    pub source: SourceRef,
}

impl ExecutionRequest {
    /// Variables exported into the sandboxed process
    pub fn variables(&self, artifacts_dir: &str) -> Vec<(String, String)> {
        vec![
            (ENVIRONMENT_VAR.to_string(), encode_environment(&self.environment)),
            (JOB_ID_VAR.to_string(), self.job_id.to_string()),
            (ARTIFACTS_VAR.to_string(), artifacts_dir.to_string()),
            (COMMIT_VAR.to_string(), self.source.repository.sha.clone()),
        ]
    }
}

/// Runs one environment's build in isolation
#[async_trait::async_trait]
pub trait SandboxExecutor: Send + Sync {
    /// Run the build and block until it ends.
    ///
    /// The log goes to `output.log_path()` and artifacts to
    /// `output.artifacts_dir()`. Failures of the sandbox are reported in the
    /// outcome, never as a panic.
    async fn execute(&self, request: &ExecutionRequest, output: &OutputSink) -> ExecutionOutcome;

    /// Forcibly remove whatever is left of the instance after a timeout
    async fn teardown(&self, _request: &ExecutionRequest) {}
}

/// Serialize an environment to JSON and base64 it so it survives any shell
pub fn encode_environment(environment: &Environment) -> String {
    // Serializing a map of scalars to JSON cannot fail
    let json = serde_json::to_vec(environment).unwrap_or_default();
    STANDARD.encode(json)
}

/// Reverse of [`encode_environment`]
pub fn decode_environment(encoded: &str) -> Result<Environment, String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("invalid base64: {}", e))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("invalid environment JSON: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::AxisValue;
    use crate::source::RepositoryIdentity;
    use std::path::PathBuf;

    fn environment() -> Environment {
        vec![
            ("runtime".to_string(), AxisValue::from("ruby 2.1")),
            (
                "env".to_string(),
                AxisValue::from("FLAGS='-O2 \"fast\"'; echo $HOME && rm -rf /"),
            ),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_environment_survives_encoding() {
        let encoded = encode_environment(&environment());

        assert!(encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '='));
        assert_eq!(decode_environment(&encoded).unwrap(), environment());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_environment("not base64!").is_err());
        assert!(decode_environment(&STANDARD.encode(b"[1,2]")).is_err());
    }

    #[test]
    fn test_outcome_verdicts() {
        assert!(ExecutionOutcome::Completed { exit_status: 0 }.passed());
        assert!(!ExecutionOutcome::Completed { exit_status: 2 }.passed());
        let timeout =
            ExecutionOutcome::SandboxFailure(SandboxFailure::Timeout(Duration::from_secs(5)));
        assert!(!timeout.passed());
        assert_eq!(timeout.exit_status(), None);
        assert_eq!(timeout.failure().unwrap().to_string(), "timed out after 5s");
    }

    #[test]
    fn test_request_variables() {
        let request = ExecutionRequest {
            job_id: 3,
            instance: "buildmatrix-run-3".to_string(),
            environment: environment(),
            source: SourceRef {
                checkout: PathBuf::from("/tmp/app"),
                repository: RepositoryIdentity {
                    sha: "deadbeef".to_string(),
                    ..Default::default()
                },
            },
        };

        let vars = request.variables("/artifacts");
        let get = |name: &str| {
            vars.iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get(JOB_ID_VAR), "3");
        assert_eq!(get(ARTIFACTS_VAR), "/artifacts");
        assert_eq!(get(COMMIT_VAR), "deadbeef");
        assert_eq!(decode_environment(&get(ENVIRONMENT_VAR)).unwrap(), environment());
    }
}
