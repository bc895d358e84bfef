// Runner Configuration
// Defaults, YAML loading and validation for a buildmatrix run

use crate::matrix::DEFAULT_AXES;
use crate::sandbox::{ContainerConfig, ImagePullPolicy};

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which sandbox backend runs the jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxKind {
    /// One Docker container per job
    Container,
    /// A host shell process per job, without isolation
    Process,
}

impl std::str::FromStr for SandboxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "container" | "docker" => Ok(SandboxKind::Container),
            "process" | "shell" => Ok(SandboxKind::Process),
            other => Err(format!("unknown sandbox kind '{}'", other)),
        }
    }
}

/// Sandbox section of the config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub kind: SandboxKind,
    /// Required by the container sandbox
    pub image: String,
    /// Entry command run inside the container (default: `sh -c <script>`)
    pub command: Vec<String>,
    pub pull_policy: ImagePullPolicy,
    pub auto_remove: bool,
    /// Build script, run by the process sandbox and by containers without a command
    pub script: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let container = ContainerConfig::default();
        Self {
            kind: SandboxKind::Container,
            image: container.image,
            command: container.command,
            pull_policy: container.pull_policy,
            auto_remove: container.auto_remove,
            script: "./build.sh".to_string(),
        }
    }
}

impl SandboxConfig {
    pub fn container_config(&self) -> ContainerConfig {
        let command = if self.command.is_empty() {
            vec!["sh".to_string(), "-c".to_string(), self.script.clone()]
        } else {
            self.command.clone()
        };
        ContainerConfig {
            image: self.image.clone(),
            command,
            pull_policy: self.pull_policy,
            auto_remove: self.auto_remove,
        }
    }
}

/// Configuration for a run, threaded into each component at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Directory job sets are created under (default: ~/.buildmatrix/jobsets/)
    pub output_dir: PathBuf,
    /// Upper bound on concurrently running sandboxes
    pub max_concurrency: usize,
    /// Per-job wall clock limit
    pub job_timeout_secs: u64,
    /// Axis names read from the matrix file, in expansion order
    pub axes: Vec<String>,
    /// Keep only the first N environments after sorting
    pub limit: Option<usize>,
    /// Matrix file looked up in the checkout
    pub matrix_file: String,
    pub log_level: String,
    pub sandbox: SandboxConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let output_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".buildmatrix")
            .join("jobsets");

        Self {
            output_dir,
            max_concurrency: 1,
            job_timeout_secs: 3600,
            axes: DEFAULT_AXES.iter().map(|a| a.to_string()).collect(),
            limit: None,
            matrix_file: ".travis.yml".to_string(),
            log_level: "info".to_string(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl RunnerConfig {
    /// Load from a YAML file; missing fields take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, serde_yaml::Error> {
        // An empty file is a null document, which means "all defaults"
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.job_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "job_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.axes.is_empty() {
            return Err(ConfigError::Invalid("axes must not be empty".to_string()));
        }
        if let Some(axis) = self.axes.iter().find(|a| a.trim().is_empty()) {
            return Err(ConfigError::Invalid(format!("invalid axis name '{}'", axis)));
        }
        if self.sandbox.kind == SandboxKind::Container && self.sandbox.image.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "the container sandbox needs an image (set sandbox.image or pass --image)"
                    .to_string(),
            ));
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn process_sandbox() -> SandboxConfig {
        SandboxConfig {
            kind: SandboxKind::Process,
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.max_concurrency, 1);
        assert_eq!(config.job_timeout(), Duration::from_secs(3600));
        assert_eq!(config.axes, vec!["runtime", "env"]);
        assert_eq!(config.matrix_file, ".travis.yml");
        assert!(config.output_dir.ends_with(".buildmatrix/jobsets"));
        assert_eq!(config.sandbox.kind, SandboxKind::Container);
    }

    #[test]
    fn test_container_sandbox_requires_image() {
        let mut config = RunnerConfig::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("needs an image"), "{}", err);

        config.sandbox.image = "ruby:3.3".to_string();
        assert!(config.validate().is_ok());

        config.sandbox.image.clear();
        config.sandbox.kind = SandboxKind::Process;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_container_command_defaults_to_script() {
        let mut sandbox = SandboxConfig {
            image: "ruby:3.3".to_string(),
            script: "make test".to_string(),
            ..Default::default()
        };
        assert_eq!(sandbox.container_config().command, vec!["sh", "-c", "make test"]);

        sandbox.command = vec!["rake".to_string()];
        assert_eq!(sandbox.container_config().command, vec!["rake"]);
    }

    #[test]
    fn test_yaml_overrides() {
        let config = RunnerConfig::from_yaml_str(
            r#"
max_concurrency: 4
axes: [rvm, gemfile, env]
limit: 10
sandbox:
  kind: process
  script: make test
"#,
        )
        .unwrap();

        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.axes, vec!["rvm", "gemfile", "env"]);
        assert_eq!(config.limit, Some(10));
        assert_eq!(config.job_timeout_secs, 3600);
        assert_eq!(config.sandbox.kind, SandboxKind::Process);
        assert_eq!(config.sandbox.script, "make test");
        assert_eq!(config.sandbox.pull_policy, ImagePullPolicy::IfNotPresent);
    }

    #[test]
    fn test_empty_file_is_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "").unwrap();

        assert_eq!(RunnerConfig::from_file(&path).unwrap(), RunnerConfig::default());
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = RunnerConfig::from_file(dir.path().join("nope.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_unknown_sandbox_kind_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(&path, "sandbox:\n  kind: vm\n").unwrap();

        let err = RunnerConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = RunnerConfig {
            max_concurrency: 0,
            sandbox: process_sandbox(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout_and_empty_axes() {
        let config = RunnerConfig {
            job_timeout_secs: 0,
            sandbox: process_sandbox(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RunnerConfig {
            axes: Vec::new(),
            sandbox: process_sandbox(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sandbox_kind_from_str() {
        assert_eq!("Docker".parse::<SandboxKind>().unwrap(), SandboxKind::Container);
        assert_eq!("process".parse::<SandboxKind>().unwrap(), SandboxKind::Process);
        assert!("vm".parse::<SandboxKind>().is_err());
    }
}
