//! Deployment models

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One build-and-deploy request
///
/// Immutable for the lifetime of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentJob {
    /// Groups deployments of the same project
    pub project_id: String,

    /// Unique per attempt
    pub deployment_id: String,

    /// Already checked-out source tree; the build runs here
    pub source_dir: PathBuf,

    /// Install-then-build command
    pub build_command: BuildCommand,
}

/// How the build is invoked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildCommand {
    /// Passed to `sh -c`
    Shell(String),

    /// Program followed by its arguments, no shell involved
    Argv(Vec<String>),
}

impl BuildCommand {
    pub fn is_empty(&self) -> bool {
        match self {
            BuildCommand::Shell(cmd) => cmd.trim().is_empty(),
            BuildCommand::Argv(argv) => argv.first().map_or(true, |p| p.is_empty()),
        }
    }
}

impl Default for BuildCommand {
    fn default() -> Self {
        BuildCommand::Shell("npm install && npm run build".to_string())
    }
}

impl fmt::Display for BuildCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildCommand::Shell(cmd) => write!(f, "{}", cmd),
            BuildCommand::Argv(argv) => write!(f, "{}", argv.join(" ")),
        }
    }
}

/// Deployment status as seen by subscribers
///
/// `Pending` is the implicit state before the worker starts and is never
/// published by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Pending,
    InProgress,
    Ready,
    Fail,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Ready | DeploymentStatus::Fail)
    }
}

/// Payload published on the status channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: DeploymentStatus,
}

/// Payload published on the log channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub log: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        let msg = StatusMessage {
            status: DeploymentStatus::InProgress,
        };
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"status":"IN_PROGRESS"}"#);

        let msg: StatusMessage = serde_json::from_str(r#"{"status":"FAIL"}"#).unwrap();
        assert_eq!(msg.status, DeploymentStatus::Fail);
        assert!(msg.status.is_terminal());
        assert!(!DeploymentStatus::InProgress.is_terminal());
    }

    #[test]
    fn test_log_wire_format() {
        let msg = LogMessage {
            log: "Build Started...".to_string(),
        };
        assert_eq!(serde_json::to_string(&msg).unwrap(), r#"{"log":"Build Started..."}"#);
    }

    #[test]
    fn test_build_command_forms() {
        let shell: BuildCommand = serde_json::from_str(r#""make dist""#).unwrap();
        assert_eq!(shell, BuildCommand::Shell("make dist".to_string()));

        let argv: BuildCommand = serde_json::from_str(r#"["npm", "run", "build"]"#).unwrap();
        assert_eq!(argv.to_string(), "npm run build");

        assert!(BuildCommand::Shell("   ".to_string()).is_empty());
        assert!(BuildCommand::Argv(vec![]).is_empty());
        assert!(!BuildCommand::default().is_empty());
    }
}
