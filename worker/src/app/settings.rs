//! Worker settings: JSON settings file plus environment overrides

use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::errors::WorkerError;
use crate::logs::LogLevel;
use crate::models::deployment::{BuildCommand, DeploymentJob};
use crate::mqtt::client::MqttAddress;

/// Worker settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// The deployment to run
    #[serde(default)]
    pub job: JobSettings,

    /// Build execution
    #[serde(default)]
    pub build: BuildSettings,

    /// Channel used for logs and status
    #[serde(default)]
    pub channel: ChannelSettings,

    /// MQTT broker configuration
    #[serde(default)]
    pub mqtt_broker: MqttBrokerSettings,

    /// Artifact bucket
    #[serde(default)]
    pub storage: StorageSettings,

    /// Publishing behaviour
    #[serde(default)]
    pub publish: PublishSettings,
}

/// Job identity and source location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    #[serde(default)]
    pub project_id: String,

    #[serde(default)]
    pub deployment_id: String,

    /// Already checked-out source tree
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// Shell string or argv list
    #[serde(default)]
    pub build_command: BuildCommand,
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("output")
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            deployment_id: String::new(),
            source_dir: default_source_dir(),
            build_command: BuildCommand::default(),
        }
    }
}

/// What to do with stderr output from a build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StderrPolicy {
    /// Any stderr line fails the deployment, whatever the exit code
    #[default]
    FailBuild,

    /// Only the exit code decides
    ExitCode,
}

impl std::str::FromStr for StderrPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fail_build" | "fail" => Ok(StderrPolicy::FailBuild),
            "exit_code" | "ignore" => Ok(StderrPolicy::ExitCode),
            _ => Err(format!("Invalid stderr policy: {}", s)),
        }
    }
}

/// Build execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSettings {
    /// Build output root, relative to the source dir
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Kill the build after this many seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub stderr_policy: StderrPolicy,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("dist")
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            timeout_secs: None,
            stderr_policy: StderrPolicy::default(),
        }
    }
}

/// Log/status channel selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// "mqtt" or "memory" (dry run, nothing leaves the process)
    #[serde(default = "default_channel_type")]
    pub channel_type: String,
}

fn default_channel_type() -> String {
    "mqtt".to_string()
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            channel_type: default_channel_type(),
        }
    }
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttBrokerSettings {
    /// Broker host
    #[serde(default)]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Use TLS
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Optional path to a PEM-encoded CA certificate for broker TLS verification.
    /// When absent, the system certificate store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default, skip_serializing)]
    pub password: Option<SecretString>,

    /// Seconds to wait for outstanding acknowledgements on shutdown
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_secs: u64,

    /// Largest MQTT packet, in bytes; publishes above it are rejected
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_flush_timeout() -> u64 {
    10
}

fn default_max_packet_size() -> usize {
    crate::mqtt::client::DEFAULT_MAX_PACKET_SIZE
}

impl Default for MqttBrokerSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mqtt_port(),
            tls: true,
            ca_cert_path: None,
            username: None,
            password: None,
            flush_timeout_secs: default_flush_timeout(),
            max_packet_size: default_max_packet_size(),
        }
    }
}

impl MqttBrokerSettings {
    pub fn address(&self) -> MqttAddress {
        MqttAddress {
            host: self.host.clone(),
            port: self.port,
            use_tls: self.tls,
            ca_cert_path: self.ca_cert_path.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

/// Artifact storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// "s3", "local" or "memory"
    #[serde(default = "default_storage_type")]
    pub storage_type: String,

    /// Bucket name (s3) or base directory (local)
    #[serde(default = "default_bucket")]
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// S3-compatible endpoint override
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Retries for transient upload failures (0 disables)
    #[serde(default)]
    pub upload_retries: u32,

    /// Single-put threshold and multipart part size, in bytes
    #[serde(default = "default_chunk_size")]
    pub upload_chunk_size: usize,
}

fn default_storage_type() -> String {
    "s3".to_string()
}

fn default_bucket() -> String {
    "vercel-clone-outputs".to_string()
}

fn default_region() -> String {
    "ap-south-1".to_string()
}

fn default_chunk_size() -> usize {
    crate::artifacts::uploader::DEFAULT_CHUNK_SIZE
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            storage_type: default_storage_type(),
            bucket: default_bucket(),
            region: default_region(),
            endpoint: None,
            upload_retries: 0,
            upload_chunk_size: default_chunk_size(),
        }
    }
}

/// Status publishing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSettings {
    /// Attempts for the terminal status, the first one included
    #[serde(default = "default_terminal_attempts")]
    pub terminal_status_attempts: u32,
}

fn default_terminal_attempts() -> u32 {
    2
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            terminal_status_attempts: default_terminal_attempts(),
        }
    }
}

impl Settings {
    /// Read the settings file (if any) and apply environment overrides
    pub async fn load(path: Option<&Path>) -> Result<Self, WorkerError> {
        let mut settings = match path {
            Some(path) => {
                let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
                    WorkerError::ConfigError(format!(
                        "Unable to read settings file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                serde_json::from_str(&contents)?
            }
            None => Settings::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Override fields from environment variables, looked up through `var`
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), WorkerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| var(key).filter(|v| !v.is_empty());

        if let Some(v) = var("PROJECT_ID") {
            self.job.project_id = v;
        }
        if let Some(v) = var("DEPLOYMENT_ID") {
            self.job.deployment_id = v;
        }
        if let Some(v) = var("SOURCE_DIR") {
            self.job.source_dir = PathBuf::from(v);
        }
        if let Some(v) = var("BUILD_COMMAND") {
            self.job.build_command = BuildCommand::Shell(v);
        }
        if let Some(v) = var("OUTPUT_DIR") {
            self.build.output_dir = PathBuf::from(v);
        }
        if let Some(v) = var("BUILD_TIMEOUT_SECS") {
            self.build.timeout_secs = Some(parse_env("BUILD_TIMEOUT_SECS", &v)?);
        }
        if let Some(v) = var("STDERR_POLICY") {
            self.build.stderr_policy = v.parse().map_err(WorkerError::ConfigError)?;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.log_level = v.parse().map_err(WorkerError::ConfigError)?;
        }
        if let Some(v) = var("CHANNEL_TYPE") {
            self.channel.channel_type = v;
        }
        if let Some(v) = var("MQTT_HOST") {
            self.mqtt_broker.host = v;
        }
        if let Some(v) = var("MQTT_PORT") {
            self.mqtt_broker.port = parse_env("MQTT_PORT", &v)?;
        }
        if let Some(v) = var("MQTT_TLS") {
            self.mqtt_broker.tls = parse_env("MQTT_TLS", &v)?;
        }
        if let Some(v) = var("MQTT_USERNAME") {
            self.mqtt_broker.username = Some(v);
        }
        if let Some(v) = var("MQTT_PASSWORD") {
            self.mqtt_broker.password = Some(SecretString::from(v));
        }
        if let Some(v) = var("STORAGE_TYPE") {
            self.storage.storage_type = v;
        }
        if let Some(v) = var("S3_BUCKET") {
            self.storage.bucket = v;
        }
        if let Some(v) = var("AWS_REGION") {
            self.storage.region = v;
        }
        if let Some(v) = var("S3_ENDPOINT") {
            self.storage.endpoint = Some(v);
        }
        if let Some(v) = var("UPLOAD_RETRIES") {
            self.storage.upload_retries = parse_env("UPLOAD_RETRIES", &v)?;
        }
        Ok(())
    }

    /// Reject settings the worker cannot run with
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.job.project_id.trim().is_empty() {
            return Err(WorkerError::ConfigError("PROJECT_ID is not set".to_string()));
        }
        if self.job.deployment_id.trim().is_empty() {
            return Err(WorkerError::ConfigError("DEPLOYMENT_ID is not set".to_string()));
        }
        if self.job.build_command.is_empty() {
            return Err(WorkerError::ConfigError("Build command is empty".to_string()));
        }
        if !matches!(self.storage.storage_type.as_str(), "s3" | "local" | "memory") {
            return Err(WorkerError::ConfigError(format!(
                "Unsupported storage type: {}",
                self.storage.storage_type
            )));
        }
        if !matches!(self.channel.channel_type.as_str(), "mqtt" | "memory") {
            return Err(WorkerError::ConfigError(format!(
                "Unsupported channel type: {}",
                self.channel.channel_type
            )));
        }
        if self.channel.channel_type == "mqtt" && self.mqtt_broker.host.is_empty() {
            return Err(WorkerError::ConfigError("MQTT_HOST is not set".to_string()));
        }
        Ok(())
    }

    pub fn job(&self) -> DeploymentJob {
        DeploymentJob {
            project_id: self.job.project_id.clone(),
            deployment_id: self.job.deployment_id.clone(),
            source_dir: self.job.source_dir.clone(),
            build_command: self.job.build_command.clone(),
        }
    }

    pub fn build_timeout(&self) -> Option<Duration> {
        self.build.timeout_secs.map(Duration::from_secs)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, WorkerError> {
    value
        .parse()
        .map_err(|_| WorkerError::ConfigError(format!("Invalid value for {}: {}", key, value)))
}
