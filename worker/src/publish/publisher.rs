//! Log and status publishers scoped to one deployment

use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::WorkerError;
use crate::models::deployment::{DeploymentStatus, LogMessage, StatusMessage};
use crate::mqtt::topics::Topics;
use crate::publish::channel::PublishChannel;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// Publishes build log lines on `logs:{deployment_id}:{project_id}`
#[derive(Clone)]
pub struct LogPublisher {
    channel: Arc<dyn PublishChannel>,
    key: String,
}

impl LogPublisher {
    pub fn new(channel: Arc<dyn PublishChannel>, deployment_id: &str, project_id: &str) -> Self {
        Self {
            channel,
            key: Topics::logs(deployment_id, project_id),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish one line
    ///
    /// Failures are returned for diagnostics; callers are not expected to
    /// abort on them.
    pub async fn publish(&self, line: &str) -> Result<(), WorkerError> {
        let payload = serde_json::to_vec(&LogMessage {
            log: line.to_string(),
        })?;
        self.channel.publish(&self.key, payload).await
    }

    /// Publish one line, reporting a failure to the operational log only
    pub async fn publish_or_warn(&self, line: &str) -> bool {
        match self.publish(line).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key = %self.key, error = %e, "Failed to publish log line");
                false
            }
        }
    }
}

/// Publishes status transitions on `status:{deployment_id}`
#[derive(Clone)]
pub struct StatusPublisher {
    channel: Arc<dyn PublishChannel>,
    key: String,
    terminal_attempts: u32,
    cooldown: CooldownOptions,
}

impl StatusPublisher {
    pub fn new(channel: Arc<dyn PublishChannel>, deployment_id: &str) -> Self {
        Self {
            channel,
            key: Topics::status(deployment_id),
            terminal_attempts: 2,
            cooldown: CooldownOptions::default(),
        }
    }

    /// How often a terminal status is attempted before giving up (at least once)
    pub fn with_terminal_attempts(mut self, attempts: u32) -> Self {
        self.terminal_attempts = attempts.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: CooldownOptions) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish a status once
    pub async fn publish(&self, status: DeploymentStatus) -> Result<(), WorkerError> {
        let payload = serde_json::to_vec(&StatusMessage { status })?;
        self.channel.publish(&self.key, payload).await
    }

    /// Publish a terminal status, retrying transient failures
    ///
    /// Returns the last error if every attempt failed.
    pub async fn publish_terminal(&self, status: DeploymentStatus) -> Result<(), WorkerError> {
        if !status.is_terminal() {
            return Err(WorkerError::InvalidTransition(format!(
                "{:?} is not a terminal status",
                status
            )));
        }
        let mut attempt = 0;
        loop {
            match self.publish(status).await {
                Ok(()) => {
                    debug!(key = %self.key, ?status, attempt, "Published terminal status");
                    return Ok(());
                }
                Err(e) if attempt + 1 < self.terminal_attempts => {
                    let delay = calc_exp_backoff(&self.cooldown, attempt);
                    warn!(
                        key = %self.key,
                        ?status,
                        error = %e,
                        "Terminal status publish failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
