//! Application configuration options

use std::time::Duration;

use crate::app::settings::{Settings, StorageSettings};
use crate::deploy::pipeline::PipelineOptions;
use crate::models::deployment::DeploymentJob;
use crate::mqtt::client::{MqttAddress, MqttChannelOptions};
use crate::utils::CooldownOptions;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// The deployment to run
    pub job: DeploymentJob,

    /// Pipeline behaviour
    pub pipeline: PipelineOptions,

    /// Kill the build after this long
    pub build_timeout: Option<Duration>,

    /// Log/status channel
    pub channel: ChannelOptions,

    /// Artifact storage
    pub storage: StorageSettings,

    /// Backoff between upload retries
    pub upload_cooldown: CooldownOptions,

    /// Attempts for the terminal status, the first one included
    pub terminal_status_attempts: u32,
}

/// Which channel carries logs and status
#[derive(Debug, Clone)]
pub enum ChannelOptions {
    Mqtt {
        address: MqttAddress,
        options: MqttChannelOptions,
    },

    /// Keep everything in process (dry runs)
    Memory,
}

impl AppOptions {
    /// Derive options from validated settings
    pub fn from_settings(settings: &Settings) -> Self {
        let channel = match settings.channel.channel_type.as_str() {
            "memory" => ChannelOptions::Memory,
            _ => ChannelOptions::Mqtt {
                address: settings.mqtt_broker.address(),
                options: MqttChannelOptions {
                    flush_timeout: Duration::from_secs(settings.mqtt_broker.flush_timeout_secs),
                    max_packet_size: settings.mqtt_broker.max_packet_size,
                    ..Default::default()
                },
            },
        };

        Self {
            job: settings.job(),
            pipeline: PipelineOptions {
                output_dir: settings.build.output_dir.clone(),
                stderr_policy: settings.build.stderr_policy,
            },
            build_timeout: settings.build_timeout(),
            channel,
            storage: settings.storage.clone(),
            upload_cooldown: CooldownOptions::default(),
            terminal_status_attempts: settings.publish.terminal_status_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::settings::StderrPolicy;

    #[test]
    fn test_from_settings() {
        let mut settings = Settings::default();
        settings.job.project_id = "p1".to_string();
        settings.job.deployment_id = "d1".to_string();
        settings.mqtt_broker.host = "broker.local".to_string();
        settings.mqtt_broker.flush_timeout_secs = 3;
        settings.build.timeout_secs = Some(60);
        settings.build.stderr_policy = StderrPolicy::ExitCode;

        let options = AppOptions::from_settings(&settings);

        assert_eq!(options.job.deployment_id, "d1");
        assert_eq!(options.build_timeout, Some(Duration::from_secs(60)));
        assert_eq!(options.pipeline.stderr_policy, StderrPolicy::ExitCode);
        assert_eq!(options.terminal_status_attempts, 2);
        match options.channel {
            ChannelOptions::Mqtt { address, options } => {
                assert_eq!(address.host, "broker.local");
                assert_eq!(options.flush_timeout, Duration::from_secs(3));
            }
            ChannelOptions::Memory => panic!("expected an MQTT channel"),
        }
    }

    #[test]
    fn test_memory_channel() {
        let mut settings = Settings::default();
        settings.channel.channel_type = "memory".to_string();
        assert!(matches!(
            AppOptions::from_settings(&settings).channel,
            ChannelOptions::Memory
        ));
    }
}
