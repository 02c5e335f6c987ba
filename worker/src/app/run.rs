//! Worker entry: wire the channel and store into a pipeline and run it once

use std::sync::Arc;

use tracing::{error, info};

use crate::app::options::{AppOptions, ChannelOptions};
use crate::artifacts::store::{create_object_store, supports_attributes};
use crate::artifacts::uploader::ArtifactUploader;
use crate::deploy::pipeline::{DeploymentPipeline, PipelineReport};
use crate::deploy::runner::BuildRunner;
use crate::errors::WorkerError;
use crate::mqtt::client::MqttChannel;
use crate::publish::channel::PublishChannel;
use crate::publish::memory::MemoryChannel;
use crate::publish::publisher::StatusPublisher;

/// Run the deployment described by `options`
///
/// Returns an error only when the worker could not be set up; once the
/// pipeline starts, failures are reported through the report.
pub async fn run(options: AppOptions) -> Result<PipelineReport, WorkerError> {
    info!(
        project_id = %options.job.project_id,
        deployment_id = %options.job.deployment_id,
        "Initializing deploy worker..."
    );

    let channel = create_channel(&options)?;
    let store = match create_object_store(&options.storage) {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to create artifact store: {}", e);
            if let Err(e) = channel.close().await {
                error!("Failed to close publish channel: {}", e);
            }
            return Err(e);
        }
    };

    let uploader = ArtifactUploader::new(store)
        .with_chunk_size(options.storage.upload_chunk_size)
        .with_content_type_attribute(supports_attributes(&options.storage))
        .with_retries(options.storage.upload_retries, options.upload_cooldown.clone());
    let status = StatusPublisher::new(channel.clone(), &options.job.deployment_id)
        .with_terminal_attempts(options.terminal_status_attempts);

    let report = DeploymentPipeline::new(options.job.clone(), channel, uploader)
        .with_runner(BuildRunner::new().with_timeout(options.build_timeout))
        .with_status_publisher(status)
        .with_options(options.pipeline.clone())
        .run()
        .await;
    Ok(report)
}

fn create_channel(options: &AppOptions) -> Result<Arc<dyn PublishChannel>, WorkerError> {
    match &options.channel {
        ChannelOptions::Mqtt {
            address,
            options: mqtt_options,
        } => {
            let client_id = format!("deploy-worker-{}", uuid::Uuid::new_v4());
            let channel = MqttChannel::connect(address, &client_id, mqtt_options)?;
            Ok(Arc::new(channel))
        }
        ChannelOptions::Memory => {
            info!("Using in-memory channel, logs and status stay in process");
            Ok(Arc::new(MemoryChannel::new()))
        }
    }
}
