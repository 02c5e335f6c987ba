//! Deployment pipeline: build, stream output, upload artifacts, report status

use std::path::PathBuf;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{error, info, warn};

use crate::app::settings::StderrPolicy;
use crate::artifacts::scanner::ArtifactScanner;
use crate::artifacts::uploader::ArtifactUploader;
use crate::artifacts::ArtifactRecord;
use crate::deploy::fsm::{PipelineEvent, PipelineFsm, PipelineState};
use crate::deploy::runner::{
    BuildEvent, BuildOutcome, BuildRunner, OutputStream, GENERIC_FAILURE_EXIT_CODE,
};
use crate::errors::WorkerError;
use crate::models::deployment::{DeploymentJob, DeploymentStatus};
use crate::publish::channel::PublishChannel;
use crate::publish::publisher::{LogPublisher, StatusPublisher};

/// Pipeline options
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Build output root, relative to the job's source dir
    pub output_dir: PathBuf,

    pub stderr_policy: StderrPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("dist"),
            stderr_policy: StderrPolicy::default(),
        }
    }
}

/// Result of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub state: PipelineState,
    pub status: DeploymentStatus,

    /// Process exit code the worker should terminate with
    pub exit_code: i32,

    /// Number of artifacts stored
    pub uploaded: usize,

    /// Failure reason, if any
    pub error: Option<String>,
}

/// Runs one deployment job end to end
///
/// The pipeline owns its channel and closes it exactly once, after the
/// terminal status was published.
pub struct DeploymentPipeline {
    job: DeploymentJob,
    channel: Arc<dyn PublishChannel>,
    logs: LogPublisher,
    status: StatusPublisher,
    runner: BuildRunner,
    uploader: ArtifactUploader,
    options: PipelineOptions,
}

impl DeploymentPipeline {
    pub fn new(
        job: DeploymentJob,
        channel: Arc<dyn PublishChannel>,
        uploader: ArtifactUploader,
    ) -> Self {
        let logs = LogPublisher::new(channel.clone(), &job.deployment_id, &job.project_id);
        let status = StatusPublisher::new(channel.clone(), &job.deployment_id);
        Self {
            job,
            channel,
            logs,
            status,
            runner: BuildRunner::new(),
            uploader,
            options: PipelineOptions::default(),
        }
    }

    pub fn with_runner(mut self, runner: BuildRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_status_publisher(mut self, status: StatusPublisher) -> Self {
        self.status = status;
        self
    }

    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.options = options;
        self
    }

    /// Run the job to a terminal state
    pub async fn run(self) -> PipelineReport {
        info!(
            project_id = %self.job.project_id,
            deployment_id = %self.job.deployment_id,
            "Starting deployment"
        );

        let mut fsm = PipelineFsm::new();
        let mut uploaded = 0;
        let exit_code = match self.execute(&mut fsm, &mut uploaded).await {
            Ok(exit_code) => exit_code,
            Err(e) => {
                error!(error = %e, "Deployment pipeline error");
                fail(&mut fsm, e.to_string());
                GENERIC_FAILURE_EXIT_CODE
            }
        };

        let state = fsm.state();
        let reason = fsm.error().map(str::to_string);
        match state {
            PipelineState::Succeeded => {
                self.logs.publish_or_warn("Done").await;
            }
            _ => {
                let reason = reason.as_deref().unwrap_or("unknown error");
                self.logs
                    .publish_or_warn(&format!("Deployment failed: {}", reason))
                    .await;
            }
        }

        let status = state.status();
        if let Err(e) = self.status.publish_terminal(status).await {
            error!(error = %e, ?status, "Failed to publish terminal status");
        }
        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "Failed to close publish channel");
        }

        info!(?state, exit_code, uploaded, "Deployment finished");
        PipelineReport {
            state,
            status,
            exit_code,
            uploaded,
            error: reason,
        }
    }

    /// Drive the FSM to a terminal state and return the exit code
    async fn execute(
        &self,
        fsm: &mut PipelineFsm,
        uploaded: &mut usize,
    ) -> Result<i32, WorkerError> {
        if let Err(e) = self.status.publish(DeploymentStatus::InProgress).await {
            warn!(error = %e, "Failed to publish IN_PROGRESS status");
        }
        fsm.process(PipelineEvent::BuildStarted)?;
        self.logs.publish_or_warn("Build Started...").await;

        let outcome = self.build(fsm).await?;

        if fsm.state() == PipelineState::Failed {
            // Stderr tripped the policy; a clean exit still has to report failure.
            return Ok(match outcome {
                BuildOutcome::Success => GENERIC_FAILURE_EXIT_CODE,
                outcome => outcome.exit_code(),
            });
        }
        if !outcome.is_success() {
            warn!(outcome = %outcome.describe(), "Build failed");
            fsm.process(PipelineEvent::BuildFailed(outcome.describe()))?;
            return Ok(outcome.exit_code());
        }

        fsm.process(PipelineEvent::BuildSucceeded)?;
        self.logs.publish_or_warn("Build Complete").await;

        match self.upload_all(uploaded).await {
            Ok(()) => {
                fsm.process(PipelineEvent::UploadsCompleted)?;
                Ok(0)
            }
            Err(e) => {
                error!(error = %e, uploaded = *uploaded, "Artifact upload failed");
                fsm.process(PipelineEvent::UploadFailed(e.to_string()))?;
                Ok(GENERIC_FAILURE_EXIT_CODE)
            }
        }
    }

    /// Forward build output until the process exits
    async fn build(&self, fsm: &mut PipelineFsm) -> Result<BuildOutcome, WorkerError> {
        let mut process = self.runner.run(&self.job.source_dir, &self.job.build_command);
        while let Some(event) = process.next_event().await {
            match event {
                BuildEvent::Output(chunk) => {
                    self.logs.publish_or_warn(&chunk.line).await;
                    if chunk.stream == OutputStream::Stderr
                        && self.options.stderr_policy == StderrPolicy::FailBuild
                        && fsm.state() == PipelineState::Building
                    {
                        warn!(line = %chunk.line, "Build wrote to stderr");
                        fsm.process(PipelineEvent::BuildFailed(format!(
                            "build wrote to stderr: {}",
                            chunk.line
                        )))?;
                    }
                }
                BuildEvent::Exited(outcome) => {
                    info!(outcome = %outcome.describe(), "Build exited");
                    return Ok(outcome);
                }
            }
        }
        Err(WorkerError::Internal(
            "build process ended without an outcome".to_string(),
        ))
    }

    /// Upload every file under the output root, in scan order, stopping at
    /// the first failure
    async fn upload_all(&self, uploaded: &mut usize) -> Result<(), WorkerError> {
        let output_root = self.job.source_dir.join(&self.options.output_dir);
        let mut files = Box::pin(ArtifactScanner::new(output_root.clone()).into_stream());

        while let Some(relative) = files.next().await {
            let relative = relative?;
            let record = ArtifactRecord::new(&output_root, &relative, &self.job.project_id);
            let display = relative.to_string_lossy().replace('\\', "/");

            self.logs
                .publish_or_warn(&format!("Uploading {}", display))
                .await;
            self.uploader.upload_record(&record).await?;
            *uploaded += 1;
            self.logs
                .publish_or_warn(&format!("Uploaded {}", display))
                .await;
        }
        Ok(())
    }
}

/// Force the FSM into `Failed` from whatever non-terminal state it is in
fn fail(fsm: &mut PipelineFsm, reason: String) {
    if fsm.state().is_terminal() {
        return;
    }
    let event = match fsm.state() {
        PipelineState::Uploading => PipelineEvent::UploadFailed(reason),
        _ => PipelineEvent::BuildFailed(reason),
    };
    if let Err(e) = fsm.process(event) {
        error!(error = %e, "Unable to mark deployment as failed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::models::deployment::BuildCommand;
    use crate::publish::memory::MemoryChannel;
    use crate::utils::CooldownOptions;
    use object_store::memory::InMemory;
    use object_store::ObjectStore;
    use std::time::Duration;

    fn job(source_dir: &std::path::Path, script: &str) -> DeploymentJob {
        DeploymentJob {
            project_id: "p1".to_string(),
            deployment_id: "d1".to_string(),
            source_dir: source_dir.to_path_buf(),
            build_command: BuildCommand::Shell(script.to_string()),
        }
    }

    fn pipeline(
        job: DeploymentJob,
        channel: Arc<MemoryChannel>,
        store: Arc<InMemory>,
    ) -> DeploymentPipeline {
        let status = StatusPublisher::new(channel.clone(), &job.deployment_id).with_cooldown(
            CooldownOptions {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                multiplier: 2.0,
            },
        );
        DeploymentPipeline::new(job, channel, ArtifactUploader::new(store))
            .with_status_publisher(status)
    }

    async fn stored_keys(store: &InMemory) -> Vec<String> {
        let mut keys: Vec<String> = store
            .list(None)
            .map(|meta| meta.unwrap().location.to_string())
            .collect()
            .await;
        keys.sort();
        keys
    }

    #[tokio::test]
    async fn test_missing_output_root_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = Arc::new(MemoryChannel::new());
        let store = Arc::new(InMemory::new());

        let report = pipeline(job(tmp.path(), "echo built"), channel.clone(), store.clone())
            .run()
            .await;

        assert_eq!(report.state, PipelineState::Failed);
        assert_eq!(report.exit_code, GENERIC_FAILURE_EXIT_CODE);
        assert_eq!(report.uploaded, 0);
        assert_eq!(channel.payloads("status:d1").last().unwrap(), r#"{"status":"FAIL"}"#);
    }

    #[tokio::test]
    async fn test_stderr_fails_by_default_but_not_under_exit_code_policy() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("dist")).unwrap();
        std::fs::write(tmp.path().join("dist/index.html"), "<html></html>").unwrap();
        let script = "echo deprecated >&2";

        let channel = Arc::new(MemoryChannel::new());
        let store = Arc::new(InMemory::new());
        let report = pipeline(job(tmp.path(), script), channel.clone(), store.clone())
            .run()
            .await;
        assert_eq!(report.status, DeploymentStatus::Fail);
        assert_eq!(report.exit_code, 1);
        assert!(stored_keys(&store).await.is_empty());

        let channel = Arc::new(MemoryChannel::new());
        let store = Arc::new(InMemory::new());
        let report = pipeline(job(tmp.path(), script), channel.clone(), store.clone())
            .with_options(PipelineOptions {
                stderr_policy: StderrPolicy::ExitCode,
                ..Default::default()
            })
            .run()
            .await;
        assert_eq!(report.status, DeploymentStatus::Ready);
        assert_eq!(stored_keys(&store).await, vec!["__outputs/p1/index.html"]);
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_127() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = Arc::new(MemoryChannel::new());
        let mut job = job(tmp.path(), "true");
        job.source_dir = tmp.path().join("missing");

        let report = pipeline(job, channel.clone(), Arc::new(InMemory::new()))
            .run()
            .await;

        assert_eq!(report.state, PipelineState::Failed);
        assert_eq!(report.exit_code, 127);
        assert!(report
            .error
            .as_deref()
            .unwrap()
            .starts_with("build could not start"));
        assert_eq!(channel.close_count(), 1);
    }

    #[tokio::test]
    async fn test_build_exit_127_is_not_a_spawn_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let channel = Arc::new(MemoryChannel::new());

        let report = pipeline(
            job(tmp.path(), "exit 127"),
            channel.clone(),
            Arc::new(InMemory::new()),
        )
        .run()
        .await;

        assert_eq!(report.exit_code, 127);
        assert_eq!(report.error.as_deref(), Some("build exited with code 127"));
    }

    #[tokio::test]
    async fn test_terminal_status_retried_once() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("dist")).unwrap();
        let channel = Arc::new(MemoryChannel::new());
        channel.fail_payloads_containing("READY", 1);

        let report = pipeline(job(tmp.path(), "true"), channel.clone(), Arc::new(InMemory::new()))
            .run()
            .await;

        assert_eq!(report.status, DeploymentStatus::Ready);
        assert_eq!(
            channel.payloads("status:d1"),
            vec![r#"{"status":"IN_PROGRESS"}"#, r#"{"status":"READY"}"#]
        );
    }
}
