use crate::cloud::{CloudControl, PodSpec};
use crate::core::bootstrap;
use crate::core::job_config::{ConfigError, JobConfig};
use crate::core::job_dir::JobDirectory;
use crate::core::pod::PodController;
use crate::core::remote::{LogSink, RemoteExecutor};
use crate::env::{self, Environment};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use strum::Display;

/// Timing knobs for one job run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub poll_interval: Duration,
    pub command_timeout: Option<Duration>,
    /// Pause before restarting after a failed attempt in loop mode.
    pub loop_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPhase {
    Init,
    ResourcePending,
    Provisioning,
    Executing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum JobOutcome {
    Done,
    Failed,
    /// Stopped by the user; never retried.
    Interrupted,
}

/// Sequences acquire -> provision -> execute for one job.
pub struct JobController {
    config: JobConfig,
    job_id: String,
    job_dir: JobDirectory,
    pods: PodController,
    executor: RemoteExecutor,
    environment: Arc<dyn Environment>,
    loop_delay: Duration,
}

impl JobController {
    pub fn new(
        config: JobConfig,
        job_dir: JobDirectory,
        cloud: Arc<dyn CloudControl>,
        settings: &RunSettings,
    ) -> Result<Self, ConfigError> {
        let num_workers = config.num_workers()?;
        let environment = env::from_config(config.environment()?);
        let pod = PodSpec::from_config(&config);
        let job_id = config.job.id.clone().unwrap_or_else(|| config.job.name.clone());

        Ok(Self {
            pods: PodController::new(
                cloud.clone(),
                pod.clone(),
                job_dir.clone(),
                settings.poll_interval,
            ),
            executor: RemoteExecutor::new(cloud, pod, num_workers, settings.command_timeout),
            environment,
            loop_delay: settings.loop_delay,
            job_id,
            job_dir,
            config,
        })
    }

    fn sink(&self, phase: &str) -> LogSink {
        LogSink::new(self.job_dir.logs_dir(), phase)
    }

    fn enter(&self, phase: JobPhase) {
        tracing::info!("Job {}: {}", self.job_id, phase);
    }

    /// One pass through the state machine. Returns `Done` or `Failed`.
    async fn attempt(&self) -> JobPhase {
        self.enter(JobPhase::ResourcePending);
        if !self.pods.ensure_ready().await {
            tracing::error!("TPU allocation failed");
            return JobPhase::Failed;
        }

        self.enter(JobPhase::Provisioning);
        let workers = self.executor.all_workers();
        if !bootstrap::setup_identities(&self.executor, &workers, &self.config.ssh, &self.sink("ssh"))
            .await
        {
            tracing::error!("SSH identity setup failed");
            return JobPhase::Failed;
        }
        if !bootstrap::mount_filesystem(
            &self.executor,
            &workers,
            self.config.gcsfuse.as_ref(),
            &self.sink("gcsfuse"),
        )
        .await
        {
            tracing::error!("Bucket mount failed");
            return JobPhase::Failed;
        }
        let kind = self.environment.kind().to_string();
        if !self
            .environment
            .setup(&self.executor, &workers, &self.sink(&kind))
            .await
        {
            tracing::error!("{} environment setup failed", kind);
            return JobPhase::Failed;
        }

        self.enter(JobPhase::Executing);
        if !self.execute().await {
            return JobPhase::Failed;
        }
        JobPhase::Done
    }

    async fn execute(&self) -> bool {
        let command = self.environment.wrap(&self.config.command.cmd);
        tracing::debug!("Executing command: {}", command);
        self.executor
            .run_selection(&self.config.command.workers, &command, &self.sink("main_command"))
            .await
    }

    /// Runs the full sequence, restarting from resource acquisition after a
    /// failure when the job loops.
    pub async fn run(&self) -> JobOutcome {
        self.enter(JobPhase::Init);
        let mut attempt = 1u64;
        loop {
            match self.attempt().await {
                JobPhase::Done => {
                    self.enter(JobPhase::Done);
                    return JobOutcome::Done;
                }
                _ if self.config.job.loop_on_failure => {
                    tracing::warn!(
                        "Job {}: attempt {} failed, restarting in {}s",
                        self.job_id,
                        attempt,
                        self.loop_delay.as_secs()
                    );
                    attempt += 1;
                    tokio::time::sleep(self.loop_delay).await;
                }
                _ => {
                    self.enter(JobPhase::Failed);
                    return JobOutcome::Failed;
                }
            }
        }
    }

    /// Like [`JobController::run`], but resolves to `Interrupted` as soon as
    /// `interrupt` completes.
    pub async fn run_until<F>(&self, interrupt: F) -> JobOutcome
    where
        F: Future,
    {
        tokio::select! {
            outcome = self.run() => outcome,
            _ = interrupt => {
                tracing::warn!("Job {} interrupted by user", self.job_id);
                JobOutcome::Interrupted
            }
        }
    }

    /// Executes only the workload against an already-provisioned pod.
    pub async fn run_command_only(&self) -> bool {
        self.enter(JobPhase::Executing);
        self.execute().await
    }
}
