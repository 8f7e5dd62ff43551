use crate::cloud::{CloudControl, PodSpec};
use crate::core::controller::{JobController, JobOutcome, RunSettings};
use crate::core::job::{JobRecord, JobStatus};
use crate::core::job_config::JobConfig;
use crate::core::job_dir::JobDirectory;
use crate::core::registry::RegistryHandle;
use crate::core::session::{self, ProcessSupervisor};
use crate::core::store::MetadataStore;
use crate::core::JobId;
use crate::env::quote;
use crate::utils::timestamp_suffix;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One row of `jobman list`.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub record: JobRecord,
    pub name: Option<String>,
    pub accelerator: Option<String>,
    pub zone: Option<String>,
    pub external_ip: Option<String>,
}

impl JobSummary {
    pub fn started(&self) -> DateTime<Local> {
        self.record.started_at.unwrap_or(self.record.created_at)
    }
}

/// Job lifecycle API used by the command line: registry bookkeeping,
/// background sessions, and the controller.
pub struct JobMan {
    jobs_dir: PathBuf,
    registry: RegistryHandle,
    supervisor: Arc<dyn ProcessSupervisor>,
    cloud: Arc<dyn CloudControl>,
    settings: RunSettings,
    launcher: String,
}

impl JobMan {
    /// Must be called inside a tokio runtime.
    pub fn new(
        jobs_dir: impl Into<PathBuf>,
        cloud: Arc<dyn CloudControl>,
        supervisor: Arc<dyn ProcessSupervisor>,
        settings: RunSettings,
    ) -> Self {
        let jobs_dir = jobs_dir.into();
        let launcher = default_launcher(&jobs_dir);
        Self {
            registry: RegistryHandle::spawn(MetadataStore::new(&jobs_dir)),
            jobs_dir,
            supervisor,
            cloud,
            settings,
            launcher,
        }
    }

    /// Overrides the command prefix used to re-enter jobman inside a session.
    pub fn with_launcher(mut self, launcher: impl Into<String>) -> Self {
        self.launcher = launcher.into();
        self
    }

    /// Command prefix that re-enters jobman inside a background session.
    pub fn launcher(&self) -> &str {
        &self.launcher
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    /// Validates and registers a new job from a config file.
    pub async fn create(&self, config_path: &Path) -> Result<JobId> {
        let config = JobConfig::load(config_path)?;
        self.create_from(config).await
    }

    pub async fn create_from(&self, mut config: JobConfig) -> Result<JobId> {
        config.validate()?;

        let id = self.registry.allocate_id().await?;
        let dir = JobDirectory::create(&self.jobs_dir, &id)?;

        let ts = timestamp_suffix(Local::now());
        config.job.id = Some(id.clone());
        config.job.dir = Some(dir.path().to_path_buf());
        config.job.name = format!("{}_{}", config.job.name, ts);
        // TPU names only allow lowercase letters, digits, and hyphens.
        config.tpu.name = format!("{}-{}", config.tpu.name, ts.replace('_', "-")).to_lowercase();

        let registered = async {
            dir.save_config(&config)?;
            dir.write_status(JobStatus::Init)?;
            self.registry.upsert(JobRecord::new(id.clone())).await
        }
        .await;
        if let Err(e) = registered {
            if let Err(cleanup) = dir.remove() {
                tracing::warn!("Failed to clean up job directory {:?}: {:#}", dir.path(), cleanup);
            }
            return Err(e.context(format!("Failed to register job {id}")));
        }

        tracing::info!("Created job {}. See info at {:?}", id, dir.path());
        Ok(id)
    }

    /// Launches `jobman run <id>` in a new background session.
    pub async fn start(&self, id: &str) -> Result<()> {
        if self.registry.get(id).await?.is_none() {
            bail!("Job {id} not found");
        }
        let dir = JobDirectory::open(&self.jobs_dir, id)?;
        if !self.blocking(|s| s.available()).await? {
            bail!("{} is not available on this host", self.supervisor.backend());
        }

        let handle = session::session_name(id);
        let probe = handle.clone();
        if self.blocking(move |s| s.is_alive(&probe)).await? {
            bail!("Job {id} is already running in session {handle}");
        }

        let log_file = dir.job_log();
        let command = format!(
            "{} run {} 2>&1 | tee -a {}",
            self.launcher,
            id,
            quote(&log_file.to_string_lossy())
        );
        let target = handle.clone();
        self.blocking(move |s| s.spawn(&target, &command))
            .await?
            .with_context(|| format!("Failed to start session for job {id}"))?;

        let backend = self.supervisor.backend().to_string();
        let session_name = handle.clone();
        let log = log_file.clone();
        self.registry
            .update(id, move |r| {
                r.mark_running(session_name, backend, log);
                r.last_seen = Some(Local::now());
            })
            .await?;
        dir.write_status(JobStatus::Running)?;

        tracing::info!("Job {} started. See logs at {:?}", id, log_file);
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        tracing::info!("Resuming job {}", id);
        self.start(id).await
    }

    /// Returns true if a live job was stopped. Remote commands already running
    /// on workers are not killed.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let Some(record) = self.registry.get(id).await? else {
            tracing::warn!("No metadata found for job {}", id);
            return Ok(false);
        };

        if !self.blocking(|s| s.available()).await? {
            return self.cancel_by_log_holders(id).await;
        }

        let Some(handle) = record.session_name else {
            tracing::error!("No session recorded for job {}", id);
            return Ok(false);
        };
        let probe = handle.clone();
        if !self.blocking(move |s| s.is_alive(&probe)).await? {
            tracing::warn!("Session {} does not exist. Nothing to cancel", handle);
            return Ok(false);
        }
        let target = handle.clone();
        if let Err(e) = self.blocking(move |s| s.terminate(&target)).await? {
            tracing::error!("Failed to kill session {}: {:#}", handle, e);
            return Ok(false);
        }

        self.finish(id, JobStatus::Failed).await?;
        tracing::info!("Cancelled job {} by killing session {}", id, handle);
        Ok(true)
    }

    async fn cancel_by_log_holders(&self, id: &str) -> Result<bool> {
        tracing::warn!(
            "{} unavailable, cancelling job {} through its log files",
            self.supervisor.backend(),
            id
        );
        let dir = JobDirectory::open(&self.jobs_dir, id)?;
        let logs_dir = dir.logs_dir();
        let signalled =
            tokio::task::spawn_blocking(move || session::signal_log_holders(&logs_dir))
                .await
                .context("Log holder search panicked")??;
        if signalled == 0 {
            tracing::warn!("No running processes found for job {}", id);
            return Ok(false);
        }
        self.finish(id, JobStatus::Cancelled).await?;
        Ok(true)
    }

    /// Cancels the job, tears down its pod, then removes its directory and
    /// record. The record is kept if the directory cannot be removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        tracing::info!("Deleting job {}", id);

        match self.cancel(id).await {
            Ok(cancelled) => tracing::debug!("cancel returned {}", cancelled),
            Err(e) => tracing::warn!("Failed to cancel job {} before deletion: {:#}", id, e),
        }

        let path = self.jobs_dir.join(id);
        let config_path = path.join("config.yaml");
        if config_path.exists() {
            match JobConfig::load(&config_path) {
                Ok(config) => {
                    let pod = PodSpec::from_config(&config);
                    if let Err(e) = self.cloud.delete_pod(&pod).await {
                        tracing::warn!("Failed to delete TPU for job {}: {:#}", id, e);
                    }
                }
                Err(e) => tracing::warn!("Cannot read config for job {}: {}", id, e),
            }
        } else {
            tracing::error!("Job {} config not found at {:?}", id, config_path);
        }

        let had_dir = path.exists();
        if had_dir {
            if let Err(e) = std::fs::remove_dir_all(&path) {
                tracing::warn!(
                    "Failed to delete job directory {:?}: {}. Keeping registry entry",
                    path,
                    e
                );
                return Ok(false);
            }
            tracing::info!("Deleted job directory {:?}", path);
        }

        let had_record = self.registry.remove(id).await?.is_some();
        Ok(had_dir || had_record)
    }

    /// All jobs ordered by id, with stale RUNNING records marked DEAD.
    pub async fn list(&self) -> Result<Vec<JobSummary>> {
        let mut summaries = Vec::new();
        for record in self.registry.list().await? {
            let record = self.refresh(record).await?;
            summaries.push(self.summarize(record));
        }
        Ok(summaries)
    }

    pub async fn status(&self, id: &str) -> Result<Option<JobSummary>> {
        match self.registry.get(id).await? {
            Some(record) => {
                let record = self.refresh(record).await?;
                Ok(Some(self.summarize(record)))
            }
            None => Ok(None),
        }
    }

    /// Runs a job in the foreground. This is what the background session
    /// executes. With `command_only`, only the workload phase runs and the
    /// recorded status is left untouched.
    pub async fn run(&self, id: &str, command_only: bool) -> Result<JobOutcome> {
        let dir = JobDirectory::open(&self.jobs_dir, id)?;
        let config = dir.load_config()?;
        let controller = JobController::new(config, dir, self.cloud.clone(), &self.settings)?;

        if command_only {
            return Ok(if controller.run_command_only().await {
                JobOutcome::Done
            } else {
                JobOutcome::Failed
            });
        }

        let outcome = controller
            .run_until(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            })
            .await;
        let status = match outcome {
            JobOutcome::Done => JobStatus::Idle,
            JobOutcome::Failed | JobOutcome::Interrupted => JobStatus::Failed,
        };
        self.finish(id, status).await?;
        Ok(outcome)
    }

    /// Runs a supervisor call off the async workers; backends such as tmux
    /// shell out and sleep.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&dyn ProcessSupervisor) -> T + Send + 'static,
        T: Send + 'static,
    {
        let supervisor = self.supervisor.clone();
        tokio::task::spawn_blocking(move || f(supervisor.as_ref()))
            .await
            .context("Session backend call panicked")
    }

    async fn finish(&self, id: &str, status: JobStatus) -> Result<()> {
        self.registry
            .update(id, move |r| {
                r.mark_finished(status);
                r.last_seen = Some(Local::now());
            })
            .await?;
        if let Ok(dir) = JobDirectory::open(&self.jobs_dir, id) {
            dir.write_status(status)?;
        }
        Ok(())
    }

    async fn refresh(&self, record: JobRecord) -> Result<JobRecord> {
        if record.status != JobStatus::Running || !self.blocking(|s| s.available()).await? {
            return Ok(record);
        }
        let alive = match record.session_name.clone() {
            Some(handle) => self.blocking(move |s| s.is_alive(&handle)).await?,
            None => false,
        };

        let updated = self
            .registry
            .update(&record.id, move |r| {
                if alive {
                    r.last_seen = Some(Local::now());
                } else {
                    r.mark_finished(JobStatus::Dead);
                }
            })
            .await?;
        if !alive {
            tracing::warn!("Job {} has no live session, marking DEAD", record.id);
            if let Ok(dir) = JobDirectory::open(&self.jobs_dir, &record.id) {
                dir.write_status(JobStatus::Dead)?;
            }
        }
        Ok(updated.unwrap_or(record))
    }

    fn summarize(&self, record: JobRecord) -> JobSummary {
        let dir = JobDirectory::open(&self.jobs_dir, &record.id).ok();
        let config = dir.as_ref().and_then(|d| d.load_config().ok());
        let external_ip = dir
            .as_ref()
            .and_then(|d| d.read_ips().ok())
            .and_then(|ips| ips.into_iter().find(|e| e.index == 0))
            .and_then(|e| e.external_ip);

        JobSummary {
            name: config.as_ref().map(|c| c.job.name.clone()),
            accelerator: config.as_ref().map(|c| c.tpu.accelerator.clone()),
            zone: config.as_ref().map(|c| c.tpu.zone.clone()),
            external_ip,
            record,
        }
    }
}

fn default_launcher(jobs_dir: &Path) -> String {
    let exe = std::env::current_exe()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "jobman".to_string());
    let jobs_dir = std::fs::canonicalize(jobs_dir).unwrap_or_else(|_| jobs_dir.to_path_buf());
    format!(
        "{} --jobs-dir {}",
        quote(&exe),
        quote(&jobs_dir.to_string_lossy())
    )
}
