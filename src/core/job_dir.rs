use crate::cloud::WorkerEndpoint;
use crate::core::job::JobStatus;
use crate::core::job_config::JobConfig;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.yaml";
const STATUS_FILE: &str = "status.txt";
const IPS_FILE: &str = "ips.json";
const LOGS_DIR: &str = "logs";
const JOB_LOG: &str = "job.log";

/// Per-job working directory: `<jobs_dir>/<id>/`.
#[derive(Debug, Clone)]
pub struct JobDirectory {
    root: PathBuf,
}

impl JobDirectory {
    pub fn create(jobs_dir: &Path, id: &str) -> Result<Self> {
        let dir = Self {
            root: jobs_dir.join(id),
        };
        std::fs::create_dir_all(dir.logs_dir())
            .with_context(|| format!("Failed to create job directory {:?}", dir.root))?;
        Ok(dir)
    }

    pub fn open(jobs_dir: &Path, id: &str) -> Result<Self> {
        let root = jobs_dir.join(id);
        if !root.is_dir() {
            anyhow::bail!("Job directory {:?} does not exist", root);
        }
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// Main job log, written by the session and the controller.
    pub fn job_log(&self) -> PathBuf {
        self.logs_dir().join(JOB_LOG)
    }

    pub fn save_config(&self, config: &JobConfig) -> Result<()> {
        config.save(&self.config_path())?;
        Ok(())
    }

    pub fn load_config(&self) -> Result<JobConfig> {
        Ok(JobConfig::load(&self.config_path())?)
    }

    /// Human-readable status marker alongside the registry record.
    pub fn write_status(&self, status: JobStatus) -> Result<()> {
        std::fs::write(self.root.join(STATUS_FILE), status.to_string())
            .with_context(|| format!("Failed to write status marker in {:?}", self.root))
    }

    pub fn read_status(&self) -> Option<String> {
        std::fs::read_to_string(self.root.join(STATUS_FILE))
            .ok()
            .map(|s| s.trim().to_string())
    }

    pub fn write_ips(&self, endpoints: &[WorkerEndpoint]) -> Result<()> {
        let text = serde_json::to_string_pretty(endpoints)?;
        std::fs::write(self.root.join(IPS_FILE), text)
            .with_context(|| format!("Failed to write worker addresses in {:?}", self.root))
    }

    pub fn read_ips(&self) -> Result<Vec<WorkerEndpoint>> {
        let path = self.root.join(IPS_FILE);
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {:?}", path))
    }

    pub fn remove(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.root)
            .with_context(|| format!("Failed to remove job directory {:?}", self.root))
    }
}
