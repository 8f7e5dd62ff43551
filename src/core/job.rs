use crate::core::JobId;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::{Display, EnumIter};

/// Lifecycle status persisted in the registry.
#[derive(Debug, Deserialize, Serialize, PartialEq, Eq, Clone, Copy, Display, EnumIter)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[strum(to_string = "INIT")]
    Init,
    #[strum(to_string = "RUNNING")]
    Running,
    /// The controller finished and the workload stopped.
    #[strum(to_string = "IDLE")]
    Idle,
    #[strum(to_string = "FAILED")]
    Failed,
    /// Recorded as running but no live session backs it.
    #[strum(to_string = "DEAD")]
    Dead,
    #[strum(to_string = "CANCELLED")]
    Cancelled,
}

impl JobStatus {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Idle | Self::Failed | Self::Dead | Self::Cancelled)
    }
}

/// One entry of the job registry.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct JobRecord {
    pub id: JobId,
    pub created_at: DateTime<Local>,
    pub status: JobStatus,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Local>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Local>>,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Last time a status query observed the session alive.
    #[serde(default)]
    pub last_seen: Option<DateTime<Local>>,
}

impl JobRecord {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            created_at: Local::now(),
            status: JobStatus::Init,
            session_name: None,
            backend: None,
            started_at: None,
            ended_at: None,
            log_file: None,
            last_seen: None,
        }
    }

    pub fn mark_running(&mut self, session_name: String, backend: String, log_file: PathBuf) {
        self.status = JobStatus::Running;
        self.session_name = Some(session_name);
        self.backend = Some(backend);
        self.started_at = Some(Local::now());
        self.ended_at = None;
        self.log_file = Some(log_file);
    }

    pub fn mark_finished(&mut self, status: JobStatus) {
        self.status = status;
        self.ended_at = Some(Local::now());
    }
}
