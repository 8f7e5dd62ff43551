//! Cloud-control seam: everything jobman needs from the accelerator provider.

pub mod gcloud;

use crate::core::job_config::{AllocationMode, JobConfig, PricingClass};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use strum::Display;

pub use gcloud::GcloudCli;

/// Identity and creation parameters of one pod.
#[derive(Debug, Clone, PartialEq)]
pub struct PodSpec {
    pub name: String,
    pub zone: String,
    pub accelerator: String,
    pub version: String,
    pub pricing: PricingClass,
    pub mode: AllocationMode,
    pub tags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
    pub startup_script: Option<String>,
    /// Key used by the provider CLI to reach workers.
    pub ssh_key_file: PathBuf,
}

impl PodSpec {
    pub fn from_config(config: &JobConfig) -> Self {
        Self {
            name: config.tpu.name.clone(),
            zone: config.tpu.zone.clone(),
            accelerator: config.tpu.accelerator.clone(),
            version: config.tpu.version.clone(),
            pricing: config.tpu.pricing,
            mode: config.tpu.allocation_mode,
            tags: config.tpu.tags.clone(),
            metadata: config.tpu.metadata.clone(),
            startup_script: config.tpu.startup_script.clone(),
            ssh_key_file: crate::config::expand_home(&config.ssh.private_key),
        }
    }
}

/// Pod lifecycle state as reported by the provider. Never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PodState {
    Ready,
    Active,
    Creating,
    Provisioning,
    Accepted,
    WaitingForResources,
    Preempted,
    Terminated,
    Stopped,
    Suspended,
    Failed,
    Deleting,
    Unspecified,
    NotFound,
    /// The query itself failed or returned something unrecognised.
    Unknown,
}

impl PodState {
    /// Parses the provider's `value(state)` output. Empty output means the
    /// resource does not exist.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let raw = raw.strip_prefix("state=").unwrap_or(raw);
        match raw.to_ascii_uppercase().replace(' ', "_").as_str() {
            "" | "NOT_FOUND" => Self::NotFound,
            "READY" => Self::Ready,
            "ACTIVE" => Self::Active,
            "CREATING" => Self::Creating,
            "PROVISIONING" => Self::Provisioning,
            "ACCEPTED" => Self::Accepted,
            "WAITING_FOR_RESOURCES" => Self::WaitingForResources,
            "PREEMPTED" => Self::Preempted,
            "TERMINATED" => Self::Terminated,
            "STOPPED" => Self::Stopped,
            "SUSPENDED" => Self::Suspended,
            "FAILED" => Self::Failed,
            "DELETING" => Self::Deleting,
            "UNSPECIFIED" | "STATE_UNSPECIFIED" => Self::Unspecified,
            _ => Self::Unknown,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready | Self::Active)
    }

    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Provisioning | Self::Accepted | Self::WaitingForResources
        )
    }

    /// The pod exists but can never become ready again.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            Self::Preempted | Self::Terminated | Self::Stopped | Self::Suspended
        )
    }

    /// Ends a readiness wait with failure.
    pub fn is_terminal_bad(&self) -> bool {
        matches!(
            self,
            Self::Failed | Self::Deleting | Self::Unspecified | Self::NotFound
        )
    }
}

/// Network addresses of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEndpoint {
    #[serde(rename = "worker")]
    pub index: usize,
    pub internal_ip: Option<String>,
    pub external_ip: Option<String>,
}

/// Operations on accelerator pods and their workers.
///
/// Every call is scoped by pod name, zone, and (where relevant) worker index.
/// Provider output is appended to `log_file`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudControl: Send + Sync {
    async fn create_pod(&self, pod: &PodSpec, log_file: &Path) -> Result<()>;

    async fn describe_pod_state(&self, pod: &PodSpec) -> Result<PodState>;

    /// Deletes the pod, tolerating one that is already gone.
    async fn delete_pod(&self, pod: &PodSpec) -> Result<()>;

    async fn describe_workers(&self, pod: &PodSpec) -> Result<Vec<WorkerEndpoint>>;

    async fn copy_file_to_worker(
        &self,
        pod: &PodSpec,
        worker: usize,
        local: &Path,
        remote: &str,
        log_file: &Path,
    ) -> Result<()>;

    /// Runs `command` on one worker; a non-zero exit is an error.
    async fn exec_on_worker(
        &self,
        pod: &PodSpec,
        worker: usize,
        command: &str,
        log_file: &Path,
    ) -> Result<()>;
}
