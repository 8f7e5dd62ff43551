use crate::cloud::{CloudControl, PodSpec, PodState};
use crate::core::job_config::AllocationMode;
use crate::core::job_dir::JobDirectory;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Drives one job's pod towards READY. The pod's state is always re-queried,
/// never remembered between calls.
pub struct PodController {
    cloud: Arc<dyn CloudControl>,
    pod: PodSpec,
    job_dir: JobDirectory,
    poll_interval: Duration,
    log_file: PathBuf,
}

impl PodController {
    pub fn new(
        cloud: Arc<dyn CloudControl>,
        pod: PodSpec,
        job_dir: JobDirectory,
        poll_interval: Duration,
    ) -> Self {
        let log_file = job_dir.logs_dir().join("tpu.log");
        Self {
            cloud,
            pod,
            job_dir,
            poll_interval,
            log_file,
        }
    }

    pub fn pod(&self) -> &PodSpec {
        &self.pod
    }

    async fn state(&self) -> PodState {
        match self.cloud.describe_pod_state(&self.pod).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Failed to query TPU {}: {:#}", self.pod.name, e);
                PodState::Unknown
            }
        }
    }

    /// Queries until the provider answers. A failed query says nothing about
    /// the pod, so it never leads to a delete.
    async fn answered_state(&self) -> PodState {
        loop {
            match self.cloud.describe_pod_state(&self.pod).await {
                Ok(state) => return state,
                Err(e) => {
                    tracing::warn!("Failed to query TPU {}: {:#}. Retrying", self.pod.name, e);
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Returns true once the pod is READY/ACTIVE. Never errors; false means
    /// the mode's acquisition policy gave up.
    pub async fn ensure_ready(&self) -> bool {
        let state = self.answered_state().await;
        tracing::info!("TPU {} is {}", self.pod.name, state);

        if state.is_ready() {
            self.record_endpoints().await;
            return true;
        }

        if state.is_unrecoverable() {
            tracing::warn!("TPU is in unrecoverable state {}, deleting", state);
            self.delete_quietly().await;
        } else if state.is_pending() {
            tracing::info!("TPU is provisioning, waiting until it becomes ready");
            if self.wait_until_ready().await {
                self.record_endpoints().await;
                return true;
            }
            tracing::warn!("TPU failed to become ready, deleting");
            self.delete_quietly().await;
        } else if state == PodState::NotFound {
            self.delete_quietly().await;
        } else {
            // Answered, but with a state we do not recognise.
            tracing::error!("Unexpected TPU state {}, deleting as a precaution", state);
            self.delete_quietly().await;
        }

        let ready = match self.pod.mode {
            AllocationMode::SinglePod => self.create_until_admitted().await,
            AllocationMode::QueuedResource => self.submit_queued().await,
        };

        if ready {
            self.record_endpoints().await;
        }
        ready
    }

    async fn create_until_admitted(&self) -> bool {
        let mut attempt = 1u64;
        loop {
            tracing::info!("Attempt {}: creating TPU VM {}", attempt, self.pod.name);
            match self.cloud.create_pod(&self.pod, &self.log_file).await {
                Ok(()) => {
                    tracing::info!("TPU VM {} created", self.pod.name);
                    return true;
                }
                Err(e) => {
                    tracing::warn!("Create attempt {} failed: {:#}. Retrying", attempt, e);
                    attempt += 1;
                }
            }
        }
    }

    async fn submit_queued(&self) -> bool {
        if let Err(e) = self.cloud.create_pod(&self.pod, &self.log_file).await {
            tracing::error!("Failed to submit queued resource {}: {:#}", self.pod.name, e);
            return false;
        }
        tracing::info!("Queued resource {} submitted, polling until ready", self.pod.name);
        self.wait_until_ready().await
    }

    /// Polls at a fixed interval until the pod is ready (true) or reaches a
    /// terminal-bad state (false). Query errors keep the loop going.
    pub async fn wait_until_ready(&self) -> bool {
        loop {
            let state = self.state().await;
            tracing::info!("Current TPU status: {}", state);
            if state.is_ready() {
                tracing::info!("TPU {} is ready", self.pod.name);
                return true;
            }
            if state.is_terminal_bad() {
                tracing::error!("TPU {} failed or disappeared: {}", self.pod.name, state);
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn delete(&self) -> Result<()> {
        tracing::info!("Deleting TPU {} in zone {}", self.pod.name, self.pod.zone);
        self.cloud.delete_pod(&self.pod).await
    }

    async fn delete_quietly(&self) {
        if let Err(e) = self.delete().await {
            tracing::warn!("Failed to delete TPU {}: {:#}", self.pod.name, e);
        }
    }

    async fn record_endpoints(&self) {
        let endpoints = match self.cloud.describe_workers(&self.pod).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                tracing::warn!("Failed to resolve worker addresses: {:#}", e);
                return;
            }
        };
        if let Err(e) = self.job_dir.write_ips(&endpoints) {
            tracing::warn!("Failed to record worker addresses: {:#}", e);
        }
    }
}
