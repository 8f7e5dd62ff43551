use super::{quote, Environment};
use crate::core::job_config::{DockerConfig, EnvironmentKind};
use crate::core::remote::{LogSink, RemoteExecutor};
use async_trait::async_trait;
use std::sync::Arc;

/// Runs the workload inside a docker container.
pub struct Container {
    config: Arc<DockerConfig>,
}

impl Container {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    fn volume_flags(&self) -> Vec<String> {
        self.config
            .mount_dirs
            .iter()
            .map(|dir| {
                if dir.contains(':') {
                    format!("-v {dir}")
                } else {
                    format!("-v {dir}:{dir}")
                }
            })
            .collect()
    }
}

#[async_trait]
impl Environment for Container {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Docker
    }

    async fn setup(&self, executor: &RemoteExecutor, workers: &[usize], sink: &LogSink) -> bool {
        tracing::info!("Setting up Docker with image {}", self.config.image);
        let image = quote(&self.config.image);

        executor
            .fan_out(workers, sink, |worker| {
                let probe = format!("sudo docker image inspect {image} > /dev/null 2>&1");
                let setup = format!(
                    "sudo usermod -aG docker $USER && sudo systemctl restart docker && sudo docker pull {image}"
                );
                async move {
                    if worker.probe(&probe).await {
                        tracing::info!("Worker {}: image already present", worker.index());
                        return true;
                    }
                    tracing::info!("Worker {}: configuring Docker", worker.index());
                    worker.exec(&setup).await
                }
            })
            .await
    }

    fn wrap(&self, command: &str) -> String {
        let mut parts = vec!["docker run".to_string()];
        parts.extend(self.config.flags.iter().cloned());
        parts.extend(self.volume_flags());
        parts.extend(
            self.config
                .env
                .iter()
                .map(|(k, v)| format!("-e {}", quote(&format!("{k}={v}")))),
        );
        if let Some(workdir) = &self.config.workdir {
            parts.push(format!("-w {workdir}"));
        }
        parts.push(self.config.image.clone());
        parts.push(format!("bash -c {}", quote(command)));
        parts.join(" ")
    }
}
