use super::{quote, remote_home_path, Environment};
use crate::config::expand_home;
use crate::core::bootstrap::DPKG_UNLOCK;
use crate::core::job_config::{EnvironmentKind, VenvConfig};
use crate::core::remote::{LogSink, RemoteExecutor};
use async_trait::async_trait;
use std::sync::Arc;

/// Runs the workload inside a plain Python virtualenv.
pub struct Venv {
    config: VenvConfig,
}

impl Venv {
    pub fn new(config: VenvConfig) -> Self {
        Self { config }
    }

    fn setup_script(&self, remote_requirements: &str) -> String {
        let path = &self.config.path;
        let (install_python, python) = match &self.config.python {
            Some(version) => (
                format!(
                    "sudo apt-get update -y && sudo apt-get install -y python{version} python{version}-venv && "
                ),
                format!("python{version}"),
            ),
            None => (String::new(), "python3".to_string()),
        };

        format!(
            "{DPKG_UNLOCK}\n{install_python}{python} -m venv {path} && \
             source {path}/bin/activate && pip install --upgrade pip && \
             pip install -r {remote_requirements}"
        )
    }
}

#[async_trait]
impl Environment for Venv {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Venv
    }

    async fn setup(&self, executor: &RemoteExecutor, workers: &[usize], sink: &LogSink) -> bool {
        let requirements = expand_home(&self.config.requirements_file);
        if !requirements.exists() {
            tracing::error!("Requirements file not found: {:?}", requirements);
            return false;
        }
        let remote = remote_home_path(&requirements);
        let script: Arc<str> = Arc::from(self.setup_script(&remote));
        let requirements = Arc::new(requirements);

        executor
            .fan_out(workers, sink, |worker| {
                let (requirements, remote, script) =
                    (requirements.clone(), remote.clone(), script.clone());
                async move {
                    tracing::info!("Worker {}: setting up venv", worker.index());
                    worker.copy(&requirements, &remote).await && worker.exec(&script).await
                }
            })
            .await
    }

    fn wrap(&self, command: &str) -> String {
        format!(
            "bash -c {}",
            quote(&format!("source {}/bin/activate && {}", self.config.path, command))
        )
    }
}
