use super::{quote, remote_home_path, Environment};
use crate::config::expand_home;
use crate::core::job_config::{CondaConfig, EnvironmentKind};
use crate::core::remote::{LogSink, RemoteExecutor};
use async_trait::async_trait;
use std::sync::Arc;

const MINICONDA_URL: &str =
    "https://repo.anaconda.com/miniconda/Miniconda3-latest-Linux-x86_64.sh";

/// Runs the workload inside a named conda environment. Always re-provisions.
pub struct Conda {
    config: CondaConfig,
}

impl Conda {
    pub fn new(config: CondaConfig) -> Self {
        Self { config }
    }

    fn setup_script(&self, remote_spec: &str) -> String {
        let root = &self.config.root;
        let name = quote(&self.config.env_name);
        format!(
            "if [ ! -x {root}/bin/conda ]; then \
             wget -q {MINICONDA_URL} -O /tmp/miniconda.sh && bash /tmp/miniconda.sh -b -p {root}; \
             fi && source {root}/etc/profile.d/conda.sh && \
             if conda env list | grep -qE \"^{name}[[:space:]]\"; then \
             conda env update -n {name} -f {remote_spec} --prune; \
             else conda env create -n {name} -f {remote_spec}; fi"
        )
    }
}

#[async_trait]
impl Environment for Conda {
    fn kind(&self) -> EnvironmentKind {
        EnvironmentKind::Conda
    }

    async fn setup(&self, executor: &RemoteExecutor, workers: &[usize], sink: &LogSink) -> bool {
        let spec = expand_home(&self.config.config_file);
        if !spec.exists() {
            tracing::error!("Conda environment file not found: {:?}", spec);
            return false;
        }
        let remote_spec = remote_home_path(&spec);
        let script: Arc<str> = Arc::from(self.setup_script(&remote_spec));
        let spec = Arc::new(spec);

        executor
            .fan_out(workers, sink, |worker| {
                let (spec, remote_spec, script) = (spec.clone(), remote_spec.clone(), script.clone());
                async move {
                    tracing::info!("Worker {}: setting up conda", worker.index());
                    worker.copy(&spec, &remote_spec).await && worker.exec(&script).await
                }
            })
            .await
    }

    fn wrap(&self, command: &str) -> String {
        format!(
            "{}/bin/conda run -n {} bash -c {}",
            self.config.root,
            quote(&self.config.env_name),
            quote(command)
        )
    }
}
