//! Runtimes a workload can execute in on each worker.

pub mod conda;
pub mod container;
pub mod venv;

use crate::core::job_config::{EnvironmentConfig, EnvironmentKind};
use crate::core::remote::{LogSink, RemoteExecutor};
use async_trait::async_trait;
use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

pub use conda::Conda;
pub use container::Container;
pub use venv::Venv;

/// Install/verify a runtime on workers, and rewrite commands to run inside it.
#[async_trait]
pub trait Environment: Send + Sync {
    fn kind(&self) -> EnvironmentKind;

    /// Prepares the runtime on every listed worker. True only if all succeed.
    async fn setup(&self, executor: &RemoteExecutor, workers: &[usize], sink: &LogSink) -> bool;

    /// Returns `command` rewritten to execute inside the runtime.
    fn wrap(&self, command: &str) -> String;
}

pub fn from_config(config: EnvironmentConfig) -> Arc<dyn Environment> {
    match config {
        EnvironmentConfig::Docker(c) => Arc::new(Container::new(c)),
        EnvironmentConfig::Conda(c) => Arc::new(Conda::new(c)),
        EnvironmentConfig::Venv(c) => Arc::new(Venv::new(c)),
    }
}

pub(crate) fn quote(s: &str) -> String {
    shell_escape::unix::escape(Cow::Borrowed(s)).into_owned()
}

/// Remote location a local file is copied to: `~/<file name>`.
pub(crate) fn remote_home_path(local: &Path) -> String {
    let name = local
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("~/{name}")
}
