use crate::cloud::{CloudControl, PodSpec};
use crate::core::job_config::WorkerSelection;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Where one phase writes its per-worker output: `<dir>/<phase>_worker_<i>.log`.
#[derive(Debug, Clone)]
pub struct LogSink {
    dir: PathBuf,
    phase: String,
}

impl LogSink {
    pub fn new(dir: impl Into<PathBuf>, phase: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            phase: phase.into(),
        }
    }

    pub fn phase(&self) -> &str {
        &self.phase
    }

    pub fn worker_log(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}_worker_{}.log", self.phase, index))
    }
}

/// Handle to one worker for the duration of a fan-out task.
#[derive(Clone)]
pub struct Worker {
    index: usize,
    cloud: Arc<dyn CloudControl>,
    pod: Arc<PodSpec>,
    log_file: PathBuf,
    timeout: Option<Duration>,
}

impl Worker {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    async fn try_exec(&self, command: &str) -> anyhow::Result<()> {
        let call = self
            .cloud
            .exec_on_worker(&self.pod, self.index, command, &self.log_file);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| anyhow::anyhow!("timed out after {}s", limit.as_secs()))?,
            None => call.await,
        }
    }

    /// Runs `command`, logging a failure. Output goes to the worker's log file.
    pub async fn exec(&self, command: &str) -> bool {
        match self.try_exec(command).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Worker {}: command failed: {:#}", self.index, e);
                false
            }
        }
    }

    /// Like [`Worker::exec`] but a non-zero exit is an expected answer, not an error.
    pub async fn probe(&self, command: &str) -> bool {
        self.try_exec(command).await.is_ok()
    }

    pub async fn copy(&self, local: &Path, remote: &str) -> bool {
        match self
            .cloud
            .copy_file_to_worker(&self.pod, self.index, local, remote, &self.log_file)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    "Worker {}: failed to copy {:?} to {}: {:#}",
                    self.index,
                    local,
                    remote,
                    e
                );
                false
            }
        }
    }
}

/// Concurrent per-worker dispatch with a join barrier.
#[derive(Clone)]
pub struct RemoteExecutor {
    cloud: Arc<dyn CloudControl>,
    pod: Arc<PodSpec>,
    num_workers: usize,
    command_timeout: Option<Duration>,
}

impl RemoteExecutor {
    pub fn new(
        cloud: Arc<dyn CloudControl>,
        pod: PodSpec,
        num_workers: usize,
        command_timeout: Option<Duration>,
    ) -> Self {
        Self {
            cloud,
            pod: Arc::new(pod),
            num_workers,
            command_timeout,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn all_workers(&self) -> Vec<usize> {
        (0..self.num_workers).collect()
    }

    fn worker(&self, index: usize, sink: &LogSink) -> Worker {
        let log_file = sink.worker_log(index);
        // Each phase starts its worker logs fresh.
        if let Err(e) = std::fs::File::create(&log_file) {
            tracing::warn!("Failed to reset log file {:?}: {}", log_file, e);
        }
        Worker {
            index,
            cloud: self.cloud.clone(),
            pod: self.pod.clone(),
            log_file,
            timeout: self.command_timeout,
        }
    }

    /// Runs `task` once per worker, concurrently, and returns the AND of the
    /// results. A failing worker never cancels its siblings; every task is
    /// joined before returning. An empty worker list is vacuously successful.
    pub async fn fan_out<F, Fut>(&self, workers: &[usize], sink: &LogSink, task: F) -> bool
    where
        F: Fn(Worker) -> Fut,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let mut set = JoinSet::new();
        for &index in workers {
            let fut = task(self.worker(index, sink));
            set.spawn(async move { (index, fut.await) });
        }

        let mut all_ok = true;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, true)) => {
                    tracing::debug!("Worker {}: {} succeeded", index, sink.phase());
                }
                Ok((index, false)) => {
                    tracing::warn!("Worker {}: {} failed", index, sink.phase());
                    all_ok = false;
                }
                Err(e) => {
                    tracing::error!("{} task panicked: {}", sink.phase(), e);
                    all_ok = false;
                }
            }
        }
        all_ok
    }

    pub async fn run_on_workers(&self, workers: &[usize], command: &str, sink: &LogSink) -> bool {
        let command: Arc<str> = Arc::from(command);
        self.fan_out(workers, sink, |worker| {
            let command = command.clone();
            async move { worker.exec(&command).await }
        })
        .await
    }

    /// Resolves `selection` first; an invalid selection fails without
    /// dispatching to any worker.
    pub async fn run_selection(
        &self,
        selection: &WorkerSelection,
        command: &str,
        sink: &LogSink,
    ) -> bool {
        let workers = match selection.resolve(self.num_workers) {
            Ok(workers) => workers,
            Err(e) => {
                tracing::error!("{}", e);
                return false;
            }
        };
        tracing::info!("Launching command on workers: {:?}", workers);
        let ok = self.run_on_workers(&workers, command, sink).await;
        if ok {
            tracing::info!("Command ran successfully on all workers");
        } else {
            tracing::warn!("Command failed on one or more workers");
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job_config::AllocationMode;
    use crate::core::testing::{sample_pod, FakeCloud};
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn executor(cloud: Arc<FakeCloud>, workers: usize) -> RemoteExecutor {
        RemoteExecutor::new(cloud, sample_pod(AllocationMode::SinglePod), workers, None)
    }

    #[tokio::test]
    async fn test_empty_selection_is_vacuously_true() {
        let temp = TempDir::new().unwrap();
        let cloud = Arc::new(FakeCloud::default());
        let exec = executor(cloud.clone(), 4);

        assert!(
            exec.run_on_workers(&[], "true", &LogSink::new(temp.path(), "cmd"))
                .await
        );
        assert_eq!(cloud.exec_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_selection_dispatches_nothing() {
        let temp = TempDir::new().unwrap();
        let cloud = Arc::new(FakeCloud::default());
        let exec = executor(cloud.clone(), 2);
        let sink = LogSink::new(temp.path(), "cmd");

        assert!(
            !exec
                .run_selection(&WorkerSelection::Index(5), "true", &sink)
                .await
        );
        assert!(
            !exec
                .run_selection(&WorkerSelection::Set(vec![0, 0]), "true", &sink)
                .await
        );
        assert_eq!(cloud.exec_calls(), 0);
    }

    #[tokio::test]
    async fn test_selection_targets_only_listed_workers() {
        let temp = TempDir::new().unwrap();
        let cloud = Arc::new(FakeCloud::default());
        let exec = executor(cloud.clone(), 4);
        let sink = LogSink::new(temp.path(), "cmd");

        assert!(
            exec.run_selection(&WorkerSelection::Set(vec![3, 1]), "hostname", &sink)
                .await
        );
        let mut workers = cloud.exec_workers();
        workers.sort_unstable();
        assert_eq!(workers, vec![1, 3]);
        assert!(temp.path().join("cmd_worker_3.log").exists());
        assert!(!temp.path().join("cmd_worker_0.log").exists());
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let temp = TempDir::new().unwrap();
        let cloud = Arc::new(FakeCloud::default());
        cloud.set_exec_delay(Duration::from_millis(200));
        let exec = RemoteExecutor::new(
            cloud.clone(),
            sample_pod(AllocationMode::SinglePod),
            1,
            Some(Duration::from_millis(10)),
        );

        assert!(
            !exec
                .run_on_workers(&[0], "sleep 1", &LogSink::new(temp.path(), "cmd"))
                .await
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_aggregate_is_and_of_workers(outcomes in proptest::collection::vec(any::<bool>(), 1..8)) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();
            let temp = TempDir::new().unwrap();
            let cloud = Arc::new(FakeCloud::default());
            let failing: Vec<usize> = outcomes
                .iter()
                .enumerate()
                .filter(|(_, ok)| !**ok)
                .map(|(i, _)| i)
                .collect();
            cloud.fail_workers(&failing);

            let exec = executor(cloud.clone(), outcomes.len());
            let workers = exec.all_workers();
            let result = runtime.block_on(exec.run_on_workers(
                &workers,
                "train",
                &LogSink::new(temp.path(), "cmd"),
            ));

            prop_assert_eq!(result, outcomes.iter().all(|ok| *ok));
            // Every worker ran even when a sibling failed.
            prop_assert_eq!(cloud.exec_calls(), outcomes.len());
        }
    }
}
