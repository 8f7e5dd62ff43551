//! Fixtures shared by unit tests: sample configs, a scripted cloud, and an
//! in-memory process supervisor.

use crate::cloud::{CloudControl, PodSpec, PodState, WorkerEndpoint};
use crate::core::job_config::{AllocationMode, JobConfig, PricingClass};
use crate::core::session::ProcessSupervisor;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub fn sample_config_yaml() -> String {
    r#"job:
  name: llama-pretrain
  loop: true
tpu:
  name: test-tpu
  zone: us-central2-b
  accelerator: v4-32
  version: tpu-ubuntu2204-base
  pricing: spot
  allocation_mode: tpu-vm
ssh:
  private_key: /tmp/gce
environment:
  docker:
    image: gcr.io/proj/train:latest
    flags: [--rm]
command:
  cmd: python train.py
  workers: all
"#
    .to_string()
}

pub fn sample_config() -> JobConfig {
    serde_yaml::from_str(&sample_config_yaml()).unwrap()
}

pub fn sample_pod(mode: AllocationMode) -> PodSpec {
    PodSpec {
        name: "test-tpu".to_string(),
        zone: "us-central2-b".to_string(),
        accelerator: "v4-32".to_string(),
        version: "tpu-ubuntu2204-base".to_string(),
        pricing: PricingClass::Ondemand,
        mode,
        tags: vec![],
        metadata: BTreeMap::new(),
        startup_script: None,
        ssh_key_file: PathBuf::from("/tmp/gce"),
    }
}

struct Script {
    states: VecDeque<PodState>,
    current: PodState,
    create_failures: usize,
    describe_failures: usize,
    failing_workers: HashSet<usize>,
    failing_copies: HashSet<usize>,
    failing_commands: Vec<(String, HashSet<usize>)>,
    counted_failures: Vec<(String, usize)>,
    exec_delay: Option<Duration>,
    execs: Vec<(usize, String)>,
    copies: Vec<(usize, String)>,
    create_calls: usize,
    delete_calls: usize,
    describe_calls: usize,
}

/// In-memory [`CloudControl`] driven by a script of pod states and failure rules.
///
/// Each describe pops the next scripted state, if any; otherwise it reports
/// the state left by the last create (READY) or delete (NOT_FOUND).
pub struct FakeCloud {
    script: Mutex<Script>,
}

impl Default for FakeCloud {
    fn default() -> Self {
        Self {
            script: Mutex::new(Script {
                states: VecDeque::new(),
                current: PodState::NotFound,
                create_failures: 0,
                describe_failures: 0,
                failing_workers: HashSet::new(),
                failing_copies: HashSet::new(),
                failing_commands: Vec::new(),
                counted_failures: Vec::new(),
                exec_delay: None,
                execs: Vec::new(),
                copies: Vec::new(),
                create_calls: 0,
                delete_calls: 0,
                describe_calls: 0,
            }),
        }
    }
}

impl FakeCloud {
    pub fn with_states(states: impl IntoIterator<Item = PodState>) -> Self {
        let cloud = Self::default();
        cloud.push_states(states);
        cloud
    }

    fn script(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap()
    }

    pub fn push_states(&self, states: impl IntoIterator<Item = PodState>) {
        self.script().states.extend(states);
    }

    pub fn fail_creates(&self, times: usize) {
        self.script().create_failures = times;
    }

    pub fn fail_describes(&self, times: usize) {
        self.script().describe_failures = times;
    }

    /// Every command on these workers fails.
    pub fn fail_workers(&self, workers: &[usize]) {
        self.script().failing_workers.extend(workers.iter().copied());
    }

    /// File copies to these workers fail.
    pub fn fail_copies_on(&self, workers: &[usize]) {
        self.script().failing_copies.extend(workers.iter().copied());
    }

    /// Commands containing `pattern` fail on the given workers.
    pub fn fail_commands_on(&self, pattern: &str, workers: &[usize]) {
        self.script()
            .failing_commands
            .push((pattern.to_string(), workers.iter().copied().collect()));
    }

    /// The next `times` commands containing `pattern` fail, on any worker.
    pub fn fail_command_times(&self, pattern: &str, times: usize) {
        self.script()
            .counted_failures
            .push((pattern.to_string(), times));
    }

    pub fn set_exec_delay(&self, delay: Duration) {
        self.script().exec_delay = Some(delay);
    }

    pub fn create_calls(&self) -> usize {
        self.script().create_calls
    }

    pub fn delete_calls(&self) -> usize {
        self.script().delete_calls
    }

    pub fn describe_calls(&self) -> usize {
        self.script().describe_calls
    }

    pub fn exec_calls(&self) -> usize {
        self.script().execs.len()
    }

    pub fn exec_workers(&self) -> Vec<usize> {
        self.script().execs.iter().map(|(w, _)| *w).collect()
    }

    pub fn commands_matching(&self, pattern: &str) -> Vec<(usize, String)> {
        self.script()
            .execs
            .iter()
            .filter(|(_, cmd)| cmd.contains(pattern))
            .cloned()
            .collect()
    }

    pub fn copies(&self) -> Vec<(usize, String)> {
        self.script().copies.clone()
    }
}

#[async_trait]
impl CloudControl for FakeCloud {
    async fn create_pod(&self, _pod: &PodSpec, _log_file: &Path) -> Result<()> {
        let mut script = self.script();
        script.create_calls += 1;
        if script.create_failures > 0 {
            script.create_failures -= 1;
            return Err(anyhow!("no capacity"));
        }
        script.current = PodState::Ready;
        Ok(())
    }

    async fn describe_pod_state(&self, _pod: &PodSpec) -> Result<PodState> {
        let mut script = self.script();
        script.describe_calls += 1;
        if script.describe_failures > 0 {
            script.describe_failures -= 1;
            return Err(anyhow!("describe timed out"));
        }
        if let Some(state) = script.states.pop_front() {
            script.current = state;
        }
        Ok(script.current)
    }

    async fn delete_pod(&self, _pod: &PodSpec) -> Result<()> {
        let mut script = self.script();
        script.delete_calls += 1;
        script.current = PodState::NotFound;
        Ok(())
    }

    async fn describe_workers(&self, _pod: &PodSpec) -> Result<Vec<WorkerEndpoint>> {
        Ok((0..2)
            .map(|index| WorkerEndpoint {
                index,
                internal_ip: Some(format!("10.0.0.{}", index + 2)),
                external_ip: Some(format!("34.0.0.{}", index + 2)),
            })
            .collect())
    }

    async fn copy_file_to_worker(
        &self,
        _pod: &PodSpec,
        worker: usize,
        _local: &Path,
        remote: &str,
        _log_file: &Path,
    ) -> Result<()> {
        let mut script = self.script();
        script.copies.push((worker, remote.to_string()));
        if script.failing_copies.contains(&worker) {
            return Err(anyhow!("scp to worker {worker} failed"));
        }
        Ok(())
    }

    async fn exec_on_worker(
        &self,
        _pod: &PodSpec,
        worker: usize,
        command: &str,
        _log_file: &Path,
    ) -> Result<()> {
        let delay = {
            let mut script = self.script();
            script.execs.push((worker, command.to_string()));
            script.exec_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script();
        if script.failing_workers.contains(&worker) {
            return Err(anyhow!("worker {worker} unreachable"));
        }
        if script
            .failing_commands
            .iter()
            .any(|(pattern, workers)| command.contains(pattern.as_str()) && workers.contains(&worker))
        {
            return Err(anyhow!("exit status 1"));
        }
        if let Some((_, remaining)) = script
            .counted_failures
            .iter_mut()
            .find(|(pattern, remaining)| *remaining > 0 && command.contains(pattern.as_str()))
        {
            *remaining -= 1;
            return Err(anyhow!("exit status 1"));
        }
        Ok(())
    }
}

/// In-memory [`ProcessSupervisor`]; spawned handles stay alive until killed.
pub struct FakeSupervisor {
    available: bool,
    sessions: Mutex<HashMap<String, String>>,
}

impl Default for FakeSupervisor {
    fn default() -> Self {
        Self {
            available: true,
            sessions: Mutex::new(HashMap::new()),
        }
    }
}

impl FakeSupervisor {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::default()
        }
    }

    /// Simulates the session exiting on its own.
    pub fn kill(&self, handle: &str) {
        self.sessions.lock().unwrap().remove(handle);
    }

    pub fn command(&self, handle: &str) -> Option<String> {
        self.sessions.lock().unwrap().get(handle).cloned()
    }
}

impl ProcessSupervisor for FakeSupervisor {
    fn backend(&self) -> &'static str {
        "fake"
    }

    fn available(&self) -> bool {
        self.available
    }

    fn spawn(&self, handle: &str, command: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(handle) {
            return Err(anyhow!("duplicate session: {handle}"));
        }
        sessions.insert(handle.to_string(), command.to_string());
        Ok(())
    }

    fn is_alive(&self, handle: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(handle)
    }

    fn terminate(&self, handle: &str) -> Result<()> {
        self.sessions
            .lock()
            .unwrap()
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| anyhow!("can't find session {handle}"))
    }
}
