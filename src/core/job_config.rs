use crate::core::accelerator::workers_for;
use crate::core::JobId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use strum::Display;

/// Fatal configuration problems, raised before any resource is touched.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid accelerator format: {0} (expected v<generation>[suffix]-<chips>)")]
    InvalidAccelerator(String),
    #[error("unknown TPU generation {generation} in accelerator {accelerator}")]
    UnsupportedGeneration { accelerator: String, generation: u32 },
    #[error("no environment selected; set exactly one of environment.docker, environment.conda, environment.venv")]
    MissingEnvironment,
    #[error("conflicting environments selected: {0:?}; exactly one is allowed")]
    ConflictingEnvironments(Vec<EnvironmentKind>),
    #[error("command.workers: {0}")]
    InvalidSelection(#[from] SelectionError),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("failed to read config {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("failed to parse config {0}: {1}")]
    Parse(PathBuf, serde_yaml::Error),
    #[error("failed to write config {0}: {1}")]
    Write(PathBuf, String),
}

/// Invalid worker selections. Dispatch fails closed on any of these.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SelectionError {
    #[error("invalid worker index {index}; only {workers} workers available")]
    OutOfRange { index: i64, workers: usize },
    #[error("duplicate worker index {0}")]
    Duplicate(i64),
    #[error("invalid worker selection `{0}`; expected `all`, an index, or a list of indices")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum PricingClass {
    #[strum(to_string = "ondemand")]
    Ondemand,
    #[strum(to_string = "preemptible")]
    Preemptible,
    #[strum(to_string = "spot")]
    Spot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum AllocationMode {
    /// Synchronous create of a single TPU VM.
    #[serde(rename = "tpu-vm", alias = "single-pod")]
    #[strum(to_string = "tpu-vm")]
    SinglePod,
    /// Asynchronous admission through the queued-resources API.
    #[serde(rename = "queued-resources", alias = "queued-resource")]
    #[strum(to_string = "queued-resources")]
    QueuedResource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    #[strum(to_string = "docker")]
    Docker,
    #[strum(to_string = "conda")]
    Conda,
    #[strum(to_string = "venv")]
    Venv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSection {
    pub name: String,
    #[serde(default)]
    pub id: Option<JobId>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Restart the whole acquire/provision/execute sequence after a failure.
    #[serde(rename = "loop", default)]
    pub loop_on_failure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpuSection {
    pub name: String,
    pub zone: String,
    pub accelerator: String,
    pub version: String,
    #[serde(default = "default_pricing")]
    pub pricing: PricingClass,
    #[serde(default = "default_allocation_mode")]
    pub allocation_mode: AllocationMode,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub startup_script: Option<String>,
}

fn default_pricing() -> PricingClass {
    PricingClass::Ondemand
}

fn default_allocation_mode() -> AllocationMode {
    AllocationMode::SinglePod
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshIdentity {
    pub private_key: PathBuf,
    pub public_key: PathBuf,
    /// Block appended to `~/.ssh/config` on every worker.
    #[serde(default)]
    pub config_entry: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSection {
    /// Key gcloud uses to reach the workers.
    pub private_key: PathBuf,
    #[serde(default)]
    pub identities: Vec<SshIdentity>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcsfuseSection {
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub mount_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    pub image: String,
    #[serde(default)]
    pub flags: Vec<String>,
    /// `host[:container]` pairs; a bare path is mounted at the same location.
    #[serde(default)]
    pub mount_dirs: Vec<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CondaConfig {
    pub env_name: String,
    /// Local environment spec copied to every worker.
    pub config_file: PathBuf,
    #[serde(default = "default_conda_root")]
    pub root: String,
}

fn default_conda_root() -> String {
    "$HOME/miniconda".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenvConfig {
    pub path: String,
    /// Local requirements file copied to every worker.
    pub requirements_file: PathBuf,
    #[serde(default)]
    pub python: Option<String>,
}

/// Raw `environment` section. Exactly one entry may be present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conda: Option<CondaConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub venv: Option<VenvConfig>,
}

/// The single environment a job runs in.
#[derive(Debug, Clone)]
pub enum EnvironmentConfig {
    Docker(DockerConfig),
    Conda(CondaConfig),
    Venv(VenvConfig),
}

impl EnvironmentSection {
    pub fn selected(&self) -> Result<EnvironmentConfig, ConfigError> {
        let mut kinds = Vec::new();
        if self.docker.is_some() {
            kinds.push(EnvironmentKind::Docker);
        }
        if self.conda.is_some() {
            kinds.push(EnvironmentKind::Conda);
        }
        if self.venv.is_some() {
            kinds.push(EnvironmentKind::Venv);
        }

        match (&self.docker, &self.conda, &self.venv) {
            _ if kinds.len() > 1 => Err(ConfigError::ConflictingEnvironments(kinds)),
            (Some(docker), None, None) => Ok(EnvironmentConfig::Docker(docker.clone())),
            (None, Some(conda), None) => Ok(EnvironmentConfig::Conda(conda.clone())),
            (None, None, Some(venv)) => Ok(EnvironmentConfig::Venv(venv.clone())),
            _ => Err(ConfigError::MissingEnvironment),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSection {
    pub cmd: String,
    #[serde(default)]
    pub workers: WorkerSelection,
}

/// Which workers the main command runs on.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawSelection", into = "RawSelection")]
pub enum WorkerSelection {
    #[default]
    All,
    Index(i64),
    Set(Vec<i64>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawSelection {
    Index(i64),
    Set(Vec<i64>),
    Keyword(String),
}

impl TryFrom<RawSelection> for WorkerSelection {
    type Error = SelectionError;

    fn try_from(raw: RawSelection) -> Result<Self, Self::Error> {
        match raw {
            RawSelection::Index(i) => Ok(Self::Index(i)),
            RawSelection::Set(set) => Ok(Self::Set(set)),
            RawSelection::Keyword(s) => Self::parse(&s),
        }
    }
}

impl From<WorkerSelection> for RawSelection {
    fn from(selection: WorkerSelection) -> Self {
        match selection {
            WorkerSelection::All => RawSelection::Keyword("all".to_string()),
            WorkerSelection::Index(i) => RawSelection::Index(i),
            WorkerSelection::Set(set) => RawSelection::Set(set),
        }
    }
}

impl WorkerSelection {
    /// Parses `all`, a single index, or a range list such as `0-2,5`.
    ///
    /// # Examples
    ///
    /// ```
    /// use jobman::core::job_config::WorkerSelection;
    ///
    /// assert_eq!(WorkerSelection::parse("all").unwrap(), WorkerSelection::All);
    /// assert_eq!(WorkerSelection::parse("3").unwrap(), WorkerSelection::Index(3));
    /// assert_eq!(
    ///     WorkerSelection::parse("0-2,5").unwrap(),
    ///     WorkerSelection::Set(vec![0, 1, 2, 5])
    /// );
    /// ```
    pub fn parse(input: &str) -> Result<Self, SelectionError> {
        let input = input.trim();
        if input.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        if let Ok(index) = input.parse::<i64>() {
            return Ok(Self::Index(index));
        }
        crate::utils::parse_worker_indices(input)
            .map(|indices| Self::Set(indices.into_iter().map(i64::from).collect()))
            .map_err(|_| SelectionError::Invalid(input.to_string()))
    }

    /// Expands the selection against a pod with `num_workers` workers.
    ///
    /// Validation is all-or-nothing: any bad entry rejects the whole selection.
    pub fn resolve(&self, num_workers: usize) -> Result<Vec<usize>, SelectionError> {
        let check = |index: i64| -> Result<usize, SelectionError> {
            usize::try_from(index)
                .ok()
                .filter(|i| *i < num_workers)
                .ok_or(SelectionError::OutOfRange {
                    index,
                    workers: num_workers,
                })
        };

        match self {
            Self::All => Ok((0..num_workers).collect()),
            Self::Index(index) => Ok(vec![check(*index)?]),
            Self::Set(indices) => {
                let mut seen = HashSet::with_capacity(indices.len());
                let mut workers = Vec::with_capacity(indices.len());
                for &index in indices {
                    let worker = check(index)?;
                    if !seen.insert(worker) {
                        return Err(SelectionError::Duplicate(index));
                    }
                    workers.push(worker);
                }
                Ok(workers)
            }
        }
    }
}

/// Immutable, validated description of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub job: JobSection,
    pub tpu: TpuSection,
    pub ssh: SshSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcsfuse: Option<GcsfuseSection>,
    #[serde(default)]
    pub environment: EnvironmentSection,
    pub command: CommandSection,
}

impl JobConfig {
    /// Reads and validates a YAML job configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config: JobConfig =
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Write(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, text).map_err(|e| ConfigError::Write(path.to_path_buf(), e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job.name.trim().is_empty() {
            return Err(ConfigError::MissingField("job.name"));
        }
        if self.tpu.name.trim().is_empty() {
            return Err(ConfigError::MissingField("tpu.name"));
        }
        if self.tpu.zone.trim().is_empty() {
            return Err(ConfigError::MissingField("tpu.zone"));
        }
        if self.command.cmd.trim().is_empty() {
            return Err(ConfigError::MissingField("command.cmd"));
        }
        let workers = workers_for(&self.tpu.accelerator)?;
        self.command.workers.resolve(workers)?;
        self.environment.selected()?;
        Ok(())
    }

    pub fn num_workers(&self) -> Result<usize, ConfigError> {
        workers_for(&self.tpu.accelerator)
    }

    pub fn environment(&self) -> Result<EnvironmentConfig, ConfigError> {
        self.environment.selected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::sample_config_yaml;

    #[test]
    fn test_parse_sample_config() {
        let config: JobConfig = serde_yaml::from_str(&sample_config_yaml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.tpu.allocation_mode, AllocationMode::SinglePod);
        assert_eq!(config.tpu.pricing, PricingClass::Spot);
        assert!(config.job.loop_on_failure);
        assert_eq!(config.num_workers().unwrap(), 4);
        assert!(matches!(
            config.environment().unwrap(),
            EnvironmentConfig::Docker(_)
        ));
        assert_eq!(config.command.workers, WorkerSelection::All);
    }

    #[test]
    fn test_allocation_mode_aliases() {
        let mode: AllocationMode = serde_yaml::from_str("queued-resources").unwrap();
        assert_eq!(mode, AllocationMode::QueuedResource);
        let mode: AllocationMode = serde_yaml::from_str("single-pod").unwrap();
        assert_eq!(mode, AllocationMode::SinglePod);
    }

    #[test]
    fn test_conflicting_environments_rejected() {
        let yaml = sample_config_yaml().replace(
            "environment:\n",
            "environment:\n  venv:\n    path: ~/venv\n    requirements_file: requirements.txt\n",
        );
        let config: JobConfig = serde_yaml::from_str(&yaml).unwrap();
        match config.validate() {
            Err(ConfigError::ConflictingEnvironments(kinds)) => {
                assert_eq!(kinds, vec![EnvironmentKind::Docker, EnvironmentKind::Venv]);
            }
            other => panic!("expected conflict, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_environment_rejected() {
        let mut config: JobConfig = serde_yaml::from_str(&sample_config_yaml()).unwrap();
        config.environment = EnvironmentSection::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingEnvironment)
        ));
    }

    #[test]
    fn test_bad_accelerator_rejected() {
        let mut config: JobConfig = serde_yaml::from_str(&sample_config_yaml()).unwrap();
        config.tpu.accelerator = "v9-64".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnsupportedGeneration { .. })
        ));
    }

    #[test]
    fn test_worker_selection_from_yaml() {
        let all: WorkerSelection = serde_yaml::from_str("all").unwrap();
        assert_eq!(all, WorkerSelection::All);
        let one: WorkerSelection = serde_yaml::from_str("2").unwrap();
        assert_eq!(one, WorkerSelection::Index(2));
        let set: WorkerSelection = serde_yaml::from_str("[0, 3]").unwrap();
        assert_eq!(set, WorkerSelection::Set(vec![0, 3]));
        assert!(serde_yaml::from_str::<WorkerSelection>("everyone").is_err());
    }

    #[test]
    fn test_resolve_selection() {
        assert_eq!(WorkerSelection::All.resolve(3).unwrap(), vec![0, 1, 2]);
        assert_eq!(WorkerSelection::Index(1).resolve(3).unwrap(), vec![1]);
        assert_eq!(
            WorkerSelection::Set(vec![2, 0]).resolve(3).unwrap(),
            vec![2, 0]
        );
        assert!(WorkerSelection::Set(vec![]).resolve(3).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_selection_fails_closed() {
        assert_eq!(
            WorkerSelection::Index(3).resolve(3),
            Err(SelectionError::OutOfRange {
                index: 3,
                workers: 3
            })
        );
        assert_eq!(
            WorkerSelection::Index(-1).resolve(3),
            Err(SelectionError::OutOfRange {
                index: -1,
                workers: 3
            })
        );
        assert_eq!(
            WorkerSelection::Set(vec![0, 1, 0]).resolve(3),
            Err(SelectionError::Duplicate(0))
        );
        assert!(WorkerSelection::Set(vec![0, 7]).resolve(3).is_err());
    }

    #[test]
    fn test_saved_config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        let mut config: JobConfig = serde_yaml::from_str(&sample_config_yaml()).unwrap();
        config.job.id = Some("000007".to_string());
        config.save(&path).unwrap();

        let loaded = JobConfig::load(&path).unwrap();
        assert_eq!(loaded.job.id.as_deref(), Some("000007"));
        assert_eq!(loaded.tpu.accelerator, config.tpu.accelerator);
    }

    #[test]
    fn test_selection_checked_against_pod_size() {
        let mut config: JobConfig = serde_yaml::from_str(&sample_config_yaml()).unwrap();
        let workers = config.num_workers().unwrap() as i64;

        for selection in [
            WorkerSelection::Index(workers),
            WorkerSelection::Set(vec![0, 0]),
            WorkerSelection::Set(vec![0, workers]),
        ] {
            config.command.workers = selection.clone();
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidSelection(_))),
                "{selection:?} should be rejected"
            );
        }

        config.command.workers = WorkerSelection::Set(vec![workers - 1, 0]);
        config.validate().unwrap();
    }
}
