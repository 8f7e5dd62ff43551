use crate::core::controller::RunSettings;
use crate::core::get_config_dir;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host-level settings. Per-job settings live in each job's YAML config.
#[derive(Deserialize, Debug, Clone)]
pub struct Settings {
    /// Root directory holding one subdirectory per job plus the registry
    #[serde(default = "default_jobs_dir")]
    pub jobs_dir: PathBuf,
    #[serde(default)]
    pub gcloud: GcloudConfig,
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Deserialize, Debug, Clone)]
pub struct GcloudConfig {
    /// Path or name of the gcloud executable
    #[serde(default = "default_gcloud_bin")]
    pub bin: String,
    /// SSH connect timeout passed to every worker connection
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

#[derive(Deserialize, Debug, Clone)]
pub struct RunConfig {
    /// Seconds between pod state queries while waiting
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Upper bound for a single remote command (None = unbounded)
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
    /// Pause before a looping job restarts
    #[serde(default = "default_loop_delay_secs")]
    pub loop_delay_secs: u64,
}

fn default_jobs_dir() -> PathBuf {
    PathBuf::from("jobs")
}

fn default_gcloud_bin() -> String {
    "gcloud".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_loop_delay_secs() -> u64 {
    10
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            jobs_dir: default_jobs_dir(),
            gcloud: GcloudConfig::default(),
            run: RunConfig::default(),
        }
    }
}

impl Default for GcloudConfig {
    fn default() -> Self {
        Self {
            bin: default_gcloud_bin(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            command_timeout_secs: None,
            loop_delay_secs: default_loop_delay_secs(),
        }
    }
}

impl Settings {
    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            poll_interval: Duration::from_secs(self.run.poll_interval_secs),
            command_timeout: self.run.command_timeout_secs.map(Duration::from_secs),
            loop_delay: Duration::from_secs(self.run.loop_delay_secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.gcloud.connect_timeout_secs)
    }
}

/// Loads settings from, in increasing priority: `~/.config/jobman/jobman.toml`,
/// the file given on the command line, and `JOBMAN_*` environment variables.
pub fn load_config(config_path: Option<&PathBuf>) -> Result<Settings, config::ConfigError> {
    let mut config_vec = vec![];

    // Default config file
    if let Ok(default_config_path) = get_config_dir().map(|d| d.join("jobman.toml")) {
        if default_config_path.exists() {
            config_vec.push(default_config_path);
        }
    }

    // User-provided config file
    if let Some(config_path) = config_path {
        if config_path.exists() {
            config_vec.push(config_path.clone());
        } else {
            tracing::warn!("Config file {config_path:?} not found.");
        }
    }

    let settings = config::Config::builder();
    let settings = config_vec.iter().fold(settings, |s, path| {
        s.add_source(config::File::from(path.as_path()))
    });

    settings
        .add_source(
            config::Environment::with_prefix("JOBMAN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()
}

/// Expands a leading `~` to the local home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
