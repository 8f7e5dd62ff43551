pub mod accelerator;
pub mod bootstrap;
pub mod controller;
pub mod job;
pub mod job_config;
pub mod job_dir;
pub mod jobman;
pub mod pod;
pub mod registry;
pub mod remote;
pub mod session;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;

/// Zero-padded job identifier, e.g. `"000042"`.
pub type JobId = String;

const VERSION_MESSAGE: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");

pub fn version() -> &'static str {
    let author = clap::crate_authors!();

    Box::leak(Box::new(format!(
        "\
{VERSION_MESSAGE}
Authors: {author}"
    )))
}

pub fn get_config_dir() -> anyhow::Result<PathBuf> {
    dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Failed to get config directory"))
        .map(|p| p.join("jobman"))
}

/// Formats a counter value the way job ids are stored and displayed.
pub fn format_job_id(n: u64) -> JobId {
    format!("{n:06}")
}
