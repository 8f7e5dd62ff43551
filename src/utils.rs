use crate::core::{format_job_id, JobId};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::builder::{
    styling::{AnsiColor, Effects},
    Styles,
};
use range_parser::parse;
use std::time::Duration;

/// Format duration for display in HH:MM:SS format.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use jobman::utils::format_duration;
///
/// assert_eq!(format_duration(Duration::from_secs(45)), "00:00:45");
/// assert_eq!(format_duration(Duration::from_secs(9045)), "02:30:45");
/// assert_eq!(format_duration(Duration::from_secs(90000)), "25:00:00");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;

    format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
}

/// Elapsed time between `started_at` and `ended_at` (or now), or `"-"` if never started.
pub fn format_elapsed_time(
    started_at: Option<DateTime<Local>>,
    ended_at: Option<DateTime<Local>>,
) -> String {
    match started_at {
        Some(start) => {
            let end = ended_at.unwrap_or_else(Local::now);
            (end - start)
                .to_std()
                .map(format_duration)
                .unwrap_or_else(|_| "-".to_string())
        }
        None => "-".to_string(),
    }
}

pub fn format_timestamp(time: Option<DateTime<Local>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Suffix appended to job and pod names so re-created jobs never collide.
pub fn timestamp_suffix(now: DateTime<Local>) -> String {
    now.format("%Y%m%d_%H%M%S").to_string()
}

/// Parse worker indices like `"0-2"` or `"0,3,5"`.
///
/// Order and duplicates are preserved; duplicate detection happens when the
/// selection is resolved against a pod.
///
/// # Examples
///
/// ```
/// use jobman::utils::parse_worker_indices;
///
/// assert_eq!(parse_worker_indices("0").unwrap(), vec![0]);
/// assert_eq!(parse_worker_indices("0-2,5").unwrap(), vec![0, 1, 2, 5]);
/// assert_eq!(parse_worker_indices("3,1").unwrap(), vec![3, 1]);
/// ```
pub fn parse_worker_indices(input: &str) -> Result<Vec<u32>> {
    parse::<u32>(input.trim()).context(format!("Invalid worker index or range: {}", input))
}

/// Parse job ids like `"42"`, `"1-3"` or `"1,4"` into padded ids.
pub fn parse_job_ids(input: &str) -> Result<Vec<JobId>> {
    let ids = parse::<u64>(input.trim()).context(format!("Invalid job ID or range: {}", input))?;
    Ok(ids.into_iter().map(format_job_id).collect())
}

pub const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default());
