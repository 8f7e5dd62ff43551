use crate::core::job_config::ConfigError;
use regex::Regex;
use std::sync::LazyLock;

static ACCELERATOR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^v(\d+)[a-z]*-(\d+)$").expect("accelerator pattern is valid"));

/// Number of addressable workers in a pod of the given accelerator type.
///
/// Accepts `v<generation>[suffix]-<chips>`. Generations 2-4 host 8 chips per
/// worker, generations 5-6 host 4.
///
/// # Examples
///
/// ```
/// use jobman::core::accelerator::workers_for;
///
/// assert_eq!(workers_for("v3-32").unwrap(), 4);
/// assert_eq!(workers_for("v4-256").unwrap(), 32);
/// assert_eq!(workers_for("v5e-64").unwrap(), 16);
/// assert_eq!(workers_for("v6e-64").unwrap(), 16);
/// ```
pub fn workers_for(accelerator: &str) -> Result<usize, ConfigError> {
    let normalized = accelerator.trim().to_lowercase();
    let caps = ACCELERATOR_PATTERN
        .captures(&normalized)
        .ok_or_else(|| ConfigError::InvalidAccelerator(accelerator.to_string()))?;

    let generation: u32 = caps[1]
        .parse()
        .map_err(|_| ConfigError::InvalidAccelerator(accelerator.to_string()))?;
    let chips: usize = caps[2]
        .parse()
        .map_err(|_| ConfigError::InvalidAccelerator(accelerator.to_string()))?;

    if chips == 0 {
        return Err(ConfigError::InvalidAccelerator(accelerator.to_string()));
    }

    let chips_per_worker = match generation {
        2..=4 => 8,
        5 | 6 => 4,
        _ => {
            return Err(ConfigError::UnsupportedGeneration {
                accelerator: accelerator.to_string(),
                generation,
            })
        }
    };

    Ok(chips.div_ceil(chips_per_worker))
}
