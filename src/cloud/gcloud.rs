use super::{CloudControl, PodSpec, PodState, WorkerEndpoint};
use crate::core::job_config::{AllocationMode, PricingClass};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;

/// [`CloudControl`] backed by the `gcloud` command line.
#[derive(Debug, Clone)]
pub struct GcloudCli {
    bin: String,
    connect_timeout: Duration,
}

impl GcloudCli {
    pub fn new(bin: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            connect_timeout,
        }
    }

    fn ssh_options(&self, flag: &str) -> Vec<String> {
        [
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
        ]
        .into_iter()
        .map(|opt| format!("--{flag}=-o {opt}"))
        .collect()
    }

    async fn capture(&self, args: &[String]) -> Result<Output> {
        tracing::debug!("{} {}", self.bin, args.join(" "));
        Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.bin))
    }

    /// Runs with stdout and stderr appended to `log_file`.
    async fn run_logged(&self, args: &[String], log_file: &Path) -> Result<()> {
        tracing::debug!("{} {}", self.bin, args.join(" "));
        let out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("Failed to open log file {:?}", log_file))?;
        let err = out.try_clone()?;

        let status = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(out)
            .stderr(err)
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("Failed to run {}", self.bin))?;

        if !status.success() {
            bail!("{} exited with {}", self.bin, status);
        }
        Ok(())
    }

    async fn describe_state(&self, args: Vec<String>) -> Result<PodState> {
        let output = self.capture(&args).await?;
        if output.status.success() {
            return Ok(PodState::parse(&String::from_utf8_lossy(&output.stdout)));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("NOT_FOUND") || stderr.to_lowercase().contains("not found") {
            Ok(PodState::NotFound)
        } else {
            Err(anyhow!("describe failed: {}", stderr.trim()))
        }
    }

    async fn vm_state(&self, pod: &PodSpec) -> Result<PodState> {
        self.describe_state(vm_describe_args(pod, "value(state)"))
            .await
    }

    async fn queued_state(&self, pod: &PodSpec) -> Result<PodState> {
        self.describe_state(strings(&[
            "compute",
            "tpus",
            "queued-resources",
            "describe",
            &pod.name,
            "--zone",
            &pod.zone,
            "--format=value(state)",
        ]))
        .await
    }
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

fn vm_describe_args(pod: &PodSpec, format: &str) -> Vec<String> {
    strings(&[
        "alpha",
        "compute",
        "tpus",
        "tpu-vm",
        "describe",
        &pod.name,
        "--zone",
        &pod.zone,
        &format!("--format={format}"),
    ])
}

/// Arguments for the create call, which differ between allocation modes.
pub(crate) fn create_args(pod: &PodSpec) -> Vec<String> {
    let mut args = match pod.mode {
        AllocationMode::SinglePod => strings(&["alpha", "compute", "tpus", "tpu-vm", "create"]),
        AllocationMode::QueuedResource => {
            strings(&["compute", "tpus", "queued-resources", "create"])
        }
    };

    args.extend(strings(&[
        &pod.name,
        "--zone",
        &pod.zone,
        "--accelerator-type",
        &pod.accelerator,
    ]));

    match pod.mode {
        AllocationMode::SinglePod => args.extend(strings(&["--version", &pod.version])),
        AllocationMode::QueuedResource => args.extend(strings(&[
            "--runtime-version",
            &pod.version,
            "--node-id",
            &pod.name,
        ])),
    }

    match pod.pricing {
        PricingClass::Preemptible => args.push("--preemptible".to_string()),
        PricingClass::Spot => args.push("--spot".to_string()),
        PricingClass::Ondemand => {}
    }

    if let Some(script) = &pod.startup_script {
        args.push("--metadata".to_string());
        args.push(format!("startup-script={script}"));
    } else if !pod.metadata.is_empty() {
        let pairs: Vec<String> = pod
            .metadata
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        args.push("--metadata".to_string());
        args.push(pairs.join(","));
    }

    if !pod.tags.is_empty() {
        args.push("--tags".to_string());
        args.push(pod.tags.join(","));
    }

    args
}

/// Extracts per-worker addresses from `tpu-vm describe --format=json`.
pub(crate) fn parse_endpoints(json: &str) -> Result<Vec<WorkerEndpoint>> {
    let value: serde_json::Value = serde_json::from_str(json).context("Invalid describe output")?;
    let endpoints = value
        .get("networkEndpoints")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    Ok(endpoints
        .iter()
        .enumerate()
        .map(|(index, endpoint)| WorkerEndpoint {
            index,
            internal_ip: endpoint
                .get("ipAddress")
                .and_then(|v| v.as_str())
                .map(String::from),
            external_ip: endpoint
                .pointer("/accessConfig/externalIp")
                .and_then(|v| v.as_str())
                .map(String::from),
        })
        .collect())
}

#[async_trait]
impl CloudControl for GcloudCli {
    async fn create_pod(&self, pod: &PodSpec, log_file: &Path) -> Result<()> {
        self.run_logged(&create_args(pod), log_file).await
    }

    async fn describe_pod_state(&self, pod: &PodSpec) -> Result<PodState> {
        match pod.mode {
            AllocationMode::SinglePod => self.vm_state(pod).await,
            AllocationMode::QueuedResource => self.queued_state(pod).await,
        }
    }

    async fn delete_pod(&self, pod: &PodSpec) -> Result<()> {
        if self.vm_state(pod).await? != PodState::NotFound {
            tracing::info!("Deleting TPU VM {} in zone {}", pod.name, pod.zone);
            let output = self
                .capture(&strings(&[
                    "alpha",
                    "compute",
                    "tpus",
                    "tpu-vm",
                    "delete",
                    &pod.name,
                    "--zone",
                    &pod.zone,
                    "--quiet",
                ]))
                .await?;
            if !output.status.success() {
                bail!(
                    "Failed to delete TPU VM {}: {}",
                    pod.name,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        } else {
            tracing::info!("TPU VM {} not found, skipping deletion", pod.name);
        }

        if pod.mode == AllocationMode::QueuedResource {
            if self.queued_state(pod).await? != PodState::NotFound {
                tracing::info!("Deleting queued resource {}", pod.name);
                let output = self
                    .capture(&strings(&[
                        "compute",
                        "tpus",
                        "queued-resources",
                        "delete",
                        &pod.name,
                        "--zone",
                        &pod.zone,
                        "--quiet",
                    ]))
                    .await?;
                if !output.status.success() {
                    bail!(
                        "Failed to delete queued resource {}: {}",
                        pod.name,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
            } else {
                tracing::info!("Queued resource {} not found, skipping deletion", pod.name);
            }
        }
        Ok(())
    }

    async fn describe_workers(&self, pod: &PodSpec) -> Result<Vec<WorkerEndpoint>> {
        let output = self.capture(&vm_describe_args(pod, "json")).await?;
        if !output.status.success() {
            bail!(
                "Failed to describe TPU {}: {}",
                pod.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_endpoints(&String::from_utf8_lossy(&output.stdout))
    }

    async fn copy_file_to_worker(
        &self,
        pod: &PodSpec,
        worker: usize,
        local: &Path,
        remote: &str,
        log_file: &Path,
    ) -> Result<()> {
        let mut args = strings(&["compute", "tpus", "tpu-vm", "scp"]);
        args.push(local.display().to_string());
        args.push(format!("{}:{}", pod.name, remote));
        args.extend(strings(&[
            "--worker",
            &worker.to_string(),
            "--zone",
            &pod.zone,
            "--ssh-key-file",
            &pod.ssh_key_file.display().to_string(),
        ]));
        args.extend(self.ssh_options("scp-flag"));
        args.push("--quiet".to_string());

        self.run_logged(&args, log_file).await
    }

    async fn exec_on_worker(
        &self,
        pod: &PodSpec,
        worker: usize,
        command: &str,
        log_file: &Path,
    ) -> Result<()> {
        let mut args = strings(&[
            "alpha",
            "compute",
            "tpus",
            "tpu-vm",
            "ssh",
            &pod.name,
            "--zone",
            &pod.zone,
            &format!("--worker={worker}"),
            "--ssh-key-file",
            &pod.ssh_key_file.display().to_string(),
        ]);
        args.extend(self.ssh_options("ssh-flag"));
        args.extend(strings(&["--command", command, "--quiet"]));

        self.run_logged(&args, log_file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::sample_pod;

    #[test]
    fn test_single_pod_create_args() {
        let mut pod = sample_pod(AllocationMode::SinglePod);
        pod.pricing = PricingClass::Spot;
        pod.tags = vec!["a".to_string(), "b".to_string()];

        let args = create_args(&pod);
        assert_eq!(&args[..5], &["alpha", "compute", "tpus", "tpu-vm", "create"]);
        assert!(args.windows(2).any(|w| w == ["--version", "tpu-ubuntu2204-base"]));
        assert!(args.contains(&"--spot".to_string()));
        assert!(args.windows(2).any(|w| w == ["--tags", "a,b"]));
        assert!(!args.contains(&"--node-id".to_string()));
    }

    #[test]
    fn test_queued_create_args() {
        let mut pod = sample_pod(AllocationMode::QueuedResource);
        pod.pricing = PricingClass::Preemptible;
        pod.metadata.insert("k1".to_string(), "v1".to_string());
        pod.metadata.insert("k2".to_string(), "v2".to_string());

        let args = create_args(&pod);
        assert_eq!(&args[..4], &["compute", "tpus", "queued-resources", "create"]);
        assert!(args
            .windows(2)
            .any(|w| w == ["--runtime-version", "tpu-ubuntu2204-base"]));
        assert!(args.windows(2).any(|w| w[0] == "--node-id" && w[1] == pod.name));
        assert!(args.contains(&"--preemptible".to_string()));
        assert!(args.windows(2).any(|w| w == ["--metadata", "k1=v1,k2=v2"]));
    }

    #[test]
    fn test_startup_script_wins_over_metadata() {
        let mut pod = sample_pod(AllocationMode::SinglePod);
        pod.metadata.insert("k".to_string(), "v".to_string());
        pod.startup_script = Some("echo hi".to_string());

        let args = create_args(&pod);
        assert!(args
            .windows(2)
            .any(|w| w == ["--metadata", "startup-script=echo hi"]));
        assert!(!args.iter().any(|a| a == "k=v"));
    }

    #[test]
    fn test_parse_endpoints() {
        let json = r#"{
            "networkEndpoints": [
                {"ipAddress": "10.0.0.2", "accessConfig": {"externalIp": "34.1.1.1"}},
                {"ipAddress": "10.0.0.3"}
            ]
        }"#;
        let endpoints = parse_endpoints(json).unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].external_ip.as_deref(), Some("34.1.1.1"));
        assert_eq!(endpoints[1].index, 1);
        assert_eq!(endpoints[1].external_ip, None);

        assert!(parse_endpoints("{}").unwrap().is_empty());
        assert!(parse_endpoints("nope").is_err());
    }

    #[test]
    fn test_ssh_options_use_connect_timeout() {
        let cli = GcloudCli::new("gcloud", Duration::from_secs(15));
        assert_eq!(
            cli.ssh_options("ssh-flag")[0],
            "--ssh-flag=-o ConnectTimeout=15"
        );
    }
}
