//! Worker bootstrap phases that run before the environment is set up.

use crate::config::expand_home;
use crate::core::job_config::{GcsfuseSection, SshSection};
use crate::core::remote::{LogSink, RemoteExecutor};
use crate::env::quote;
use std::path::PathBuf;
use std::sync::Arc;

/// Shell prelude that frees the dpkg frontend lock before apt runs.
/// Freshly booted TPU VMs often hold it with unattended upgrades.
pub const DPKG_UNLOCK: &str = r#"if sudo fuser /var/lib/dpkg/lock-frontend >/dev/null 2>&1; then
  LOCK_PID=$(sudo lsof -t /var/lib/dpkg/lock-frontend || true)
  if [ -n "$LOCK_PID" ]; then
    echo "[WARN] Killing process $LOCK_PID holding dpkg lock"
    sudo kill -9 $LOCK_PID
    sleep 2
  fi
fi"#;

struct Identity {
    private_key: PathBuf,
    public_key: PathBuf,
}

impl Identity {
    fn file_names(&self) -> (String, String) {
        let name = |p: &PathBuf| {
            p.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };
        (name(&self.private_key), name(&self.public_key))
    }
}

/// Copies every configured SSH identity to `~/.ssh/` on each worker and writes
/// the combined `~/.ssh/config`. Identities whose local key files are missing
/// are skipped.
pub async fn setup_identities(
    executor: &RemoteExecutor,
    workers: &[usize],
    ssh: &SshSection,
    sink: &LogSink,
) -> bool {
    let mut identities = Vec::new();
    let mut config_entries = Vec::new();
    for entry in &ssh.identities {
        let private_key = expand_home(&entry.private_key);
        let public_key = expand_home(&entry.public_key);
        if !private_key.exists() || !public_key.exists() {
            tracing::error!("SSH key not found: {:?} or {:?}", private_key, public_key);
            continue;
        }
        if !entry.config_entry.trim().is_empty() {
            config_entries.push(entry.config_entry.trim().to_string());
        }
        identities.push(Identity {
            private_key,
            public_key,
        });
    }

    if identities.is_empty() {
        tracing::info!("No SSH identities to install");
        return true;
    }
    tracing::info!("Copying SSH keys to TPU workers");

    let mut finish = Vec::new();
    for identity in &identities {
        let (private, public) = identity.file_names();
        finish.push(format!("chmod 600 ~/.ssh/{}", quote(&private)));
        finish.push(format!("chmod 644 ~/.ssh/{}", quote(&public)));
    }
    if !config_entries.is_empty() {
        finish.push(format!(
            "printf '%s\\n' {} > ~/.ssh/config",
            quote(&config_entries.join("\n\n"))
        ));
        finish.push("chmod 600 ~/.ssh/config".to_string());
    }

    let identities = Arc::new(identities);
    let finish: Arc<str> = Arc::from(finish.join(" && "));

    let ok = executor
        .fan_out(workers, sink, |worker| {
            let (identities, finish) = (identities.clone(), finish.clone());
            async move {
                if !worker.exec("mkdir -p ~/.ssh && chmod 700 ~/.ssh").await {
                    return false;
                }
                for identity in identities.iter() {
                    let (private, public) = identity.file_names();
                    if !worker
                        .copy(&identity.private_key, &format!("~/.ssh/{private}"))
                        .await
                        || !worker
                            .copy(&identity.public_key, &format!("~/.ssh/{public}"))
                            .await
                    {
                        return false;
                    }
                }
                worker.exec(&finish).await
            }
        })
        .await;

    if ok {
        tracing::info!("SSH setup completed on all workers");
    } else {
        tracing::warn!("SSH setup failed on at least one worker");
    }
    ok
}

fn gcsfuse_install_script(bucket: &str, mount_path: &str) -> String {
    format!(
        r#"set -e
GCSFUSE_REPO=gcsfuse-$(lsb_release -c -s)
echo "deb [signed-by=/usr/share/keyrings/cloud.google.asc] https://packages.cloud.google.com/apt ${{GCSFUSE_REPO}} main" | sudo tee /etc/apt/sources.list.d/gcsfuse.list
sudo curl -s https://packages.cloud.google.com/apt/doc/apt-key.gpg | sudo tee /usr/share/keyrings/cloud.google.asc >/dev/null
{DPKG_UNLOCK}
sudo apt-get update -y && sudo apt-get install -y gcsfuse
command -v gcsfuse >/dev/null
sudo mkdir -p {mount_path}
mountpoint -q {mount_path} || sudo gcsfuse --implicit-dirs --dir-mode=777 --file-mode=777 --o allow_other {bucket} {mount_path}
ls -la {mount_path}"#
    )
}

/// Installs gcsfuse and mounts the bucket on each worker, skipping workers
/// where the mount is already live. Succeeds trivially when no mount is
/// configured.
pub async fn mount_filesystem(
    executor: &RemoteExecutor,
    workers: &[usize],
    gcsfuse: Option<&GcsfuseSection>,
    sink: &LogSink,
) -> bool {
    let Some(gcsfuse) = gcsfuse else {
        tracing::debug!("No gcsfuse section, skipping bucket mount");
        return true;
    };
    if gcsfuse.bucket_name.trim().is_empty() || gcsfuse.mount_path.trim().is_empty() {
        tracing::error!("gcsfuse config is missing `bucket_name` or `mount_path`");
        return false;
    }
    tracing::info!(
        "Mounting bucket {} at {} on TPU workers",
        gcsfuse.bucket_name,
        gcsfuse.mount_path
    );

    let mount_path = quote(&gcsfuse.mount_path);
    let probe: Arc<str> =
        Arc::from(format!("which gcsfuse >/dev/null && mountpoint -q {mount_path}"));
    let install: Arc<str> = Arc::from(gcsfuse_install_script(
        &quote(&gcsfuse.bucket_name),
        &mount_path,
    ));

    executor
        .fan_out(workers, sink, |worker| {
            let (probe, install) = (probe.clone(), install.clone());
            async move {
                if worker.probe(&probe).await {
                    tracing::info!("Worker {}: bucket already mounted", worker.index());
                    return true;
                }
                tracing::info!("Worker {}: setting up gcsfuse", worker.index());
                worker.exec(&install).await
            }
        })
        .await
}
