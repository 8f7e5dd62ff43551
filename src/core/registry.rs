use super::job::JobRecord;
use super::store::{MetadataStore, StoreError};
use super::JobId;
use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};

type RecordUpdate = Box<dyn FnOnce(&mut JobRecord) + Send>;

/// Operations serialized through the registry task
enum RegistryOp {
    Get(JobId, oneshot::Sender<Result<Option<JobRecord>, StoreError>>),
    List(oneshot::Sender<Result<Vec<JobRecord>, StoreError>>),
    Upsert(JobRecord, oneshot::Sender<Result<(), StoreError>>),
    Update(
        JobId,
        RecordUpdate,
        oneshot::Sender<Result<Option<JobRecord>, StoreError>>,
    ),
    Remove(JobId, oneshot::Sender<Result<Option<JobRecord>, StoreError>>),
    AllocateId(oneshot::Sender<Result<JobId, StoreError>>),
}

/// Async front for [`MetadataStore`].
///
/// All operations from one process go through a single background task, so
/// in-process callers never contend on the file lock. The store's `flock`
/// still guards against other jobman processes.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::UnboundedSender<RegistryOp>,
}

impl RegistryHandle {
    /// Spawns the registry task. Must be called inside a tokio runtime.
    pub fn spawn(store: MetadataStore) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RegistryOp>();

        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let store = store.clone();
                // flock and file I/O block; keep them off the async workers
                let handled = tokio::task::spawn_blocking(move || apply(&store, op)).await;
                if let Err(e) = handled {
                    tracing::error!("Registry operation panicked: {}", e);
                }
            }
            tracing::debug!("Registry task stopped");
        });

        Self { tx }
    }

    async fn call<T>(
        &self,
        op: impl FnOnce(oneshot::Sender<Result<T, StoreError>>) -> RegistryOp,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(op(reply))
            .map_err(|_| anyhow!("Registry task is not running"))?;
        let result = rx
            .await
            .map_err(|_| anyhow!("Registry task dropped the request"))?;
        Ok(result?)
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
        let id = id.to_string();
        self.call(|reply| RegistryOp::Get(id, reply)).await
    }

    pub async fn list(&self) -> Result<Vec<JobRecord>> {
        self.call(RegistryOp::List).await
    }

    pub async fn upsert(&self, record: JobRecord) -> Result<()> {
        self.call(|reply| RegistryOp::Upsert(record, reply)).await
    }

    pub async fn update<F>(&self, id: &str, f: F) -> Result<Option<JobRecord>>
    where
        F: FnOnce(&mut JobRecord) + Send + 'static,
    {
        let id = id.to_string();
        self.call(|reply| RegistryOp::Update(id, Box::new(f), reply))
            .await
    }

    pub async fn remove(&self, id: &str) -> Result<Option<JobRecord>> {
        let id = id.to_string();
        self.call(|reply| RegistryOp::Remove(id, reply)).await
    }

    pub async fn allocate_id(&self) -> Result<JobId> {
        self.call(RegistryOp::AllocateId).await
    }
}

fn apply(store: &MetadataStore, op: RegistryOp) {
    // A closed reply channel only means the caller gave up waiting.
    match op {
        RegistryOp::Get(id, reply) => {
            let _ = reply.send(store.get(&id));
        }
        RegistryOp::List(reply) => {
            let _ = reply.send(store.list());
        }
        RegistryOp::Upsert(record, reply) => {
            let _ = reply.send(store.upsert(record));
        }
        RegistryOp::Update(id, f, reply) => {
            let _ = reply.send(store.update(&id, f));
        }
        RegistryOp::Remove(id, reply) => {
            let _ = reply.send(store.remove(&id));
        }
        RegistryOp::AllocateId(reply) => {
            let _ = reply.send(store.allocate_next_id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::job::JobStatus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_registry_round_trip() {
        let temp = TempDir::new().unwrap();
        let registry = RegistryHandle::spawn(MetadataStore::new(temp.path()));

        let id = registry.allocate_id().await.unwrap();
        assert_eq!(id, "000001");
        registry.upsert(JobRecord::new(id.clone())).await.unwrap();

        let updated = registry
            .update(&id, |r| r.status = JobStatus::Running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, JobStatus::Running);

        let listed = registry.list().await.unwrap();
        assert_eq!(listed.len(), 1);

        assert!(registry.remove(&id).await.unwrap().is_some());
        assert!(registry.get(&id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_from_many_tasks() {
        let temp = TempDir::new().unwrap();
        let registry = RegistryHandle::spawn(MetadataStore::new(temp.path()));
        registry
            .upsert(JobRecord::new("000001".to_string()))
            .await
            .unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..20 {
            let registry = registry.clone();
            tasks.spawn(async move {
                registry
                    .update("000001", |r| {
                        let seen = r.log_file.as_ref().map(|p| p.as_os_str().len()).unwrap_or(0);
                        r.log_file = Some(std::path::PathBuf::from("x".repeat(seen + 1)));
                    })
                    .await
                    .unwrap();
            });
        }
        while tasks.join_next().await.is_some() {}

        let record = registry.get("000001").await.unwrap().unwrap();
        assert_eq!(record.log_file.unwrap().as_os_str().len(), 20);
    }

    #[tokio::test]
    async fn test_store_errors_surface_to_caller() {
        let temp = TempDir::new().unwrap();
        let store = MetadataStore::new(temp.path());
        std::fs::create_dir_all(store.state_dir()).unwrap();
        std::fs::write(store.state_dir().join("meta.json"), "[[").unwrap();

        let registry = RegistryHandle::spawn(store);
        assert!(registry.list().await.is_err());
    }
}
