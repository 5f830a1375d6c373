use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info};

use super::{Change, RecordSink, RecordStore, StoreRepository};
use crate::error::{BatchError, Result};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::Transactional;

const INSTANCES: &str = "job_instances";
const EXECUTIONS: &str = "job_executions";
const STEP_INSTANCES: &str = "step_thread_instances";
const STEP_EXECUTIONS: &str = "step_thread_executions";
const PARTITIONS: &str = "remotable_partitions";
const SPLIT_FLOWS: &str = "remotable_split_flows";
const META: &str = "meta";
const COUNTERS_KEY: &[u8] = b"counters";

/// Writes every touched record to its sled tree, bincode-encoded.
pub struct SledSink {
    db: sled::Db,
    instances: sled::Tree,
    executions: sled::Tree,
    step_instances: sled::Tree,
    step_executions: sled::Tree,
    partitions: sled::Tree,
    split_flows: sled::Tree,
    meta: sled::Tree,
}

impl SledSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            instances: db.open_tree(INSTANCES)?,
            executions: db.open_tree(EXECUTIONS)?,
            step_instances: db.open_tree(STEP_INSTANCES)?,
            step_executions: db.open_tree(STEP_EXECUTIONS)?,
            partitions: db.open_tree(PARTITIONS)?,
            split_flows: db.open_tree(SPLIT_FLOWS)?,
            meta: db.open_tree(META)?,
            db,
        })
    }

    fn load(&self) -> Result<RecordStore> {
        let mut store = RecordStore::new();
        store.instances = load_tree(&self.instances)?;
        store.executions = load_tree(&self.executions)?;
        store.step_instances = load_tree(&self.step_instances)?;
        store.step_executions = load_tree(&self.step_executions)?;
        store.partitions = load_tree(&self.partitions)?;
        store.split_flows = load_tree(&self.split_flows)?;
        if let Some(bytes) = self.meta.get(COUNTERS_KEY)? {
            store.counters = bincode::deserialize(&bytes)?;
        }
        Ok(store)
    }
}

fn load_tree<K, V>(tree: &sled::Tree) -> Result<std::collections::BTreeMap<K, V>>
where
    K: DeserializeOwned + Ord,
    V: DeserializeOwned,
{
    let mut map = std::collections::BTreeMap::new();
    for entry in tree.iter() {
        let (key, value) = entry?;
        map.insert(bincode::deserialize(&key)?, bincode::deserialize(&value)?);
    }
    Ok(map)
}

/// One encoded write; `tree` indexes the tuple handed to the transaction.
struct Write {
    tree: usize,
    key: Vec<u8>,
    value: Option<Vec<u8>>,
}

fn encode<K: Serialize, V: Serialize>(tree: usize, key: &K, value: Option<&V>) -> Result<Write> {
    Ok(Write {
        tree,
        key: bincode::serialize(key)?,
        value: value.map(bincode::serialize).transpose()?,
    })
}

const T_INSTANCES: usize = 0;
const T_EXECUTIONS: usize = 1;
const T_STEP_INSTANCES: usize = 2;
const T_STEP_EXECUTIONS: usize = 3;
const T_PARTITIONS: usize = 4;
const T_SPLIT_FLOWS: usize = 5;
const T_META: usize = 6;

impl RecordSink for SledSink {
    /// Writes the touched records in one transaction across all trees, so a
    /// failed persist leaves the database as it was.
    fn persist(&self, store: &RecordStore, changes: &[Change]) -> Result<()> {
        let writes = changes
            .iter()
            .map(|change| match change {
                Change::Instance(id) => encode(T_INSTANCES, id, store.instances.get(id)),
                Change::Execution(id) => encode(T_EXECUTIONS, id, store.executions.get(id)),
                Change::StepInstance(key) => encode(T_STEP_INSTANCES, key, store.step_instances.get(key)),
                Change::StepExecution(id) => encode(T_STEP_EXECUTIONS, id, store.step_executions.get(id)),
                Change::Partition(key) => encode(T_PARTITIONS, key, store.partitions.get(key)),
                Change::SplitFlow(key) => encode(T_SPLIT_FLOWS, key, store.split_flows.get(key)),
                Change::Counters => Ok(Write {
                    tree: T_META,
                    key: COUNTERS_KEY.to_vec(),
                    value: Some(bincode::serialize(&store.counters)?),
                }),
            })
            .collect::<Result<Vec<Write>>>()?;

        let trees = (
            &self.instances,
            &self.executions,
            &self.step_instances,
            &self.step_executions,
            &self.partitions,
            &self.split_flows,
            &self.meta,
        );
        trees
            .transaction(
                |(instances, executions, step_instances, step_executions, partitions, split_flows, meta)| -> ConflictableTransactionResult<(), ()> {
                    for write in &writes {
                        let tree = match write.tree {
                            T_INSTANCES => instances,
                            T_EXECUTIONS => executions,
                            T_STEP_INSTANCES => step_instances,
                            T_STEP_EXECUTIONS => step_executions,
                            T_PARTITIONS => partitions,
                            T_SPLIT_FLOWS => split_flows,
                            _ => meta,
                        };
                        match &write.value {
                            Some(value) => {
                                tree.insert(write.key.as_slice(), value.as_slice())?;
                            }
                            None => {
                                tree.remove(write.key.as_slice())?;
                            }
                        }
                    }
                    Ok(())
                },
            )
            .map_err(|err| match err {
                TransactionError::Storage(err) => BatchError::from(err),
                TransactionError::Abort(()) => BatchError::storage("record transaction aborted"),
            })?;
        debug!(changes = changes.len(), "Persisted record changes");
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Repository persisted in a sled database. All records are loaded on open;
/// reads are served from memory and writes go through to disk.
pub type SledRepository = StoreRepository<SledSink>;

impl StoreRepository<SledSink> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let sink = SledSink::open(path)?;
        let store = sink.load()?;
        info!(
            path = %path.display(),
            instances = store.instances.len(),
            executions = store.executions.len(),
            "Opened sled execution repository"
        );
        Ok(Self::with_sink(store, sink))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BatchStatus, InstanceState, NewJobInstance, StepThreadKey};
    use crate::repository::ExecutionRepository;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let (instance_id, execution_id) = {
            let repo = SledRepository::open(dir.path()).unwrap();
            let instance = repo
                .create_job_instance(NewJobInstance {
                    job_name: "nightlyLoad".into(),
                    submitter: "ops".into(),
                    job_document: Some("job_name: nightlyLoad\n".into()),
                    ..Default::default()
                })
                .await
                .unwrap();
            let execution = repo
                .create_job_execution(instance.id, Default::default(), None)
                .await
                .unwrap();
            let key = StepThreadKey::top_level(instance.id, "load");
            repo.create_step_thread(key.clone(), execution.id, None).await.unwrap();
            repo.update_step_checkpoint(&key, Some(b"row-42".to_vec())).await.unwrap();
            repo.update_execution_started(execution.id, "node-a").await.unwrap();
            repo.update_execution_status(execution.id, BatchStatus::Failed, None)
                .await
                .unwrap();
            repo.flush().await.unwrap();
            (instance.id, execution.id)
        };

        let repo = SledRepository::open(dir.path()).unwrap();
        let instance = repo.get_job_instance(instance_id).await.unwrap();
        assert_eq!(instance.state, InstanceState::Failed);
        assert_eq!(instance.job_document.as_deref(), Some("job_name: nightlyLoad\n"));

        let execution = repo.get_job_execution(execution_id).await.unwrap();
        assert_eq!(execution.status, BatchStatus::Failed);
        assert_eq!(execution.server_id.as_deref(), Some("node-a"));

        let thread = repo
            .get_step_thread_instance(&StepThreadKey::top_level(instance_id, "load"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(thread.checkpoint, Some(b"row-42".to_vec()));

        // counters continue where they left off
        let next = repo
            .create_job_instance(NewJobInstance {
                job_name: "other".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(next.id > instance_id);
    }

    #[tokio::test]
    async fn test_purge_removes_persisted_records() {
        let dir = TempDir::new().unwrap();
        let instance_id = {
            let repo = SledRepository::open(dir.path()).unwrap();
            let instance = repo
                .create_job_instance(NewJobInstance {
                    job_name: "j".into(),
                    ..Default::default()
                })
                .await
                .unwrap();
            let execution = repo
                .create_job_execution(instance.id, Default::default(), None)
                .await
                .unwrap();
            repo.stop_execution_before_assigned(execution.id).await.unwrap();
            repo.purge_job_instance(instance.id).await.unwrap();
            repo.flush().await.unwrap();
            instance.id
        };
        let repo = SledRepository::open(dir.path()).unwrap();
        assert!(repo.get_job_instance(instance_id).await.unwrap_err().is_not_found());
    }
}
