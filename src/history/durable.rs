//! Sled-backed history store
//!
//! Executions live under `exec:` keys, events under `event:` keys with
//! zero-padded IDs so lexicographic key order is event-ID order, and the
//! run index under `runs:`. Values are `serde_json`. A single write mutex
//! serializes "append events + advance pointer + bump version".

use async_trait::async_trait;
use std::path::Path;
use tokio::sync::Mutex;

use super::store::{ExecutionFilter, HistoryBatch, HistoryStore};
use crate::error::{EngineError, EngineResult};
use crate::event::{check_sequence, HistoryEvent};
use crate::execution::WorkflowExecution;
use crate::types::{NamespaceId, RunId, WorkflowId};

/// History store backed by a local sled database
pub struct DurableHistoryStore {
    db: sled::Db,
    write_lock: Mutex<()>,
}

impl DurableHistoryStore {
    /// Open (or create) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let db = sled::open(path)
            .map_err(|e| EngineError::Persistence(format!("failed to open database: {}", e)))?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn exec_key(namespace_id: &NamespaceId, workflow_id: &WorkflowId, run_id: &RunId) -> String {
        format!("exec:{}:{}:{}", namespace_id, workflow_id, run_id)
    }

    fn event_key(
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
        event_id: i64,
    ) -> String {
        format!(
            "event:{}:{}:{}:{:020}",
            namespace_id, workflow_id, run_id, event_id
        )
    }

    fn event_prefix(namespace_id: &NamespaceId, workflow_id: &WorkflowId, run_id: &RunId) -> String {
        format!("event:{}:{}:{}:", namespace_id, workflow_id, run_id)
    }

    fn runs_key(namespace_id: &NamespaceId, workflow_id: &WorkflowId) -> String {
        format!("runs:{}:{}", namespace_id, workflow_id)
    }

    fn encode<T: serde::Serialize>(value: &T) -> EngineResult<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| EngineError::Persistence(format!("serialization error: {}", e)))
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> EngineResult<T> {
        serde_json::from_slice(bytes)
            .map_err(|e| EngineError::Persistence(format!("deserialization error: {}", e)))
    }

    fn read_execution(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<Option<WorkflowExecution>> {
        match self
            .db
            .get(Self::exec_key(namespace_id, workflow_id, run_id).as_bytes())?
        {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn require_execution(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<WorkflowExecution> {
        self.read_execution(namespace_id, workflow_id, run_id)?
            .ok_or_else(|| {
                EngineError::NotFound(format!("workflow {} run {}", workflow_id, run_id))
            })
    }

    fn read_runs(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
    ) -> EngineResult<Vec<RunId>> {
        match self
            .db
            .get(Self::runs_key(namespace_id, workflow_id).as_bytes())?
        {
            Some(bytes) => Self::decode(&bytes),
            None => Ok(Vec::new()),
        }
    }

    fn write_execution(&self, execution: &WorkflowExecution) -> EngineResult<()> {
        let key = Self::exec_key(
            &execution.namespace_id,
            &execution.workflow_id,
            &execution.run_id,
        );
        self.db.insert(key.as_bytes(), Self::encode(execution)?)?;
        Ok(())
    }

    fn write_events(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
        events: &[HistoryEvent],
    ) -> EngineResult<()> {
        for event in events {
            let key = Self::event_key(namespace_id, workflow_id, run_id, event.event_id);
            self.db.insert(key.as_bytes(), Self::encode(event)?)?;
        }
        Ok(())
    }

    fn apply_update(
        &self,
        execution: &WorkflowExecution,
        expected_version: u64,
        events: Vec<HistoryEvent>,
        allow_state_change: bool,
    ) -> EngineResult<WorkflowExecution> {
        let stored = self.require_execution(
            &execution.namespace_id,
            &execution.workflow_id,
            &execution.run_id,
        )?;
        if stored.version != expected_version {
            return Err(EngineError::ConcurrencyConflict {
                expected: expected_version,
                actual: stored.version,
            });
        }
        let next_event_id = check_sequence(stored.next_event_id - 1, &events)
            .map_err(EngineError::HistoryEvent)?;

        let mut updated = if allow_state_change {
            execution.clone()
        } else {
            stored
        };
        updated.version = expected_version + 1;
        updated.next_event_id = next_event_id;

        self.write_events(
            &updated.namespace_id,
            &updated.workflow_id,
            &updated.run_id,
            &events,
        )?;
        self.write_execution(&updated)?;
        Ok(updated)
    }
}

#[async_trait]
impl HistoryStore for DurableHistoryStore {
    async fn create_execution(
        &self,
        execution: WorkflowExecution,
        initial_events: Vec<HistoryEvent>,
    ) -> EngineResult<WorkflowExecution> {
        let next_event_id =
            check_sequence(0, &initial_events).map_err(EngineError::HistoryEvent)?;

        let _guard = self.write_lock.lock().await;
        if self
            .read_execution(
                &execution.namespace_id,
                &execution.workflow_id,
                &execution.run_id,
            )?
            .is_some()
        {
            return Err(EngineError::AlreadyExists(format!(
                "workflow {} run {}",
                execution.workflow_id, execution.run_id
            )));
        }
        let mut runs = self.read_runs(&execution.namespace_id, &execution.workflow_id)?;
        for run in &runs {
            if let Some(existing) =
                self.read_execution(&execution.namespace_id, &execution.workflow_id, run)?
            {
                if !existing.is_terminal() {
                    return Err(EngineError::AlreadyExists(format!(
                        "workflow {} already has an open run",
                        execution.workflow_id
                    )));
                }
            }
        }

        let mut stored = execution;
        stored.version = 1;
        stored.next_event_id = next_event_id;

        self.write_events(
            &stored.namespace_id,
            &stored.workflow_id,
            &stored.run_id,
            &initial_events,
        )?;
        self.write_execution(&stored)?;
        runs.push(stored.run_id);
        self.db.insert(
            Self::runs_key(&stored.namespace_id, &stored.workflow_id).as_bytes(),
            Self::encode(&runs)?,
        )?;
        Ok(stored)
    }

    async fn get_execution(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: Option<&RunId>,
    ) -> EngineResult<WorkflowExecution> {
        let run_id = match run_id {
            Some(run_id) => *run_id,
            None => *self
                .read_runs(namespace_id, workflow_id)?
                .last()
                .ok_or_else(|| EngineError::NotFound(format!("workflow {}", workflow_id)))?,
        };
        self.require_execution(namespace_id, workflow_id, &run_id)
    }

    async fn list_executions(
        &self,
        namespace_id: &NamespaceId,
        filter: &ExecutionFilter,
    ) -> EngineResult<Vec<WorkflowExecution>> {
        let prefix = format!("exec:{}:", namespace_id);
        let mut executions = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (_key, value) = entry?;
            let execution: WorkflowExecution = Self::decode(&value)?;
            if filter.matches(&execution) {
                executions.push(execution);
            }
        }
        executions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.workflow_id.as_str().cmp(b.workflow_id.as_str()))
        });
        Ok(executions)
    }

    async fn update_execution(
        &self,
        execution: &WorkflowExecution,
        expected_version: u64,
    ) -> EngineResult<WorkflowExecution> {
        let _guard = self.write_lock.lock().await;
        self.apply_update(execution, expected_version, Vec::new(), true)
    }

    async fn update_with_events(
        &self,
        execution: &WorkflowExecution,
        expected_version: u64,
        events: Vec<HistoryEvent>,
    ) -> EngineResult<WorkflowExecution> {
        let _guard = self.write_lock.lock().await;
        self.apply_update(execution, expected_version, events, true)
    }

    async fn append_events(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
        events: Vec<HistoryEvent>,
        expected_version: u64,
    ) -> EngineResult<WorkflowExecution> {
        let _guard = self.write_lock.lock().await;
        let stored = self.require_execution(namespace_id, workflow_id, run_id)?;
        if events.is_empty() {
            return Ok(stored);
        }
        self.apply_update(&stored, expected_version, events, false)
    }

    async fn get_history(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
        from: i64,
        max: usize,
    ) -> EngineResult<HistoryBatch> {
        let stored = self.require_execution(namespace_id, workflow_id, run_id)?;
        let last_persisted = stored.next_event_id - 1;

        let prefix = Self::event_prefix(namespace_id, workflow_id, run_id);
        let mut events = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (_key, value) = entry?;
            let event: HistoryEvent = Self::decode(&value)?;
            if event.event_id >= from {
                events.push(event);
                if events.len() >= max {
                    break;
                }
            }
        }
        let first_id = events.first().map(|e| e.event_id).unwrap_or(0);
        let last_id = events.last().map(|e| e.event_id).unwrap_or(0);
        let is_last = events.is_empty() || last_id >= last_persisted;
        Ok(HistoryBatch {
            events,
            first_id,
            last_id,
            is_last,
        })
    }

    async fn validate_event_sequence(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<bool> {
        let prefix = Self::event_prefix(namespace_id, workflow_id, run_id);
        let mut expected = 1i64;
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (_key, value) = entry?;
            let event: HistoryEvent = Self::decode(&value)?;
            if event.event_id != expected {
                return Ok(false);
            }
            expected += 1;
        }
        Ok(true)
    }

    async fn remove_execution(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<()> {
        let _guard = self.write_lock.lock().await;
        self.db
            .remove(Self::exec_key(namespace_id, workflow_id, run_id).as_bytes())?;
        let prefix = Self::event_prefix(namespace_id, workflow_id, run_id);
        let keys: Vec<sled::IVec> = self
            .db
            .scan_prefix(prefix.as_bytes())
            .filter_map(|entry| entry.ok().map(|(k, _)| k))
            .collect();
        for key in keys {
            self.db.remove(key)?;
        }
        let mut runs = self.read_runs(namespace_id, workflow_id)?;
        runs.retain(|r| r != run_id);
        if runs.is_empty() {
            self.db
                .remove(Self::runs_key(namespace_id, workflow_id).as_bytes())?;
        } else {
            self.db.insert(
                Self::runs_key(namespace_id, workflow_id).as_bytes(),
                Self::encode(&runs)?,
            )?;
        }
        Ok(())
    }
}
