//! Rebuilds fast-store state from the durable store.
//!
//! Used for initial warm-up, recovery from fast-store data loss, or
//! refreshing a stale cache. Progress is tracked per index (and per
//! partition for incremental jobs) in a process-local status map.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{error, info};

use crate::{
    engine::IndexEngine,
    error::Result,
    partition::{self, REGISTRY_KEY},
    repository::IndexRepository,
    time::Granularity,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReindexState {
    NotStarted,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexStatus {
    pub index_name: String,
    pub status: ReindexState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<u32>,
    pub total_records: u64,
    pub processed_records: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub started_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl ReindexStatus {
    fn new(index_name: &str, status: ReindexState) -> Self {
        Self {
            index_name: index_name.to_string(),
            status,
            granularity: None,
            partition: None,
            total_records: 0,
            processed_records: 0,
            error_message: None,
            started_at: Utc::now().timestamp_millis(),
            completed_at: None,
        }
    }
}

pub struct ReindexService {
    engine: Arc<IndexEngine>,
    repository: Arc<dyn IndexRepository>,
    batch_size: usize,
    statuses: Mutex<HashMap<String, ReindexStatus>>,
}

impl ReindexService {
    pub fn new(
        engine: Arc<IndexEngine>,
        repository: Arc<dyn IndexRepository>,
        batch_size: usize,
    ) -> Self {
        Self {
            engine,
            repository,
            batch_size: batch_size.max(1),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Full rebuild of one index: every durable partition blob is written
    /// back to the fast store, the registry entry restored, and stale
    /// cache entries evicted.
    pub fn reindex_full(&self, index_name: &str) -> ReindexStatus {
        let mut status = ReindexStatus::new(index_name, ReindexState::Running);
        self.statuses
            .lock()
            .insert(index_name.to_string(), status.clone());

        match self.run_full(index_name, &mut status) {
            Ok(()) => {
                status.status = ReindexState::Completed;
                status.completed_at = Some(Utc::now().timestamp_millis());
                info!(index = index_name, records = status.processed_records, "reindex completed");
            }
            Err(err) => {
                error!(index = index_name, "reindex failed: {err}");
                status.status = ReindexState::Failed;
                status.error_message = Some(err.to_string());
            }
        }

        self.statuses
            .lock()
            .insert(index_name.to_string(), status.clone());
        status
    }

    fn run_full(&self, index_name: &str, status: &mut ReindexStatus) -> Result<()> {
        status.total_records = self.repository.count_by_index_name(index_name)?.max(0) as u64;
        info!(
            index = index_name,
            records = status.total_records,
            "starting full reindex"
        );

        let entity_ids = self.repository.find_entity_ids(index_name)?;
        let total_entities = entity_ids.len();
        for (processed, entity_id) in entity_ids.into_iter().enumerate() {
            for granularity in Granularity::ALL {
                for p in self
                    .repository
                    .find_partitions(index_name, entity_id, granularity)?
                {
                    self.restore_partition(index_name, entity_id, granularity, p)?;
                    status.processed_records += 1;
                }
            }
            if (processed + 1) % self.batch_size == 0 {
                info!(
                    index = index_name,
                    progress = processed + 1,
                    total = total_entities,
                    "reindex progress"
                );
            }
        }

        self.finish_rebuild(index_name)
    }

    /// Incremental rebuild of a single (granularity, partition).
    pub fn reindex_partition(
        &self,
        index_name: &str,
        p: u32,
        granularity: Granularity,
    ) -> ReindexStatus {
        let status_key = partition_status_key(index_name, granularity, p);
        let mut status = ReindexStatus::new(index_name, ReindexState::Running);
        status.granularity = Some(granularity);
        status.partition = Some(p);
        self.statuses.lock().insert(status_key.clone(), status.clone());

        match self.run_partition(index_name, p, granularity, &mut status) {
            Ok(()) => {
                status.status = ReindexState::Completed;
                status.completed_at = Some(Utc::now().timestamp_millis());
                info!(index = index_name, partition = p, "partition reindex completed");
            }
            Err(err) => {
                error!(index = index_name, partition = p, "partition reindex failed: {err}");
                status.status = ReindexState::Failed;
                status.error_message = Some(err.to_string());
            }
        }

        self.statuses.lock().insert(status_key, status.clone());
        status
    }

    fn run_partition(
        &self,
        index_name: &str,
        p: u32,
        granularity: Granularity,
        status: &mut ReindexStatus,
    ) -> Result<()> {
        let entity_ids = self.repository.find_entity_ids(index_name)?;
        status.total_records = entity_ids.len() as u64;
        for entity_id in entity_ids {
            if self.restore_partition(index_name, entity_id, granularity, p)? {
                status.processed_records += 1;
            }
        }
        self.finish_rebuild(index_name)
    }

    /// Copies one durable blob into the fast store. Returns whether a blob
    /// existed.
    fn restore_partition(
        &self,
        index_name: &str,
        entity_id: i64,
        granularity: Granularity,
        p: u32,
    ) -> Result<bool> {
        let Some(bytes) = self
            .repository
            .get_bitmap(index_name, entity_id, granularity, p)?
        else {
            return Ok(false);
        };
        if bytes.is_empty() {
            return Ok(false);
        }
        let key = partition::key(index_name, granularity, entity_id, p);
        self.engine.kv().set(&key, &bytes)?;
        Ok(true)
    }

    fn finish_rebuild(&self, index_name: &str) -> Result<()> {
        self.engine.kv().set_add(REGISTRY_KEY, index_name)?;
        // Cached bitmaps may predate the rebuild; drop them so reads load
        // the restored blobs.
        self.engine.evict_index(index_name)
    }

    pub fn status(&self, index_name: &str) -> ReindexStatus {
        self.statuses
            .lock()
            .get(index_name)
            .cloned()
            .unwrap_or_else(|| ReindexStatus::new(index_name, ReindexState::NotStarted))
    }

    pub fn partition_status(
        &self,
        index_name: &str,
        granularity: Granularity,
        p: u32,
    ) -> ReindexStatus {
        self.statuses
            .lock()
            .get(&partition_status_key(index_name, granularity, p))
            .cloned()
            .unwrap_or_else(|| {
                let mut status = ReindexStatus::new(index_name, ReindexState::NotStarted);
                status.granularity = Some(granularity);
                status.partition = Some(p);
                status
            })
    }
}

fn partition_status_key(index_name: &str, granularity: Granularity, p: u32) -> String {
    format!("{index_name}:{granularity}:{p}")
}
