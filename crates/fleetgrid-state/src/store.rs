//! StateStore — redb-backed persistence for FleetGrid.
//!
//! Provides typed access to cluster records and idempotency records. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        txn.open_table(IDEMPOTENCY).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Insert or update a cluster record.
    pub fn put_cluster(&self, record: &ClusterRecord) -> StateResult<()> {
        self.record_transition(record, None)
    }

    /// Persist a cluster record and, optionally, the idempotency record of
    /// the request that caused it, in a single transaction.
    pub fn record_transition(
        &self,
        record: &ClusterRecord,
        request: Option<&IdempotencyRecord>,
    ) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Encode))?;
        let request_entry = request
            .map(|r| {
                serde_json::to_vec(r)
                    .map(|v| (r.table_key(), v))
                    .map_err(map_err!(Encode))
            })
            .transpose()?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        if let Some((req_key, req_value)) = &request_entry {
            let mut table = txn.open_table(IDEMPOTENCY).map_err(map_err!(Table))?;
            table
                .insert(req_key.as_str(), req_value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cluster = %key, status = %record.status, "cluster stored");
        Ok(())
    }

    /// Get a cluster by name.
    pub fn get_cluster(&self, name: &str) -> StateResult<Option<ClusterRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Storage))? {
            Some(guard) => {
                let record: ClusterRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Decode))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all clusters, ordered by name.
    pub fn list_clusters(&self) -> StateResult<Vec<ClusterRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLUSTERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (_, value) = entry.map_err(map_err!(Storage))?;
            let record: ClusterRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Decode))?;
            results.push(record);
        }
        Ok(results)
    }

    // ── Idempotency ────────────────────────────────────────────────

    /// Insert or update an idempotency record.
    pub fn put_request(&self, request: &IdempotencyRecord) -> StateResult<()> {
        let key = request.table_key();
        let value = serde_json::to_vec(request).map_err(map_err!(Encode))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(IDEMPOTENCY).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Look up the request accepted for (cluster, token).
    pub fn get_request(&self, cluster: &str, token: &str) -> StateResult<Option<IdempotencyRecord>> {
        let key = idempotency_key(cluster, token);
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IDEMPOTENCY).map_err(map_err!(Table))?;
        match table.get(key.as_str()).map_err(map_err!(Storage))? {
            Some(guard) => {
                let record: IdempotencyRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Decode))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List every request accepted for a cluster.
    pub fn list_requests_for_cluster(&self, cluster: &str) -> StateResult<Vec<IdempotencyRecord>> {
        let prefix = format!("{cluster}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(IDEMPOTENCY).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Storage))? {
            let (key, value) = entry.map_err(map_err!(Storage))?;
            if key.value().starts_with(&prefix) {
                let record: IdempotencyRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Decode))?;
                results.push(record);
            }
        }
        Ok(results)
    }
}
