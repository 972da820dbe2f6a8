//! StateStore: redb-backed persistence for the local control plane.
//!
//! Records are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing). Operations that must check and mutate state atomically run
//! inside one write transaction through [`StateStore::transact`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult, map_err};
use crate::tables::*;
use crate::types::*;

pub(crate) type JsonTable<'txn> = Table<'txn, &'static str, &'static [u8]>;

/// How long stopped tasks stay listed before settle removes them.
pub const DEFAULT_STOPPED_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    pub(crate) stopped_retention: Duration,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self {
            db: Arc::new(db),
            stopped_retention: DEFAULT_STOPPED_RETENTION,
        };
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
        let store = Self {
            db: Arc::new(db),
            stopped_retention: DEFAULT_STOPPED_RETENTION,
        };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    pub fn with_stopped_retention(mut self, retention: Duration) -> Self {
        self.stopped_retention = retention;
        self
    }

    fn ensure_tables(&self) -> StateResult<()> {
        self.transact(|txn| {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(STACKS).map_err(map_err!(Table))?;
            txn.open_table(TASKS).map_err(map_err!(Table))?;
            txn.open_table(OBJECTS).map_err(map_err!(Table))?;
            txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
            Ok::<_, StateError>(())
        })
    }

    /// Run `f` in one write transaction, committing only if it succeeds.
    pub(crate) fn transact<R, E>(
        &self,
        f: impl FnOnce(&WriteTransaction) -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let out = f(&txn)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(out)
    }

    fn read_one<T: DeserializeOwned>(
        &self,
        def: TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        get_json(&table, key)
    }

    fn read_all<T: DeserializeOwned>(
        &self,
        def: TableDefinition<'static, &'static str, &'static [u8]>,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        all_json(&table)
    }

    // ── Stacks ─────────────────────────────────────────────────────

    pub fn get_stack(&self, name: &str) -> StateResult<Option<StackRecord>> {
        self.read_one(STACKS, name)
    }

    /// List all stacks, ordered by name.
    pub fn list_stacks(&self) -> StateResult<Vec<StackRecord>> {
        self.read_all(STACKS)
    }

    /// Insert or replace a stack record.
    pub fn put_stack(&self, record: &StackRecord) -> StateResult<()> {
        self.transact(|txn| {
            let mut table = txn.open_table(STACKS).map_err(map_err!(Table))?;
            put_json(&mut table, &record.name, record)
        })?;
        debug!(stack = %record.name, status = %record.status, "stack stored");
        Ok(())
    }

    // ── Tasks ──────────────────────────────────────────────────────

    pub fn get_task(&self, task_id: &str) -> StateResult<Option<TaskRecord>> {
        self.read_one(TASKS, task_id)
    }

    pub fn all_tasks(&self) -> StateResult<Vec<TaskRecord>> {
        self.read_all(TASKS)
    }

    /// List tasks of one family, oldest first.
    pub fn list_family_tasks(&self, family: &str) -> StateResult<Vec<TaskRecord>> {
        let mut tasks: Vec<TaskRecord> = self
            .all_tasks()?
            .into_iter()
            .filter(|t| t.family == family)
            .collect();
        tasks.sort_by_key(|t| t.sequence);
        Ok(tasks)
    }

    // ── Objects ────────────────────────────────────────────────────

    pub fn get_object_record(&self, bucket: &str, key: &str) -> StateResult<Option<ObjectRecord>> {
        self.read_one(OBJECTS, &object_key(bucket, key))
    }
}

// ── Table helpers ──────────────────────────────────────────────────

pub(crate) fn get_json<T, Tb>(table: &Tb, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    Tb: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => {
            let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub(crate) fn all_json<T, Tb>(table: &Tb) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    Tb: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(results)
}

pub(crate) fn put_json<T: Serialize>(
    table: &mut JsonTable<'_>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

/// Bump and return the named sequence, starting at 1.
pub(crate) fn next_sequence(txn: &WriteTransaction, name: &str) -> StateResult<u64> {
    let mut table = txn.open_table(SEQUENCES).map_err(map_err!(Table))?;
    let current = table
        .get(name)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    table.insert(name, next).map_err(map_err!(Write))?;
    Ok(next)
}
