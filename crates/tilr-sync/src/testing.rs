use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tilr_adapters::FixtureSource;
use tilr_core::{LinkRow, StagedRow};
use tilr_storage::{
    ContinuationStore, MemoryContinuationStore, MemoryTableStore, StoreError, Table, TableName,
    TabularStore,
};

use crate::controller::{Controller, ControllerSettings, TickOutcome};
use crate::triggers::{StoredTriggers, TriggerRegistry};
use tilr_core::Phase;

pub(crate) fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .expect("workspace root")
        .to_path_buf()
}

pub(crate) fn fixture_source() -> FixtureSource {
    FixtureSource::load(workspace_root().join("fixtures/sample/bundle.json"))
        .expect("load sample fixture")
}

pub(crate) async fn seed_main(tables: &dyn TabularStore, ids: &[u64]) {
    let rows: Vec<Vec<String>> = ids
        .iter()
        .map(|id| {
            LinkRow {
                link_id: *id,
                ticket_id: 1000 + id,
                issue_id: "1".to_string(),
                ..LinkRow::default()
            }
            .to_cells()
        })
        .collect();
    tables
        .write_range(TableName::Main, 0, &rows)
        .await
        .expect("seed main");
}

pub(crate) async fn staged_ids(tables: &dyn TabularStore) -> Vec<(u64, bool)> {
    let diff = tables.read_all(TableName::Diff).await.expect("diff");
    diff.data_rows()
        .map(|cells| {
            let staged = StagedRow::from_cells(&diff.headers, cells).expect("staged row");
            (staged.row.link_id, staged.enriched)
        })
        .collect()
}

pub(crate) async fn link_rows(tables: &dyn TabularStore, table: TableName) -> Vec<LinkRow> {
    let contents = tables.read_all(table).await.expect("table");
    contents
        .data_rows()
        .map(|cells| LinkRow::from_cells(&contents.headers, cells).expect("link row"))
        .collect()
}

pub(crate) async fn link_ids(tables: &dyn TabularStore, table: TableName) -> Vec<u64> {
    link_rows(tables, table)
        .await
        .into_iter()
        .map(|r| r.link_id)
        .collect()
}

pub(crate) async fn snapshot(tables: &dyn TabularStore) -> Vec<(TableName, Table)> {
    let mut out = Vec::new();
    for name in TableName::ALL {
        out.push((name, tables.read_all(name).await.expect("read")));
    }
    out
}

/// Memory tables whose n-th write fails, standing in for a crash.
#[derive(Default)]
pub(crate) struct FlakyTables {
    inner: MemoryTableStore,
    writes: AtomicUsize,
    fail_at: Mutex<Option<usize>>,
}

impl FlakyTables {
    pub async fn seeded(snapshot: &[(TableName, Table)]) -> Self {
        let tables = Self::default();
        for (name, contents) in snapshot {
            tables.inner.store(*name, contents).await.expect("seed");
        }
        tables
    }

    pub fn fail_at(&self, write: Option<usize>) {
        self.writes.store(0, Ordering::SeqCst);
        *self.fail_at.lock().expect("lock") = write;
    }
}

#[async_trait]
impl TabularStore for FlakyTables {
    async fn exists(&self, table: TableName) -> Result<bool, StoreError> {
        self.inner.exists(table).await
    }

    async fn read_all(&self, table: TableName) -> Result<Table, StoreError> {
        self.inner.read_all(table).await
    }

    async fn store(&self, table: TableName, contents: &Table) -> Result<(), StoreError> {
        let write = self.writes.fetch_add(1, Ordering::SeqCst);
        if *self.fail_at.lock().expect("lock") == Some(write) {
            return Err(StoreError::Io {
                path: PathBuf::from(table.as_str()),
                source: std::io::Error::other("injected crash"),
            });
        }
        self.inner.store(table, contents).await
    }
}

pub(crate) struct Harness {
    pub tables: Arc<MemoryTableStore>,
    pub continuation: Arc<dyn ContinuationStore>,
    pub source: Arc<FixtureSource>,
    pub controller: Controller,
}

impl Harness {
    pub fn new(chunk_size: usize) -> Self {
        let continuation = Arc::new(MemoryContinuationStore::new());
        let triggers = Arc::new(StoredTriggers::new(continuation.clone()));
        Self::build(chunk_size, continuation, triggers)
    }

    pub fn with_triggers(chunk_size: usize, triggers: Arc<dyn TriggerRegistry>) -> Self {
        Self::build(chunk_size, Arc::new(MemoryContinuationStore::new()), triggers)
    }

    pub fn with_continuation(chunk_size: usize, continuation: Arc<dyn ContinuationStore>) -> Self {
        let triggers = Arc::new(StoredTriggers::new(continuation.clone()));
        Self::build(chunk_size, continuation, triggers)
    }

    fn build(
        chunk_size: usize,
        continuation: Arc<dyn ContinuationStore>,
        triggers: Arc<dyn TriggerRegistry>,
    ) -> Self {
        let tables = Arc::new(MemoryTableStore::with_default_tables());
        let source = Arc::new(fixture_source());
        let controller = Controller::new(
            tables.clone(),
            continuation.clone(),
            source.clone(),
            source.clone(),
            triggers,
            ControllerSettings {
                chunk_size,
                ..ControllerSettings::default()
            },
        );
        Self {
            tables,
            continuation,
            source,
            controller,
        }
    }

    /// Starts a cycle and continues until it returns to idle or stalls.
    pub async fn run_cycle(&self) -> Vec<TickOutcome> {
        let mut outcomes = vec![self.controller.start_cycle().await];
        for _ in 0..50 {
            match outcomes.last() {
                Some(TickOutcome::Advanced { to: Phase::Idle, .. })
                | Some(TickOutcome::Stalled { .. }) => break,
                _ => outcomes.push(self.controller.continue_cycle().await),
            }
        }
        outcomes
    }
}
