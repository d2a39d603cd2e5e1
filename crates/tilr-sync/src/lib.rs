//! Resumable link synchronization: incremental fetch, chunked enrichment and
//! reconciliation, advanced one bounded step per tick by a phase controller.

pub mod config;
pub mod controller;
pub mod daemon;
pub mod enrich;
pub mod error;
pub mod fetch;
pub mod reconcile;
pub mod state;
pub mod triggers;

mod rows;
#[cfg(test)]
mod testing;

pub use config::{load_archive_policy, SyncConfig};
pub use controller::{Controller, ControllerSettings, TickOutcome};
pub use daemon::Daemon;
pub use error::{ErrorKind, SyncError};
pub use triggers::{CronTriggers, StoredTriggers, Tick, TriggerRegistry, CONTINUE_TRIGGER_KEY};

use tilr_storage::{TableName, TabularStore};
use tracing::info;

pub const CRATE_NAME: &str = "tilr-sync";

/// Creates whichever of the four tables are missing; returns the ones created.
pub async fn init_tables(tables: &dyn TabularStore) -> Result<Vec<TableName>, SyncError> {
    let mut created = Vec::new();
    for table in TableName::ALL {
        if tables.ensure_table(table).await? {
            info!(table = table.as_str(), "created table");
            created.push(table);
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilr_storage::MemoryTableStore;

    #[tokio::test]
    async fn init_creates_only_missing_tables() {
        let tables = MemoryTableStore::new();
        tables.ensure_table(TableName::Main).await.expect("main");

        let created = init_tables(&tables).await.expect("init");
        assert_eq!(
            created,
            vec![TableName::Diff, TableName::Archive, TableName::Changelog]
        );
        assert!(init_tables(&tables).await.expect("again").is_empty());
    }
}
