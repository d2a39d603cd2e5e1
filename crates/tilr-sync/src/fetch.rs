//! Stages the previous snapshot plus newly listed links into `diff`.

use std::collections::{BTreeMap, HashSet};

use tilr_adapters::TicketingSource;
use tilr_core::{diff_headers, Link, LinkRow, StagedRow};
use tilr_storage::{TableName, TabularStore};
use tracing::{debug, info, info_span, Instrument};

use crate::error::SyncError;
use crate::rows::decode_links;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Advanced high-water mark: never below the cursor the fetch started from.
    pub cursor: u64,
    pub carried_rows: usize,
    pub new_links: usize,
}

/// Lists links above `max(persisted_cursor, highest main link id)` and
/// rewrites `diff` as the carried main rows followed by the new links, all
/// pending enrichment. `main` is only read.
pub async fn run_fetch(
    tables: &dyn TabularStore,
    ticketing: &dyn TicketingSource,
    persisted_cursor: u64,
) -> Result<FetchOutcome, SyncError> {
    let span = info_span!("fetch_phase", persisted_cursor);
    async move {
        let main = tables.read_all(TableName::Main).await?;
        let carried = decode_links(TableName::Main, &main)?;
        let known: HashSet<u64> = carried.iter().map(|r| r.link_id).collect();
        let cursor = carried
            .iter()
            .map(|r| r.link_id)
            .fold(persisted_cursor, u64::max);

        let fresh = list_new_links(ticketing, cursor, &known).await?;
        let advanced = fresh.keys().next_back().copied().unwrap_or(cursor).max(cursor);

        let staged: Vec<Vec<String>> = carried
            .iter()
            .map(|row| LinkRow::from_link(&row.link()))
            .chain(fresh.values().map(LinkRow::from_link))
            .map(|row| StagedRow::pending(row).to_cells())
            .collect();

        tables.clear(TableName::Diff).await?;
        tables.write_headers(TableName::Diff, &diff_headers()).await?;
        tables.write_range(TableName::Diff, 0, &staged).await?;

        info!(
            cursor,
            advanced,
            carried = carried.len(),
            new_links = fresh.len(),
            "staged links for enrichment"
        );
        Ok(FetchOutcome {
            cursor: advanced,
            carried_rows: carried.len(),
            new_links: fresh.len(),
        })
    }
    .instrument(span)
    .await
}

async fn list_new_links(
    ticketing: &dyn TicketingSource,
    cursor: u64,
    known: &HashSet<u64>,
) -> Result<BTreeMap<u64, Link>, SyncError> {
    let mut fresh = BTreeMap::new();
    let mut after = cursor.to_string();
    let mut visited = HashSet::from([after.clone()]);
    loop {
        let page = ticketing.list_links(&after).await?;
        debug!(after = %after, links = page.links.len(), has_more = page.has_more, "link page");
        for link in page.links {
            if link.id > cursor && !known.contains(&link.id) {
                fresh.entry(link.id).or_insert(link);
            }
        }
        match (page.has_more, page.after_cursor) {
            (true, Some(next)) if visited.insert(next.clone()) => after = next,
            _ => break,
        }
    }
    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture_source, seed_main, staged_ids};
    use tilr_adapters::SourceOp;
    use tilr_storage::{MemoryTableStore, StoreError};

    #[tokio::test]
    async fn first_fetch_stages_every_listed_link() {
        let tables = MemoryTableStore::with_default_tables();
        let source = fixture_source();

        let outcome = run_fetch(&tables, &source, 0).await.expect("fetch");
        assert_eq!(outcome.cursor, 13);
        assert_eq!(outcome.new_links, 4);
        assert_eq!(staged_ids(&tables).await, vec![(10, false), (11, false), (12, false), (13, false)]);

        let diff = tables.read_all(TableName::Diff).await.expect("diff");
        assert_eq!(diff.headers, diff_headers());
        let first = StagedRow::from_cells(&diff.headers, &diff.rows[0]).expect("row");
        assert_eq!(first.row.ticket_id, 500);
        assert_eq!(first.row.ticket_status, "");
    }

    #[tokio::test]
    async fn cursor_covers_main_and_skips_known_links() {
        let tables = MemoryTableStore::with_default_tables();
        seed_main(&tables, &[11, 12]).await;
        let source = fixture_source();

        let outcome = run_fetch(&tables, &source, 0).await.expect("fetch");
        assert_eq!(outcome.cursor, 13);
        assert_eq!(outcome.carried_rows, 2);
        assert_eq!(outcome.new_links, 1);
        assert_eq!(staged_ids(&tables).await, vec![(11, false), (12, false), (13, false)]);
    }

    #[tokio::test]
    async fn persisted_cursor_never_moves_backwards() {
        let tables = MemoryTableStore::with_default_tables();
        let source = fixture_source();

        let outcome = run_fetch(&tables, &source, 50).await.expect("fetch");
        assert_eq!(outcome.cursor, 50);
        assert_eq!(outcome.new_links, 0);
        assert!(staged_ids(&tables).await.is_empty());
    }

    #[tokio::test]
    async fn missing_main_table_writes_nothing() {
        let tables = MemoryTableStore::new();
        tables.ensure_table(TableName::Diff).await.expect("diff");
        let source = fixture_source();

        let err = run_fetch(&tables, &source, 0).await.expect_err("missing main");
        assert!(matches!(err, SyncError::Store(StoreError::MissingTable("main"))));
        assert_eq!(source.calls(SourceOp::ListLinks), 0);
    }

    #[tokio::test]
    async fn listing_failure_leaves_diff_untouched() {
        let tables = MemoryTableStore::with_default_tables();
        let source = fixture_source();
        run_fetch(&tables, &source, 0).await.expect("fetch");
        let before = tables.read_all(TableName::Diff).await.expect("diff");

        source.fail_on(SourceOp::ListLinks);
        assert!(run_fetch(&tables, &source, 0).await.is_err());
        assert_eq!(tables.read_all(TableName::Diff).await.expect("diff"), before);
    }
}
