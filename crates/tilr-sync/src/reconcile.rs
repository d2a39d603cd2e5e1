//! Compares the enriched batch against the previous snapshot, logs field
//! changes and partitions rows into `main` and `archive`.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tilr_core::{
    changelog_headers, is_blank_row, link_headers, ArchivePolicy, ChangeNote, ChangelogEntry,
    LinkRow,
};
use tilr_storage::{Table, TableName, TabularStore};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::error::{integrity, SyncError};
use crate::rows::{column_index, decode_links, decode_staged, headers_or};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Entries actually written; retries skip ones already present.
    pub written: usize,
    pub active: usize,
    pub archived: usize,
}

/// Field-level changes between a batch and its baselines.
///
/// The baseline of a link is its `main` row, else its `archive` row. Links
/// with neither are logged as created; `main` links absent from the batch as
/// deleted.
pub fn compute_changes(
    cycle_id: &Uuid,
    now: DateTime<Utc>,
    batch: &[LinkRow],
    main: &[LinkRow],
    archive: &[LinkRow],
) -> Vec<ChangelogEntry> {
    let mut previous: BTreeMap<u64, &LinkRow> = main.iter().map(|r| (r.link_id, r)).collect();
    let archived: HashMap<u64, &LinkRow> = archive.iter().map(|r| (r.link_id, r)).collect();

    let mut entries = Vec::new();
    for row in batch {
        let baseline = previous
            .remove(&row.link_id)
            .or_else(|| archived.get(&row.link_id).copied());
        match baseline {
            Some(baseline) => {
                for ((field, before), (_, after)) in baseline.fields().zip(row.fields()) {
                    if before != after {
                        entries.push(ChangelogEntry::new(
                            cycle_id,
                            now,
                            row.link_id,
                            field,
                            before,
                            after,
                        ));
                    }
                }
            }
            None => {
                let id = row.link_id.to_string();
                entries.push(ChangelogEntry::new(cycle_id, now, row.link_id, "link_id", "", id));
            }
        }
    }
    for link_id in previous.into_keys() {
        let id = link_id.to_string();
        entries.push(ChangelogEntry::new(cycle_id, now, link_id, "link_id", id, ""));
    }
    entries
}

/// Writes changelog, archive, main and finally clears `diff`. Re-running after
/// an interruption at any step converges on the same tables.
pub async fn run_reconcile(
    tables: &dyn TabularStore,
    policy: &ArchivePolicy,
    cycle_id: Uuid,
    now: DateTime<Utc>,
) -> Result<ReconcileOutcome, SyncError> {
    let span = info_span!("reconcile_phase", %cycle_id);
    async move {
        let diff = tables.read_all(TableName::Diff).await?;
        let main = tables.read_all(TableName::Main).await?;
        let archive = tables.read_all(TableName::Archive).await?;
        let changelog = tables.read_all(TableName::Changelog).await?;

        let staged = decode_staged(&diff)?;
        if staged.is_empty() {
            info!("diff is empty; nothing to reconcile");
            return Ok(ReconcileOutcome::default());
        }
        if let Some(pending) = staged.iter().find(|s| !s.enriched) {
            return Err(integrity(format!(
                "diff row for link {} was never enriched",
                pending.row.link_id
            )));
        }

        let mut seen = HashSet::new();
        let mut batch = Vec::with_capacity(staged.len());
        for staged_row in staged {
            if seen.insert(staged_row.row.link_id) {
                batch.push(staged_row.row);
            } else {
                warn!(link_id = staged_row.row.link_id, "duplicate link in diff; keeping first");
            }
        }

        let columns = SortColumns {
            changelog_date: column_index(
                TableName::Changelog,
                &headers_or(&changelog, changelog_headers),
                "date",
            )?,
            archive_link: column_index(
                TableName::Archive,
                &headers_or(&archive, link_headers),
                "link_id",
            )?,
            main_link: column_index(TableName::Main, &link_headers(), "link_id")?,
        };

        let main_rows = decode_links(TableName::Main, &main)?;
        let archive_rows = decode_links(TableName::Archive, &archive)?;
        let entries = compute_changes(&cycle_id, now, &batch, &main_rows, &archive_rows);

        let (archived, active): (Vec<LinkRow>, Vec<LinkRow>) =
            batch.into_iter().partition(|row| policy.should_archive(row));

        let mut outcome = ReconcileOutcome {
            active: active.len(),
            archived: archived.len(),
            ..ReconcileOutcome::default()
        };
        for entry in &entries {
            match entry.note {
                ChangeNote::Created => outcome.created += 1,
                ChangeNote::Updated => outcome.updated += 1,
                ChangeNote::Deleted => outcome.deleted += 1,
            }
        }

        outcome.written = write_changelog(tables, &changelog, &entries, columns.changelog_date).await?;
        write_archive(tables, &archive, &seen, &archived, columns.archive_link).await?;
        write_main(tables, &main, &active, columns.main_link).await?;
        tables.clear(TableName::Diff).await?;

        info!(
            created = outcome.created,
            updated = outcome.updated,
            deleted = outcome.deleted,
            written = outcome.written,
            active = outcome.active,
            archived = outcome.archived,
            "reconciled cycle"
        );
        Ok(outcome)
    }
    .instrument(span)
    .await
}

/// Columns each table is sorted on, resolved before the first write.
struct SortColumns {
    changelog_date: usize,
    archive_link: usize,
    main_link: usize,
}

/// Positions of rows left blank by an interrupted insert.
fn blank_positions(table: &Table) -> impl Iterator<Item = usize> + '_ {
    table
        .rows
        .iter()
        .enumerate()
        .filter(|(_, cells)| is_blank_row(cells))
        .map(|(position, _)| position)
}

async fn delete_positions(
    tables: &dyn TabularStore,
    table: TableName,
    mut positions: Vec<usize>,
) -> Result<(), SyncError> {
    positions.sort_unstable();
    positions.dedup();
    for position in positions.into_iter().rev() {
        tables.delete_rows(table, position, 1).await?;
    }
    Ok(())
}

async fn write_changelog(
    tables: &dyn TabularStore,
    changelog: &Table,
    entries: &[ChangelogEntry],
    date_col: usize,
) -> Result<usize, SyncError> {
    let existing: HashSet<String> = changelog
        .data_rows()
        .filter_map(|cells| ChangelogEntry::entry_id_of(&changelog.headers, cells))
        .collect();
    let fresh: Vec<Vec<String>> = entries
        .iter()
        .filter(|e| !existing.contains(&e.entry_id))
        .map(ChangelogEntry::to_cells)
        .collect();

    if changelog.headers.is_empty() {
        if fresh.is_empty() {
            return Ok(0);
        }
        tables
            .write_headers(TableName::Changelog, &changelog_headers())
            .await?;
    }
    delete_positions(tables, TableName::Changelog, blank_positions(changelog).collect()).await?;
    if !fresh.is_empty() {
        tables.insert_rows(TableName::Changelog, 0, fresh.len()).await?;
        tables.write_range(TableName::Changelog, 0, &fresh).await?;
    }
    tables.sort_by_column(TableName::Changelog, date_col).await?;
    Ok(fresh.len())
}

async fn write_archive(
    tables: &dyn TabularStore,
    archive: &Table,
    batch_ids: &HashSet<u64>,
    archived: &[LinkRow],
    link_col: usize,
) -> Result<(), SyncError> {
    let mut removable: Vec<usize> = archive
        .rows
        .iter()
        .enumerate()
        .filter(|(_, cells)| {
            cells
                .get(link_col)
                .and_then(|c| c.trim().parse::<u64>().ok())
                .is_some_and(|id| batch_ids.contains(&id))
        })
        .map(|(position, _)| position)
        .collect();
    removable.extend(blank_positions(archive));
    if removable.is_empty() && archived.is_empty() {
        return Ok(());
    }

    delete_positions(tables, TableName::Archive, removable).await?;
    if archive.headers.is_empty() {
        tables.write_headers(TableName::Archive, &link_headers()).await?;
    }
    if !archived.is_empty() {
        let cells: Vec<Vec<String>> = archived.iter().map(LinkRow::to_cells).collect();
        tables.insert_rows(TableName::Archive, 0, cells.len()).await?;
        tables.write_range(TableName::Archive, 0, &cells).await?;
    }
    tables.sort_by_column(TableName::Archive, link_col).await?;
    Ok(())
}

/// Rewrites `main` in place: headers, then the active rows over the old ones,
/// then any surplus old rows removed.
async fn write_main(
    tables: &dyn TabularStore,
    main: &Table,
    active: &[LinkRow],
    link_col: usize,
) -> Result<(), SyncError> {
    let mut rows: Vec<&LinkRow> = active.iter().collect();
    rows.sort_by_key(|r| r.link_id);
    let cells: Vec<Vec<String>> = rows.into_iter().map(LinkRow::to_cells).collect();

    tables.write_headers(TableName::Main, &link_headers()).await?;
    tables.write_range(TableName::Main, 0, &cells).await?;
    let previous = main.rows.len();
    if previous > cells.len() {
        tables
            .delete_rows(TableName::Main, cells.len(), previous - cells.len())
            .await?;
    }
    tables.sort_by_column(TableName::Main, link_col).await?;
    Ok(())
}
