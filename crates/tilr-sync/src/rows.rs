use tilr_core::{LinkRow, StagedRow};
use tilr_storage::{Table, TableName};

use crate::error::{integrity, SyncError};

pub(crate) fn decode_links(name: TableName, table: &Table) -> Result<Vec<LinkRow>, SyncError> {
    table
        .data_rows()
        .map(|cells| {
            LinkRow::from_cells(&table.headers, cells)
                .map_err(|err| integrity(format!("{} table: {err}", name.as_str())))
        })
        .collect()
}

pub(crate) fn decode_staged(table: &Table) -> Result<Vec<StagedRow>, SyncError> {
    table
        .data_rows()
        .map(|cells| {
            StagedRow::from_cells(&table.headers, cells)
                .map_err(|err| integrity(format!("diff table: {err}")))
        })
        .collect()
}

/// Position of `column` in `headers`. A table missing a column the sync
/// sorts or matches on is corrupt.
pub(crate) fn column_index(
    table: TableName,
    headers: &[String],
    column: &str,
) -> Result<usize, SyncError> {
    headers.iter().position(|h| h == column).ok_or_else(|| {
        integrity(format!("{} table has no `{column}` column", table.as_str()))
    })
}

/// Header row the table has, or the canonical one it will be given.
pub(crate) fn headers_or(table: &Table, canonical: fn() -> Vec<String>) -> Vec<String> {
    if table.headers.is_empty() {
        canonical()
    } else {
        table.headers.clone()
    }
}

/// One past the last non-blank row.
pub(crate) fn used_rows(rows: &[Vec<String>]) -> usize {
    rows.iter()
        .rposition(|r| !tilr_core::is_blank_row(r))
        .map_or(0, |p| p + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sort_column_is_an_integrity_error() {
        let headers = vec!["ticket_id".to_string(), "link_id".to_string()];
        assert_eq!(column_index(TableName::Archive, &headers, "link_id").expect("present"), 1);

        let err = column_index(TableName::Changelog, &headers, "date").expect_err("absent");
        assert!(matches!(err, SyncError::Integrity(ref m) if m.contains("changelog") && m.contains("date")));
    }

    #[test]
    fn headerless_tables_use_the_canonical_row() {
        let empty = Table::default();
        assert_eq!(headers_or(&empty, tilr_core::link_headers), tilr_core::link_headers());

        let custom = Table {
            headers: vec!["link_id".to_string()],
            rows: Vec::new(),
        };
        assert_eq!(headers_or(&custom, tilr_core::link_headers), vec!["link_id".to_string()]);
    }
}
