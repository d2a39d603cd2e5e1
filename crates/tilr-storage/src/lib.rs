//! Durable table + continuation stores and the HTTP fetch utilities for TILR.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tilr-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("table `{0}` does not exist")]
    MissingTable(&'static str),
    #[error("rows {start}..{end} are outside table `{table}` ({len} rows)")]
    RowOutOfRange {
        table: &'static str,
        start: usize,
        end: usize,
        len: usize,
    },
    #[error("column {column} is outside table `{table}` ({width} columns)")]
    ColumnOutOfRange {
        table: &'static str,
        column: usize,
        width: usize,
    },
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt document {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Replace `path` with `bytes` via a sibling temp file and rename, so readers
/// only ever see the old or the new document.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await.map_err(io_error(parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_error(&temp_path))?;
    file.write_all(bytes).await.map_err(io_error(&temp_path))?;
    file.flush().await.map_err(io_error(&temp_path))?;
    file.sync_all().await.map_err(io_error(&temp_path))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableName {
    Main,
    Diff,
    Archive,
    Changelog,
}

impl TableName {
    pub const ALL: [TableName; 4] = [Self::Main, Self::Diff, Self::Archive, Self::Changelog];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Diff => "diff",
            Self::Archive => "archive",
            Self::Changelog => "changelog",
        }
    }

    pub fn default_headers(self) -> Vec<String> {
        match self {
            Self::Main | Self::Archive => tilr_core::link_headers(),
            Self::Diff => tilr_core::diff_headers(),
            Self::Changelog => tilr_core::changelog_headers(),
        }
    }
}

/// A header row plus data rows of string cells.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default)]
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Data rows that carry at least one non-blank cell.
    pub fn data_rows(&self) -> impl Iterator<Item = &Vec<String>> {
        self.rows.iter().filter(|r| !tilr_core::is_blank_row(r))
    }
}

/// Orders cells the way a spreadsheet sort does: numbers numerically and before
/// text, text lexicographically, blanks last.
pub fn compare_cells(a: &str, b: &str) -> Ordering {
    let (a, b) = (a.trim(), b.trim());
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        _ => {}
    }
    match (a.parse::<f64>(), b.parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Row-ordered named tables. Row positions are 0-based and exclude the header.
///
/// Implementors provide whole-table load/store; the ranged operations are
/// expressed on top of those.
#[async_trait]
pub trait TabularStore: Send + Sync {
    async fn exists(&self, table: TableName) -> Result<bool, StoreError>;

    /// Full contents; `MissingTable` when the table was never created.
    async fn read_all(&self, table: TableName) -> Result<Table, StoreError>;

    async fn store(&self, table: TableName, contents: &Table) -> Result<(), StoreError>;

    /// Creates the table with its canonical headers if absent.
    async fn ensure_table(&self, table: TableName) -> Result<bool, StoreError> {
        if self.exists(table).await? {
            return Ok(false);
        }
        self.store(table, &Table::new(table.default_headers())).await?;
        Ok(true)
    }

    async fn write_headers(&self, table: TableName, headers: &[String]) -> Result<(), StoreError> {
        let mut contents = self.read_all(table).await?;
        contents.headers = headers.to_vec();
        self.store(table, &contents).await
    }

    /// Overwrites whole rows starting at `start_row`, growing the table as needed.
    async fn write_range(
        &self,
        table: TableName,
        start_row: usize,
        rows: &[Vec<String>],
    ) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut contents = self.read_all(table).await?;
        let end = start_row + rows.len();
        if contents.rows.len() < end {
            contents.rows.resize(end, Vec::new());
        }
        for (slot, row) in contents.rows[start_row..end].iter_mut().zip(rows) {
            *slot = row.clone();
        }
        self.store(table, &contents).await
    }

    async fn insert_rows(&self, table: TableName, at: usize, count: usize) -> Result<(), StoreError> {
        if count == 0 {
            return Ok(());
        }
        let mut contents = self.read_all(table).await?;
        if at > contents.rows.len() {
            return Err(StoreError::RowOutOfRange {
                table: table.as_str(),
                start: at,
                end: at + count,
                len: contents.rows.len(),
            });
        }
        contents
            .rows
            .splice(at..at, std::iter::repeat_with(Vec::new).take(count));
        self.store(table, &contents).await
    }

    async fn delete_rows(&self, table: TableName, at: usize, count: usize) -> Result<(), StoreError> {
        if count == 0 {
            return Ok(());
        }
        let mut contents = self.read_all(table).await?;
        if at + count > contents.rows.len() {
            return Err(StoreError::RowOutOfRange {
                table: table.as_str(),
                start: at,
                end: at + count,
                len: contents.rows.len(),
            });
        }
        contents.rows.drain(at..at + count);
        self.store(table, &contents).await
    }

    /// Stable ascending sort of the data rows by one column.
    async fn sort_by_column(&self, table: TableName, column: usize) -> Result<(), StoreError> {
        let mut contents = self.read_all(table).await?;
        if column >= contents.headers.len() {
            return Err(StoreError::ColumnOutOfRange {
                table: table.as_str(),
                column,
                width: contents.headers.len(),
            });
        }
        contents.rows.sort_by(|a, b| {
            let left = a.get(column).map(String::as_str).unwrap_or_default();
            let right = b.get(column).map(String::as_str).unwrap_or_default();
            compare_cells(left, right)
        });
        self.store(table, &contents).await
    }

    /// Removes the header row and every data row.
    async fn clear(&self, table: TableName) -> Result<(), StoreError> {
        if !self.exists(table).await? {
            return Err(StoreError::MissingTable(table.as_str()));
        }
        self.store(table, &Table::default()).await
    }
}

/// One JSON document per table under `root`.
#[derive(Debug, Clone)]
pub struct FileTableStore {
    root: PathBuf,
}

impl FileTableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, table: TableName) -> PathBuf {
        self.root.join(format!("{}.json", table.as_str()))
    }
}

#[async_trait]
impl TabularStore for FileTableStore {
    async fn exists(&self, table: TableName) -> Result<bool, StoreError> {
        let path = self.table_path(table);
        fs::try_exists(&path).await.map_err(io_error(&path))
    }

    async fn read_all(&self, table: TableName) -> Result<Table, StoreError> {
        let path = self.table_path(table);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::MissingTable(table.as_str()))
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { path, source })
    }

    async fn store(&self, table: TableName, contents: &Table) -> Result<(), StoreError> {
        let path = self.table_path(table);
        let bytes = serde_json::to_vec(contents).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes).await
    }
}

/// Process-local tables, used by tests and fixture runs.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tables: Mutex<HashMap<TableName, Table>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All four tables, created empty with their canonical headers.
    pub fn with_default_tables() -> Self {
        let tables = TableName::ALL
            .into_iter()
            .map(|t| (t, Table::new(t.default_headers())))
            .collect();
        Self {
            tables: Mutex::new(tables),
        }
    }
}

#[async_trait]
impl TabularStore for MemoryTableStore {
    async fn exists(&self, table: TableName) -> Result<bool, StoreError> {
        Ok(self.tables.lock().await.contains_key(&table))
    }

    async fn read_all(&self, table: TableName) -> Result<Table, StoreError> {
        self.tables
            .lock()
            .await
            .get(&table)
            .cloned()
            .ok_or(StoreError::MissingTable(table.as_str()))
    }

    async fn store(&self, table: TableName, contents: &Table) -> Result<(), StoreError> {
        self.tables.lock().await.insert(table, contents.clone());
        Ok(())
    }
}

/// One key change: `Some` sets the value, `None` removes the key.
pub type KeyChange<'a> = (&'a str, Option<&'a str>);

/// Durable string key/value pairs carried from one tick to the next.
#[async_trait]
pub trait ContinuationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Applies every change or none of them.
    async fn apply(&self, changes: &[KeyChange<'_>]) -> Result<(), StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.apply(&[(key, Some(value))]).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.apply(&[(key, None)]).await
    }
}

/// Returns whether `values` changed.
fn apply_changes(values: &mut BTreeMap<String, String>, changes: &[KeyChange<'_>]) -> bool {
    let mut changed = false;
    for (key, value) in changes {
        changed |= match value {
            Some(value) => {
                values.insert((*key).to_string(), (*value).to_string()).as_deref() != Some(*value)
            }
            None => values.remove(*key).is_some(),
        };
    }
    changed
}

/// All keys in one JSON object, rewritten atomically on every change.
#[derive(Debug)]
pub struct FileContinuationStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileContinuationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: self.path.clone(),
                source,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(source) => Err(StoreError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn save(&self, values: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(values).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &bytes).await
    }
}

#[async_trait]
impl ContinuationStore for FileContinuationStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.load().await?.remove(key))
    }

    async fn apply(&self, changes: &[KeyChange<'_>]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut values = self.load().await?;
        if apply_changes(&mut values, changes) {
            self.save(&values).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryContinuationStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryContinuationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContinuationStore for MemoryContinuationStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn apply(&self, changes: &[KeyChange<'_>]) -> Result<(), StoreError> {
        apply_changes(&mut *self.values.lock().await, changes);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    /// Server errors and throttling are worth another attempt.
    pub fn of_status(status: StatusCode) -> Self {
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }

    pub fn of_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Retries allowed for a request method. Link creation and other
    /// non-idempotent requests get a single attempt.
    pub fn retries_for(&self, method: &Method) -> usize {
        if *method == Method::GET {
            self.max_retries
        } else {
            0
        }
    }

    /// Doubles from `base_delay`, never above `max_delay`.
    pub fn delay(&self, retry: usize) -> Duration {
        let factor = u32::try_from(retry)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub basic_auth: Option<BasicAuth>,
    pub max_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            basic_auth: None,
            max_concurrency: 8,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bursts up to `requests` at once, refilling evenly over a minute.
    pub fn per_minute(requests: u32) -> Self {
        let requests = requests.max(1);
        Self {
            capacity: requests,
            refill_every: Duration::from_secs(60) / requests,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a request slot is free. Refills are counted in whole
    /// intervals so partial progress toward the next token is kept.
    pub async fn take(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                if !self.refill_every.is_zero() {
                    let elapsed = state.last_refill.elapsed();
                    let intervals = elapsed.as_nanos() / self.refill_every.as_nanos();
                    if intervals > 0 {
                        let gained = u32::try_from(intervals).unwrap_or(u32::MAX);
                        if state.tokens.saturating_add(gained) >= self.capacity {
                            state.tokens = self.capacity;
                            state.last_refill = Instant::now();
                        } else {
                            state.tokens += gained;
                            state.last_refill += self.refill_every * gained;
                        }
                    }
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
                self.refill_every
                    .saturating_sub(state.last_refill.elapsed())
                    .max(Duration::from_millis(1))
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("http client is shut down")]
    Closed,
}

/// Authenticated JSON client with bounded concurrency and retry/backoff.
///
/// Only GET requests are retried; a POST that reached the server is never
/// replayed.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    basic_auth: Option<BasicAuth>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c)));

        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            token_bucket,
            basic_auth: config.basic_auth,
            backoff: config.backoff,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let body = self.execute(Method::GET, url, None).await?;
        decode(url, &body)
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<T, FetchError> {
        let body = self.execute(Method::POST, url, Some(payload)).await?;
        decode(url, &body)
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        payload: Option<&serde_json::Value>,
    ) -> Result<Vec<u8>, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let span = info_span!("http_request", %method, url);
        let max_retries = self.backoff.retries_for(&method);

        async move {
            let mut attempt = 0;
            loop {
                if let Some(bucket) = &self.token_bucket {
                    bucket.take().await;
                }

                let mut request = self.client.request(method.clone(), url);
                if let Some(auth) = &self.basic_auth {
                    request = request.basic_auth(&auth.username, Some(&auth.password));
                }
                if let Some(payload) = payload {
                    request = request.json(payload);
                }

                match request.send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if status.is_success() {
                            return Ok(resp.bytes().await?.to_vec());
                        }
                        if RetryDisposition::of_status(status) == RetryDisposition::Retryable
                            && attempt < max_retries
                        {
                            warn!(%status, attempt, "retrying after retryable status");
                            tokio::time::sleep(self.backoff.delay(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: resp.url().to_string(),
                        });
                    }
                    Err(err) => {
                        if RetryDisposition::of_error(&err) == RetryDisposition::Retryable
                            && attempt < max_retries
                        {
                            warn!(error = %err, attempt, "retrying after transport error");
                            tokio::time::sleep(self.backoff.delay(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(FetchError::Request(err));
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn decode<T: DeserializeOwned>(url: &str, body: &[u8]) -> Result<T, FetchError> {
    serde_json::from_slice(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn cells_sort_numbers_before_text_and_blanks_last() {
        let mut cells = vec!["10", "", "9", "abc", "100", "2.5"];
        cells.sort_by(|a, b| compare_cells(a, b));
        assert_eq!(cells, vec!["2.5", "9", "10", "100", "abc", ""]);
    }

    #[tokio::test]
    async fn ranged_operations_edit_rows_in_place() {
        let store = MemoryTableStore::with_default_tables();
        let table = TableName::Changelog;
        store
            .write_range(table, 0, &[row(&["b", "2"]), row(&["a", "10"])])
            .await
            .expect("write");
        store.insert_rows(table, 0, 2).await.expect("insert");
        store
            .write_range(table, 0, &[row(&["c", "1"])])
            .await
            .expect("write head");
        store.sort_by_column(table, 1).await.expect("sort");

        let contents = store.read_all(table).await.expect("read");
        assert_eq!(contents.rows.len(), 4);
        assert_eq!(contents.rows[0], row(&["c", "1"]));
        assert_eq!(contents.rows[1], row(&["b", "2"]));
        assert_eq!(contents.rows[2], row(&["a", "10"]));
        assert!(contents.rows[3].is_empty());
        assert_eq!(contents.data_rows().count(), 3);

        store.delete_rows(table, 1, 2).await.expect("delete");
        let contents = store.read_all(table).await.expect("read");
        assert_eq!(contents.rows.len(), 2);
        assert_eq!(contents.headers, tilr_core::changelog_headers());
    }

    #[tokio::test]
    async fn out_of_range_edits_are_rejected() {
        let store = MemoryTableStore::with_default_tables();
        let err = store
            .delete_rows(TableName::Diff, 0, 1)
            .await
            .expect_err("empty table");
        assert!(matches!(err, StoreError::RowOutOfRange { table: "diff", .. }));

        let err = store
            .sort_by_column(TableName::Changelog, 99)
            .await
            .expect_err("bad column");
        assert!(matches!(err, StoreError::ColumnOutOfRange { .. }));
    }

    #[tokio::test]
    async fn file_tables_persist_and_report_missing_tables() {
        let dir = tempdir().expect("tempdir");
        let store = FileTableStore::new(dir.path());

        let err = store.read_all(TableName::Main).await.expect_err("missing");
        assert!(matches!(err, StoreError::MissingTable("main")));
        assert!(matches!(
            store.clear(TableName::Main).await,
            Err(StoreError::MissingTable("main"))
        ));

        assert!(store.ensure_table(TableName::Main).await.expect("create"));
        assert!(!store.ensure_table(TableName::Main).await.expect("exists"));
        store
            .write_range(TableName::Main, 0, &[row(&["1", "x"])])
            .await
            .expect("write");

        let reopened = FileTableStore::new(dir.path());
        let contents = reopened.read_all(TableName::Main).await.expect("read");
        assert_eq!(contents.headers, tilr_core::link_headers());
        assert_eq!(contents.rows, vec![row(&["1", "x"])]);
        assert!(store.table_path(TableName::Main).exists());

        store.clear(TableName::Main).await.expect("clear");
        assert_eq!(
            reopened.read_all(TableName::Main).await.expect("read"),
            Table::default()
        );
    }

    #[tokio::test]
    async fn continuation_values_survive_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let store = FileContinuationStore::new(&path);
        assert_eq!(store.get("TASK").await.expect("get"), None);

        store.set("TASK", "RUNNING").await.expect("set");
        store.set("CHUNK_CURSOR", "200").await.expect("set");
        store.remove("CHUNK_CURSOR").await.expect("remove");

        let reopened = FileContinuationStore::new(&path);
        assert_eq!(reopened.get("TASK").await.expect("get").as_deref(), Some("RUNNING"));
        assert_eq!(reopened.get("CHUNK_CURSOR").await.expect("get"), None);
    }

    #[tokio::test]
    async fn batched_changes_land_together() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let store = FileContinuationStore::new(&path);
        store.set("CYCLE_ID", "abc").await.expect("set");

        store
            .apply(&[
                ("FETCH_CURSOR", Some("13")),
                ("CYCLE_ID", None),
                ("TASK", Some("DIFF")),
            ])
            .await
            .expect("apply");

        let reopened = FileContinuationStore::new(&path);
        assert_eq!(reopened.get("FETCH_CURSOR").await.expect("get").as_deref(), Some("13"));
        assert_eq!(reopened.get("TASK").await.expect("get").as_deref(), Some("DIFF"));
        assert_eq!(reopened.get("CYCLE_ID").await.expect("get"), None);
    }

    #[test]
    fn only_reads_are_retried() {
        let policy = HttpClientConfig::default().backoff;
        assert_eq!(policy.retries_for(&Method::GET), 3);
        assert_eq!(policy.retries_for(&Method::POST), 0);
        assert_eq!(policy.retries_for(&Method::PUT), 0);
    }

    #[test]
    fn default_backoff_doubles_up_to_five_seconds() {
        let policy = BackoffPolicy::default();
        let delays: Vec<u128> = (0..7).map(|retry| policy.delay(retry).as_millis()).collect();
        assert_eq!(delays, vec![250, 500, 1000, 2000, 4000, 5000, 5000]);
        assert_eq!(policy.delay(usize::MAX), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn token_bucket_spends_its_burst_without_waiting() {
        let bucket = SimpleTokenBucket::new(TokenBucketConfig::per_minute(3));
        let started = Instant::now();
        for _ in 0..3 {
            bucket.take().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn token_bucket_per_minute_spreads_refills() {
        let config = TokenBucketConfig::per_minute(120);
        assert_eq!(config.capacity, 120);
        assert_eq!(config.refill_every, Duration::from_millis(500));
        assert_eq!(TokenBucketConfig::per_minute(0).capacity, 1);
    }

    #[test]
    fn throttled_and_failing_upstreams_are_retryable() {
        let retryable = [StatusCode::TOO_MANY_REQUESTS, StatusCode::BAD_GATEWAY];
        for status in retryable {
            assert_eq!(RetryDisposition::of_status(status), RetryDisposition::Retryable);
        }
        for status in [StatusCode::NOT_FOUND, StatusCode::UNAUTHORIZED, StatusCode::CONFLICT] {
            assert_eq!(RetryDisposition::of_status(status), RetryDisposition::NonRetryable);
        }
    }
}
