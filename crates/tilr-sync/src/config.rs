use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tilr_adapters::{
    HttpIssueTrackerSource, HttpTicketingSource, IssueTrackerSource, TicketingSource,
    DEFAULT_TEAM_FIELD,
};
use tilr_core::ArchivePolicy;
use tilr_storage::{
    BasicAuth, FileContinuationStore, FileTableStore, HttpClientConfig, HttpFetcher,
    TokenBucketConfig,
};

pub const DEFAULT_CHUNK_SIZE: usize = 100;
pub const DEFAULT_CONTINUE_EVERY_MINUTES: u64 = 5;
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * *";

#[derive(Debug, Clone, Default)]
pub struct ApiCredentials {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ApiCredentials {
    fn basic_auth(&self) -> Option<BasicAuth> {
        self.username.as_ref().map(|username| BasicAuth {
            username: username.clone(),
            password: self.password.clone().unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub workspace_root: PathBuf,
    pub ticketing: ApiCredentials,
    pub ticketing_services_url: Option<String>,
    pub issue_tracker: ApiCredentials,
    pub team_field: String,
    pub chunk_size: usize,
    pub continue_every: Duration,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub rate_limit_per_minute: Option<u32>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str| var(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            data_dir: var("TILR_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            workspace_root: var("TILR_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            ticketing: ApiCredentials {
                base_url: var("TICKETING_BASE_URL"),
                username: var("TICKETING_USERNAME"),
                password: var("TICKETING_PASSWORD"),
            },
            ticketing_services_url: var("TICKETING_SERVICES_URL"),
            issue_tracker: ApiCredentials {
                base_url: var("ISSUE_TRACKER_BASE_URL"),
                username: var("ISSUE_TRACKER_USERNAME"),
                password: var("ISSUE_TRACKER_PASSWORD"),
            },
            team_field: var("ISSUE_TRACKER_TEAM_FIELD")
                .unwrap_or_else(|| DEFAULT_TEAM_FIELD.to_string()),
            chunk_size: number("TILR_CHUNK_SIZE")
                .map(|n| n as usize)
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_CHUNK_SIZE),
            continue_every: Duration::from_secs(
                60 * number("TILR_CONTINUE_EVERY_MINUTES")
                    .filter(|n| *n > 0)
                    .unwrap_or(DEFAULT_CONTINUE_EVERY_MINUTES),
            ),
            sync_cron: var("TILR_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
            user_agent: var("TILR_USER_AGENT").unwrap_or_else(|| "tilr-bot/0.1".to_string()),
            http_timeout_secs: number("TILR_HTTP_TIMEOUT_SECS").unwrap_or(20),
            rate_limit_per_minute: number("TILR_RATE_LIMIT_PER_MINUTE").map(|n| n as u32),
        }
    }

    pub fn tables_dir(&self) -> PathBuf {
        self.data_dir.join("tables")
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state.json")
    }

    pub fn table_store(&self) -> FileTableStore {
        FileTableStore::new(self.tables_dir())
    }

    pub fn continuation_store(&self) -> FileContinuationStore {
        FileContinuationStore::new(self.state_path())
    }

    pub fn archive_policy(&self) -> Result<ArchivePolicy> {
        load_archive_policy(&self.workspace_root)
    }

    fn http_client(&self, credentials: &ApiCredentials) -> Result<Arc<HttpFetcher>> {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            basic_auth: credentials.basic_auth(),
            token_bucket: self.rate_limit_per_minute.map(TokenBucketConfig::per_minute),
            ..Default::default()
        })?;
        Ok(Arc::new(fetcher))
    }

    /// HTTP clients for both systems. Base URLs are required; the services URL
    /// falls back to the ticketing base URL.
    pub fn http_sources(
        &self,
    ) -> Result<(Arc<dyn TicketingSource>, Arc<dyn IssueTrackerSource>)> {
        let ticketing_url = self
            .ticketing
            .base_url
            .clone()
            .context("TICKETING_BASE_URL is not set")?;
        let tracker_url = self
            .issue_tracker
            .base_url
            .clone()
            .context("ISSUE_TRACKER_BASE_URL is not set")?;
        let services_url = self
            .ticketing_services_url
            .clone()
            .unwrap_or_else(|| ticketing_url.clone());

        let ticketing = HttpTicketingSource::new(
            self.http_client(&self.ticketing)?,
            ticketing_url,
            services_url,
        );
        let tracker = HttpIssueTrackerSource::new(
            self.http_client(&self.issue_tracker)?,
            tracker_url,
            self.team_field.clone(),
        );
        Ok((Arc::new(ticketing), Arc::new(tracker)))
    }
}

/// Reads `rules/archive.yaml` under `root`, or the default policy when absent.
pub fn load_archive_policy(root: &Path) -> Result<ArchivePolicy> {
    let path = root.join("rules").join("archive.yaml");
    if !path.exists() {
        return Ok(ArchivePolicy::default());
    }
    let text = std::fs::read_to_string(&path).context("reading rules/archive.yaml")?;
    serde_yaml::from_str(&text).context("parsing rules/archive.yaml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn defaults_apply_when_unset_or_blank() {
        let config = SyncConfig::from_lookup(|key| (key == "TILR_CHUNK_SIZE").then(|| " ".to_string()));
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.continue_every, Duration::from_secs(300));
        assert_eq!(config.sync_cron, DEFAULT_SYNC_CRON);
        assert_eq!(config.team_field, DEFAULT_TEAM_FIELD);
        assert_eq!(config.state_path(), PathBuf::from("./data").join("state.json"));
        assert!(config.rate_limit_per_minute.is_none());
        assert!(config.http_sources().is_err());
    }

    #[test]
    fn environment_values_override_defaults() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TILR_DATA_DIR", "/var/lib/tilr"),
            ("TILR_CHUNK_SIZE", "25"),
            ("TILR_CONTINUE_EVERY_MINUTES", "2"),
            ("ISSUE_TRACKER_TEAM_FIELD", "customfield_100"),
            ("TILR_RATE_LIMIT_PER_MINUTE", "300"),
            ("TICKETING_BASE_URL", "https://desk.example.com/api/v2/"),
            ("ISSUE_TRACKER_BASE_URL", "https://issues.example.com/rest/api/3/"),
            ("TICKETING_USERNAME", "bot@example.com/token"),
        ]);
        let config = SyncConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.tables_dir(), PathBuf::from("/var/lib/tilr/tables"));
        assert_eq!(config.chunk_size, 25);
        assert_eq!(config.continue_every, Duration::from_secs(120));
        assert_eq!(config.team_field, "customfield_100");
        assert_eq!(config.rate_limit_per_minute, Some(300));
        assert_eq!(
            config.ticketing.basic_auth().map(|a| a.username),
            Some("bot@example.com/token".to_string())
        );
        assert!(config.issue_tracker.basic_auth().is_none());
        assert!(config.http_sources().is_ok());
    }

    #[test]
    fn archive_policy_loads_from_rules_dir() {
        let dir = tempdir().expect("tempdir");
        assert_eq!(
            load_archive_policy(dir.path()).expect("default"),
            ArchivePolicy::default()
        );

        std::fs::create_dir_all(dir.path().join("rules")).expect("mkdir");
        std::fs::write(
            dir.path().join("rules").join("archive.yaml"),
            "closed_ticket_statuses: [closed, solved]\n",
        )
        .expect("write");
        let policy = load_archive_policy(dir.path()).expect("policy");
        assert_eq!(policy.closed_ticket_statuses, vec!["closed", "solved"]);
        assert_eq!(policy.closed_issue_categories, vec!["done"]);
    }
}
