//! Source contracts for the ticketing system and the issue tracker, their HTTP
//! clients, and a fixture-first in-memory source.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures_util::future::try_join_all;
use reqwest::Url;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tilr_core::{
    de_string_id, Brand, Group, Issue, Link, NewLink, Organization, Ticket, TicketBundle,
};
use tilr_storage::{FetchError, HttpFetcher};
use tracing::debug;

pub const CRATE_NAME: &str = "tilr-adapters";

/// Most ids the ticketing API accepts in one `show_many` request.
pub const SHOW_MANY_LIMIT: usize = 100;

pub const DEFAULT_TEAM_FIELD: &str = "customfield_11903";

const SIDELOADS: &str = "organizations,groups,brands";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceOp {
    ListLinks,
    ShowTickets,
    ProblemIncidents,
    CreateLink,
    Issues,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid endpoint url `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("malformed {what}: {source}")]
    Malformed {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0}")]
    Rejected(String),
    #[error("{op:?} unavailable (injected failure)")]
    Injected { op: SourceOp },
}

/// One page of the link listing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LinkPage {
    pub links: Vec<Link>,
    pub after_cursor: Option<String>,
    pub has_more: bool,
}

/// Incident tickets of one problem ticket, with their side-loaded references.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProblemIncidents {
    pub problem_id: u64,
    pub bundle: TicketBundle,
}

#[async_trait]
pub trait TicketingSource: Send + Sync {
    /// Links strictly after `after`: a numeric link id on the first page, the
    /// opaque `after_cursor` of the previous page afterwards.
    async fn list_links(&self, after: &str) -> Result<LinkPage, SourceError>;

    /// Tickets by id with organizations, groups and brands side-loaded.
    /// Unknown ids are absent from the result.
    async fn show_tickets(&self, ids: &[u64]) -> Result<TicketBundle, SourceError>;

    async fn problem_incidents(&self, problem_ids: &[u64])
        -> Result<Vec<ProblemIncidents>, SourceError>;

    async fn create_link(&self, new_link: &NewLink) -> Result<Link, SourceError>;
}

#[async_trait]
pub trait IssueTrackerSource: Send + Sync {
    async fn issues(&self, ids: &[String]) -> Result<Vec<Issue>, SourceError>;
}

#[derive(Debug, Deserialize)]
struct LinksResponse {
    #[serde(default)]
    links: Vec<Link>,
    #[serde(default)]
    meta: LinksMeta,
}

#[derive(Debug, Default, Deserialize)]
struct LinksMeta {
    #[serde(default)]
    after_cursor: Option<String>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct TicketsResponse {
    #[serde(flatten)]
    bundle: TicketBundle,
    #[serde(default)]
    next_page: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateLinkResponse {
    link: Link,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    #[serde(deserialize_with = "de_string_id")]
    id: String,
    #[serde(default)]
    key: String,
    fields: IssueFields,
}

#[derive(Debug, Deserialize)]
struct IssueFields {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    created: String,
    #[serde(default)]
    updated: String,
    #[serde(default)]
    status: Option<StatusField>,
    #[serde(default)]
    priority: Option<NamedField>,
    #[serde(default)]
    project: Option<NamedField>,
    #[serde(default)]
    issuetype: Option<NamedField>,
    #[serde(default)]
    components: Vec<NamedField>,
    #[serde(flatten)]
    custom: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Deserialize)]
struct NamedField {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct StatusField {
    #[serde(default)]
    name: String,
    #[serde(default, rename = "statusCategory")]
    status_category: Option<StatusCategory>,
}

#[derive(Debug, Deserialize)]
struct StatusCategory {
    #[serde(default)]
    key: String,
}

/// Flattens the tracker's nested issue document. The team is read from the
/// `value` of the configured custom field.
pub fn decode_issue(raw: &JsonValue, team_field: &str) -> Result<Issue, SourceError> {
    let wire: IssueResponse =
        serde_json::from_value(raw.clone()).map_err(|source| SourceError::Malformed {
            what: "issue",
            source,
        })?;
    let fields = wire.fields;
    let team = fields
        .custom
        .get(team_field)
        .and_then(|v| v.get("value"))
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    let (status, status_category) = match fields.status {
        Some(s) => (s.name, s.status_category.map(|c| c.key).unwrap_or_default()),
        None => (String::new(), String::new()),
    };
    Ok(Issue {
        id: wire.id,
        key: wire.key,
        project: fields.project.map(|p| p.name).unwrap_or_default(),
        summary: fields.summary,
        created: fields.created,
        updated: fields.updated,
        status,
        status_category,
        priority: fields.priority.map(|p| p.name).unwrap_or_default(),
        issue_type: fields.issuetype.map(|t| t.name).unwrap_or_default(),
        team,
        components: fields.components.into_iter().map(|c| c.name).collect(),
    })
}

fn endpoint(base: &str, path: &str, query: &[(&str, &str)]) -> Result<Url, SourceError> {
    let raw = format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'));
    Url::parse_with_params(&raw, query).map_err(|err| SourceError::InvalidUrl {
        url: raw.clone(),
        message: err.to_string(),
    })
}

/// Splits ids into `show_many`-sized groups.
pub fn id_batches(ids: &[u64], limit: usize) -> Vec<String> {
    ids.chunks(limit.max(1))
        .map(|chunk| {
            chunk
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(",")
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct HttpTicketingSource {
    http: Arc<HttpFetcher>,
    base_url: String,
    services_url: String,
}

impl HttpTicketingSource {
    /// `base_url` serves the versioned API; `services_url` the legacy
    /// endpoint that accepts link creation.
    pub fn new(
        http: Arc<HttpFetcher>,
        base_url: impl Into<String>,
        services_url: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            services_url: services_url.into(),
        }
    }

    async fn incidents_of(&self, problem_id: u64) -> Result<ProblemIncidents, SourceError> {
        let mut url = endpoint(
            &self.base_url,
            &format!("tickets/{problem_id}/incidents.json"),
            &[("include", SIDELOADS)],
        )?
        .to_string();
        let mut bundle = TicketBundle::default();
        let mut seen = HashSet::new();
        loop {
            let page: TicketsResponse = self.http.get_json(&url).await?;
            bundle.extend(page.bundle);
            seen.insert(url);
            match page.next_page {
                Some(next) if !next.is_empty() && !seen.contains(&next) => url = next,
                _ => break,
            }
        }
        Ok(ProblemIncidents { problem_id, bundle })
    }
}

#[async_trait]
impl TicketingSource for HttpTicketingSource {
    async fn list_links(&self, after: &str) -> Result<LinkPage, SourceError> {
        let url = endpoint(&self.base_url, "jira/links", &[("page[after]", after)])?;
        let response: LinksResponse = self.http.get_json(url.as_str()).await?;
        debug!(after, count = response.links.len(), "listed links");
        Ok(LinkPage {
            links: response.links,
            after_cursor: response.meta.after_cursor,
            has_more: response.meta.has_more,
        })
    }

    async fn show_tickets(&self, ids: &[u64]) -> Result<TicketBundle, SourceError> {
        let urls = id_batches(ids, SHOW_MANY_LIMIT)
            .into_iter()
            .map(|batch| {
                endpoint(
                    &self.base_url,
                    "tickets/show_many.json",
                    &[("ids", batch.as_str()), ("include", SIDELOADS)],
                )
            })
            .collect::<Result<Vec<_>, _>>()?;
        let pages: Vec<TicketsResponse> =
            try_join_all(urls.iter().map(|url| self.http.get_json(url.as_str()))).await?;

        let mut bundle = TicketBundle::default();
        for page in pages {
            bundle.extend(page.bundle);
        }
        Ok(bundle)
    }

    async fn problem_incidents(
        &self,
        problem_ids: &[u64],
    ) -> Result<Vec<ProblemIncidents>, SourceError> {
        try_join_all(problem_ids.iter().map(|id| self.incidents_of(*id))).await
    }

    async fn create_link(&self, new_link: &NewLink) -> Result<Link, SourceError> {
        let url = endpoint(&self.services_url, "jira/links", &[])?;
        let body = json!({ "link": new_link });
        let response: CreateLinkResponse = self.http.post_json(url.as_str(), &body).await?;
        Ok(response.link)
    }
}

#[derive(Debug, Clone)]
pub struct HttpIssueTrackerSource {
    http: Arc<HttpFetcher>,
    base_url: String,
    team_field: String,
}

impl HttpIssueTrackerSource {
    pub fn new(
        http: Arc<HttpFetcher>,
        base_url: impl Into<String>,
        team_field: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            team_field: team_field.into(),
        }
    }
}

#[async_trait]
impl IssueTrackerSource for HttpIssueTrackerSource {
    async fn issues(&self, ids: &[String]) -> Result<Vec<Issue>, SourceError> {
        let urls = ids
            .iter()
            .map(|id| endpoint(&self.base_url, &format!("issue/{id}"), &[]))
            .collect::<Result<Vec<_>, _>>()?;
        let raw: Vec<JsonValue> =
            try_join_all(urls.iter().map(|url| self.http.get_json(url.as_str()))).await?;
        raw.iter()
            .map(|doc| decode_issue(doc, &self.team_field))
            .collect()
    }
}

/// Captured source data for offline runs and tests. Issues are kept in the
/// tracker's wire format so fixtures exercise the same decoding as HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub fixture_id: String,
    #[serde(default)]
    pub team_field: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub links: Vec<Link>,
    #[serde(default)]
    pub tickets: Vec<Ticket>,
    #[serde(default)]
    pub organizations: Vec<Organization>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub brands: Vec<Brand>,
    #[serde(default)]
    pub issues: Vec<JsonValue>,
}

fn default_page_size() -> usize {
    25
}

pub fn load_fixture_bundle(path: impl AsRef<Path>) -> Result<FixtureBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Default)]
struct FixtureState {
    links: BTreeMap<u64, Link>,
    tickets: BTreeMap<u64, Ticket>,
    organizations: BTreeMap<u64, Organization>,
    groups: BTreeMap<u64, Group>,
    brands: BTreeMap<u64, Brand>,
    issues: BTreeMap<String, Issue>,
    failing: HashSet<SourceOp>,
    calls: BTreeMap<String, usize>,
    created: Vec<Link>,
}

impl FixtureState {
    fn enter(&mut self, op: SourceOp) -> Result<(), SourceError> {
        *self.calls.entry(format!("{op:?}")).or_default() += 1;
        if self.failing.contains(&op) {
            return Err(SourceError::Injected { op });
        }
        Ok(())
    }

    fn bundle_for(&self, tickets: Vec<Ticket>) -> TicketBundle {
        let mut bundle = TicketBundle::default();
        let mut orgs = HashSet::new();
        let mut groups = HashSet::new();
        let mut brands = HashSet::new();
        for ticket in &tickets {
            if let Some(org) = ticket.organization_id.and_then(|id| self.organizations.get(&id)) {
                if orgs.insert(org.id) {
                    bundle.organizations.push(org.clone());
                }
            }
            if let Some(group) = ticket.group_id.and_then(|id| self.groups.get(&id)) {
                if groups.insert(group.id) {
                    bundle.groups.push(group.clone());
                }
            }
            if let Some(brand) = ticket.brand_id.and_then(|id| self.brands.get(&id)) {
                if brands.insert(brand.id) {
                    bundle.brands.push(brand.clone());
                }
            }
        }
        bundle.tickets = tickets;
        bundle
    }
}

/// In-memory ticketing system and issue tracker backed by a [`FixtureBundle`].
///
/// Link creation assigns the next free id. Individual operations can be made
/// to fail with [`FixtureSource::fail_on`].
#[derive(Debug)]
pub struct FixtureSource {
    state: Mutex<FixtureState>,
    page_size: usize,
}

impl FixtureSource {
    pub fn from_bundle(bundle: FixtureBundle) -> Result<Self> {
        let team_field = bundle
            .team_field
            .clone()
            .unwrap_or_else(|| DEFAULT_TEAM_FIELD.to_string());
        let issues = bundle
            .issues
            .iter()
            .map(|raw| decode_issue(raw, &team_field).map(|issue| (issue.id.clone(), issue)))
            .collect::<Result<BTreeMap<_, _>, _>>()
            .with_context(|| format!("decoding issues of fixture {}", bundle.fixture_id))?;

        let state = FixtureState {
            links: bundle.links.into_iter().map(|l| (l.id, l)).collect(),
            tickets: bundle.tickets.into_iter().map(|t| (t.id, t)).collect(),
            organizations: bundle.organizations.into_iter().map(|o| (o.id, o)).collect(),
            groups: bundle.groups.into_iter().map(|g| (g.id, g)).collect(),
            brands: bundle.brands.into_iter().map(|b| (b.id, b)).collect(),
            issues,
            ..FixtureState::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            page_size: bundle.page_size.max(1),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_bundle(load_fixture_bundle(path)?)
    }

    fn state(&self) -> MutexGuard<'_, FixtureState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_on(&self, op: SourceOp) {
        self.state().failing.insert(op);
    }

    pub fn recover(&self, op: SourceOp) {
        self.state().failing.remove(&op);
    }

    pub fn calls(&self, op: SourceOp) -> usize {
        self.state()
            .calls
            .get(&format!("{op:?}"))
            .copied()
            .unwrap_or_default()
    }

    /// Links minted through [`TicketingSource::create_link`], in order.
    pub fn created_links(&self) -> Vec<Link> {
        self.state().created.clone()
    }

    pub fn upsert_link(&self, link: Link) {
        self.state().links.insert(link.id, link);
    }

    pub fn upsert_ticket(&self, ticket: Ticket) {
        self.state().tickets.insert(ticket.id, ticket);
    }

    pub fn upsert_issue(&self, issue: Issue) {
        self.state().issues.insert(issue.id.clone(), issue);
    }

    pub fn ticket(&self, id: u64) -> Option<Ticket> {
        self.state().tickets.get(&id).cloned()
    }

    pub fn issue(&self, id: &str) -> Option<Issue> {
        self.state().issues.get(id).cloned()
    }
}

#[async_trait]
impl TicketingSource for FixtureSource {
    async fn list_links(&self, after: &str) -> Result<LinkPage, SourceError> {
        let mut state = self.state();
        state.enter(SourceOp::ListLinks)?;
        let after: u64 = after
            .trim()
            .parse()
            .map_err(|_| SourceError::Rejected(format!("unknown link cursor `{after}`")))?;

        let mut remaining = state.links.range(after.saturating_add(1)..).map(|(_, l)| l.clone());
        let links: Vec<Link> = remaining.by_ref().take(self.page_size).collect();
        let has_more = remaining.next().is_some();
        Ok(LinkPage {
            after_cursor: links.last().map(|l| l.id.to_string()),
            links,
            has_more,
        })
    }

    async fn show_tickets(&self, ids: &[u64]) -> Result<TicketBundle, SourceError> {
        let mut state = self.state();
        state.enter(SourceOp::ShowTickets)?;
        let tickets = ids
            .iter()
            .filter_map(|id| state.tickets.get(id).cloned())
            .collect();
        Ok(state.bundle_for(tickets))
    }

    async fn problem_incidents(
        &self,
        problem_ids: &[u64],
    ) -> Result<Vec<ProblemIncidents>, SourceError> {
        let mut state = self.state();
        state.enter(SourceOp::ProblemIncidents)?;
        Ok(problem_ids
            .iter()
            .map(|problem_id| {
                let incidents = state
                    .tickets
                    .values()
                    .filter(|t| t.problem_id == Some(*problem_id))
                    .cloned()
                    .collect();
                ProblemIncidents {
                    problem_id: *problem_id,
                    bundle: state.bundle_for(incidents),
                }
            })
            .collect())
    }

    async fn create_link(&self, new_link: &NewLink) -> Result<Link, SourceError> {
        let mut state = self.state();
        state.enter(SourceOp::CreateLink)?;
        let id = state.links.keys().next_back().copied().unwrap_or_default() + 1;
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let link = Link {
            id,
            ticket_id: new_link.ticket_id,
            issue_id: new_link.issue_id.clone(),
            issue_key: new_link.issue_key.clone(),
            created_at: now.clone(),
            updated_at: now,
        };
        state.links.insert(id, link.clone());
        state.created.push(link.clone());
        Ok(link)
    }
}

#[async_trait]
impl IssueTrackerSource for FixtureSource {
    async fn issues(&self, ids: &[String]) -> Result<Vec<Issue>, SourceError> {
        let mut state = self.state();
        state.enter(SourceOp::Issues)?;
        Ok(ids
            .iter()
            .filter_map(|id| state.issues.get(id).cloned())
            .collect())
    }
}
