//! Core domain model for TILR: source entities, the wide link row, changelog
//! entries and the continuation state that survives between ticks.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tilr-core";

pub const TASK_KEY: &str = "TASK";
pub const FETCH_CURSOR_KEY: &str = "FETCH_CURSOR";
pub const CHUNK_CURSOR_KEY: &str = "CHUNK_CURSOR";
pub const CYCLE_ID_KEY: &str = "CYCLE_ID";

pub const ENRICHED_COLUMN: &str = "enriched";

/// Column order of the `main`, `archive` and (prefix of the) `diff` tables.
pub const LINK_HEADERS: [&str; 34] = [
    "link_id",
    "link_created_at",
    "link_updated_at",
    "ticket_id",
    "issue_id",
    "issue_key",
    "ticket_created_at",
    "ticket_updated_at",
    "ticket_status",
    "ticket_priority",
    "ticket_type",
    "ticket_subject",
    "ticket_problem_id",
    "ticket_organization_id",
    "ticket_organization_name",
    "ticket_organization_arr",
    "ticket_organization_sf_full_id",
    "ticket_organization_strikedeck_health",
    "ticket_organization_sf_sitekey",
    "ticket_organization_sitekey",
    "ticket_group_id",
    "ticket_group_name",
    "ticket_brand_id",
    "ticket_brand_name",
    "issue_project",
    "issue_summary",
    "issue_created_at",
    "issue_updated_at",
    "issue_status",
    "issue_status_key",
    "issue_priority",
    "issue_type",
    "issue_team",
    "issue_components",
];

pub const CHANGELOG_HEADERS: [&str; 7] = [
    "date",
    "link_id",
    "field",
    "value_from",
    "value_to",
    "notes",
    "entry_id",
];

pub fn link_headers() -> Vec<String> {
    LINK_HEADERS.iter().map(|h| h.to_string()).collect()
}

pub fn diff_headers() -> Vec<String> {
    let mut headers = link_headers();
    headers.push(ENRICHED_COLUMN.to_string());
    headers
}

pub fn changelog_headers() -> Vec<String> {
    CHANGELOG_HEADERS.iter().map(|h| h.to_string()).collect()
}

/// True for rows that carry no data at all (e.g. freshly inserted blank rows).
pub fn is_blank_row(cells: &[String]) -> bool {
    cells.iter().all(|c| c.trim().is_empty())
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RowError {
    #[error("missing required column `{0}`")]
    MissingColumn(&'static str),
    #[error("column `{column}` holds non-numeric id `{value}`")]
    InvalidNumber { column: &'static str, value: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

impl RawId {
    fn into_u64<E: serde::de::Error>(self) -> Result<u64, E> {
        match self {
            RawId::Number(n) => Ok(n),
            RawId::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| E::custom(format!("expected numeric id, got `{s}`"))),
        }
    }

    fn into_string(self) -> String {
        match self {
            RawId::Number(n) => n.to_string(),
            RawId::Text(s) => s,
        }
    }
}

/// Source systems are inconsistent about ids: accept `123` and `"123"`.
pub fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    RawId::deserialize(deserializer)?.into_u64()
}

pub fn de_opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(raw) => raw.into_u64().map(Some),
        None => Ok(None),
    }
}

pub fn de_string_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(RawId::deserialize(deserializer)?.into_string())
}

/// Association between one ticket and one issue-tracker issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    #[serde(deserialize_with = "de_id")]
    pub id: u64,
    #[serde(deserialize_with = "de_id")]
    pub ticket_id: u64,
    #[serde(deserialize_with = "de_string_id")]
    pub issue_id: String,
    pub issue_key: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

/// Request body for synthesizing a link for an incident ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLink {
    pub ticket_id: u64,
    pub issue_id: String,
    pub issue_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    #[serde(deserialize_with = "de_id")]
    pub id: u64,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(rename = "type", default)]
    pub ticket_type: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub organization_id: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub group_id: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub brand_id: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub problem_id: Option<u64>,
}

impl Ticket {
    pub fn is_problem(&self) -> bool {
        self.ticket_type.as_deref() == Some("problem")
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrganizationFields {
    #[serde(default)]
    pub arr: Option<f64>,
    #[serde(default)]
    pub strikedeck_health: Option<String>,
    #[serde(default)]
    pub sitekey: Option<String>,
    #[serde(default)]
    pub sf_keyword: Option<String>,
    #[serde(default)]
    pub sf_full_account_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Organization {
    #[serde(deserialize_with = "de_id")]
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub organization_fields: OrganizationFields,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    #[serde(deserialize_with = "de_id")]
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brand {
    #[serde(deserialize_with = "de_id")]
    pub id: u64,
    pub name: String,
}

/// Tickets plus every organization, group and brand they reference, as
/// returned by one side-loading ticket request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TicketBundle {
    #[serde(default)]
    pub tickets: Vec<Ticket>,
    #[serde(default)]
    pub organizations: Vec<Organization>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub brands: Vec<Brand>,
}

impl TicketBundle {
    pub fn extend(&mut self, other: TicketBundle) {
        self.tickets.extend(other.tickets);
        self.organizations.extend(other.organizations);
        self.groups.extend(other.groups);
        self.brands.extend(other.brands);
    }
}

/// Issue-tracker issue, flattened from the tracker's nested wire format.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub key: String,
    pub project: String,
    pub summary: String,
    pub created: String,
    pub updated: String,
    pub status: String,
    pub status_category: String,
    pub priority: String,
    pub issue_type: String,
    pub team: String,
    pub components: Vec<String>,
}

/// The persisted wide row: one link with its ticket-, organization-, group-,
/// brand- and issue-derived columns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkRow {
    pub link_id: u64,
    pub link_created_at: String,
    pub link_updated_at: String,
    pub ticket_id: u64,
    pub issue_id: String,
    pub issue_key: String,
    pub ticket_created_at: String,
    pub ticket_updated_at: String,
    pub ticket_status: String,
    pub ticket_priority: String,
    pub ticket_type: String,
    pub ticket_subject: String,
    pub ticket_problem_id: String,
    pub ticket_organization_id: String,
    pub ticket_organization_name: String,
    pub ticket_organization_arr: String,
    pub ticket_organization_sf_full_id: String,
    pub ticket_organization_strikedeck_health: String,
    pub ticket_organization_sf_sitekey: String,
    pub ticket_organization_sitekey: String,
    pub ticket_group_id: String,
    pub ticket_group_name: String,
    pub ticket_brand_id: String,
    pub ticket_brand_name: String,
    pub issue_project: String,
    pub issue_summary: String,
    pub issue_created_at: String,
    pub issue_updated_at: String,
    pub issue_status: String,
    pub issue_status_key: String,
    pub issue_priority: String,
    pub issue_type: String,
    pub issue_team: String,
    pub issue_components: String,
}

fn opt_id(value: Option<u64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn opt_text(value: Option<&str>) -> String {
    value.unwrap_or_default().to_string()
}

/// Positional cells addressed by header name.
struct NamedCells<'a> {
    index: HashMap<&'a str, usize>,
    cells: &'a [String],
}

impl<'a> NamedCells<'a> {
    fn new(headers: &'a [String], cells: &'a [String]) -> Self {
        let index = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.as_str(), i))
            .collect();
        Self { index, cells }
    }

    fn text(&self, column: &str) -> String {
        self.index
            .get(column)
            .and_then(|i| self.cells.get(*i))
            .map(|c| c.trim().to_string())
            .unwrap_or_default()
    }

    fn id(&self, column: &'static str) -> Result<u64, RowError> {
        if !self.index.contains_key(column) {
            return Err(RowError::MissingColumn(column));
        }
        let value = self.text(column);
        value
            .parse()
            .map_err(|_| RowError::InvalidNumber { column, value })
    }
}

impl LinkRow {
    /// A row carrying only the link columns, as written by the fetch phase.
    pub fn from_link(link: &Link) -> Self {
        Self {
            link_id: link.id,
            link_created_at: link.created_at.clone(),
            link_updated_at: link.updated_at.clone(),
            ticket_id: link.ticket_id,
            issue_id: link.issue_id.clone(),
            issue_key: link.issue_key.clone(),
            ..Self::default()
        }
    }

    pub fn link(&self) -> Link {
        Link {
            id: self.link_id,
            ticket_id: self.ticket_id,
            issue_id: self.issue_id.clone(),
            issue_key: self.issue_key.clone(),
            created_at: self.link_created_at.clone(),
            updated_at: self.link_updated_at.clone(),
        }
    }

    pub fn to_cells(&self) -> Vec<String> {
        vec![
            self.link_id.to_string(),
            self.link_created_at.clone(),
            self.link_updated_at.clone(),
            self.ticket_id.to_string(),
            self.issue_id.clone(),
            self.issue_key.clone(),
            self.ticket_created_at.clone(),
            self.ticket_updated_at.clone(),
            self.ticket_status.clone(),
            self.ticket_priority.clone(),
            self.ticket_type.clone(),
            self.ticket_subject.clone(),
            self.ticket_problem_id.clone(),
            self.ticket_organization_id.clone(),
            self.ticket_organization_name.clone(),
            self.ticket_organization_arr.clone(),
            self.ticket_organization_sf_full_id.clone(),
            self.ticket_organization_strikedeck_health.clone(),
            self.ticket_organization_sf_sitekey.clone(),
            self.ticket_organization_sitekey.clone(),
            self.ticket_group_id.clone(),
            self.ticket_group_name.clone(),
            self.ticket_brand_id.clone(),
            self.ticket_brand_name.clone(),
            self.issue_project.clone(),
            self.issue_summary.clone(),
            self.issue_created_at.clone(),
            self.issue_updated_at.clone(),
            self.issue_status.clone(),
            self.issue_status_key.clone(),
            self.issue_priority.clone(),
            self.issue_type.clone(),
            self.issue_team.clone(),
            self.issue_components.clone(),
        ]
    }

    /// Decodes a row by header name; columns absent from `headers` read as blank.
    pub fn from_cells(headers: &[String], cells: &[String]) -> Result<Self, RowError> {
        let named = NamedCells::new(headers, cells);
        Ok(Self {
            link_id: named.id("link_id")?,
            link_created_at: named.text("link_created_at"),
            link_updated_at: named.text("link_updated_at"),
            ticket_id: named.id("ticket_id")?,
            issue_id: named.text("issue_id"),
            issue_key: named.text("issue_key"),
            ticket_created_at: named.text("ticket_created_at"),
            ticket_updated_at: named.text("ticket_updated_at"),
            ticket_status: named.text("ticket_status"),
            ticket_priority: named.text("ticket_priority"),
            ticket_type: named.text("ticket_type"),
            ticket_subject: named.text("ticket_subject"),
            ticket_problem_id: named.text("ticket_problem_id"),
            ticket_organization_id: named.text("ticket_organization_id"),
            ticket_organization_name: named.text("ticket_organization_name"),
            ticket_organization_arr: named.text("ticket_organization_arr"),
            ticket_organization_sf_full_id: named.text("ticket_organization_sf_full_id"),
            ticket_organization_strikedeck_health: named
                .text("ticket_organization_strikedeck_health"),
            ticket_organization_sf_sitekey: named.text("ticket_organization_sf_sitekey"),
            ticket_organization_sitekey: named.text("ticket_organization_sitekey"),
            ticket_group_id: named.text("ticket_group_id"),
            ticket_group_name: named.text("ticket_group_name"),
            ticket_brand_id: named.text("ticket_brand_id"),
            ticket_brand_name: named.text("ticket_brand_name"),
            issue_project: named.text("issue_project"),
            issue_summary: named.text("issue_summary"),
            issue_created_at: named.text("issue_created_at"),
            issue_updated_at: named.text("issue_updated_at"),
            issue_status: named.text("issue_status"),
            issue_status_key: named.text("issue_status_key"),
            issue_priority: named.text("issue_priority"),
            issue_type: named.text("issue_type"),
            issue_team: named.text("issue_team"),
            issue_components: named.text("issue_components"),
        })
    }

    /// `(column, value)` pairs in header order.
    pub fn fields(&self) -> impl Iterator<Item = (&'static str, String)> {
        LINK_HEADERS.into_iter().zip(self.to_cells())
    }
}

/// Joins one link with its ticket, the ticket's organization/group/brand and
/// the linked issue into the persisted row shape.
pub fn project(
    link: &Link,
    ticket: &Ticket,
    organization: Option<&Organization>,
    group: Option<&Group>,
    brand: Option<&Brand>,
    issue: &Issue,
) -> LinkRow {
    let org_fields = organization.map(|o| &o.organization_fields);
    LinkRow {
        ticket_created_at: ticket.created_at.clone(),
        ticket_updated_at: ticket.updated_at.clone(),
        ticket_status: ticket.status.clone(),
        ticket_priority: opt_text(ticket.priority.as_deref()),
        ticket_type: opt_text(ticket.ticket_type.as_deref()),
        ticket_subject: opt_text(ticket.subject.as_deref()),
        ticket_problem_id: opt_id(ticket.problem_id),
        ticket_organization_id: opt_id(ticket.organization_id),
        ticket_organization_name: opt_text(organization.map(|o| o.name.as_str())),
        ticket_organization_arr: org_fields
            .and_then(|f| f.arr)
            .map(|arr| arr.to_string())
            .unwrap_or_default(),
        ticket_organization_sf_full_id: opt_text(
            org_fields.and_then(|f| f.sf_full_account_id.as_deref()),
        ),
        ticket_organization_strikedeck_health: opt_text(
            org_fields.and_then(|f| f.strikedeck_health.as_deref()),
        ),
        ticket_organization_sf_sitekey: opt_text(org_fields.and_then(|f| f.sf_keyword.as_deref())),
        ticket_organization_sitekey: opt_text(org_fields.and_then(|f| f.sitekey.as_deref())),
        ticket_group_id: opt_id(ticket.group_id),
        ticket_group_name: opt_text(group.map(|g| g.name.as_str())),
        ticket_brand_id: opt_id(ticket.brand_id),
        ticket_brand_name: opt_text(brand.map(|b| b.name.as_str())),
        issue_project: issue.project.clone(),
        issue_summary: issue.summary.clone(),
        issue_created_at: issue.created.clone(),
        issue_updated_at: issue.updated.clone(),
        issue_status: issue.status.clone(),
        issue_status_key: issue.status_category.clone(),
        issue_priority: issue.priority.clone(),
        issue_type: issue.issue_type.clone(),
        issue_team: issue.team.clone(),
        issue_components: issue.components.join(", "),
        ..LinkRow::from_link(link)
    }
}

/// A `diff` table row: the link row plus the explicit enrichment marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRow {
    pub row: LinkRow,
    pub enriched: bool,
}

impl StagedRow {
    pub fn pending(row: LinkRow) -> Self {
        Self {
            row,
            enriched: false,
        }
    }

    pub fn enriched(row: LinkRow) -> Self {
        Self {
            row,
            enriched: true,
        }
    }

    pub fn to_cells(&self) -> Vec<String> {
        let mut cells = self.row.to_cells();
        cells.push(self.enriched.to_string());
        cells
    }

    pub fn from_cells(headers: &[String], cells: &[String]) -> Result<Self, RowError> {
        let row = LinkRow::from_cells(headers, cells)?;
        let enriched = NamedCells::new(headers, cells)
            .text(ENRICHED_COLUMN)
            .eq_ignore_ascii_case("true");
        Ok(Self { row, enriched })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeNote {
    Created,
    Updated,
    Deleted,
}

impl ChangeNote {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }

    /// An empty new value means deletion, an empty old value creation.
    pub fn classify(value_from: &str, value_to: &str) -> Self {
        if value_to.is_empty() {
            Self::Deleted
        } else if value_from.is_empty() {
            Self::Created
        } else {
            Self::Updated
        }
    }
}

/// Stable identity of a changelog entry within one cycle, independent of the
/// wall-clock time it was computed at.
pub fn changelog_fingerprint(
    cycle_id: &Uuid,
    link_id: u64,
    field: &str,
    value_from: &str,
    value_to: &str,
) -> String {
    let cycle = cycle_id.to_string();
    let link = link_id.to_string();
    let mut hasher = Sha256::new();
    for part in [cycle.as_str(), link.as_str(), field, value_from, value_to] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(16);
    digest
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangelogEntry {
    pub date: DateTime<Utc>,
    pub link_id: u64,
    pub field: String,
    pub value_from: String,
    pub value_to: String,
    pub note: ChangeNote,
    pub entry_id: String,
}

impl ChangelogEntry {
    pub fn new(
        cycle_id: &Uuid,
        date: DateTime<Utc>,
        link_id: u64,
        field: impl Into<String>,
        value_from: impl Into<String>,
        value_to: impl Into<String>,
    ) -> Self {
        let field = field.into();
        let value_from = value_from.into();
        let value_to = value_to.into();
        let entry_id = changelog_fingerprint(cycle_id, link_id, &field, &value_from, &value_to);
        Self {
            date,
            link_id,
            note: ChangeNote::classify(&value_from, &value_to),
            field,
            value_from,
            value_to,
            entry_id,
        }
    }

    pub fn to_cells(&self) -> Vec<String> {
        vec![
            self.date.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.link_id.to_string(),
            self.field.clone(),
            self.value_from.clone(),
            self.value_to.clone(),
            self.note.as_str().to_string(),
            self.entry_id.clone(),
        ]
    }

    /// Reads just the fingerprint column of an existing changelog row.
    pub fn entry_id_of(headers: &[String], cells: &[String]) -> Option<String> {
        let id = NamedCells::new(headers, cells).text("entry_id");
        (!id.is_empty()).then_some(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Idle,
    Running,
    Diff,
}

impl Phase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Diff => "DIFF",
        }
    }

    pub fn from_marker(value: &str) -> Option<Self> {
        match value.trim() {
            "IDLE" => Some(Self::Idle),
            "RUNNING" => Some(Self::Running),
            "DIFF" => Some(Self::Diff),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a tick needs to resume where the previous one stopped.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContinuationState {
    pub phase: Phase,
    /// Highest link id ever staged; never decreases.
    pub fetch_cursor: u64,
    /// Rows enriched so far in the current cycle.
    pub chunk_cursor: usize,
    pub cycle_id: Option<Uuid>,
}

/// Which links count as closed for archiving. Both sides must be closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivePolicy {
    #[serde(default = "default_closed_ticket_statuses")]
    pub closed_ticket_statuses: Vec<String>,
    #[serde(default = "default_closed_issue_categories")]
    pub closed_issue_categories: Vec<String>,
}

fn default_closed_ticket_statuses() -> Vec<String> {
    vec!["closed".to_string()]
}

fn default_closed_issue_categories() -> Vec<String> {
    vec!["done".to_string()]
}

impl Default for ArchivePolicy {
    fn default() -> Self {
        Self {
            closed_ticket_statuses: default_closed_ticket_statuses(),
            closed_issue_categories: default_closed_issue_categories(),
        }
    }
}

impl ArchivePolicy {
    pub fn should_archive(&self, row: &LinkRow) -> bool {
        let closed = |candidates: &[String], value: &str| {
            candidates.iter().any(|c| c.eq_ignore_ascii_case(value.trim()))
        };
        closed(&self.closed_ticket_statuses, &row.ticket_status)
            && closed(&self.closed_issue_categories, &row.issue_status_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_ticket() -> Ticket {
        serde_json::from_str(
            r#"{
                "id": 500,
                "subject": "Portal login fails",
                "created_at": "2026-01-02T10:00:00Z",
                "updated_at": "2026-01-03T11:00:00Z",
                "status": "open",
                "priority": null,
                "type": "incident",
                "organization_id": 1,
                "group_id": "100",
                "brand_id": null,
                "problem_id": 501
            }"#,
        )
        .expect("ticket json")
    }

    fn sample_issue() -> Issue {
        Issue {
            id: "9001".into(),
            key: "OPS-5".into(),
            project: "Operations".into(),
            summary: "Login outage".into(),
            created: "2026-01-01T09:00:00.000+0000".into(),
            updated: "2026-01-04T09:00:00.000+0000".into(),
            status: "In Progress".into(),
            status_category: "indeterminate".into(),
            priority: "High".into(),
            issue_type: "Bug".into(),
            team: "Platform".into(),
            components: vec!["Auth".into(), "Portal".into()],
        }
    }

    #[test]
    fn ticket_ids_accept_numbers_strings_and_nulls() {
        let ticket = sample_ticket();
        assert_eq!(ticket.group_id, Some(100));
        assert_eq!(ticket.brand_id, None);
        assert_eq!(ticket.problem_id, Some(501));
        assert!(!ticket.is_problem());
    }

    #[test]
    fn projection_fills_joined_columns_and_blanks_missing_refs() {
        let link = Link {
            id: 10,
            ticket_id: 500,
            issue_id: "9001".into(),
            issue_key: "OPS-5".into(),
            created_at: "2026-01-02T10:05:00Z".into(),
            updated_at: "2026-01-02T10:05:00Z".into(),
        };
        let org = Organization {
            id: 1,
            name: "Acme School".into(),
            organization_fields: OrganizationFields {
                arr: Some(120000.0),
                strikedeck_health: Some("green".into()),
                sitekey: Some("acme".into()),
                sf_keyword: Some("ACME-SF".into()),
                sf_full_account_id: Some("001A000001".into()),
            },
        };
        let group = Group {
            id: 100,
            name: "Tier 2".into(),
        };
        let row = project(&link, &sample_ticket(), Some(&org), Some(&group), None, &sample_issue());

        assert_eq!(row.link_id, 10);
        assert_eq!(row.ticket_status, "open");
        assert_eq!(row.ticket_priority, "");
        assert_eq!(row.ticket_problem_id, "501");
        assert_eq!(row.ticket_organization_arr, "120000");
        assert_eq!(row.ticket_organization_sf_sitekey, "ACME-SF");
        assert_eq!(row.ticket_group_name, "Tier 2");
        assert_eq!(row.ticket_brand_id, "");
        assert_eq!(row.ticket_brand_name, "");
        assert_eq!(row.issue_status_key, "indeterminate");
        assert_eq!(row.issue_components, "Auth, Portal");
        assert_eq!(row.to_cells().len(), LINK_HEADERS.len());
    }

    #[test]
    fn rows_decode_by_header_name_regardless_of_column_order() {
        let mut row = LinkRow::from_link(&Link {
            id: 42,
            ticket_id: 7,
            issue_id: "9100".into(),
            issue_key: "OPS-9".into(),
            created_at: "c".into(),
            updated_at: "u".into(),
        });
        row.ticket_status = "pending".into();

        let mut headers = link_headers();
        let mut cells = row.to_cells();
        headers.reverse();
        cells.reverse();

        assert_eq!(LinkRow::from_cells(&headers, &cells), Ok(row));
    }

    #[test]
    fn rows_without_numeric_link_id_are_rejected() {
        let headers = link_headers();
        let mut cells = LinkRow::default().to_cells();
        cells[0] = "abc".into();
        assert_eq!(
            LinkRow::from_cells(&headers, &cells),
            Err(RowError::InvalidNumber {
                column: "link_id",
                value: "abc".into()
            })
        );
        assert_eq!(
            LinkRow::from_cells(&["ticket_id".to_string()], &["1".to_string()]),
            Err(RowError::MissingColumn("link_id"))
        );
    }

    #[test]
    fn staged_rows_carry_the_enriched_marker() {
        let staged = StagedRow::enriched(LinkRow {
            link_id: 3,
            ticket_id: 4,
            ..LinkRow::default()
        });
        let cells = staged.to_cells();
        assert_eq!(cells.last().map(String::as_str), Some("true"));
        assert_eq!(StagedRow::from_cells(&diff_headers(), &cells), Ok(staged));

        let pending = StagedRow::from_cells(&link_headers(), &LinkRow::default().to_cells())
            .expect("decodes without marker column");
        assert!(!pending.enriched);
    }

    #[test]
    fn change_notes_follow_empty_values() {
        assert_eq!(ChangeNote::classify("", "10"), ChangeNote::Created);
        assert_eq!(ChangeNote::classify("10", ""), ChangeNote::Deleted);
        assert_eq!(ChangeNote::classify("open", "closed"), ChangeNote::Updated);
    }

    #[test]
    fn fingerprints_ignore_time_but_not_cycle() {
        let cycle = Uuid::new_v4();
        let early = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().expect("ts");
        let late = Utc.with_ymd_and_hms(2026, 3, 1, 6, 5, 0).single().expect("ts");
        let a = ChangelogEntry::new(&cycle, early, 10, "ticket_status", "open", "closed");
        let b = ChangelogEntry::new(&cycle, late, 10, "ticket_status", "open", "closed");
        let c = ChangelogEntry::new(&Uuid::new_v4(), early, 10, "ticket_status", "open", "closed");

        assert_eq!(a.entry_id, b.entry_id);
        assert_ne!(a.entry_id, c.entry_id);
        assert_eq!(a.entry_id.len(), 16);
        assert_eq!(a.to_cells()[0], "2026-03-01T06:00:00.000Z");
        assert_eq!(
            ChangelogEntry::entry_id_of(&changelog_headers(), &a.to_cells()),
            Some(a.entry_id.clone())
        );
    }

    #[test]
    fn archive_policy_requires_both_sides_closed() {
        let policy = ArchivePolicy::default();
        let mut row = LinkRow {
            ticket_status: "Closed".into(),
            issue_status_key: "indeterminate".into(),
            ..LinkRow::default()
        };
        assert!(!policy.should_archive(&row));
        row.issue_status_key = "done".into();
        assert!(policy.should_archive(&row));
        row.ticket_status = "solved".into();
        assert!(!policy.should_archive(&row));
    }

    #[test]
    fn phase_markers_round_trip() {
        for phase in [Phase::Idle, Phase::Running, Phase::Diff] {
            assert_eq!(Phase::from_marker(phase.as_str()), Some(phase));
        }
        assert_eq!(Phase::from_marker("PAUSED"), None);
        assert_eq!(ContinuationState::default().phase, Phase::Idle);
    }
}
