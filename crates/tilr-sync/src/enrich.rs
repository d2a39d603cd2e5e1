//! Enriches one chunk of pending `diff` rows per invocation.

use std::collections::{BTreeMap, HashMap, HashSet};

use tilr_adapters::{IssueTrackerSource, TicketingSource};
use tilr_core::{
    is_blank_row, project, Brand, Group, Issue, Link, LinkRow, NewLink, Organization, StagedRow,
    Ticket, TicketBundle,
};
use tilr_storage::{TableName, TabularStore};
use tracing::{debug, info, info_span, Instrument};

use crate::error::{integrity, SyncError};
use crate::rows::{decode_links, decode_staged, used_rows};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Pending rows remain; `chunk_cursor` counts rows consumed this cycle.
    More { chunk_cursor: usize },
    Drained { chunk_cursor: usize },
}

/// Tickets and their references collected across the requests of one chunk.
#[derive(Debug, Default)]
struct JoinCache {
    tickets: HashMap<u64, Ticket>,
    organizations: HashMap<u64, Organization>,
    groups: HashMap<u64, Group>,
    brands: HashMap<u64, Brand>,
}

/// Every record one projected row reads from.
struct Joined<'a> {
    ticket: &'a Ticket,
    organization: Option<&'a Organization>,
    group: Option<&'a Group>,
    brand: Option<&'a Brand>,
    issue: &'a Issue,
}

impl Joined<'_> {
    fn project(&self, link: &Link) -> LinkRow {
        project(link, self.ticket, self.organization, self.group, self.brand, self.issue)
    }
}

impl JoinCache {
    fn absorb(&mut self, bundle: TicketBundle) {
        for ticket in bundle.tickets {
            self.tickets.entry(ticket.id).or_insert(ticket);
        }
        for org in bundle.organizations {
            self.organizations.entry(org.id).or_insert(org);
        }
        for group in bundle.groups {
            self.groups.entry(group.id).or_insert(group);
        }
        for brand in bundle.brands {
            self.brands.entry(brand.id).or_insert(brand);
        }
    }

    /// Resolves everything `owner` needs for projection, or names what is missing.
    fn join<'a>(
        &'a self,
        ticket_id: u64,
        issue_id: &str,
        issues: &'a HashMap<String, Issue>,
        owner: &str,
    ) -> Result<Joined<'a>, SyncError> {
        let ticket = self.tickets.get(&ticket_id).ok_or_else(|| {
            integrity(format!("ticket {ticket_id} of {owner} was not returned"))
        })?;
        let issue = issues.get(issue_id).ok_or_else(|| {
            integrity(format!("issue {issue_id} of {owner} was not returned"))
        })?;
        Ok(Joined {
            ticket,
            organization: lookup(&self.organizations, ticket.organization_id, "organization", ticket)?,
            group: lookup(&self.groups, ticket.group_id, "group", ticket)?,
            brand: lookup(&self.brands, ticket.brand_id, "brand", ticket)?,
            issue,
        })
    }
}

fn lookup<'a, T>(
    cache: &'a HashMap<u64, T>,
    id: Option<u64>,
    what: &str,
    ticket: &Ticket,
) -> Result<Option<&'a T>, SyncError> {
    match id {
        None => Ok(None),
        Some(id) => cache.get(&id).map(Some).ok_or_else(|| {
            integrity(format!("{what} {id} of ticket {} was not side-loaded", ticket.id))
        }),
    }
}

fn distinct<T: Clone + Eq + std::hash::Hash>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|i| seen.insert(i.clone())).collect()
}

/// An unlinked incident of a problem ticket in the chunk.
struct PlannedIncident {
    problem_id: u64,
    new_link: NewLink,
}

/// Consumes up to `chunk_size` rows from the pending head of `diff`.
///
/// Every request and join runs before the first write. Incident links are
/// then created one at a time, each appended to `diff` as soon as it exists,
/// and finally the chunk's rows are appended and the consumed head deleted.
/// A retry after an interruption therefore sees created incidents as linked
/// and at worst finds a chunk row enriched twice.
pub async fn run_enrichment(
    tables: &dyn TabularStore,
    ticketing: &dyn TicketingSource,
    tracker: &dyn IssueTrackerSource,
    chunk_size: usize,
    chunk_cursor: usize,
) -> Result<ChunkOutcome, SyncError> {
    let span = info_span!("enrichment_phase", chunk_cursor);
    async move {
        let chunk_size = chunk_size.max(1);
        let diff = tables.read_all(TableName::Diff).await?;
        let staged = decode_staged(&diff)?;
        let pending = diff
            .rows
            .iter()
            .take_while(|cells| !is_blank_row(cells))
            .zip(&staged)
            .take_while(|(_, row)| !row.enriched)
            .count();
        if pending == 0 {
            return Ok(ChunkOutcome::Drained { chunk_cursor });
        }
        let archive = tables.read_all(TableName::Archive).await?;
        let archived = decode_links(TableName::Archive, &archive)?;

        let take = pending.min(chunk_size);
        let links: Vec<Link> = staged[..take].iter().map(|s| s.row.link()).collect();

        let mut cache = JoinCache::default();
        let ticket_ids = distinct(links.iter().map(|l| l.ticket_id));
        cache.absorb(ticketing.show_tickets(&ticket_ids).await?);

        let linked: HashSet<u64> = staged
            .iter()
            .map(|s| s.row.ticket_id)
            .chain(archived.iter().map(|r| r.ticket_id))
            .collect();
        let planned = plan_incidents(ticketing, &mut cache, &links, linked).await?;

        let issue_ids = distinct(
            links
                .iter()
                .map(|l| l.issue_id.clone())
                .chain(planned.iter().map(|p| p.new_link.issue_id.clone())),
        );
        let issues: HashMap<String, Issue> = tracker
            .issues(&issue_ids)
            .await?
            .into_iter()
            .map(|i| (i.id.clone(), i))
            .collect();

        let enriched = links
            .iter()
            .map(|link| {
                let owner = format!("link {}", link.id);
                cache
                    .join(link.ticket_id, &link.issue_id, &issues, &owner)
                    .map(|joined| joined.project(link))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let incidents = planned
            .iter()
            .map(|p| {
                let owner = format!("incident of problem {}", p.problem_id);
                cache.join(p.new_link.ticket_id, &p.new_link.issue_id, &issues, &owner)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut tail = used_rows(&diff.rows);
        for (plan, joined) in planned.iter().zip(&incidents) {
            let link = ticketing.create_link(&plan.new_link).await?;
            debug!(
                link_id = link.id,
                ticket_id = link.ticket_id,
                problem_id = plan.problem_id,
                "linked incident to problem issue"
            );
            let cells = StagedRow::enriched(joined.project(&link)).to_cells();
            tables.write_range(TableName::Diff, tail, &[cells]).await?;
            tail += 1;
        }

        write_back(tables, take, &enriched).await?;

        let consumed = chunk_cursor + take;
        info!(
            consumed = take,
            enriched = enriched.len(),
            incidents = planned.len(),
            remaining = pending - take,
            "enriched chunk"
        );
        if pending <= chunk_size {
            Ok(ChunkOutcome::Drained { chunk_cursor: consumed })
        } else {
            Ok(ChunkOutcome::More { chunk_cursor: consumed })
        }
    }
    .instrument(span)
    .await
}

/// Incidents of the chunk's problem tickets whose ticket has no link in
/// `linked` yet, each inheriting the issue of its problem's link.
async fn plan_incidents(
    ticketing: &dyn TicketingSource,
    cache: &mut JoinCache,
    chunk: &[Link],
    mut linked: HashSet<u64>,
) -> Result<Vec<PlannedIncident>, SyncError> {
    // Lowest link id wins when a problem ticket carries several links.
    let mut parents: BTreeMap<u64, &Link> = BTreeMap::new();
    for link in chunk {
        let is_problem = cache
            .tickets
            .get(&link.ticket_id)
            .is_some_and(Ticket::is_problem);
        if !is_problem {
            continue;
        }
        parents
            .entry(link.ticket_id)
            .and_modify(|p| {
                if link.id < p.id {
                    *p = link;
                }
            })
            .or_insert(link);
    }
    if parents.is_empty() {
        return Ok(Vec::new());
    }

    let problem_ids: Vec<u64> = parents.keys().copied().collect();
    let expansions = ticketing.problem_incidents(&problem_ids).await?;

    let mut planned = Vec::new();
    for expansion in expansions {
        let Some(parent) = parents.get(&expansion.problem_id) else {
            continue;
        };
        let mut incidents: Vec<u64> = expansion.bundle.tickets.iter().map(|t| t.id).collect();
        incidents.sort_unstable();
        cache.absorb(expansion.bundle);

        for ticket_id in incidents {
            if !linked.insert(ticket_id) {
                continue;
            }
            planned.push(PlannedIncident {
                problem_id: expansion.problem_id,
                new_link: NewLink {
                    ticket_id,
                    issue_id: parent.issue_id.clone(),
                    issue_key: parent.issue_key.clone(),
                },
            });
        }
    }
    Ok(planned)
}

/// Appends the chunk's enriched rows, replacing earlier enriched copies of
/// the same links, then deletes the consumed head.
async fn write_back(
    tables: &dyn TabularStore,
    consumed: usize,
    enriched: &[LinkRow],
) -> Result<(), SyncError> {
    let diff = tables.read_all(TableName::Diff).await?;
    let staged = decode_staged(&diff)?;
    let ids: HashSet<u64> = enriched.iter().map(|r| r.link_id).collect();

    // Deleted bottom-up so the remaining positions stay valid.
    let stale: Vec<usize> = diff
        .rows
        .iter()
        .enumerate()
        .filter(|(_, cells)| !is_blank_row(cells))
        .map(|(position, _)| position)
        .zip(&staged)
        .filter(|(position, row)| {
            *position >= consumed && row.enriched && ids.contains(&row.row.link_id)
        })
        .map(|(position, _)| position)
        .collect();
    for position in stale.iter().rev() {
        tables.delete_rows(TableName::Diff, *position, 1).await?;
    }

    let remaining = used_rows(&diff.rows) - stale.len();
    let cells: Vec<Vec<String>> = enriched
        .iter()
        .cloned()
        .map(|row| StagedRow::enriched(row).to_cells())
        .collect();
    tables.write_range(TableName::Diff, remaining, &cells).await?;
    tables.delete_rows(TableName::Diff, 0, consumed).await?;
    Ok(())
}
