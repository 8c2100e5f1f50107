//! Report service
//!
//! Entry point for the presentation tier. Every report follows the same path:
//!
//! ```text
//! cache hit (fresh) ─────────────────────────────────────────► respond
//! cache hit (stale) ──► respond, refresh in background (one per key)
//! cache miss ──► discover fields ──► fetch / join ──► fold ──► cache ──► respond
//! ```
//!
//! Only a first-page failure of a fetch is an error. Missing fields drop their
//! dimension, rejected queries degrade to empty results, and anything cut short
//! by the deadline or a failed page is flagged `partial`.

use crate::aggregate::{AggregationResult, Aggregator, CrossTabRow, Dimension, DimensionSpec, KeyCount};
use crate::cache::{CacheManager, Clock, RefreshCoalescer};
use crate::config::EngineConfig;
use crate::discovery::{FieldDiscovery, FieldRole};
use crate::fetch::{BatchFetcher, Completion, FetchLimits};
use crate::join::{CrossEntityJoin, JoinSpec};
use crate::snapshot::{SeriesPoint, SnapshotStore, TrendPoint};
use crate::source::{Filter, Query, Record, RemoteSource, SourceError};
use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub const SERIES_CONTRIBUTORS: &str = "contributors";
pub const SERIES_ACTIVE_PROJECTS: &str = "active_projects";
pub const SERIES_ACTIVE_ASSIGNMENTS: &str = "active_assignments";
pub const SERIES_ASSIGNED_CONTRIBUTORS: &str = "unique_assigned_contributors";

const ACTIVE: &str = "Active";

/// Upper bound on how long a partial result is served from cache
pub const PARTIAL_RESULT_TTL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum ReportError {
    /// First page of a required fetch failed
    Source(SourceError),
    /// A background task died
    Task(String),
}

impl From<SourceError> for ReportError {
    fn from(err: SourceError) -> Self {
        ReportError::Source(err)
    }
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReportError::Source(e) => write!(f, "Source error: {}", e),
            ReportError::Task(e) => write!(f, "Task error: {}", e),
        }
    }
}

impl std::error::Error for ReportError {}

/// Report body plus cache metadata
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse<T> {
    #[serde(flatten)]
    pub data: T,
    pub cached: bool,
    pub stale: bool,
    pub age_seconds: u64,
}

/// `{ "<dimension>": [{key, count, percentage}], ..., partial }`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionReport {
    #[serde(flatten)]
    pub dimensions: BTreeMap<String, Vec<KeyCount>>,
    pub records_scanned: usize,
    pub partial: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossTabReport {
    pub row_dimension: String,
    pub column_dimension: String,
    pub columns: Vec<String>,
    pub rows: Vec<CrossTabRow>,
    pub total: u64,
    pub partial: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryReport {
    pub contributors: u64,
    /// `None` when the entity has no status field to tell active rows apart
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_projects: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_assignments: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_assigned_contributors: Option<u64>,
    pub contributors_by_status: Vec<KeyCount>,
    pub partial: bool,
}

impl SummaryReport {
    /// Snapshot series; unavailable counts are left out rather than zeroed
    fn series(&self) -> Vec<SeriesPoint> {
        [
            (SERIES_CONTRIBUTORS, Some(self.contributors)),
            (SERIES_ACTIVE_PROJECTS, self.active_projects),
            (SERIES_ACTIVE_ASSIGNMENTS, self.active_assignments),
            (SERIES_ASSIGNED_CONTRIBUTORS, self.unique_assigned_contributors),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.map(|v| SeriesPoint::new(key, v)))
        .collect()
    }
}

/// Report bodies that can come back truncated
trait ReportBody {
    fn is_partial(&self) -> bool;
}

impl ReportBody for DimensionReport {
    fn is_partial(&self) -> bool {
        self.partial
    }
}

impl ReportBody for CrossTabReport {
    fn is_partial(&self) -> bool {
        self.partial
    }
}

impl ReportBody for SummaryReport {
    fn is_partial(&self) -> bool {
        self.partial
    }
}

/// `{ trends: { "<series>": [{date, count}] } }`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrendReport {
    pub trends: BTreeMap<String, Vec<TrendPoint>>,
}

struct ReportCaches {
    dimensions: Arc<CacheManager<DimensionReport>>,
    cross_tabs: Arc<CacheManager<CrossTabReport>>,
    summaries: Arc<CacheManager<SummaryReport>>,
}

impl ReportCaches {
    fn new(clock: Clock) -> Self {
        Self {
            dimensions: Arc::new(CacheManager::new_with_clock(clock.clone())),
            cross_tabs: Arc::new(CacheManager::new_with_clock(clock.clone())),
            summaries: Arc::new(CacheManager::new_with_clock(clock)),
        }
    }
}

/// A dimension bound to the concrete field it reads
struct BoundDimension {
    dimension: Dimension,
    field: String,
}

#[derive(Clone)]
pub struct ReportService {
    source: Arc<dyn RemoteSource>,
    discovery: Arc<FieldDiscovery>,
    join: CrossEntityJoin,
    caches: Arc<ReportCaches>,
    refreshes: RefreshCoalescer,
    snapshots: Arc<SnapshotStore>,
    config: Arc<EngineConfig>,
}

impl ReportService {
    pub fn new(source: Arc<dyn RemoteSource>, config: EngineConfig, snapshots: Arc<SnapshotStore>) -> Self {
        Self::with_clock(source, config, snapshots, crate::cache::monotonic_clock())
    }

    /// Service whose caches read time from `clock`
    pub fn with_clock(
        source: Arc<dyn RemoteSource>,
        config: EngineConfig,
        snapshots: Arc<SnapshotStore>,
        clock: Clock,
    ) -> Self {
        let join = CrossEntityJoin::new(source.clone())
            .with_lookup_batch_size(config.lookup_batch_size)
            .with_lookup_parallelism(config.lookup_parallelism);

        log::info!(
            "📊 Report service ready: {} source, deadline {:?}, cache TTL {:?}",
            source.source_type(),
            config.request_deadline,
            config.cache_ttl
        );

        Self {
            discovery: Arc::new(FieldDiscovery::new(source.clone())),
            source,
            join,
            caches: Arc::new(ReportCaches::new(clock)),
            refreshes: RefreshCoalescer::new(),
            snapshots,
            config: Arc::new(config),
        }
    }

    pub fn discovery(&self) -> &FieldDiscovery {
        &self.discovery
    }

    pub fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    pub fn is_refreshing(&self, key: &str) -> bool {
        self.refreshes.is_refreshing(key)
    }

    fn limits(&self) -> FetchLimits {
        FetchLimits::from_now(self.config.request_deadline, self.config.max_pages)
    }

    /// Partial results are kept briefly so the next request retries the fetch
    fn ttl_for<T: ReportBody>(&self, body: &T) -> Duration {
        if body.is_partial() {
            self.config.cache_ttl.min(PARTIAL_RESULT_TTL)
        } else {
            self.config.cache_ttl
        }
    }

    /// Serve from cache when possible; stale hits trigger one background refresh
    async fn serve_cached<T, F, Fut>(
        &self,
        cache: &Arc<CacheManager<T>>,
        key: String,
        compute: F,
    ) -> Result<CachedResponse<T>, ReportError>
    where
        T: ReportBody + Clone + Send + Sync + 'static,
        F: Fn(ReportService) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, ReportError>> + Send + 'static,
    {
        if let Some(hit) = cache.get(&key) {
            if hit.is_stale {
                if let Some(guard) = self.refreshes.try_begin(&key) {
                    log::debug!("♻️  Serving stale {} ({}s old), refreshing", key, hit.age_seconds());
                    let service = self.clone();
                    let cache = cache.clone();
                    let key = key.clone();
                    tokio::spawn(async move {
                        let _guard = guard;
                        match compute(service.clone()).await {
                            Ok(fresh) => {
                                let ttl = service.ttl_for(&fresh);
                                cache.set(&key, fresh, ttl);
                            }
                            Err(e) => log::warn!("⚠️  Background refresh of {} failed: {}", key, e),
                        }
                    });
                }
            }

            return Ok(CachedResponse {
                data: (*hit.data).clone(),
                cached: true,
                stale: hit.is_stale,
                age_seconds: hit.age_seconds(),
            });
        }

        let fresh = compute(self.clone()).await?;
        cache.set(&key, fresh.clone(), self.ttl_for(&fresh));

        Ok(CachedResponse {
            data: fresh,
            cached: false,
            stale: false,
            age_seconds: 0,
        })
    }

    /// Bind a role on an entity to a dimension. Age falls back to a birth-date
    /// field when no age field exists.
    async fn bind(&self, entity: &str, role: &FieldRole, today: NaiveDate) -> Option<BoundDimension> {
        let name = role.name();

        if *role == FieldRole::Age {
            if let Some(field) = self.discovery.resolve(entity, &FieldRole::Age).await {
                return Some(BoundDimension {
                    dimension: Dimension::age_from_field(&name, &field.field_name),
                    field: field.field_name,
                });
            }
            let field = self.discovery.resolve(entity, &FieldRole::BirthDate).await?;
            return Some(BoundDimension {
                dimension: Dimension::age_from_birthdate(&name, &field.field_name, today),
                field: field.field_name,
            });
        }

        let field = self.discovery.resolve(entity, role).await?;
        let dimension = match role {
            FieldRole::Language => Dimension::field(&name, &field.field_name).multi_value(),
            _ => Dimension::field(&name, &field.field_name),
        };

        Some(BoundDimension {
            dimension,
            field: field.field_name,
        })
    }

    /// Drain a fetch through `f`. A rejected query degrades to an empty,
    /// partial scan; any other first-page failure is an error.
    async fn scan<F>(&self, query: Query, limits: FetchLimits, mut f: F) -> Result<Completion, ReportError>
    where
        F: FnMut(&Record),
    {
        let entity = query.entity.clone();
        let result = BatchFetcher::new(self.source.clone(), query.page_size(self.config.page_size), limits)
            .for_each_batch(|batch| batch.records.iter().for_each(&mut f))
            .await;

        match result {
            Ok(summary) => Ok(summary.completion),
            Err(e) if e.is_rejected() => {
                log::warn!("⚠️  Query on {} rejected, returning empty result: {}", entity, e);
                Ok(Completion::Failed)
            }
            Err(e) => Err(ReportError::Source(e)),
        }
    }

    /// `Status = 'Active'` on the entity's status field. `None` when the
    /// entity has no status field, so "active" counts are unavailable.
    async fn active_filter(&self, entity: &str) -> Option<Filter> {
        self.discovery
            .resolve(entity, &FieldRole::Status)
            .await
            .map(|status| Filter::eq(&status.field_name, ACTIVE))
    }

    /// Contributor counts by each requested role; unresolvable roles are omitted
    pub async fn contributor_dimensions(
        &self,
        roles: &[FieldRole],
    ) -> Result<CachedResponse<DimensionReport>, ReportError> {
        let names: Vec<String> = roles.iter().map(FieldRole::name).collect();
        let key = format!("dimensions:{}", names.join(","));
        let roles = roles.to_vec();

        self.serve_cached(&self.caches.dimensions, key, move |service| {
            let roles = roles.clone();
            async move { service.compute_contributor_dimensions(&roles).await }
        })
        .await
    }

    async fn compute_contributor_dimensions(&self, roles: &[FieldRole]) -> Result<DimensionReport, ReportError> {
        let limits = self.limits();
        let entity = self.config.entities.contact.clone();
        let today = Local::now().date_naive();

        let mut query = Query::new(&entity, &["Id"]);
        let mut aggregators = Vec::new();
        for role in roles {
            if let Some(bound) = self.bind(&entity, role, today).await {
                query = query.select(&bound.field);
                aggregators.push(Aggregator::new(
                    DimensionSpec::single(bound.dimension).unique_by_field("Id"),
                ));
            }
        }

        if aggregators.is_empty() {
            return Ok(DimensionReport::default());
        }

        let mut records_scanned = 0;
        let completion = self
            .scan(query, limits, |record| {
                records_scanned += 1;
                for aggregator in aggregators.iter_mut() {
                    aggregator.fold_record(record);
                }
            })
            .await?;

        let dimensions = aggregators
            .into_iter()
            .map(Aggregator::finish)
            .map(|result| (result.dimensions.join(" / "), result.key_counts()))
            .collect();

        log::info!("📊 Contributor dimensions computed from {} records", records_scanned);

        Ok(DimensionReport {
            dimensions,
            records_scanned,
            partial: completion.is_partial(),
        })
    }

    /// Contributors bucketed jointly by two roles
    pub async fn contributor_cross_tab(
        &self,
        row: FieldRole,
        column: FieldRole,
    ) -> Result<CachedResponse<CrossTabReport>, ReportError> {
        let key = format!("crosstab:{}:{}", row.name(), column.name());

        self.serve_cached(&self.caches.cross_tabs, key, move |service| {
            let (row, column) = (row.clone(), column.clone());
            async move { service.compute_cross_tab(&row, &column).await }
        })
        .await
    }

    async fn compute_cross_tab(&self, row: &FieldRole, column: &FieldRole) -> Result<CrossTabReport, ReportError> {
        let limits = self.limits();
        let entity = self.config.entities.contact.clone();
        let today = Local::now().date_naive();

        let (row_bound, column_bound) = match (
            self.bind(&entity, row, today).await,
            self.bind(&entity, column, today).await,
        ) {
            (Some(r), Some(c)) => (r, c),
            _ => {
                log::info!("🔎 Cross-tab {} × {} unavailable on {}", row.name(), column.name(), entity);
                return Ok(CrossTabReport {
                    row_dimension: row.name(),
                    column_dimension: column.name(),
                    ..CrossTabReport::default()
                });
            }
        };

        let query = Query::new(&entity, &["Id"])
            .select(&row_bound.field)
            .select(&column_bound.field);
        let mut aggregator = Aggregator::new(
            DimensionSpec::new(vec![row_bound.dimension, column_bound.dimension]).unique_by_field("Id"),
        );

        let completion = self.scan(query, limits, |record| aggregator.fold_record(record)).await?;
        let result = aggregator.finish();

        Ok(cross_tab_report(&result, completion.is_partial()))
    }

    /// Distinct contributors holding an active assignment, by a contributor role.
    /// Needs a cross-entity join from the assignment to the contributor.
    pub async fn assigned_contributors_by(&self, role: FieldRole) -> Result<CachedResponse<DimensionReport>, ReportError> {
        let key = format!("assigned:{}", role.name());

        self.serve_cached(&self.caches.dimensions, key, move |service| {
            let role = role.clone();
            async move { service.compute_assigned_contributors(&role).await }
        })
        .await
    }

    async fn compute_assigned_contributors(&self, role: &FieldRole) -> Result<DimensionReport, ReportError> {
        let limits = self.limits();
        let entities = &self.config.entities;
        let today = Local::now().date_naive();

        let reference = self
            .discovery
            .resolve(&entities.assignment, &FieldRole::Reference(entities.contact.clone()))
            .await;
        let target = self.bind(&entities.contact, role, today).await;

        let (reference, target) = match (reference, target) {
            (Some(reference), Some(target)) => (reference, target),
            _ => {
                log::info!("🔎 Assigned contributors by {} unavailable", role.name());
                return Ok(DimensionReport::default());
            }
        };

        let active = match self.active_filter(&entities.assignment).await {
            Some(filter) => filter,
            None => {
                log::warn!("⚠️  No status field on {}, active assignments unavailable", entities.assignment);
                return Ok(DimensionReport {
                    partial: true,
                    ..DimensionReport::default()
                });
            }
        };
        let source_query = Query::new(&entities.assignment, &["Id"])
            .page_size(self.config.page_size)
            .filter(active);

        let spec = JoinSpec::from_reference(source_query, &reference, &entities.contact, &target.field);
        let name = role.name();
        let mut aggregator = Aggregator::new(DimensionSpec::single(Dimension::field(&name, &target.field)).unique_by_field("Id"));

        let outcome = self
            .join
            .resolve_cross_entity_field(&spec, limits, |row, value| {
                let contributor = match row.get_text(&spec.foreign_key) {
                    Some(id) => id,
                    None => return,
                };
                // Run the bound extractor over the joined value alone
                let joined = match value {
                    Some(v) => Record::new().with(&target.field, v.clone()),
                    None => Record::new(),
                };
                for bucket in target.dimension.values(&joined) {
                    aggregator.observe(vec![Some(bucket)], Some(&contributor));
                }
            })
            .await;

        let report = match outcome {
            Ok(report) => report,
            Err(e) if e.is_rejected() => {
                log::warn!("⚠️  Both join tiers rejected for {}: {}", spec.traversal_path(), e);
                return Ok(DimensionReport {
                    partial: true,
                    ..DimensionReport::default()
                });
            }
            Err(e) => return Err(ReportError::Source(e)),
        };

        let result = aggregator.finish();
        log::info!(
            "📊 Assigned contributors by {}: {} distinct via {:?}",
            name,
            result.total,
            report.tier
        );

        let mut dimensions = BTreeMap::new();
        dimensions.insert(name, result.key_counts());

        Ok(DimensionReport {
            dimensions,
            records_scanned: report.source_records,
            partial: report.is_partial(),
        })
    }

    /// Headline totals. A freshly computed summary is also recorded as
    /// today's snapshot, in the background.
    pub async fn summary(&self) -> Result<CachedResponse<SummaryReport>, ReportError> {
        self.serve_cached(&self.caches.summaries, "summary".to_string(), |service| async move {
            let summary = service.compute_summary().await?;
            service.record_snapshot(&summary);
            Ok::<_, ReportError>(summary)
        })
        .await
    }

    async fn compute_summary(&self) -> Result<SummaryReport, ReportError> {
        let limits = self.limits();
        let entities = &self.config.entities;

        let contact_status = self.discovery.resolve(&entities.contact, &FieldRole::Status).await;
        let project_filter = self.active_filter(&entities.project).await;
        let assignment_filter = self.active_filter(&entities.assignment).await;
        let contact_reference = self
            .discovery
            .resolve(&entities.assignment, &FieldRole::Reference(entities.contact.clone()))
            .await;

        // Contributors and their status breakdown
        let mut contact_query = Query::new(&entities.contact, &["Id"]);
        let status_dimension = match &contact_status {
            Some(status) => {
                contact_query = contact_query.select(&status.field_name);
                Dimension::field("status", &status.field_name)
            }
            None => Dimension::new("status", |_| None),
        };
        let mut by_status = Aggregator::new(DimensionSpec::single(status_dimension).unique_by_field("Id"));
        let mut contributors: HashSet<String> = HashSet::new();
        let contacts = self.scan(contact_query, limits, |record| {
            if let Some(id) = record.id() {
                contributors.insert(id.to_string());
            }
            by_status.fold_record(record);
        });

        // Active projects, skipped without a status field
        let mut active_projects = 0u64;
        let projects = async {
            match project_filter {
                Some(filter) => {
                    let query = Query::new(&entities.project, &["Id"]).filter(filter);
                    self.scan(query, limits, |_| active_projects += 1).await.map(Some)
                }
                None => {
                    log::warn!("⚠️  No status field on {}, active projects unavailable", entities.project);
                    Ok(None)
                }
            }
        };

        // Active assignments and the distinct contributors behind them
        let reference_field = contact_reference.map(|r| r.field_name);
        let mut active_assignments = 0u64;
        let mut assigned: HashSet<String> = HashSet::new();
        let assignments = async {
            let filter = match assignment_filter {
                Some(filter) => filter,
                None => {
                    log::warn!("⚠️  No status field on {}, active assignments unavailable", entities.assignment);
                    return Ok(None);
                }
            };
            let mut query = Query::new(&entities.assignment, &["Id"]).filter(filter);
            if let Some(field) = &reference_field {
                query = query.select(field);
            }
            self.scan(query, limits, |record| {
                active_assignments += 1;
                if let Some(contact) = reference_field.as_deref().and_then(|f| record.get_text(f)) {
                    assigned.insert(contact);
                }
            })
            .await
            .map(Some)
        };

        let (contacts, projects, assignments) = tokio::try_join!(contacts, projects, assignments)?;

        let summary = SummaryReport {
            contributors: contributors.len() as u64,
            active_projects: projects.map(|_| active_projects),
            active_assignments: assignments.map(|_| active_assignments),
            unique_assigned_contributors: assignments
                .filter(|_| reference_field.is_some())
                .map(|_| assigned.len() as u64),
            contributors_by_status: by_status.finish().key_counts(),
            partial: contacts.is_partial()
                || projects.map_or(false, |c| c.is_partial())
                || assignments.map_or(false, |c| c.is_partial()),
        };

        log::info!(
            "📊 Summary: {} contributors, {:?} active projects, {:?} active assignments ({:?} contributors)",
            summary.contributors,
            summary.active_projects,
            summary.active_assignments,
            summary.unique_assigned_contributors
        );

        Ok(summary)
    }

    /// Append today's snapshot without holding up the response
    fn record_snapshot(&self, summary: &SummaryReport) {
        if summary.partial {
            log::warn!("⚠️  Partial summary, not recorded as a snapshot");
            return;
        }

        let snapshots = self.snapshots.clone();
        let series = summary.series();
        tokio::task::spawn_blocking(move || {
            snapshots.append(series);
        });
    }

    /// Day-by-day values of the named series over the last `days` days
    pub async fn trends(&self, series: &[&str], days: u32) -> Result<TrendReport, ReportError> {
        let snapshots = self.snapshots.clone();
        let keys: Vec<String> = series.iter().map(|s| s.to_string()).collect();

        let trends = tokio::task::spawn_blocking(move || {
            let since = snapshots
                .today()
                .checked_sub_signed(chrono::Duration::days(i64::from(days)))
                .unwrap_or(NaiveDate::MIN);
            let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
            snapshots.query_trends(&keys, since)
        })
        .await
        .map_err(|e| ReportError::Task(e.to_string()))?;

        Ok(TrendReport { trends })
    }
}

fn cross_tab_report(result: &AggregationResult, partial: bool) -> CrossTabReport {
    match result.cross_tab() {
        Some(tab) => CrossTabReport {
            row_dimension: tab.row_dimension,
            column_dimension: tab.column_dimension,
            columns: tab.columns,
            rows: tab.rows,
            total: tab.total,
            partial,
        },
        None => CrossTabReport {
            partial,
            ..CrossTabReport::default()
        },
    }
}
