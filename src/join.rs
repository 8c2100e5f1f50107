//! Two-tier cross-entity join
//!
//! Resolves "field of the entity a row points at" (e.g. the country of the
//! contributor behind an assignment):
//!
//! ```text
//! Tier 1: SELECT ..., Contact__r.Mailing_Country__c FROM Project_Assignment__c
//!           │ rejected by the source
//!           ▼
//! Tier 2: SELECT ..., Contact__c FROM Project_Assignment__c   (collect ids)
//!         SELECT Id, Mailing_Country__c FROM Contact WHERE Id IN (...)
//!           × ceil(ids / batch_size) lookups, at most `parallelism` per wave
//!         join back by id
//! ```
//!
//! Both tiers hand the caller the same `(source row, target value)` pairs, so
//! whatever is folded downstream does not depend on which tier ran.

use crate::discovery::ResolvedField;
use crate::fetch::{BatchFetcher, Completion, FetchLimits};
use crate::source::{Filter, Query, Record, RemoteSource, SourceError};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinSet;

pub const DEFAULT_LOOKUP_BATCH_SIZE: usize = 200;
pub const DEFAULT_LOOKUP_PARALLELISM: usize = 10;

/// What to join: rows of `source_query`, through `foreign_key`, to
/// `target_field` on `target_entity`
#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub source_query: Query,
    pub foreign_key: String,
    pub relationship_name: String,
    pub target_entity: String,
    pub target_field: String,
}

impl JoinSpec {
    /// Build from a discovered reference field
    pub fn from_reference(source_query: Query, reference: &ResolvedField, target_entity: &str, target_field: &str) -> Self {
        Self {
            source_query,
            foreign_key: reference.field_name.clone(),
            relationship_name: reference
                .relationship_name
                .clone()
                .unwrap_or_else(|| reference.field_name.clone()),
            target_entity: target_entity.to_string(),
            target_field: target_field.to_string(),
        }
    }

    /// `Relationship.Field` path used by Tier 1
    pub fn traversal_path(&self) -> String {
        format!("{}.{}", self.relationship_name, self.target_field)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinTier {
    ServerSide,
    LocalLookup,
}

/// How a join went
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReport {
    pub tier: JoinTier,
    /// Stop reason of the source-entity fetch
    pub completion: Completion,
    pub source_records: usize,
    pub failed_lookup_batches: usize,
    /// Lookup batches never dispatched because the deadline passed
    pub skipped_lookup_batches: usize,
}

impl JoinReport {
    pub fn is_partial(&self) -> bool {
        self.completion.is_partial() || self.failed_lookup_batches > 0 || self.skipped_lookup_batches > 0
    }
}

#[derive(Clone)]
pub struct CrossEntityJoin {
    source: Arc<dyn RemoteSource>,
    lookup_batch_size: usize,
    lookup_parallelism: usize,
}

impl CrossEntityJoin {
    pub fn new(source: Arc<dyn RemoteSource>) -> Self {
        Self {
            source,
            lookup_batch_size: DEFAULT_LOOKUP_BATCH_SIZE,
            lookup_parallelism: DEFAULT_LOOKUP_PARALLELISM,
        }
    }

    pub fn with_lookup_batch_size(mut self, size: usize) -> Self {
        self.lookup_batch_size = size.max(1);
        self
    }

    pub fn with_lookup_parallelism(mut self, parallelism: usize) -> Self {
        self.lookup_parallelism = parallelism.max(1);
        self
    }

    /// Join with Tier 1, falling back to Tier 2 if the source rejects the
    /// traversal. `sink` sees every source row with its target value, `None`
    /// when the reference is empty or the target row could not be looked up.
    pub async fn resolve_cross_entity_field<F>(
        &self,
        spec: &JoinSpec,
        limits: FetchLimits,
        mut sink: F,
    ) -> Result<JoinReport, SourceError>
    where
        F: FnMut(&Record, Option<&Value>),
    {
        match self.server_side(spec, limits, &mut sink).await {
            Err(e) if e.is_rejected() => {
                log::warn!(
                    "🔁 {} rejected on {} ({}), falling back to id lookups",
                    spec.traversal_path(),
                    spec.source_query.entity,
                    e
                );
                self.local_lookup(spec, limits, &mut sink).await
            }
            other => other,
        }
    }

    /// Tier 1: one traversal query; a rejection is returned as `Err` before
    /// `sink` is ever called
    pub async fn server_side<F>(&self, spec: &JoinSpec, limits: FetchLimits, mut sink: F) -> Result<JoinReport, SourceError>
    where
        F: FnMut(&Record, Option<&Value>),
    {
        let path = spec.traversal_path();
        let query = spec.source_query.clone().select(&spec.foreign_key).select(&path);
        let mut fetcher = BatchFetcher::new(self.source.clone(), query, limits);

        while let Some(batch) = fetcher.next_batch().await? {
            for record in &batch.records {
                let value = record.get_path(&path).filter(|v| !v.is_null());
                sink(record, value);
            }
        }

        Ok(JoinReport {
            tier: JoinTier::ServerSide,
            completion: fetcher.completion().unwrap_or(Completion::Exhausted),
            source_records: fetcher.records_fetched(),
            failed_lookup_batches: 0,
            skipped_lookup_batches: 0,
        })
    }

    /// Tier 2: collect foreign keys, look targets up in bounded waves, join by id
    pub async fn local_lookup<F>(&self, spec: &JoinSpec, limits: FetchLimits, mut sink: F) -> Result<JoinReport, SourceError>
    where
        F: FnMut(&Record, Option<&Value>),
    {
        let query = spec.source_query.clone().select(&spec.foreign_key);
        let mut rows: Vec<Record> = Vec::new();
        let mut ids: HashSet<String> = HashSet::new();

        let summary = BatchFetcher::new(self.source.clone(), query, limits)
            .for_each_batch(|batch| {
                for record in batch.records {
                    if let Some(id) = record.get_text(&spec.foreign_key) {
                        ids.insert(id);
                    }
                    rows.push(record);
                }
            })
            .await?;

        // Sorted so batch composition does not depend on hash order
        let mut ids: Vec<String> = ids.into_iter().collect();
        ids.sort();
        let batches: Vec<Vec<String>> = ids.chunks(self.lookup_batch_size).map(<[String]>::to_vec).collect();

        log::debug!(
            "🔎 {} rows of {} reference {} {} records ({} lookup batches)",
            rows.len(),
            spec.source_query.entity,
            ids.len(),
            spec.target_entity,
            batches.len()
        );

        let mut targets: HashMap<String, Value> = HashMap::with_capacity(ids.len());
        let mut failed = 0;
        let mut skipped = 0;
        let mut dispatched = 0;

        for wave in batches.chunks(self.lookup_parallelism) {
            if limits.deadline_passed() {
                skipped = batches.len() - dispatched;
                log::warn!(
                    "⏰ Deadline reached with {} of {} lookup batches outstanding",
                    skipped,
                    batches.len()
                );
                break;
            }

            let mut set = JoinSet::new();
            for ids in wave {
                let source = self.source.clone();
                let query = Query::new(&spec.target_entity, &["Id", spec.target_field.as_str()])
                    .filter(Filter::In("Id".to_string(), ids.clone()))
                    .page_size(ids.len());
                let target_field = spec.target_field.clone();
                set.spawn(async move { lookup_batch(source, query, &target_field, limits).await });
            }
            dispatched += wave.len();

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(Ok(found)) => targets.extend(found),
                    Ok(Err(e)) => {
                        failed += 1;
                        log::warn!("⚠️  Lookup batch on {} failed, skipping: {}", spec.target_entity, e);
                    }
                    Err(e) => {
                        failed += 1;
                        log::warn!("⚠️  Lookup task on {} aborted, skipping: {}", spec.target_entity, e);
                    }
                }
            }
        }

        for record in &rows {
            let value = record
                .get_text(&spec.foreign_key)
                .and_then(|id| targets.get(&id))
                .filter(|v| !v.is_null());
            sink(record, value);
        }

        let completion = match summary.completion {
            Completion::Exhausted if skipped > 0 => Completion::DeadlineExceeded,
            other => other,
        };

        Ok(JoinReport {
            tier: JoinTier::LocalLookup,
            completion,
            source_records: rows.len(),
            failed_lookup_batches: failed,
            skipped_lookup_batches: skipped,
        })
    }
}

/// Fetch one `Id IN (...)` batch and map id → target value
async fn lookup_batch(
    source: Arc<dyn RemoteSource>,
    query: Query,
    target_field: &str,
    limits: FetchLimits,
) -> Result<Vec<(String, Value)>, SourceError> {
    let mut found = Vec::new();

    BatchFetcher::new(source, query, limits)
        .for_each_batch(|batch| {
            for record in &batch.records {
                if let Some(id) = record.id() {
                    let value = record.get_path(target_field).cloned().unwrap_or(Value::Null);
                    found.push((id.to_string(), value));
                }
            }
        })
        .await?;

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{demo_dataset, FieldDescriptor, MemorySource};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn spec() -> JoinSpec {
        JoinSpec {
            source_query: Query::new("Project_Assignment__c", &["Id"]).filter(Filter::eq("Status__c", "Active")),
            foreign_key: "Contact__c".to_string(),
            relationship_name: "Contact__r".to_string(),
            target_entity: "Contact".to_string(),
            target_field: "Mailing_Country__c".to_string(),
        }
    }

    fn limits() -> FetchLimits {
        FetchLimits::from_now(Duration::from_secs(30), 1000)
    }

    /// Distinct contacts per country
    async fn countries(join: &CrossEntityJoin) -> (BTreeMap<String, HashSet<String>>, JoinReport) {
        let mut buckets: BTreeMap<String, HashSet<String>> = BTreeMap::new();
        let report = join
            .resolve_cross_entity_field(&spec(), limits(), |record, value| {
                let country = value
                    .and_then(crate::source::value_as_text)
                    .unwrap_or_else(|| "Unknown".to_string());
                if let Some(contact) = record.get_text("Contact__c") {
                    buckets.entry(country).or_default().insert(contact);
                }
            })
            .await
            .unwrap();
        (buckets, report)
    }

    #[tokio::test]
    async fn test_fallback_matches_server_side_join() {
        let joining: Arc<dyn RemoteSource> = Arc::new(demo_dataset(7, 300).with_page_size(50));
        let rejecting: Arc<dyn RemoteSource> = Arc::new(demo_dataset(7, 300).with_page_size(50).without_relationships());

        let (tier_one, report_one) = countries(&CrossEntityJoin::new(joining)).await;
        let (tier_two, report_two) = countries(&CrossEntityJoin::new(rejecting).with_lookup_batch_size(25)).await;

        assert_eq!(report_one.tier, JoinTier::ServerSide);
        assert_eq!(report_two.tier, JoinTier::LocalLookup);
        assert_eq!(report_one.source_records, report_two.source_records);
        assert!(!report_two.is_partial());
        assert!(!tier_one.is_empty());
        assert_eq!(tier_one, tier_two);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_fan_out_is_bounded() {
        let memory = Arc::new(
            demo_dataset(3, 500)
                .without_relationships()
                .with_latency(Duration::from_millis(20)),
        );
        let source: Arc<dyn RemoteSource> = memory.clone();
        let join = CrossEntityJoin::new(source)
            .with_lookup_batch_size(10)
            .with_lookup_parallelism(4);

        let (_, report) = countries(&join).await;

        assert_eq!(report.tier, JoinTier::LocalLookup);
        assert_eq!(memory.max_in_flight(), 4);
    }

    #[tokio::test]
    async fn test_failed_lookup_batch_is_skipped() {
        let contacts = vec![
            Record::new().with("Id", "c1").with("Country__c", "Kenya"),
            Record::new().with("Id", "c2").with("Country__c", "India"),
            Record::new().with("Id", "c3").with("Country__c", "Brazil"),
        ];
        let assignments = ["c1", "c2", "c3", "c1"]
            .iter()
            .enumerate()
            .map(|(i, c)| Record::new().with("Id", format!("a{}", i)).with("Contact__c", *c))
            .collect();
        let source: Arc<dyn RemoteSource> = Arc::new(
            MemorySource::new()
                .with_entity(
                    "Contact",
                    vec![FieldDescriptor::new("Id", "id"), FieldDescriptor::new("Country__c", "picklist")],
                    contacts,
                )
                .with_entity(
                    "Assignment__c",
                    vec![
                        FieldDescriptor::new("Id", "id"),
                        FieldDescriptor::reference("Contact__c", "Contact", Some("Contact__r")),
                    ],
                    assignments,
                )
                .without_relationships()
                .failing_lookup_of("c2"),
        );

        let spec = JoinSpec {
            source_query: Query::new("Assignment__c", &["Id"]),
            foreign_key: "Contact__c".to_string(),
            relationship_name: "Contact__r".to_string(),
            target_entity: "Contact".to_string(),
            target_field: "Country__c".to_string(),
        };

        let mut joined: Vec<(String, Option<String>)> = Vec::new();
        let report = CrossEntityJoin::new(source)
            .with_lookup_batch_size(1)
            .resolve_cross_entity_field(&spec, limits(), |record, value| {
                joined.push((
                    record.get_text("Contact__c").unwrap_or_default(),
                    value.and_then(crate::source::value_as_text),
                ));
            })
            .await
            .unwrap();

        assert_eq!(report.failed_lookup_batches, 1);
        assert!(report.is_partial());
        assert_eq!(joined.len(), 4);
        assert!(joined.contains(&("c2".to_string(), None)));
        assert!(joined.contains(&("c3".to_string(), Some("Brazil".to_string()))));
    }

    #[tokio::test]
    async fn test_non_rejection_errors_do_not_fall_back() {
        let memory = Arc::new(demo_dataset(1, 20).failing_first_page());
        let source: Arc<dyn RemoteSource> = memory.clone();

        let result = CrossEntityJoin::new(source)
            .resolve_cross_entity_field(&spec(), limits(), |_, _| {})
            .await;

        assert!(matches!(result, Err(SourceError::Unavailable(_))));
        assert_eq!(memory.query_calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_deadline_yields_empty_partial_join() {
        let source: Arc<dyn RemoteSource> = Arc::new(demo_dataset(5, 40).without_relationships());
        let join = CrossEntityJoin::new(source);

        let mut rows = 0;
        let report = join
            .local_lookup(
                &spec(),
                FetchLimits::new(tokio::time::Instant::now(), 10),
                |_, _| rows += 1,
            )
            .await
            .unwrap();

        assert_eq!(rows, 0);
        assert_eq!(report.completion, Completion::DeadlineExceeded);
        assert_eq!(report.skipped_lookup_batches, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_between_lookup_waves_skips_remaining_batches() {
        let source: Arc<dyn RemoteSource> = Arc::new(
            demo_dataset(3, 500)
                .without_relationships()
                .with_latency(Duration::from_millis(20)),
        );
        let join = CrossEntityJoin::new(source)
            .with_lookup_batch_size(10)
            .with_lookup_parallelism(2);

        let mut rows = 0;
        let mut with_value = 0;
        let report = join
            .resolve_cross_entity_field(
                &spec(),
                FetchLimits::from_now(Duration::from_millis(50), 1000),
                |_, value| {
                    rows += 1;
                    if value.is_some() {
                        with_value += 1;
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(report.tier, JoinTier::LocalLookup);
        assert_eq!(report.completion, Completion::DeadlineExceeded);
        assert!(report.skipped_lookup_batches > 0);
        assert_eq!(report.failed_lookup_batches, 0);
        assert!(report.is_partial());

        // Every source row still reaches the sink, unresolved ones without a value
        assert_eq!(rows, report.source_records);
        assert!(with_value > 0);
        assert!(with_value < rows);
    }
}
