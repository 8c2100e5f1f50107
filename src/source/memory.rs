//! In-process simulation of the remote store
//!
//! Behaves like the paginated REST API closely enough to drive every engine
//! path: cursor pagination, relationship traversal (optionally rejected),
//! per-call latency and injected failures. Call counters and an in-flight
//! high-water mark let tests assert on fan-out.

use super::{EntityDescribe, FieldDescriptor, Filter, PageCursor, Query, QueryPage, Record, RemoteSource, SourceError};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

const DEFAULT_PAGE_SIZE: usize = 2000;

struct PendingPages {
    remaining: Vec<Record>,
    page_size: usize,
    next_page_number: usize,
}

pub struct MemorySource {
    records: HashMap<String, Vec<Record>>,
    schemas: HashMap<String, EntityDescribe>,
    page_size: usize,
    latency: Option<Duration>,
    allow_relationships: bool,
    fail_first_page: bool,
    fail_describe: bool,
    fail_continuation_after: Option<usize>,
    failing_lookup_ids: HashSet<String>,
    pending: Mutex<HashMap<String, PendingPages>>,
    next_cursor: AtomicU64,
    query_calls: AtomicUsize,
    query_more_calls: AtomicUsize,
    describe_calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
            schemas: HashMap::new(),
            page_size: DEFAULT_PAGE_SIZE,
            latency: None,
            allow_relationships: true,
            fail_first_page: false,
            fail_describe: false,
            fail_continuation_after: None,
            failing_lookup_ids: HashSet::new(),
            pending: Mutex::new(HashMap::new()),
            next_cursor: AtomicU64::new(1),
            query_calls: AtomicUsize::new(0),
            query_more_calls: AtomicUsize::new(0),
            describe_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Register an entity with its field catalog and rows
    pub fn with_entity(mut self, entity: &str, fields: Vec<FieldDescriptor>, records: Vec<Record>) -> Self {
        self.schemas.insert(
            entity.to_string(),
            EntityDescribe {
                name: entity.to_string(),
                fields,
            },
        );
        self.records.insert(entity.to_string(), records);
        self
    }

    /// Maximum rows per page regardless of what the query asks for
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Simulated round-trip time for every query and continuation call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Reject any query that traverses a relationship (`Rel__r.Field`)
    pub fn without_relationships(mut self) -> Self {
        self.allow_relationships = false;
        self
    }

    pub fn failing_first_page(mut self) -> Self {
        self.fail_first_page = true;
        self
    }

    pub fn failing_describe(mut self) -> Self {
        self.fail_describe = true;
        self
    }

    /// Serve `pages` pages per query, then fail every continuation
    pub fn failing_continuation_after(mut self, pages: usize) -> Self {
        self.fail_continuation_after = Some(pages);
        self
    }

    /// Fail any lookup whose `Id IN (...)` list contains `id`
    pub fn failing_lookup_of(mut self, id: &str) -> Self {
        self.failing_lookup_ids.insert(id.to_string());
        self
    }

    pub fn query_calls(&self) -> usize {
        self.query_calls.load(Ordering::SeqCst)
    }

    pub fn query_more_calls(&self) -> usize {
        self.query_more_calls.load(Ordering::SeqCst)
    }

    pub fn describe_calls(&self) -> usize {
        self.describe_calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running query calls observed
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn schema(&self, entity: &str) -> Result<&EntityDescribe, SourceError> {
        self.schemas
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(entity))
            .map(|(_, schema)| schema)
            .ok_or_else(|| SourceError::rejected("INVALID_TYPE", format!("sObject type '{}' is not supported", entity)))
    }

    fn rows(&self, entity: &str) -> &[Record] {
        self.records
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(entity))
            .map(|(_, rows)| rows.as_slice())
            .unwrap_or(&[])
    }

    /// Resolve a selected field to how it is projected from a raw row
    fn plan_field(&self, schema: &EntityDescribe, field: &str) -> Result<FieldPlan, SourceError> {
        match field.split_once('.') {
            None => {
                let descriptor = schema
                    .fields
                    .iter()
                    .find(|f| f.name.eq_ignore_ascii_case(field))
                    .ok_or_else(|| {
                        SourceError::rejected("INVALID_FIELD", format!("No such column '{}' on entity '{}'", field, schema.name))
                    })?;
                Ok(FieldPlan::Direct(descriptor.name.clone()))
            }
            Some((relationship, target_field)) => {
                if !self.allow_relationships {
                    return Err(SourceError::rejected(
                        "INVALID_FIELD",
                        format!("Didn't understand relationship '{}' in field path", relationship),
                    ));
                }

                let reference = schema
                    .fields
                    .iter()
                    .find(|f| {
                        f.relationship_name
                            .as_deref()
                            .map(|r| r.eq_ignore_ascii_case(relationship))
                            .unwrap_or(false)
                    })
                    .ok_or_else(|| {
                        SourceError::rejected("INVALID_FIELD", format!("Didn't understand relationship '{}'", relationship))
                    })?;

                let target_entity = reference
                    .reference_to
                    .first()
                    .ok_or_else(|| SourceError::rejected("INVALID_FIELD", "reference has no target"))?;
                let target_schema = self.schema(target_entity)?;
                if !target_schema.fields.iter().any(|f| f.name.eq_ignore_ascii_case(target_field)) {
                    return Err(SourceError::rejected(
                        "INVALID_FIELD",
                        format!("No such column '{}' on entity '{}'", target_field, target_entity),
                    ));
                }

                Ok(FieldPlan::Traverse {
                    relationship: relationship.to_string(),
                    foreign_key: reference.name.clone(),
                    target_entity: target_entity.clone(),
                    target_field: target_field.to_string(),
                })
            }
        }
    }

    fn project(&self, row: &Record, plans: &[FieldPlan]) -> Record {
        let mut projected = Record::new();

        for plan in plans {
            match plan {
                FieldPlan::Direct(name) => {
                    let value = row.get_path(name).cloned().unwrap_or(Value::Null);
                    projected.insert(name, value);
                }
                FieldPlan::Traverse {
                    relationship,
                    foreign_key,
                    target_entity,
                    target_field,
                } => {
                    let target = row
                        .get_text(foreign_key)
                        .and_then(|fk| self.rows(target_entity).iter().find(|r| r.id() == Some(fk.as_str())));

                    let nested = match target {
                        Some(target) => {
                            let mut obj = match projected.0.remove(relationship) {
                                Some(Value::Object(existing)) => existing,
                                _ => Map::new(),
                            };
                            obj.insert(
                                target_field.clone(),
                                target.get_path(target_field).cloned().unwrap_or(Value::Null),
                            );
                            Value::Object(obj)
                        }
                        None => Value::Null,
                    };
                    projected.insert(relationship, nested);
                }
            }
        }

        projected
    }

    fn take_page(&self, mut remaining: Vec<Record>, page_size: usize, page_number: usize) -> QueryPage {
        if remaining.len() <= page_size {
            return QueryPage {
                records: remaining,
                done: true,
                next_cursor: None,
            };
        }

        let rest = remaining.split_off(page_size);
        let token = format!("cursor-{}", self.next_cursor.fetch_add(1, Ordering::SeqCst));
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                token.clone(),
                PendingPages {
                    remaining: rest,
                    page_size,
                    next_page_number: page_number + 1,
                },
            );

        QueryPage {
            records: remaining,
            done: false,
            next_cursor: Some(PageCursor::new(token)),
        }
    }

    fn run_query(&self, query: &Query) -> Result<QueryPage, SourceError> {
        if self.fail_first_page {
            return Err(SourceError::Unavailable("simulated outage".to_string()));
        }

        if let Some(filter) = &query.filter {
            if self.failing_lookup_ids.iter().any(|id| filter_mentions(filter, id)) {
                return Err(SourceError::Unavailable("simulated lookup failure".to_string()));
            }
        }

        let schema = self.schema(&query.entity)?;
        let plans = query
            .fields
            .iter()
            .map(|f| self.plan_field(schema, f))
            .collect::<Result<Vec<_>, _>>()?;

        let matched: Vec<Record> = self
            .rows(&query.entity)
            .iter()
            .filter(|row| query.filter.as_ref().map(|f| f.matches(row)).unwrap_or(true))
            .map(|row| self.project(row, &plans))
            .collect();

        let page_size = query.page_size.unwrap_or(self.page_size).min(self.page_size).max(1);
        Ok(self.take_page(matched, page_size, 1))
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

enum FieldPlan {
    Direct(String),
    Traverse {
        relationship: String,
        foreign_key: String,
        target_entity: String,
        target_field: String,
    },
}

fn filter_mentions(filter: &Filter, id: &str) -> bool {
    match filter {
        Filter::In(_, values) => values.iter().any(|v| v == id),
        Filter::And(parts) => parts.iter().any(|p| filter_mentions(p, id)),
        _ => false,
    }
}

#[async_trait]
impl RemoteSource for MemorySource {
    async fn query(&self, query: &Query) -> Result<QueryPage, SourceError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        self.enter();
        self.simulate_latency().await;
        let result = self.run_query(query);
        self.leave();
        result
    }

    async fn query_more(&self, cursor: PageCursor) -> Result<QueryPage, SourceError> {
        self.query_more_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(cursor.as_str())
            .ok_or_else(|| SourceError::rejected("INVALID_QUERY_LOCATOR", format!("unknown cursor {}", cursor.as_str())))?;

        if let Some(limit) = self.fail_continuation_after {
            if pending.next_page_number > limit {
                return Err(SourceError::Unavailable(format!(
                    "simulated failure fetching page {}",
                    pending.next_page_number
                )));
            }
        }

        Ok(self.take_page(pending.remaining, pending.page_size, pending.next_page_number))
    }

    async fn describe(&self, entity: &str) -> Result<EntityDescribe, SourceError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_describe {
            return Err(SourceError::Unavailable("simulated describe failure".to_string()));
        }
        self.schema(entity).cloned()
    }

    fn source_type(&self) -> &'static str {
        "Memory"
    }
}

const COUNTRIES: &[&str] = &["Kenya", "India", "Brazil", "Germany", "Philippines", "Nigeria", "Mexico"];
const LANGUAGES: &[&str] = &["English", "Swahili", "Hindi", "Portuguese", "German", "Spanish", "Tagalog"];
const GENDERS: &[&str] = &["Female", "Male", "Non-binary"];
const EDUCATION: &[&str] = &["Secondary", "Bachelor", "Master", "Doctorate"];
const LEAD_SOURCES: &[&str] = &["Web", "Referral", "Partner", "Event"];
const CONTRIBUTOR_STATUS: &[&str] = &["Active", "Onboarding", "Inactive"];
const PROJECT_STATUS: &[&str] = &["Active", "Paused", "Completed"];
const PROJECT_TYPES: &[&str] = &["Transcription", "Translation", "Annotation"];

fn pick<'a>(rng: &mut StdRng, values: &[&'a str]) -> &'a str {
    values[rng.gen_range(0..values.len())]
}

/// Deterministic contributor/project dataset using the usual CRM naming:
/// `Contact`, `Project__c` and `Project_Assignment__c`.
///
/// Some contacts deliberately carry blank dimension values so "Unknown"
/// buckets show up in reports.
pub fn demo_dataset(seed: u64, contributors: usize) -> MemorySource {
    let mut rng = StdRng::seed_from_u64(seed);

    let contacts: Vec<Record> = (0..contributors)
        .map(|i| {
            let mut record = Record::new()
                .with("Id", format!("003{:06}", i))
                .with("Name", format!("Contributor {}", i))
                .with("LeadSource", pick(&mut rng, LEAD_SOURCES))
                .with("Gender__c", pick(&mut rng, GENDERS))
                .with("Education_Level__c", pick(&mut rng, EDUCATION))
                .with("Contributor_Status__c", pick(&mut rng, CONTRIBUTOR_STATUS));

            if rng.gen_bool(0.9) {
                record.insert("Mailing_Country__c", Value::from(pick(&mut rng, COUNTRIES)));
            } else {
                record.insert("Mailing_Country__c", Value::Null);
            }
            if rng.gen_bool(0.95) {
                record.insert("Primary_Language__c", Value::from(pick(&mut rng, LANGUAGES)));
            }
            let year = rng.gen_range(1950..2008);
            let month = rng.gen_range(1..=12);
            let day = rng.gen_range(1..=28);
            record.insert("Birthdate", Value::from(format!("{:04}-{:02}-{:02}", year, month, day)));
            record
        })
        .collect();

    let project_count = (contributors / 20).max(3);
    let projects: Vec<Record> = (0..project_count)
        .map(|i| {
            Record::new()
                .with("Id", format!("a0P{:06}", i))
                .with("Name", format!("Project {}", i))
                .with("Status__c", pick(&mut rng, PROJECT_STATUS))
                .with("Project_Type__c", pick(&mut rng, PROJECT_TYPES))
        })
        .collect();

    // Many-to-one against contacts: a contributor can hold several assignments
    let mut assignments = Vec::new();
    if contributors > 0 {
        for i in 0..contributors * 2 {
            let contact = rng.gen_range(0..contributors);
            let project = rng.gen_range(0..project_count);
            let status = if rng.gen_bool(0.7) { "Active" } else { "Ended" };
            assignments.push(
                Record::new()
                    .with("Id", format!("a0A{:06}", i))
                    .with("Contact__c", format!("003{:06}", contact))
                    .with("Project__c", format!("a0P{:06}", project))
                    .with("Status__c", status),
            );
        }
    }

    MemorySource::new()
        .with_entity(
            "Contact",
            vec![
                FieldDescriptor::new("Id", "id"),
                FieldDescriptor::new("Name", "string"),
                FieldDescriptor::new("LeadSource", "picklist").with_label("Lead Source"),
                FieldDescriptor::new("Mailing_Country__c", "picklist").with_label("Country"),
                FieldDescriptor::new("Primary_Language__c", "picklist").with_label("Primary Language"),
                FieldDescriptor::new("Birthdate", "date"),
                FieldDescriptor::new("Gender__c", "picklist"),
                FieldDescriptor::new("Education_Level__c", "picklist").with_label("Education Level"),
                FieldDescriptor::new("Contributor_Status__c", "picklist").with_label("Status"),
            ],
            contacts,
        )
        .with_entity(
            "Project__c",
            vec![
                FieldDescriptor::new("Id", "id"),
                FieldDescriptor::new("Name", "string"),
                FieldDescriptor::new("Status__c", "picklist"),
                FieldDescriptor::new("Project_Type__c", "picklist").with_label("Type"),
            ],
            projects,
        )
        .with_entity(
            "Project_Assignment__c",
            vec![
                FieldDescriptor::new("Id", "id"),
                FieldDescriptor::reference("Contact__c", "Contact", Some("Contact__r")),
                FieldDescriptor::reference("Project__c", "Project__c", Some("Project__r")),
                FieldDescriptor::new("Status__c", "picklist"),
            ],
            assignments,
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> MemorySource {
        MemorySource::new()
            .with_entity(
                "Contact",
                vec![FieldDescriptor::new("Id", "id"), FieldDescriptor::new("Country__c", "picklist")],
                vec![
                    Record::new().with("Id", "c1").with("Country__c", "Kenya"),
                    Record::new().with("Id", "c2").with("Country__c", "India"),
                ],
            )
            .with_entity(
                "Assignment__c",
                vec![
                    FieldDescriptor::new("Id", "id"),
                    FieldDescriptor::reference("Contact__c", "Contact", Some("Contact__r")),
                ],
                (0..5)
                    .map(|i| {
                        Record::new()
                            .with("Id", format!("a{}", i))
                            .with("Contact__c", if i % 2 == 0 { "c1" } else { "c2" })
                    })
                    .collect(),
            )
            .with_page_size(2)
    }

    #[tokio::test]
    async fn test_pagination_consumes_cursor_once() {
        let source = source();
        let page = source.query(&Query::new("Assignment__c", &["Id"])).await.unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(page.has_more());

        let cursor = page.next_cursor.unwrap();
        let replay = PageCursor::new(cursor.as_str());
        let second = source.query_more(cursor).await.unwrap();
        assert_eq!(second.records.len(), 2);

        // the same token cannot be served twice
        let err = source.query_more(replay).await.unwrap_err();
        assert!(err.is_rejected());
    }

    #[tokio::test]
    async fn test_relationship_traversal() {
        let source = source();
        let page = source
            .query(&Query::new("Assignment__c", &["Id", "Contact__r.Country__c"]).page_size(10))
            .await
            .unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].get_text("Contact__r.Country__c"), Some("Kenya".to_string()));
    }

    #[tokio::test]
    async fn test_relationship_rejected_when_disabled() {
        let source = source().without_relationships();
        let err = source
            .query(&Query::new("Assignment__c", &["Id", "Contact__r.Country__c"]))
            .await
            .unwrap_err();

        assert!(err.is_rejected());
    }

    #[tokio::test]
    async fn test_unknown_field_rejected() {
        let source = source();
        let err = source.query(&Query::new("Contact", &["Nope__c"])).await.unwrap_err();
        assert!(err.is_rejected());
    }

    #[test]
    fn test_demo_dataset_is_deterministic() {
        let a = demo_dataset(7, 50);
        let b = demo_dataset(7, 50);
        assert_eq!(a.rows("Contact"), b.rows("Contact"));
        assert_eq!(a.rows("Project_Assignment__c").len(), 100);
    }
}
