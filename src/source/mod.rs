//! Remote data source interface
//!
//! The engine only ever reads from the remote CRM-style store through the
//! [`RemoteSource`] trait:
//!
//! ```text
//! query(Query)        -> QueryPage { records, done, next_cursor }
//! query_more(cursor)  -> QueryPage
//! describe(entity)    -> EntityDescribe { fields }
//! ```
//!
//! Two implementations ship with the crate:
//! - `rest::RestSource` - Salesforce-style REST API over reqwest
//! - `memory::MemorySource` - in-process simulation used by tests and the demo binary

pub mod memory;
pub mod rest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use memory::{demo_dataset, MemorySource};
pub use rest::RestSource;

/// A single row returned by the remote source.
///
/// Relationship traversals come back as nested objects, so `Contact__r.Country__c`
/// is stored as `{"Contact__r": {"Country__c": ...}}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(pub Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder-style insert, mostly for fixtures
    pub fn with(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.0.insert(field.to_string(), value.into());
        self
    }

    pub fn insert(&mut self, field: &str, value: Value) {
        self.0.insert(field.to_string(), value);
    }

    /// Record identifier (`Id`)
    pub fn id(&self) -> Option<&str> {
        self.0.get("Id").and_then(Value::as_str)
    }

    /// Walk a dotted field path through nested relationship objects.
    ///
    /// Each segment is matched exactly first, then case-insensitively, since
    /// deployments disagree on the casing of custom field names.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut current = &self.0;
        let mut segments = path.split('.').peekable();

        while let Some(segment) = segments.next() {
            let value = lookup(current, segment)?;
            if segments.peek().is_none() {
                return Some(value);
            }
            current = value.as_object()?;
        }

        None
    }

    /// Field value rendered as a trimmed, non-empty string
    pub fn get_text(&self, path: &str) -> Option<String> {
        self.get_path(path).and_then(value_as_text)
    }
}

fn lookup<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

/// Scalar JSON value as text; `null`, empty strings and containers yield `None`.
pub fn value_as_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };

    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Filter clause of a [`Query`]
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<String>),
    NotNull(String),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(field.to_string(), value.into())
    }

    pub fn to_soql(&self) -> String {
        match self {
            Filter::Eq(field, value) => format!("{} = {}", field, soql_literal(value)),
            Filter::In(field, values) => {
                let list: Vec<String> = values.iter().map(|v| quote(v)).collect();
                format!("{} IN ({})", field, list.join(", "))
            }
            Filter::NotNull(field) => format!("{} != null", field),
            Filter::And(parts) => parts
                .iter()
                .map(|p| match p {
                    Filter::And(_) => format!("({})", p.to_soql()),
                    _ => p.to_soql(),
                })
                .collect::<Vec<_>>()
                .join(" AND "),
        }
    }

    /// Evaluate the filter against a record (used by the in-memory source)
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Filter::Eq(field, expected) => match (record.get_path(field), expected) {
                (Some(Value::String(a)), Value::String(b)) => a.eq_ignore_ascii_case(b),
                (Some(actual), expected) => actual == expected,
                (None, Value::Null) => true,
                (None, _) => false,
            },
            Filter::In(field, values) => record
                .get_text(field)
                .map(|v| values.iter().any(|candidate| candidate == &v))
                .unwrap_or(false),
            Filter::NotNull(field) => record
                .get_path(field)
                .map(|v| !v.is_null())
                .unwrap_or(false),
            Filter::And(parts) => parts.iter().all(|p| p.matches(record)),
        }
    }
}

fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn soql_literal(value: &Value) -> String {
    match value {
        Value::String(s) => quote(s),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Structured query description, rendered to SOQL by the REST source
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub entity: String,
    pub fields: Vec<String>,
    pub filter: Option<Filter>,
    /// Requested page size; the source may return smaller pages
    pub page_size: Option<usize>,
}

impl Query {
    pub fn new(entity: &str, fields: &[&str]) -> Self {
        Self {
            entity: entity.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            filter: None,
            page_size: None,
        }
    }

    pub fn with_fields(entity: &str, fields: Vec<String>) -> Self {
        Self {
            entity: entity.to_string(),
            fields,
            filter: None,
            page_size: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.page_size = Some(size);
        self
    }

    /// Add a field unless it is already selected
    pub fn select(mut self, field: &str) -> Self {
        if !self.fields.iter().any(|f| f.eq_ignore_ascii_case(field)) {
            self.fields.push(field.to_string());
        }
        self
    }

    pub fn to_soql(&self) -> String {
        let fields = if self.fields.is_empty() {
            "Id".to_string()
        } else {
            self.fields.join(", ")
        };

        match &self.filter {
            Some(filter) => format!("SELECT {} FROM {} WHERE {}", fields, self.entity, filter.to_soql()),
            None => format!("SELECT {} FROM {}", fields, self.entity),
        }
    }
}

/// Continuation token for the next page.
///
/// Deliberately not `Clone`: `query_more` takes it by value so a cursor can
/// only be consumed once.
#[derive(Debug, PartialEq, Eq)]
pub struct PageCursor(String);

impl PageCursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

/// One page of query results
#[derive(Debug)]
pub struct QueryPage {
    pub records: Vec<Record>,
    pub done: bool,
    pub next_cursor: Option<PageCursor>,
}

impl QueryPage {
    /// True when another page can be requested
    pub fn has_more(&self) -> bool {
        !self.done && self.next_cursor.is_some()
    }
}

/// Field metadata from `describe`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "type", default)]
    pub field_type: String,
    #[serde(default)]
    pub reference_to: Vec<String>,
    #[serde(default)]
    pub relationship_name: Option<String>,
}

impl FieldDescriptor {
    pub fn new(name: &str, field_type: &str) -> Self {
        Self {
            name: name.to_string(),
            label: None,
            field_type: field_type.to_string(),
            reference_to: Vec::new(),
            relationship_name: None,
        }
    }

    pub fn reference(name: &str, target: &str, relationship_name: Option<&str>) -> Self {
        Self {
            name: name.to_string(),
            label: None,
            field_type: "reference".to_string(),
            reference_to: vec![target.to_string()],
            relationship_name: relationship_name.map(str::to_string),
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    pub fn is_reference(&self) -> bool {
        self.field_type.eq_ignore_ascii_case("reference") || !self.reference_to.is_empty()
    }
}

/// Entity schema returned by `describe`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescribe {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceError {
    /// The source refused the query shape (unsupported traversal, unknown field)
    Rejected { code: String, message: String },
    Http { status: u16, message: String },
    Transport(String),
    Decode(String),
    Unavailable(String),
}

impl SourceError {
    pub fn rejected(code: &str, message: impl Into<String>) -> Self {
        SourceError::Rejected {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, SourceError::Rejected { .. })
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Rejected { code, message } => write!(f, "Query rejected ({}): {}", code, message),
            SourceError::Http { status, message } => write!(f, "HTTP {}: {}", status, message),
            SourceError::Transport(e) => write!(f, "Transport error: {}", e),
            SourceError::Decode(e) => write!(f, "Decode error: {}", e),
            SourceError::Unavailable(e) => write!(f, "Source unavailable: {}", e),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SourceError::Decode(err.to_string())
        } else {
            SourceError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Decode(err.to_string())
    }
}

/// Paginated, read-only access to the remote store
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Issue a query and return its first page
    async fn query(&self, query: &Query) -> Result<QueryPage, SourceError>;

    /// Fetch the page a cursor points at
    async fn query_more(&self, cursor: PageCursor) -> Result<QueryPage, SourceError>;

    /// Field catalog of an entity
    async fn describe(&self, entity: &str) -> Result<EntityDescribe, SourceError>;

    /// Source type for logging
    fn source_type(&self) -> &'static str;
}
