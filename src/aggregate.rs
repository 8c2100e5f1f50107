//! Aggregation engine
//!
//! Folds a record stream into bucket maps keyed by a tuple of dimension values,
//! without ever holding the full record set:
//!
//! ```text
//! RecordBatch ──► Dimension extractors ──► key (country, language, ...)
//!                                            │
//!                     counting:  bucket[key] += 1
//!                     unique:    bucket[key].insert(entity_id)
//! ```
//!
//! Unique buckets are identity sets for their whole life. The count of a
//! unique bucket is only taken in [`Aggregator::finish`], so an entity that
//! shows up on several pages (or several source rows) is counted once.

use crate::source::Record;
use chrono::{Datelike, NaiveDate};
use serde::{Serialize, Serializer};
use std::collections::{BTreeMap, HashMap, HashSet};

pub const UNKNOWN: &str = "Unknown";

type Extractor = Box<dyn Fn(&Record) -> Option<String> + Send + Sync>;

/// Placeholder strings some orgs store instead of leaving a field blank
const BLANK_MARKERS: &[&str] = &["null", "none", "n/a", "-"];

/// One axis of aggregation
pub struct Dimension {
    pub name: String,
    extractor: Extractor,
    unknown_label: String,
    multi_value: bool,
}

impl Dimension {
    pub fn new<F>(name: &str, extractor: F) -> Self
    where
        F: Fn(&Record) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            extractor: Box::new(extractor),
            unknown_label: UNKNOWN.to_string(),
            multi_value: false,
        }
    }

    /// Raw text of a field (dotted paths traverse relationships)
    pub fn field(name: &str, path: &str) -> Self {
        let path = path.to_string();
        Self::new(name, move |record| record.get_text(&path))
    }

    /// Age bracket from a numeric age field
    pub fn age_from_field(name: &str, path: &str) -> Self {
        let path = path.to_string();
        Self::new(name, move |record| {
            record
                .get_text(&path)
                .and_then(|raw| raw.parse::<f64>().ok())
                .filter(|age| *age >= 0.0)
                .map(|age| age_bracket(age.floor() as u32).to_string())
        })
    }

    /// Age bracket computed from a birth-date field as of `today`
    pub fn age_from_birthdate(name: &str, path: &str, today: NaiveDate) -> Self {
        let path = path.to_string();
        Self::new(name, move |record| {
            record
                .get_text(&path)
                .and_then(|raw| parse_date(&raw))
                .and_then(|birth| age_on(birth, today))
                .map(|age| age_bracket(age).to_string())
        })
    }

    pub fn with_unknown_label(mut self, label: &str) -> Self {
        self.unknown_label = label.to_string();
        self
    }

    /// Split `a;b;c` multi-select values, counting the record once per value
    pub fn multi_value(mut self) -> Self {
        self.multi_value = true;
        self
    }

    /// Normalized values for a record; never empty
    pub fn values(&self, record: &Record) -> Vec<String> {
        let raw = (self.extractor)(record);

        let values: Vec<String> = match raw {
            Some(text) if self.multi_value => text.split(';').filter_map(normalize).collect(),
            Some(text) => normalize(&text).into_iter().collect(),
            None => Vec::new(),
        };

        if values.is_empty() {
            vec![self.unknown_label.clone()]
        } else {
            values
        }
    }
}

fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || BLANK_MARKERS.iter().any(|m| trimmed.eq_ignore_ascii_case(m)) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    // Accept plain dates and the date prefix of datetimes
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
}

fn age_on(birth: NaiveDate, today: NaiveDate) -> Option<u32> {
    let mut years = today.year() - birth.year();
    if (today.month(), today.day()) < (birth.month(), birth.day()) {
        years -= 1;
    }
    u32::try_from(years).ok()
}

/// Fixed reporting brackets
pub fn age_bracket(age: u32) -> &'static str {
    match age {
        0..=17 => "Under 18",
        18..=24 => "18-24",
        25..=34 => "25-34",
        35..=44 => "35-44",
        45..=54 => "45-54",
        55..=64 => "55-64",
        _ => "65+",
    }
}

/// Dimensions to aggregate by, and whether buckets count rows or unique entities
pub struct DimensionSpec {
    pub dimensions: Vec<Dimension>,
    identity: Option<Extractor>,
}

impl DimensionSpec {
    pub fn new(dimensions: Vec<Dimension>) -> Self {
        Self {
            dimensions,
            identity: None,
        }
    }

    pub fn single(dimension: Dimension) -> Self {
        Self::new(vec![dimension])
    }

    /// Count distinct identities instead of rows
    pub fn unique_by<F>(mut self, identity: F) -> Self
    where
        F: Fn(&Record) -> Option<String> + Send + Sync + 'static,
    {
        self.identity = Some(Box::new(identity));
        self
    }

    /// Count distinct values of a field (e.g. the contact a row points at)
    pub fn unique_by_field(self, path: &str) -> Self {
        let path = path.to_string();
        self.unique_by(move |record| record.get_text(&path))
    }

    pub fn is_unique(&self) -> bool {
        self.identity.is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.dimensions.iter().map(|d| d.name.clone()).collect()
    }
}

enum Buckets {
    Counts(HashMap<Vec<String>, u64>),
    Unique(HashMap<Vec<String>, HashSet<String>>),
}

pub struct Aggregator {
    spec: DimensionSpec,
    buckets: Buckets,
    records_seen: u64,
    missing_identity: u64,
}

impl Aggregator {
    pub fn new(spec: DimensionSpec) -> Self {
        let buckets = if spec.is_unique() {
            Buckets::Unique(HashMap::new())
        } else {
            Buckets::Counts(HashMap::new())
        };

        Self {
            spec,
            buckets,
            records_seen: 0,
            missing_identity: 0,
        }
    }

    pub fn fold_batch(&mut self, records: &[Record]) {
        for record in records {
            self.fold_record(record);
        }
    }

    pub fn fold_record(&mut self, record: &Record) {
        self.records_seen += 1;

        let identity = match &self.spec.identity {
            Some(extract) => match extract(record) {
                Some(id) => Some(id),
                None => {
                    self.missing_identity += 1;
                    return;
                }
            },
            None => None,
        };

        let per_dimension: Vec<Vec<String>> = self.spec.dimensions.iter().map(|d| d.values(record)).collect();

        for key in cartesian(&per_dimension) {
            self.insert(key, identity.as_deref());
        }
    }

    /// Add one observation whose dimension values were extracted elsewhere
    /// (joined rows, for instance). Missing values take each dimension's
    /// Unknown label.
    pub fn observe(&mut self, values: Vec<Option<String>>, identity: Option<&str>) {
        self.records_seen += 1;

        if self.spec.is_unique() && identity.is_none() {
            self.missing_identity += 1;
            return;
        }

        let key: Vec<String> = self
            .spec
            .dimensions
            .iter()
            .zip(values.into_iter().chain(std::iter::repeat(None)))
            .map(|(dimension, value)| {
                value
                    .as_deref()
                    .and_then(normalize)
                    .unwrap_or_else(|| dimension.unknown_label.clone())
            })
            .collect();

        self.insert(key, identity);
    }

    fn insert(&mut self, key: Vec<String>, identity: Option<&str>) {
        match (&mut self.buckets, identity) {
            (Buckets::Unique(map), Some(id)) => {
                map.entry(key).or_default().insert(id.to_string());
            }
            (Buckets::Unique(_), None) => {}
            (Buckets::Counts(map), _) => {
                *map.entry(key).or_insert(0) += 1;
            }
        }
    }

    pub fn records_seen(&self) -> u64 {
        self.records_seen
    }

    /// Materialize the buckets: count descending, then key ascending
    pub fn finish(self) -> AggregationResult {
        let unique = self.spec.is_unique();
        let mut buckets: Vec<(Vec<String>, u64)> = match self.buckets {
            Buckets::Counts(map) => map.into_iter().collect(),
            Buckets::Unique(map) => map.into_iter().map(|(k, set)| (k, set.len() as u64)).collect(),
        };

        buckets.sort_by(|(ka, ca), (kb, cb)| cb.cmp(ca).then_with(|| ka.cmp(kb)));

        let total: u64 = buckets.iter().map(|(_, count)| count).sum();
        let buckets = buckets
            .into_iter()
            .map(|(key, count)| BucketCount {
                percentage: percentage(count, total),
                key,
                count,
            })
            .collect();

        if self.missing_identity > 0 {
            log::debug!("{} records had no identity and were not counted", self.missing_identity);
        }

        AggregationResult {
            dimensions: self.spec.names(),
            buckets,
            total,
            unique,
            records_seen: self.records_seen,
        }
    }
}

/// Every combination of per-dimension values; one key per record unless a
/// dimension is multi-valued
fn cartesian(per_dimension: &[Vec<String>]) -> Vec<Vec<String>> {
    per_dimension.iter().fold(vec![Vec::new()], |acc, values| {
        acc.iter()
            .flat_map(|prefix| {
                values.iter().map(move |value| {
                    let mut key = prefix.clone();
                    key.push(value.clone());
                    key
                })
            })
            .collect()
    })
}

/// Share of `total`, in percent, rounded to one decimal place
pub fn percentage(count: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (count as f64 / total as f64 * 1000.0).round() / 10.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketCount {
    pub key: Vec<String>,
    pub count: u64,
    pub percentage: f64,
}

/// Response row for single-dimension reports
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyCount {
    pub key: String,
    pub count: u64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationResult {
    pub dimensions: Vec<String>,
    pub buckets: Vec<BucketCount>,
    pub total: u64,
    pub unique: bool,
    pub records_seen: u64,
}

impl AggregationResult {
    /// Flatten to `[{key, count, percentage}]`, joining multi-part keys with " / "
    pub fn key_counts(&self) -> Vec<KeyCount> {
        self.buckets
            .iter()
            .map(|b| KeyCount {
                key: b.key.join(" / "),
                count: b.count,
                percentage: b.percentage,
            })
            .collect()
    }

    pub fn count_of(&self, key: &[&str]) -> u64 {
        self.buckets
            .iter()
            .find(|b| b.key.iter().map(String::as_str).eq(key.iter().copied()))
            .map(|b| b.count)
            .unwrap_or(0)
    }

    /// Two-dimension result as a row × column table; `None` for other arities
    pub fn cross_tab(&self) -> Option<CrossTab> {
        if self.dimensions.len() != 2 {
            return None;
        }

        let mut rows: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        let mut column_totals: HashMap<String, u64> = HashMap::new();

        for bucket in &self.buckets {
            let (row, col) = (&bucket.key[0], &bucket.key[1]);
            *rows.entry(row.clone()).or_default().entry(col.clone()).or_insert(0) += bucket.count;
            *column_totals.entry(col.clone()).or_insert(0) += bucket.count;
        }

        let mut columns: Vec<(String, u64)> = column_totals.into_iter().collect();
        columns.sort_by(|(a, ca), (b, cb)| cb.cmp(ca).then_with(|| a.cmp(b)));

        let mut rows: Vec<CrossTabRow> = rows
            .into_iter()
            .map(|(row_key, cells)| CrossTabRow {
                total: cells.values().sum(),
                row_key,
                cells,
            })
            .collect();
        rows.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.row_key.cmp(&b.row_key)));

        Some(CrossTab {
            row_dimension: self.dimensions[0].clone(),
            column_dimension: self.dimensions[1].clone(),
            columns: columns.into_iter().map(|(name, _)| name).collect(),
            rows,
            total: self.total,
        })
    }
}

/// One cross-tab row, serialized as `{ "rowKey": ..., "<column>": n, ... }`
#[derive(Debug, Clone, PartialEq)]
pub struct CrossTabRow {
    pub row_key: String,
    pub total: u64,
    pub cells: BTreeMap<String, u64>,
}

impl CrossTabRow {
    pub fn get(&self, column: &str) -> u64 {
        self.cells.get(column).copied().unwrap_or(0)
    }
}

impl Serialize for CrossTabRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(Some(self.cells.len() + 2))?;
        map.serialize_entry("rowKey", &self.row_key)?;
        for (column, count) in &self.cells {
            map.serialize_entry(column, count)?;
        }
        map.serialize_entry("total", &self.total)?;
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossTab {
    pub row_dimension: String,
    pub column_dimension: String,
    pub columns: Vec<String>,
    pub rows: Vec<CrossTabRow>,
    pub total: u64,
}
