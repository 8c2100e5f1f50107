//! Paginated batch fetcher
//!
//! Wraps the cursor-based query API in a bounded pull loop:
//!
//! ```text
//! query ──► page 1 ──► query_more(cursor) ──► page 2 ──► ... ──► stop
//! ```
//!
//! Stop conditions, whichever trips first:
//! - source reports `done` / no cursor        → `Completion::Exhausted`
//! - `max_pages` pages yielded                 → `Completion::PageLimit`
//! - deadline passed before the next call      → `Completion::DeadlineExceeded`
//! - a continuation page errors                → `Completion::ContinuationFailed`
//!
//! Continuation errors are never retried: the batches already yielded are the
//! final result. Only a failure of the very first page is returned as an error.

use crate::source::{PageCursor, Query, QueryPage, Record, RemoteSource, SourceError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Hard stop conditions for one fetch; both are mandatory
#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
    pub deadline: Instant,
    pub max_pages: usize,
}

impl FetchLimits {
    pub fn new(deadline: Instant, max_pages: usize) -> Self {
        Self { deadline, max_pages }
    }

    /// Deadline `budget` from now
    pub fn from_now(budget: Duration, max_pages: usize) -> Self {
        Self::new(Instant::now() + budget, max_pages)
    }

    pub fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// Why a fetch stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    Exhausted,
    PageLimit,
    DeadlineExceeded,
    ContinuationFailed,
    /// The first page failed; no records were produced
    Failed,
}

impl Completion {
    /// True when records may be missing from the result
    pub fn is_partial(&self) -> bool {
        !matches!(self, Completion::Exhausted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Completion::Exhausted => "exhausted",
            Completion::PageLimit => "page_limit",
            Completion::DeadlineExceeded => "deadline_exceeded",
            Completion::ContinuationFailed => "continuation_failed",
            Completion::Failed => "failed",
        }
    }
}

/// One page worth of records, in source order
#[derive(Debug)]
pub struct RecordBatch {
    pub page_number: usize,
    pub records: Vec<Record>,
}

/// Totals for a drained fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSummary {
    pub pages: usize,
    pub records: usize,
    pub completion: Completion,
}

enum FetchState {
    NotStarted,
    Continuing(PageCursor),
    Finished(Completion),
}

pub struct BatchFetcher {
    source: Arc<dyn RemoteSource>,
    query: Query,
    limits: FetchLimits,
    state: FetchState,
    pages: usize,
    records: usize,
}

impl BatchFetcher {
    pub fn new(source: Arc<dyn RemoteSource>, query: Query, limits: FetchLimits) -> Self {
        Self {
            source,
            query,
            limits,
            state: FetchState::NotStarted,
            pages: 0,
            records: 0,
        }
    }

    /// Next batch, `Ok(None)` once the fetch has stopped.
    ///
    /// Returns `Err` only when the first page fails.
    pub async fn next_batch(&mut self) -> Result<Option<RecordBatch>, SourceError> {
        let state = std::mem::replace(&mut self.state, FetchState::Finished(Completion::Exhausted));

        match state {
            FetchState::Finished(completion) => {
                self.state = FetchState::Finished(completion);
                Ok(None)
            }
            FetchState::NotStarted => {
                if self.limits.max_pages == 0 {
                    return Ok(self.finish(Completion::PageLimit));
                }
                if self.limits.deadline_passed() {
                    return Ok(self.finish(Completion::DeadlineExceeded));
                }

                match self.source.query(&self.query).await {
                    Ok(page) => Ok(Some(self.accept(page))),
                    Err(e) => {
                        log::error!("❌ First page of {} failed: {}", self.query.entity, e);
                        self.state = FetchState::Finished(Completion::Failed);
                        Err(e)
                    }
                }
            }
            FetchState::Continuing(cursor) => {
                if self.limits.deadline_passed() {
                    log::warn!(
                        "⏰ Deadline reached fetching {} after {} pages ({} records), returning partial result",
                        self.query.entity,
                        self.pages,
                        self.records
                    );
                    return Ok(self.finish(Completion::DeadlineExceeded));
                }

                match self.source.query_more(cursor).await {
                    Ok(page) => Ok(Some(self.accept(page))),
                    Err(e) => {
                        log::warn!(
                            "⚠️  Continuation page {} of {} failed, keeping {} records: {}",
                            self.pages + 1,
                            self.query.entity,
                            self.records,
                            e
                        );
                        Ok(self.finish(Completion::ContinuationFailed))
                    }
                }
            }
        }
    }

    fn finish(&mut self, completion: Completion) -> Option<RecordBatch> {
        self.state = FetchState::Finished(completion);
        None
    }

    fn accept(&mut self, page: QueryPage) -> RecordBatch {
        self.pages += 1;
        self.records += page.records.len();

        let has_more = page.has_more();
        self.state = match page.next_cursor {
            Some(cursor) if has_more => {
                if self.pages >= self.limits.max_pages {
                    log::warn!(
                        "📄 Page ceiling ({}) reached for {}, stopping",
                        self.limits.max_pages,
                        self.query.entity
                    );
                    FetchState::Finished(Completion::PageLimit)
                } else {
                    FetchState::Continuing(cursor)
                }
            }
            _ => FetchState::Finished(Completion::Exhausted),
        };

        log::debug!(
            "📥 {} page {}: {} records",
            self.query.entity,
            self.pages,
            page.records.len()
        );

        RecordBatch {
            page_number: self.pages,
            records: page.records,
        }
    }

    /// Stop reason, once the fetch has finished
    pub fn completion(&self) -> Option<Completion> {
        match self.state {
            FetchState::Finished(completion) => Some(completion),
            _ => None,
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages
    }

    pub fn records_fetched(&self) -> usize {
        self.records
    }

    /// Drain the fetch, handing each batch to `f` in source order
    pub async fn for_each_batch<F>(mut self, mut f: F) -> Result<FetchSummary, SourceError>
    where
        F: FnMut(RecordBatch),
    {
        while let Some(batch) = self.next_batch().await? {
            f(batch);
        }

        let completion = self.completion().unwrap_or(Completion::Exhausted);
        log::debug!(
            "✅ Fetched {} records in {} pages from {} ({})",
            self.records,
            self.pages,
            self.query.entity,
            completion.as_str()
        );

        Ok(FetchSummary {
            pages: self.pages,
            records: self.records,
            completion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FieldDescriptor, MemorySource};

    fn source(rows: usize, page_size: usize) -> MemorySource {
        MemorySource::new()
            .with_entity(
                "Contact",
                vec![FieldDescriptor::new("Id", "id")],
                (0..rows).map(|i| Record::new().with("Id", format!("c{:03}", i))).collect(),
            )
            .with_page_size(page_size)
    }

    fn query() -> Query {
        Query::new("Contact", &["Id"])
    }

    #[tokio::test]
    async fn test_fetches_all_pages_in_order() {
        let source: Arc<dyn RemoteSource> = Arc::new(source(25, 10));
        let fetcher = BatchFetcher::new(source, query(), FetchLimits::from_now(Duration::from_secs(5), 100));

        let mut ids = Vec::new();
        let mut page_numbers = Vec::new();
        let summary = fetcher
            .for_each_batch(|batch| {
                page_numbers.push(batch.page_number);
                ids.extend(batch.records.iter().filter_map(|r| r.id().map(str::to_string)));
            })
            .await
            .unwrap();

        assert_eq!(summary.pages, 3);
        assert_eq!(summary.records, 25);
        assert_eq!(summary.completion, Completion::Exhausted);
        assert_eq!(page_numbers, vec![1, 2, 3]);
        assert_eq!(ids.first().map(String::as_str), Some("c000"));
        assert_eq!(ids.last().map(String::as_str), Some("c024"));
    }

    #[tokio::test]
    async fn test_page_ceiling() {
        let memory = Arc::new(source(50, 10));
        let source: Arc<dyn RemoteSource> = memory.clone();
        let summary = BatchFetcher::new(source, query(), FetchLimits::from_now(Duration::from_secs(5), 2))
            .for_each_batch(|_| {})
            .await
            .unwrap();

        assert_eq!(summary.pages, 2);
        assert_eq!(summary.records, 20);
        assert_eq!(summary.completion, Completion::PageLimit);
        assert_eq!(memory.query_more_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_without_error() {
        let source: Arc<dyn RemoteSource> =
            Arc::new(source(10_000, 1).with_latency(Duration::from_millis(30)));
        let limits = FetchLimits::from_now(Duration::from_millis(50), 1000);
        let mut fetcher = BatchFetcher::new(source, query(), limits);

        let mut batches = 0;
        while let Some(_batch) = fetcher.next_batch().await.unwrap() {
            batches += 1;
        }

        assert!(batches <= 2, "yielded {} batches", batches);
        assert_eq!(fetcher.completion(), Some(Completion::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_continuation_failure_keeps_partial_stream() {
        let source: Arc<dyn RemoteSource> = Arc::new(source(30, 10).failing_continuation_after(2));
        let summary = BatchFetcher::new(source, query(), FetchLimits::from_now(Duration::from_secs(5), 100))
            .for_each_batch(|_| {})
            .await
            .unwrap();

        assert_eq!(summary.records, 20);
        assert_eq!(summary.completion, Completion::ContinuationFailed);
        assert!(summary.completion.is_partial());
    }

    #[tokio::test]
    async fn test_first_page_failure_is_fatal() {
        let source: Arc<dyn RemoteSource> = Arc::new(source(30, 10).failing_first_page());
        let mut fetcher = BatchFetcher::new(source, query(), FetchLimits::from_now(Duration::from_secs(5), 100));

        assert!(fetcher.next_batch().await.is_err());
        assert_eq!(fetcher.completion(), Some(Completion::Failed));
        assert!(fetcher.next_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_deadline_issues_no_calls() {
        let memory = Arc::new(source(5, 10));
        let source: Arc<dyn RemoteSource> = memory.clone();
        let limits = FetchLimits::new(Instant::now() - Duration::from_millis(1), 10);
        let summary = BatchFetcher::new(source, query(), limits)
            .for_each_batch(|_| {})
            .await
            .unwrap();

        assert_eq!(summary.records, 0);
        assert_eq!(summary.completion, Completion::DeadlineExceeded);
        assert_eq!(memory.query_calls(), 0);
    }
}
