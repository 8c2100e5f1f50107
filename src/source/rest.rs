//! Salesforce-style REST source
//!
//! Endpoints (relative to the instance URL):
//! - `GET /services/data/v{version}/query?q={soql}` - first page
//! - `GET {nextRecordsUrl}` - continuation page
//! - `GET /services/data/v{version}/sobjects/{entity}/describe` - field catalog
//!
//! Session acquisition is not handled here: an already-issued bearer token is
//! passed in from configuration.

use super::{EntityDescribe, PageCursor, Query, QueryPage, Record, RemoteSource, SourceError};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

/// Error codes that mean "this query shape is not supported" rather than
/// "the source is broken"
const REJECTION_CODES: &[&str] = &[
    "INVALID_FIELD",
    "MALFORMED_QUERY",
    "INVALID_TYPE",
    "INVALID_QUERY_FILTER_OPERATOR",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    records: Vec<Record>,
    done: bool,
    #[serde(default)]
    next_records_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiError {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

pub struct RestSource {
    client: reqwest::Client,
    base_url: String,
    api_version: String,
    access_token: Option<String>,
}

impl RestSource {
    pub fn new(
        base_url: &str,
        api_version: &str,
        access_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        log::info!("🔌 REST source configured: {} (API v{})", base_url, api_version);

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_version: api_version.to_string(),
            access_token,
        })
    }

    fn data_url(&self, path: &str) -> String {
        format!("{}/services/data/v{}/{}", self.base_url, self.api_version, path)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        url: &str,
        query: &[(&str, String)],
        batch_size: Option<usize>,
    ) -> Result<T, SourceError> {
        let mut request = self.client.get(url).query(query);

        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        if let Some(size) = batch_size {
            request = request.header("Sforce-Query-Options", format!("batchSize={}", size));
        }

        let response = request.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error(status.as_u16(), &body));
        }

        Ok(response.json::<T>().await?)
    }
}

/// Map an error response to a rejection or a plain HTTP failure.
///
/// The API answers with a JSON array of `{errorCode, message}` objects.
fn classify_error(status: u16, body: &str) -> SourceError {
    let errors: Vec<ApiError> = serde_json::from_str(body).unwrap_or_default();

    if status == 400 {
        if let Some(err) = errors
            .iter()
            .find(|e| REJECTION_CODES.contains(&e.error_code.as_str()))
        {
            return SourceError::rejected(&err.error_code, err.message.clone());
        }
    }

    let message = errors
        .first()
        .map(|e| format!("{}: {}", e.error_code, e.message))
        .unwrap_or_else(|| body.chars().take(200).collect());

    SourceError::Http { status, message }
}

impl From<QueryResponse> for QueryPage {
    fn from(response: QueryResponse) -> Self {
        QueryPage {
            records: response.records.into_iter().map(strip_attributes).collect(),
            done: response.done,
            next_cursor: response.next_records_url.map(PageCursor::new),
        }
    }
}

/// Drop the `attributes` metadata object the API attaches to every row,
/// including rows nested under relationship fields
fn strip_attributes(mut record: Record) -> Record {
    record.0.remove("attributes");
    for value in record.0.values_mut() {
        if let serde_json::Value::Object(nested) = value {
            nested.remove("attributes");
        }
    }
    record
}

#[async_trait]
impl RemoteSource for RestSource {
    async fn query(&self, query: &Query) -> Result<QueryPage, SourceError> {
        let soql = query.to_soql();
        log::debug!("📤 SOQL: {}", soql);

        let url = self.data_url("query");
        let response: QueryResponse = self.get_json(&url, &[("q", soql)], query.page_size).await?;
        Ok(response.into())
    }

    async fn query_more(&self, cursor: PageCursor) -> Result<QueryPage, SourceError> {
        let url = format!("{}{}", self.base_url, cursor.into_inner());
        let response: QueryResponse = self.get_json(&url, &[], None).await?;
        Ok(response.into())
    }

    async fn describe(&self, entity: &str) -> Result<EntityDescribe, SourceError> {
        let url = self.data_url(&format!("sobjects/{}/describe", entity));
        self.get_json(&url, &[], None).await
    }

    fn source_type(&self) -> &'static str {
        "REST"
    }
}
