//! Search Engine Client
//!
//! Thin wrapper over the search engine's index, document, and cluster HTTP
//! APIs. Deliberately dumb: request in, JSON out, with the error mapping the
//! rest of the system relies on:
//!
//! - missing documents and indexes come back as `false`/`None`, not errors
//! - "already exists" on index creation is a warning, not a failure
//! - malformed queries surface as [`SearchError::BadRequest`] and are never
//!   retried
//! - everything transient retries with the same quadratic backoff as the
//!   triple store client

use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const RETRY_ATTEMPTS: u32 = 6;

/// Search engine client errors
#[derive(Error, Debug)]
pub enum SearchError {
    /// HTTP transport error
    #[error("Transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// The engine rejected the request as malformed
    #[error("Search engine rejected the request: {0}")]
    BadRequest(String),

    /// Any other non-success status
    #[error("Search engine returned {status}: {body}")]
    Engine { status: u16, body: String },

    /// The engine answered with an unexpected document
    #[error("Unexpected engine response: {0}")]
    Parse(String),

    /// Transient failures persisted through every retry
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Result type for search engine operations
pub type SearchResult<T> = Result<T, SearchError>;

/// Derive the engine document id for a root subject URI.
///
/// The URI is percent-encoded so it survives as a single path segment.
pub fn document_id(subject: &str) -> String {
    let mut out = String::with_capacity(subject.len() * 3);
    for byte in subject.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

/// Client for one search engine cluster.
pub struct SearchClient {
    base_url: String,
    client: reqwest::Client,
}

impl SearchClient {
    pub fn new(base_url: impl Into<String>) -> SearchResult<Self> {
        let base_url: String = base_url.into();
        Ok(SearchClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .timeout(Duration::from_secs(120))
                .build()?,
        })
    }

    // ── Index APIs ──────────────────────────────────────────────────────────

    /// Create a physical index, optionally with a settings template.
    /// An index that already exists is a warning, not an error.
    pub async fn create_index(&self, name: &str, settings: Option<&Value>) -> SearchResult<()> {
        let body = settings.cloned().unwrap_or_else(|| json!({}));
        let url = format!("{}/{}", self.base_url, name);
        let result = self
            .with_retry("create_index", || async {
                let response = self.client.put(&url).json(&body).send().await?;
                self.check(response).await
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(SearchError::BadRequest(message))
                if message.contains("resource_already_exists_exception") =>
            {
                warn!(index = name, "index_already_exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Delete a physical index. Returns `false` if it did not exist.
    pub async fn delete_index(&self, name: &str) -> SearchResult<bool> {
        let url = format!("{}/{}", self.base_url, name);
        let result = self
            .with_retry("delete_index", || async {
                let response = self.client.delete(&url).send().await?;
                self.check(response).await
            })
            .await;
        absent_as_false(result)
    }

    /// Does a physical index exist?
    pub async fn index_exists(&self, name: &str) -> SearchResult<bool> {
        let url = format!("{}/{}", self.base_url, name);
        let response = self.client.head(&url).send().await?;
        Ok(response.status().is_success())
    }

    /// Make everything indexed so far visible to search.
    pub async fn refresh_index(&self, name: &str) -> SearchResult<()> {
        let url = format!("{}/{}/_refresh", self.base_url, name);
        self.with_retry("refresh_index", || async {
            let response = self.client.post(&url).send().await?;
            self.check(response).await
        })
        .await?;
        Ok(())
    }

    // ── Document APIs ───────────────────────────────────────────────────────

    /// Insert or fully replace a document.
    pub async fn upsert_document(&self, index: &str, id: &str, doc: &Value) -> SearchResult<()> {
        let url = format!("{}/{}/_doc/{}", self.base_url, index, id);
        self.with_retry("upsert_document", || async {
            let response = self.client.put(&url).json(doc).send().await?;
            self.check(response).await
        })
        .await?;
        Ok(())
    }

    /// Delete a document. Returns `false` if it did not exist.
    pub async fn delete_document(&self, index: &str, id: &str) -> SearchResult<bool> {
        let url = format!("{}/{}/_doc/{}", self.base_url, index, id);
        let result = self
            .with_retry("delete_document", || async {
                let response = self.client.delete(&url).send().await?;
                self.check(response).await
            })
            .await;
        absent_as_false(result)
    }

    /// Fetch a document's source. Returns `None` if absent.
    pub async fn get_document(&self, index: &str, id: &str) -> SearchResult<Option<Value>> {
        let url = format!("{}/{}/_doc/{}", self.base_url, index, id);
        let response = self.client.get(&url).send().await?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let body = self.check(response).await?;
        Ok(body.get("_source").cloned())
    }

    /// Bulk-upsert a page of `(id, document)` pairs.
    pub async fn bulk_upsert(&self, index: &str, docs: &[(String, Value)]) -> SearchResult<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let mut body = String::new();
        for (id, doc) in docs {
            body.push_str(&json!({ "index": { "_index": index, "_id": id } }).to_string());
            body.push('\n');
            body.push_str(&doc.to_string());
            body.push('\n');
        }
        let url = format!("{}/_bulk", self.base_url);
        self.with_retry("bulk_upsert", || async {
            let response = self
                .client
                .post(&url)
                .header("Content-Type", "application/x-ndjson")
                .body(body.clone())
                .send()
                .await?;
            self.check(response).await
        })
        .await?;
        Ok(())
    }

    // ── Search APIs ─────────────────────────────────────────────────────────

    /// Run a search request against one or more indexes.
    /// Bad requests surface immediately; they are caller errors.
    pub async fn search(&self, indexes: &[String], body: &Value) -> SearchResult<Value> {
        let url = format!("{}/{}/_search", self.base_url, indexes.join(","));
        let response = self.client.post(&url).json(body).send().await?;
        self.check(response).await
    }

    /// Count documents matching a query.
    pub async fn count(&self, indexes: &[String], body: &Value) -> SearchResult<u64> {
        let url = format!("{}/{}/_count", self.base_url, indexes.join(","));
        let response = self.client.post(&url).json(body).send().await?;
        let parsed = self.check(response).await?;
        parsed
            .get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| SearchError::Parse("count response without count".to_string()))
    }

    /// Cluster health document.
    pub async fn health(&self) -> SearchResult<Value> {
        let url = format!("{}/_cluster/health", self.base_url);
        let response = self.client.get(&url).send().await?;
        self.check(response).await
    }

    // ── Internals ───────────────────────────────────────────────────────────

    async fn check(&self, response: reqwest::Response) -> SearchResult<Value> {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            if text.is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| SearchError::Parse(e.to_string()));
        }
        match status.as_u16() {
            400 => Err(SearchError::BadRequest(text)),
            code => Err(SearchError::Engine {
                status: code,
                body: text,
            }),
        }
    }

    async fn with_retry<F, Fut>(&self, op: &str, f: F) -> SearchResult<Value>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = SearchResult<Value>>,
    {
        let mut last_error = String::new();
        for attempt in 1..=RETRY_ATTEMPTS {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < RETRY_ATTEMPTS => {
                    let delay = Duration::from_secs(u64::from(attempt * attempt));
                    warn!(op, attempt, delay_secs = delay.as_secs(), error = %e, "engine_retry");
                    last_error = e.to_string();
                    tokio::time::sleep(delay).await;
                }
                Err(e) if is_transient(&e) => {
                    return Err(SearchError::RetriesExhausted {
                        attempts: RETRY_ATTEMPTS,
                        last: e.to_string(),
                    });
                }
                Err(e) => {
                    debug!(op, error = %e, "engine_request_failed");
                    return Err(e);
                }
            }
        }
        Err(SearchError::RetriesExhausted {
            attempts: RETRY_ATTEMPTS,
            last: last_error,
        })
    }
}

/// Map a 404 engine response onto `Ok(false)`.
fn absent_as_false(result: SearchResult<Value>) -> SearchResult<bool> {
    match result {
        Ok(_) => Ok(true),
        Err(SearchError::Engine { status: 404, .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

fn is_transient(error: &SearchError) -> bool {
    match error {
        SearchError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        SearchError::Engine { status, .. } => *status >= 500 || *status == 408 || *status == 429,
        _ => false,
    }
}
