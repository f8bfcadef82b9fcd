//! SPARQL Client Pool
//!
//! A fixed-size pool of HTTP handles against the triple store's SPARQL
//! endpoint, behind the platform's authorizing proxy. Three scopes:
//!
//! - *sudo*: unrestricted, marked with an out-of-band header. Used for
//!   root-subject discovery and registry persistence.
//! - *group-scoped*: restricted to a canonical group set carried in the
//!   allowed-groups header. Used for document builds.
//! - *default*: neither header; the proxy applies the incoming request's
//!   identity.
//!
//! Transient failures (connection errors, timeouts, 5xx) are retried with a
//! quadratic backoff: attempt *n* sleeps *n²* seconds, six attempts total.

use crate::auth::{GroupSet, ALLOWED_GROUPS_HEADER, SUDO_HEADER};
use crate::rdf::Term;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Attempts made before a query is abandoned.
const RETRY_ATTEMPTS: u32 = 6;

/// Bound on waiting for a pooled handle.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

/// Triple store client errors
#[derive(Error, Debug)]
pub enum RdfError {
    /// HTTP transport error
    #[error("Transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-success status from the endpoint
    #[error("Triple store returned {status}: {body}")]
    Status { status: u16, body: String },

    /// No pooled handle became available in time
    #[error("Timed out acquiring a triple store connection")]
    PoolTimeout,

    /// The endpoint answered with something other than SPARQL JSON results
    #[error("Unexpected result shape: {0}")]
    Parse(String),

    /// Transient failures persisted through every retry
    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Result type for triple store operations
pub type RdfResult<T> = Result<T, RdfError>;

/// Authorization scope applied to a query.
#[derive(Debug, Clone)]
pub enum AuthScope {
    /// Unrestricted access
    Sudo,
    /// Restricted to a canonical group set
    Groups(GroupSet),
    /// Whatever identity the proxy derives for this process
    Default,
}

impl AuthScope {
    /// Out-of-band headers this scope adds to a request.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        match self {
            AuthScope::Sudo => vec![(SUDO_HEADER, "true".to_string())],
            AuthScope::Groups(groups) => vec![(ALLOWED_GROUPS_HEADER, groups.serialized())],
            AuthScope::Default => Vec::new(),
        }
    }
}

// ── SPARQL JSON results ─────────────────────────────────────────────────────

/// One bound value in a SPARQL JSON result row.
#[derive(Debug, Clone, Deserialize)]
pub struct BoundValue {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(default)]
    pub datatype: Option<String>,
    #[serde(default, rename = "xml:lang")]
    pub language: Option<String>,
}

impl BoundValue {
    pub fn is_uri(&self) -> bool {
        self.kind == "uri"
    }

    /// Convert to a domain term. Blank nodes come back as URIs with the
    /// store's skolem label; they only ever appear at intermediate hops.
    pub fn to_term(&self) -> Term {
        if self.is_uri() || self.kind == "bnode" {
            Term::uri(self.value.clone())
        } else {
            Term::Literal {
                value: self.value.clone(),
                datatype: self.datatype.clone(),
                language: self.language.clone(),
            }
        }
    }
}

/// One result row: variable name → bound value.
pub type Row = HashMap<String, BoundValue>;

#[derive(Debug, Deserialize)]
struct SparqlResponse {
    #[serde(default)]
    results: Option<SparqlResults>,
    #[serde(default)]
    boolean: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct SparqlResults {
    bindings: Vec<Row>,
}

// ── Pool ────────────────────────────────────────────────────────────────────

/// Fixed-size pool of SPARQL endpoint handles.
pub struct RdfClientPool {
    endpoint: String,
    handles: Vec<reqwest::Client>,
    next: AtomicUsize,
    permits: Arc<Semaphore>,
}

impl RdfClientPool {
    /// Build a pool of `size` handles against `endpoint`.
    pub fn new(endpoint: impl Into<String>, size: usize) -> RdfResult<Self> {
        let size = size.max(1);
        let mut handles = Vec::with_capacity(size);
        for _ in 0..size {
            handles.push(
                reqwest::Client::builder()
                    .connect_timeout(Duration::from_secs(5))
                    .timeout(Duration::from_secs(120))
                    .build()?,
            );
        }
        Ok(RdfClientPool {
            endpoint: endpoint.into(),
            handles,
            next: AtomicUsize::new(0),
            permits: Arc::new(Semaphore::new(size)),
        })
    }

    /// Run a SELECT and return its rows.
    pub async fn select(&self, query: &str, scope: &AuthScope) -> RdfResult<Vec<Row>> {
        let response = self.request_with_retry(query, scope, false).await?;
        match response.results {
            Some(results) => Ok(results.bindings),
            None => Err(RdfError::Parse("SELECT returned no bindings".to_string())),
        }
    }

    /// Run an ASK and return its boolean.
    pub async fn ask(&self, query: &str, scope: &AuthScope) -> RdfResult<bool> {
        let response = self.request_with_retry(query, scope, false).await?;
        response
            .boolean
            .ok_or_else(|| RdfError::Parse("ASK returned no boolean".to_string()))
    }

    /// Run a SPARQL UPDATE.
    pub async fn update(&self, update: &str, scope: &AuthScope) -> RdfResult<()> {
        self.request_with_retry(update, scope, true).await?;
        Ok(())
    }

    /// Trivial sudo ASK to verify the store is reachable and answering.
    pub async fn health_check(&self) -> RdfResult<bool> {
        self.ask("ASK { ?s ?p ?o }", &AuthScope::Sudo).await
    }

    /// Resolve the caller groups the authorizing proxy assigns this process:
    /// issue a trivial default-scope ASK and adopt the allowed-groups header
    /// the proxy attaches to the response.
    pub async fn resolve_groups(&self) -> RdfResult<Option<GroupSet>> {
        let _permit = self.acquire().await?;
        let client = self.handle();
        let response = client
            .post(&self.endpoint)
            .header("Accept", "application/sparql-results+json")
            .form(&[("query", "ASK { ?s ?p ?o }")])
            .send()
            .await?;

        let groups = response
            .headers()
            .get(ALLOWED_GROUPS_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| GroupSet::parse_header(v).ok());
        Ok(groups)
    }

    async fn acquire(&self) -> RdfResult<tokio::sync::OwnedSemaphorePermit> {
        tokio::time::timeout(ACQUIRE_TIMEOUT, Arc::clone(&self.permits).acquire_owned())
            .await
            .map_err(|_| RdfError::PoolTimeout)?
            .map_err(|_| RdfError::PoolTimeout)
    }

    fn handle(&self) -> &reqwest::Client {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        &self.handles[i % self.handles.len()]
    }

    async fn request_with_retry(
        &self,
        body: &str,
        scope: &AuthScope,
        is_update: bool,
    ) -> RdfResult<SparqlResponse> {
        let mut last_error = String::new();
        for attempt in 1..=RETRY_ATTEMPTS {
            match self.request_once(body, scope, is_update).await {
                Ok(response) => return Ok(response),
                Err(e) if is_transient(&e) && attempt < RETRY_ATTEMPTS => {
                    let delay = Duration::from_secs(u64::from(attempt * attempt));
                    warn!(
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "sparql_retry"
                    );
                    last_error = e.to_string();
                    tokio::time::sleep(delay).await;
                }
                Err(e) if is_transient(&e) => {
                    return Err(RdfError::RetriesExhausted {
                        attempts: RETRY_ATTEMPTS,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Err(RdfError::RetriesExhausted {
            attempts: RETRY_ATTEMPTS,
            last: last_error,
        })
    }

    async fn request_once(
        &self,
        body: &str,
        scope: &AuthScope,
        is_update: bool,
    ) -> RdfResult<SparqlResponse> {
        let _permit = self.acquire().await?;
        let client = self.handle();

        let field = if is_update { "update" } else { "query" };
        let mut request = client
            .post(&self.endpoint)
            .header("Accept", "application/sparql-results+json")
            .form(&[(field, body)]);
        for (name, value) in scope.headers() {
            request = request.header(name, value);
        }

        debug!(kind = field, "sparql_request");
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RdfError::Status {
                status: status.as_u16(),
                body,
            });
        }

        if is_update {
            // Update responses carry no result document worth parsing.
            return Ok(SparqlResponse {
                results: None,
                boolean: None,
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| RdfError::Parse(e.to_string()))
    }
}

/// Transient failures worth retrying: transport-level errors, 5xx, and the
/// usual overload statuses.
fn is_transient(error: &RdfError) -> bool {
    match error {
        RdfError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        RdfError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
        RdfError::PoolTimeout => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthGroup;

    #[test]
    fn test_sudo_scope_headers() {
        let headers = AuthScope::Sudo.headers();
        assert_eq!(headers, vec![(SUDO_HEADER, "true".to_string())]);
    }

    #[test]
    fn test_group_scope_headers_carry_canonical_json() {
        let groups = GroupSet::canonical(vec![
            AuthGroup::new("public", vec![]),
            AuthGroup::new("org", vec!["42".to_string()]),
        ]);
        let headers = AuthScope::Groups(groups.clone()).headers();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, ALLOWED_GROUPS_HEADER);
        assert_eq!(headers[0].1, groups.serialized());
    }

    #[test]
    fn test_default_scope_adds_no_headers() {
        assert!(AuthScope::Default.headers().is_empty());
    }

    #[test]
    fn test_bound_value_conversion() {
        let uri: BoundValue =
            serde_json::from_str(r#"{"type":"uri","value":"http://example.org/x"}"#).unwrap();
        assert!(uri.is_uri());
        assert_eq!(uri.to_term(), Term::uri("http://example.org/x"));

        let lang: BoundValue =
            serde_json::from_str(r#"{"type":"literal","value":"hoi","xml:lang":"nl"}"#).unwrap();
        assert_eq!(lang.to_term(), Term::lang_literal("hoi", "nl"));

        let typed: BoundValue = serde_json::from_str(
            r#"{"type":"typed-literal","value":"4","datatype":"http://www.w3.org/2001/XMLSchema#integer"}"#,
        )
        .unwrap();
        assert!(!typed.is_uri());
        assert_eq!(
            typed.to_term(),
            Term::typed_literal("4", crate::rdf::XSD_INTEGER)
        );
    }

    #[test]
    fn test_sparql_select_response_parsing() {
        let body = r#"{
            "head": { "vars": ["s"] },
            "results": { "bindings": [
                { "s": { "type": "uri", "value": "http://example.org/s1" } },
                { "s": { "type": "uri", "value": "http://example.org/s2" } }
            ]}
        }"#;
        let parsed: SparqlResponse = serde_json::from_str(body).unwrap();
        let rows = parsed.results.unwrap().bindings;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["s"].value, "http://example.org/s1");
    }

    #[test]
    fn test_sparql_ask_response_parsing() {
        let parsed: SparqlResponse =
            serde_json::from_str(r#"{"head":{},"boolean":true}"#).unwrap();
        assert_eq!(parsed.boolean, Some(true));
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&RdfError::Status {
            status: 503,
            body: String::new()
        }));
        assert!(is_transient(&RdfError::Status {
            status: 429,
            body: String::new()
        }));
        assert!(!is_transient(&RdfError::Status {
            status: 400,
            body: String::new()
        }));
        assert!(is_transient(&RdfError::PoolTimeout));
        assert!(!is_transient(&RdfError::Parse("x".to_string())));
    }
}
