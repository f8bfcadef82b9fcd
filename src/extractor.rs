//! Content Extraction Client
//!
//! Converts attached binary files to plain text through the extraction
//! service, with an on-disk content-addressed cache: the SHA-256 of the blob
//! names the cache file, and an empty cache file records that the extractor
//! produced nothing for that blob (negative hit), so it is never re-sent.
//!
//! Attachment URIs use the platform's share scheme; the local path is the
//! URI with the scheme stripped, joined onto the configured attachments
//! root. Missing or oversized files degrade to "no content" so the rest of
//! the document still gets indexed.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Scheme prefix of attachment URIs.
const SHARE_SCHEME: &str = "share://";

/// Files above this size are skipped, not extracted.
pub const MAXIMUM_FILE_SIZE: u64 = 200 * 1024 * 1024;

const RETRY_ATTEMPTS: u32 = 6;

/// Content extraction errors
#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Extractor returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Result type for extraction operations
pub type ExtractResult<T> = Result<T, ExtractError>;

/// Client for the content extraction service plus its local cache.
pub struct ContentExtractor {
    service_url: Option<String>,
    client: reqwest::Client,
    cache_dir: PathBuf,
    attachments_base: PathBuf,
}

impl ContentExtractor {
    pub fn new(
        service_url: Option<String>,
        cache_dir: PathBuf,
        attachments_base: PathBuf,
    ) -> ExtractResult<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(ContentExtractor {
            service_url,
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(5))
                .timeout(Duration::from_secs(300))
                .build()?,
            cache_dir,
            attachments_base,
        })
    }

    /// Resolve an attachment URI to its local path.
    /// Returns `None` for URIs outside the share scheme.
    pub fn resolve_path(&self, file_uri: &str) -> Option<PathBuf> {
        file_uri
            .strip_prefix(SHARE_SCHEME)
            .map(|rel| self.attachments_base.join(rel))
    }

    /// Extract the text content of an attachment.
    ///
    /// Returns `None` when there is nothing to index: unresolvable URI,
    /// missing file, file over the size cap, or extraction disabled. The
    /// caller indexes the document without attachment content in that case.
    pub async fn extract(&self, file_uri: &str, pipeline: &str) -> ExtractResult<Option<String>> {
        let Some(path) = self.resolve_path(file_uri) else {
            warn!(uri = file_uri, "attachment_uri_not_resolvable");
            return Ok(None);
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "attachment_file_missing");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if metadata.len() > MAXIMUM_FILE_SIZE {
            warn!(
                path = %path.display(),
                size = metadata.len(),
                "attachment_file_too_large"
            );
            return Ok(None);
        }

        let blob = tokio::fs::read(&path).await?;
        let digest = blob_digest(&blob);
        let cache_path = self.cache_dir.join(&digest);

        if let Ok(cached) = tokio::fs::read_to_string(&cache_path).await {
            debug!(digest = %digest, negative = cached.is_empty(), "extraction_cache_hit");
            return Ok(Some(cached));
        }

        let Some(service_url) = &self.service_url else {
            warn!(uri = file_uri, "extraction_service_not_configured");
            return Ok(None);
        };

        let text = self.call_extractor(service_url, pipeline, &blob).await?;
        self.write_cache(&cache_path, &text).await?;
        Ok(Some(text))
    }

    async fn call_extractor(
        &self,
        service_url: &str,
        pipeline: &str,
        blob: &[u8],
    ) -> ExtractResult<String> {
        let url = format!("{}/extract?pipeline={}", service_url.trim_end_matches('/'), pipeline);
        let mut last_error = String::new();
        for attempt in 1..=RETRY_ATTEMPTS {
            let result = async {
                let response = self
                    .client
                    .post(&url)
                    .header("Content-Type", "application/octet-stream")
                    .body(blob.to_vec())
                    .send()
                    .await?;
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                if status.is_success() {
                    Ok(body)
                } else {
                    Err(ExtractError::Status {
                        status: status.as_u16(),
                        body,
                    })
                }
            }
            .await;

            match result {
                Ok(text) => return Ok(text),
                Err(e) if is_transient(&e) && attempt < RETRY_ATTEMPTS => {
                    let delay = Duration::from_secs(u64::from(attempt * attempt));
                    warn!(attempt, delay_secs = delay.as_secs(), error = %e, "extractor_retry");
                    last_error = e.to_string();
                    tokio::time::sleep(delay).await;
                }
                Err(e) if is_transient(&e) => {
                    return Err(ExtractError::RetriesExhausted {
                        attempts: RETRY_ATTEMPTS,
                        last: e.to_string(),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Err(ExtractError::RetriesExhausted {
            attempts: RETRY_ATTEMPTS,
            last: last_error,
        })
    }

    /// Write-then-rename so a crashed write never leaves a torn cache entry.
    async fn write_cache(&self, cache_path: &Path, text: &str) -> ExtractResult<()> {
        let tmp = cache_path.with_extension("tmp");
        tokio::fs::write(&tmp, text).await?;
        tokio::fs::rename(&tmp, cache_path).await?;
        Ok(())
    }
}

/// Hex SHA-256 of a blob, the cache key.
pub fn blob_digest(blob: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(blob);
    format!("{:x}", hasher.finalize())
}

fn is_transient(error: &ExtractError) -> bool {
    match error {
        ExtractError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
        ExtractError::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
        _ => false,
    }
}
