//! External catalog client.
//!
//! The reconciliation engine reads the authoritative catalog only through
//! the [`CatalogSource`] trait. [`HttpCatalog`] is the production adapter: it
//! talks to a paged JSON API and retries transient failures with
//! exponential backoff.
//!
//! # Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | repositories | `GET /v1/repositories` |
//! | images | `GET /v1/repositories/registry/{registry}/repository/{repository}/images` |
//! | vulnerabilities | `GET /v1/images/id/{id}/vulnerabilities` |
//!
//! Every response is wrapped in a page envelope:
//!
//! ```json
//! { "data": [ ... ], "page": 0, "page_size": 500, "total": 1234 }
//! ```

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::CatalogConfig;
use crate::error::CatalogError;
use crate::models::{truncate_to_millis, ApiImage, ApiRepository};

/// Read-only view of the external catalog.
///
/// Implementations must be `Send + Sync`; the engine awaits every call in
/// sequence and never issues concurrent requests.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// All repositories known to the catalog.
    async fn list_repositories(&self) -> Result<Vec<ApiRepository>, CatalogError>;

    /// Images currently published in one repository.
    async fn list_images(
        &self,
        registry: &str,
        repository: &str,
    ) -> Result<Vec<ApiImage>, CatalogError>;

    /// Names of the CVEs affecting one image, keyed by its catalog id.
    async fn list_cve_names(&self, image_external_id: &str)
        -> Result<BTreeSet<String>, CatalogError>;
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    data: Vec<T>,
    #[serde(default)]
    total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RepositoryRecord {
    #[serde(rename = "_id")]
    id: String,
    registry: String,
    repository: String,
    last_update_date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ImageRecord {
    #[serde(rename = "_id")]
    id: String,
    image_id: String,
    last_update_date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct VulnerabilityRecord {
    cve_id: String,
}

/// [`CatalogSource`] over the catalog's HTTP API.
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
    page_size: usize,
    max_retries: u32,
    retry_base: Duration,
    token: Option<String>,
}

impl HttpCatalog {
    /// Build a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `token_env` names a variable that is not set, or
    /// if the HTTP client cannot be constructed.
    pub fn new(config: &CatalogConfig) -> Result<Self, CatalogError> {
        let token = match &config.token_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                CatalogError::Other(anyhow::anyhow!(
                    "{} environment variable not set",
                    var
                ))
            })?),
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(CatalogError::Url(base_url));
        }

        Ok(Self {
            client,
            base_url,
            page_size: config.page_size,
            max_retries: config.max_retries,
            retry_base: Duration::from_secs(1),
            token,
        })
    }

    /// Override the first backoff delay (doubles on every retry).
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    fn backoff(&self, attempt: u32) -> Duration {
        // 1x, 2x, 4x, ... capped at 32x
        self.retry_base * (1u32 << (attempt - 1).min(5))
    }

    /// Fetch every page of a listing endpoint.
    ///
    /// Stops once `total` items have been read, or, without a `total`, on a
    /// short page. An empty page always ends the listing.
    async fn fetch_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, CatalogError> {
        let url = format!("{}{}", self.base_url, path);
        let mut items = Vec::new();
        let mut page = 0usize;

        loop {
            let batch: Page<T> = self.get_page(&url, page).await?;
            let received = batch.data.len();
            items.extend(batch.data);

            debug!(url = %url, page, received, "Fetched catalog page");

            // The server may cap pages below `page_size`; trust `total` when given.
            if received == 0 {
                break;
            }
            match batch.total {
                Some(total) if items.len() >= total => break,
                Some(_) => {}
                None if received < self.page_size => break,
                None => {}
            }
            page += 1;
        }

        Ok(items)
    }

    /// GET one page with retry.
    ///
    /// - HTTP 429 or 5xx → retry with exponential backoff
    /// - other non-success status → fail immediately
    /// - transport error → retry
    async fn get_page<T: DeserializeOwned>(
        &self,
        url: &str,
        page: usize,
    ) -> Result<T, CatalogError> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff(attempt)).await;
            }

            let mut request = self
                .client
                .get(url)
                .query(&[("page", page), ("page_size", self.page_size)]);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json::<T>().await?);
                    }

                    let body = response.text().await.unwrap_or_default();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        warn!(url = %url, %status, attempt, "Catalog request failed, retrying");
                        last_err = Some(format!("{}: {}", status, body));
                        continue;
                    }

                    return Err(CatalogError::Status {
                        status,
                        url: url.to_string(),
                        body,
                    });
                }
                Err(e) => {
                    warn!(url = %url, error = %e, attempt, "Catalog request error, retrying");
                    last_err = Some(e.to_string());
                    continue;
                }
            }
        }

        Err(CatalogError::RetriesExhausted {
            url: url.to_string(),
            attempts: self.max_retries + 1,
            last: last_err.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl CatalogSource for HttpCatalog {
    async fn list_repositories(&self) -> Result<Vec<ApiRepository>, CatalogError> {
        let records: Vec<RepositoryRecord> = self.fetch_all("/v1/repositories").await?;

        Ok(records
            .into_iter()
            .map(|r| ApiRepository {
                external_id: r.id,
                registry: r.registry,
                repository: r.repository,
                modified_at: truncate_to_millis(r.last_update_date),
            })
            .collect())
    }

    async fn list_images(
        &self,
        registry: &str,
        repository: &str,
    ) -> Result<Vec<ApiImage>, CatalogError> {
        let path = format!(
            "/v1/repositories/registry/{}/repository/{}/images",
            registry, repository
        );
        let records: Vec<ImageRecord> = self.fetch_all(&path).await?;

        let mut images = Vec::with_capacity(records.len());
        for r in records {
            if r.image_id.is_empty() {
                warn!(external_id = %r.id, "Skipping catalog image without digest");
                continue;
            }
            images.push(ApiImage {
                external_id: r.id,
                digest: r.image_id,
                modified_at: truncate_to_millis(r.last_update_date),
            });
        }
        Ok(images)
    }

    async fn list_cve_names(
        &self,
        image_external_id: &str,
    ) -> Result<BTreeSet<String>, CatalogError> {
        let path = format!("/v1/images/id/{}/vulnerabilities", image_external_id);
        let records: Vec<VulnerabilityRecord> = self.fetch_all(&path).await?;

        Ok(records
            .into_iter()
            .map(|r| r.cve_id)
            .filter(|name| !name.is_empty())
            .collect())
    }
}
