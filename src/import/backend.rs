//! Report repository collaborators: batch fetch and bulk parsing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};
use crate::types::{Credentials, ParsedReport};

/// Source of report documents for one center
#[async_trait]
pub trait ReportBackend: Send + Sync {
    /// Fetch every report in `ids` with a single call, returning the raw bulk payload
    async fn fetch_batch(
        &self,
        center: &str,
        credentials: &Credentials,
        ids: &[String],
    ) -> Result<Vec<u8>>;
}

/// Splits a bulk payload into individual documents
///
/// Malformed entries are skipped; they never fail the whole payload.
pub trait BulkParser: Send + Sync {
    /// Parse `payload` into reports
    fn parse_bulk(&self, payload: &[u8]) -> Vec<ParsedReport>;
}

#[derive(Serialize)]
struct BulkRequest<'a> {
    ids: &'a [String],
}

/// [`ReportBackend`] that POSTs the id list to `{base}/centers/{center}/reports/bulk`
///
/// The request body is `{"ids": [...]}` and the credentials are sent as HTTP
/// basic auth. The response body is returned unparsed.
#[derive(Clone, Debug)]
pub struct HttpReportBackend {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpReportBackend {
    /// Create a backend rooted at `base_url` with a whole-request `timeout`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for a URL that cannot carry a path and
    /// [`Error::Network`] if the HTTP client cannot be built.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self> {
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidArgument(format!(
                "backend URL {base_url} cannot carry a path"
            )));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    fn bulk_url(&self, center: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| {
                Error::InvalidArgument(format!("backend URL {} cannot carry a path", self.base_url))
            })?
            .pop_if_empty()
            .extend(["centers", center, "reports", "bulk"]);
        Ok(url)
    }
}

#[async_trait]
impl ReportBackend for HttpReportBackend {
    async fn fetch_batch(
        &self,
        center: &str,
        credentials: &Credentials,
        ids: &[String],
    ) -> Result<Vec<u8>> {
        let url = self.bulk_url(center)?;
        tracing::debug!(url = %url, center = %center, ids = ids.len(), "fetching report batch");

        let response = self
            .client
            .post(url.clone())
            .basic_auth(&credentials.username, Some(&credentials.password))
            .json(&BulkRequest { ids })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Backend {
                message: format!("bulk fetch for center {center} returned {status}"),
                status: Some(status.as_u16()),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReport {
    global_id: String,
    ontology_id: String,
    #[serde(default)]
    extension: Option<String>,
    content: String,
}

/// [`BulkParser`] for a JSON array of
/// `{"globalId", "ontologyId", "extension"?, "content"}` objects
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBulkParser;

impl BulkParser for JsonBulkParser {
    fn parse_bulk(&self, payload: &[u8]) -> Vec<ParsedReport> {
        let entries: Vec<serde_json::Value> = match serde_json::from_slice(payload) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    bytes = payload.len(),
                    "bulk payload is not a JSON array"
                );
                return Vec::new();
            }
        };

        entries
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| match serde_json::from_value::<WireReport>(entry) {
                Ok(report) => Some(ParsedReport {
                    global_id: report.global_id,
                    ontology_id: report.ontology_id,
                    extension: report.extension,
                    bytes: report.content.into_bytes(),
                }),
                Err(e) => {
                    tracing::warn!(index, error = %e, "skipping malformed bulk entry");
                    None
                }
            })
            .collect()
    }
}
