// ABOUTME: HTTP client for the CRM lead API
// ABOUTME: Issues one paginated or by-id request and classifies the response

use reqwest::Client;
use std::time::Duration;

use super::models::{extract_records, extract_single, Page, SourceRecord};
use super::{classify_status, UpstreamError};

/// Thin fetcher over the CRM REST API. One call, one classified result; the
/// governor owns retries.
pub struct CrmClient {
    client: Client,
    base_url: String,
    token: String,
}

impl CrmClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| UpstreamError::Permanent(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Fetch one page of leads.
    ///
    /// Returns a complete batch or an error, never a partial batch. An empty
    /// record list marks exhaustion.
    pub async fn fetch_page(&self, page: u64, page_size: u32) -> Result<Page, UpstreamError> {
        let url = format!("{}/leads", self.base_url);

        // The upstream accepts the token as either a header or a query
        // parameter; send both, matching what its own SDKs do.
        let response = self
            .client
            .get(&url)
            .header("X-Api-Token", &self.token)
            .query(&[
                ("token", self.token.clone()),
                ("page", page.to_string()),
                ("page_size", page_size.to_string()),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }

        let parsed: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            UpstreamError::Permanent(format!("Unparsable response body for page {}: {}", page, e))
        })?;

        let records = extract_records(parsed).ok_or_else(|| {
            UpstreamError::Permanent(format!(
                "Response for page {} carried no recognisable record list",
                page
            ))
        })?;

        Ok(Page::new(records))
    }

    /// Fetch a single lead by id. `Ok(None)` means the lead no longer exists
    /// upstream; that is not an error.
    pub async fn fetch_by_id(&self, id: i64) -> Result<Option<SourceRecord>, UpstreamError> {
        let url = format!("{}/leads/{}", self.base_url, id);

        let response = self
            .client
            .get(&url)
            .header("X-Api-Token", &self.token)
            .query(&[("token", self.token.as_str())])
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }

        let body = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body));
        }

        let parsed: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            UpstreamError::Permanent(format!("Unparsable response body for lead {}: {}", id, e))
        })?;

        Ok(extract_single(parsed))
    }
}

/// Transport-level faults (DNS, connect, timeout) are always worth a retry.
fn transport_error(e: reqwest::Error) -> UpstreamError {
    UpstreamError::Transient(format!("Request failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = CrmClient::new("https://api.example.com/v1/", "secret");
        assert!(client.is_ok());
        // Trailing slash is normalized away
        assert_eq!(client.unwrap().base_url, "https://api.example.com/v1");
    }
}
