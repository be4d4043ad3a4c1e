use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadUrl {
    pub request_id: String,
    pub upload_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UploadStatus {
    pub request_status: String,
    #[serde(default)]
    pub percent_complete: Option<i32>,
    #[serde(default)]
    pub result_file_url: Option<String>,
}

/// Bulk service calls, one method per endpoint.
#[async_trait]
pub trait MicrosoftTransport: Send + Sync {
    async fn get_bulk_upload_url(&self, account_id: &str) -> Result<UploadUrl>;

    async fn upload_file(&self, upload_url: &str, account_id: &str, body: Vec<u8>) -> Result<()>;

    async fn get_bulk_upload_status(&self, account_id: &str, request_id: &str)
        -> Result<UploadStatus>;

    async fn download_result_file(&self, url: &str) -> Result<String>;
}

#[derive(Clone)]
pub struct HttpMicrosoftTransport {
    http: Client,
    base_url: Url,
    developer_token: String,
    access_token: String,
    customer_id: String,
}

impl fmt::Debug for HttpMicrosoftTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMicrosoftTransport")
            .field("base_url", &self.base_url)
            .field("customer_id", &self.customer_id)
            .finish_non_exhaustive()
    }
}

impl HttpMicrosoftTransport {
    pub fn new(
        base_url: &str,
        developer_token: String,
        access_token: String,
        customer_id: String,
    ) -> Result<Self> {
        // Url::join drops the last segment without a trailing slash.
        let base = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&base).context("invalid microsoft base URL")?;
        let http = Client::builder()
            .user_agent("adsync/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            developer_token,
            access_token,
            customer_id,
        })
    }

    fn authorized(&self, req: reqwest::RequestBuilder, account_id: &str) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Bearer {}", self.access_token))
            .header("DeveloperToken", &self.developer_token)
            .header("CustomerId", &self.customer_id)
            .header("CustomerAccountId", account_id)
    }

    pub fn build_query(&self, path: &str, account_id: &str, body: &Value) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .context("invalid microsoft endpoint")?;
        self.authorized(self.http.post(endpoint), account_id)
            .header("Content-Type", "application/json")
            .json(body)
            .build()
            .context("failed to build bulk request")
    }

    async fn execute_json<T: serde::de::DeserializeOwned>(&self, request: reqwest::Request) -> Result<T> {
        let url = request.url().clone();
        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("request to {} failed", url.path()))?;
        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from bulk service: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("bulk service error {}: {}", status, body));
        }
        res.json()
            .await
            .with_context(|| format!("failed to parse response of {}", url.path()))
    }
}

#[async_trait]
impl MicrosoftTransport for HttpMicrosoftTransport {
    async fn get_bulk_upload_url(&self, account_id: &str) -> Result<UploadUrl> {
        let body = json!({ "AccountId": account_id, "ResponseMode": "ErrorsAndResults" });
        let request = self.build_query("BulkUploadUrl/Query", account_id, &body)?;
        self.execute_json(request).await
    }

    async fn upload_file(&self, upload_url: &str, account_id: &str, body: Vec<u8>) -> Result<()> {
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(body)
                .file_name("upload.csv")
                .mime_str("text/csv")?,
        );
        let res = self
            .authorized(self.http.post(upload_url), account_id)
            .multipart(form)
            .send()
            .await
            .context("failed to send bulk file")?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("bulk file upload failed {}: {}", status, body));
        }
        Ok(())
    }

    async fn get_bulk_upload_status(
        &self,
        account_id: &str,
        request_id: &str,
    ) -> Result<UploadStatus> {
        let body = json!({ "RequestId": request_id });
        let request = self.build_query("BulkUploadStatus/Query", account_id, &body)?;
        self.execute_json(request).await
    }

    async fn download_result_file(&self, url: &str) -> Result<String> {
        let res = self
            .http
            .get(url)
            .send()
            .await
            .context("failed to download result file")?;
        if !res.status().is_success() {
            let status = res.status();
            return Err(anyhow!("result file download failed {}", status));
        }
        res.text().await.context("failed to read result file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_requests_carry_account_headers() {
        let transport = HttpMicrosoftTransport::new(
            "https://bulk.example.com/Bulk/v13",
            "dev".into(),
            "token".into(),
            "cust-1".into(),
        )
        .unwrap();
        let request = transport
            .build_query("BulkUploadStatus/Query", "acct-9", &json!({ "RequestId": "r1" }))
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().path(), "/Bulk/v13/BulkUploadStatus/Query");
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|h| h.to_str().ok())
                .unwrap()
                .to_string()
        };
        assert_eq!(header("Authorization"), "Bearer token");
        assert_eq!(header("DeveloperToken"), "dev");
        assert_eq!(header("CustomerId"), "cust-1");
        assert_eq!(header("CustomerAccountId"), "acct-9");
    }

    #[test]
    fn status_response_parses() {
        let status: UploadStatus = serde_json::from_str(
            r#"{"RequestStatus":"Completed","PercentComplete":100,"ResultFileUrl":"https://x/y.csv"}"#,
        )
        .unwrap();
        assert_eq!(status.request_status, "Completed");
        assert_eq!(status.result_file_url.as_deref(), Some("https://x/y.csv"));
    }
}
