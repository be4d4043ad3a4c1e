use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RpcStatus {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Long-running operation returned by `batchJobs:run`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LongRunningOperation {
    pub name: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcStatus>,
}

impl LongRunningOperation {
    /// `metadata.status` (`PENDING`, `RUNNING`, `DONE`), when present.
    pub fn status(&self) -> Option<&str> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("status"))
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultsPage {
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Batch job and mutate endpoints.
#[async_trait]
pub trait GoogleTransport: Send + Sync {
    /// Returns the batch job resource name.
    async fn create_batch_job(&self, customer_id: &str) -> Result<String>;

    async fn add_operations(&self, batch_job: &str, operations: &[Value]) -> Result<()>;

    /// Returns the long-running operation name.
    async fn run_batch_job(&self, batch_job: &str) -> Result<String>;

    async fn get_operation(&self, name: &str) -> Result<LongRunningOperation>;

    async fn list_results(&self, batch_job: &str, page_token: Option<&str>)
        -> Result<ResultsPage>;

    /// Synchronous partial-failure mutate; returns the raw response body.
    async fn mutate(&self, customer_id: &str, operations: &[Value]) -> Result<Value>;
}

#[derive(Clone)]
pub struct HttpGoogleTransport {
    http: Client,
    base_url: Url,
    api_version: String,
    developer_token: String,
    access_token: String,
    login_customer_id: Option<String>,
}

impl fmt::Debug for HttpGoogleTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpGoogleTransport")
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .finish_non_exhaustive()
    }
}

impl HttpGoogleTransport {
    pub fn new(
        base_url: &str,
        api_version: String,
        developer_token: String,
        access_token: String,
        login_customer_id: Option<String>,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url).context("invalid google base URL")?;
        let http = Client::builder()
            .user_agent("adsync/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            api_version,
            developer_token,
            access_token,
            login_customer_id,
        })
    }

    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(&format!("{}/{}", self.api_version, path))
            .context("invalid google endpoint")?;
        let mut req = self
            .http
            .request(method, endpoint)
            .header("Authorization", format!("Bearer {}", self.access_token))
            .header("developer-token", &self.developer_token);
        if let Some(login) = &self.login_customer_id {
            req = req.header("login-customer-id", login);
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        req.build().context("failed to build google request")
    }

    async fn execute(&self, request: reqwest::Request) -> Result<Value> {
        let path = request.url().path().to_string();
        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("request to {path} failed"))?;
        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from google ads: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("google ads error {}: {}", status, body));
        }
        res.json()
            .await
            .with_context(|| format!("failed to parse response of {path}"))
    }
}

#[async_trait]
impl GoogleTransport for HttpGoogleTransport {
    async fn create_batch_job(&self, customer_id: &str) -> Result<String> {
        let body = json!({ "operation": { "create": {} } });
        let request = self.build_request(
            Method::POST,
            &format!("customers/{customer_id}/batchJobs:mutate"),
            Some(&body),
        )?;
        let res = self.execute(request).await?;
        res.pointer("/result/resourceName")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("batch job creation returned no resource name"))
    }

    async fn add_operations(&self, batch_job: &str, operations: &[Value]) -> Result<()> {
        let body = json!({ "mutateOperations": operations });
        let request = self.build_request(
            Method::POST,
            &format!("{batch_job}:addOperations"),
            Some(&body),
        )?;
        self.execute(request).await?;
        Ok(())
    }

    async fn run_batch_job(&self, batch_job: &str) -> Result<String> {
        let request = self.build_request(Method::POST, &format!("{batch_job}:run"), Some(&json!({})))?;
        let op: LongRunningOperation = serde_json::from_value(self.execute(request).await?)
            .context("unexpected batch job run response")?;
        Ok(op.name)
    }

    async fn get_operation(&self, name: &str) -> Result<LongRunningOperation> {
        let request = self.build_request(Method::GET, name, None)?;
        serde_json::from_value(self.execute(request).await?)
            .context("unexpected long-running operation response")
    }

    async fn list_results(
        &self,
        batch_job: &str,
        page_token: Option<&str>,
    ) -> Result<ResultsPage> {
        let mut path = format!("{batch_job}:listResults?pageSize=1000");
        if let Some(token) = page_token {
            path.push_str("&pageToken=");
            path.push_str(token);
        }
        let request = self.build_request(Method::GET, &path, None)?;
        serde_json::from_value(self.execute(request).await?)
            .context("unexpected batch job results response")
    }

    async fn mutate(&self, customer_id: &str, operations: &[Value]) -> Result<Value> {
        let body = json!({ "mutateOperations": operations, "partialFailure": true });
        let request = self.build_request(
            Method::POST,
            &format!("customers/{customer_id}/googleAds:mutate"),
            Some(&body),
        )?;
        self.execute(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_are_versioned_and_authorized() {
        let transport = HttpGoogleTransport::new(
            "https://googleads.example.com",
            "v17".into(),
            "dev".into(),
            "token".into(),
            Some("999".into()),
        )
        .unwrap();
        let request = transport
            .build_request(
                Method::POST,
                "customers/123/batchJobs:mutate",
                Some(&json!({})),
            )
            .unwrap();
        assert_eq!(request.url().path(), "/v17/customers/123/batchJobs:mutate");
        let headers = request.headers();
        assert_eq!(
            headers.get("developer-token").and_then(|h| h.to_str().ok()),
            Some("dev")
        );
        assert_eq!(
            headers.get("login-customer-id").and_then(|h| h.to_str().ok()),
            Some("999")
        );
        assert_eq!(
            headers.get("Authorization").and_then(|h| h.to_str().ok()),
            Some("Bearer token")
        );
    }

    #[test]
    fn operation_status_reads_metadata() {
        let op: LongRunningOperation = serde_json::from_str(
            r#"{"name":"customers/1/operations/2","metadata":{"status":"RUNNING"}}"#,
        )
        .unwrap();
        assert!(!op.done);
        assert_eq!(op.status(), Some("RUNNING"));
    }
}
