//! HTTP client for the daemon's API surface: every call raises a plain
//! error carrying the daemon's `{message}` body when the response isn't a
//! success status.

use anyhow::{anyhow, Result};
use futures_util::Stream;
use nettrace_common::{
    DaemonInfoResponse, ErrorResponse, IdResponse, ListTracingTasksResponse, TracingTaskOptions, TracingTaskResponse,
};
use reqwest::Client;

pub struct ApiClient {
    http: Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: String) -> Self {
        Self {
            http: Client::builder()
                .user_agent(format!("nettrace-cli/{}", env!("CARGO_PKG_VERSION")))
                .build()
                .expect("reqwest client builds"),
            base_url,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.message)
            .unwrap_or_else(|_| format!("HTTP {status}"));
        Err(anyhow!(message))
    }

    pub async fn daemon_info(&self) -> Result<DaemonInfoResponse> {
        let response = Self::check(self.http.get(self.url("/")).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn list_tasks(&self) -> Result<ListTracingTasksResponse> {
        let response = Self::check(self.http.get(self.url("/tracing_tasks")).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn get_task(&self, id: &str) -> Result<TracingTaskResponse> {
        let response = Self::check(self.http.get(self.url(&format!("/tracing_tasks/{id}"))).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn create_task(&self, options: &TracingTaskOptions) -> Result<IdResponse> {
        let response = Self::check(self.http.post(self.url("/tracing_tasks")).json(options).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn remove_task(&self, id: &str) -> Result<()> {
        Self::check(self.http.delete(self.url(&format!("/tracing_tasks/{id}"))).send().await?).await?;
        Ok(())
    }

    /// A stream of raw `bytes::Bytes` chunks from the json-lines response
    /// body; callers split on `\n` themselves since chunk boundaries don't
    /// align with lines.
    pub async fn stream_events(&self, id: &str) -> Result<impl Stream<Item = reqwest::Result<bytes::Bytes>>> {
        let response = Self::check(self.http.get(self.url(&format!("/tracing_tasks/{id}/events"))).send().await?).await?;
        Ok(response.bytes_stream())
    }
}
