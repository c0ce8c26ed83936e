//! HTTP client for a running host's admin API.

use anyhow::{Context, Result, bail};
use serde_json::Value;

pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn local(port: u16) -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            http: reqwest::Client::new(),
        }
    }

    pub async fn get(&self, path: &str) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;
        Self::decode(response).await
    }

    pub async fn post(&self, path: &str, body: Option<Value>, token: Option<&str>) -> Result<Value> {
        let mut request = self.http.post(format!("{}{path}", self.base_url));
        if let Some(body) = body {
            request = request.json(&body);
        }
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> Result<Value> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            bail!("{status}: {message}");
        }
        Ok(body)
    }
}
