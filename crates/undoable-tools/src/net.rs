use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use undoable_types::{ActionCategory, ToolOutcome, ToolSchema};

use crate::{truncate_output, Tool};

const FETCH_DEADLINE: Duration = Duration::from_secs(10);

pub struct HttpFetchTool {
    client: reqwest::Client,
}

impl HttpFetchTool {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(FETCH_DEADLINE)
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for HttpFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "http_fetch".to_string(),
            description: "Fetch a URL and return the response body as text".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"url": {"type": "string"}},
                "required": ["url"]
            }),
        }
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Network
    }

    async fn execute(&self, args: Value, cancel: CancellationToken) -> anyhow::Result<ToolOutcome> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required argument `url`"))?;
        let request = self.client.get(url).send();
        let response = tokio::select! {
            _ = cancel.cancelled() => anyhow::bail!("fetch cancelled"),
            resp = request => resp?,
        };
        let status = response.status();
        if !status.is_success() {
            tracing::warn!(url, status = status.as_u16(), "fetch returned non-success status");
        }
        let body = response.text().await?;
        Ok(ToolOutcome {
            output: truncate_output(&body, 20_000),
            metadata: json!({
                "url": url,
                "status": status.as_u16(),
                "truncated": body.len() > 20_000,
            }),
            inverse: None,
        })
    }
}
