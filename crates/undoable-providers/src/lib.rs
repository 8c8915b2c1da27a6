use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{pin::Pin, str};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use undoable_types::ToolSchema;

pub const PROVIDERS_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, args_delta: String },
    ToolCallEnd { id: String },
    Done { finish_reason: String },
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub provider_id: String,
    pub context_window: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub models: Vec<ModelInfo>,
}

/// The "LLM completion stream" capability. Implementations live behind this
/// trait; the execution core only consumes the contract.
#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    pub default_model: String,
    /// Env var holding the bearer key; keys themselves are never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersFile {
    pub version: u32,
    #[serde(default)]
    pub providers: Vec<ProviderRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_model: Option<String>,
}

impl Default for ProvidersFile {
    fn default() -> Self {
        Self {
            version: PROVIDERS_FILE_VERSION,
            providers: Vec::new(),
            active_provider: None,
            active_model: None,
        }
    }
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    records: Arc<RwLock<Vec<ProviderRecord>>>,
    active_provider: Arc<RwLock<Option<String>>>,
    active_model: Arc<RwLock<Option<String>>>,
    path: Arc<RwLock<Option<PathBuf>>>,
}

impl ProviderRegistry {
    pub fn new(config: ProvidersFile) -> Self {
        let providers = build_providers(&config);
        Self {
            providers: Arc::new(RwLock::new(providers)),
            records: Arc::new(RwLock::new(config.providers)),
            active_provider: Arc::new(RwLock::new(config.active_provider)),
            active_model: Arc::new(RwLock::new(config.active_model)),
            path: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let file: ProvidersFile = serde_json::from_str(&raw)?;
                if file.version > PROVIDERS_FILE_VERSION {
                    anyhow::bail!(
                        "{} has version {} but this daemon supports up to {}",
                        path.display(),
                        file.version,
                        PROVIDERS_FILE_VERSION
                    );
                }
                file
            }
            Err(_) => ProvidersFile::default(),
        };
        let registry = Self::new(config);
        *registry.path.write().await = Some(path);
        Ok(registry)
    }

    pub fn with_provider(provider: Arc<dyn Provider>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(vec![provider])),
            records: Arc::new(RwLock::new(Vec::new())),
            active_provider: Arc::new(RwLock::new(None)),
            active_model: Arc::new(RwLock::new(None)),
            path: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn register(&self, provider: Arc<dyn Provider>) {
        self.providers.write().await.push(provider);
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| p.info())
            .collect()
    }

    pub async fn active_model(&self) -> Option<String> {
        self.active_model.read().await.clone()
    }

    pub async fn set_active(
        &self,
        provider_id: Option<String>,
        model_id: Option<String>,
    ) -> anyhow::Result<()> {
        *self.active_provider.write().await = provider_id;
        *self.active_model.write().await = model_id;
        self.persist().await
    }

    pub async fn stream(
        &self,
        provider_hint: Option<&str>,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let provider = self.select_provider(provider_hint).await?;
        let model = self.active_model.read().await.clone();
        provider
            .stream(messages, model.as_deref(), tools, cancel)
            .await
    }

    async fn select_provider(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        }

        let active = self.active_provider.read().await.clone();
        if let Some(active_id) = active {
            if let Some(provider) = providers.iter().find(|p| p.info().id == active_id) {
                return Ok(provider.clone());
            }
        }

        let Some(provider) = providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = self.path.read().await.clone() else {
            return Ok(());
        };
        let file = ProvidersFile {
            version: PROVIDERS_FILE_VERSION,
            providers: self.records.read().await.clone(),
            active_provider: self.active_provider.read().await.clone(),
            active_model: self.active_model.read().await.clone(),
        };
        let raw = serde_json::to_string_pretty(&file)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

fn build_providers(config: &ProvidersFile) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();
    for record in &config.providers {
        providers.push(Arc::new(OpenAiCompatibleProvider {
            id: record.id.clone(),
            name: record.name.clone(),
            base_url: normalize_base(&record.url),
            api_key: record
                .api_key_env
                .as_deref()
                .and_then(|env| std::env::var(env).ok())
                .filter(|v| !v.trim().is_empty()),
            default_model: record.default_model.clone(),
            client: Client::new(),
        }));
    }
    providers
}

fn normalize_base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

struct OpenAiCompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                id: self.default_model.clone(),
                provider_id: self.id.clone(),
                context_window: 128_000,
            }],
        }
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        model_override: Option<&str>,
        tools: Option<Vec<ToolSchema>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());
        let url = format!("{}/chat/completions", self.base_url);
        let wire_messages = messages
            .into_iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect::<Vec<_>>();
        let wire_tools = tools
            .unwrap_or_default()
            .into_iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.input_schema,
                    }
                })
            })
            .collect::<Vec<_>>();

        let mut body = json!({
            "model": model,
            "messages": wire_messages,
            "stream": true,
        });
        if !wire_tools.is_empty() {
            body["tools"] = serde_json::Value::Array(wire_tools);
            body["tool_choice"] = json!("auto");
        }

        let mut req = self.client.post(url).json(&body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done { finish_reason: "cancelled".to_string() };
                    break;
                }
                let chunk = chunk?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        let Some(payload) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        let payload = payload.trim();
                        if payload == "[DONE]" {
                            yield StreamChunk::Done { finish_reason: "stop".to_string() };
                            continue;
                        }
                        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                            continue;
                        };
                        if let Some(detail) = extract_error(&value) {
                            Err(anyhow::anyhow!(detail))?;
                        }
                        let choices = value
                            .get("choices")
                            .and_then(|v| v.as_array())
                            .cloned()
                            .unwrap_or_default();
                        for choice in choices {
                            let delta = choice.get("delta").cloned().unwrap_or_default();
                            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                                if !text.is_empty() {
                                    yield StreamChunk::TextDelta(text.to_string());
                                }
                            }
                            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                                for call in tool_calls {
                                    let id = call
                                        .get("id")
                                        .and_then(|v| v.as_str())
                                        .or_else(|| call.get("index").and_then(|v| v.as_str()))
                                        .map(ToString::to_string)
                                        .unwrap_or_else(|| {
                                            call.get("index")
                                                .and_then(|v| v.as_u64())
                                                .map(|i| i.to_string())
                                                .unwrap_or_default()
                                        });
                                    let function = call.get("function").cloned().unwrap_or_default();
                                    let name = function
                                        .get("name")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or_default()
                                        .to_string();
                                    let args_delta = function
                                        .get("arguments")
                                        .and_then(|v| v.as_str())
                                        .unwrap_or_default()
                                        .to_string();
                                    if !name.is_empty() {
                                        yield StreamChunk::ToolCallStart { id: id.clone(), name };
                                    }
                                    if !args_delta.is_empty() {
                                        yield StreamChunk::ToolCallDelta { id: id.clone(), args_delta };
                                    }
                                    yield StreamChunk::ToolCallEnd { id };
                                }
                            }
                            if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                                if !reason.is_empty() {
                                    yield StreamChunk::Done { finish_reason: reason.to_string() };
                                }
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

fn extract_error(value: &serde_json::Value) -> Option<String> {
    let error = value.get("error")?;
    let message = error
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("provider error");
    Some(message.to_string())
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut out = input
        .char_indices()
        .take_while(|(idx, _)| *idx < max_len)
        .map(|(_, ch)| ch)
        .collect::<String>();
    out.push_str("...");
    out
}

/// Replays pre-recorded turns; used by tests and as the fallback when no
/// provider is configured.
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<Vec<StreamChunk>>>,
}

impl ScriptedProvider {
    pub fn new(turns: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            turns: Mutex::new(turns.into()),
        }
    }

    pub fn text_reply(text: &str) -> Self {
        Self::new(vec![vec![
            StreamChunk::TextDelta(text.to_string()),
            StreamChunk::Done {
                finish_reason: "stop".to_string(),
            },
        ]])
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "scripted".to_string(),
            name: "Scripted".to_string(),
            models: vec![ModelInfo {
                id: "scripted-1".to_string(),
                provider_id: "scripted".to_string(),
                context_window: 32_768,
            }],
        }
    }

    async fn stream(
        &self,
        _messages: Vec<ChatMessage>,
        _model_override: Option<&str>,
        _tools: Option<Vec<ToolSchema>>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let turn = self.turns.lock().await.pop_front().unwrap_or_else(|| {
            vec![StreamChunk::Done {
                finish_reason: "stop".to_string(),
            }]
        });
        Ok(Box::pin(futures::stream::iter(turn.into_iter().map(Ok))))
    }
}
