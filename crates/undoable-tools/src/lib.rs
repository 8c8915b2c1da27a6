use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use undoable_types::{ActionCategory, ToolOutcome, ToolSchema};

mod exec;
mod fs_tools;
mod net;

pub use exec::{BashTool, ProcessManager, ProcessTool};
pub use fs_tools::{EditFileTool, GlobTool, GrepTool, ReadFileTool, RemoveFileTool, WriteFileTool};
pub use net::HttpFetchTool;

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;

    fn category(&self) -> ActionCategory;

    fn undoable(&self) -> bool {
        false
    }

    async fn execute(&self, args: Value, cancel: CancellationToken)
        -> anyhow::Result<ToolOutcome>;

    /// Apply a previously captured inverse. On success returns the inverse of
    /// the inverse, so the caller can redo.
    async fn apply_inverse(&self, _inverse: Value) -> anyhow::Result<Option<Value>> {
        anyhow::bail!("tool `{}` does not support undo", self.schema().name)
    }
}

#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn with_builtins() -> Self {
        let process_manager = ProcessManager::new();
        let builtins: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ReadFileTool),
            Arc::new(WriteFileTool),
            Arc::new(EditFileTool),
            Arc::new(RemoveFileTool),
            Arc::new(GlobTool),
            Arc::new(GrepTool),
            Arc::new(BashTool),
            Arc::new(HttpFetchTool::new()),
            Arc::new(ProcessTool::new(process_manager)),
        ];
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        for tool in builtins {
            map.insert(tool.schema().name, tool);
        }
        Self {
            tools: Arc::new(RwLock::new(map)),
        }
    }

    /// Idempotent by name: an already-registered tool keeps its original
    /// executor.
    pub async fn register_tools(&self, tools: Vec<Arc<dyn Tool>>) {
        let mut map = self.tools.write().await;
        for tool in tools {
            map.entry(tool.schema().name).or_insert(tool);
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut schemas = self
            .tools
            .read()
            .await
            .values()
            .map(|t| t.schema())
            .collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn truncate_output(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut out = input
        .char_indices()
        .take_while(|(idx, _)| *idx < max_len)
        .map(|(_, ch)| ch)
        .collect::<String>();
    out.push_str("...<truncated>");
    out
}
