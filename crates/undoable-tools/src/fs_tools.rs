use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::Regex;
use serde_json::{json, Value};
use tokio::fs;
use tokio_util::sync::CancellationToken;

use undoable_types::{ActionCategory, ToolOutcome, ToolSchema};

use crate::{truncate_output, Tool};

const MAX_MATCHES: usize = 100;

fn arg_str<'a>(args: &'a Value, key: &str) -> anyhow::Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing required argument `{key}`"))
}

/// Inverse payload shared by the mutating file tools: the path plus the
/// contents it held before the call (`null` when the file did not exist).
fn file_inverse(path: &str, prior: Option<String>) -> Value {
    json!({"path": path, "prior": prior})
}

async fn restore_file_inverse(inverse: Value) -> anyhow::Result<Option<Value>> {
    let path = inverse
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("inverse payload missing `path`"))?;
    let prior = inverse
        .get("prior")
        .and_then(|v| v.as_str())
        .map(ToString::to_string);
    let current = fs::read_to_string(path).await.ok();
    match prior {
        Some(contents) => fs::write(path, contents).await?,
        None => {
            if fs::try_exists(path).await.unwrap_or(false) {
                fs::remove_file(path).await?;
            }
        }
    }
    Ok(Some(file_inverse(path, current)))
}

pub struct ReadFileTool;

#[async_trait]
impl Tool for ReadFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "read_file".to_string(),
            description: "Read file contents".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        }
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Read
    }

    async fn execute(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutcome> {
        let path = arg_str(&args, "path")?;
        let data = fs::read_to_string(path).await?;
        Ok(ToolOutcome {
            output: data,
            metadata: json!({"path": path}),
            inverse: None,
        })
    }
}

pub struct WriteFileTool;

#[async_trait]
impl Tool for WriteFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "write_file".to_string(),
            description: "Write file contents, creating the file if needed".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        }
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Mutate
    }

    fn undoable(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutcome> {
        let path = arg_str(&args, "path")?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let prior = fs::read_to_string(path).await.ok();
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        fs::write(path, content).await?;
        Ok(ToolOutcome {
            output: format!("wrote {} bytes to {path}", content.len()),
            metadata: json!({"path": path, "bytes": content.len()}),
            inverse: Some(file_inverse(path, prior)),
        })
    }

    async fn apply_inverse(&self, inverse: Value) -> anyhow::Result<Option<Value>> {
        restore_file_inverse(inverse).await
    }
}

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "edit_file".to_string(),
            description: "String replacement edit".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "old": {"type": "string"},
                    "new": {"type": "string"}
                },
                "required": ["path", "old", "new"]
            }),
        }
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Mutate
    }

    fn undoable(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutcome> {
        let path = arg_str(&args, "path")?;
        let old = arg_str(&args, "old")?;
        let new = args.get("new").and_then(|v| v.as_str()).unwrap_or_default();
        let content = fs::read_to_string(path).await?;
        if !content.contains(old) {
            anyhow::bail!("`old` text not found in {path}");
        }
        let updated = content.replace(old, new);
        fs::write(path, &updated).await?;
        Ok(ToolOutcome {
            output: format!("edited {path}"),
            metadata: json!({"path": path}),
            inverse: Some(file_inverse(path, Some(content))),
        })
    }

    async fn apply_inverse(&self, inverse: Value) -> anyhow::Result<Option<Value>> {
        restore_file_inverse(inverse).await
    }
}

pub struct RemoveFileTool;

#[async_trait]
impl Tool for RemoveFileTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "remove_file".to_string(),
            description: "Remove a file".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"]
            }),
        }
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Mutate
    }

    fn undoable(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutcome> {
        let path = arg_str(&args, "path")?;
        let prior = fs::read_to_string(path).await?;
        fs::remove_file(path).await?;
        Ok(ToolOutcome {
            output: format!("removed {path}"),
            metadata: json!({"path": path}),
            inverse: Some(file_inverse(path, Some(prior))),
        })
    }

    async fn apply_inverse(&self, inverse: Value) -> anyhow::Result<Option<Value>> {
        restore_file_inverse(inverse).await
    }
}

pub struct GlobTool;

#[async_trait]
impl Tool for GlobTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "glob".to_string(),
            description: "Find files by glob".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"pattern": {"type": "string"}},
                "required": ["pattern"]
            }),
        }
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Read
    }

    async fn execute(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutcome> {
        let pattern = args
            .get("pattern")
            .and_then(|v| v.as_str())
            .unwrap_or("*");
        let mut files = Vec::new();
        for path in (glob::glob(pattern)?).flatten() {
            files.push(path.display().to_string());
            if files.len() >= MAX_MATCHES {
                break;
            }
        }
        Ok(ToolOutcome {
            output: files.join("\n"),
            metadata: json!({"count": files.len()}),
            inverse: None,
        })
    }
}

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "grep".to_string(),
            description: "Regex search in files".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "pattern": {"type": "string"},
                    "path": {"type": "string"}
                },
                "required": ["pattern"]
            }),
        }
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Read
    }

    async fn execute(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutcome> {
        let pattern = arg_str(&args, "pattern")?;
        let root = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let regex = Regex::new(pattern)?;
        let mut out = Vec::new();
        for entry in WalkBuilder::new(root).build().flatten() {
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            if let Ok(content) = fs::read_to_string(path).await {
                for (idx, line) in content.lines().enumerate() {
                    if regex.is_match(line) {
                        out.push(format!("{}:{}:{}", path.display(), idx + 1, line));
                        if out.len() >= MAX_MATCHES {
                            break;
                        }
                    }
                }
            }
            if out.len() >= MAX_MATCHES {
                break;
            }
        }
        Ok(ToolOutcome {
            output: truncate_output(&out.join("\n"), 20_000),
            metadata: json!({"count": out.len()}),
            inverse: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_undo_restores_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.txt");
        let path_str = path.display().to_string();

        let tool = WriteFileTool;
        let outcome = tool
            .execute(
                json!({"path": path_str, "content": "hi"}),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hi");

        let redo = tool
            .apply_inverse(outcome.inverse.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(!path.exists());

        // The returned inverse re-applies the write.
        tool.apply_inverse(redo).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hi");
    }

    #[tokio::test]
    async fn write_inverse_restores_prior_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("y.txt");
        std::fs::write(&path, "before").unwrap();
        let path_str = path.display().to_string();

        let tool = WriteFileTool;
        let outcome = tool
            .execute(
                json!({"path": path_str, "content": "after"}),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        tool.apply_inverse(outcome.inverse.unwrap()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "before");
    }

    #[tokio::test]
    async fn edit_requires_old_text_to_exist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("z.txt");
        std::fs::write(&path, "alpha").unwrap();
        let err = EditFileTool
            .execute(
                json!({"path": path.display().to_string(), "old": "beta", "new": "gamma"}),
                CancellationToken::new(),
            )
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn remove_then_undo_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.txt");
        std::fs::write(&path, "keep me").unwrap();

        let tool = RemoveFileTool;
        let outcome = tool
            .execute(
                json!({"path": path.display().to_string()}),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!path.exists());
        tool.apply_inverse(outcome.inverse.unwrap()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep me");
    }
}
