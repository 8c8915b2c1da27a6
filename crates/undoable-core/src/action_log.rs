use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use undoable_tools::ToolRegistry;
use undoable_types::{ActionCategory, ActionRecord, ApprovalState, UndoStepResult};

#[derive(Debug, Clone)]
struct RedoEntry {
    action_id: String,
    /// Inverse-of-the-inverse captured when the action was undone.
    inverse: Value,
}

#[derive(Default)]
struct LogInner {
    entries: Vec<ActionRecord>,
    index: HashMap<String, usize>,
    redo: Vec<RedoEntry>,
}

/// Append-only record of every side-effecting call. Entries gain a final
/// duration/error/inverse when the call settles, and an `undone` flag when
/// reversed; `id`, `args` and `category` never change.
#[derive(Clone, Default)]
pub struct ActionLog {
    inner: Arc<RwLock<LogInner>>,
}

impl ActionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn begin(
        &self,
        run_id: Option<String>,
        tool_name: &str,
        category: ActionCategory,
        args: Value,
        undoable: bool,
        approval: ApprovalState,
    ) -> String {
        let record = ActionRecord {
            id: Uuid::new_v4().to_string(),
            run_id,
            tool_name: tool_name.to_string(),
            category,
            args,
            undoable,
            approval,
            inverse: None,
            started_at: Utc::now(),
            duration_ms: 0,
            error: None,
            undone: false,
        };
        let id = record.id.clone();
        let mut inner = self.inner.write().await;
        let index = inner.entries.len();
        inner.index.insert(id.clone(), index);
        inner.entries.push(record);
        id
    }

    pub async fn finalize(
        &self,
        id: &str,
        duration_ms: u64,
        error: Option<String>,
        inverse: Option<Value>,
    ) {
        let mut inner = self.inner.write().await;
        let Some(&slot) = inner.index.get(id) else {
            return;
        };
        let entry = &mut inner.entries[slot];
        entry.duration_ms = duration_ms;
        entry.error = error;
        entry.inverse = inverse;
    }

    pub async fn get(&self, id: &str) -> Option<ActionRecord> {
        let inner = self.inner.read().await;
        inner.index.get(id).map(|&slot| inner.entries[slot].clone())
    }

    pub async fn list(&self) -> Vec<ActionRecord> {
        self.inner.read().await.entries.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    /// Still-reversible entries, most recent first.
    pub async fn list_undoable(&self) -> Vec<ActionRecord> {
        self.inner
            .read()
            .await
            .entries
            .iter()
            .rev()
            .filter(|entry| {
                entry.undoable && !entry.undone && entry.error.is_none() && entry.inverse.is_some()
            })
            .cloned()
            .collect()
    }

    /// Entries that were undone and not re-undone, most recent first.
    pub async fn list_redoable(&self) -> Vec<ActionRecord> {
        let inner = self.inner.read().await;
        inner
            .redo
            .iter()
            .rev()
            .filter_map(|redo| {
                inner
                    .index
                    .get(&redo.action_id)
                    .map(|&slot| inner.entries[slot].clone())
            })
            .collect()
    }

    pub async fn list_non_undoable_recent(&self, limit: usize) -> Vec<ActionRecord> {
        self.inner
            .read()
            .await
            .entries
            .iter()
            .rev()
            .filter(|entry| !entry.undoable && entry.category.is_side_effecting())
            .take(limit)
            .cloned()
            .collect()
    }
}

/// Applies inverses through the owning tools and keeps the undo/redo stacks
/// consistent with the log.
#[derive(Clone)]
pub struct UndoService {
    log: ActionLog,
    tools: ToolRegistry,
}

impl UndoService {
    pub fn new(log: ActionLog, tools: ToolRegistry) -> Self {
        Self { log, tools }
    }

    pub fn log(&self) -> &ActionLog {
        &self.log
    }

    pub async fn undo_action(&self, id: &str) -> UndoStepResult {
        let Some(record) = self.log.get(id).await else {
            return UndoStepResult::failed(id, "", "unknown action id");
        };
        if !record.undoable {
            return UndoStepResult::failed(id, &record.tool_name, "action is not undoable");
        }
        if record.undone {
            return UndoStepResult::failed(id, &record.tool_name, "action is already undone");
        }
        let Some(inverse) = record.inverse.clone() else {
            return UndoStepResult::failed(id, &record.tool_name, "action recorded no inverse");
        };
        let Some(tool) = self.tools.get(&record.tool_name).await else {
            return UndoStepResult::failed(
                id,
                &record.tool_name,
                "owning tool is no longer registered",
            );
        };
        match tool.apply_inverse(inverse).await {
            Ok(redo_inverse) => {
                let mut inner = self.log.inner.write().await;
                if let Some(&slot) = inner.index.get(id) {
                    inner.entries[slot].undone = true;
                }
                if let Some(inverse) = redo_inverse {
                    inner.redo.push(RedoEntry {
                        action_id: id.to_string(),
                        inverse,
                    });
                }
                UndoStepResult::ok(id, &record.tool_name)
            }
            Err(err) => UndoStepResult::failed(id, &record.tool_name, err.to_string()),
        }
    }

    /// Walks the undo list newest-first and stops at the first failure.
    pub async fn undo_last_n(&self, count: usize) -> Vec<UndoStepResult> {
        let targets = self
            .log
            .list_undoable()
            .await
            .into_iter()
            .take(count)
            .collect::<Vec<_>>();
        let mut results = Vec::new();
        for record in targets {
            let result = self.undo_action(&record.id).await;
            let failed = !result.ok;
            results.push(result);
            if failed {
                break;
            }
        }
        results
    }

    pub async fn undo_all(&self) -> Vec<UndoStepResult> {
        let total = self.log.list_undoable().await.len();
        self.undo_last_n(total).await
    }

    pub async fn redo_last(&self) -> Option<UndoStepResult> {
        let redo = {
            let mut inner = self.log.inner.write().await;
            inner.redo.pop()?
        };
        let Some(record) = self.log.get(&redo.action_id).await else {
            return Some(UndoStepResult::failed(
                &redo.action_id,
                "",
                "unknown action id",
            ));
        };
        let Some(tool) = self.tools.get(&record.tool_name).await else {
            return Some(UndoStepResult::failed(
                &redo.action_id,
                &record.tool_name,
                "owning tool is no longer registered",
            ));
        };
        match tool.apply_inverse(redo.inverse.clone()).await {
            Ok(new_inverse) => {
                let mut inner = self.log.inner.write().await;
                if let Some(&slot) = inner.index.get(&redo.action_id) {
                    inner.entries[slot].undone = false;
                    inner.entries[slot].inverse = new_inverse;
                }
                Some(UndoStepResult::ok(&redo.action_id, &record.tool_name))
            }
            Err(err) => {
                // Put the entry back so the caller may retry.
                self.log.inner.write().await.redo.push(redo.clone());
                Some(UndoStepResult::failed(
                    &redo.action_id,
                    &record.tool_name,
                    err.to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn write_action(
        log: &ActionLog,
        tools: &ToolRegistry,
        path: &std::path::Path,
        content: &str,
    ) -> String {
        let tool = tools.get("write_file").await.unwrap();
        let args = json!({"path": path.display().to_string(), "content": content});
        let outcome = tool
            .execute(args.clone(), tokio_util::sync::CancellationToken::new())
            .await
            .unwrap();
        let id = log
            .begin(
                None,
                "write_file",
                ActionCategory::Mutate,
                args,
                true,
                ApprovalState::Auto,
            )
            .await;
        log.finalize(&id, 1, None, outcome.inverse).await;
        id
    }

    #[tokio::test]
    async fn undo_restores_and_moves_entry_to_redo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        let tools = ToolRegistry::with_builtins();
        let log = ActionLog::new();
        let undo = UndoService::new(log.clone(), tools.clone());

        let id = write_action(&log, &tools, &path, "hi").await;
        assert_eq!(log.list_undoable().await.len(), 1);

        let result = undo.undo_action(&id).await;
        assert!(result.ok, "{:?}", result.error);
        assert!(!path.exists());
        assert!(log.list_undoable().await.is_empty());
        assert_eq!(log.list_redoable().await.len(), 1);
    }

    #[tokio::test]
    async fn double_undo_is_a_structured_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.txt");
        let tools = ToolRegistry::with_builtins();
        let log = ActionLog::new();
        let undo = UndoService::new(log.clone(), tools.clone());

        let id = write_action(&log, &tools, &path, "hi").await;
        assert!(undo.undo_action(&id).await.ok);
        let second = undo.undo_action(&id).await;
        assert!(!second.ok);
        assert!(second.error.unwrap().contains("already undone"));
        // The inverse did not run twice: redo still restores the file once.
        assert_eq!(log.list_redoable().await.len(), 1);
    }

    #[tokio::test]
    async fn redo_reapplies_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.txt");
        let tools = ToolRegistry::with_builtins();
        let log = ActionLog::new();
        let undo = UndoService::new(log.clone(), tools.clone());

        let id = write_action(&log, &tools, &path, "hello").await;
        undo.undo_action(&id).await;
        assert!(!path.exists());

        let redo = undo.redo_last().await.unwrap();
        assert!(redo.ok);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");
        assert_eq!(log.list_undoable().await.len(), 1);
        assert!(log.list_redoable().await.is_empty());
    }

    #[tokio::test]
    async fn log_length_never_decreases_and_identity_fields_hold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.txt");
        let tools = ToolRegistry::with_builtins();
        let log = ActionLog::new();
        let undo = UndoService::new(log.clone(), tools.clone());

        let mut lengths = Vec::new();
        for round in 0..3 {
            let id = write_action(&log, &tools, &path, &format!("round {round}")).await;
            lengths.push(log.len().await);
            let before = log.get(&id).await.unwrap();
            undo.undo_action(&id).await;
            lengths.push(log.len().await);
            let after = log.get(&id).await.unwrap();
            assert_eq!(before.id, after.id);
            assert_eq!(before.args, after.args);
            assert_eq!(before.category, after.category);
        }
        assert!(lengths.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn non_undoable_entries_are_listed_separately() {
        let log = ActionLog::new();
        let id = log
            .begin(
                None,
                "bash",
                ActionCategory::Exec,
                json!({"command": "true"}),
                false,
                ApprovalState::Granted,
            )
            .await;
        log.finalize(&id, 3, None, None).await;
        assert!(log.list_undoable().await.is_empty());
        assert_eq!(log.list_non_undoable_recent(10).await.len(), 1);
    }
}
