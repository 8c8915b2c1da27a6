use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use undoable_types::{ActionCategory, ToolOutcome, ToolSchema};

use crate::{truncate_output, Tool};

pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "bash".to_string(),
            description: "Run a shell command and wait for it to finish".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "cwd": {"type": "string"}
                },
                "required": ["command"]
            }),
        }
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Exec
    }

    async fn execute(&self, args: Value, cancel: CancellationToken) -> anyhow::Result<ToolOutcome> {
        let cmd = args
            .get("command")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required argument `command`"))?;
        let mut command = Command::new("sh");
        command.args(["-c", cmd]);
        if let Some(cwd) = args.get("cwd").and_then(|v| v.as_str()) {
            command.current_dir(cwd);
        }
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = command.spawn()?;
        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Ok(ToolOutcome {
                    output: "command cancelled".to_string(),
                    metadata: json!({"cancelled": true}),
                    inverse: None,
                });
            }
            result = child.wait() => result?,
        };
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut pipe) = stdout_pipe.take() {
            pipe.read_to_end(&mut stdout).await?;
        }
        if let Some(mut pipe) = stderr_pipe.take() {
            pipe.read_to_end(&mut stderr).await?;
        }
        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();
        Ok(ToolOutcome {
            output: truncate_output(&stdout, 20_000),
            metadata: json!({
                "exitCode": status.code(),
                "stderr": truncate_output(&stderr, 4_000),
            }),
            inverse: None,
        })
    }
}

struct ManagedProcess {
    command: String,
    output: Arc<Mutex<String>>,
    exit_code: Arc<Mutex<Option<i32>>>,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct ProcessManager {
    processes: Arc<RwLock<HashMap<String, Arc<ManagedProcess>>>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn start(&self, command: &str, cwd: Option<&str>) -> anyhow::Result<String> {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;

        let id = Uuid::new_v4().to_string();
        let output = Arc::new(Mutex::new(String::new()));
        let exit_code = Arc::new(Mutex::new(None));
        let cancel = CancellationToken::new();

        let managed = Arc::new(ManagedProcess {
            command: command.to_string(),
            output: output.clone(),
            exit_code: exit_code.clone(),
            cancel: cancel.clone(),
        });
        self.processes.write().await.insert(id.clone(), managed);

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let read_buffer = output.clone();
        let reader = tokio::spawn(async move {
            let mut out_bytes = Vec::new();
            let mut err_bytes = Vec::new();
            tokio::join!(
                async {
                    if let Some(mut out) = stdout {
                        let _ = out.read_to_end(&mut out_bytes).await;
                    }
                },
                async {
                    if let Some(mut err) = stderr {
                        let _ = err.read_to_end(&mut err_bytes).await;
                    }
                },
            );
            let mut buffer = read_buffer.lock().await;
            buffer.push_str(&String::from_utf8_lossy(&out_bytes));
            buffer.push_str(&String::from_utf8_lossy(&err_bytes));
        });
        tokio::spawn(async move {
            let code = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    Some(-1)
                }
                status = child.wait() => status.ok().and_then(|s| s.code()).or(Some(-1)),
            };
            let _ = reader.await;
            *exit_code.lock().await = code;
        });

        Ok(id)
    }

    pub async fn poll(&self, id: &str) -> anyhow::Result<Value> {
        let managed = self
            .processes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown process `{id}`"))?;
        let exit_code = *managed.exit_code.lock().await;
        let output = managed.output.lock().await.clone();
        Ok(json!({
            "id": id,
            "command": managed.command,
            "running": exit_code.is_none(),
            "exitCode": exit_code,
            "output": truncate_output(&output, 20_000),
        }))
    }

    pub async fn kill(&self, id: &str) -> anyhow::Result<()> {
        let managed = self
            .processes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown process `{id}`"))?;
        managed.cancel.cancel();
        Ok(())
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Background process tool. `poll` is the action the chat loop exempts from
/// its iteration bound when it is the only thing a batch does.
pub struct ProcessTool {
    manager: ProcessManager,
}

impl ProcessTool {
    pub fn new(manager: ProcessManager) -> Self {
        Self { manager }
    }

    pub fn is_poll_call(tool_name: &str, args: &Value) -> bool {
        tool_name == "process"
            && args.get("action").and_then(|v| v.as_str()) == Some("poll")
    }
}

#[async_trait]
impl Tool for ProcessTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "process".to_string(),
            description: "Start, poll, or kill a background process".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["start", "poll", "kill"]},
                    "command": {"type": "string"},
                    "cwd": {"type": "string"},
                    "id": {"type": "string"}
                },
                "required": ["action"]
            }),
        }
    }

    fn category(&self) -> ActionCategory {
        ActionCategory::Exec
    }

    async fn execute(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolOutcome> {
        let action = args
            .get("action")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required argument `action`"))?;
        match action {
            "start" => {
                let command = args
                    .get("command")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.trim().is_empty())
                    .ok_or_else(|| anyhow::anyhow!("missing required argument `command`"))?;
                let cwd = args.get("cwd").and_then(|v| v.as_str());
                let id = self.manager.start(command, cwd).await?;
                Ok(ToolOutcome {
                    output: format!("started process {id}"),
                    metadata: json!({"id": id}),
                    inverse: None,
                })
            }
            "poll" => {
                let id = args
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("missing required argument `id`"))?;
                let status = self.manager.poll(id).await?;
                Ok(ToolOutcome {
                    output: status.to_string(),
                    metadata: status,
                    inverse: None,
                })
            }
            "kill" => {
                let id = args
                    .get("id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow::anyhow!("missing required argument `id`"))?;
                self.manager.kill(id).await?;
                Ok(ToolOutcome {
                    output: format!("killed process {id}"),
                    metadata: json!({"id": id}),
                    inverse: None,
                })
            }
            other => anyhow::bail!("unknown process action `{other}`"),
        }
    }
}
