use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use undoable_observability::{emit_event, DaemonEvent};
use undoable_providers::{ChatMessage, ProviderRegistry, StreamChunk};
use undoable_types::{
    Attachment, ChatFrame, EventType, Message, MessagePart, MessageRole, RunStatus,
};

use crate::compaction::{compact_history, needs_compaction};
use crate::drift::{drift_score, exceeds_threshold, stabilizer_message, DRIFT_THRESHOLD};
use crate::pipeline::ActionPipeline;
use crate::run_config::{effective_limits, RunConfigStore};
use crate::runs::RunManager;
use crate::sessions::SessionStore;

pub const CONTEXT_MAX_TOKENS: usize = 128_000;

const PRIMARY_SYSTEM_PROMPT: &str = "You are the Undoable execution agent. Use tool calls to \
carry out the user's instruction. Every side effect you take is recorded and must stay \
reversible; if a tool is denied or blocked, explain what was blocked and propose an \
alternative. Prefer small, verifiable steps.";

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub run_id: String,
    pub message: String,
    pub attachments: Vec<Attachment>,
    pub agent_id: Option<String>,
}

#[derive(Default)]
struct StreamedToolCall {
    name: String,
    args: String,
}

/// Splits streamed text into visible tokens and `<think>` spans, tolerating
/// tags that arrive split across deltas.
struct ThinkExtractor {
    pending: String,
    in_think: bool,
}

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

impl ThinkExtractor {
    fn new() -> Self {
        Self {
            pending: String::new(),
            in_think: false,
        }
    }

    /// Returns (visible, thinking) text extracted from this delta.
    fn push(&mut self, delta: &str) -> (String, String) {
        self.pending.push_str(delta);
        let mut visible = String::new();
        let mut thinking = String::new();
        loop {
            if self.in_think {
                if let Some(pos) = self.pending.find(THINK_CLOSE) {
                    thinking.push_str(&self.pending[..pos]);
                    self.pending.drain(..pos + THINK_CLOSE.len());
                    self.in_think = false;
                } else {
                    let hold = holdback_len(&self.pending, THINK_CLOSE);
                    let take = self.pending.len() - hold;
                    thinking.push_str(&self.pending[..take]);
                    self.pending.drain(..take);
                    break;
                }
            } else if let Some(pos) = self.pending.find(THINK_OPEN) {
                visible.push_str(&self.pending[..pos]);
                self.pending.drain(..pos + THINK_OPEN.len());
                self.in_think = true;
            } else {
                let hold = holdback_len(&self.pending, THINK_OPEN);
                let take = self.pending.len() - hold;
                visible.push_str(&self.pending[..take]);
                self.pending.drain(..take);
                break;
            }
        }
        (visible, thinking)
    }

    fn finish(&mut self) -> (String, String) {
        let rest = std::mem::take(&mut self.pending);
        if self.in_think {
            (String::new(), rest)
        } else {
            (rest, String::new())
        }
    }
}

/// Length of the trailing slice that could still turn into `tag`.
fn holdback_len(buffer: &str, tag: &str) -> usize {
    let max = tag.len().saturating_sub(1).min(buffer.len());
    for len in (1..=max).rev() {
        let tail = &buffer[buffer.len() - len..];
        if tag.starts_with(tail) {
            return len;
        }
    }
    0
}

#[derive(Clone)]
pub struct ChatLoop {
    sessions: SessionStore,
    providers: ProviderRegistry,
    pipeline: ActionPipeline,
    runs: RunManager,
    config: RunConfigStore,
}

impl ChatLoop {
    pub fn new(
        sessions: SessionStore,
        providers: ProviderRegistry,
        pipeline: ActionPipeline,
        runs: RunManager,
        config: RunConfigStore,
    ) -> Self {
        Self {
            sessions,
            providers,
            pipeline,
            runs,
            config,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Drives one user turn to completion, emitting frames into `sink`.
    pub async fn run_turn(
        &self,
        req: TurnRequest,
        sink: UnboundedSender<ChatFrame>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let config = self.config.get().await;
        let (max_iterations, result_cap) = effective_limits(&config);
        let run_id = req.run_id.clone();
        let session = self.sessions.ensure(Some(req.session_id.clone())).await;

        // Surface gate and policy traffic for this run as SSE frames.
        let bridge_sink = sink.clone();
        let _bridge = self.runs.bus().on_run(&run_id, move |envelope| {
            let frame = match envelope.event_type {
                EventType::ApprovalRequested => Some(ChatFrame::ApprovalRequest {
                    id: envelope.payload["approvalId"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    tool: envelope.payload["tool"].as_str().unwrap_or_default().to_string(),
                    args: envelope.payload["args"].clone(),
                    description: envelope.payload["description"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                }),
                EventType::ApprovalResolved => Some(ChatFrame::ApprovalResolved {
                    id: envelope.payload["approvalId"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    approved: envelope.payload["approved"].as_bool().unwrap_or(false),
                }),
                // Only pipeline-originated policy warnings bridge to frames;
                // the loop sends its own warnings directly.
                EventType::Warning
                    if matches!(
                        envelope.payload["code"].as_str(),
                        Some("undo_guarantee_blocked") | Some("irreversible_action")
                    ) =>
                {
                    Some(ChatFrame::Warning {
                        code: envelope.payload["code"].as_str().unwrap_or("warning").to_string(),
                        message: envelope.payload["hint"]
                            .as_str()
                            .or_else(|| envelope.payload["tool"].as_str())
                            .unwrap_or_default()
                            .to_string(),
                    })
                }
                _ => None,
            };
            if let Some(frame) = frame {
                let _ = bridge_sink.send(frame);
            }
        });

        let user_text = render_user_text(&req.message, &req.attachments);
        self.sessions
            .append_message(&session.id, Message::text(MessageRole::User, user_text.clone()))
            .await?;

        let score = drift_score(&user_text);
        let stabilizer = if exceeds_threshold(score) {
            let _ = sink.send(ChatFrame::Alignment {
                score,
                threshold: DRIFT_THRESHOLD,
            });
            self.runs.bus().emit(
                &run_id,
                EventType::Warning,
                json!({"code": "drift_stabilizer", "score": score}),
                None,
            );
            Some(stabilizer_message().to_string())
        } else {
            None
        };

        let model = self
            .providers
            .active_model()
            .await
            .unwrap_or_else(|| "default".to_string());
        let _ = sink.send(ChatFrame::SessionInfo {
            session_id: session.id.clone(),
            model,
            mode: format!("{:?}", config.mode).to_lowercase(),
            economy: config.economy_mode,
        });

        self.runs.advance_to(&run_id, RunStatus::Planning)?;
        emit_event(
            Level::INFO,
            DaemonEvent {
                run_id: Some(&run_id),
                session_id: Some(&session.id),
                status: Some("start"),
                ..DaemonEvent::new("model.turn.start", "chat.loop")
            },
        );

        let mut counted: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                let _ = self.runs.update_status(&run_id, RunStatus::Cancelled, None);
                return Ok(());
            }
            if counted >= max_iterations {
                let _ = sink.send(ChatFrame::Warning {
                    code: "max_iterations".to_string(),
                    message: format!("stopped after {max_iterations} iterations"),
                });
                self.runs.bus().emit(
                    &run_id,
                    EventType::Warning,
                    json!({"code": "max_iterations", "cap": max_iterations}),
                    None,
                );
                break;
            }
            let _ = sink.send(ChatFrame::Progress {
                iteration: counted + 1,
                max_iterations,
            });

            let messages = self
                .build_wire_messages(&session.id, config.economy_mode, stabilizer.as_deref())
                .await?;
            let tools = self.pipeline.tools().list().await;
            let stream = self
                .providers
                .stream(None, messages, Some(tools), cancel.clone())
                .await;
            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    let detail = err.to_string();
                    emit_event(
                        Level::ERROR,
                        DaemonEvent {
                            run_id: Some(&run_id),
                            session_id: Some(&session.id),
                            status: Some("failed"),
                            error_code: Some("PROVIDER_REQUEST_FAILED"),
                            detail: Some(&detail),
                            ..DaemonEvent::new("model.turn.error", "chat.loop")
                        },
                    );
                    let _ = sink.send(ChatFrame::Warning {
                        code: "provider_error".to_string(),
                        message: detail,
                    });
                    let _ = self.runs.update_status(&run_id, RunStatus::Failed, None);
                    return Err(err);
                }
            };
            tokio::pin!(stream);

            let mut extractor = ThinkExtractor::new();
            let mut completion = String::new();
            let mut tool_calls: Vec<(String, StreamedToolCall)> = Vec::new();
            while let Some(chunk) = stream.next().await {
                if cancel.is_cancelled() {
                    break;
                }
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = sink.send(ChatFrame::Warning {
                            code: "provider_stream_error".to_string(),
                            message: err.to_string(),
                        });
                        let _ = self.runs.update_status(&run_id, RunStatus::Failed, None);
                        return Err(err);
                    }
                };
                match chunk {
                    StreamChunk::TextDelta(delta) => {
                        let (visible, thinking) = extractor.push(&delta);
                        self.forward_text(&sink, &run_id, &mut completion, visible, thinking);
                    }
                    StreamChunk::ToolCallStart { id, name } => {
                        let entry = entry_for(&mut tool_calls, &id);
                        if entry.name.is_empty() {
                            entry.name = name;
                        }
                    }
                    StreamChunk::ToolCallDelta { id, args_delta } => {
                        entry_for(&mut tool_calls, &id).args.push_str(&args_delta);
                    }
                    StreamChunk::ToolCallEnd { .. } => {}
                    StreamChunk::Done { .. } => break,
                }
            }
            let (visible, thinking) = extractor.finish();
            self.forward_text(&sink, &run_id, &mut completion, visible, thinking);

            if cancel.is_cancelled() {
                let _ = self.runs.update_status(&run_id, RunStatus::Cancelled, None);
                return Ok(());
            }

            let calls = tool_calls
                .into_iter()
                .filter(|(_, call)| !call.name.trim().is_empty())
                .collect::<Vec<_>>();

            if calls.is_empty() {
                let assistant = Message::text(MessageRole::Assistant, completion.clone());
                let message_id = assistant.id.clone();
                self.sessions.append_message(&session.id, assistant).await?;
                self.runs.advance_to(&run_id, RunStatus::Completed)?;
                emit_event(
                    Level::INFO,
                    DaemonEvent {
                        run_id: Some(&run_id),
                        session_id: Some(&session.id),
                        status: Some("ok"),
                        ..DaemonEvent::new("model.turn.finish", "chat.loop")
                    },
                );
                let _ = sink.send(ChatFrame::Done {
                    session_id: session.id.clone(),
                    message_id,
                });
                return Ok(());
            }

            // Record the assistant's tool-call message before executing.
            let mut parts = Vec::new();
            if !completion.trim().is_empty() {
                parts.push(MessagePart::Text {
                    text: completion.clone(),
                });
            }
            let mut parsed_calls = Vec::new();
            for (call_id, call) in &calls {
                let args = parse_tool_args(&call.args);
                parts.push(MessagePart::ToolCall {
                    call_id: call_id.clone(),
                    name: call.name.clone(),
                    args: args.clone(),
                });
                parsed_calls.push((call_id.clone(), call.name.clone(), args));
            }
            self.sessions
                .append_message(&session.id, Message::new(MessageRole::Assistant, parts))
                .await?;

            let plan = json!({
                "calls": parsed_calls
                    .iter()
                    .map(|(_, name, args)| json!({"tool": name, "args": args}))
                    .collect::<Vec<_>>(),
            });
            let _ = self.runs.set_plan(&run_id, plan);
            self.runs.advance_to(&run_id, RunStatus::Applying)?;

            // Sequential batch execution keeps the conversation deterministic.
            let mut all_polls = true;
            for (call_id, name, args) in parsed_calls {
                if !undoable_tools::ProcessTool::is_poll_call(&name, &args) {
                    all_polls = false;
                }
                let _ = sink.send(ChatFrame::ToolCall {
                    call_id: call_id.clone(),
                    name: name.clone(),
                    args: args.clone(),
                });
                let invocation = self
                    .pipeline
                    .invoke(Some(&run_id), &name, args, cancel.clone())
                    .await;
                let output = if let Some(error) = &invocation.error {
                    json!({"error": error}).to_string()
                } else {
                    truncate_text(&invocation.output, result_cap)
                };
                self.sessions
                    .append_message(
                        &session.id,
                        Message::new(
                            MessageRole::Tool,
                            vec![MessagePart::ToolResult {
                                call_id: call_id.clone(),
                                name: name.clone(),
                                output: output.clone(),
                                error: invocation.error.clone(),
                            }],
                        ),
                    )
                    .await?;
                // A cancelled run keeps the logged result but stops streaming.
                if cancel.is_cancelled() {
                    let _ = self.runs.update_status(&run_id, RunStatus::Cancelled, None);
                    return Ok(());
                }
                let _ = sink.send(ChatFrame::ToolResult {
                    call_id,
                    name,
                    output,
                    error: invocation.error,
                });
            }

            if !all_polls {
                counted += 1;
            }
        }

        // The bound was hit; close the turn with what we have.
        self.runs.advance_to(&run_id, RunStatus::Completed)?;
        let done_message = Message::text(
            MessageRole::Assistant,
            "Stopped at the iteration bound before reaching a final answer.",
        );
        let message_id = done_message.id.clone();
        self.sessions.append_message(&session.id, done_message).await?;
        let _ = sink.send(ChatFrame::Done {
            session_id: session.id,
            message_id,
        });
        Ok(())
    }

    fn forward_text(
        &self,
        sink: &UnboundedSender<ChatFrame>,
        run_id: &str,
        completion: &mut String,
        visible: String,
        thinking: String,
    ) {
        if !thinking.is_empty() {
            let _ = sink.send(ChatFrame::Thinking { delta: thinking });
        }
        if !visible.is_empty() {
            completion.push_str(&visible);
            self.runs.bus().emit(
                run_id,
                EventType::LlmToken,
                json!({"delta": visible}),
                None,
            );
            let _ = sink.send(ChatFrame::Token { delta: visible });
        }
    }

    async fn build_wire_messages(
        &self,
        session_id: &str,
        economy: bool,
        stabilizer: Option<&str>,
    ) -> anyhow::Result<Vec<ChatMessage>> {
        let session = self
            .sessions
            .get(session_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown session `{session_id}`"))?;
        let mut wire = vec![ChatMessage::new("system", PRIMARY_SYSTEM_PROMPT)];
        if let Some(stabilizer) = stabilizer {
            wire.push(ChatMessage::new("system", stabilizer));
        }

        let history: Vec<Message> =
            if needs_compaction(&session.messages, CONTEXT_MAX_TOKENS, economy) {
                let (snapshot, tail) = compact_history(&session.messages);
                wire.push(ChatMessage::new("system", snapshot));
                tail
            } else {
                session.messages.clone()
            };

        for message in history {
            let role = match message.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::Tool => "tool",
            };
            let content = render_message_content(&message);
            if !content.is_empty() {
                wire.push(ChatMessage::new(role, content));
            }
        }
        Ok(wire)
    }
}

fn entry_for<'a>(
    calls: &'a mut Vec<(String, StreamedToolCall)>,
    id: &str,
) -> &'a mut StreamedToolCall {
    if let Some(pos) = calls.iter().position(|(key, _)| key == id) {
        return &mut calls[pos].1;
    }
    calls.push((id.to_string(), StreamedToolCall::default()));
    let last = calls.len() - 1;
    &mut calls[last].1
}

fn parse_tool_args(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return json!({});
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| json!({"raw": trimmed}))
}

fn render_user_text(message: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return message.to_string();
    }
    let rendered = attachments
        .iter()
        .map(|a| format!("[attachment name={} mime={} url={}]", a.name, a.mime, a.url))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{message}\n{rendered}")
}

fn render_message_content(message: &Message) -> String {
    message
        .parts
        .iter()
        .map(|part| match part {
            MessagePart::Text { text } => text.clone(),
            MessagePart::ToolCall { name, args, .. } => {
                format!("[tool call] {name} {args}")
            }
            MessagePart::ToolResult { name, output, error, .. } => match error {
                Some(error) => format!("[tool result] {name} error: {error}"),
                None => format!("[tool result] {name}: {output}"),
            },
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn truncate_text(input: &str, max_len: usize) -> String {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_extractor_handles_split_tags() {
        let mut extractor = ThinkExtractor::new();
        let (visible, thinking) = extractor.push("before <thi");
        assert_eq!(visible, "before ");
        assert_eq!(thinking, "");
        let (visible, thinking) = extractor.push("nk>inner</think> after");
        assert_eq!(visible, " after");
        assert_eq!(thinking, "inner");
        let (visible, thinking) = extractor.finish();
        assert_eq!(visible, "");
        assert_eq!(thinking, "");
    }

    #[test]
    fn think_extractor_flushes_unclosed_span() {
        let mut extractor = ThinkExtractor::new();
        let (visible, thinking) = extractor.push("<think>half done");
        assert_eq!(visible, "");
        assert_eq!(thinking, "half done");
        let (visible, rest) = extractor.finish();
        assert_eq!(visible, "");
        assert_eq!(rest, "");
    }

    #[test]
    fn holdback_keeps_possible_tag_prefixes() {
        let mut extractor = ThinkExtractor::new();
        let (visible, _) = extractor.push("text <");
        assert_eq!(visible, "text ");
        let (visible, _) = extractor.push("b>");
        assert_eq!(visible, "<b>");
    }

    #[test]
    fn plain_text_passes_through() {
        let mut extractor = ThinkExtractor::new();
        let (visible, thinking) = extractor.push("no tags at all");
        assert_eq!(thinking, "");
        assert!(visible.starts_with("no tags at"));
    }

    #[test]
    fn tool_args_fall_back_to_raw_wrapper() {
        assert_eq!(parse_tool_args(""), json!({}));
        assert_eq!(parse_tool_args("{\"a\":1}"), json!({"a": 1}));
        assert_eq!(parse_tool_args("not json"), json!({"raw": "not json"}));
    }
}
