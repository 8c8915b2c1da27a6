use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use undoable_types::{Message, MessageRole, Session};

use crate::persist::{load_versioned, write_json_atomic};

pub const SESSIONS_STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionsFile {
    version: u32,
    sessions: Vec<Session>,
    saved_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionStore {
    path: PathBuf,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionStore {
    pub async fn load(path: PathBuf) -> anyhow::Result<Self> {
        let mut sessions = HashMap::new();
        if let Some(file) = load_versioned::<SessionsFile>(&path, SESSIONS_STATE_VERSION).await? {
            for session in file.sessions {
                sessions.insert(session.id.clone(), session);
            }
        }
        Ok(Self {
            path,
            sessions: Arc::new(RwLock::new(sessions)),
        })
    }

    pub async fn list(&self) -> Vec<Session> {
        let mut sessions = self
            .sessions
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions
    }

    pub async fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Fetch the session, creating an empty one when the id is new.
    pub async fn ensure(&self, id: Option<String>) -> Session {
        if let Some(id) = &id {
            if let Some(existing) = self.get(id).await {
                return existing;
            }
        }
        let session = Session::new(id, "New session");
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        let _ = self.flush().await;
        session
    }

    pub async fn save(&self, mut session: Session) -> anyhow::Result<()> {
        session.updated_at = Utc::now();
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        self.flush().await
    }

    pub async fn append_message(&self, id: &str, message: Message) -> anyhow::Result<()> {
        {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| anyhow::anyhow!("unknown session `{id}`"))?;
            if matches!(message.role, MessageRole::User) && title_needs_repair(&session.title) {
                if let Some(title) = derive_session_title(&message.joined_text(), 60) {
                    session.title = title;
                }
            }
            session.messages.push(message);
            session.updated_at = Utc::now();
        }
        self.flush().await
    }

    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            let _ = self.flush().await;
        }
        removed
    }

    async fn flush(&self) -> anyhow::Result<()> {
        let snapshot = {
            let sessions = self.sessions.read().await;
            let mut list = sessions.values().cloned().collect::<Vec<_>>();
            list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            SessionsFile {
                version: SESSIONS_STATE_VERSION,
                sessions: list,
                saved_at: Utc::now(),
            }
        };
        write_json_atomic(&self.path, &snapshot).await
    }
}

fn title_needs_repair(title: &str) -> bool {
    let trimmed = title.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("new session")
}

fn derive_session_title(prompt: &str, max_len: usize) -> Option<String> {
    let first_line = prompt.lines().find(|line| !line.trim().is_empty())?;
    let cleaned = first_line
        .trim()
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`')
        .trim();
    if cleaned.is_empty() {
        return None;
    }
    let mut title = String::new();
    for word in cleaned.split_whitespace() {
        if !title.is_empty() {
            title.push(' ');
        }
        title.push_str(word);
        if title.len() >= max_len {
            break;
        }
    }
    Some(title)
}
