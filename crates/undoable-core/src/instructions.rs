use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::persist::write_json_atomic;

pub const INSTRUCTIONS_META_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionsMeta {
    pub version: u32,
    pub agent: String,
    pub active_version: u32,
    pub updated_at: DateTime<Utc>,
}

/// Per-agent instruction documents under `instructions/<agent>/`: an
/// append-only series of `vN.md` files plus a `meta.json` pointer at the
/// active one.
#[derive(Clone)]
pub struct InstructionsStore {
    base: PathBuf,
}

impl InstructionsStore {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    fn agent_dir(&self, agent: &str) -> PathBuf {
        self.base.join(sanitize_agent(agent))
    }

    pub async fn meta(&self, agent: &str) -> Option<InstructionsMeta> {
        let raw = fs::read_to_string(self.agent_dir(agent).join("meta.json"))
            .await
            .ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub async fn active(&self, agent: &str) -> Option<String> {
        let meta = self.meta(agent).await?;
        let path = self
            .agent_dir(agent)
            .join(format!("v{}.md", meta.active_version));
        fs::read_to_string(path).await.ok()
    }

    /// Writes the next version file and points the meta at it. Older versions
    /// are never rewritten.
    pub async fn publish(&self, agent: &str, content: &str) -> anyhow::Result<InstructionsMeta> {
        let dir = self.agent_dir(agent);
        fs::create_dir_all(&dir).await?;
        let next = self
            .meta(agent)
            .await
            .map(|meta| meta.active_version + 1)
            .unwrap_or(1);
        fs::write(dir.join(format!("v{next}.md")), content).await?;
        let meta = InstructionsMeta {
            version: INSTRUCTIONS_META_VERSION,
            agent: sanitize_agent(agent),
            active_version: next,
            updated_at: Utc::now(),
        };
        write_json_atomic(&dir.join("meta.json"), &meta).await?;
        Ok(meta)
    }

    pub async fn versions(&self, agent: &str) -> Vec<u32> {
        let mut versions = Vec::new();
        let Ok(mut entries) = fs::read_dir(self.agent_dir(agent)).await else {
            return versions;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stripped) = name.strip_prefix('v').and_then(|n| n.strip_suffix(".md")) {
                if let Ok(version) = stripped.parse::<u32>() {
                    versions.push(version);
                }
            }
        }
        versions.sort_unstable();
        versions
    }

    pub async fn list_agents(&self) -> Vec<String> {
        let mut agents = Vec::new();
        let Ok(mut entries) = fs::read_dir(&self.base).await else {
            return agents;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                agents.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        agents.sort();
        agents
    }
}

fn sanitize_agent(agent: &str) -> String {
    agent
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_advances_versions_and_active_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstructionsStore::new(dir.path().to_path_buf());

        let first = store.publish("planner", "be careful").await.unwrap();
        assert_eq!(first.active_version, 1);
        let second = store.publish("planner", "be bolder").await.unwrap();
        assert_eq!(second.active_version, 2);

        assert_eq!(store.active("planner").await.unwrap(), "be bolder");
        assert_eq!(store.versions("planner").await, vec![1, 2]);
        // v1 is still intact.
        let v1 = std::fs::read_to_string(dir.path().join("planner/v1.md")).unwrap();
        assert_eq!(v1, "be careful");
    }

    #[tokio::test]
    async fn agent_names_are_sanitized_for_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let store = InstructionsStore::new(dir.path().to_path_buf());
        store.publish("weird/../agent", "x").await.unwrap();
        assert_eq!(store.list_agents().await, vec!["weird____agent"]);
    }
}
