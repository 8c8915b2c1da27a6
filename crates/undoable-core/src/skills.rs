use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::persist::write_json_atomic;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillsFile {
    #[serde(default)]
    pub disabled: Vec<String>,
}

/// Disable-list for skill refs. Anything not listed is enabled.
#[derive(Clone)]
pub struct SkillStore {
    path: PathBuf,
    disabled: Arc<RwLock<BTreeSet<String>>>,
}

impl SkillStore {
    pub async fn load(path: PathBuf) -> Self {
        let disabled = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str::<SkillsFile>(&raw)
                .map(|file| file.disabled.into_iter().collect())
                .unwrap_or_default(),
            Err(_) => BTreeSet::new(),
        };
        Self {
            path,
            disabled: Arc::new(RwLock::new(disabled)),
        }
    }

    pub async fn is_enabled(&self, skill: &str) -> bool {
        !self.disabled.read().await.contains(skill)
    }

    pub async fn disabled(&self) -> Vec<String> {
        self.disabled.read().await.iter().cloned().collect()
    }

    pub async fn set_enabled(&self, skill: &str, enabled: bool) -> anyhow::Result<()> {
        {
            let mut disabled = self.disabled.write().await;
            if enabled {
                disabled.remove(skill);
            } else {
                disabled.insert(skill.to_string());
            }
        }
        self.persist().await
    }

    /// Filters a node's skill refs down to the enabled ones.
    pub async fn enabled_refs(&self, refs: &[String]) -> Vec<String> {
        let disabled = self.disabled.read().await;
        refs.iter()
            .filter(|skill| !disabled.contains(*skill))
            .cloned()
            .collect()
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let file = SkillsFile {
            disabled: self.disabled.read().await.iter().cloned().collect(),
        };
        write_json_atomic(&self.path, &file).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disable_then_reload_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skills.json");
        {
            let store = SkillStore::load(path.clone()).await;
            store.set_enabled("scraper", false).await.unwrap();
        }
        let store = SkillStore::load(path).await;
        assert!(!store.is_enabled("scraper").await);
        assert!(store.is_enabled("summarizer").await);
        let refs = vec!["scraper".to_string(), "summarizer".to_string()];
        assert_eq!(store.enabled_refs(&refs).await, vec!["summarizer"]);
    }
}
