use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Owner-id (session or run) -> cancellation token. Every suspension point
/// in a run derives from the token created here.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, owner: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(owner.to_string(), token.clone());
        token
    }

    pub async fn get(&self, owner: &str) -> Option<CancellationToken> {
        self.tokens.read().await.get(owner).cloned()
    }

    pub async fn cancel(&self, owner: &str) -> bool {
        let Some(token) = self.tokens.read().await.get(owner).cloned() else {
            return false;
        };
        token.cancel();
        true
    }

    pub async fn remove(&self, owner: &str) {
        self.tokens.write().await.remove(owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_reaches_cloned_tokens() {
        let registry = CancellationRegistry::new();
        let token = registry.create("s1").await;
        assert!(registry.cancel("s1").await);
        assert!(token.is_cancelled());
        assert!(!registry.cancel("unknown").await);
    }
}
