use std::sync::Arc;

use tokio::sync::RwLock;

use undoable_types::{ApprovalMode, RunConfig, RunMode};

/// Snapshot store for the chat loop's run configuration. Env vars seed the
/// defaults; the HTTP surface can replace them at runtime.
#[derive(Clone)]
pub struct RunConfigStore {
    config: Arc<RwLock<RunConfig>>,
}

impl RunConfigStore {
    pub fn from_env() -> Self {
        let mut config = RunConfig::default();
        if let Ok(mode) = std::env::var("UNDOABLE_RUN_MODE") {
            match mode.trim().to_lowercase().as_str() {
                "plan" => config.mode = RunMode::Plan,
                "normal" => config.mode = RunMode::Normal,
                _ => {}
            }
        }
        if let Ok(max) = std::env::var("UNDOABLE_MAX_ITERATIONS") {
            if let Ok(max) = max.trim().parse::<u32>() {
                if max > 0 {
                    config.max_iterations = max;
                }
            }
        }
        if let Ok(economy) = std::env::var("UNDOABLE_ECONOMY_MODE") {
            config.economy_mode = matches!(economy.trim(), "1" | "true" | "on");
        }
        if let Ok(skip) = std::env::var("UNDOABLE_DANGEROUSLY_SKIP_PERMISSIONS") {
            if matches!(skip.trim(), "1" | "true" | "on") {
                config.approval_mode = ApprovalMode::Off;
            }
        }
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub fn with(config: RunConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub async fn get(&self) -> RunConfig {
        self.config.read().await.clone()
    }

    pub async fn set(&self, config: RunConfig) {
        *self.config.write().await = config;
    }
}

/// Economy mode tightens the iteration cap and tool-result truncation.
pub fn effective_limits(config: &RunConfig) -> (u32, usize) {
    if config.economy_mode {
        (config.max_iterations.min(6), 4_000)
    } else {
        (config.max_iterations, 16_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn economy_mode_tightens_caps() {
        let config = RunConfig {
            economy_mode: true,
            max_iterations: 25,
            ..RunConfig::default()
        };
        let (iterations, truncation) = effective_limits(&config);
        assert_eq!(iterations, 6);
        assert_eq!(truncation, 4_000);

        let config = RunConfig::default();
        let (iterations, truncation) = effective_limits(&config);
        assert_eq!(iterations, 25);
        assert_eq!(truncation, 16_000);
    }
}
