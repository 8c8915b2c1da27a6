use std::path::PathBuf;

pub const STATE_DIR_ENV: &str = "UNDOABLE_STATE_DIR";

/// State-dir resolution order: explicit flag, `UNDOABLE_STATE_DIR`, then
/// `~/.undoable`.
pub fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".undoable")
}

pub fn runs_state_file(base: &std::path::Path) -> PathBuf {
    base.join("runs-state.json")
}

pub fn jobs_state_file(base: &std::path::Path) -> PathBuf {
    base.join("jobs-state.json")
}

pub fn swarm_state_file(base: &std::path::Path) -> PathBuf {
    base.join("swarm-state.json")
}

pub fn sessions_file(base: &std::path::Path) -> PathBuf {
    base.join("sessions.json")
}

pub fn daemon_settings_file(base: &std::path::Path) -> PathBuf {
    base.join("daemon-settings.json")
}

pub fn providers_file(base: &std::path::Path) -> PathBuf {
    base.join("providers.json")
}

pub fn skills_file(base: &std::path::Path) -> PathBuf {
    base.join("skills.json")
}

pub fn pid_file(base: &std::path::Path) -> PathBuf {
    base.join("daemon.pid.json")
}

pub fn instructions_dir(base: &std::path::Path) -> PathBuf {
    base.join("instructions")
}

pub fn canvas_dir(base: &std::path::Path) -> PathBuf {
    base.join("canvas")
}

pub fn logs_dir(base: &std::path::Path) -> PathBuf {
    base.join("logs")
}
