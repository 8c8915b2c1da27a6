use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use undoable_types::{
    AuthMode, BindMode, DaemonSettingsPatch, DaemonSettingsRecord, OperationMode, SettingsSnapshot,
    DAEMON_SETTINGS_VERSION,
};

use crate::persist::{load_versioned, write_json_atomic};

fn new_token() -> String {
    format!("udt_{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// What a blocked request is trying to start; `drain` only refuses new work,
/// `paused` also stops dispatch of queued work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionKind {
    NewRun,
    NewJob,
    Dispatch,
}

#[derive(Debug, Clone)]
pub struct AdmissionBlocked {
    pub mode: OperationMode,
    pub reason: Option<String>,
}

impl std::fmt::Display for AdmissionBlocked {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.mode, &self.reason) {
            (OperationMode::Drain, Some(reason)) => {
                write!(f, "daemon is draining ({reason}); new work is refused")
            }
            (OperationMode::Drain, None) => write!(f, "daemon is draining; new work is refused"),
            (OperationMode::Paused, Some(reason)) => {
                write!(f, "daemon is paused ({reason}); dispatch is blocked")
            }
            (OperationMode::Paused, None) => write!(f, "daemon is paused; dispatch is blocked"),
            _ => write!(f, "admission blocked"),
        }
    }
}

impl std::error::Error for AdmissionBlocked {}

/// Desired settings live in the state file; effective settings are frozen at
/// boot from what the daemon actually bound with.
#[derive(Clone)]
pub struct SettingsService {
    path: PathBuf,
    desired: Arc<RwLock<DaemonSettingsRecord>>,
    effective: DaemonSettingsRecord,
    /// Mirror of the operation mode for sync readers (the scheduler tick).
    mode_cell: Arc<std::sync::atomic::AtomicU8>,
}

fn mode_to_cell(mode: OperationMode) -> u8 {
    match mode {
        OperationMode::Normal => 0,
        OperationMode::Drain => 1,
        OperationMode::Paused => 2,
    }
}

impl SettingsService {
    pub async fn load(path: PathBuf) -> anyhow::Result<Self> {
        let mut desired =
            load_versioned::<DaemonSettingsRecord>(&path, DAEMON_SETTINGS_VERSION)
                .await?
                .unwrap_or_default();
        apply_env_overrides(&mut desired);
        let effective = desired.clone();
        let mode_cell = Arc::new(std::sync::atomic::AtomicU8::new(mode_to_cell(
            desired.operation_mode,
        )));
        let service = Self {
            path,
            desired: Arc::new(RwLock::new(desired)),
            effective,
            mode_cell,
        };
        service.persist().await?;
        Ok(service)
    }

    /// Sync view used by tick loops; `paused` blocks all dispatch.
    pub fn dispatch_blocked(&self) -> bool {
        self.mode_cell.load(std::sync::atomic::Ordering::Relaxed) == 2
    }

    pub fn effective(&self) -> &DaemonSettingsRecord {
        &self.effective
    }

    pub async fn desired(&self) -> DaemonSettingsRecord {
        self.desired.read().await.clone()
    }

    pub async fn snapshot(&self) -> SettingsSnapshot {
        let desired = self.desired.read().await.clone();
        let restart_required = restart_required(&desired, &self.effective);
        SettingsSnapshot {
            desired,
            effective: self.effective.clone(),
            restart_required,
        }
    }

    pub async fn apply_patch(
        &self,
        patch: DaemonSettingsPatch,
    ) -> anyhow::Result<SettingsSnapshot> {
        {
            let mut desired = self.desired.write().await;
            if let Some(bind_mode) = patch.bind_mode {
                desired.bind_mode = bind_mode;
            }
            if let Some(host) = patch.host {
                desired.host = host;
            }
            // Bind mode dictates the host except in custom mode.
            desired.host = match desired.bind_mode {
                BindMode::Loopback => "127.0.0.1".to_string(),
                BindMode::All => "0.0.0.0".to_string(),
                BindMode::Custom => desired.host.clone(),
            };
            if let Some(port) = patch.port {
                desired.port = port;
            }
            if let Some(auth_mode) = patch.auth_mode {
                desired.auth_mode = auth_mode;
            }
            if let Some(token) = patch.token {
                desired.token = if token.trim().is_empty() {
                    None
                } else {
                    Some(token)
                };
            }
            if patch.rotate_token {
                desired.token = Some(new_token());
                desired.auth_mode = AuthMode::Token;
            }
            if let Some(policy) = patch.security_policy {
                desired.security_policy = policy;
            }
            if let Some(mode) = patch.operation_mode {
                desired.operation_mode = mode;
                self.mode_cell
                    .store(mode_to_cell(mode), std::sync::atomic::Ordering::Relaxed);
            }
            if let Some(reason) = patch.operation_reason {
                desired.operation_reason = if reason.trim().is_empty() {
                    None
                } else {
                    Some(reason)
                };
            }
        }
        self.persist().await?;
        Ok(self.snapshot().await)
    }

    /// Operation mode applies immediately, without a restart.
    pub async fn operation_mode(&self) -> (OperationMode, Option<String>) {
        let desired = self.desired.read().await;
        (desired.operation_mode, desired.operation_reason.clone())
    }

    pub async fn admit(&self, kind: AdmissionKind) -> Result<(), AdmissionBlocked> {
        let (mode, reason) = self.operation_mode().await;
        let blocked = match mode {
            OperationMode::Normal => false,
            OperationMode::Drain => matches!(kind, AdmissionKind::NewRun | AdmissionKind::NewJob),
            OperationMode::Paused => true,
        };
        if blocked {
            Err(AdmissionBlocked { mode, reason })
        } else {
            Ok(())
        }
    }

    async fn persist(&self) -> anyhow::Result<()> {
        let desired = self.desired.read().await.clone();
        write_json_atomic(&self.path, &desired).await
    }
}

fn restart_required(desired: &DaemonSettingsRecord, effective: &DaemonSettingsRecord) -> bool {
    desired.host != effective.host
        || desired.port != effective.port
        || desired.bind_mode != effective.bind_mode
        || desired.auth_mode != effective.auth_mode
        || desired.security_policy != effective.security_policy
        || desired.token.is_some() != effective.token.is_some()
}

fn apply_env_overrides(record: &mut DaemonSettingsRecord) {
    if let Ok(host) = std::env::var("NRN_HOST") {
        if !host.trim().is_empty() {
            record.host = host;
            record.bind_mode = BindMode::Custom;
        }
    }
    if let Ok(port) = std::env::var("NRN_PORT") {
        if let Ok(port) = port.trim().parse::<u16>() {
            record.port = port;
        }
    }
    if let Ok(token) = std::env::var("UNDOABLE_TOKEN") {
        if !token.trim().is_empty() {
            record.token = Some(token);
            record.auth_mode = AuthMode::Token;
        }
    }
    if let Ok(policy) = std::env::var("UNDOABLE_SECURITY_POLICY") {
        match policy.trim().to_lowercase().as_str() {
            "strict" => record.security_policy = undoable_types::SecurityPolicy::Strict,
            "balanced" => record.security_policy = undoable_types::SecurityPolicy::Balanced,
            "permissive" => record.security_policy = undoable_types::SecurityPolicy::Permissive,
            _ => {}
        }
    }
}
