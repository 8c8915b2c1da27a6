use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMode {
    Loopback,
    All,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Open,
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityPolicy {
    Strict,
    Balanced,
    Permissive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Normal,
    Drain,
    Paused,
}

pub const DAEMON_SETTINGS_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSettingsRecord {
    pub version: u32,
    pub host: String,
    pub port: u16,
    pub bind_mode: BindMode,
    pub auth_mode: AuthMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub security_policy: SecurityPolicy,
    pub operation_mode: OperationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_reason: Option<String>,
}

impl Default for DaemonSettingsRecord {
    fn default() -> Self {
        Self {
            version: DAEMON_SETTINGS_VERSION,
            host: "127.0.0.1".to_string(),
            port: 4477,
            bind_mode: BindMode::Loopback,
            auth_mode: AuthMode::Open,
            token: None,
            security_policy: SecurityPolicy::Balanced,
            operation_mode: OperationMode::Normal,
            operation_reason: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonSettingsPatch {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub bind_mode: Option<BindMode>,
    #[serde(default)]
    pub auth_mode: Option<AuthMode>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub rotate_token: bool,
    #[serde(default)]
    pub security_policy: Option<SecurityPolicy>,
    #[serde(default)]
    pub operation_mode: Option<OperationMode>,
    #[serde(default)]
    pub operation_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsSnapshot {
    pub desired: DaemonSettingsRecord,
    pub effective: DaemonSettingsRecord,
    pub restart_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    Off,
    Mutate,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Normal,
    Plan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunConfig {
    pub mode: RunMode,
    pub max_iterations: u32,
    pub approval_mode: ApprovalMode,
    pub economy_mode: bool,
    pub thinking: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Normal,
            max_iterations: 25,
            approval_mode: ApprovalMode::Mutate,
            economy_mode: false,
            thinking: true,
        }
    }
}
