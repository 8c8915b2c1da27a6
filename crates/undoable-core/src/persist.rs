use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;

/// Debounce window for coalesced flushes. Status transitions bypass it.
pub const FLUSH_DEBOUNCE: Duration = Duration::from_millis(200);

/// Write JSON atomically: temp file in the same directory, then rename.
/// Files are created with owner-only permissions.
pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, raw.as_bytes()).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp, perms).await?;
    }
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Load a versioned store. Returns `None` when the file does not exist;
/// refuses files written by a newer daemon.
pub async fn load_versioned<T: DeserializeOwned>(
    path: &Path,
    supported_version: u32,
) -> anyhow::Result<Option<T>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let probe: serde_json::Value = serde_json::from_str(&raw)?;
    let version = probe.get("version").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    if version > supported_version {
        anyhow::bail!(
            "{} has version {} but this daemon supports up to {}",
            path.display(),
            version,
            supported_version
        );
    }
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Coalesces flush requests behind a debounce window. `schedule` marks the
/// store dirty; `flush_now` wakes the writer immediately (status changes must
/// never wait out the window).
pub struct FlushHandle {
    notify: Arc<Notify>,
    immediate: Arc<Notify>,
}

impl FlushHandle {
    pub fn schedule(&self) {
        self.notify.notify_one();
    }

    pub fn flush_now(&self) {
        self.immediate.notify_one();
    }
}

pub fn spawn_debounced_flusher<F, Fut>(write: F) -> Arc<FlushHandle>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send,
{
    let notify = Arc::new(Notify::new());
    let immediate = Arc::new(Notify::new());
    let handle = Arc::new(FlushHandle {
        notify: notify.clone(),
        immediate: immediate.clone(),
    });
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = notify.notified() => {
                    // Let further writes pile up inside the window, but a
                    // forced flush cuts it short.
                    tokio::select! {
                        _ = tokio::time::sleep(FLUSH_DEBOUNCE) => {}
                        _ = immediate.notified() => {}
                    }
                }
                _ = immediate.notified() => {}
            }
            if let Err(err) = write().await {
                tracing::warn!(error = %err, "state flush failed; continuing in memory");
            }
        }
    });
    handle
}

pub fn state_file(base: &Path, name: &str) -> PathBuf {
    base.join(name)
}
