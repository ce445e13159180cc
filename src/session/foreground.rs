//! Foreground window → process name lookup for `deej.current`

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Minimum time between two real foreground lookups
pub const FOREGROUND_COOLDOWN: Duration = Duration::from_millis(350);

/// Reports the executable names behind the focused window
#[async_trait]
pub trait ForegroundProvider: Send + Sync {
    async fn current_process_names(&self) -> Result<Vec<String>>;
}

/// Caches the last lookup for [`FOREGROUND_COOLDOWN`]
///
/// Slider moves arrive in bursts; this keeps a burst from spawning one
/// window-system query per event. Results are lowercased and deduplicated.
pub struct CooldownForeground {
    inner: Arc<dyn ForegroundProvider>,
    cooldown: Duration,
    last: Mutex<Option<(Instant, Vec<String>)>>,
}

impl CooldownForeground {
    pub fn new(inner: Arc<dyn ForegroundProvider>) -> Self {
        Self {
            inner,
            cooldown: FOREGROUND_COOLDOWN,
            last: Mutex::new(None),
        }
    }

    /// Platform default provider wrapped in the cooldown cache
    pub fn for_platform() -> Self {
        Self::new(default_provider())
    }

    /// Current foreground process names; errors resolve to an empty set
    pub async fn process_names(&self) -> Vec<String> {
        let mut last = self.last.lock().await;

        if let Some((at, names)) = last.as_ref() {
            if at.elapsed() < self.cooldown {
                return names.clone();
            }
        }

        let names = match self.inner.current_process_names().await {
            Ok(names) => normalize(names),
            Err(e) => {
                warn!("Failed to get current window process names: {:#}", e);
                Vec::new()
            }
        };

        *last = Some((Instant::now(), names.clone()));
        names
    }
}

fn normalize(names: Vec<String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim().to_lowercase();
        if !name.is_empty() && !unique.contains(&name) {
            unique.push(name);
        }
    }
    unique
}

/// X11 lookup via `xdotool` and `/proc/<pid>/exe`
pub struct XdotoolForeground;

#[async_trait]
impl ForegroundProvider for XdotoolForeground {
    async fn current_process_names(&self) -> Result<Vec<String>> {
        let output = Command::new("xdotool")
            .args(["getactivewindow", "getwindowpid"])
            .output()
            .await
            .context("Failed to run xdotool")?;

        if !output.status.success() {
            anyhow::bail!(
                "xdotool failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let pid: u32 = String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse()
            .context("xdotool returned a non-numeric pid")?;

        let exe = tokio::fs::read_link(format!("/proc/{}/exe", pid))
            .await
            .with_context(|| format!("Failed to resolve executable for pid {}", pid))?;

        let name = Path::new(&exe)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("Executable path has no file name")?;

        debug!("Foreground window belongs to {} (pid {})", name, pid);
        Ok(vec![name])
    }
}

/// Used where no foreground lookup is available
pub struct UnsupportedForeground;

#[async_trait]
impl ForegroundProvider for UnsupportedForeground {
    async fn current_process_names(&self) -> Result<Vec<String>> {
        anyhow::bail!(
            "foreground window lookup is not supported on {}",
            std::env::consts::OS
        )
    }
}

fn default_provider() -> Arc<dyn ForegroundProvider> {
    if cfg!(target_os = "linux") {
        Arc::new(XdotoolForeground)
    } else {
        Arc::new(UnsupportedForeground)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        calls: AtomicUsize,
        names: Vec<&'static str>,
    }

    #[async_trait]
    impl ForegroundProvider for Scripted {
        async fn current_process_names(&self) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.names.iter().map(|s| s.to_string()).collect())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_caches_and_normalizes() {
        let provider = Arc::new(Scripted {
            calls: AtomicUsize::new(0),
            names: vec!["Game.exe", "launcher.exe", "GAME.EXE"],
        });
        let foreground = CooldownForeground::new(provider.clone());

        let names = foreground.process_names().await;
        assert_eq!(names, vec!["game.exe".to_string(), "launcher.exe".to_string()]);

        tokio::time::advance(Duration::from_millis(100)).await;
        foreground.process_names().await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(400)).await;
        foreground.process_names().await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_errors_resolve_empty() {
        let foreground = CooldownForeground::new(Arc::new(UnsupportedForeground));
        assert!(foreground.process_names().await.is_empty());
    }
}
