//! Configuration file watcher for hot-reload support
//!
//! Watches the directories holding the user config and the internal
//! preferences rather than the files themselves, so saves that replace the
//! file (write to a temp file, then rename over) are still seen.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{CanonicalConfig, ConfigPaths};

/// Wait for editors to finish writing before re-reading
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(100);

/// Config watcher that monitors both config sources and emits reloaded configs
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    rx: mpsc::Receiver<CanonicalConfig>,
}

impl ConfigWatcher {
    /// Load the initial configuration and start watching both config files
    pub async fn new(paths: ConfigPaths) -> Result<(Self, CanonicalConfig)> {
        let (tx, rx) = mpsc::channel(10);

        let initial_config = CanonicalConfig::load(&paths)
            .await
            .context("Failed to load initial config")?;

        let user_target = watch_target(&paths.user)
            .with_context(|| format!("Failed to locate config file: {}", paths.user.display()))?;
        let internal_target = match watch_target(&paths.internal) {
            Ok(target) => Some(target),
            Err(e) => {
                warn!(
                    "Not watching internal config {}: {:#}",
                    paths.internal.display(),
                    e
                );
                None
            }
        };

        let mut targets = vec![user_target];
        targets.extend(internal_target);
        let reload_paths = paths.clone();
        let relevant = targets.clone();

        // notify callbacks run on their own OS thread, not in Tokio context
        let runtime_handle = tokio::runtime::Handle::current();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
                        || !event.paths.iter().any(|p| relevant.contains(p))
                    {
                        return;
                    }
                    debug!("Config file modified: {:?}", event.paths);

                    let paths = reload_paths.clone();
                    let tx = tx.clone();

                    runtime_handle.spawn(async move {
                        tokio::time::sleep(RELOAD_DEBOUNCE).await;

                        match CanonicalConfig::load(&paths).await {
                            Ok(new_config) => {
                                info!("Configuration reloaded successfully");
                                if let Err(e) = tx.send(new_config).await {
                                    error!("Failed to send config update: {}", e);
                                }
                            }
                            Err(e) => {
                                warn!("Failed to reload config (keeping old config): {:#}", e);
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("Watch error: {}", e);
                }
            }
        })?;

        let mut watched_dirs: Vec<&Path> = Vec::new();
        for target in &targets {
            let Some(dir) = target.parent() else {
                continue;
            };
            if watched_dirs.contains(&dir) {
                continue;
            }
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to watch config directory: {}", dir.display()))?;
            watched_dirs.push(dir);
        }

        info!("Config file watcher started for: {}", paths.user.display());

        Ok((
            Self {
                _watcher: watcher,
                rx,
            },
            initial_config,
        ))
    }

    /// Wait for the next reloaded config
    /// Returns None if the watcher has been closed
    pub async fn next_config(&mut self) -> Option<CanonicalConfig> {
        self.rx.recv().await
    }
}

/// Absolute path a file's events are reported under: canonical parent + file name
fn watch_target(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let dir = dir
        .canonicalize()
        .with_context(|| format!("Directory {} is not accessible", dir.display()))?;

    Ok(dir.join(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_watcher_basic() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let paths = ConfigPaths {
            user: temp_dir.path().join("config.yaml"),
            internal: temp_dir.path().join("preferences.yaml"),
        };

        fs::write(
            &paths.user,
            "slider_mapping:\n  0: master\ncom_port: COM3\n",
        )?;

        let (mut watcher, config) = ConfigWatcher::new(paths.clone()).await?;

        assert_eq!(config.connection.com_port, "COM3");
        assert_eq!(config.slider_mapping.get(0), Some(vec!["master".to_string()]));

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(
            &paths.user,
            "slider_mapping:\n  0: spotify.exe\ncom_port: COM5\n",
        )?;

        let new_config = tokio::time::timeout(Duration::from_secs(2), watcher.next_config()).await?;

        if let Some(new_config) = new_config {
            assert_eq!(new_config.connection.com_port, "COM5");
            assert_eq!(
                new_config.slider_mapping.get(0),
                Some(vec!["spotify.exe".to_string()])
            );
        }

        Ok(())
    }

    fn temp_paths(temp_dir: &TempDir) -> ConfigPaths {
        ConfigPaths {
            user: temp_dir.path().join("config.yaml"),
            internal: temp_dir.path().join("preferences.yaml"),
        }
    }

    #[tokio::test]
    async fn test_preferences_edit_triggers_reload() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let paths = temp_paths(&temp_dir);
        fs::write(&paths.user, "slider_mapping:\n  0: master\n")?;

        let (mut watcher, config) = ConfigWatcher::new(paths.clone()).await?;
        assert_eq!(config.slider_mapping.get(1), None);

        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(&paths.internal, "slider_mapping:\n  1: discord.exe\n")?;

        let new_config = tokio::time::timeout(Duration::from_secs(2), watcher.next_config())
            .await?
            .context("watcher closed")?;

        assert_eq!(new_config.slider_mapping.get(0), Some(vec!["master".to_string()]));
        assert_eq!(
            new_config.slider_mapping.get(1),
            Some(vec!["discord.exe".to_string()])
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_replace_by_rename_triggers_reload() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let paths = temp_paths(&temp_dir);
        fs::write(&paths.user, "slider_mapping:\n  0: master\n")?;

        let (mut watcher, _) = ConfigWatcher::new(paths.clone()).await?;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let staged = temp_dir.path().join("config.yaml.tmp");
        fs::write(&staged, "slider_mapping:\n  0: vlc\n")?;
        fs::rename(&staged, &paths.user)?;

        let new_config = tokio::time::timeout(Duration::from_secs(2), watcher.next_config())
            .await?
            .context("watcher closed")?;

        assert_eq!(new_config.slider_mapping.get(0), Some(vec!["vlc".to_string()]));

        Ok(())
    }

    #[test]
    fn test_watch_target_resolves_bare_file_name() -> Result<()> {
        let target = watch_target(Path::new("config.yaml"))?;

        assert!(target.is_absolute());
        assert_eq!(target.file_name().and_then(|n| n.to_str()), Some("config.yaml"));
        Ok(())
    }
}
