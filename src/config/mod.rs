//! Configuration management for deej
//!
//! Handles loading and merging of the user config (`config.yaml`) with the
//! internal preferences file, and hot-reloading both into a shared
//! [`ConfigHandle`].

pub mod slider_mapping;
pub mod watcher;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub use slider_mapping::{SliderIndex, SliderMapping};
pub use watcher::ConfigWatcher;

pub const DEFAULT_BAUD_RATE: u32 = 9600;

#[cfg(windows)]
pub const DEFAULT_COM_PORT: &str = "COM4";
#[cfg(not(windows))]
pub const DEFAULT_COM_PORT: &str = "/dev/ttyUSB0";

/// Locations of the two configuration sources
#[derive(Debug, Clone)]
pub struct ConfigPaths {
    /// User-edited configuration
    pub user: PathBuf,
    /// Optional internal preferences, merged under the user mapping
    pub internal: PathBuf,
}

/// One slider's targets as written in YAML: a single name or a list
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum TargetList {
    One(String),
    Many(Vec<String>),
}

impl TargetList {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            TargetList::One(name) => vec![name],
            TargetList::Many(names) => names,
        }
    }
}

/// Raw slider mapping as parsed; keys may be YAML integers or strings
pub type RawSliderMapping = HashMap<serde_yaml::Value, TargetList>;

/// Root of `config.yaml`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slider_mapping: Option<RawSliderMapping>,
    #[serde(default)]
    pub invert_sliders: bool,
    #[serde(default = "default_com_port")]
    pub com_port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: i64,
    #[serde(default = "default_noise_reduction")]
    pub noise_reduction: String,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            slider_mapping: None,
            invert_sliders: false,
            com_port: default_com_port(),
            baud_rate: default_baud_rate(),
            noise_reduction: default_noise_reduction(),
        }
    }
}

/// Root of the internal preferences file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PreferencesConfig {
    #[serde(default)]
    pub slider_mapping: RawSliderMapping,
}

/// How aggressively small slider jitter is ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoiseReduction {
    Low,
    #[default]
    Default,
    High,
}

impl NoiseReduction {
    /// Minimum change treated as a real slider movement
    pub fn threshold(self) -> f64 {
        match self {
            NoiseReduction::Low => 0.015,
            NoiseReduction::Default => 0.025,
            NoiseReduction::High => 0.035,
        }
    }

    /// Parse the config value, falling back to `Default` with a warning
    pub fn from_config(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "low" => NoiseReduction::Low,
            "high" => NoiseReduction::High,
            "default" | "" => NoiseReduction::Default,
            other => {
                warn!(
                    "Unknown noise_reduction level '{}', using 'default'",
                    other
                );
                NoiseReduction::Default
            }
        }
    }
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub com_port: String,
    pub baud_rate: u32,
}

/// Merged, validated configuration consumed by the pipeline
#[derive(Debug, Clone)]
pub struct CanonicalConfig {
    pub slider_mapping: SliderMapping,
    pub connection: ConnectionInfo,
    pub invert_sliders: bool,
    pub noise_reduction: NoiseReduction,
}

impl Default for CanonicalConfig {
    fn default() -> Self {
        Self::from_parts(UserConfig::default(), None)
    }
}

impl CanonicalConfig {
    /// Load the user config (required) and the preferences file (optional)
    pub async fn load(paths: &ConfigPaths) -> Result<Self> {
        debug!("Loading user configuration from {}", paths.user.display());

        let user = load_user_config(&paths.user).await?;
        let internal = match load_preferences(&paths.internal).await {
            Ok(prefs) => prefs,
            Err(e) => {
                debug!("Skipping optional internal config: {:#}", e);
                None
            }
        };

        let config = Self::from_parts(user, internal);
        debug!(
            "Configuration populated: {} on {} @ {} baud",
            config.slider_mapping, config.connection.com_port, config.connection.baud_rate
        );
        Ok(config)
    }

    /// Merge parsed sources, replacing invalid values with defaults
    pub fn from_parts(user: UserConfig, internal: Option<PreferencesConfig>) -> Self {
        let user_mapping = match user.slider_mapping {
            Some(raw) => stringify_mapping(raw),
            None => {
                let mut fallback = HashMap::new();
                fallback.insert("0".to_string(), vec![crate::session::MASTER_SESSION_NAME.to_string()]);
                fallback
            }
        };
        let internal_mapping = internal
            .map(|prefs| stringify_mapping(prefs.slider_mapping))
            .unwrap_or_default();

        let slider_mapping = SliderMapping::build(&user_mapping, &internal_mapping);
        if slider_mapping.is_empty() {
            warn!("No sliders are mapped, slider moves will be ignored");
        }

        Self {
            slider_mapping,
            connection: ConnectionInfo {
                com_port: user.com_port,
                baud_rate: validate_baud_rate(user.baud_rate),
            },
            invert_sliders: user.invert_sliders,
            noise_reduction: NoiseReduction::from_config(&user.noise_reduction),
        }
    }
}

async fn load_user_config(path: &Path) -> Result<UserConfig> {
    if !path.exists() {
        warn!("Configuration file not found: {}", path.display());
        anyhow::bail!(
            "Config file not found: {} (it must exist next to deej)",
            path.display()
        );
    }

    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    // An empty file parses as YAML null; treat it as "all defaults"
    if contents.trim().is_empty() {
        return Ok(UserConfig::default());
    }

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse YAML config: {}", path.display()))
}

async fn load_preferences(path: &Path) -> Result<Option<PreferencesConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read preferences: {}", path.display()))?;

    if contents.trim().is_empty() {
        return Ok(None);
    }

    let prefs = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse YAML preferences: {}", path.display()))?;
    Ok(Some(prefs))
}

/// Turn YAML keys (ints or strings) into strings; other key kinds are skipped
fn stringify_mapping(raw: RawSliderMapping) -> HashMap<String, Vec<String>> {
    raw.into_iter()
        .filter_map(|(key, targets)| {
            let key = match key {
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::String(s) => s,
                other => {
                    debug!("Ignoring slider mapping with non-scalar key {:?}", other);
                    return None;
                }
            };
            Some((key, targets.into_vec()))
        })
        .collect()
}

fn validate_baud_rate(baud_rate: i64) -> u32 {
    match u32::try_from(baud_rate) {
        Ok(rate) if rate > 0 => rate,
        _ => {
            warn!(
                "Invalid baud rate {} specified, using default {}",
                baud_rate, DEFAULT_BAUD_RATE
            );
            DEFAULT_BAUD_RATE
        }
    }
}

/// Shared, swappable view of the current configuration
///
/// Readers grab an `Arc` snapshot; a reload replaces the whole
/// [`CanonicalConfig`] (and with it the [`SliderMapping`]) under the lock and
/// then notifies every subscriber in registration order.
#[derive(Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<CanonicalConfig>>>,
    reload_consumers: Arc<Mutex<Vec<mpsc::Sender<Arc<CanonicalConfig>>>>>,
}

impl ConfigHandle {
    pub fn new(config: CanonicalConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            reload_consumers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Snapshot of the active configuration
    pub fn current(&self) -> Arc<CanonicalConfig> {
        Arc::clone(&self.current.read())
    }

    /// Register a reload listener
    ///
    /// The channel holds a single pending notification; a listener that
    /// falls behind delays the publisher rather than losing reloads.
    pub fn subscribe_to_changes(&self) -> mpsc::Receiver<Arc<CanonicalConfig>> {
        let (tx, rx) = mpsc::channel(1);
        self.reload_consumers.lock().push(tx);
        rx
    }

    /// Swap in a freshly loaded configuration and notify listeners
    pub async fn apply(&self, config: CanonicalConfig) {
        let config = Arc::new(config);
        *self.current.write() = Arc::clone(&config);

        info!("Configuration applied: {}", config.slider_mapping);

        let consumers: Vec<_> = self.reload_consumers.lock().clone();
        let mut closed = false;
        for tx in &consumers {
            if tx.send(Arc::clone(&config)).await.is_err() {
                closed = true;
            }
        }

        if closed {
            self.reload_consumers.lock().retain(|tx| !tx.is_closed());
        }
    }
}

// Default value functions
fn default_com_port() -> String { DEFAULT_COM_PORT.to_string() }
fn default_baud_rate() -> i64 { DEFAULT_BAUD_RATE as i64 }
fn default_noise_reduction() -> String { "default".to_string() }
