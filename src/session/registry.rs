//! Session registry - cached audio sessions, refresh policy, volume application
//!
//! The registry caches `key → [Session]` from the platform finder. It goes
//! stale when the finder reports a device change or when the last refresh is
//! older than [`MAX_TIME_BETWEEN_REFRESHES`]. Scheduled refreshes are
//! rate-limited to one per [`MIN_TIME_BETWEEN_REFRESHES`]; forced ones are not.
//!
//! ## Locking
//! A single mutex guards the snapshot. Discovery runs with the lock released;
//! the staged result is swapped in under the lock, where the previous
//! sessions are released before they are replaced. Every refresh takes a
//! generation number when it starts, and a result older than the installed
//! one is discarded, so overlapping refreshes never roll the snapshot back.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::foreground::CooldownForeground;
use super::resolver::TargetResolver;
use super::{
    DeviceChangeCallback, Session, SessionError, SessionFinder, INPUT_SESSION_NAME,
    MASTER_SESSION_NAME, SYSTEM_SESSION_NAME,
};
use crate::config::ConfigHandle;
use crate::serial::SliderMoveEvent;

/// Scheduled refreshes closer together than this are skipped
pub const MIN_TIME_BETWEEN_REFRESHES: Duration = Duration::from_secs(5);
/// Older snapshots are refreshed before applying a slider move
pub const MAX_TIME_BETWEEN_REFRESHES: Duration = Duration::from_secs(45);

/// Friendly device names, e.g. "Headphones (Realtek Audio)"
static DEVICE_SESSION_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.+ \(.+\)$").expect("valid device key regex"));

type SessionMap = HashMap<String, Vec<Arc<dyn Session>>>;

/// Coarse registry lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    /// Never successfully populated
    Empty,
    Populated,
    /// Populated, but a device changed or the snapshot aged out
    Stale,
}

/// What happened while applying one slider move
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveOutcome {
    /// At least one resolved key had cached sessions
    pub target_found: bool,
    /// At least one `set_volume` call failed
    pub adjustment_failed: bool,
}

#[derive(Default)]
struct Snapshot {
    sessions: SessionMap,
    last_refresh: Option<Instant>,
    populated: bool,
    /// Handed to the most recently started refresh
    started_generation: u64,
    /// Generation of the installed sessions
    installed_generation: u64,
}

/// Cache of discovered sessions keyed by lowercase session key
pub struct SessionRegistry {
    finder: Arc<dyn SessionFinder>,
    config: ConfigHandle,
    resolver: TargetResolver,
    snapshot: Mutex<Snapshot>,
    device_changed: Arc<AtomicBool>,
}

impl SessionRegistry {
    pub fn new(
        finder: Arc<dyn SessionFinder>,
        config: ConfigHandle,
        foreground: Arc<CooldownForeground>,
    ) -> Self {
        debug!("Created session registry using '{}' backend", finder.name());
        Self {
            finder,
            config,
            resolver: TargetResolver::new(foreground),
            snapshot: Mutex::new(Snapshot::default()),
            device_changed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to device changes and perform the first population
    pub async fn initialize(&self) -> Result<(), SessionError> {
        let flag = Arc::clone(&self.device_changed);
        let callback: DeviceChangeCallback = Arc::new(move || {
            flag.store(true, Ordering::SeqCst);
        });
        self.finder.subscribe_device_changes(callback);

        let generation = self.begin_refresh(true).unwrap_or_default();
        let count = self.populate(generation).await.map_err(|e| {
            warn!("Failed to get all sessions during session registry initialization: {}", e);
            e
        })?;

        info!("Session registry initialized with {} sessions", count);
        Ok(())
    }

    /// Release every cached session and the finder itself
    pub async fn release(&self) -> Result<(), SessionError> {
        let previous = std::mem::take(&mut self.snapshot.lock().sessions);
        release_all(previous);

        self.finder.release().await.map_err(|e| {
            warn!("Failed to release session finder: {}", e);
            e
        })
    }

    /// Re-acquire all sessions
    ///
    /// Unforced calls within [`MIN_TIME_BETWEEN_REFRESHES`] of the previous
    /// refresh are no-ops. Returns whether the finder was queried. On
    /// discovery failure the previous sessions stay in place.
    pub async fn refresh(&self, force: bool) -> bool {
        let Some(generation) = self.begin_refresh(force) else {
            trace!("Skipping session refresh (cooldown)");
            return false;
        };

        match self.populate(generation).await {
            Ok(_) => debug!("Re-acquired sessions successfully"),
            Err(e) => warn!("Failed to re-acquire all audio sessions: {}", e),
        }
        true
    }

    /// Apply a slider move to every session its targets resolve to
    pub async fn on_slider_move(&self, event: &SliderMoveEvent) -> MoveOutcome {
        if self.state() != RegistryState::Populated {
            debug!("Stale session map detected on slider move, refreshing");
            self.refresh(true).await;
        }

        let config = self.config.current();
        let Some(targets) = config.slider_mapping.get(event.slider_id) else {
            trace!("No targets mapped for slider {}", event.slider_id);
            return MoveOutcome::default();
        };

        let mut outcome = MoveOutcome::default();

        for target in &targets {
            for key in self.resolver.resolve(target).await {
                let Some(sessions) = self.get(&key) else {
                    continue;
                };

                outcome.target_found = true;

                for session in sessions {
                    if session.volume().await == event.percent_value {
                        continue;
                    }
                    if let Err(e) = session.set_volume(event.percent_value).await {
                        warn!("Failed to set target session volume for {}: {}", key, e);
                        outcome.adjustment_failed = true;
                    }
                }
            }
        }

        if !outcome.target_found {
            self.refresh(false).await;
        } else if outcome.adjustment_failed {
            self.refresh(true).await;
        }

        outcome
    }

    /// Mapping semantics may have changed which keys matter
    pub async fn on_config_reload(&self) {
        info!("Detected config reload, attempting to re-acquire all audio sessions");
        self.refresh(false).await;
    }

    pub fn state(&self) -> RegistryState {
        let snapshot = self.snapshot.lock();
        if !snapshot.populated {
            return RegistryState::Empty;
        }

        let aged_out = snapshot
            .last_refresh
            .map_or(true, |at| at.elapsed() > MAX_TIME_BETWEEN_REFRESHES);

        if aged_out || self.device_changed.load(Ordering::SeqCst) {
            RegistryState::Stale
        } else {
            RegistryState::Populated
        }
    }

    /// Cached sessions for a key
    pub fn get(&self, key: &str) -> Option<Vec<Arc<dyn Session>>> {
        self.snapshot.lock().sessions.get(key).cloned()
    }

    /// All cached keys, sorted
    pub fn snapshot_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.snapshot.lock().sessions.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys no slider claimed as of the last population
    pub fn unmapped_keys(&self) -> Vec<String> {
        self.resolver.unmapped_keys()
    }

    pub fn resolver(&self) -> &TargetResolver {
        &self.resolver
    }

    /// Check the cooldown, stamp the refresh time and take a generation
    ///
    /// The stamp happens before discovery so concurrent callers see the
    /// refresh as already in progress, and a failing backend is retried at
    /// most once per cooldown. `None` means the cooldown skipped this refresh.
    fn begin_refresh(&self, force: bool) -> Option<u64> {
        let mut snapshot = self.snapshot.lock();
        let now = Instant::now();

        if !force {
            if let Some(last) = snapshot.last_refresh {
                if now < last + MIN_TIME_BETWEEN_REFRESHES {
                    return None;
                }
            }
        }

        snapshot.last_refresh = Some(now);
        snapshot.started_generation += 1;
        self.device_changed.store(false, Ordering::SeqCst);
        Some(snapshot.started_generation)
    }

    /// Query the finder and swap the result in, unless a newer refresh won
    async fn populate(&self, generation: u64) -> Result<usize, SessionError> {
        let discovery = self.finder.get_all_sessions().await?;

        for e in &discovery.errors {
            warn!("Partial session discovery failure: {}", e);
        }

        let mut staged: SessionMap = HashMap::new();
        let count = discovery.sessions.len();
        for session in discovery.sessions {
            staged
                .entry(session.key().to_lowercase())
                .or_default()
                .push(session);
        }

        let unmapped = self.compute_unmapped(&staged);
        for key in &unmapped {
            debug!("Tracking unmapped session {}", key);
        }

        {
            let mut snapshot = self.snapshot.lock();

            if generation < snapshot.installed_generation {
                debug!(
                    "Discarding discovery #{} superseded by #{}",
                    generation, snapshot.installed_generation
                );
                drop(snapshot);
                release_all(staged);
                return Ok(count);
            }

            debug!("Releasing and clearing all audio sessions");
            let previous = std::mem::replace(&mut snapshot.sessions, staged);
            release_all(previous);
            snapshot.populated = true;
            snapshot.installed_generation = generation;

            // published under the snapshot lock so both come from one population
            self.resolver.set_unmapped(unmapped);
        }

        info!("Got all audio sessions successfully: {}", self);

        Ok(count)
    }

    /// Keys not covered by a reserved name, a device name, or a literal target
    fn compute_unmapped(&self, sessions: &SessionMap) -> Vec<String> {
        let config = self.config.current();

        let mut literal_targets = HashSet::new();
        config.slider_mapping.iterate(|_, targets| {
            for target in targets {
                if let Some(key) = TargetResolver::resolve_literal(target) {
                    literal_targets.insert(key);
                }
            }
        });

        sessions
            .keys()
            .filter(|key| !is_reserved_or_device(key) && !literal_targets.contains(*key))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl fmt::Display for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count: usize = self.snapshot.lock().sessions.values().map(Vec::len).sum();
        write!(f, "<{} audio sessions>", count)
    }
}

fn is_reserved_or_device(key: &str) -> bool {
    [MASTER_SESSION_NAME, SYSTEM_SESSION_NAME, INPUT_SESSION_NAME].contains(&key)
        || DEVICE_SESSION_KEY_PATTERN.is_match(key)
}

fn release_all(sessions: SessionMap) {
    for session in sessions.into_values().flatten() {
        session.release();
    }
}
