//! Console backend - in-memory sessions that log every volume change
//!
//! This is useful for:
//! - Running deej on a platform without a native audio backend
//! - Testing slider mappings without touching real volumes
//! - Development without audio hardware

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::{
    Discovery, Session, SessionError, SessionFinder, INPUT_SESSION_NAME, MASTER_SESSION_NAME,
    SYSTEM_SESSION_NAME,
};

/// One simulated endpoint; its volume survives registry refreshes
#[derive(Debug)]
struct Endpoint {
    key: String,
    volume: Arc<Mutex<f32>>,
}

/// Finder that hands out [`ConsoleSession`]s for a fixed endpoint list
pub struct ConsoleSessionFinder {
    endpoints: Mutex<Vec<Endpoint>>,
    discovery_count: AtomicU64,
}

impl ConsoleSessionFinder {
    /// Create a finder exposing the given session keys at full volume
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let finder = Self {
            endpoints: Mutex::new(Vec::new()),
            discovery_count: AtomicU64::new(0),
        };
        finder.set_endpoints(keys);
        finder
    }

    /// master, mic and system sounds
    pub fn with_default_sessions() -> Self {
        Self::new([MASTER_SESSION_NAME, INPUT_SESSION_NAME, SYSTEM_SESSION_NAME])
    }

    /// Replace the simulated endpoints (seen on the next discovery)
    pub fn set_endpoints<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        *self.endpoints.lock() = keys
            .into_iter()
            .map(|key| Endpoint {
                key: key.into().to_lowercase(),
                volume: Arc::new(Mutex::new(1.0)),
            })
            .collect();
    }

    /// Number of discovery passes served so far
    pub fn discovery_count(&self) -> u64 {
        self.discovery_count.load(Ordering::SeqCst)
    }

    /// Current simulated volume of the first endpoint with this key
    pub fn volume_of(&self, key: &str) -> Option<f32> {
        self.endpoints
            .lock()
            .iter()
            .find(|e| e.key == key)
            .map(|e| *e.volume.lock())
    }
}

#[async_trait]
impl SessionFinder for ConsoleSessionFinder {
    fn name(&self) -> &str {
        "console"
    }

    async fn get_all_sessions(&self) -> Result<Discovery, SessionError> {
        let count = self.discovery_count.fetch_add(1, Ordering::SeqCst) + 1;

        let sessions: Vec<Arc<dyn Session>> = self
            .endpoints
            .lock()
            .iter()
            .map(|e| {
                Arc::new(ConsoleSession {
                    key: e.key.clone(),
                    volume: Arc::clone(&e.volume),
                    released: AtomicBool::new(false),
                }) as Arc<dyn Session>
            })
            .collect();

        debug!(
            "Console discovery #{} returned {} sessions",
            count,
            sessions.len()
        );

        Ok(Discovery {
            sessions,
            errors: Vec::new(),
        })
    }

    async fn release(&self) -> Result<(), SessionError> {
        info!("Console session finder released");
        Ok(())
    }
}

/// Session whose volume lives in memory
#[derive(Debug)]
pub struct ConsoleSession {
    key: String,
    volume: Arc<Mutex<f32>>,
    released: AtomicBool,
}

impl ConsoleSession {
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for ConsoleSession {
    fn key(&self) -> &str {
        &self.key
    }

    async fn volume(&self) -> f32 {
        *self.volume.lock()
    }

    async fn set_volume(&self, v: f32) -> Result<(), SessionError> {
        if self.is_released() {
            return Err(SessionError::Gone(self.key.clone()));
        }

        *self.volume.lock() = v.clamp(0.0, 1.0);
        info!(
            "🎚️  [{}] {} → {:.2}",
            chrono::Local::now().format("%H:%M:%S%.3f"),
            self.key,
            v
        );
        Ok(())
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        debug!("Releasing console session {}", self.key);
    }
}
