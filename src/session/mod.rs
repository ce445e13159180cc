//! Audio sessions and the capabilities the core needs from a platform backend
//!
//! A [`Session`] is one controllable volume endpoint (a process, a device, or
//! the master/mic channel). A [`SessionFinder`] enumerates them. The
//! [`SessionRegistry`] caches what the finder reports and applies slider
//! moves; the [`TargetResolver`] turns configured names into session keys.

pub mod console;
pub mod foreground;
pub mod pulse;
pub mod registry;
pub mod resolver;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use console::ConsoleSessionFinder;
pub use foreground::{CooldownForeground, ForegroundProvider};
pub use pulse::PulseSessionFinder;
pub use registry::SessionRegistry;
pub use resolver::TargetResolver;

/// Master output device volume
pub const MASTER_SESSION_NAME: &str = "master";
/// System sounds volume
pub const SYSTEM_SESSION_NAME: &str = "system";
/// Default input device level
pub const INPUT_SESSION_NAME: &str = "mic";

/// Errors surfaced by session backends
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("audio backend command failed: {0}")]
    Backend(String),

    #[error("session '{0}' no longer exists")]
    Gone(String),

    #[error("failed to parse backend output: {0}")]
    Parse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single addressable audio session
///
/// Implementations use interior mutability; all methods take `&self` so
/// sessions can be shared as `Arc<dyn Session>`.
#[async_trait]
pub trait Session: Send + Sync + fmt::Debug {
    /// Stable lowercase identifier (process name, device name, or reserved word)
    fn key(&self) -> &str;

    /// Current volume in [0, 1]
    async fn volume(&self) -> f32;

    /// Set the volume, `v` in [0, 1]
    async fn set_volume(&self, v: f32) -> Result<(), SessionError>;

    /// Release backend resources held by this session
    fn release(&self);
}

/// Callback invoked by a finder when the platform reports a device change
pub type DeviceChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Result of one discovery pass
///
/// Backends may find some sessions and still fail on others; both are kept
/// so the registry can use what was found and log the rest.
#[derive(Debug, Default)]
pub struct Discovery {
    pub sessions: Vec<Arc<dyn Session>>,
    pub errors: Vec<SessionError>,
}

/// Platform session enumeration capability
#[async_trait]
pub trait SessionFinder: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Enumerate every session currently visible to the backend
    ///
    /// A hard `Err` means nothing usable was found.
    async fn get_all_sessions(&self) -> Result<Discovery, SessionError>;

    /// Release backend resources
    async fn release(&self) -> Result<(), SessionError>;

    /// Subscribe to default-device / device-list change notifications
    ///
    /// Default implementation: no-op (backend doesn't report device changes)
    fn subscribe_device_changes(&self, _callback: DeviceChangeCallback) {}
}

/// Which finder to use, chosen once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Backend {
    /// PulseAudio on Linux, console elsewhere
    #[default]
    Auto,
    /// PulseAudio / PipeWire via `pactl`
    Pulse,
    /// In-memory sessions that only log volume changes
    Console,
}

/// Build the session finder for this platform
pub fn new_session_finder(backend: Backend) -> Arc<dyn SessionFinder> {
    match backend {
        Backend::Pulse => Arc::new(PulseSessionFinder::new()),
        Backend::Console => Arc::new(ConsoleSessionFinder::with_default_sessions()),
        Backend::Auto => {
            if cfg!(target_os = "linux") {
                Arc::new(PulseSessionFinder::new())
            } else {
                tracing::warn!(
                    "No native audio backend for this platform, volume changes will only be logged"
                );
                Arc::new(ConsoleSessionFinder::with_default_sessions())
            }
        }
    }
}
