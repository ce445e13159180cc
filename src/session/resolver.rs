//! Configured target name → session keys

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

use super::foreground::CooldownForeground;

/// Prefix marking a dynamically resolved target
pub const SPECIAL_TARGET_PREFIX: &str = "deej.";
/// `deej.current`: whatever process owns the focused window
pub const SPECIAL_TARGET_CURRENT: &str = "current";
/// `deej.unmapped`: every session no slider claims
pub const SPECIAL_TARGET_UNMAPPED: &str = "unmapped";

/// Expands target names, including the `deej.` transforms
///
/// The unmapped-key set is owned by the registry and published here after
/// each population; resolution only ever reads it.
#[derive(Clone)]
pub struct TargetResolver {
    foreground: Arc<CooldownForeground>,
    unmapped: Arc<RwLock<Vec<String>>>,
}

impl TargetResolver {
    pub fn new(foreground: Arc<CooldownForeground>) -> Self {
        Self {
            foreground,
            unmapped: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Lowercased literal key, or `None` for special targets
    pub fn resolve_literal(target: &str) -> Option<String> {
        let target = target.to_lowercase();
        if target.starts_with(SPECIAL_TARGET_PREFIX) {
            None
        } else {
            Some(target)
        }
    }

    /// Resolve one configured name into zero or more session keys
    pub async fn resolve(&self, target: &str) -> Vec<String> {
        let target = target.to_lowercase();

        let Some(special) = target.strip_prefix(SPECIAL_TARGET_PREFIX) else {
            return vec![target];
        };

        let keys = match special {
            SPECIAL_TARGET_CURRENT => self.foreground.process_names().await,
            SPECIAL_TARGET_UNMAPPED => self.unmapped_keys(),
            _ => Vec::new(),
        };

        trace!("Resolved special target '{}' to {:?}", target, keys);
        keys
    }

    /// Keys that were unmapped as of the last registry population
    pub fn unmapped_keys(&self) -> Vec<String> {
        self.unmapped.read().clone()
    }

    pub(crate) fn set_unmapped(&self, keys: Vec<String>) {
        *self.unmapped.write() = keys;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::foreground::ForegroundProvider;
    use async_trait::async_trait;

    struct Focused(&'static [&'static str]);

    #[async_trait]
    impl ForegroundProvider for Focused {
        async fn current_process_names(&self) -> anyhow::Result<Vec<String>> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    fn resolver(focused: &'static [&'static str]) -> TargetResolver {
        TargetResolver::new(Arc::new(CooldownForeground::new(Arc::new(Focused(focused)))))
    }

    #[tokio::test]
    async fn test_literal_targets_lowercased() {
        let resolver = resolver(&[]);

        assert_eq!(resolver.resolve("Chrome.exe").await, vec!["chrome.exe"]);
        assert_eq!(
            resolver.resolve("Speakers (Realtek Audio)").await,
            vec!["speakers (realtek audio)"]
        );
    }

    #[tokio::test]
    async fn test_current_uses_foreground() {
        let resolver = resolver(&["Game.exe", "game.exe"]);

        assert_eq!(resolver.resolve("deej.current").await, vec!["game.exe"]);
        assert_eq!(resolver.resolve("DEEJ.Current").await, vec!["game.exe"]);
    }

    #[tokio::test]
    async fn test_unmapped_and_unknown_specials() {
        let resolver = resolver(&[]);
        resolver.set_unmapped(vec!["discord.exe".to_string(), "vlc".to_string()]);

        assert_eq!(resolver.resolve("deej.unmapped").await, vec!["discord.exe", "vlc"]);
        assert!(resolver.resolve("deej.nonsense").await.is_empty());
        assert!(resolver.resolve("deej.").await.is_empty());
    }

    #[test]
    fn test_literal_helpers() {
        assert_eq!(TargetResolver::resolve_literal("Deej.Unmapped"), None);
        assert_eq!(TargetResolver::resolve_literal("MIC"), Some("mic".to_string()));
        assert_eq!(TargetResolver::resolve_literal("deej.current"), None);
    }
}
