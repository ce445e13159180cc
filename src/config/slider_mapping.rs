//! Slider index → ordered target list
//!
//! Built once per configuration load by merging the user mapping with the
//! internal (preferences) mapping, then swapped in wholesale on reload.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::debug;

use crate::session::MASTER_SESSION_NAME;

/// Physical slider position on the board, 0-based
pub type SliderIndex = usize;

/// Thread-safe slider → targets table
///
/// Readers take a shared lock; `set` takes the exclusive lock. No operation
/// performs I/O while holding either.
#[derive(Default)]
pub struct SliderMapping {
    m: RwLock<HashMap<SliderIndex, Vec<String>>>,
}

impl SliderMapping {
    /// Create an empty mapping
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapping used when the user config provides none: slider 0 → master
    pub fn default_mapping() -> Self {
        let mapping = Self::new();
        mapping.set(0, vec![MASTER_SESSION_NAME.to_string()]);
        mapping
    }

    /// Merge the user mapping with the internal mapping
    ///
    /// User targets are taken as-is (minus empty strings). Internal targets
    /// are appended only when not already present for that slider. Keys that
    /// don't parse as a slider index are dropped.
    pub fn build(
        user: &HashMap<String, Vec<String>>,
        internal: &HashMap<String, Vec<String>>,
    ) -> Self {
        let mapping = Self::new();

        for (idx, targets) in parse_indices(user) {
            let filtered: Vec<String> = targets
                .iter()
                .map(|t| normalize_target(t))
                .filter(|t| !t.is_empty())
                .collect();
            mapping.set(idx, filtered);
        }

        for (idx, targets) in parse_indices(internal) {
            let mut merged = mapping.get(idx).unwrap_or_default();
            for target in targets.iter().map(|t| normalize_target(t)) {
                if !target.is_empty() && !merged.contains(&target) {
                    merged.push(target);
                }
            }
            mapping.set(idx, merged);
        }

        mapping
    }

    /// Targets for a slider, `None` when the slider isn't mapped
    pub fn get(&self, index: SliderIndex) -> Option<Vec<String>> {
        self.m.read().get(&index).cloned()
    }

    /// Replace the targets for a slider
    pub fn set(&self, index: SliderIndex, targets: Vec<String>) {
        self.m.write().insert(index, targets);
    }

    /// Read-only traversal of every mapped slider
    ///
    /// The shared lock is held for the duration of the traversal, so `f` must
    /// not call back into `set`.
    pub fn iterate<F>(&self, mut f: F)
    where
        F: FnMut(SliderIndex, &[String]),
    {
        let guard = self.m.read();
        for (idx, targets) in guard.iter() {
            f(*idx, targets);
        }
    }

    /// Number of mapped sliders
    pub fn len(&self) -> usize {
        self.m.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.m.read().is_empty()
    }
}

impl Clone for SliderMapping {
    fn clone(&self) -> Self {
        Self {
            m: RwLock::new(self.m.read().clone()),
        }
    }
}

impl fmt::Debug for SliderMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.m.read().iter()).finish()
    }
}

impl fmt::Display for SliderMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.m.read();
        let targets: usize = guard.values().map(Vec::len).sum();
        write!(f, "<{} sliders mapped to {} targets>", guard.len(), targets)
    }
}

/// Parse slider keys, dropping the ones that aren't indices
///
/// Sorted by index so that duplicate spellings ("1" and "01") resolve the
/// same way on every load.
fn parse_indices(raw: &HashMap<String, Vec<String>>) -> BTreeMap<SliderIndex, &Vec<String>> {
    let mut parsed = BTreeMap::new();
    let mut keys: Vec<&String> = raw.keys().collect();
    keys.sort();

    for key in keys {
        match key.trim().parse::<SliderIndex>() {
            Ok(idx) => {
                parsed.insert(idx, &raw[key]);
            }
            Err(_) => debug!("Ignoring slider mapping with invalid index '{}'", key),
        }
    }

    parsed
}

fn normalize_target(target: &str) -> String {
    target.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(entries: &[(&str, &[&str])]) -> HashMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn test_merge_filters_empty_and_appends_missing() {
        let user = raw(&[("0", &["a", ""])]);
        let internal = raw(&[("0", &["b"])]);

        let mapping = SliderMapping::build(&user, &internal);

        assert_eq!(mapping.get(0), Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_merge_does_not_duplicate_user_targets() {
        let user = raw(&[("1", &["chrome.exe", "spotify.exe"])]);
        let internal = raw(&[("1", &["spotify.exe", "", "discord.exe"])]);

        let mapping = SliderMapping::build(&user, &internal);

        assert_eq!(
            mapping.get(1),
            Some(vec![
                "chrome.exe".to_string(),
                "spotify.exe".to_string(),
                "discord.exe".to_string()
            ])
        );
    }

    #[test]
    fn test_internal_only_slider() {
        let mapping = SliderMapping::build(&HashMap::new(), &raw(&[("3", &["mic"])]));

        assert_eq!(mapping.get(3), Some(vec!["mic".to_string()]));
        assert_eq!(mapping.get(0), None);
    }

    #[test]
    fn test_invalid_indices_dropped() {
        let user = raw(&[("zero", &["master"]), ("-1", &["mic"]), (" 2 ", &["system"])]);

        let mapping = SliderMapping::build(&user, &HashMap::new());

        assert_eq!(mapping.len(), 1);
        assert_eq!(mapping.get(2), Some(vec!["system".to_string()]));
    }

    #[test]
    fn test_targets_lowercased() {
        let user = raw(&[("0", &["Chrome.EXE"])]);

        let mapping = SliderMapping::build(&user, &HashMap::new());

        assert_eq!(mapping.get(0), Some(vec!["chrome.exe".to_string()]));
    }

    #[test]
    fn test_default_mapping() {
        let mapping = SliderMapping::default_mapping();

        assert_eq!(mapping.get(0), Some(vec!["master".to_string()]));
        assert_eq!(mapping.len(), 1);
    }

    #[test]
    fn test_iterate_and_display() {
        let user = raw(&[("0", &["master"]), ("1", &["a", "b"])]);
        let mapping = SliderMapping::build(&user, &HashMap::new());

        let mut total = 0;
        mapping.iterate(|_, targets| total += targets.len());

        assert_eq!(total, 3);
        assert_eq!(mapping.to_string(), "<2 sliders mapped to 3 targets>");
    }

    #[test]
    fn test_set_replaces() {
        let mapping = SliderMapping::default_mapping();
        mapping.set(0, vec!["mic".to_string()]);

        assert_eq!(mapping.get(0), Some(vec!["mic".to_string()]));
    }
}
