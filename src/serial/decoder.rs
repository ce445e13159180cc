//! Serial line protocol → debounced slider-move events
//!
//! Each line carries one raw reading per physical slider:
//! `<0-1023>|<0-1023>|...\r\n`. Readings are normalized to two decimals,
//! optionally inverted, and only reported when they differ significantly from
//! the last reported value for that slider.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, trace};

use super::SliderMoveEvent;
use crate::config::{CanonicalConfig, NoiseReduction};

/// Highest raw reading a slider can report
pub const MAX_RAW_VALUE: u16 = 1023;

/// Cached value before a slider's first report; never equal to a real reading
const UNKNOWN_VALUE: f64 = -1.0;

const EDGE_EPSILON: f64 = 1e-6;

static EXPECTED_LINE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,4}(\|\d{1,4})*\r\n$").expect("valid line regex"));

/// Stateful decoder for one serial stream
///
/// Remembers the slider count and the last reported value per slider. A change
/// in slider count (or an explicit [`reset`](Self::reset)) forgets every cached
/// value, so the next line reports all sliders.
#[derive(Debug, Default)]
pub struct LineDecoder {
    last_known_num_sliders: usize,
    current_values: Vec<f64>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the slider count; the next valid line re-reports every slider
    pub fn reset(&mut self) {
        debug!("Resetting slider state");
        self.last_known_num_sliders = 0;
        self.current_values.clear();
    }

    /// Number of sliders seen on the last valid line
    pub fn num_sliders(&self) -> usize {
        self.last_known_num_sliders
    }

    /// Decode one raw line (including its `\r\n`)
    ///
    /// Malformed lines and lines with any out-of-range reading produce no
    /// events and leave the cached values untouched. Events come out in
    /// ascending slider order.
    pub fn process_line(&mut self, line: &str, config: &CanonicalConfig) -> Vec<SliderMoveEvent> {
        if !EXPECTED_LINE_PATTERN.is_match(line) {
            trace!("Dropping malformed line {:?}", line);
            return Vec::new();
        }

        let mut readings = Vec::new();
        for field in line.trim_end_matches("\r\n").split('|') {
            match field.parse::<u16>() {
                Ok(raw) if raw <= MAX_RAW_VALUE => readings.push(raw),
                _ => {
                    debug!("Invalid slider value {:?} in line {:?}", field, line);
                    return Vec::new();
                }
            }
        }

        if readings.len() != self.last_known_num_sliders {
            info!("🎛️  Detected sliders: {}", readings.len());
            self.last_known_num_sliders = readings.len();
            self.current_values = vec![UNKNOWN_VALUE; readings.len()];
        }

        let mut events = Vec::new();
        for (slider_id, raw) in readings.into_iter().enumerate() {
            let mut value = normalize(raw);
            if config.invert_sliders {
                value = invert(value);
            }

            if significantly_different(self.current_values[slider_id], value, config.noise_reduction) {
                self.current_values[slider_id] = value;
                events.push(SliderMoveEvent {
                    slider_id,
                    percent_value: value as f32,
                });
            }
        }

        events
    }
}

/// Scale a raw reading into [0, 1], truncated to two decimals
pub fn normalize(raw: u16) -> f64 {
    let scaled = f64::from(raw.min(MAX_RAW_VALUE)) / f64::from(MAX_RAW_VALUE);
    (scaled * 100.0).floor() / 100.0
}

pub fn invert(value: f64) -> f64 {
    1.0 - value
}

/// Whether `new` should be reported given the last reported `old`
///
/// Moves of at least the noise threshold count. So does reaching either end
/// of the range from anywhere else, so a slider can always hit 0 and 1.
pub fn significantly_different(old: f64, new: f64, noise: NoiseReduction) -> bool {
    if (old - new).abs() >= noise.threshold() {
        return true;
    }

    (almost_equals(new, 1.0) && !almost_equals(old, 1.0))
        || (almost_equals(new, 0.0) && !almost_equals(old, 0.0))
}

fn almost_equals(a: f64, b: f64) -> bool {
    (a - b).abs() < EDGE_EPSILON
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(invert_sliders: bool, noise_reduction: NoiseReduction) -> CanonicalConfig {
        CanonicalConfig {
            invert_sliders,
            noise_reduction,
            ..CanonicalConfig::default()
        }
    }

    fn pairs(events: &[SliderMoveEvent]) -> Vec<(usize, f32)> {
        events.iter().map(|e| (e.slider_id, e.percent_value)).collect()
    }

    #[test]
    fn test_normalize_truncates() {
        assert_eq!(normalize(0), 0.0);
        assert_eq!(normalize(511), 0.49);
        assert_eq!(normalize(512), 0.50);
        assert_eq!(normalize(1023), 1.0);
    }

    #[test]
    fn test_first_line_reports_every_slider() {
        let mut decoder = LineDecoder::new();
        let config = CanonicalConfig::default();

        let events = decoder.process_line("512|1023\r\n", &config);

        assert_eq!(pairs(&events), vec![(0, 0.50), (1, 1.00)]);
        assert_eq!(decoder.num_sliders(), 2);
    }

    #[test]
    fn test_malformed_lines_dropped() {
        let mut decoder = LineDecoder::new();
        let config = CanonicalConfig::default();

        for line in [
            "512|1023",
            "512|1023\n",
            "512||1023\r\n",
            "abc\r\n",
            "12345\r\n",
            "\r\n",
            "512|-3\r\n",
        ] {
            assert!(decoder.process_line(line, &config).is_empty(), "{:?}", line);
        }
        assert_eq!(decoder.num_sliders(), 0);
    }

    #[test]
    fn test_out_of_range_invalidates_whole_line() {
        let mut decoder = LineDecoder::new();
        let config = CanonicalConfig::default();

        assert!(decoder.process_line("100|1024|300\r\n", &config).is_empty());
        assert!(decoder.process_line("9999\r\n", &config).is_empty());

        // nothing was cached from the rejected line
        let events = decoder.process_line("100|200|300\r\n", &config);
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn test_noise_threshold() {
        let mut decoder = LineDecoder::new();
        let config = CanonicalConfig::default();

        decoder.process_line("512\r\n", &config);
        // 0.52: below the 0.025 default threshold
        assert!(decoder.process_line("532\r\n", &config).is_empty());
        // 0.53
        assert_eq!(pairs(&decoder.process_line("543\r\n", &config)), vec![(0, 0.53)]);
    }

    #[test]
    fn test_significance_levels() {
        assert!(significantly_different(0.50, 0.525, NoiseReduction::Default));
        assert!(!significantly_different(0.50, 0.524, NoiseReduction::Default));
        assert!(!significantly_different(0.50, 0.52, NoiseReduction::Default));
        assert!(significantly_different(0.50, 0.52, NoiseReduction::Low));
        assert!(!significantly_different(0.50, 0.53, NoiseReduction::High));
        assert!(significantly_different(0.50, 0.54, NoiseReduction::High));
    }

    #[test]
    fn test_edges_always_reachable() {
        assert!(significantly_different(0.99, 1.0, NoiseReduction::High));
        assert!(significantly_different(0.01, 0.0, NoiseReduction::High));
        assert!(!significantly_different(1.0, 1.0, NoiseReduction::Low));
        assert!(!significantly_different(0.0, 0.0, NoiseReduction::Low));
        assert!(significantly_different(UNKNOWN_VALUE, 0.0, NoiseReduction::Default));
    }

    #[test]
    fn test_slider_count_change_resets() {
        let mut decoder = LineDecoder::new();
        let config = CanonicalConfig::default();

        decoder.process_line("0|0\r\n", &config);
        let events = decoder.process_line("0|0|0\r\n", &config);

        assert_eq!(pairs(&events), vec![(0, 0.0), (1, 0.0), (2, 0.0)]);
    }

    #[test]
    fn test_reset_rereports() {
        let mut decoder = LineDecoder::new();
        let config = CanonicalConfig::default();

        decoder.process_line("300|700\r\n", &config);
        assert!(decoder.process_line("300|700\r\n", &config).is_empty());

        decoder.reset();
        assert_eq!(decoder.process_line("300|700\r\n", &config).len(), 2);
    }

    #[test]
    fn test_inverted_sliders() {
        let mut decoder = LineDecoder::new();
        let config = config(true, NoiseReduction::Default);

        let events = decoder.process_line("0|1023\r\n", &config);

        assert_eq!(pairs(&events), vec![(0, 1.0), (1, 0.0)]);
    }

    proptest! {
        #[test]
        fn prop_normalize_in_range_and_rounded(raw in 0u16..=MAX_RAW_VALUE) {
            let value = normalize(raw);
            prop_assert!((0.0..=1.0).contains(&value));
            let cents = value * 100.0;
            prop_assert!((cents - cents.round()).abs() < 1e-9);
            prop_assert!(value <= f64::from(raw) / f64::from(MAX_RAW_VALUE));
        }

        #[test]
        fn prop_repeated_line_is_silent(values in prop::collection::vec(0u16..=MAX_RAW_VALUE, 1..8)) {
            let line = format!(
                "{}\r\n",
                values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("|")
            );
            let config = CanonicalConfig::default();
            let mut decoder = LineDecoder::new();

            prop_assert_eq!(decoder.process_line(&line, &config).len(), values.len());
            prop_assert!(decoder.process_line(&line, &config).is_empty());
        }

        #[test]
        fn prop_invert_is_involution(raw in 0u16..=MAX_RAW_VALUE) {
            let value = normalize(raw);
            prop_assert!((invert(invert(value)) - value).abs() < 1e-9);
        }
    }
}
