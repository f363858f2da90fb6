use std::env;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_RNG_SEED: u32 = 42;
pub const DEFAULT_REGRESSION_ORDER: usize = 4;

/// Build-time options handed to `initiate_calculation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// MT19937 seed; the generator takes a 32-bit seed.
    pub rng_seed: u32,
    pub use_double_precision: bool,
    pub regression_order: usize,
    pub debug: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rng_seed: DEFAULT_RNG_SEED,
            use_double_precision: true,
            regression_order: DEFAULT_REGRESSION_ORDER,
            debug: false,
        }
    }
}

impl Settings {
    /// Defaults overridden by `MCGRAPH_RNG_SEED`, `MCGRAPH_DOUBLE_PRECISION`,
    /// `MCGRAPH_REGRESSION_ORDER` and `MCGRAPH_DEBUG` when set.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        if let Some(value) = env_value("MCGRAPH_RNG_SEED") {
            match parse_seed(&value) {
                Some(seed) => settings.rng_seed = seed,
                None => warn!(
                    value = %value,
                    "ignoring MCGRAPH_RNG_SEED, expected an integer in 0..=4294967295"
                ),
            }
        }
        if let Some(value) = env_value("MCGRAPH_DOUBLE_PRECISION") {
            settings.use_double_precision = parse_bool(&value);
        }
        if let Some(order) = env_value("MCGRAPH_REGRESSION_ORDER").and_then(|v| v.parse().ok()) {
            settings.regression_order = order;
        }
        if let Some(value) = env_value("MCGRAPH_DEBUG") {
            settings.debug = parse_bool(&value);
        }
        settings
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_regression_order(mut self, order: usize) -> Self {
        self.regression_order = order;
        self
    }

    pub fn with_rng_seed(mut self, seed: u32) -> Self {
        self.rng_seed = seed;
        self
    }

    pub fn precision(&self) -> Precision {
        if self.use_double_precision {
            Precision::Double
        } else {
            Precision::Single
        }
    }
}

/// Arithmetic width used for path-local values inside a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Precision {
    Single,
    Double,
}

impl Precision {
    /// Rounds a path-local result to the configured width.
    #[inline]
    pub fn round(self, value: f64) -> f64 {
        match self {
            Precision::Double => value,
            Precision::Single => value as f32 as f64,
        }
    }
}

pub fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Parses a generator seed. Values outside `u32` are rejected rather than truncated.
pub fn parse_seed(value: &str) -> Option<u32> {
    value.trim().parse().ok()
}

fn env_value(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", " on "] {
            assert!(parse_bool(value), "{value}");
        }
        for value in ["0", "false", "off", "maybe"] {
            assert!(!parse_bool(value), "{value}");
        }
    }

    #[test]
    fn seeds_beyond_u32_are_rejected() {
        assert_eq!(parse_seed(" 4294967295 "), Some(u32::MAX));
        assert_eq!(parse_seed("4294967296"), None);
        assert_eq!(parse_seed("-1"), None);

        let wide = r#"{"rng_seed": 4294967338}"#;
        assert!(serde_json::from_str::<Settings>(wide).is_err());
        let narrow: Settings = serde_json::from_str(r#"{"rng_seed": 7}"#).unwrap();
        assert_eq!(narrow.rng_seed, 7);
    }

    #[test]
    fn single_precision_rounds_through_f32() {
        let x = 0.1f64;
        assert_eq!(Precision::Double.round(x), x);
        assert_eq!(Precision::Single.round(x), 0.1f32 as f64);
    }

    #[test]
    fn defaults_are_double_precision_without_debug() {
        let settings = Settings::default();
        assert!(settings.use_double_precision);
        assert!(!settings.debug);
        assert_eq!(settings.regression_order, DEFAULT_REGRESSION_ORDER);
        assert_eq!(settings.precision(), Precision::Double);
    }
}
