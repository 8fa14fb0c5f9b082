//! Operational modes of the simulator.
//!
//! - **Instant**: no latency, deterministic, for unit tests
//! - **Realistic**: instrument-like latency, for integration tests
//! - **Chaos**: random transient failures, for resilience testing

use super::errors::ErrorConfig;
use super::timing::TimingConfig;

/// Operational mode of a simulated potentiostat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockMode {
    /// Zero latency.
    #[default]
    Instant,
    /// Instrument-like latency.
    Realistic,
    /// Instrument-like latency and random transient failures.
    Chaos,
}

impl MockMode {
    /// Timing used by this mode.
    pub fn timing(self) -> TimingConfig {
        match self {
            MockMode::Instant => TimingConfig::instant(),
            MockMode::Realistic | MockMode::Chaos => TimingConfig::ethernet(),
        }
    }

    /// Error injection used by this mode.
    pub fn errors(self, seed: Option<u64>) -> ErrorConfig {
        match self {
            MockMode::Chaos => ErrorConfig::random_failures_seeded(0.05, seed),
            MockMode::Instant | MockMode::Realistic => ErrorConfig::none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode() {
        assert_eq!(MockMode::default(), MockMode::Instant);
        assert_eq!(MockMode::Instant.timing(), TimingConfig::instant());
    }

    #[test]
    fn test_chaos_injects_failures() {
        let errors = MockMode::Chaos.errors(Some(1));
        let failures = (0..1_000).filter(|_| errors.check_operation("poll").is_err()).count();
        assert!(failures > 0);
        let calm = MockMode::Realistic.errors(Some(1));
        assert!((0..1_000).all(|_| calm.check_operation("poll").is_ok()));
    }
}
