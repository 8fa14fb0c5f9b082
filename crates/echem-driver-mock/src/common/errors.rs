//! Error injection for the simulated potentiostat.
//!
//! Failures are decided per driver operation (`"connect"`, `"load"`,
//! `"start"`, `"poll"`, ...) and reported with the native status codes a real
//! library would return, so they travel through the same code table as
//! genuine failures.

use super::rng::MockRng;
use echem_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

const FUNCTION_FAILED: i32 = -6;
const COMM_FAILED: i32 = -200;
const WAITING_ACK: i32 = -202;

/// A scripted failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorScenario {
    /// `operation` succeeds `count` times, then fails with
    /// `ERR_GEN_FUNCTIONFAILED` on every later call.
    FailAfterN {
        /// Operation name.
        operation: &'static str,
        /// Calls that succeed first.
        count: u32,
    },
    /// The first `times` calls of `operation` get no acknowledgement; later
    /// calls succeed.
    FailFirstN {
        /// Operation name.
        operation: &'static str,
        /// Calls that fail.
        times: u32,
    },
    /// Every call of `operation` waits for an acknowledgement that never
    /// comes (`ERR_COMM_WAITINGACK`).
    Timeout {
        /// Operation name.
        operation: &'static str,
    },
    /// Every call of `operation` fails with a native status code.
    Code {
        /// Operation name.
        operation: &'static str,
        /// Native status code.
        code: i32,
    },
    /// The link drops on the first call of any operation and stays down.
    CommunicationLoss,
    /// The instrument faults on the first call of any operation and stays
    /// faulted.
    HardwareFault {
        /// Fault code.
        code: u32,
    },
}

impl ErrorScenario {
    /// Failure of the `call`th call (counted from 1) of `operation`.
    fn fire(&self, operation: &str, call: u32) -> Option<DriverError> {
        match *self {
            Self::FailAfterN { operation: op, count } if op == operation && call > count => {
                Some(DriverError::from_code(FUNCTION_FAILED))
            }
            Self::FailFirstN { operation: op, times } if op == operation && call <= times => Some(DriverError::new(
                DriverErrorKind::Communication,
                format!("no acknowledgement to {operation} (attempt {call} of {times} dropped)"),
            )),
            Self::Timeout { operation: op } if op == operation => Some(DriverError::from_code(WAITING_ACK)),
            Self::Code { operation: op, code } if op == operation => Some(DriverError::from_code(code)),
            Self::CommunicationLoss => Some(DriverError::from_code(COMM_FAILED)),
            Self::HardwareFault { code } => Some(DriverError::new(
                DriverErrorKind::Hardware,
                format!("instrument fault {code:#06x}"),
            )),
            _ => None,
        }
    }

    /// Whether the failure persists for every operation once fired.
    fn latches(&self) -> bool {
        matches!(self, Self::CommunicationLoss | Self::HardwareFault { .. })
    }
}

#[derive(Debug, Default)]
struct Ledger {
    calls: HashMap<&'static str, u32>,
    latched: Option<DriverError>,
}

/// Error injection configuration.
///
/// Clones share call counts and latched faults, so one configuration can
/// be observed from several handles of the same simulator.
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    rates: Arc<HashMap<&'static str, f64>>,
    default_rate: f64,
    scenarios: Arc<[ErrorScenario]>,
    rng: Arc<MockRng>,
    ledger: Arc<Mutex<Ledger>>,
}

impl ErrorConfig {
    fn build(
        rates: HashMap<&'static str, f64>,
        default_rate: f64,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            rates: Arc::new(rates),
            default_rate,
            scenarios: scenarios.into(),
            rng: Arc::new(MockRng::new(seed)),
            ledger: Arc::new(Mutex::new(Ledger::default())),
        }
    }

    /// No injected errors.
    pub fn none() -> Self {
        Self::build(HashMap::new(), 0.0, Vec::new(), None)
    }

    /// Every operation fails with probability `rate` with a transient
    /// communication error.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        Self::build(HashMap::new(), rate, Vec::new(), seed)
    }

    /// A single scenario.
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios; the first one that fires wins.
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), 0.0, scenarios, None)
    }

    /// Random failure probability per operation; unlisted operations never
    /// fail at random.
    pub fn with_rates(rates: HashMap<&'static str, f64>) -> Self {
        Self::build(rates, 0.0, Vec::new(), None)
    }

    /// Counts one call of `operation` and decides whether it fails.
    pub fn check_operation(&self, operation: &'static str) -> Result<(), DriverError> {
        let mut ledger = self.ledger.lock();
        if let Some(fault) = &ledger.latched {
            return Err(fault.clone());
        }

        let call = {
            let count = ledger.calls.entry(operation).or_default();
            *count += 1;
            *count
        };
        if let Some((scenario, err)) = self
            .scenarios
            .iter()
            .find_map(|s| s.fire(operation, call).map(|err| (s, err)))
        {
            if scenario.latches() {
                ledger.latched = Some(err.clone());
            }
            return Err(err);
        }

        let rate = self.rates.get(operation).copied().unwrap_or(self.default_rate);
        if self.rng.chance(rate) {
            return Err(DriverError::new(
                DriverErrorKind::Communication,
                format!("link glitch during {operation}"),
            ));
        }
        Ok(())
    }

    /// Number of calls of `operation` checked so far.
    pub fn calls(&self, operation: &str) -> u32 {
        self.ledger.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Clears call counts and latched faults.
    pub fn reset(&self) {
        *self.ledger.lock() = Ledger::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_never_fails() {
        let config = ErrorConfig::none();
        assert!((0..100).all(|_| config.check_operation("poll").is_ok()));
        assert_eq!(config.calls("poll"), 100);
    }

    #[test]
    fn test_fail_after_n_reports_function_failed() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "poll",
            count: 5,
        });
        for call in 1..=5 {
            assert!(config.check_operation("poll").is_ok(), "call {call}");
        }
        let err = config.check_operation("poll").unwrap_err();
        assert_eq!(err.code, Some(FUNCTION_FAILED));
        assert!(!err.kind.is_transient());
        assert!(config.check_operation("start").is_ok());
    }

    #[test]
    fn test_fail_first_n_is_transient() {
        let config = ErrorConfig::scenario(ErrorScenario::FailFirstN {
            operation: "start",
            times: 2,
        });
        let first = config.check_operation("start").unwrap_err();
        assert!(first.kind.is_transient());
        assert!(first.message.contains("attempt 1 of 2"));
        assert!(config.check_operation("start").is_err());
        assert!(config.check_operation("start").is_ok());
    }

    #[test]
    fn test_timeout_and_code_scenarios() {
        let config = ErrorConfig::scenarios(vec![
            ErrorScenario::Timeout { operation: "connect" },
            ErrorScenario::Code {
                operation: "load",
                code: -401,
            },
        ]);
        let err = config.check_operation("connect").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
        assert!(err.message.starts_with("ERR_COMM_WAITINGACK"));

        let err = config.check_operation("load").unwrap_err();
        assert_eq!(err.code, Some(-401));
        assert_eq!(err.kind, DriverErrorKind::TechniqueFile);
        assert!(config.check_operation("poll").is_ok());
    }

    #[test]
    fn test_communication_loss_latches_until_reset() {
        let config = ErrorConfig::scenario(ErrorScenario::CommunicationLoss);
        assert_eq!(config.check_operation("poll").unwrap_err().code, Some(COMM_FAILED));
        assert_eq!(config.check_operation("stop").unwrap_err().code, Some(COMM_FAILED));
        assert_eq!(config.calls("stop"), 0);

        config.reset();
        assert_eq!(config.calls("poll"), 0);
        assert!(config.check_operation("poll").is_err());
    }

    #[test]
    fn test_hardware_fault_is_shared_between_clones() {
        let config = ErrorConfig::scenario(ErrorScenario::HardwareFault { code: 0x42 });
        let other = config.clone();
        let err = config.check_operation("poll").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Hardware);
        assert!(err.message.contains("0x0042"));
        assert_eq!(other.check_operation("connect").unwrap_err(), err);
    }

    #[test]
    fn test_per_operation_rates() {
        let config = ErrorConfig::with_rates(HashMap::from([("poll", 1.0), ("start", 0.0)]));
        for _ in 0..10 {
            assert!(config.check_operation("poll").is_err());
            assert!(config.check_operation("start").is_ok());
            assert!(config.check_operation("load").is_ok());
        }
    }

    #[test]
    fn test_seeded_random_failures_repeat() {
        let a = ErrorConfig::random_failures_seeded(0.5, Some(9));
        let b = ErrorConfig::random_failures_seeded(0.5, Some(9));
        let xs: Vec<bool> = (0..32).map(|_| a.check_operation("poll").is_err()).collect();
        let ys: Vec<bool> = (0..32).map(|_| b.check_operation("poll").is_err()).collect();
        assert_eq!(xs, ys);
        assert!(xs.iter().any(|failed| *failed));
    }
}
