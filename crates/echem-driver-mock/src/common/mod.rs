//! Building blocks of the simulated potentiostat.
//!
//! - **mode**: operational modes (Instant, Realistic, Chaos)
//! - **timing**: call latencies and the hardware clock
//! - **errors**: error injection
//! - **rng**: seeded random number generator

pub mod errors;
pub mod mode;
pub mod rng;
pub mod timing;

pub use errors::{ErrorConfig, ErrorScenario};
pub use mode::MockMode;
pub use rng::MockRng;
pub use timing::TimingConfig;
