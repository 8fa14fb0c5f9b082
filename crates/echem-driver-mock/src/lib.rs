//! Simulated potentiostat for echem.
//!
//! This crate provides a [`MockPotentiostat`] implementing
//! [`echem_core::DriverInterface`], so that channel executors, the program
//! runner and the command line can be exercised without an instrument.
//!
//! # Capabilities
//!
//! - VMP3 and SP-300 family row layouts, selected by the simulated model
//! - OCV, CA, CP (with or without limits), CV and PEIS/GEIS programs parsed
//!   from the parameter records the engine loads
//! - Live parameter updates
//! - Hardware time counter with optional high word rollover
//! - Error injection per driver operation ([`ErrorConfig`])
//! - Connection and call latencies ([`TimingConfig`], [`MockMode`])
//!
//! ```rust,ignore
//! use echem_core::{DeviceRegistry, EngineConfig};
//! use echem_driver_mock::MockPotentiostat;
//! use std::sync::Arc;
//!
//! let registry = DeviceRegistry::new();
//! let device = registry.device("10.0.0.2", Arc::new(MockPotentiostat::new()));
//! ```

pub mod common;
mod mock_potentiostat;
pub mod signal;

pub use common::{ErrorConfig, ErrorScenario, MockMode, MockRng, TimingConfig};
pub use mock_potentiostat::{MockPotentiostat, MockPotentiostatBuilder};
pub use signal::CellModel;
