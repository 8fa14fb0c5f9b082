//! `echem-core`
//!
//! Technique marshalling and acquisition engine for multi-channel
//! potentiostats.
//!
//! The crate loads parameterized measurement techniques onto instrument
//! channels, polls the instrument for acquired rows, decodes them into
//! measurement records and runs several channels concurrently with
//! cooperative cancellation and an optional synchronized start.
//!
//! ## Layers
//!
//! - **Marshalling** ([`parameter`], [`technique`]): typed parameters are
//!   cast to their declared types and bundled into the fixed-layout records
//!   the native driver consumes.
//! - **Decoding** ([`telemetry`]): raw acquisition rows become
//!   [`MeasurementRecord`]s with monotonic elapsed time.
//! - **Execution** ([`executor`], [`runner`]): one state machine per channel,
//!   supervised by a [`ProgramRunner`].
//! - **Programs** ([`mpp`]): multi-stage programs built on executors and
//!   live parameter updates, such as maximum power point tracking.
//! - **Boundary** ([`driver`], [`registry`]): the blocking
//!   [`DriverInterface`] and the shared, call-serialized [`Device`] handle.
//!
//! ## Example
//!
//! ```rust,no_run
//! use echem_core::{ChannelExecutor, DeviceRegistry, DriverInterface, EngineConfig, ProgramRunner};
//! use echem_core::technique::{OcvParams, Technique};
//! use std::sync::Arc;
//!
//! # async fn example(driver: Arc<dyn DriverInterface>) -> echem_core::Result<()> {
//! let config = EngineConfig::load()?;
//! let registry = DeviceRegistry::new();
//! let device = registry.device("192.168.0.20", driver);
//!
//! let mut runner = ProgramRunner::new(&config);
//! for channel in 0..2 {
//!     let ocv = Technique::Ocv(OcvParams::new(60.0));
//!     runner.add(ChannelExecutor::from_techniques(device.clone(), channel, &[ocv], config.clone())?)?;
//! }
//! let summary = runner.run().await?;
//! assert!(summary.all_stopped());
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod mpp;
pub mod parameter;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod sync;
pub mod technique;
pub mod telemetry;

pub use catalog::{ChannelState, DeviceFamily, IRange, TechniqueId};
pub use config::EngineConfig;
pub use driver::{Connection, Device, DeviceInfo, DriverInterface, DriverResult, HardwareConfig, SessionToken};
pub use error::{DriverError, DriverErrorKind, EchemError, Result};
pub use executor::{ChannelExecutor, DataCallback, ExecutorState, ParameterUpdater, Program};
pub use mpp::{Mpp, MppCycles, MppParams, MppTracker, MppTrackingParams};
pub use parameter::{ParameterBundle, ParameterSet, RawValue, TechniqueSequence};
pub use registry::DeviceRegistry;
pub use retry::RetryPolicy;
pub use runner::{ChannelOutcome, ProgramRunner, RunSummary};
pub use sync::{StopSignal, SyncBarrier};
pub use technique::Technique;
pub use telemetry::{AcquisitionRow, ChannelValues, FrameInfo, MeasurementRecord, PollFrame, TimeCursor};
