//! Concurrent execution of several channels.
//!
//! The runner spawns one task per [`ChannelExecutor`], all sharing one
//! [`StopSignal`]. With synchronization enabled, a [`SyncBarrier`] sized to
//! the number of channels holds every channel between its start and its
//! first poll until all of them started.

use crate::config::EngineConfig;
use crate::error::{EchemError, Result};
use crate::executor::{ChannelExecutor, ExecutorState, Program};
use crate::sync::{StopSignal, SyncBarrier};
use crate::telemetry::MeasurementRecord;
use std::fmt;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Terminal outcome of one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOutcome {
    /// Channel number.
    pub channel: u8,
    /// Final executor state.
    pub state: ExecutorState,
    /// Number of records acquired.
    pub records: usize,
    /// Failure description when the channel errored.
    pub error: Option<String>,
}

impl fmt::Display for ChannelOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {}: {} ({} records)", self.channel, self.state, self.records)?;
        if let Some(error) = &self.error {
            write!(f, ": {error}")?;
        }
        Ok(())
    }
}

/// Outcomes of every channel of a run, in the order channels were added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Per-channel outcomes.
    pub outcomes: Vec<ChannelOutcome>,
}

impl RunSummary {
    /// Outcome of `channel`.
    pub fn get(&self, channel: u8) -> Option<&ChannelOutcome> {
        self.outcomes.iter().find(|o| o.channel == channel)
    }

    /// Channels that ended in `Errored`.
    pub fn failed(&self) -> impl Iterator<Item = &ChannelOutcome> {
        self.outcomes.iter().filter(|o| o.state == ExecutorState::Errored)
    }

    /// Whether every channel stopped normally.
    pub fn all_stopped(&self) -> bool {
        self.outcomes.iter().all(|o| o.state == ExecutorState::Stopped)
    }

    /// Total number of records across channels.
    pub fn total_records(&self) -> usize {
        self.outcomes.iter().map(|o| o.records).sum()
    }
}

enum Slot {
    Pending(ChannelExecutor),
    Running(u8, JoinHandle<ChannelExecutor>),
    Finished(ChannelExecutor),
    Lost(u8, String),
}

/// Supervises a set of channel executors.
pub struct ProgramRunner {
    slots: Vec<Slot>,
    stop: StopSignal,
    sync: bool,
    started: bool,
}

impl fmt::Debug for ProgramRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramRunner")
            .field("channels", &self.slots.len())
            .field("sync", &self.sync)
            .field("started", &self.started)
            .field("stopped", &self.stop.is_triggered())
            .finish()
    }
}

impl ProgramRunner {
    /// Empty runner; `config.sync` selects barrier synchronization.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            slots: Vec::new(),
            stop: StopSignal::new(),
            sync: config.sync,
            started: false,
        }
    }

    /// Overrides barrier synchronization.
    #[must_use]
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Adds an idle channel. The executor is rewired to the runner's stop
    /// signal.
    pub fn add(&mut self, mut executor: ChannelExecutor) -> Result<()> {
        if self.started {
            return Err(EchemError::ChannelState {
                operation: "add",
                state: "started".to_string(),
            });
        }
        let state = executor.state();
        if state != ExecutorState::Idle {
            return Err(EchemError::ChannelState {
                operation: "add",
                state: state.to_string(),
            });
        }
        executor.set_stop_signal(self.stop.clone());
        self.slots.push(Slot::Pending(executor));
        Ok(())
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no channel was added.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Shared stop signal.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Spawns one task per channel. Must be called from a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(EchemError::ChannelState {
                operation: "start",
                state: "started".to_string(),
            });
        }
        self.started = true;

        let barrier = (self.sync && !self.slots.is_empty()).then(|| SyncBarrier::new(self.slots.len()));
        info!(channels = self.slots.len(), sync = barrier.is_some(), "Starting program");

        self.slots = std::mem::take(&mut self.slots)
            .into_iter()
            .map(|slot| match slot {
                Slot::Pending(mut executor) => {
                    let channel = executor.channel();
                    executor.set_barrier(barrier.clone());
                    let handle = tokio::spawn(async move {
                        // The outcome is kept on the executor.
                        let _ = executor.run().await;
                        executor
                    });
                    Slot::Running(channel, handle)
                }
                other => other,
            })
            .collect();
        Ok(())
    }

    /// Requests a cooperative stop of every channel.
    pub fn stop(&self) {
        info!("Stop requested");
        self.stop.trigger();
    }

    /// Waits for every channel to finish and reports each outcome.
    ///
    /// Channels that were never started are reported in their current state.
    pub async fn wait(&mut self) -> RunSummary {
        for slot in &mut self.slots {
            let Slot::Running(channel, handle) = slot else { continue };
            let channel = *channel;
            let finished = match handle.await {
                Ok(executor) => Slot::Finished(executor),
                Err(join) => {
                    error!(channel, error = %join, "Channel task failed");
                    Slot::Lost(channel, join.to_string())
                }
            };
            *slot = finished;
        }

        let outcomes = self
            .slots
            .iter()
            .map(|slot| match slot {
                Slot::Pending(executor) | Slot::Finished(executor) => ChannelOutcome {
                    channel: executor.channel(),
                    state: executor.state(),
                    records: executor.records().len(),
                    error: executor.error().map(ToString::to_string),
                },
                Slot::Running(channel, _) => ChannelOutcome {
                    channel: *channel,
                    state: ExecutorState::Running,
                    records: 0,
                    error: None,
                },
                Slot::Lost(channel, message) => ChannelOutcome {
                    channel: *channel,
                    state: ExecutorState::Errored,
                    records: 0,
                    error: Some(message.clone()),
                },
            })
            .collect::<Vec<_>>();

        for outcome in &outcomes {
            info!(%outcome, "Channel finished");
        }
        RunSummary { outcomes }
    }

    /// Starts every channel and waits for all of them.
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.start()?;
        Ok(self.wait().await)
    }

    /// Records of `channel` once its task finished.
    pub fn records(&self, channel: u8) -> Option<&[MeasurementRecord]> {
        self.executors()
            .find(|e| e.channel() == channel)
            .map(ChannelExecutor::records)
    }

    /// Executors that are not currently running.
    pub fn executors(&self) -> impl Iterator<Item = &ChannelExecutor> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Pending(executor) | Slot::Finished(executor) => Some(executor),
            Slot::Running(..) | Slot::Lost(..) => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(channel: u8, state: ExecutorState, records: usize) -> ChannelOutcome {
        ChannelOutcome {
            channel,
            state,
            records,
            error: (state == ExecutorState::Errored).then(|| "Communication error during poll: link down".to_string()),
        }
    }

    #[test]
    fn test_summary_surfaces_failed_channels() {
        let summary = RunSummary {
            outcomes: vec![
                outcome(0, ExecutorState::Stopped, 12),
                outcome(1, ExecutorState::Errored, 3),
                outcome(2, ExecutorState::Stopped, 10),
            ],
        };
        assert!(!summary.all_stopped());
        assert_eq!(summary.total_records(), 25);
        let failed: Vec<u8> = summary.failed().map(|o| o.channel).collect();
        assert_eq!(failed, vec![1]);
        assert_eq!(
            summary.get(1).map(ToString::to_string).as_deref(),
            Some("channel 1: errored (3 records): Communication error during poll: link down")
        );
    }

    #[tokio::test]
    async fn test_empty_runner_completes() {
        let mut runner = ProgramRunner::new(&EngineConfig::default()).with_sync(true);
        assert!(runner.is_empty());
        let summary = runner.run().await.unwrap();
        assert!(summary.outcomes.is_empty());
        assert!(summary.all_stopped());
        assert!(matches!(
            runner.start(),
            Err(EchemError::ChannelState { operation: "start", .. })
        ));
    }
}
