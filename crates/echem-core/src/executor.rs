//! Per-channel execution.
//!
//! A [`ChannelExecutor`] owns the lifecycle of one channel:
//!
//! ```text
//! Idle ─run()─▶ Connecting ─load─▶ Loaded ─start─▶ Running ─┬─▶ Stopping ─▶ Stopped
//!                   │                 │               │      │
//!                   └─────────────────┴───────────────┴──────┴─▶ Errored
//! ```
//!
//! While `Running`, the executor polls the device, decodes every row, appends
//! the records to its context and hands them to the registered callbacks.
//! The loop ends when the [`StopSignal`] fires, the hardware reports the
//! channel stopped, or the techniques' declared run time has elapsed. The
//! channel is then stopped and drained.
//!
//! Driver calls are blocking; each one runs on the blocking pool under a
//! deadline and is retried according to the configured
//! [`RetryPolicy`](crate::retry::RetryPolicy). `Stopped` and `Errored` are
//! terminal: a finished executor cannot run again.

use crate::catalog::{ChannelState, DeviceFamily};
use crate::config::EngineConfig;
use crate::driver::{Device, DeviceInfo, HardwareConfig, SessionToken};
use crate::error::{EchemError, Result};
use crate::parameter::{ParameterSet, TechniqueSequence};
use crate::retry::{retry_with_policy, timed_out, RetryPolicy};
use crate::sync::{StopSignal, SyncBarrier};
use crate::technique::Technique;
use crate::telemetry::{decode_frame, MeasurementRecord, PollFrame, TimeCursor};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Callback receiving the records decoded by one poll.
pub type DataCallback = Arc<dyn Fn(u8, &[MeasurementRecord]) + Send + Sync>;

/// Lifecycle state of a channel executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutorState {
    /// Created, not yet run.
    Idle,
    /// Connecting and loading techniques.
    Connecting,
    /// Techniques loaded, channel not started.
    Loaded,
    /// Channel started, polling.
    Running,
    /// Stop requested, draining.
    Stopping,
    /// Finished normally.
    Stopped,
    /// Finished after an unrecoverable failure.
    Errored,
}

impl ExecutorState {
    /// Whether the state is final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Errored)
    }
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Loaded => "loaded",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Capabilities of a runnable channel program.
#[async_trait]
pub trait Program: Send {
    /// Runs the program until it stops or fails.
    async fn run(&mut self) -> Result<()>;

    /// Requests a cooperative stop.
    fn stop(&self);

    /// Registers a callback for newly decoded records.
    fn on_data(&mut self, callback: DataCallback);

    /// Current lifecycle state.
    fn channel_state(&self) -> ExecutorState;
}

// =============================================================================
// Blocking driver calls
// =============================================================================

/// Runs `f` against `device` on the blocking pool, bounded by `limit`.
///
/// A call that outlives its deadline keeps running in the background and
/// still holds the device until it returns. Its result is then discarded
/// with a warning; for a poll, the rows it read are lost.
pub(crate) async fn blocking<T, F>(operation: &'static str, limit: Duration, device: Arc<Device>, f: F) -> Result<T>
where
    F: FnOnce(&Device) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let mut task = tokio::task::spawn_blocking(move || f(&device));
    match timeout(limit, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(EchemError::communication(operation, format!("driver call aborted: {join}"))),
        Err(_) => {
            let deadline = Instant::now();
            tokio::spawn(
                async move {
                    match task.await {
                        Ok(Ok(_)) => warn!(
                            operation,
                            late_by = ?deadline.elapsed(),
                            "Discarding result of a driver call that outlived its deadline"
                        ),
                        Ok(Err(err)) => debug!(operation, error = %err, "Late driver call failed"),
                        Err(join) => warn!(operation, error = %join, "Late driver call aborted"),
                    }
                }
                .in_current_span(),
            );
            Err(timed_out(operation, limit))
        }
    }
}

/// [`blocking`] under a retry policy.
pub(crate) async fn call<T, F>(
    retry: &RetryPolicy,
    operation: &'static str,
    limit: Duration,
    device: &Arc<Device>,
    f: F,
) -> Result<T>
where
    F: FnOnce(&Device) -> Result<T> + Clone + Send + 'static,
    T: Send + 'static,
{
    retry_with_policy(retry, operation, || blocking(operation, limit, Arc::clone(device), f.clone())).await
}

// =============================================================================
// Parameter updates
// =============================================================================

/// Pushes parameter changes to a running channel.
///
/// Obtained from [`ChannelExecutor::updater`] before the executor runs.
/// Updates are accepted only while the channel is `Running`; the stored
/// sequence changes only after the driver accepted the new bundle.
#[derive(Clone)]
pub struct ParameterUpdater {
    channel: u8,
    device: Arc<Device>,
    sequence: Arc<Mutex<TechniqueSequence>>,
    state: watch::Receiver<ExecutorState>,
    call_timeout: Duration,
    retry: RetryPolicy,
}

impl fmt::Debug for ParameterUpdater {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterUpdater")
            .field("channel", &self.channel)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl ParameterUpdater {
    /// Replaces the named values of the technique at `technique_index`.
    pub async fn update(&self, technique_index: usize, values: &ParameterSet) -> Result<()> {
        let state = *self.state.borrow();
        if state != ExecutorState::Running {
            return Err(EchemError::ChannelState {
                operation: "update",
                state: state.to_string(),
            });
        }

        let mut sequence = self.sequence.lock().await;
        let mut updated = sequence.clone();
        let partial = updated
            .get(technique_index)
            .ok_or_else(|| EchemError::invalid(format!("no technique at sequence index {technique_index}")))?
            .bundle()
            .resolve(values)?;
        updated.update(technique_index, &partial)?;
        let entry = updated
            .get(technique_index)
            .cloned()
            .ok_or_else(|| EchemError::invalid(format!("no technique at sequence index {technique_index}")))?;

        let channel = self.channel;
        call(&self.retry, "update", self.call_timeout, &self.device, move |device| {
            device.update(channel, technique_index, &entry)
        })
        .await?;

        *sequence = updated;
        info!(channel, technique_index, values = partial.len(), "Parameters updated");
        Ok(())
    }

    /// Current bundle values of the loaded sequence.
    pub async fn sequence(&self) -> TechniqueSequence {
        self.sequence.lock().await.clone()
    }
}

// =============================================================================
// Channel executor
// =============================================================================

/// Why the poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Requested,
    Hardware,
    RunTime,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Requested => "stop requested",
            Self::Hardware => "channel stopped by hardware",
            Self::RunTime => "run time elapsed",
        })
    }
}

/// Executes a technique sequence on one channel.
pub struct ChannelExecutor {
    channel: u8,
    device: Arc<Device>,
    config: EngineConfig,
    sequence: Arc<Mutex<TechniqueSequence>>,
    run_time: Option<Duration>,
    hardware: Option<HardwareConfig>,
    stop: StopSignal,
    barrier: Option<SyncBarrier>,
    arrived: bool,
    token: SessionToken,
    session: bool,
    family: DeviceFamily,
    state: watch::Sender<ExecutorState>,
    records: Vec<MeasurementRecord>,
    cursor: TimeCursor,
    callbacks: Vec<DataCallback>,
    error: Option<EchemError>,
}

impl fmt::Debug for ChannelExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelExecutor")
            .field("channel", &self.channel)
            .field("device", &self.device.address())
            .field("state", &self.state())
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

impl ChannelExecutor {
    /// Executor loading `sequence` on `channel` of `device`.
    pub fn new(device: Arc<Device>, channel: u8, sequence: TechniqueSequence, config: EngineConfig) -> Self {
        let (state, _) = watch::channel(ExecutorState::Idle);
        let token = device.session_token();
        Self {
            channel,
            device,
            config,
            sequence: Arc::new(Mutex::new(sequence)),
            run_time: None,
            hardware: None,
            stop: StopSignal::new(),
            barrier: None,
            arrived: false,
            token,
            session: false,
            family: DeviceFamily::Vmp3,
            state,
            records: Vec::new(),
            cursor: TimeCursor::new(),
            callbacks: Vec::new(),
            error: None,
        }
    }

    /// Executor for a sequence of typed programs.
    ///
    /// The run time is the sum of the programs' run times when every one of
    /// them declares one.
    pub fn from_techniques(
        device: Arc<Device>,
        channel: u8,
        techniques: &[Technique],
        config: EngineConfig,
    ) -> Result<Self> {
        let entries = techniques
            .iter()
            .map(|t| Ok((t.definition(), t.parameters()?)))
            .collect::<Result<Vec<_>>>()?;
        let sequence = TechniqueSequence::build(entries)?;
        let run_time = techniques
            .iter()
            .map(Technique::run_time)
            .sum::<Option<Duration>>();
        Ok(Self::new(device, channel, sequence, config).with_run_time(run_time))
    }

    /// Ends the run once `run_time` has elapsed since start.
    #[must_use]
    pub fn with_run_time(mut self, run_time: Option<Duration>) -> Self {
        self.run_time = run_time;
        self
    }

    /// Applies `config` to the channel wiring before loading.
    #[must_use]
    pub fn with_hardware_config(mut self, config: HardwareConfig) -> Self {
        self.hardware = Some(config);
        self
    }

    /// Shares `stop` with other executors.
    #[must_use]
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Waits at `barrier` after starting, before the first poll.
    #[must_use]
    pub fn with_barrier(mut self, barrier: SyncBarrier) -> Self {
        self.barrier = Some(barrier);
        self
    }

    pub(crate) fn set_stop_signal(&mut self, stop: StopSignal) {
        self.stop = stop;
    }

    pub(crate) fn set_barrier(&mut self, barrier: Option<SyncBarrier>) {
        self.barrier = barrier;
    }

    /// Channel number.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Shared device handle.
    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ExecutorState {
        *self.state.borrow()
    }

    /// Receiver following state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ExecutorState> {
        self.state.subscribe()
    }

    /// Records decoded so far, in acquisition order.
    pub fn records(&self) -> &[MeasurementRecord] {
        &self.records
    }

    /// Moves the accumulated records out.
    pub fn take_records(&mut self) -> Vec<MeasurementRecord> {
        std::mem::take(&mut self.records)
    }

    /// Failure that put the executor in `Errored`.
    pub fn error(&self) -> Option<&EchemError> {
        self.error.as_ref()
    }

    /// Stop signal observed by the poll loop.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Handle for live parameter updates.
    pub fn updater(&self) -> ParameterUpdater {
        ParameterUpdater {
            channel: self.channel,
            device: Arc::clone(&self.device),
            sequence: Arc::clone(&self.sequence),
            state: self.state.subscribe(),
            call_timeout: self.config.call_timeout,
            retry: self.config.retry,
        }
    }

    fn set_state(&self, next: ExecutorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(channel = self.channel, from = %previous, to = %next, "Channel state changed");
        }
    }

    async fn call<T, F>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&Device) -> Result<T> + Clone + Send + 'static,
        T: Send + 'static,
    {
        call(&self.config.retry, operation, self.config.call_timeout, &self.device, f).await
    }

    /// Arrives at the barrier once, whatever the outcome of the run.
    async fn arrive(&mut self) {
        if self.arrived {
            return;
        }
        self.arrived = true;
        if let Some(barrier) = &self.barrier {
            debug!(channel = self.channel, parties = barrier.parties(), "Waiting at start barrier");
            barrier.wait().await;
        }
    }

    async fn connect(&mut self) -> Result<DeviceInfo> {
        if !self.config.autoconnect {
            return self.device.info().ok_or_else(|| EchemError::ChannelState {
                operation: "run",
                state: "disconnected".to_string(),
            });
        }
        // An attempt that timed out may still take the session later.
        self.session = true;
        let (limit, token) = (self.config.connect_timeout, self.token);
        call(&self.config.retry, "connect", limit, &self.device, move |device| {
            device.acquire(token, limit)
        })
        .await
    }

    async fn release(&mut self) {
        if !std::mem::take(&mut self.session) {
            return;
        }
        let (device, token) = (Arc::clone(&self.device), self.token);
        if let Err(err) = blocking("disconnect", self.config.call_timeout, device, move |d| d.release(token)).await {
            warn!(channel = self.channel, error = %err, "Failed to release device session");
        }
    }

    /// Decodes `frame`, appends its records and notifies callbacks.
    fn ingest(&mut self, frame: &PollFrame) -> usize {
        let decoded = decode_frame(frame, self.family, self.cursor);
        for err in &decoded.dropped {
            warn!(channel = self.channel, error = %err, "Dropping undecodable row");
        }
        self.cursor = decoded.cursor;
        let count = decoded.records.len();
        if count > 0 {
            for callback in &self.callbacks {
                callback(self.channel, &decoded.records);
            }
            self.records.extend(decoded.records);
        }
        debug!(
            channel = self.channel,
            rows = frame.info.rows,
            decoded = count,
            dropped = decoded.dropped.len(),
            buffer = frame.values.mem_filled,
            "Polled"
        );
        count
    }

    async fn poll(&mut self) -> Result<PollFrame> {
        let channel = self.channel;
        let frame = self.call("poll", move |device| device.poll(channel)).await?;
        self.ingest(&frame);
        Ok(frame)
    }

    fn cadence(sequence: &TechniqueSequence, poll_interval: Duration) -> Duration {
        sequence
            .sample_interval()
            .map_or(poll_interval, |interval| interval.min(poll_interval))
    }

    #[instrument(skip(self), fields(channel = self.channel, device = %self.device.address()))]
    async fn execute(&mut self) -> Result<()> {
        let channel = self.channel;
        self.set_state(ExecutorState::Connecting);

        let info = self.connect().await?;
        if !info.has_channel(channel) {
            return Err(EchemError::invalid(format!(
                "channel {channel} is not available on {}",
                self.device.address()
            )));
        }
        self.family = info.family;

        if let Some(hardware) = self.hardware {
            self.call("set_hardware_config", move |device| {
                device.set_hardware_config(channel, hardware)
            })
            .await?;
        }

        let sequence = self.sequence.lock().await.clone();
        let cadence = Self::cadence(&sequence, self.config.poll_interval);
        let techniques = sequence.len();
        self.call("load", move |device| device.load(channel, &sequence)).await?;
        self.set_state(ExecutorState::Loaded);

        if self.stop.is_triggered() {
            self.arrive().await;
            return Ok(());
        }

        self.call("start", move |device| device.start(channel)).await?;
        let started = Instant::now();
        self.set_state(ExecutorState::Running);
        info!(techniques, cadence = ?cadence, run_time = ?self.run_time, "Channel started");
        self.arrive().await;

        let reason = loop {
            if self.stop.is_triggered() {
                break StopReason::Requested;
            }
            let frame = self.poll().await?;
            if frame.values.state == ChannelState::Stop {
                break StopReason::Hardware;
            }
            if self.run_time.is_some_and(|limit| started.elapsed() >= limit) {
                break StopReason::RunTime;
            }
            let stop = self.stop.clone();
            tokio::select! {
                () = sleep(cadence) => {}
                () = stop.triggered() => {}
            }
        };

        self.set_state(ExecutorState::Stopping);
        info!(%reason, records = self.records.len(), "Stopping channel");
        self.call("stop", move |device| device.stop(channel)).await?;
        self.poll().await?;
        Ok(())
    }
}

#[async_trait]
impl Program for ChannelExecutor {
    async fn run(&mut self) -> Result<()> {
        let state = self.state();
        if state != ExecutorState::Idle {
            return Err(EchemError::ChannelState {
                operation: "run",
                state: state.to_string(),
            });
        }

        let result = self.execute().await;
        self.arrive().await;
        self.release().await;

        match &result {
            Ok(()) => self.set_state(ExecutorState::Stopped),
            Err(err) => {
                error!(channel = self.channel, error = %err, "Channel failed");
                self.error = Some(err.clone());
                self.set_state(ExecutorState::Errored);
            }
        }
        result
    }

    fn stop(&self) {
        self.stop.trigger();
    }

    fn on_data(&mut self, callback: DataCallback) {
        self.callbacks.push(callback);
    }

    fn channel_state(&self) -> ExecutorState {
        self.state()
    }
}
