//! Maximum power point tracking programs.
//!
//! [`MppTracker`] holds a cell at a potential with a single-step CALIMIT
//! technique and, between holds, perturbs a neighbouring potential through live
//! parameter updates. After each hold/perturb pair the held potential moves one
//! perturbation step toward whichever side delivered more power. Power keeps the
//! instrument's sign convention: a cell delivering power reads negative, so
//! the lower mean power wins.
//!
//! ```text
//! ┌── hold at v ──┐┌ trial at v+s ┐┌── hold at v' ─┐┌ trial at v'+s' ┐ ...
//!                 compare mean powers of the last n rows of each segment
//!                 trial better: v' = v + s, otherwise s' = -s, v' = v - s
//! ```
//!
//! [`Mpp`] chains an open circuit rest, a JV scan from the open circuit
//! voltage down to 0 V, and tracking that starts from the scan's maximum
//! power point. [`MppCycles`] repeats [`Mpp`] so the scan is refreshed every
//! `scan_interval` seconds.
//!
//! Timed callbacks registered with `on_timeout` run at the start of each
//! hold/perturb cycle once their period has elapsed, on the tracking task.

use crate::catalog::ExitCondition;
use crate::config::EngineConfig;
use crate::driver::{Device, SessionToken};
use crate::error::{EchemError, Result};
use crate::executor::{blocking, call, ChannelExecutor, DataCallback, ExecutorState, ParameterUpdater, Program};
use crate::sync::StopSignal;
use crate::technique::{CaLimitParams, CaParams, JvScanParams, OcvParams, Technique};
use crate::telemetry::MeasurementRecord;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};

fn default_perturb_step() -> f64 {
    5e-3
}

fn default_perturb_points() -> u32 {
    5
}

fn default_perturb_interval() -> f64 {
    2.0
}

fn default_record_interval() -> f64 {
    1.0
}

fn seconds(secs: f64, what: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| EchemError::invalid(format!("{what} must be a finite, non-negative time")))
}

/// False for NaN.
fn positive(x: f64) -> bool {
    x > 0.0
}

/// Parameters of [`MppTracker`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MppTrackingParams {
    /// Potential held first, in volts.
    #[serde(default)]
    pub start_voltage: f64,
    /// Tracking time in seconds.
    pub run_time: f64,
    /// Offset of the trial potential from the held one, in volts.
    #[serde(default = "default_perturb_step")]
    pub perturb_step: f64,
    /// Rows acquired per perturbation.
    #[serde(default = "default_perturb_points")]
    pub perturb_points: u32,
    /// Time between the starts of two perturbations, in seconds.
    #[serde(default = "default_perturb_interval")]
    pub perturb_interval: f64,
    /// Time between recorded rows, in seconds.
    #[serde(default = "default_record_interval")]
    pub record_interval: f64,
}

impl MppTrackingParams {
    /// Tracking from `start_voltage` for `run_time` seconds with default
    /// perturbation.
    pub fn new(start_voltage: f64, run_time: f64) -> Self {
        Self {
            start_voltage,
            run_time,
            perturb_step: default_perturb_step(),
            perturb_points: default_perturb_points(),
            perturb_interval: default_perturb_interval(),
            record_interval: default_record_interval(),
        }
    }

    /// Duration of one perturbation: `perturb_points` recorded rows.
    pub fn perturb_time(&self) -> Result<Duration> {
        seconds(f64::from(self.perturb_points) * self.record_interval, "perturbation time")
    }

    /// Duration of one hold. Fills the perturb interval, and never holds
    /// shorter than a perturbation so the two segments stay comparable.
    pub fn hold_time(&self) -> Result<Duration> {
        let perturb = self.perturb_time()?;
        let rest = seconds(self.perturb_interval.max(0.0), "perturbation interval")?.saturating_sub(perturb);
        Ok(rest.max(perturb))
    }

    /// The CALIMIT program holding `start_voltage` for the whole run.
    pub fn technique(&self) -> Result<Technique> {
        self.validate()?;
        Ok(Technique::CaLimit(CaLimitParams {
            steps: CaParams {
                time_interval: self.record_interval,
                ..CaParams::new(vec![self.start_voltage], vec![self.run_time])
            },
            limits: Vec::new(),
            exit_condition: ExitCondition::default(),
        }))
    }

    fn validate(&self) -> Result<()> {
        if !positive(self.run_time) {
            return Err(EchemError::invalid("tracking run time must be positive"));
        }
        if !positive(self.record_interval) {
            return Err(EchemError::invalid("record interval must be positive"));
        }
        if self.perturb_points == 0 {
            return Err(EchemError::invalid("a perturbation needs at least one point"));
        }
        if !self.perturb_step.is_finite() || self.perturb_step == 0.0 {
            return Err(EchemError::invalid("perturb step must be a non-zero potential"));
        }
        self.hold_time().map(|_| ())
    }
}

// =============================================================================
// Timed callbacks
// =============================================================================

/// How the period of a timed callback is measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Between the starts of two calls.
    #[default]
    Interval,
    /// From the end of one call to the start of the next.
    Between,
}

/// Tracking progress handed to timed callbacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackerStatus {
    /// Channel number.
    pub channel: u8,
    /// Potential currently held, in volts.
    pub voltage: f64,
    /// Completed hold/perturb cycles.
    pub cycles: usize,
    /// Time since tracking started.
    pub elapsed: Duration,
}

/// Callback run between tracking cycles.
pub type TimedCallback = Box<dyn FnMut(&TrackerStatus) + Send + Sync>;

struct Timer {
    callback: TimedCallback,
    period: Duration,
    kind: TimeoutKind,
    remaining: Option<u32>,
    last: Instant,
}

impl Timer {
    fn new(period: Duration, repeat: Option<u32>, kind: TimeoutKind, callback: TimedCallback) -> Self {
        Self {
            callback,
            period,
            kind,
            remaining: repeat,
            last: Instant::now(),
        }
    }

    fn start(&mut self) {
        self.last = Instant::now();
    }

    /// Runs the callback when due and not exhausted.
    fn call(&mut self, status: &TrackerStatus) -> bool {
        if self.remaining == Some(0) || self.last.elapsed() < self.period {
            return false;
        }
        if self.kind == TimeoutKind::Interval {
            self.last = Instant::now();
        }
        (self.callback)(status);
        if self.kind == TimeoutKind::Between {
            self.last = Instant::now();
        }
        if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
        }
        true
    }
}

// =============================================================================
// Power comparison
// =============================================================================

/// Mean powers of the hold and trial segments over the trailing rows they
/// have in common. `None` when either segment has no power reading.
pub fn compare_powers(hold: &[MeasurementRecord], perturb: &[MeasurementRecord]) -> Option<(f64, f64)> {
    let hold: Vec<f64> = hold.iter().filter_map(MeasurementRecord::power).collect();
    let perturb: Vec<f64> = perturb.iter().filter_map(MeasurementRecord::power).collect();
    let n = hold.len().min(perturb.len());
    if n == 0 {
        return None;
    }
    let mean = |xs: &[f64]| xs[xs.len() - n..].iter().sum::<f64>() / n as f64;
    Some((mean(&hold), mean(&perturb)))
}

/// Potential of the row delivering the most power.
pub fn max_power_voltage(records: &[MeasurementRecord]) -> Option<f64> {
    records
        .iter()
        .filter_map(|r| Some((r.power()?, r.voltage?)))
        .min_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, voltage)| voltage)
}

fn mean_voltage(records: &[MeasurementRecord]) -> Option<f64> {
    let voltages: Vec<f64> = records.iter().filter_map(|r| r.voltage).collect();
    (!voltages.is_empty()).then(|| voltages.iter().sum::<f64>() / voltages.len() as f64)
}

// =============================================================================
// Tracker
// =============================================================================

struct Tracking {
    channel: u8,
    params: MppTrackingParams,
    updater: ParameterUpdater,
    states: watch::Receiver<ExecutorState>,
    segment: Arc<Mutex<Vec<MeasurementRecord>>>,
    voltage: f64,
    step: f64,
    cycles: usize,
    trace: Vec<f64>,
    timers: Vec<Timer>,
}

impl Tracking {
    fn take(&self) -> Vec<MeasurementRecord> {
        std::mem::take(&mut *self.segment.lock())
    }

    /// Waits until the channel runs; false if it ended first.
    async fn started(&mut self) -> bool {
        self.states
            .wait_for(|s| !matches!(s, ExecutorState::Idle | ExecutorState::Connecting | ExecutorState::Loaded))
            .await
            .is_ok_and(|state| *state == ExecutorState::Running)
    }

    /// Sleeps `duration`; false if the channel left `Running` meanwhile.
    async fn hold(&mut self, duration: Duration) -> bool {
        let left = tokio::select! {
            () = sleep(duration) => false,
            _ = self.states.wait_for(|s| *s != ExecutorState::Running) => true,
        };
        !left && *self.states.borrow() == ExecutorState::Running
    }

    /// Applies `voltage`; false if the channel is no longer running.
    async fn apply(&self, voltage: f64) -> Result<bool> {
        match self.updater.update(0, &CaParams::voltage_update(&[voltage], None, None)).await {
            Ok(()) => Ok(true),
            Err(EchemError::ChannelState { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn status(&self, started: Instant) -> TrackerStatus {
        TrackerStatus {
            channel: self.channel,
            voltage: self.voltage,
            cycles: self.cycles,
            elapsed: started.elapsed(),
        }
    }

    async fn run(&mut self) -> Result<()> {
        let (hold, perturb) = (self.params.hold_time()?, self.params.perturb_time()?);
        if !self.started().await {
            return Ok(());
        }
        let started = Instant::now();
        self.timers.iter_mut().for_each(Timer::start);
        info!(
            channel = self.channel,
            voltage = self.voltage,
            hold = ?hold,
            perturb = ?perturb,
            "Tracking maximum power point"
        );

        loop {
            let status = self.status(started);
            for timer in &mut self.timers {
                timer.call(&status);
            }

            if !self.hold(hold).await {
                break;
            }
            let held = self.take();

            if !self.apply(self.voltage + self.step).await? || !self.hold(perturb).await {
                break;
            }
            let perturbed = self.take();

            match compare_powers(&held, &perturbed) {
                Some((hold_power, trial_power)) => {
                    if trial_power >= hold_power {
                        self.step = -self.step;
                    }
                    self.voltage += self.step;
                    debug!(
                        channel = self.channel,
                        hold_power,
                        trial_power,
                        voltage = self.voltage,
                        "Moved held potential"
                    );
                }
                None => warn!(channel = self.channel, "No power readings to compare, keeping the held potential"),
            }
            self.cycles += 1;
            self.trace.push(self.voltage);

            if !self.apply(self.voltage).await? {
                break;
            }
        }
        info!(channel = self.channel, voltage = self.voltage, cycles = self.cycles, "Tracking ended");
        Ok(())
    }
}

/// Maximum power point tracking on one channel.
pub struct MppTracker {
    executor: ChannelExecutor,
    tracking: Tracking,
}

impl fmt::Debug for MppTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MppTracker")
            .field("channel", &self.tracking.channel)
            .field("voltage", &self.tracking.voltage)
            .field("cycles", &self.tracking.cycles)
            .field("state", &self.executor.state())
            .finish_non_exhaustive()
    }
}

impl MppTracker {
    /// Tracker for `channel` of `device`.
    pub fn new(device: Arc<Device>, channel: u8, params: MppTrackingParams, config: EngineConfig) -> Result<Self> {
        let technique = params.technique()?;
        let mut executor = ChannelExecutor::from_techniques(device, channel, &[technique], config)?;
        let segment = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&segment);
        executor.on_data(Arc::new(move |_: u8, records: &[MeasurementRecord]| {
            sink.lock().extend_from_slice(records);
        }));
        let tracking = Tracking {
            channel,
            updater: executor.updater(),
            states: executor.subscribe(),
            segment,
            voltage: params.start_voltage,
            step: params.perturb_step,
            cycles: 0,
            trace: Vec::new(),
            timers: Vec::new(),
            params,
        };
        Ok(Self { executor, tracking })
    }

    /// Shares `stop` with other programs.
    #[must_use]
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.executor = self.executor.with_stop_signal(stop);
        self
    }

    /// Runs `callback` every `period` between cycles, `repeat` times or
    /// indefinitely when `None`.
    pub fn on_timeout(&mut self, period: Duration, repeat: Option<u32>, kind: TimeoutKind, callback: TimedCallback) {
        self.tracking.timers.push(Timer::new(period, repeat, kind, callback));
    }

    /// Potential currently held, in volts.
    pub fn voltage(&self) -> f64 {
        self.tracking.voltage
    }

    /// Held potential after each completed cycle.
    pub fn trace(&self) -> &[f64] {
        &self.tracking.trace
    }

    /// Underlying CALIMIT executor.
    pub fn executor(&self) -> &ChannelExecutor {
        &self.executor
    }

    /// Records acquired so far.
    pub fn records(&self) -> &[MeasurementRecord] {
        self.executor.records()
    }

    /// Stop signal ending the run.
    pub fn stop_signal(&self) -> StopSignal {
        self.executor.stop_signal()
    }
}

#[async_trait]
impl Program for MppTracker {
    /// Runs the channel and the tracking loop side by side. A failed
    /// potential update stops the channel and is returned once it stopped.
    async fn run(&mut self) -> Result<()> {
        let stop = self.executor.stop_signal();
        let tracking = &mut self.tracking;
        let tracked = async {
            let result = tracking.run().await;
            if let Err(err) = &result {
                error!(channel = tracking.channel, error = %err, "Tracking failed, stopping channel");
                stop.trigger();
            }
            result
        };
        let (ran, tracked) = tokio::join!(self.executor.run(), tracked);
        ran?;
        tracked
    }

    fn stop(&self) {
        self.executor.stop_signal().trigger();
    }

    fn on_data(&mut self, callback: DataCallback) {
        self.executor.on_data(callback);
    }

    fn channel_state(&self) -> ExecutorState {
        self.executor.state()
    }
}

// =============================================================================
// Scan then track
// =============================================================================

fn default_voc_time() -> f64 {
    1.0
}

fn default_scan_step() -> f64 {
    5e-3
}

fn default_scan_rate() -> f64 {
    100.0
}

/// Parameters of [`Mpp`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MppParams {
    /// Tracking parameters; the start voltage is replaced by the scan result.
    #[serde(flatten)]
    pub tracking: MppTrackingParams,
    /// Open circuit rest before the scan, in seconds.
    #[serde(default = "default_voc_time")]
    pub voc_time: f64,
    /// Potential step of the JV scan, in volts.
    #[serde(default = "default_scan_step")]
    pub scan_step: f64,
    /// Rate of the JV scan, as given to [`JvScanParams::rate`].
    #[serde(default = "default_scan_rate")]
    pub scan_rate: f64,
}

impl MppParams {
    /// Scan then track for `run_time` seconds with default settings.
    pub fn new(run_time: f64) -> Self {
        Self {
            tracking: MppTrackingParams::new(0.0, run_time),
            voc_time: default_voc_time(),
            scan_step: default_scan_step(),
            scan_rate: default_scan_rate(),
        }
    }

    fn ocv(&self) -> Technique {
        Technique::Ocv(OcvParams {
            time: self.voc_time,
            time_interval: 0.1,
            voltage_interval: 1e-3,
        })
    }

    fn scan(&self, voc: f64) -> Technique {
        Technique::JvScan(JvScanParams {
            start: voc,
            end: 0.0,
            step: self.scan_step,
            rate: self.scan_rate,
            average: false,
        })
    }
}

/// Session a multi-stage program keeps open across its stages.
struct HeldSession {
    device: Arc<Device>,
    token: SessionToken,
    held: bool,
}

impl HeldSession {
    fn new(device: Arc<Device>) -> Self {
        let token = device.session_token();
        Self {
            device,
            token,
            held: false,
        }
    }

    async fn acquire(&mut self, config: &EngineConfig) -> Result<()> {
        if !config.autoconnect {
            return Ok(());
        }
        self.held = true;
        let (limit, token) = (config.connect_timeout, self.token);
        call(&config.retry, "connect", limit, &self.device, move |device| {
            device.acquire(token, limit)
        })
        .await
        .map(|_| ())
    }

    async fn release(&mut self, config: &EngineConfig) {
        if !std::mem::take(&mut self.held) {
            return;
        }
        let (device, token) = (Arc::clone(&self.device), self.token);
        if let Err(err) = blocking("disconnect", config.call_timeout, device, move |d| d.release(token)).await {
            warn!(device = %self.device.address(), error = %err, "Failed to release device session");
        }
    }
}

/// Open circuit rest, JV scan and tracking from the scan's maximum power
/// point, on one channel.
pub struct Mpp {
    device: Arc<Device>,
    channel: u8,
    params: MppParams,
    config: EngineConfig,
    stop: StopSignal,
    state: ExecutorState,
    callbacks: Vec<DataCallback>,
    timers: Vec<(Duration, Option<u32>, TimeoutKind, TimedCallback)>,
    voc: Option<f64>,
    ocv: Vec<MeasurementRecord>,
    scan: Vec<MeasurementRecord>,
    tracker: Option<MppTracker>,
    error: Option<EchemError>,
}

impl fmt::Debug for Mpp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mpp")
            .field("channel", &self.channel)
            .field("state", &self.state)
            .field("voc", &self.voc)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl Mpp {
    /// Program for `channel` of `device`.
    pub fn new(device: Arc<Device>, channel: u8, params: MppParams, config: EngineConfig) -> Result<Self> {
        params.tracking.validate()?;
        if !positive(params.voc_time) {
            return Err(EchemError::invalid("open circuit time must be positive"));
        }
        Ok(Self {
            device,
            channel,
            params,
            config,
            stop: StopSignal::new(),
            state: ExecutorState::Idle,
            callbacks: Vec::new(),
            timers: Vec::new(),
            voc: None,
            ocv: Vec::new(),
            scan: Vec::new(),
            tracker: None,
            error: None,
        })
    }

    /// Shares `stop` with other programs.
    #[must_use]
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Registers a timed callback for the tracking stage, see
    /// [`MppTracker::on_timeout`].
    pub fn on_timeout(&mut self, period: Duration, repeat: Option<u32>, kind: TimeoutKind, callback: TimedCallback) {
        self.timers.push((period, repeat, kind, callback));
    }

    /// Channel number.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Stop signal shared by every stage.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Mean open circuit voltage measured before the scan.
    pub fn voc(&self) -> Option<f64> {
        self.voc
    }

    /// Records of the open circuit rest.
    pub fn ocv_records(&self) -> &[MeasurementRecord] {
        &self.ocv
    }

    /// Records of the JV scan.
    pub fn scan_records(&self) -> &[MeasurementRecord] {
        &self.scan
    }

    /// Tracking stage, once it was reached.
    pub fn tracker(&self) -> Option<&MppTracker> {
        self.tracker.as_ref()
    }

    /// Every record of every stage, in acquisition order.
    pub fn records(&self) -> Vec<MeasurementRecord> {
        let tracked = self.tracker.as_ref().map_or(&[][..], MppTracker::records);
        [&self.ocv[..], &self.scan[..], tracked].concat()
    }

    /// Failure that ended the program.
    pub fn error(&self) -> Option<&EchemError> {
        self.error.as_ref()
    }

    async fn stage(&self, technique: Technique) -> Result<ChannelExecutor> {
        let device = Arc::clone(&self.device);
        let mut executor = ChannelExecutor::from_techniques(device, self.channel, &[technique], self.config.clone())?
            .with_stop_signal(self.stop.clone());
        for callback in &self.callbacks {
            executor.on_data(Arc::clone(callback));
        }
        executor.run().await?;
        Ok(executor)
    }

    #[instrument(skip(self), fields(channel = self.channel, device = %self.device.address()))]
    async fn stages(&mut self) -> Result<()> {
        let channel = self.channel;
        let mut ocv = self.stage(self.params.ocv()).await?;
        self.ocv = ocv.take_records();
        let voc = mean_voltage(&self.ocv)
            .ok_or_else(|| EchemError::invalid(format!("no open circuit reading on channel {channel}")))?;
        self.voc = Some(voc);
        info!(voc, "Open circuit voltage measured");
        if self.stop.is_triggered() {
            return Ok(());
        }

        let mut scan = self.stage(self.params.scan(voc)).await?;
        self.scan = scan.take_records();
        let start_voltage = max_power_voltage(&self.scan)
            .ok_or_else(|| EchemError::invalid(format!("no JV scan reading on channel {channel}")))?;
        info!(start_voltage, rows = self.scan.len(), "JV scan done");
        if self.stop.is_triggered() {
            return Ok(());
        }

        let params = MppTrackingParams {
            start_voltage,
            ..self.params.tracking.clone()
        };
        let mut tracker = MppTracker::new(Arc::clone(&self.device), channel, params, self.config.clone())?
            .with_stop_signal(self.stop.clone());
        for callback in &self.callbacks {
            tracker.on_data(Arc::clone(callback));
        }
        for (period, repeat, kind, callback) in self.timers.drain(..) {
            tracker.on_timeout(period, repeat, kind, callback);
        }
        let result = tracker.run().await;
        self.tracker = Some(tracker);
        result
    }
}

#[async_trait]
impl Program for Mpp {
    async fn run(&mut self) -> Result<()> {
        if self.state != ExecutorState::Idle {
            return Err(EchemError::ChannelState {
                operation: "run",
                state: self.state.to_string(),
            });
        }
        self.state = ExecutorState::Running;

        let config = self.config.clone();
        let mut session = HeldSession::new(Arc::clone(&self.device));
        let mut result = session.acquire(&config).await;
        if result.is_ok() {
            result = self.stages().await;
        }
        session.release(&config).await;

        match &result {
            Ok(()) => self.state = ExecutorState::Stopped,
            Err(err) => {
                error!(channel = self.channel, error = %err, "MPP program failed");
                self.error = Some(err.clone());
                self.state = ExecutorState::Errored;
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
        self.state
    }
}

// =============================================================================
// Repeated scans
// =============================================================================

/// Tracking time of each cycle: whole `interval`s, then the remainder.
pub fn cycle_durations(total: f64, interval: f64) -> Result<Vec<f64>> {
    if !positive(total) || !positive(interval) || !total.is_finite() {
        return Err(EchemError::invalid("run time and scan interval must be positive"));
    }
    let ratio = total / interval;
    let whole = ratio.floor();
    // whole is finite and non-negative here
    let mut durations = vec![interval; whole as usize];
    let remainder = ratio - whole;
    if remainder > 1e-9 {
        durations.push(remainder * interval);
    }
    Ok(durations)
}

/// [`Mpp`] repeated so a fresh JV scan restarts tracking every
/// `scan_interval` seconds.
pub struct MppCycles {
    device: Arc<Device>,
    channel: u8,
    params: MppParams,
    config: EngineConfig,
    durations: Vec<f64>,
    stop: StopSignal,
    state: ExecutorState,
    callbacks: Vec<DataCallback>,
    cycles: Vec<Mpp>,
}

impl fmt::Debug for MppCycles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MppCycles")
            .field("channel", &self.channel)
            .field("state", &self.state)
            .field("planned", &self.durations.len())
            .field("done", &self.cycles.len())
            .finish_non_exhaustive()
    }
}

impl MppCycles {
    /// `params.tracking.run_time` is the total tracking time, split into
    /// cycles of `scan_interval` seconds.
    pub fn new(
        device: Arc<Device>,
        channel: u8,
        params: MppParams,
        scan_interval: f64,
        config: EngineConfig,
    ) -> Result<Self> {
        let durations = cycle_durations(params.tracking.run_time, scan_interval)?;
        Ok(Self {
            device,
            channel,
            params,
            config,
            durations,
            stop: StopSignal::new(),
            state: ExecutorState::Idle,
            callbacks: Vec::new(),
            cycles: Vec::new(),
        })
    }

    /// Shares `stop` with other programs.
    #[must_use]
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Tracking time of each planned cycle.
    pub fn durations(&self) -> &[f64] {
        &self.durations
    }

    /// Cycles run so far.
    pub fn cycles(&self) -> &[Mpp] {
        &self.cycles
    }

    async fn run_cycles(&mut self) -> Result<()> {
        for (cycle, &run_time) in self.durations.iter().enumerate() {
            if self.stop.is_triggered() {
                break;
            }
            info!(channel = self.channel, cycle, run_time, "Starting MPP cycle");
            let mut params = self.params.clone();
            params.tracking.run_time = run_time;
            let mut mpp = Mpp::new(Arc::clone(&self.device), self.channel, params, self.config.clone())?
                .with_stop_signal(self.stop.clone());
            for callback in &self.callbacks {
                mpp.on_data(Arc::clone(callback));
            }
            let result = mpp.run().await;
            self.cycles.push(mpp);
            result?;
        }
        Ok(())
    }
}

#[async_trait]
impl Program for MppCycles {
    async fn run(&mut self) -> Result<()> {
        if self.state != ExecutorState::Idle {
            return Err(EchemError::ChannelState {
                operation: "run",
                state: self.state.to_string(),
            });
        }
        self.state = ExecutorState::Running;

        let config = self.config.clone();
        let mut session = HeldSession::new(Arc::clone(&self.device));
        let mut result = session.acquire(&config).await;
        if result.is_ok() {
            result = self.run_cycles().await;
        }
        session.release(&config).await;

        self.state = if result.is_ok() {
            ExecutorState::Stopped
        } else {
            ExecutorState::Errored
        };
        result
    }

    fn stop(&self) {
        self.stop.trigger();
    }

    fn on_data(&mut self, callback: DataCallback) {
        self.callbacks.push(callback);
    }

    fn channel_state(&self) -> ExecutorState {
        self.state
    }
}
