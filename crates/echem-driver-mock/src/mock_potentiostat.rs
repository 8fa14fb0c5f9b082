//! Simulated potentiostat implementing [`DriverInterface`].
//!
//! The simulator keeps a per-channel acquisition timeline. Loading a
//! sequence parses the parameter records the engine sends, starting it fixes
//! the timeline (one segment per technique phase), and each poll returns the
//! rows whose timestamps have elapsed since the previous poll, encoded with
//! the row layout of the simulated device family. Values come from a
//! [`CellModel`].
//!
//! Calls block the calling thread for the configured latency, the same way
//! calls into the native library do.
//!
//! # Example
//!
//! ```rust,ignore
//! use echem_driver_mock::{MockMode, MockPotentiostat};
//!
//! let mock = MockPotentiostat::builder()
//!     .model("SP-300")?
//!     .mode(MockMode::Realistic)
//!     .seed(7)
//!     .build();
//! ```

use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};
use crate::signal::{sweep_frequencies, CellModel};
use anyhow::{anyhow, Result};
use echem_core::catalog::{self, ChannelState, DeviceDescriptor, DeviceFamily, IRange, TechniqueId};
use echem_core::driver::{Connection, DeviceInfo, DriverInterface, DriverResult, HardwareConfig};
use echem_core::error::{DriverError, DriverErrorKind};
use echem_core::parameter::ParamRecord;
use echem_core::telemetry::{self, AcquisitionRow, ChannelValues, FrameInfo, PollFrame, Quantity, WordKind};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Techniques the simulator can run.
const TECHNIQUES: &[TechniqueId] = &[
    TechniqueId::Ocv,
    TechniqueId::Ca,
    TechniqueId::Cp,
    TechniqueId::Cv,
    TechniqueId::Peis,
    TechniqueId::Geis,
    TechniqueId::CaLimit,
    TechniqueId::CpLimit,
];

/// Row interval used when a technique declares none.
const DEFAULT_RECORD_INTERVAL: f64 = 0.1;

/// Time spent on one frequency of an impedance sweep, in seconds.
const SWEEP_POINT_TIME: f64 = 0.02;

const DEFAULT_CHANNELS: u8 = 16;
const FIRMWARE_VERSION: i32 = 6;

// Native status codes returned by the simulator.
const NOT_CONNECTED: i32 = -1;
const CHANNEL_NOT_PLUGGED: i32 = -3;
const INVALID_PARAMETERS: i32 = -4;
const FUNCTION_FAILED: i32 = -6;
const CHANNEL_RUNNING: i32 = -13;
const INVALID_UPDATE: i32 = -15;
const FILE_NOT_FOUND: i32 = -400;
const INCOMPATIBLE_FILE: i32 = -401;

// =============================================================================
// Technique programs
// =============================================================================

/// Typed view of the parameter records of one technique.
struct Params<'a>(&'a [ParamRecord]);

impl Params<'_> {
    /// Values of `label` ordered by element index.
    fn list(&self, label: &str) -> Vec<f64> {
        let mut values: Vec<(i32, f64)> = self
            .0
            .iter()
            .filter(|r| r.label() == label)
            .filter_map(|r| r.typed_value().map(|v| (r.index(), v.as_f64())))
            .collect();
        values.sort_by_key(|(index, _)| *index);
        values.into_iter().map(|(_, value)| value).collect()
    }

    fn get(&self, label: &str) -> Option<f64> {
        self.list(label).first().copied()
    }

    fn require(&self, label: &str) -> DriverResult<f64> {
        self.get(label).ok_or_else(|| missing(label))
    }

    /// Positive interval from `label`, or the default.
    fn interval(&self, label: &str) -> f64 {
        self.get(label)
            .filter(|v| v.is_finite() && *v > 0.0)
            .unwrap_or(DEFAULT_RECORD_INTERVAL)
    }

    /// `(value, duration)` pairs of a step technique.
    fn steps(&self, label: &str) -> DriverResult<Vec<(f64, f64)>> {
        let count = self.require("Step_number")? as usize + 1;
        let values = self.list(label);
        let durations = self.list("Duration_step");
        if values.len() < count || durations.len() < count {
            return Err(DriverError::new(
                DriverErrorKind::InvalidParameters,
                format!("{count} steps declared, {} {label} and {} durations loaded", values.len(), durations.len()),
            ));
        }
        Ok(values.into_iter().zip(durations).take(count).collect())
    }
}

fn missing(label: &str) -> DriverError {
    let mut err = DriverError::from_code(INVALID_PARAMETERS);
    err.message = format!("{}: missing {label}", err.message);
    err
}

/// What the channel applies to the cell.
#[derive(Debug, Clone, PartialEq)]
enum Drive {
    Rest,
    Potential(Vec<(f64, f64)>),
    Current(Vec<(f64, f64)>),
    Sweep {
        vertices: Vec<f64>,
        /// Scan rate in V/s.
        rate: f64,
    },
    Impedance {
        dc: f64,
        galvanostatic: bool,
        amplitude: f64,
        frequencies: Vec<f64>,
    },
}

/// One acquisition phase of a technique.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Phase {
    process: i32,
    duration: f64,
    interval: f64,
    rows: usize,
}

impl Phase {
    fn time_domain(duration: f64, interval: f64) -> Self {
        let rows = if duration > 0.0 {
            (duration / interval + 1e-9).floor() as usize + 1
        } else {
            0
        };
        Self {
            process: 0,
            duration: duration.max(0.0),
            interval,
            rows,
        }
    }

    fn sweep(points: usize) -> Self {
        Self {
            process: 1,
            duration: points as f64 * SWEEP_POINT_TIME,
            interval: SWEEP_POINT_TIME,
            rows: points,
        }
    }
}

/// Simulated behavior of a loaded technique.
#[derive(Debug, Clone, PartialEq)]
struct Program {
    drive: Drive,
    phases: Vec<Phase>,
    current_range: i32,
}

impl Program {
    fn parse(technique: TechniqueId, records: &[ParamRecord]) -> DriverResult<Self> {
        let p = Params(records);
        let current_range = p
            .get("I_Range")
            .map_or(IRange::Auto.code(), |code| code as i32);
        let (drive, phases) = match technique {
            TechniqueId::Ocv => {
                let duration = p.require("Rest_time_T")?;
                (Drive::Rest, vec![Phase::time_domain(duration, p.interval("Record_every_dT"))])
            }
            TechniqueId::Ca | TechniqueId::CaLimit => {
                let steps = p.steps("Voltage_step")?;
                let duration = steps.iter().map(|(_, d)| d).sum();
                (
                    Drive::Potential(steps),
                    vec![Phase::time_domain(duration, p.interval("Record_every_dT"))],
                )
            }
            TechniqueId::Cp | TechniqueId::CpLimit => {
                let steps = p.steps("Current_step")?;
                let duration = steps.iter().map(|(_, d)| d).sum();
                (
                    Drive::Current(steps),
                    vec![Phase::time_domain(duration, p.interval("Record_every_dT"))],
                )
            }
            TechniqueId::Cv => {
                let vertices = p.list("Voltage_step");
                if vertices.is_empty() {
                    return Err(missing("Voltage_step"));
                }
                // V/s
                let rate = p
                    .list("Scan_Rate")
                    .into_iter()
                    .find(|r| *r > 0.0)
                    .ok_or_else(|| missing("Scan_Rate"))?;
                let path: f64 = vertices.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
                let interval = p
                    .get("Record_every_dE")
                    .filter(|de| *de > 0.0)
                    .map_or(DEFAULT_RECORD_INTERVAL, |de| de / rate);
                (
                    Drive::Sweep { vertices, rate },
                    vec![Phase::time_domain(path / rate, interval)],
                )
            }
            TechniqueId::Peis | TechniqueId::Geis => {
                let galvanostatic = technique == TechniqueId::Geis;
                let (dc_label, amplitude_label) = if galvanostatic {
                    ("Initial_Current_step", "Amplitude_Current")
                } else {
                    ("Initial_Voltage_step", "Amplitude_Voltage")
                };
                let points = p.require("Frequency_number")?.max(0.0) as usize;
                let frequencies = sweep_frequencies(
                    p.require("Initial_frequency")?,
                    p.require("Final_frequency")?,
                    points,
                    p.get("sweep").is_some_and(|s| s != 0.0),
                );
                let mut phases = Vec::with_capacity(2);
                let step = p.get("Duration_step").unwrap_or(0.0);
                if step > 0.0 {
                    phases.push(Phase::time_domain(step, p.interval("Record_every_dT")));
                }
                phases.push(Phase::sweep(frequencies.len()));
                (
                    Drive::Impedance {
                        dc: p.require(dc_label)?,
                        galvanostatic,
                        amplitude: p.require(amplitude_label)?,
                        frequencies,
                    },
                    phases,
                )
            }
            TechniqueId::None => return Err(DriverError::from_code(FILE_NOT_FOUND)),
        };
        Ok(Self {
            drive,
            phases,
            current_range,
        })
    }

    /// Values at `local` seconds into the technique, `t` seconds into the run.
    fn sample(&self, cell: &CellModel, local: f64, t: f64, point: usize) -> Sample {
        match &self.drive {
            Drive::Rest => {
                let voltage = cell.open_circuit(t);
                Sample {
                    voltage,
                    ..Sample::default()
                }
            }
            Drive::Potential(steps) => {
                let control = step_value(steps, local);
                Sample {
                    voltage: control,
                    current: cell.current_at(control, t),
                    control,
                    ..Sample::default()
                }
            }
            Drive::Current(steps) => {
                let control = step_value(steps, local);
                Sample {
                    voltage: cell.potential_at(control, t),
                    current: control,
                    control,
                    ..Sample::default()
                }
            }
            Drive::Sweep { vertices, rate } => {
                let control = sweep_value(vertices, *rate, local);
                Sample {
                    voltage: control,
                    current: cell.current_at(control, t),
                    control,
                    ..Sample::default()
                }
            }
            Drive::Impedance {
                dc,
                galvanostatic,
                amplitude,
                frequencies,
            } => {
                let (voltage, current) = if *galvanostatic {
                    (cell.potential_at(*dc, t), *dc)
                } else {
                    (*dc, cell.current_at(*dc, t))
                };
                let mut sample = Sample {
                    voltage,
                    current,
                    control: *dc,
                    ..Sample::default()
                };
                if let Some(frequency) = frequencies.get(point) {
                    let (modulus, phase) = cell.impedance_polar(*frequency);
                    sample.frequency = *frequency;
                    sample.phase = phase;
                    if *galvanostatic {
                        sample.abs_current = *amplitude;
                        sample.abs_voltage = amplitude * modulus;
                    } else {
                        sample.abs_voltage = *amplitude;
                        sample.abs_current = amplitude / modulus;
                    }
                }
                sample
            }
        }
    }
}

fn step_value(steps: &[(f64, f64)], local: f64) -> f64 {
    let mut end = 0.0;
    for (value, duration) in steps {
        end += duration;
        if local < end {
            return *value;
        }
    }
    steps.last().map_or(0.0, |(value, _)| *value)
}

fn sweep_value(vertices: &[f64], rate: f64, local: f64) -> f64 {
    let mut remaining = local;
    for pair in vertices.windows(2) {
        let span = (pair[1] - pair[0]).abs() / rate;
        if remaining <= span {
            let direction = (pair[1] - pair[0]).signum();
            return pair[0] + direction * remaining * rate;
        }
        remaining -= span;
    }
    vertices.last().copied().unwrap_or(0.0)
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Sample {
    voltage: f64,
    current: f64,
    control: f64,
    frequency: f64,
    abs_voltage: f64,
    abs_current: f64,
    phase: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct LoadedTechnique {
    id: TechniqueId,
    file: String,
    program: Program,
}

// =============================================================================
// Channel timeline
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct Segment {
    technique_index: usize,
    technique: TechniqueId,
    process: i32,
    offset: f64,
    /// Offset of the owning technique.
    technique_offset: f64,
    interval: f64,
    rows: usize,
}

impl Segment {
    /// Rows whose timestamp is not after `t`.
    fn rows_until(&self, t: f64) -> usize {
        if self.rows == 0 || t < self.offset {
            return 0;
        }
        let elapsed = ((t - self.offset) / self.interval + 1e-9).floor() as usize + 1;
        elapsed.min(self.rows)
    }

    fn time_of(&self, row: usize) -> f64 {
        self.offset + row as f64 * self.interval
    }
}

#[derive(Debug)]
struct Run {
    started: Instant,
    first_poll: Option<Instant>,
    segments: Vec<Segment>,
    end: f64,
    stopped_at: Option<f64>,
    emitted: Vec<usize>,
    rows_emitted: u64,
    last: Sample,
}

impl Run {
    fn new(loaded: &[LoadedTechnique]) -> Self {
        let mut segments = Vec::new();
        let mut offset = 0.0;
        for (technique_index, technique) in loaded.iter().enumerate() {
            let technique_offset = offset;
            for phase in &technique.program.phases {
                segments.push(Segment {
                    technique_index,
                    technique: technique.id,
                    process: phase.process,
                    offset,
                    technique_offset,
                    interval: phase.interval,
                    rows: phase.rows,
                });
                offset += phase.duration;
            }
        }
        let emitted = vec![0; segments.len()];
        Self {
            started: Instant::now(),
            first_poll: None,
            segments,
            end: offset,
            stopped_at: None,
            emitted,
            rows_emitted: 0,
            last: Sample::default(),
        }
    }

    /// Time the timeline ends at.
    fn horizon(&self) -> f64 {
        self.stopped_at.map_or(self.end, |stop| stop.min(self.end))
    }

    /// Seconds since start, frozen at the horizon.
    fn clock(&self) -> f64 {
        self.started.elapsed().as_secs_f64().min(self.horizon())
    }

    fn is_active(&self) -> bool {
        self.stopped_at.is_none() && self.started.elapsed().as_secs_f64() < self.end
    }

    fn pending(&self) -> Option<usize> {
        let horizon = self.horizon();
        (0..self.segments.len()).find(|&k| self.emitted[k] < self.segments[k].rows_until(horizon))
    }
}

#[derive(Debug, Default)]
struct ChannelSim {
    loaded: Vec<LoadedTechnique>,
    complete: bool,
    hardware: HardwareConfig,
    run: Option<Run>,
}

impl ChannelSim {
    fn is_active(&self) -> bool {
        self.run.as_ref().is_some_and(Run::is_active)
    }
}

// =============================================================================
// MockPotentiostat
// =============================================================================

/// Simulated multichannel potentiostat.
pub struct MockPotentiostat {
    model: &'static DeviceDescriptor,
    channels: Vec<u8>,
    timing: TimingConfig,
    errors: ErrorConfig,
    rng: Arc<MockRng>,
    cell: CellModel,
    noise: f64,
    counter_start: u64,
    high_word_wrap: Option<u32>,
    corrupt_every: Option<u64>,
    next_connection: AtomicI32,
    connections: Mutex<HashSet<i32>>,
    state: Mutex<HashMap<u8, ChannelSim>>,
}

impl fmt::Debug for MockPotentiostat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockPotentiostat")
            .field("model", &self.model.name)
            .field("channels", &self.channels)
            .field("timing", &self.timing)
            .finish_non_exhaustive()
    }
}

impl Default for MockPotentiostat {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPotentiostat {
    /// VMP3 with sixteen channels, no latency and no injected errors.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Builder for custom simulators.
    pub fn builder() -> MockPotentiostatBuilder {
        MockPotentiostatBuilder::default()
    }

    /// Simulated model.
    pub fn model(&self) -> &'static DeviceDescriptor {
        self.model
    }

    /// Device family of the simulated model.
    pub fn family(&self) -> DeviceFamily {
        self.model.family
    }

    /// Number of open connections.
    pub fn connections(&self) -> usize {
        self.connections.lock().len()
    }

    /// Techniques loaded on `channel`, in order.
    pub fn loaded(&self, channel: u8) -> Vec<TechniqueId> {
        self.state
            .lock()
            .get(&channel)
            .map(|sim| sim.loaded.iter().map(|t| t.id).collect())
            .unwrap_or_default()
    }

    /// Whether `channel` is acquiring.
    pub fn is_running(&self, channel: u8) -> bool {
        self.state.lock().get(&channel).is_some_and(ChannelSim::is_active)
    }

    /// When the current run of `channel` was first polled.
    pub fn first_poll(&self, channel: u8) -> Option<Instant> {
        self.state
            .lock()
            .get(&channel)
            .and_then(|sim| sim.run.as_ref())
            .and_then(|run| run.first_poll)
    }

    /// Forgets every loaded sequence and resets injected error state.
    pub fn reset(&self) {
        self.state.lock().clear();
        self.errors.reset();
    }

    fn delay(duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }

    /// Common prologue of channel calls: session check, error injection,
    /// latency.
    fn enter(&self, conn: &Connection, channel: u8, operation: &'static str) -> DriverResult<()> {
        if !self.connections.lock().contains(&conn.id) {
            return Err(DriverError::from_code(NOT_CONNECTED));
        }
        if !self.channels.contains(&channel) {
            return Err(DriverError::from_code(CHANNEL_NOT_PLUGGED));
        }
        self.errors.check_operation(operation)?;
        Self::delay(self.timing.call_latency);
        Ok(())
    }

    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            device_code: self.model.code,
            family: self.model.family,
            channels: self.channels.clone(),
            firmware_version: FIRMWARE_VERSION,
        }
    }

    fn technique_for(&self, file: &str) -> DriverResult<TechniqueId> {
        let stem = file
            .strip_suffix(".ecc")
            .ok_or_else(|| DriverError::from_code(FILE_NOT_FOUND))?;
        let suffix = self.model.family.technique_suffix();
        let name = match stem.strip_suffix('4') {
            Some(name) if suffix == "4" => name,
            None if suffix.is_empty() => stem,
            _ => return Err(DriverError::from_code(INCOMPATIBLE_FILE)),
        };
        TECHNIQUES
            .iter()
            .copied()
            .find(|t| t.name() == name)
            .ok_or_else(|| DriverError::from_code(FILE_NOT_FOUND))
    }

    /// Hardware counter words for `t` seconds into the run.
    fn counter(&self, t: f64) -> (u32, u32) {
        let ticks = self.counter_start + (t / self.timing.time_base).round() as u64;
        let mut high = (ticks >> 32) as u32;
        if let Some(wrap) = self.high_word_wrap {
            high %= wrap.max(1);
        }
        (high, ticks as u32)
    }

    fn word(&self, quantity: Quantity, kind: WordKind, sample: &Sample, t: f64, current_range: i32) -> u32 {
        let value = match quantity {
            Quantity::Voltage => sample.voltage + self.rng.noise(self.noise),
            Quantity::Current => sample.current,
            Quantity::Control => sample.control,
            Quantity::Frequency => sample.frequency,
            Quantity::AbsVoltage => sample.abs_voltage,
            Quantity::AbsCurrent => sample.abs_current,
            Quantity::Phase => sample.phase,
            Quantity::Time => t,
            Quantity::CurrentRange => f64::from(current_range),
            Quantity::Cycle
            | Quantity::AbsVoltageCe
            | Quantity::AbsCurrentCe
            | Quantity::PhaseCe
            | Quantity::VoltageCe
            | Quantity::Unused => 0.0,
        };
        match kind {
            WordKind::Single => (value as f32).to_bits(),
            WordKind::Int32 => value as i32 as u32,
        }
    }
}

impl DriverInterface for MockPotentiostat {
    fn connect(&self, address: &str, timeout: Duration) -> DriverResult<Connection> {
        self.errors.check_operation("connect")?;
        if self.timing.connect_latency > timeout {
            Self::delay(timeout);
            return Err(DriverError::new(
                DriverErrorKind::Timeout,
                format!("no answer from {address} within {timeout:?}"),
            ));
        }
        Self::delay(self.timing.connect_latency);
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        self.connections.lock().insert(id);
        debug!(address, id, model = self.model.name, "Mock potentiostat connected");
        Ok(Connection { id, info: self.info() })
    }

    fn disconnect(&self, conn: &Connection) -> DriverResult<()> {
        if !self.connections.lock().remove(&conn.id) {
            return Err(DriverError::from_code(NOT_CONNECTED));
        }
        debug!(id = conn.id, "Mock potentiostat disconnected");
        Ok(())
    }

    fn load(
        &self,
        conn: &Connection,
        channel: u8,
        technique_file: &str,
        params: &[ParamRecord],
        is_first: bool,
        is_last: bool,
    ) -> DriverResult<()> {
        self.enter(conn, channel, "load")?;
        let id = self.technique_for(technique_file)?;
        let program = Program::parse(id, params)?;

        let mut state = self.state.lock();
        let sim = state.entry(channel).or_default();
        if sim.is_active() {
            return Err(DriverError::from_code(CHANNEL_RUNNING));
        }
        if is_first {
            sim.loaded.clear();
            sim.run = None;
        } else if sim.loaded.is_empty() || sim.complete {
            let mut err = DriverError::from_code(INVALID_PARAMETERS);
            err.message = format!("{}: {technique_file} does not continue a sequence", err.message);
            return Err(err);
        }
        sim.loaded.push(LoadedTechnique {
            id,
            file: technique_file.to_string(),
            program,
        });
        sim.complete = is_last;
        debug!(channel, technique = %id, index = sim.loaded.len() - 1, is_last, "Technique loaded");
        Ok(())
    }

    fn update(
        &self,
        conn: &Connection,
        channel: u8,
        technique_index: usize,
        technique_file: &str,
        params: &[ParamRecord],
    ) -> DriverResult<()> {
        self.enter(conn, channel, "update")?;
        let mut state = self.state.lock();
        let sim = state.entry(channel).or_default();
        let technique = sim
            .loaded
            .get_mut(technique_index)
            .filter(|t| t.file == technique_file)
            .ok_or_else(|| DriverError::from_code(INVALID_UPDATE))?;
        let program = Program::parse(technique.id, params)?;
        // timing of a started sequence is fixed; only the applied values change
        technique.program.drive = program.drive;
        technique.program.current_range = program.current_range;
        debug!(channel, technique_index, "Technique parameters updated");
        Ok(())
    }

    fn start(&self, conn: &Connection, channel: u8) -> DriverResult<()> {
        self.enter(conn, channel, "start")?;
        let mut state = self.state.lock();
        let sim = state.entry(channel).or_default();
        if sim.is_active() {
            return Err(DriverError::from_code(CHANNEL_RUNNING));
        }
        if sim.loaded.is_empty() || !sim.complete {
            let mut err = DriverError::from_code(FUNCTION_FAILED);
            err.message = format!("{}: no complete sequence loaded on channel {channel}", err.message);
            return Err(err);
        }
        let run = Run::new(&sim.loaded);
        debug!(channel, segments = run.segments.len(), duration = run.end, "Channel started");
        sim.run = Some(run);
        Ok(())
    }

    fn stop(&self, conn: &Connection, channel: u8) -> DriverResult<()> {
        self.enter(conn, channel, "stop")?;
        let mut state = self.state.lock();
        if let Some(run) = state.get_mut(&channel).and_then(|sim| sim.run.as_mut()) {
            if run.stopped_at.is_none() {
                let at = run.clock();
                run.stopped_at = Some(at);
                debug!(channel, at, "Channel stopped");
            }
        }
        Ok(())
    }

    fn poll(&self, conn: &Connection, channel: u8) -> DriverResult<PollFrame> {
        self.enter(conn, channel, "poll")?;
        let family = self.model.family;
        let mut state = self.state.lock();
        let ChannelSim { loaded, run, .. } = state.entry(channel).or_default();

        let mut values = ChannelValues {
            time_base: self.timing.time_base,
            ..ChannelValues::default()
        };
        let Some(run) = run.as_mut() else {
            return Ok(PollFrame::empty(FrameInfo::default(), values));
        };
        run.first_poll.get_or_insert_with(Instant::now);

        let now = run.clock();
        let mut info = FrameInfo {
            start_time: 0.0,
            ..FrameInfo::default()
        };
        let mut rows = Vec::new();
        if let Some(k) = run.pending() {
            let segment = run.segments[k];
            info.technique_id = segment.technique.code();
            info.technique_index = segment.technique_index as i32;
            info.process_index = segment.process;
            let program = &loaded[segment.technique_index].program;
            let fields = telemetry::layout(segment.technique, family, segment.process).unwrap_or(&[]);
            values.i_range = program.current_range;

            let available = segment.rows_until(now);
            for j in run.emitted[k]..available {
                let t = segment.time_of(j);
                let sample = program.sample(&self.cell, t - segment.technique_offset, t, j);
                let (time_high, time_low) = self.counter(t);
                let payload = fields
                    .iter()
                    .map(|field| self.word(field.quantity, field.word, &sample, t, program.current_range))
                    .collect();
                run.rows_emitted += 1;
                let corrupt = self.corrupt_every.is_some_and(|n| run.rows_emitted % n == 0);
                rows.push(AcquisitionRow {
                    technique_index: info.technique_index + i32::from(corrupt),
                    time_high,
                    time_low,
                    payload,
                });
                run.last = sample;
            }
            run.emitted[k] = run.emitted[k].max(available);
        }

        let finished = now >= run.horizon() && run.pending().is_none();
        values.state = if finished { ChannelState::Stop } else { ChannelState::Run };
        values.ewe = run.last.voltage as f32;
        values.current = run.last.current as f32;
        values.frequency = run.last.frequency as f32;
        values.elapsed_time = now;
        trace!(channel, rows = rows.len(), state = ?values.state, elapsed = now, "Mock poll");
        Ok(PollFrame::from_rows(&rows, info, values))
    }

    fn hardware_config(&self, conn: &Connection, channel: u8) -> DriverResult<HardwareConfig> {
        self.enter(conn, channel, "hardware_config")?;
        Ok(self
            .state
            .lock()
            .get(&channel)
            .map(|sim| sim.hardware)
            .unwrap_or_default())
    }

    fn set_hardware_config(&self, conn: &Connection, channel: u8, config: HardwareConfig) -> DriverResult<()> {
        self.enter(conn, channel, "set_hardware_config")?;
        let mut state = self.state.lock();
        let sim = state.entry(channel).or_default();
        if sim.is_active() {
            return Err(DriverError::from_code(CHANNEL_RUNNING));
        }
        sim.hardware = config;
        Ok(())
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`MockPotentiostat`].
#[derive(Debug, Clone)]
pub struct MockPotentiostatBuilder {
    model: &'static DeviceDescriptor,
    channels: Option<Vec<u8>>,
    mode: MockMode,
    timing: Option<TimingConfig>,
    errors: Option<ErrorConfig>,
    seed: Option<u64>,
    cell: CellModel,
    noise: f64,
    counter_start: u64,
    high_word_wrap: Option<u32>,
    corrupt_every: Option<u64>,
}

impl Default for MockPotentiostatBuilder {
    fn default() -> Self {
        const VMP3: DeviceDescriptor = DeviceDescriptor {
            code: 5,
            name: "VMP3",
            family: DeviceFamily::Vmp3,
        };
        Self {
            model: catalog::device(VMP3.code).unwrap_or(&VMP3),
            channels: None,
            mode: MockMode::default(),
            timing: None,
            errors: None,
            seed: None,
            cell: CellModel::default(),
            noise: 1e-4,
            counter_start: 0,
            high_word_wrap: None,
            corrupt_every: None,
        }
    }
}

impl MockPotentiostatBuilder {
    /// Simulates the catalog model `name` (case and dashes ignored).
    pub fn model(mut self, name: &str) -> Result<Self> {
        self.model = catalog::device_by_name(name).ok_or_else(|| anyhow!("unknown potentiostat model '{name}'"))?;
        Ok(self)
    }

    /// Channels with a board plugged in.
    pub fn channels(mut self, channels: impl IntoIterator<Item = u8>) -> Self {
        self.channels = Some(channels.into_iter().collect());
        self
    }

    /// Operational mode; selects timing and error injection unless set
    /// explicitly.
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Explicit timing.
    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.timing = Some(timing);
        self
    }

    /// Explicit error injection.
    pub fn errors(mut self, errors: ErrorConfig) -> Self {
        self.errors = Some(errors);
        self
    }

    /// Seeds measurement noise and chaos failures.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Simulated cell.
    pub fn cell(mut self, cell: CellModel) -> Self {
        self.cell = cell;
        self
    }

    /// Amplitude of the uniform noise on measured potentials, in volts.
    pub fn noise(mut self, volts: f64) -> Self {
        self.noise = volts.abs();
        self
    }

    /// Initial value of the hardware time counter, in ticks.
    pub fn counter_start(mut self, ticks: u64) -> Self {
        self.counter_start = ticks;
        self
    }

    /// Wraps the high counter word modulo `modulus`, simulating a counter
    /// rollover.
    pub fn high_word_wrap(mut self, modulus: u32) -> Self {
        self.high_word_wrap = Some(modulus);
        self
    }

    /// Emits every `n`th row with a wrong technique index.
    pub fn corrupt_every(mut self, n: u64) -> Self {
        self.corrupt_every = (n > 0).then_some(n);
        self
    }

    /// Builds the simulator.
    pub fn build(self) -> MockPotentiostat {
        MockPotentiostat {
            model: self.model,
            channels: self.channels.unwrap_or_else(|| (0..DEFAULT_CHANNELS).collect()),
            timing: self.timing.unwrap_or_else(|| self.mode.timing()),
            errors: self.errors.unwrap_or_else(|| self.mode.errors(self.seed)),
            rng: Arc::new(MockRng::new(self.seed)),
            cell: self.cell,
            noise: self.noise,
            counter_start: self.counter_start,
            high_word_wrap: self.high_word_wrap,
            corrupt_every: self.corrupt_every,
            next_connection: AtomicI32::new(1),
            connections: Mutex::new(HashSet::new()),
            state: Mutex::new(HashMap::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;
    use echem_core::catalog::{ChannelMode, ElectrodeConnection};
    use echem_core::parameter::{ParameterSet, TechniqueSequence};
    use echem_core::technique::{CaParams, OcvParams, PeisParams, Technique};
    use echem_core::telemetry::{decode_frame, MeasurementRecord, TimeCursor};

    fn records(technique: &Technique) -> Vec<ParamRecord> {
        let sequence =
            TechniqueSequence::build(vec![(technique.definition(), technique.parameters().unwrap())]).unwrap();
        sequence.entries()[0].bundle().records()
    }

    fn ocv(time: f64, interval: f64) -> Technique {
        Technique::Ocv(OcvParams {
            time_interval: interval,
            ..OcvParams::new(time)
        })
    }

    fn connected(mock: &MockPotentiostat) -> Connection {
        mock.connect("10.0.0.2", Duration::from_secs(1)).unwrap()
    }

    fn load_single(mock: &MockPotentiostat, conn: &Connection, channel: u8, technique: &Technique) {
        let file = technique.definition().file_name(mock.family());
        mock.load(conn, channel, &file, &records(technique), true, true).unwrap();
    }

    fn drain(mock: &MockPotentiostat, conn: &Connection, channel: u8) -> (Vec<MeasurementRecord>, usize, TimeCursor) {
        let mut cursor = TimeCursor::new();
        let mut out = Vec::new();
        let mut dropped = 0;
        for _ in 0..1_000 {
            let frame = mock.poll(conn, channel).unwrap();
            let decoded = decode_frame(&frame, mock.family(), cursor);
            cursor = decoded.cursor;
            dropped += decoded.dropped.len();
            out.extend(decoded.records);
            if frame.values.state == ChannelState::Stop {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        (out, dropped, cursor)
    }

    #[test]
    fn test_connect_reports_model() {
        let mock = MockPotentiostat::builder().model("sp300").unwrap().channels([0, 1]).build();
        let conn = connected(&mock);
        assert_eq!(conn.info.family, DeviceFamily::Sp300);
        assert_eq!(conn.info.model().map(|m| m.name), Some("SP-300"));
        assert_eq!(conn.info.channels, vec![0, 1]);
        assert_eq!(mock.connections(), 1);

        mock.disconnect(&conn).unwrap();
        assert_eq!(mock.poll(&conn, 0).unwrap_err().code, Some(NOT_CONNECTED));
        assert!(MockPotentiostat::builder().model("PST-9000").is_err());
    }

    #[test]
    fn test_connect_timeout() {
        let mock = MockPotentiostat::builder()
            .timing(TimingConfig::instant().with_connect_latency(Duration::from_millis(200)))
            .build();
        let err = mock.connect("10.0.0.2", Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
        assert_eq!(mock.connections(), 0);
    }

    #[test]
    fn test_load_checks_technique_file() {
        let mock = MockPotentiostat::new();
        let conn = connected(&mock);
        let params = records(&ocv(1.0, 0.1));

        let err = mock.load(&conn, 0, "ocv4.ecc", &params, true, true).unwrap_err();
        assert_eq!(err.code, Some(INCOMPATIBLE_FILE));
        let err = mock.load(&conn, 0, "eis.ecc", &params, true, true).unwrap_err();
        assert_eq!(err.code, Some(FILE_NOT_FOUND));
        let err = mock.load(&conn, 0, "ca.ecc", &params, true, true).unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InvalidParameters);
        let err = mock.load(&conn, 0, "ocv.ecc", &params, false, true).unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::InvalidParameters);
        assert_eq!(mock.load(&conn, 42, "ocv.ecc", &params, true, true).unwrap_err().code, Some(CHANNEL_NOT_PLUGGED));

        mock.load(&conn, 0, "ocv.ecc", &params, true, true).unwrap();
        assert_eq!(mock.loaded(0), vec![TechniqueId::Ocv]);
    }

    #[test]
    fn test_start_requires_complete_sequence() {
        let mock = MockPotentiostat::new();
        let conn = connected(&mock);
        assert_eq!(mock.start(&conn, 0).unwrap_err().code, Some(FUNCTION_FAILED));

        let params = records(&ocv(1.0, 0.1));
        mock.load(&conn, 0, "ocv.ecc", &params, true, false).unwrap();
        assert!(mock.start(&conn, 0).is_err());
        mock.load(&conn, 0, "ocv.ecc", &params, false, true).unwrap();
        mock.start(&conn, 0).unwrap();
        assert!(mock.is_running(0));
        assert_eq!(mock.start(&conn, 0).unwrap_err().code, Some(CHANNEL_RUNNING));
        assert_eq!(
            mock.load(&conn, 0, "ocv.ecc", &params, true, true).unwrap_err().code,
            Some(CHANNEL_RUNNING)
        );
        mock.stop(&conn, 0).unwrap();
        assert!(!mock.is_running(0));
    }

    #[test]
    fn test_ocv_rows_follow_record_interval() {
        let mock = MockPotentiostat::builder().seed(1).build();
        let conn = connected(&mock);
        load_single(&mock, &conn, 0, &ocv(0.1, 0.02));
        mock.start(&conn, 0).unwrap();

        let (records, dropped, _) = drain(&mock, &conn, 0);
        assert_eq!(dropped, 0);
        assert_eq!(records.len(), 6);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.technique, TechniqueId::Ocv);
            assert!((record.elapsed - i as f64 * 0.02).abs() < 1e-3, "row {i} at {}", record.elapsed);
            let voltage = record.voltage.unwrap();
            assert!((voltage - 0.455).abs() < 1e-3, "voltage {voltage}");
        }
        // a finished channel keeps reporting Stop without rows
        let frame = mock.poll(&conn, 0).unwrap();
        assert_eq!(frame.values.state, ChannelState::Stop);
        assert_eq!(frame.info.rows, 0);
    }

    #[test]
    fn test_stop_freezes_timeline() {
        let mock = MockPotentiostat::new();
        let conn = connected(&mock);
        load_single(&mock, &conn, 0, &ocv(60.0, 0.01));
        mock.start(&conn, 0).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        mock.stop(&conn, 0).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        let frame = mock.poll(&conn, 0).unwrap();
        assert_eq!(frame.values.state, ChannelState::Stop);
        assert!(frame.info.rows >= 3 && frame.info.rows < 10, "rows {}", frame.info.rows);
        assert_eq!(mock.poll(&conn, 0).unwrap().info.rows, 0);
    }

    #[test]
    fn test_sp300_layout_and_sequence_order() {
        let mock = MockPotentiostat::builder().model("SP-300").unwrap().build();
        let conn = connected(&mock);
        let first = ocv(0.04, 0.02);
        let second = Technique::Ca(CaParams {
            time_interval: 0.02,
            ..CaParams::new(vec![0.6], vec![0.04])
        });
        let sequence = TechniqueSequence::build(vec![
            (first.definition(), first.parameters().unwrap()),
            (second.definition(), second.parameters().unwrap()),
        ])
        .unwrap();
        for entry in sequence.entries() {
            let bundle = entry.bundle();
            let file = entry.definition().file_name(DeviceFamily::Sp300);
            assert!(file.ends_with("4.ecc"));
            mock.load(&conn, 0, &file, &bundle.records(), bundle.is_first(), bundle.is_last())
                .unwrap();
        }
        mock.start(&conn, 0).unwrap();

        let (records, _, _) = drain(&mock, &conn, 0);
        let techniques: Vec<_> = records.iter().map(|r| (r.technique, r.technique_index)).collect();
        assert_eq!(
            techniques,
            vec![
                (TechniqueId::Ocv, 0),
                (TechniqueId::Ocv, 0),
                (TechniqueId::Ocv, 0),
                (TechniqueId::Ca, 1),
                (TechniqueId::Ca, 1),
                (TechniqueId::Ca, 1),
            ]
        );
        assert!(records[..3].iter().all(|r| r.current.is_none()));
        let expected = (0.6 - 0.455) / 110.0;
        let current = records[3].current.unwrap();
        assert!((current - expected).abs() < 1e-5, "current {current}");
        assert!(records.windows(2).all(|w| w[0].elapsed <= w[1].elapsed));
    }

    #[test]
    fn test_impedance_sweep() {
        let mock = MockPotentiostat::new();
        let conn = connected(&mock);
        let peis = Technique::Peis(PeisParams {
            voltage: 0.5,
            vs_initial: false,
            amplitude: 0.01,
            initial_frequency: 1e5,
            final_frequency: 1.0,
            frequency_number: 4,
            logarithmic: true,
            average: 1,
            wait_for_steady: 0.0,
            duration: 0.0,
            time_interval: 0.1,
            current_interval: 1e-3,
        });
        load_single(&mock, &conn, 0, &peis);
        mock.start(&conn, 0).unwrap();

        let (records, dropped, _) = drain(&mock, &conn, 0);
        assert_eq!(dropped, 0);
        assert_eq!(records.len(), 4);
        let cell = CellModel::default();
        for record in &records {
            assert_eq!(record.process, 1);
            let z = record.impedance.unwrap();
            let (modulus, _) = cell.impedance_polar(z.frequency);
            assert!((z.modulus() / modulus - 1.0).abs() < 1e-3);
        }
        assert!(records.windows(2).all(|w| {
            w[0].impedance.unwrap().frequency > w[1].impedance.unwrap().frequency
        }));
    }

    #[test]
    fn test_update_changes_applied_potential() {
        let mock = MockPotentiostat::builder().noise(0.0).build();
        let conn = connected(&mock);
        let ca = Technique::Ca(CaParams {
            time_interval: 0.01,
            ..CaParams::new(vec![0.5], vec![30.0])
        });
        load_single(&mock, &conn, 0, &ca);
        mock.start(&conn, 0).unwrap();
        let before = decode_frame(&mock.poll(&conn, 0).unwrap(), DeviceFamily::Vmp3, TimeCursor::new());
        assert!((before.records[0].voltage.unwrap() - 0.5).abs() < 1e-6);

        let set = ParameterSet::new().with_list("Voltage_step", [0.8]);
        let mut sequence = TechniqueSequence::build(vec![(ca.definition(), ca.parameters().unwrap())]).unwrap();
        let partial = sequence.entries()[0].bundle().resolve(&set).unwrap();
        let params = sequence.update(0, &partial).unwrap().records();
        assert_eq!(
            mock.update(&conn, 0, 1, "ca.ecc", &params).unwrap_err().code,
            Some(INVALID_UPDATE)
        );
        mock.update(&conn, 0, 0, "ca.ecc", &params).unwrap();

        std::thread::sleep(Duration::from_millis(30));
        let after = decode_frame(&mock.poll(&conn, 0).unwrap(), DeviceFamily::Vmp3, before.cursor);
        let last = after.records.last().unwrap();
        assert!((last.voltage.unwrap() - 0.8).abs() < 1e-6);
        mock.stop(&conn, 0).unwrap();
    }

    #[test]
    fn test_counter_rollover_stays_monotonic() {
        // the high word wraps 40 ms into the run
        let mock = MockPotentiostat::builder()
            .counter_start((1u64 << 32) - 2_000)
            .high_word_wrap(1)
            .build();
        let conn = connected(&mock);
        load_single(&mock, &conn, 0, &ocv(0.1, 0.01));
        mock.start(&conn, 0).unwrap();

        let (records, _, cursor) = drain(&mock, &conn, 0);
        assert_eq!(records.len(), 11);
        assert_eq!(cursor.high_offset(), 1);
        for pair in records.windows(2) {
            let delta = pair[1].elapsed - pair[0].elapsed;
            assert!((delta - 0.01).abs() < 1e-3, "delta {delta}");
        }
    }

    #[test]
    fn test_corrupted_rows_are_dropped() {
        let mock = MockPotentiostat::builder().corrupt_every(3).build();
        let conn = connected(&mock);
        load_single(&mock, &conn, 0, &ocv(0.05, 0.01));
        mock.start(&conn, 0).unwrap();

        let (records, dropped, _) = drain(&mock, &conn, 0);
        assert_eq!(records.len() + dropped, 6);
        assert_eq!(dropped, 2);
    }

    #[test]
    fn test_hardware_config() {
        let mock = MockPotentiostat::new();
        let conn = connected(&mock);
        assert_eq!(mock.hardware_config(&conn, 1).unwrap(), HardwareConfig::default());
        let config = HardwareConfig {
            mode: ChannelMode::Floating,
            connection: ElectrodeConnection::Grounded,
        };
        mock.set_hardware_config(&conn, 1, config).unwrap();
        assert_eq!(mock.hardware_config(&conn, 1).unwrap(), config);

        load_single(&mock, &conn, 1, &ocv(60.0, 1.0));
        mock.start(&conn, 1).unwrap();
        assert_eq!(
            mock.set_hardware_config(&conn, 1, HardwareConfig::default()).unwrap_err().code,
            Some(CHANNEL_RUNNING)
        );
    }

    #[test]
    fn test_injected_poll_failure() {
        let mock = MockPotentiostat::builder()
            .errors(ErrorConfig::scenario(ErrorScenario::FailFirstN {
                operation: "poll",
                times: 1,
            }))
            .build();
        let conn = connected(&mock);
        let err = mock.poll(&conn, 0).unwrap_err();
        assert!(err.kind.is_transient());
        assert!(mock.poll(&conn, 0).is_ok());
    }
}
