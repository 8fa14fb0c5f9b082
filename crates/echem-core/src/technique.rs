//! Technique declarations and typed program parameters.
//!
//! A [`TechniqueDef`] declares the labels, types and list lengths a technique
//! accepts. The static definitions below cover the techniques the engine
//! drives. [`Technique`] wraps the typed parameters of each experiment
//! program and lowers them to the raw [`ParameterSet`] the marshaller bundles.

use crate::catalog::{DeviceFamily, ExitCondition, IRange, LimitTest, TechniqueId};
use crate::error::{EchemError, Result};
use crate::parameter::ParamKind::{Boolean, Int32, Single};
use crate::parameter::{ParamKind, ParameterSet};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum number of steps of a multi-step technique.
pub const MAX_STEPS: usize = 100;

/// Maximum number of limit tests of a limited technique.
pub const MAX_LIMIT_TESTS: usize = 3;

/// Number of vertices of a cyclic voltammetry profile.
const CV_VERTICES: usize = 5;

/// Declaration of one technique parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamDecl {
    /// Label understood by the technique file.
    pub name: &'static str,
    /// Declared type.
    pub kind: ParamKind,
    /// Maximum number of values for this label.
    pub max_len: usize,
}

impl ParamDecl {
    /// Declares a parameter accepting up to `max_len` values.
    pub const fn new(name: &'static str, kind: ParamKind, max_len: usize) -> Self {
        Self {
            name,
            kind,
            max_len,
        }
    }

    const fn scalar(name: &'static str, kind: ParamKind) -> Self {
        Self::new(name, kind, 1)
    }
}

/// Declaration of a technique's parameter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TechniqueDef {
    /// Technique identifier.
    pub id: TechniqueId,
    /// Accepted parameters.
    pub params: &'static [ParamDecl],
    /// Maximum number of values in one bundle.
    pub max_arity: usize,
    /// Parameter holding the maximum time between recorded points, in seconds.
    pub interval_param: Option<&'static str>,
}

impl TechniqueDef {
    const fn declare(id: TechniqueId, params: &'static [ParamDecl], interval_param: Option<&'static str>) -> Self {
        Self {
            id,
            params,
            max_arity: total_len(params),
            interval_param,
        }
    }

    /// Looks up a declared parameter.
    pub fn param(&self, name: &str) -> Option<&'static ParamDecl> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Technique file for `family`, see [`technique_file`].
    pub fn file_name(&self, family: DeviceFamily) -> String {
        technique_file(self.id.name(), family)
    }
}

const fn total_len(params: &[ParamDecl]) -> usize {
    let mut total = 0;
    let mut i = 0;
    while i < params.len() {
        total += params[i].max_len;
        i += 1;
    }
    total
}

/// Resolves a technique name to its file for a device family.
///
/// Names are lowercased; SP-300 family instruments use the `4` variant.
pub fn technique_file(name: &str, family: DeviceFamily) -> String {
    let stem = name.trim().trim_end_matches(".ecc").to_lowercase();
    format!("{stem}{}.ecc", family.technique_suffix())
}

const OCV_PARAMS: &[ParamDecl] = &[
    ParamDecl::scalar("Rest_time_T", Single),
    ParamDecl::scalar("Record_every_dE", Single),
    ParamDecl::scalar("Record_every_dT", Single),
    ParamDecl::scalar("E_Range", Int32),
];

const CA_PARAMS: &[ParamDecl] = &[
    ParamDecl::new("Voltage_step", Single, MAX_STEPS),
    ParamDecl::new("vs_initial", Boolean, MAX_STEPS),
    ParamDecl::new("Duration_step", Single, MAX_STEPS),
    ParamDecl::scalar("Step_number", Int32),
    ParamDecl::scalar("Record_every_dT", Single),
    ParamDecl::scalar("Record_every_dI", Single),
    ParamDecl::scalar("N_Cycles", Int32),
    ParamDecl::scalar("I_Range", Int32),
];

const CP_PARAMS: &[ParamDecl] = &[
    ParamDecl::new("Current_step", Single, MAX_STEPS),
    ParamDecl::new("vs_initial", Boolean, MAX_STEPS),
    ParamDecl::new("Duration_step", Single, MAX_STEPS),
    ParamDecl::scalar("Step_number", Int32),
    ParamDecl::scalar("Record_every_dT", Single),
    ParamDecl::scalar("Record_every_dE", Single),
    ParamDecl::scalar("N_Cycles", Int32),
    ParamDecl::scalar("I_Range", Int32),
];

const CV_PARAMS: &[ParamDecl] = &[
    ParamDecl::new("vs_initial", Boolean, CV_VERTICES),
    ParamDecl::new("Voltage_step", Single, CV_VERTICES),
    ParamDecl::new("Scan_Rate", Single, CV_VERTICES),
    ParamDecl::scalar("Scan_number", Int32),
    ParamDecl::scalar("Record_every_dE", Single),
    ParamDecl::scalar("Average_over_dE", Boolean),
    ParamDecl::scalar("N_Cycles", Int32),
    ParamDecl::scalar("Begin_measuring_I", Single),
    ParamDecl::scalar("End_measuring_I", Single),
    ParamDecl::scalar("I_Range", Int32),
];

const LIMIT_TEST_PARAMS: [ParamDecl; 7] = [
    ParamDecl::scalar("Test1_Config", Int32),
    ParamDecl::scalar("Test1_Value", Single),
    ParamDecl::scalar("Test2_Config", Int32),
    ParamDecl::scalar("Test2_Value", Single),
    ParamDecl::scalar("Test3_Config", Int32),
    ParamDecl::scalar("Test3_Value", Single),
    ParamDecl::scalar("Exit_Cond", Int32),
];

const CALIMIT_PARAMS: &[ParamDecl] = &[
    ParamDecl::new("Voltage_step", Single, MAX_STEPS),
    ParamDecl::new("vs_initial", Boolean, MAX_STEPS),
    ParamDecl::new("Duration_step", Single, MAX_STEPS),
    ParamDecl::scalar("Step_number", Int32),
    ParamDecl::scalar("Record_every_dT", Single),
    ParamDecl::scalar("Record_every_dI", Single),
    LIMIT_TEST_PARAMS[0],
    LIMIT_TEST_PARAMS[1],
    LIMIT_TEST_PARAMS[2],
    LIMIT_TEST_PARAMS[3],
    LIMIT_TEST_PARAMS[4],
    LIMIT_TEST_PARAMS[5],
    LIMIT_TEST_PARAMS[6],
    ParamDecl::scalar("N_Cycles", Int32),
    ParamDecl::scalar("I_Range", Int32),
];

const CPLIMIT_PARAMS: &[ParamDecl] = &[
    ParamDecl::new("Current_step", Single, MAX_STEPS),
    ParamDecl::new("vs_initial", Boolean, MAX_STEPS),
    ParamDecl::new("Duration_step", Single, MAX_STEPS),
    ParamDecl::scalar("Step_number", Int32),
    ParamDecl::scalar("Record_every_dT", Single),
    ParamDecl::scalar("Record_every_dE", Single),
    LIMIT_TEST_PARAMS[0],
    LIMIT_TEST_PARAMS[1],
    LIMIT_TEST_PARAMS[2],
    LIMIT_TEST_PARAMS[3],
    LIMIT_TEST_PARAMS[4],
    LIMIT_TEST_PARAMS[5],
    LIMIT_TEST_PARAMS[6],
    ParamDecl::scalar("N_Cycles", Int32),
    ParamDecl::scalar("I_Range", Int32),
];

const PEIS_PARAMS: &[ParamDecl] = &[
    ParamDecl::scalar("vs_initial", Boolean),
    ParamDecl::scalar("vs_final", Boolean),
    ParamDecl::scalar("Initial_Voltage_step", Single),
    ParamDecl::scalar("Final_Voltage_step", Single),
    ParamDecl::scalar("Duration_step", Single),
    ParamDecl::scalar("Step_number", Int32),
    ParamDecl::scalar("Record_every_dT", Single),
    ParamDecl::scalar("Record_every_dI", Single),
    ParamDecl::scalar("Final_frequency", Single),
    ParamDecl::scalar("Initial_frequency", Single),
    ParamDecl::scalar("sweep", Boolean),
    ParamDecl::scalar("Amplitude_Voltage", Single),
    ParamDecl::scalar("Frequency_number", Int32),
    ParamDecl::scalar("Average_N_times", Int32),
    ParamDecl::scalar("Correction", Boolean),
    ParamDecl::scalar("Wait_for_steady", Single),
];

const GEIS_PARAMS: &[ParamDecl] = &[
    ParamDecl::scalar("vs_initial", Boolean),
    ParamDecl::scalar("vs_final", Boolean),
    ParamDecl::scalar("Initial_Current_step", Single),
    ParamDecl::scalar("Final_Current_step", Single),
    ParamDecl::scalar("Duration_step", Single),
    ParamDecl::scalar("Step_number", Int32),
    ParamDecl::scalar("Record_every_dT", Single),
    ParamDecl::scalar("Record_every_dE", Single),
    ParamDecl::scalar("Final_frequency", Single),
    ParamDecl::scalar("Initial_frequency", Single),
    ParamDecl::scalar("sweep", Boolean),
    ParamDecl::scalar("Amplitude_Current", Single),
    ParamDecl::scalar("Frequency_number", Int32),
    ParamDecl::scalar("Average_N_times", Int32),
    ParamDecl::scalar("Correction", Boolean),
    ParamDecl::scalar("Wait_for_steady", Single),
    ParamDecl::scalar("I_Range", Int32),
];

const RECORD_DT: Option<&str> = Some("Record_every_dT");

/// Open circuit voltage.
pub static OCV: TechniqueDef = TechniqueDef::declare(TechniqueId::Ocv, OCV_PARAMS, RECORD_DT);
/// Chrono-amperometry.
pub static CA: TechniqueDef = TechniqueDef::declare(TechniqueId::Ca, CA_PARAMS, RECORD_DT);
/// Chrono-potentiometry.
pub static CP: TechniqueDef = TechniqueDef::declare(TechniqueId::Cp, CP_PARAMS, RECORD_DT);
/// Cyclic voltammetry.
pub static CV: TechniqueDef = TechniqueDef::declare(TechniqueId::Cv, CV_PARAMS, None);
/// Chrono-amperometry with limits.
pub static CALIMIT: TechniqueDef = TechniqueDef::declare(TechniqueId::CaLimit, CALIMIT_PARAMS, RECORD_DT);
/// Chrono-potentiometry with limits.
pub static CPLIMIT: TechniqueDef = TechniqueDef::declare(TechniqueId::CpLimit, CPLIMIT_PARAMS, RECORD_DT);
/// Potentio electrochemical impedance spectroscopy.
pub static PEIS: TechniqueDef = TechniqueDef::declare(TechniqueId::Peis, PEIS_PARAMS, RECORD_DT);
/// Galvano electrochemical impedance spectroscopy.
pub static GEIS: TechniqueDef = TechniqueDef::declare(TechniqueId::Geis, GEIS_PARAMS, RECORD_DT);

/// Static definition for a technique identifier.
pub fn definition(id: TechniqueId) -> Option<&'static TechniqueDef> {
    match id {
        TechniqueId::Ocv => Some(&OCV),
        TechniqueId::Ca => Some(&CA),
        TechniqueId::Cp => Some(&CP),
        TechniqueId::Cv => Some(&CV),
        TechniqueId::CaLimit => Some(&CALIMIT),
        TechniqueId::CpLimit => Some(&CPLIMIT),
        TechniqueId::Peis => Some(&PEIS),
        TechniqueId::Geis => Some(&GEIS),
        TechniqueId::None => None,
    }
}

fn default_time_interval() -> f64 {
    1.0
}

fn default_voltage_interval() -> f64 {
    0.01
}

fn default_current_interval() -> f64 {
    1e-3
}

fn default_current_range() -> IRange {
    IRange::M10
}

/// Open circuit voltage program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcvParams {
    /// Run time in seconds.
    pub time: f64,
    /// Maximum time between readings in seconds.
    #[serde(default = "default_time_interval")]
    pub time_interval: f64,
    /// Maximum voltage change between readings in volts.
    #[serde(default = "default_voltage_interval")]
    pub voltage_interval: f64,
}

impl OcvParams {
    /// OCV for `time` seconds with default intervals.
    pub fn new(time: f64) -> Self {
        Self {
            time,
            time_interval: default_time_interval(),
            voltage_interval: default_voltage_interval(),
        }
    }
}

/// Chrono-amperometry program: a list of potential steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaParams {
    /// Step potentials in volts.
    pub voltages: Vec<f64>,
    /// Step durations in seconds.
    pub durations: Vec<f64>,
    /// Steps are relative to the initial potential instead of the previous step.
    #[serde(default)]
    pub vs_initial: bool,
    /// Maximum time between readings in seconds.
    #[serde(default = "default_time_interval")]
    pub time_interval: f64,
    /// Maximum current change between readings in amperes.
    #[serde(default = "default_current_interval")]
    pub current_interval: f64,
    /// Current range.
    #[serde(default = "default_current_range")]
    pub current_range: IRange,
}

impl CaParams {
    /// Steps with default intervals and range.
    pub fn new(voltages: Vec<f64>, durations: Vec<f64>) -> Self {
        Self {
            voltages,
            durations,
            vs_initial: false,
            time_interval: default_time_interval(),
            current_interval: default_current_interval(),
            current_range: default_current_range(),
        }
    }

    /// Values for a live update of the step potentials.
    ///
    /// The step count must match the loaded bundle.
    pub fn voltage_update(
        voltages: &[f64],
        durations: Option<&[f64]>,
        vs_initial: Option<bool>,
    ) -> ParameterSet {
        let mut set = ParameterSet::new().with_list("Voltage_step", voltages.iter().copied());
        if let Some(durations) = durations {
            set = set.with_list("Duration_step", durations.iter().copied());
        }
        if let Some(vs_initial) = vs_initial {
            set = set.with_list("vs_initial", std::iter::repeat(vs_initial).take(voltages.len()));
        }
        set
    }

    fn steps(&self) -> Result<usize> {
        step_count(&self.voltages, &self.durations, "voltages")
    }

    fn parameters(&self) -> Result<ParameterSet> {
        let steps = self.steps()?;
        Ok(ParameterSet::new()
            .with_list("Voltage_step", self.voltages.iter().copied())
            .with_list("vs_initial", std::iter::repeat(self.vs_initial).take(steps))
            .with_list("Duration_step", self.durations.iter().copied())
            .with("Step_number", last_step(steps))
            .with("Record_every_dT", self.time_interval)
            .with("Record_every_dI", self.current_interval)
            .with("N_Cycles", 0)
            .with("I_Range", self.current_range.code()))
    }
}

/// Chrono-amperometry with limit tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaLimitParams {
    /// Potential steps.
    #[serde(flatten)]
    pub steps: CaParams,
    /// Up to three limit tests.
    #[serde(default)]
    pub limits: Vec<LimitTest>,
    /// Action once a limit trips.
    #[serde(default)]
    pub exit_condition: ExitCondition,
}

impl CaLimitParams {
    fn parameters(&self) -> Result<ParameterSet> {
        let steps = self.steps.steps()?;
        let set = ParameterSet::new()
            .with_list("Voltage_step", self.steps.voltages.iter().copied())
            .with_list("vs_initial", std::iter::repeat(self.steps.vs_initial).take(steps))
            .with_list("Duration_step", self.steps.durations.iter().copied())
            .with("Step_number", last_step(steps))
            .with("Record_every_dT", self.steps.time_interval)
            .with("Record_every_dI", self.steps.current_interval);
        Ok(with_limits(set, &self.limits, self.exit_condition)?
            .with("N_Cycles", 0)
            .with("I_Range", self.steps.current_range.code()))
    }
}

/// Chrono-potentiometry program: a list of current steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CpParams {
    /// Step currents in amperes.
    pub currents: Vec<f64>,
    /// Step durations in seconds.
    pub durations: Vec<f64>,
    /// Steps are relative to the initial current instead of the previous step.
    #[serde(default)]
    pub vs_initial: bool,
    /// Maximum time between readings in seconds.
    #[serde(default = "default_time_interval")]
    pub time_interval: f64,
    /// Maximum voltage change between readings in volts.
    #[serde(default = "default_voltage_interval")]
    pub voltage_interval: f64,
    /// Current range.
    #[serde(default = "default_current_range")]
    pub current_range: IRange,
}

impl CpParams {
    fn parameters(&self) -> Result<ParameterSet> {
        let steps = step_count(&self.currents, &self.durations, "currents")?;
        if matches!(self.current_range, IRange::Auto | IRange::Keep) {
            return Err(EchemError::invalid("galvanostatic techniques need a fixed current range"));
        }
        Ok(ParameterSet::new()
            .with_list("Current_step", self.currents.iter().copied())
            .with_list("vs_initial", std::iter::repeat(self.vs_initial).take(steps))
            .with_list("Duration_step", self.durations.iter().copied())
            .with("Step_number", last_step(steps))
            .with("Record_every_dT", self.time_interval)
            .with("Record_every_dE", self.voltage_interval)
            .with("N_Cycles", 0)
            .with("I_Range", self.current_range.code()))
    }
}

fn default_scan_start() -> f64 {
    0.0
}

fn default_scan_step() -> f64 {
    0.01
}

fn default_scan_rate() -> f64 {
    10.0
}

/// Factor applied to [`JvScanParams::rate`] to obtain the `Scan_Rate`
/// loaded on the channel, in V/s.
pub const SCAN_RATE_SCALE: f64 = 10e-3;

/// Current-voltage scan, run as a cyclic voltammetry from `start` to `end`
/// and back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JvScanParams {
    /// Start potential in volts.
    #[serde(default = "default_scan_start")]
    pub start: f64,
    /// End potential in volts.
    pub end: f64,
    /// Potential change between recorded points in volts.
    #[serde(default = "default_scan_step")]
    pub step: f64,
    /// Scan rate as given to the program; the channel receives
    /// `rate * SCAN_RATE_SCALE` V/s.
    #[serde(default = "default_scan_rate")]
    pub rate: f64,
    /// Average the current over each step.
    #[serde(default)]
    pub average: bool,
}

impl JvScanParams {
    fn parameters(&self) -> Result<ParameterSet> {
        if self.rate <= 0.0 {
            return Err(EchemError::invalid("scan rate must be positive"));
        }
        let mut profile = [self.start; CV_VERTICES];
        profile[1] = self.end;
        Ok(ParameterSet::new()
            .with_list("vs_initial", [false; CV_VERTICES])
            .with_list("Voltage_step", profile)
            .with_list("Scan_Rate", [self.rate * SCAN_RATE_SCALE; CV_VERTICES])
            .with("Scan_number", 2)
            .with("Record_every_dE", self.step)
            .with("Average_over_dE", self.average)
            .with("N_Cycles", 0)
            .with("Begin_measuring_I", 0.0)
            .with("End_measuring_I", 1.0))
    }
}

fn default_frequency_points() -> i32 {
    60
}

fn default_average() -> i32 {
    1
}

/// Potentio impedance spectroscopy around a fixed potential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeisParams {
    /// DC potential in volts.
    pub voltage: f64,
    /// Potential relative to the initial potential.
    #[serde(default)]
    pub vs_initial: bool,
    /// Sinus amplitude in volts.
    pub amplitude: f64,
    /// First frequency in Hz.
    pub initial_frequency: f64,
    /// Last frequency in Hz.
    pub final_frequency: f64,
    /// Number of frequencies.
    #[serde(default = "default_frequency_points")]
    pub frequency_number: i32,
    /// Logarithmic spacing of frequencies.
    #[serde(default = "default_true")]
    pub logarithmic: bool,
    /// Measurements averaged per frequency.
    #[serde(default = "default_average")]
    pub average: i32,
    /// Periods to wait before each frequency.
    #[serde(default)]
    pub wait_for_steady: f64,
    /// Time spent at the DC potential before the sweep, in seconds.
    #[serde(default)]
    pub duration: f64,
    /// Maximum time between readings during the DC step.
    #[serde(default = "default_time_interval")]
    pub time_interval: f64,
    /// Maximum current change between readings during the DC step.
    #[serde(default = "default_current_interval")]
    pub current_interval: f64,
}

fn default_true() -> bool {
    true
}

impl PeisParams {
    fn parameters(&self) -> Result<ParameterSet> {
        check_sweep(self.initial_frequency, self.final_frequency, self.frequency_number)?;
        Ok(ParameterSet::new()
            .with("vs_initial", self.vs_initial)
            .with("vs_final", self.vs_initial)
            .with("Initial_Voltage_step", self.voltage)
            .with("Final_Voltage_step", self.voltage)
            .with("Duration_step", self.duration)
            .with("Step_number", 0)
            .with("Record_every_dT", self.time_interval)
            .with("Record_every_dI", self.current_interval)
            .with("Final_frequency", self.final_frequency)
            .with("Initial_frequency", self.initial_frequency)
            // sweep: false selects logarithmic spacing
            .with("sweep", !self.logarithmic)
            .with("Amplitude_Voltage", self.amplitude)
            .with("Frequency_number", self.frequency_number)
            .with("Average_N_times", self.average)
            .with("Correction", false)
            .with("Wait_for_steady", self.wait_for_steady))
    }
}

/// Galvano impedance spectroscopy around a fixed current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeisParams {
    /// DC current in amperes.
    pub current: f64,
    /// Current relative to the initial current.
    #[serde(default)]
    pub vs_initial: bool,
    /// Sinus amplitude in amperes.
    pub amplitude: f64,
    /// First frequency in Hz.
    pub initial_frequency: f64,
    /// Last frequency in Hz.
    pub final_frequency: f64,
    /// Number of frequencies.
    #[serde(default = "default_frequency_points")]
    pub frequency_number: i32,
    /// Logarithmic spacing of frequencies.
    #[serde(default = "default_true")]
    pub logarithmic: bool,
    /// Measurements averaged per frequency.
    #[serde(default = "default_average")]
    pub average: i32,
    /// Periods to wait before each frequency.
    #[serde(default)]
    pub wait_for_steady: f64,
    /// Time spent at the DC current before the sweep, in seconds.
    #[serde(default)]
    pub duration: f64,
    /// Maximum time between readings during the DC step.
    #[serde(default = "default_time_interval")]
    pub time_interval: f64,
    /// Maximum voltage change between readings during the DC step.
    #[serde(default = "default_voltage_interval")]
    pub voltage_interval: f64,
    /// Current range; must be fixed.
    #[serde(default = "default_current_range")]
    pub current_range: IRange,
}

impl GeisParams {
    fn parameters(&self) -> Result<ParameterSet> {
        check_sweep(self.initial_frequency, self.final_frequency, self.frequency_number)?;
        if matches!(self.current_range, IRange::Auto | IRange::Keep) {
            return Err(EchemError::invalid("galvanostatic techniques need a fixed current range"));
        }
        Ok(ParameterSet::new()
            .with("vs_initial", self.vs_initial)
            .with("vs_final", self.vs_initial)
            .with("Initial_Current_step", self.current)
            .with("Final_Current_step", self.current)
            .with("Duration_step", self.duration)
            .with("Step_number", 0)
            .with("Record_every_dT", self.time_interval)
            .with("Record_every_dE", self.voltage_interval)
            .with("Final_frequency", self.final_frequency)
            .with("Initial_frequency", self.initial_frequency)
            .with("sweep", !self.logarithmic)
            .with("Amplitude_Current", self.amplitude)
            .with("Frequency_number", self.frequency_number)
            .with("Average_N_times", self.average)
            .with("Correction", false)
            .with("Wait_for_steady", self.wait_for_steady)
            .with("I_Range", self.current_range.code()))
    }
}

/// An experiment program with typed parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "technique", rename_all = "snake_case")]
pub enum Technique {
    /// Open circuit voltage.
    Ocv(OcvParams),
    /// Chrono-amperometry.
    Ca(CaParams),
    /// Chrono-amperometry with limits.
    CaLimit(CaLimitParams),
    /// Chrono-potentiometry.
    Cp(CpParams),
    /// Current-voltage scan.
    JvScan(JvScanParams),
    /// Potentio impedance spectroscopy.
    Peis(PeisParams),
    /// Galvano impedance spectroscopy.
    Geis(GeisParams),
}

impl Technique {
    /// Technique declaration the program loads.
    pub fn definition(&self) -> &'static TechniqueDef {
        match self {
            Self::Ocv(_) => &OCV,
            Self::Ca(_) => &CA,
            Self::CaLimit(_) => &CALIMIT,
            Self::Cp(_) => &CP,
            Self::JvScan(_) => &CV,
            Self::Peis(_) => &PEIS,
            Self::Geis(_) => &GEIS,
        }
    }

    /// Lowers the typed parameters to raw values.
    pub fn parameters(&self) -> Result<ParameterSet> {
        match self {
            Self::Ocv(p) => {
                if p.time < 0.0 {
                    return Err(EchemError::invalid("OCV time must not be negative"));
                }
                Ok(ParameterSet::new()
                    .with("Rest_time_T", p.time)
                    .with("Record_every_dE", p.voltage_interval)
                    .with("Record_every_dT", p.time_interval))
            }
            Self::Ca(p) => p.parameters(),
            Self::CaLimit(p) => p.parameters(),
            Self::Cp(p) => p.parameters(),
            Self::JvScan(p) => p.parameters(),
            Self::Peis(p) => p.parameters(),
            Self::Geis(p) => p.parameters(),
        }
    }

    /// Time after which the program is complete, when it is fixed in advance.
    pub fn run_time(&self) -> Option<Duration> {
        let secs = match self {
            Self::Ocv(p) => p.time,
            Self::Ca(p) => p.durations.iter().sum(),
            Self::CaLimit(p) => p.steps.durations.iter().sum(),
            Self::Cp(p) => p.durations.iter().sum(),
            Self::JvScan(_) | Self::Peis(_) | Self::Geis(_) => return None,
        };
        Duration::try_from_secs_f64(secs).ok()
    }
}

fn step_count(values: &[f64], durations: &[f64], what: &str) -> Result<usize> {
    if values.is_empty() {
        return Err(EchemError::invalid(format!("{what} must not be empty")));
    }
    if values.len() != durations.len() {
        return Err(EchemError::invalid(format!(
            "{} {what} but {} durations",
            values.len(),
            durations.len()
        )));
    }
    if values.len() > MAX_STEPS {
        return Err(EchemError::invalid(format!("at most {MAX_STEPS} steps are supported")));
    }
    Ok(values.len())
}

fn last_step(steps: usize) -> i32 {
    // step_count bounds steps to MAX_STEPS
    i32::try_from(steps.saturating_sub(1)).unwrap_or(0)
}

fn check_sweep(initial: f64, last: f64, points: i32) -> Result<()> {
    if initial <= 0.0 || last <= 0.0 {
        return Err(EchemError::invalid("frequencies must be positive"));
    }
    if points < 1 {
        return Err(EchemError::invalid("at least one frequency is required"));
    }
    Ok(())
}

fn with_limits(mut set: ParameterSet, limits: &[LimitTest], exit: ExitCondition) -> Result<ParameterSet> {
    if limits.len() > MAX_LIMIT_TESTS {
        return Err(EchemError::invalid(format!(
            "at most {MAX_LIMIT_TESTS} limit tests are supported"
        )));
    }
    for slot in 0..MAX_LIMIT_TESTS {
        let (config, value) = limits
            .get(slot)
            .map_or((0, 0.0), |t| (t.config_word(), t.value));
        set = set
            .with(format!("Test{}_Config", slot + 1), config)
            .with(format!("Test{}_Value", slot + 1), value);
    }
    Ok(set.with("Exit_Cond", exit.code()))
}
