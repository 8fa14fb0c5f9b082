//! Static lookup tables for instrument codes.
//!
//! Every enumeration the native library exchanges as a bare integer is
//! modelled here as a Rust enum plus a table mapping the integer code to a
//! descriptor. Nothing in this module performs I/O or holds state.

use crate::error::DriverErrorKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hardware family of an instrument.
///
/// The family selects technique file variants and acquisition row layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFamily {
    /// VMP3 based instruments (VMP3, VSP, SP-150, ...).
    Vmp3,
    /// SP-300 based instruments (SP-300, SP-200, VSP-300, VMP-300, SP-240, BP-300).
    Sp300,
}

impl DeviceFamily {
    /// Suffix appended to technique file stems for this family.
    pub fn technique_suffix(self) -> &'static str {
        match self {
            Self::Vmp3 => "",
            Self::Sp300 => "4",
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vmp3 => f.write_str("VMP-3"),
            Self::Sp300 => f.write_str("SP-300"),
        }
    }
}

/// Descriptor of a known instrument model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Device code reported on connection.
    pub code: i32,
    /// Model name.
    pub name: &'static str,
    /// Hardware family.
    pub family: DeviceFamily,
}

const fn vmp3(code: i32, name: &'static str) -> DeviceDescriptor {
    DeviceDescriptor {
        code,
        name,
        family: DeviceFamily::Vmp3,
    }
}

const fn sp300(code: i32, name: &'static str) -> DeviceDescriptor {
    DeviceDescriptor {
        code,
        name,
        family: DeviceFamily::Sp300,
    }
}

/// Known instrument models, keyed by device code.
pub static DEVICES: &[DeviceDescriptor] = &[
    vmp3(0, "VMP"),
    vmp3(1, "VMP2"),
    vmp3(2, "MPG"),
    vmp3(3, "BISTAT"),
    vmp3(4, "MCS-200"),
    vmp3(5, "VMP3"),
    vmp3(6, "VSP"),
    vmp3(7, "HCP-803"),
    vmp3(8, "EPP-400"),
    vmp3(9, "EPP-4000"),
    vmp3(10, "BISTAT2"),
    vmp3(11, "FCT-150S"),
    sp300(12, "VMP-300"),
    vmp3(13, "SP-50"),
    vmp3(14, "SP-150"),
    vmp3(15, "FCT-50S"),
    sp300(16, "SP-300"),
    vmp3(17, "CLB-500"),
    vmp3(18, "HCP-1005"),
    vmp3(19, "CLB-2000"),
    sp300(20, "VSP-300"),
    sp300(21, "SP-200"),
    vmp3(22, "MPG2"),
    vmp3(23, "ND1"),
    vmp3(24, "ND2"),
    vmp3(25, "ND3"),
    vmp3(26, "ND4"),
    sp300(27, "SP-240"),
    vmp3(28, "MPG-205"),
    vmp3(29, "MPG-210"),
    vmp3(30, "MPG-220"),
    vmp3(31, "MPG-240"),
    sp300(32, "BP-300"),
    vmp3(33, "VMP-3e"),
    vmp3(34, "VSP-3e"),
    vmp3(35, "SP-50e"),
    vmp3(36, "SP-150e"),
];

/// Looks up a device by its code.
pub fn device(code: i32) -> Option<&'static DeviceDescriptor> {
    DEVICES.iter().find(|d| d.code == code)
}

/// Looks up a device by model name, ignoring case and dashes.
pub fn device_by_name(name: &str) -> Option<&'static DeviceDescriptor> {
    let wanted = normalize_model(name);
    DEVICES.iter().find(|d| normalize_model(d.name) == wanted)
}

fn normalize_model(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '-' && *c != '_' && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Technique identifiers reported in acquisition metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TechniqueId {
    /// No technique loaded.
    None,
    /// Open circuit voltage.
    Ocv,
    /// Chrono-amperometry.
    Ca,
    /// Chrono-potentiometry.
    Cp,
    /// Cyclic voltammetry.
    Cv,
    /// Potentio electrochemical impedance spectroscopy.
    Peis,
    /// Galvano electrochemical impedance spectroscopy.
    Geis,
    /// Chrono-amperometry with limits.
    CaLimit,
    /// Chrono-potentiometry with limits.
    CpLimit,
}

const TECHNIQUE_CODES: &[(TechniqueId, i32, &str)] = &[
    (TechniqueId::None, 0, "none"),
    (TechniqueId::Ocv, 100, "ocv"),
    (TechniqueId::Ca, 101, "ca"),
    (TechniqueId::Cp, 102, "cp"),
    (TechniqueId::Cv, 103, "cv"),
    (TechniqueId::Peis, 104, "peis"),
    (TechniqueId::Geis, 107, "geis"),
    (TechniqueId::CaLimit, 157, "calimit"),
    (TechniqueId::CpLimit, 158, "cplimit"),
];

impl TechniqueId {
    /// Numeric identifier used by the instrument.
    pub fn code(self) -> i32 {
        TECHNIQUE_CODES
            .iter()
            .find(|(id, _, _)| *id == self)
            .map_or(0, |(_, code, _)| *code)
    }

    /// Resolves a numeric identifier.
    pub fn from_code(code: i32) -> Option<Self> {
        TECHNIQUE_CODES
            .iter()
            .find(|(_, c, _)| *c == code)
            .map(|(id, _, _)| *id)
    }

    /// Lowercase short name, also the technique file stem.
    pub fn name(self) -> &'static str {
        TECHNIQUE_CODES
            .iter()
            .find(|(id, _, _)| *id == self)
            .map_or("none", |(_, _, name)| name)
    }
}

impl fmt::Display for TechniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name().to_uppercase())
    }
}

/// Run state of a hardware channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChannelState {
    /// Channel idle or finished.
    #[default]
    Stop,
    /// Channel acquiring.
    Run,
    /// Channel paused.
    Pause,
}

impl ChannelState {
    /// Numeric code used by the instrument.
    pub fn code(self) -> i32 {
        match self {
            Self::Stop => 0,
            Self::Run => 1,
            Self::Pause => 2,
        }
    }

    /// Resolves a numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Stop),
            1 => Some(Self::Run),
            2 => Some(Self::Pause),
            _ => None,
        }
    }
}

/// Current measurement range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IRange {
    /// 100 pA
    P100,
    /// 1 nA
    N1,
    /// 10 nA
    N10,
    /// 100 nA
    N100,
    /// 1 µA
    U1,
    /// 10 µA
    U10,
    /// 100 µA
    U100,
    /// 1 mA
    M1,
    /// 10 mA
    M10,
    /// 100 mA
    M100,
    /// 1 A
    A1,
    /// Keep the range currently selected.
    Keep,
    /// External booster.
    Booster,
    /// Automatic range selection.
    Auto,
}

/// Descriptor of a current range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IRangeDescriptor {
    /// Range variant.
    pub range: IRange,
    /// Numeric code.
    pub code: i32,
    /// Display label.
    pub label: &'static str,
    /// Full scale current in amperes, when the range has a fixed scale.
    pub full_scale: Option<f64>,
}

const fn irange(range: IRange, code: i32, label: &'static str, full_scale: Option<f64>) -> IRangeDescriptor {
    IRangeDescriptor {
        range,
        code,
        label,
        full_scale,
    }
}

/// Current range table.
pub static I_RANGES: &[IRangeDescriptor] = &[
    irange(IRange::P100, 0, "100 pA", Some(100e-12)),
    irange(IRange::N1, 1, "1 nA", Some(1e-9)),
    irange(IRange::N10, 2, "10 nA", Some(10e-9)),
    irange(IRange::N100, 3, "100 nA", Some(100e-9)),
    irange(IRange::U1, 4, "1 uA", Some(1e-6)),
    irange(IRange::U10, 5, "10 uA", Some(10e-6)),
    irange(IRange::U100, 6, "100 uA", Some(100e-6)),
    irange(IRange::M1, 7, "1 mA", Some(1e-3)),
    irange(IRange::M10, 8, "10 mA", Some(10e-3)),
    irange(IRange::M100, 9, "100 mA", Some(100e-3)),
    irange(IRange::A1, 10, "1 A", Some(1.0)),
    irange(IRange::Keep, -1, "keep", None),
    irange(IRange::Booster, 11, "booster", None),
    irange(IRange::Auto, 12, "auto", None),
];

impl IRange {
    /// Descriptor for this range.
    pub fn descriptor(self) -> &'static IRangeDescriptor {
        // Every variant has a row in I_RANGES.
        I_RANGES
            .iter()
            .find(|d| d.range == self)
            .unwrap_or(&I_RANGES[0])
    }

    /// Numeric code used by the instrument.
    pub fn code(self) -> i32 {
        self.descriptor().code
    }

    /// Resolves a numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        I_RANGES.iter().find(|d| d.code == code).map(|d| d.range)
    }
}

/// Voltage measurement range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ERange {
    /// ±2.5 V
    V2_5,
    /// ±5 V
    V5,
    /// ±10 V
    V10,
    /// Automatic range selection.
    Auto,
}

impl ERange {
    /// Numeric code used by the instrument.
    pub fn code(self) -> i32 {
        match self {
            Self::V2_5 => 0,
            Self::V5 => 1,
            Self::V10 => 2,
            Self::Auto => 3,
        }
    }

    /// Resolves a numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::V2_5),
            1 => Some(Self::V5),
            2 => Some(Self::V10),
            3 => Some(Self::Auto),
            _ => None,
        }
    }
}

/// Potentiostat control bandwidth, `BW1` (slow) through `BW9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Bandwidth(u8);

impl Bandwidth {
    /// Slowest setting.
    pub const SLOW: Self = Self(1);
    /// Medium setting.
    pub const MEDIUM: Self = Self(5);
    /// Fast setting.
    pub const FAST: Self = Self(7);

    /// Creates a bandwidth from its index (1-9).
    pub fn new(index: u8) -> Option<Self> {
        (1..=9).contains(&index).then_some(Self(index))
    }

    /// Index of the setting.
    pub fn index(self) -> u8 {
        self.0
    }

    /// `BW8` and `BW9` exist only on the SP-300 family.
    pub fn available_on(self, family: DeviceFamily) -> bool {
        self.0 <= 7 || family == DeviceFamily::Sp300
    }
}

/// Analog filter setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Filter {
    /// No filtering.
    Off,
    /// 50 kHz.
    K50,
    /// 1 kHz.
    K1,
    /// 5 Hz.
    H5,
}

impl Filter {
    /// Numeric code used by the instrument.
    pub fn code(self) -> i32 {
        match self {
            Self::Off => 0,
            Self::K50 => 1,
            Self::K1 => 2,
            Self::H5 => 3,
        }
    }
}

/// Instrument ground mode of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    /// Channel referenced to ground.
    #[default]
    Grounded,
    /// Channel floating.
    Floating,
}

impl ChannelMode {
    /// Numeric code used by the instrument.
    pub fn code(self) -> i32 {
        match self {
            Self::Grounded => 0,
            Self::Floating => 1,
        }
    }

    /// Resolves a numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Grounded),
            1 => Some(Self::Floating),
            _ => None,
        }
    }
}

/// Electrode connection of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectrodeConnection {
    /// Standard three electrode connection.
    #[default]
    Standard,
    /// Counter electrode tied to ground.
    Grounded,
}

impl ElectrodeConnection {
    /// Numeric code used by the instrument.
    pub fn code(self) -> i32 {
        match self {
            Self::Standard => 0,
            Self::Grounded => 1,
        }
    }

    /// Resolves a numeric code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Standard),
            1 => Some(Self::Grounded),
            _ => None,
        }
    }
}

/// What a limited technique does once a limit test trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExitCondition {
    /// Continue with the next step.
    #[default]
    NextStep,
    /// Continue with the next technique of the sequence.
    NextTechnique,
    /// Stop the channel.
    Stop,
}

impl ExitCondition {
    /// Numeric code used by the instrument.
    pub fn code(self) -> i32 {
        match self {
            Self::NextStep => 0,
            Self::NextTechnique => 1,
            Self::Stop => 2,
        }
    }
}

/// Quantity compared by a limit test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitVariable {
    /// Working electrode potential.
    E,
    /// Auxiliary input 1.
    Aux1,
    /// Auxiliary input 2.
    Aux2,
    /// Current.
    I,
}

/// Comparison operator of a limit test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitComparison {
    /// Trips when the variable drops below the value.
    LessThan,
    /// Trips when the variable exceeds the value.
    GreaterThan,
}

/// How a limit test combines with the preceding one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitLogic {
    /// Either test trips the limit.
    Or,
    /// Both tests must trip.
    And,
}

/// One limit test of a limited technique.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitTest {
    /// Compared quantity.
    pub variable: LimitVariable,
    /// Comparison operator.
    pub comparison: LimitComparison,
    /// Combination with the previous test.
    pub logic: LimitLogic,
    /// Threshold in SI units.
    pub value: f32,
}

impl LimitTest {
    /// Packs the test into the integer configuration word.
    ///
    /// Bit 0 marks the test active, bit 1 the logic, bit 2 the comparison
    /// and bits 3.. the variable.
    pub fn config_word(&self) -> i32 {
        let logic = match self.logic {
            LimitLogic::Or => 0,
            LimitLogic::And => 1,
        };
        let comparison = match self.comparison {
            LimitComparison::LessThan => 0,
            LimitComparison::GreaterThan => 1,
        };
        let variable = match self.variable {
            LimitVariable::E => 0,
            LimitVariable::Aux1 => 1,
            LimitVariable::Aux2 => 2,
            LimitVariable::I => 3,
        };
        1 | (logic << 1) | (comparison << 2) | (variable << 3)
    }
}

/// Descriptor of a native library status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverErrorDescriptor {
    /// Status code.
    pub code: i32,
    /// Symbolic name.
    pub name: &'static str,
    /// Description.
    pub message: &'static str,
    /// Classification.
    pub kind: DriverErrorKind,
}

const fn err(code: i32, name: &'static str, message: &'static str, kind: DriverErrorKind) -> DriverErrorDescriptor {
    DriverErrorDescriptor {
        code,
        name,
        message,
        kind,
    }
}

/// Native library status codes.
pub static DRIVER_ERRORS: &[DriverErrorDescriptor] = &[
    err(-1, "ERR_GEN_NOTCONNECTED", "No instrument connected.", DriverErrorKind::NotConnected),
    err(-2, "ERR_GEN_CONNECTIONINPROGRESS", "Connection in progress.", DriverErrorKind::Busy),
    err(-3, "ERR_GEN_CHANNELNOTPLUGGED", "Selected channel(s) unplugged.", DriverErrorKind::Hardware),
    err(-4, "ERR_GEN_INVALIDPARAMETERS", "Invalid function parameters.", DriverErrorKind::InvalidParameters),
    err(-5, "ERR_GEN_FILENOTEXISTS", "Selected file does not exist.", DriverErrorKind::TechniqueFile),
    err(-6, "ERR_GEN_FUNCTIONFAILED", "Function failed.", DriverErrorKind::Other),
    err(-7, "ERR_GEN_NOCHANNELSELECTED", "No channel selected.", DriverErrorKind::InvalidParameters),
    err(-8, "ERR_GEN_INVALIDCONF", "Invalid instrument configuration.", DriverErrorKind::InvalidParameters),
    err(-9, "ERR_GEN_ECLAB_LOADED", "EC-Lab firmware loaded on instrument.", DriverErrorKind::Firmware),
    err(-10, "ERR_GEN_LIBNOTCORRECTLYLOADED", "Library not correctly loaded in memory.", DriverErrorKind::Other),
    err(-11, "ERR_GEN_USBLIBRARYERROR", "USB library not loaded in memory.", DriverErrorKind::Communication),
    err(-12, "ERR_GEN_FUNCTIONINPROGRESS", "Function of the library already in progress.", DriverErrorKind::Busy),
    err(-13, "ERR_GEN_CHANNEL_RUNNING", "Selected channel(s) already used.", DriverErrorKind::Busy),
    err(-14, "ERR_GEN_DEVICE_NOTALLOWED", "Device not allowed.", DriverErrorKind::NotConnected),
    err(-15, "ERR_GEN_UPDATEPARAMETERS", "Invalid update function parameters.", DriverErrorKind::InvalidParameters),
    err(-101, "ERR_INSTR_VMEERROR", "Internal instrument communication failed.", DriverErrorKind::Communication),
    err(-102, "ERR_INSTR_TOOMANYDATA", "Too many data to transfer from the instrument.", DriverErrorKind::Hardware),
    err(-103, "ERR_INSTR_RESPNOTPOSSIBLE", "Selected channel(s) unplugged.", DriverErrorKind::Hardware),
    err(-104, "ERR_INSTR_RESPERROR", "Instrument response error.", DriverErrorKind::Communication),
    err(-105, "ERR_INSTR_MSGSIZEERROR", "Invalid message size.", DriverErrorKind::Communication),
    err(-200, "ERR_COMM_COMMFAILED", "Communication with the instrument failed.", DriverErrorKind::Communication),
    err(-201, "ERR_COMM_CONNECTIONFAILED", "Could not establish communication with instrument.", DriverErrorKind::Communication),
    err(-202, "ERR_COMM_WAITINGACK", "Waiting for the instrument response.", DriverErrorKind::Timeout),
    err(-203, "ERR_COMM_INVALIDIPADDRESS", "Invalid IP address.", DriverErrorKind::NotConnected),
    err(-204, "ERR_COMM_ALLOCMEMFAILED", "Cannot allocate memory in the instrument.", DriverErrorKind::Hardware),
    err(-205, "ERR_COMM_LOADFIRMWAREFAILED", "Cannot load firmware on the selected channel(s).", DriverErrorKind::Firmware),
    err(-206, "ERR_COMM_INCOMPATIBLESERVER", "Communication firmware not compatible with the library.", DriverErrorKind::Firmware),
    err(-207, "ERR_COMM_MAXCONNREACHED", "Maximum number of allowed connections reached.", DriverErrorKind::NotConnected),
    err(-308, "ERR_FIRM_FIRMWARENOTLOADED", "No firmware loaded on channel.", DriverErrorKind::Firmware),
    err(-309, "ERR_FIRM_FIRMWAREINCOMPATIBLE", "Loaded firmware not compatible with the library.", DriverErrorKind::Firmware),
    err(-400, "ERR_TECH_ECCFILENOTEXISTS", "ECC file does not exist.", DriverErrorKind::TechniqueFile),
    err(-401, "ERR_TECH_INCOMPATIBLEECC", "ECC file not compatible with the channel firmware.", DriverErrorKind::TechniqueFile),
    err(-402, "ERR_TECH_ECCFILECORRUPTED", "ECC file corrupted.", DriverErrorKind::TechniqueFile),
    err(-403, "ERR_TECH_LOADTECHNIQUEFAILED", "Cannot load the ECC file.", DriverErrorKind::TechniqueFile),
    err(-404, "ERR_TECH_DATACORRUPTED", "Data returned by the instrument are corrupted.", DriverErrorKind::Communication),
    err(-405, "ERR_TECH_MEMFULL", "Cannot load techniques: full memory.", DriverErrorKind::Hardware),
];

/// Looks up a native status code.
pub fn driver_error(code: i32) -> Option<&'static DriverErrorDescriptor> {
    DRIVER_ERRORS.iter().find(|d| d.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_families() {
        for code in [12, 16, 20, 21, 27, 32] {
            assert_eq!(device(code).map(|d| d.family), Some(DeviceFamily::Sp300), "code {code}");
        }
        assert_eq!(device(5).map(|d| d.family), Some(DeviceFamily::Vmp3));
        assert!(device(255).is_none());
        assert_eq!(device_by_name("sp300").map(|d| d.code), Some(16));
        assert_eq!(device_by_name("VMP3").map(|d| d.code), Some(5));
    }

    #[test]
    fn test_technique_codes() {
        assert_eq!(TechniqueId::Ocv.code(), 100);
        assert_eq!(TechniqueId::from_code(107), Some(TechniqueId::Geis));
        assert_eq!(TechniqueId::from_code(157), Some(TechniqueId::CaLimit));
        assert_eq!(TechniqueId::from_code(999), None);
        assert_eq!(TechniqueId::Peis.to_string(), "PEIS");
    }

    #[test]
    fn test_range_tables() {
        assert_eq!(IRange::M10.code(), 8);
        assert_eq!(IRange::from_code(-1), Some(IRange::Keep));
        assert_eq!(IRange::from_code(12), Some(IRange::Auto));
        assert_eq!(IRange::A1.descriptor().full_scale, Some(1.0));
        assert_eq!(ERange::from_code(3), Some(ERange::Auto));
        assert_eq!(ChannelState::from_code(2), Some(ChannelState::Pause));
        assert!(ChannelState::from_code(7).is_none());
    }

    #[test]
    fn test_bandwidth_family_limits() {
        let bw9 = Bandwidth::new(9).unwrap();
        assert!(bw9.available_on(DeviceFamily::Sp300));
        assert!(!bw9.available_on(DeviceFamily::Vmp3));
        assert!(Bandwidth::FAST.available_on(DeviceFamily::Vmp3));
        assert!(Bandwidth::new(0).is_none());
        assert!(Bandwidth::new(10).is_none());
    }

    #[test]
    fn test_limit_config_word() {
        let test = LimitTest {
            variable: LimitVariable::I,
            comparison: LimitComparison::GreaterThan,
            logic: LimitLogic::Or,
            value: 1e-3,
        };
        assert_eq!(test.config_word(), 1 | (1 << 2) | (3 << 3));
    }

    #[test]
    fn test_error_codes_unique() {
        for (i, a) in DRIVER_ERRORS.iter().enumerate() {
            assert!(DRIVER_ERRORS[i + 1..].iter().all(|b| b.code != a.code), "duplicate {}", a.code);
        }
    }
}
