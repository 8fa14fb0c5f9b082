//! Telemetry decoding.
//!
//! A poll returns a [`PollFrame`]: a raw buffer of fixed-width acquisition
//! rows plus per-poll metadata ([`FrameInfo`]) and current channel values
//! ([`ChannelValues`]). Each row is a little-endian header
//! `{technique_index: i32, time_high: u32, time_low: u32}` followed by 32-bit
//! payload words whose meaning depends on the technique, the device family
//! and the technique's process index.
//!
//! [`decode`] turns one row into a [`MeasurementRecord`]. Elapsed time is
//! rebuilt from the 64-bit hardware counter and carried across calls in a
//! [`TimeCursor`], which also absorbs counter rollover so that elapsed time
//! never decreases within a session.

use crate::catalog::{ChannelState, DeviceFamily, IRange, TechniqueId};
use crate::error::{EchemError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Number of 32-bit words in a row header.
pub const ROW_HEADER_WORDS: usize = 3;

/// Span of the low counter word.
const LOW_SPAN: f64 = 4_294_967_296.0;

/// One raw acquisition row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionRow {
    /// Index of the technique within the loaded sequence.
    pub technique_index: i32,
    /// High word of the hardware time counter.
    pub time_high: u32,
    /// Low word of the hardware time counter.
    pub time_low: u32,
    /// Technique specific payload words.
    pub payload: Vec<u32>,
}

impl AcquisitionRow {
    /// Combined 64-bit counter value.
    pub fn raw_time(&self) -> u64 {
        (u64::from(self.time_high) << 32) | u64::from(self.time_low)
    }

    /// Number of 32-bit words the row occupies.
    pub fn words(&self) -> usize {
        ROW_HEADER_WORDS + self.payload.len()
    }

    /// Parses one row of `payload_words` payload words from the front of `buf`.
    pub fn parse(buf: &mut impl Buf, payload_words: usize) -> Result<Self> {
        let needed = (ROW_HEADER_WORDS + payload_words) * 4;
        if buf.remaining() < needed {
            return Err(EchemError::decode(format!(
                "row needs {needed} bytes, {} remaining",
                buf.remaining()
            )));
        }
        let technique_index = buf.get_i32_le();
        let time_high = buf.get_u32_le();
        let time_low = buf.get_u32_le();
        let payload = (0..payload_words).map(|_| buf.get_u32_le()).collect();
        Ok(Self {
            technique_index,
            time_high,
            time_low,
            payload,
        })
    }

    /// Parses up to `rows` rows from a driver buffer.
    ///
    /// Each entry is either a parsed row or the error that made the row
    /// unreadable; a truncated buffer yields errors for the missing rows.
    pub fn split(mut buf: impl Buf, rows: usize, payload_words: usize) -> Vec<Result<Self>> {
        (0..rows).map(|_| Self::parse(&mut buf, payload_words)).collect()
    }

    /// Appends the encoded row to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.technique_index);
        buf.put_u32_le(self.time_high);
        buf.put_u32_le(self.time_low);
        for word in &self.payload {
            buf.put_u32_le(*word);
        }
    }
}

/// Metadata of one poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    /// Raw technique identifier.
    pub technique_id: i32,
    /// Index of the technique within the loaded sequence.
    pub technique_index: i32,
    /// Sub-phase of the technique.
    pub process_index: i32,
    /// Loop counter.
    pub loop_number: i32,
    /// Technique start time in seconds; `NaN` when the driver has none.
    pub start_time: f64,
    /// Number of rows in the buffer.
    pub rows: usize,
    /// Number of 32-bit words per row, header included.
    pub cols: usize,
    /// Interrupts skipped by the instrument since the last poll.
    pub irq_skipped: i32,
}

impl Default for FrameInfo {
    fn default() -> Self {
        Self {
            technique_id: 0,
            technique_index: 0,
            process_index: 0,
            loop_number: 0,
            start_time: f64::NAN,
            rows: 0,
            cols: ROW_HEADER_WORDS,
            irq_skipped: 0,
        }
    }
}

/// Channel values sampled with a poll.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelValues {
    /// Run state of the channel.
    pub state: ChannelState,
    /// Seconds per counter tick.
    pub time_base: f64,
    /// Working electrode potential in volts.
    pub ewe: f32,
    /// Counter electrode potential in volts.
    pub ece: f32,
    /// Current in amperes.
    pub current: f32,
    /// Raw current range code.
    pub i_range: i32,
    /// Potential overflow flag.
    pub e_overflow: bool,
    /// Current overflow flag.
    pub i_overflow: bool,
    /// Seconds since the channel started.
    pub elapsed_time: f64,
    /// Frequency of the current impedance point, in Hz.
    pub frequency: f32,
    /// Percentage of the channel buffer in use.
    pub mem_filled: i32,
}

impl Default for ChannelValues {
    fn default() -> Self {
        Self {
            state: ChannelState::Stop,
            time_base: 2e-5,
            ewe: 0.0,
            ece: 0.0,
            current: 0.0,
            i_range: IRange::Auto.code(),
            e_overflow: false,
            i_overflow: false,
            elapsed_time: 0.0,
            frequency: 0.0,
            mem_filled: 0,
        }
    }
}

/// Result of one poll.
#[derive(Debug, Clone, PartialEq)]
pub struct PollFrame {
    /// Raw row buffer, `info.rows * info.cols` little-endian words.
    pub data: Bytes,
    /// Poll metadata.
    pub info: FrameInfo,
    /// Channel values.
    pub values: ChannelValues,
}

impl PollFrame {
    /// Encodes `rows` into a frame, filling in `info.rows` and `info.cols`.
    ///
    /// All rows must share one width; the width of the first row wins.
    pub fn from_rows(rows: &[AcquisitionRow], mut info: FrameInfo, values: ChannelValues) -> Self {
        let cols = rows.first().map_or(ROW_HEADER_WORDS, AcquisitionRow::words);
        let mut data = BytesMut::with_capacity(rows.len() * cols * 4);
        for row in rows {
            row.encode(&mut data);
        }
        info.rows = rows.len();
        info.cols = cols;
        Self {
            data: data.freeze(),
            info,
            values,
        }
    }

    /// A frame carrying no rows.
    pub fn empty(info: FrameInfo, values: ChannelValues) -> Self {
        Self::from_rows(&[], info, values)
    }

    /// Splits the buffer into rows, see [`AcquisitionRow::split`].
    pub fn rows(&self) -> Vec<Result<AcquisitionRow>> {
        let cols = self.info.cols;
        if cols < ROW_HEADER_WORDS {
            return vec![Err(EchemError::decode(format!(
                "frame declares {cols} words per row, header alone needs {ROW_HEADER_WORDS}"
            )))];
        }
        AcquisitionRow::split(self.data.clone(), self.info.rows, cols - ROW_HEADER_WORDS)
    }
}

/// Encoding of a payload word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WordKind {
    /// Two's complement integer.
    Int32,
    /// IEEE-754 single precision bits.
    Single,
}

/// Physical meaning of a payload word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// Working electrode potential (V).
    Voltage,
    /// Current (A).
    Current,
    /// Control value (V or A).
    Control,
    /// Cycle number.
    Cycle,
    /// Frequency (Hz).
    Frequency,
    /// |Ewe| (V).
    AbsVoltage,
    /// |I| (A).
    AbsCurrent,
    /// Phase of Zwe (deg).
    Phase,
    /// |Ece| (V).
    AbsVoltageCe,
    /// |Ice| (A).
    AbsCurrentCe,
    /// Phase of Zce (deg).
    PhaseCe,
    /// Ece (V).
    VoltageCe,
    /// Time of an impedance point (s).
    Time,
    /// Current range code.
    CurrentRange,
    /// Padding.
    Unused,
}

/// One payload word of a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Meaning of the word.
    pub quantity: Quantity,
    /// Encoding of the word.
    pub word: WordKind,
}

const fn single(quantity: Quantity) -> Field {
    Field {
        quantity,
        word: WordKind::Single,
    }
}

const fn int(quantity: Quantity) -> Field {
    Field {
        quantity,
        word: WordKind::Int32,
    }
}

use Quantity::*;

const VMP3_OCV: &[Field] = &[single(Voltage), single(Control)];
const SP300_OCV: &[Field] = &[single(Voltage)];
const STEP_LAYOUT: &[Field] = &[single(Voltage), single(Current), int(Cycle)];
const VMP3_CV: &[Field] = &[single(Control), single(Current), single(Voltage), int(Cycle)];
const SP300_CV: &[Field] = &[single(Current), single(Voltage), int(Cycle)];
const EIS_TIME_DOMAIN: &[Field] = &[single(Voltage), single(Current)];
const SP300_EIS_SWEEP: &[Field] = &[
    single(Frequency),
    single(AbsVoltage),
    single(AbsCurrent),
    single(Phase),
    single(Voltage),
    single(Current),
    int(Unused),
    single(AbsVoltageCe),
    single(AbsCurrentCe),
    single(PhaseCe),
    single(VoltageCe),
    int(Unused),
    int(Unused),
    single(Time),
];
const VMP3_EIS_SWEEP: &[Field] = &[
    single(Frequency),
    single(AbsVoltage),
    single(AbsCurrent),
    single(Phase),
    single(Voltage),
    single(Current),
    int(Unused),
    single(AbsVoltageCe),
    single(AbsCurrentCe),
    single(PhaseCe),
    single(VoltageCe),
    int(Unused),
    int(Unused),
    single(Time),
    single(CurrentRange),
];

/// Payload layout for a technique, device family and process index.
pub fn layout(technique: TechniqueId, family: DeviceFamily, process: i32) -> Option<&'static [Field]> {
    use DeviceFamily::{Sp300, Vmp3};
    use TechniqueId as T;
    let fields = match (technique, family, process) {
        (T::Ocv, Vmp3, _) => VMP3_OCV,
        (T::Ocv, Sp300, _) => SP300_OCV,
        (T::Ca | T::Cp | T::CaLimit | T::CpLimit, _, _) => STEP_LAYOUT,
        (T::Cv, Vmp3, _) => VMP3_CV,
        (T::Cv, Sp300, _) => SP300_CV,
        (T::Peis | T::Geis, _, 0) => EIS_TIME_DOMAIN,
        (T::Peis | T::Geis, Vmp3, 1) => VMP3_EIS_SWEEP,
        (T::Peis | T::Geis, Sp300, 1) => SP300_EIS_SWEEP,
        _ => return None,
    };
    Some(fields)
}

/// Frequency domain values of an impedance point.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Impedance {
    /// Frequency in Hz.
    pub frequency: f64,
    /// |Ewe| in volts.
    pub abs_voltage: f64,
    /// |I| in amperes.
    pub abs_current: f64,
    /// Phase of Zwe in degrees.
    pub phase: f64,
    /// |Ece| in volts.
    pub abs_voltage_ce: f64,
    /// |Ice| in amperes.
    pub abs_current_ce: f64,
    /// Phase of Zce in degrees.
    pub phase_ce: f64,
    /// Ece in volts.
    pub voltage_ce: f64,
}

impl Impedance {
    /// |Zwe| in ohms.
    pub fn modulus(&self) -> f64 {
        self.abs_voltage / self.abs_current
    }
}

/// A decoded acquisition row.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRecord {
    /// Technique that produced the row.
    pub technique: TechniqueId,
    /// Index of the technique within the loaded sequence.
    pub technique_index: i32,
    /// Process index of the technique.
    pub process: i32,
    /// Seconds since the session origin; never decreases within a session.
    pub elapsed: f64,
    /// Working electrode potential in volts.
    pub voltage: Option<f64>,
    /// Current in amperes.
    pub current: Option<f64>,
    /// Control value.
    pub control: Option<f64>,
    /// Cycle number.
    pub cycle: Option<i32>,
    /// Frequency domain values of impedance rows.
    pub impedance: Option<Impedance>,
    /// Channel state when the row was read.
    pub state: ChannelState,
    /// Current range in effect.
    pub current_range: Option<IRange>,
    /// Potential overflow flag.
    pub voltage_overflow: bool,
    /// Current overflow flag.
    pub current_overflow: bool,
}

impl MeasurementRecord {
    /// Electrical power in watts, when both voltage and current are known.
    pub fn power(&self) -> Option<f64> {
        Some(self.voltage? * self.current?)
    }
}

/// Rollover state of the hardware time counter for one session.
///
/// The counter is expected to grow monotonically. When the combined 64-bit
/// counter of a row is lower than the previous one, the drop is taken as
/// exactly one rollover of the previous high word: a software offset of
/// `previous_high + 1` is added to every later high word, so the effective
/// high word is strictly greater than before. The session origin is latched
/// from the start time of the first decoded row.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeCursor {
    last_raw: Option<u64>,
    high_offset: u64,
    origin: Option<f64>,
}

impl TimeCursor {
    /// Cursor for a new session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of counter periods added in software so far.
    pub fn high_offset(&self) -> u64 {
        self.high_offset
    }

    /// Session origin in seconds, once latched.
    pub fn origin(&self) -> Option<f64> {
        self.origin
    }

    /// Elapsed seconds for `row` and the advanced cursor.
    pub fn advance(self, row: &AcquisitionRow, start_time: f64, time_base: f64) -> (f64, Self) {
        let raw = row.raw_time();
        let mut next = self;
        if let Some(last) = self.last_raw {
            if raw < last {
                next.high_offset += (last >> 32) + 1;
            }
        }
        next.last_raw = Some(raw);
        let origin = *next
            .origin
            .get_or_insert(if start_time.is_nan() { 0.0 } else { start_time });

        let high = (u64::from(row.time_high) + next.high_offset) as f64;
        let ticks = high * LOW_SPAN + f64::from(row.time_low);
        (origin + ticks * time_base, next)
    }
}

fn word_f64(word: u32, kind: WordKind) -> f64 {
    match kind {
        WordKind::Int32 => f64::from(word as i32),
        WordKind::Single => f64::from(f32::from_bits(word)),
    }
}

/// Decodes one row.
///
/// The layout is selected from the frame's technique identifier and process
/// index and the device family. The returned cursor replaces `cursor` for
/// the next row; on error the caller keeps the old one.
pub fn decode(
    row: &AcquisitionRow,
    info: &FrameInfo,
    values: &ChannelValues,
    family: DeviceFamily,
    cursor: TimeCursor,
) -> Result<(MeasurementRecord, TimeCursor)> {
    let technique = TechniqueId::from_code(info.technique_id)
        .filter(|t| *t != TechniqueId::None)
        .ok_or_else(|| EchemError::decode(format!("unknown technique id {}", info.technique_id)))?;
    let fields = layout(technique, family, info.process_index).ok_or_else(|| {
        EchemError::decode(format!(
            "no {family} layout for {technique} process {}",
            info.process_index
        ))
    })?;
    if row.payload.len() != fields.len() {
        return Err(EchemError::decode(format!(
            "{technique} row has {} payload words, layout expects {}",
            row.payload.len(),
            fields.len()
        )));
    }
    if row.technique_index != info.technique_index {
        return Err(EchemError::decode(format!(
            "row for technique index {} in frame of technique index {}",
            row.technique_index, info.technique_index
        )));
    }
    if !(values.time_base.is_finite() && values.time_base > 0.0) {
        return Err(EchemError::decode(format!("invalid time base {}", values.time_base)));
    }

    let (elapsed, cursor) = cursor.advance(row, info.start_time, values.time_base);

    let mut record = MeasurementRecord {
        technique,
        technique_index: row.technique_index,
        process: info.process_index,
        elapsed,
        voltage: None,
        current: None,
        control: None,
        cycle: None,
        impedance: None,
        state: values.state,
        current_range: IRange::from_code(values.i_range),
        voltage_overflow: values.e_overflow,
        current_overflow: values.i_overflow,
    };

    for (field, word) in fields.iter().zip(&row.payload) {
        let value = word_f64(*word, field.word);
        match field.quantity {
            Voltage => record.voltage = Some(value),
            Current => record.current = Some(value),
            Control => record.control = Some(value),
            Cycle => record.cycle = Some(*word as i32),
            CurrentRange => record.current_range = IRange::from_code(value as i32),
            Frequency => record.impedance.get_or_insert_with(Impedance::default).frequency = value,
            AbsVoltage => record.impedance.get_or_insert_with(Impedance::default).abs_voltage = value,
            AbsCurrent => record.impedance.get_or_insert_with(Impedance::default).abs_current = value,
            Phase => record.impedance.get_or_insert_with(Impedance::default).phase = value,
            AbsVoltageCe => {
                record.impedance.get_or_insert_with(Impedance::default).abs_voltage_ce = value;
            }
            AbsCurrentCe => {
                record.impedance.get_or_insert_with(Impedance::default).abs_current_ce = value;
            }
            PhaseCe => record.impedance.get_or_insert_with(Impedance::default).phase_ce = value,
            VoltageCe => record.impedance.get_or_insert_with(Impedance::default).voltage_ce = value,
            Time | Unused => {}
        }
    }

    Ok((record, cursor))
}

/// Records decoded from one frame.
#[derive(Debug, Clone, Default)]
pub struct DecodedFrame {
    /// Successfully decoded rows, in order.
    pub records: Vec<MeasurementRecord>,
    /// Errors of dropped rows.
    pub dropped: Vec<EchemError>,
    /// Cursor after the last decoded row.
    pub cursor: TimeCursor,
}

/// Decodes every row of `frame`, dropping rows that fail.
pub fn decode_frame(frame: &PollFrame, family: DeviceFamily, cursor: TimeCursor) -> DecodedFrame {
    let mut out = DecodedFrame {
        cursor,
        ..DecodedFrame::default()
    };
    for row in frame.rows() {
        match row.and_then(|row| decode(&row, &frame.info, &frame.values, family, out.cursor)) {
            Ok((record, next)) => {
                out.records.push(record);
                out.cursor = next;
            }
            Err(err) => out.dropped.push(err),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const TIME_BASE: f64 = 2e-5;

    fn ocv_row(high: u32, low: u32, voltage: f32) -> AcquisitionRow {
        AcquisitionRow {
            technique_index: 0,
            time_high: high,
            time_low: low,
            payload: vec![voltage.to_bits(), 0f32.to_bits()],
        }
    }

    fn ocv_info() -> FrameInfo {
        FrameInfo {
            technique_id: TechniqueId::Ocv.code(),
            start_time: 0.0,
            ..FrameInfo::default()
        }
    }

    fn values() -> ChannelValues {
        ChannelValues {
            state: ChannelState::Run,
            time_base: TIME_BASE,
            ..ChannelValues::default()
        }
    }

    #[test]
    fn test_decode_ocv_row() {
        let (record, cursor) = decode(
            &ocv_row(0, 50_000, 0.75),
            &ocv_info(),
            &values(),
            DeviceFamily::Vmp3,
            TimeCursor::new(),
        )
        .unwrap();
        assert!((record.elapsed - 1.0).abs() < 1e-9);
        assert_eq!(record.voltage, Some(0.75));
        assert_eq!(record.control, Some(0.0));
        assert_eq!(record.state, ChannelState::Run);
        assert_eq!(cursor.origin(), Some(0.0));
    }

    #[test]
    fn test_layout_depends_on_family() {
        let row = ocv_row(0, 1, 0.5);
        let err = decode(&row, &ocv_info(), &values(), DeviceFamily::Sp300, TimeCursor::new()).unwrap_err();
        assert!(matches!(err, EchemError::Decode(_)));

        let sp300_row = AcquisitionRow {
            payload: vec![0.5f32.to_bits()],
            ..row
        };
        assert!(decode(&sp300_row, &ocv_info(), &values(), DeviceFamily::Sp300, TimeCursor::new()).is_ok());
    }

    #[test]
    fn test_unknown_technique_rejected() {
        let info = FrameInfo {
            technique_id: 42,
            ..ocv_info()
        };
        assert!(decode(&ocv_row(0, 1, 0.0), &info, &values(), DeviceFamily::Vmp3, TimeCursor::new()).is_err());
        assert!(layout(TechniqueId::Peis, DeviceFamily::Vmp3, 2).is_none());
    }

    #[test]
    fn test_cv_field_order() {
        let info = FrameInfo {
            technique_id: TechniqueId::Cv.code(),
            start_time: f64::NAN,
            ..FrameInfo::default()
        };
        let vmp3 = AcquisitionRow {
            technique_index: 0,
            time_high: 0,
            time_low: 0,
            payload: vec![9f32.to_bits(), 0.002f32.to_bits(), 0.4f32.to_bits(), 3],
        };
        let (record, _) = decode(&vmp3, &info, &values(), DeviceFamily::Vmp3, TimeCursor::new()).unwrap();
        assert_eq!(record.voltage, Some(f64::from(0.4f32)));
        assert_eq!(record.current, Some(f64::from(0.002f32)));
        assert_eq!(record.cycle, Some(3));
        assert_eq!(record.elapsed, 0.0);
    }

    #[test]
    fn test_impedance_sweep_row() {
        let info = FrameInfo {
            technique_id: TechniqueId::Peis.code(),
            process_index: 1,
            ..ocv_info()
        };
        let mut payload: Vec<u32> = [1000.0f32, 0.01, 0.001, -45.0, 0.2, 1e-4]
            .iter()
            .map(|f| f.to_bits())
            .collect();
        payload.push(0);
        payload.extend([0.0f32, 0.0, 0.0, 0.0].iter().map(|f| f.to_bits()));
        payload.extend([0, 0]);
        payload.push(12.5f32.to_bits());
        payload.push(8.0f32.to_bits());

        let row = AcquisitionRow {
            technique_index: 0,
            time_high: 0,
            time_low: 10,
            payload,
        };
        let (record, _) = decode(&row, &info, &values(), DeviceFamily::Vmp3, TimeCursor::new()).unwrap();
        let z = record.impedance.unwrap();
        assert_eq!(z.frequency, 1000.0);
        assert!((z.modulus() - 10.0).abs() < 1e-3);
        assert_eq!(record.current_range, Some(IRange::M10));
    }

    #[test]
    fn test_frame_rows_and_truncation() {
        let rows: Vec<_> = (0..4).map(|i| ocv_row(0, i * 100, 0.1)).collect();
        let frame = PollFrame::from_rows(&rows, ocv_info(), values());
        assert_eq!(frame.info.cols, 5);
        assert_eq!(frame.data.len(), 4 * 5 * 4);

        let decoded = decode_frame(&frame, DeviceFamily::Vmp3, TimeCursor::new());
        assert_eq!(decoded.records.len(), 4);
        assert!(decoded.dropped.is_empty());

        let truncated = PollFrame {
            data: frame.data.slice(..frame.data.len() - 6),
            ..frame
        };
        let decoded = decode_frame(&truncated, DeviceFamily::Vmp3, TimeCursor::new());
        assert_eq!(decoded.records.len(), 3);
        assert_eq!(decoded.dropped.len(), 1);
    }

    #[test]
    fn test_mismatched_row_is_dropped_without_moving_cursor() {
        let mut rows: Vec<_> = (1..=3).map(|i| ocv_row(0, i * 1000, 0.1)).collect();
        rows[1].technique_index = 7;
        let frame = PollFrame::from_rows(&rows, ocv_info(), values());
        let decoded = decode_frame(&frame, DeviceFamily::Vmp3, TimeCursor::new());
        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.dropped.len(), 1);
        assert!(decoded.records[1].elapsed > decoded.records[0].elapsed);
    }

    #[test]
    fn test_start_time_latched_once() {
        let first = FrameInfo {
            start_time: 5.0,
            ..ocv_info()
        };
        let later = FrameInfo {
            start_time: 100.0,
            ..ocv_info()
        };
        let (a, cursor) = decode(&ocv_row(0, 0, 0.0), &first, &values(), DeviceFamily::Vmp3, TimeCursor::new()).unwrap();
        let (b, _) = decode(&ocv_row(0, 50_000, 0.0), &later, &values(), DeviceFamily::Vmp3, cursor).unwrap();
        assert_eq!(a.elapsed, 5.0);
        assert!((b.elapsed - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_rollover_with_high_word_reset() {
        // time_low cycles through its full range three times while the
        // hardware keeps reporting time_high = 0
        let mut cursor = TimeCursor::new();
        let mut last = f64::NEG_INFINITY;
        let step = u32::MAX / 7;
        let mut total_rows = 0;
        for _ in 0..3 {
            let mut low = 0u32;
            loop {
                let (t, next) = cursor.advance(&ocv_row(0, low, 0.0), 0.0, TIME_BASE);
                assert!(t > last, "time went backwards: {t} <= {last}");
                last = t;
                cursor = next;
                total_rows += 1;
                match low.checked_add(step) {
                    Some(next_low) => low = next_low,
                    None => break,
                }
            }
        }
        assert!(total_rows > 20);
        assert_eq!(cursor.high_offset(), 2);
        let expected_min = 2.0 * LOW_SPAN * TIME_BASE;
        assert!(last > expected_min);
    }

    #[test]
    fn test_rollover_random_walk_is_monotonic() {
        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
        for _ in 0..50 {
            let mut cursor = TimeCursor::new();
            let mut last = f64::NEG_INFINITY;
            let mut high: u32 = rng.gen_range(0..4);
            let mut low: u32 = rng.gen();
            for _ in 0..200 {
                let (t, next) = cursor.advance(&ocv_row(high, low, 0.0), 0.0, TIME_BASE);
                assert!(t >= last);
                last = t;
                cursor = next;

                let advance: u32 = rng.gen_range(0..u32::MAX / 3);
                match low.checked_add(advance) {
                    Some(l) => low = l,
                    None => {
                        low = low.wrapping_add(advance);
                        // counter either carries properly or resets its high word
                        high = if rng.gen_bool(0.5) { high.wrapping_add(1) } else { 0 };
                    }
                }
            }
        }
    }
}
