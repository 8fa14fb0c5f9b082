//! Parameter marshalling.
//!
//! Technique parameters arrive as loosely typed [`RawValue`]s grouped by label
//! in a [`ParameterSet`]. The marshaller casts each value to the type the
//! technique declares, numbers the values contiguously and bundles them
//! into an immutable [`ParameterBundle`] tagged with its position in the
//! technique sequence. Bundles lower to fixed-layout [`ParamRecord`]s, the
//! representation the native driver consumes.
//!
//! # Example
//!
//! ```
//! use echem_core::parameter::{bundle, ParameterSet};
//! use echem_core::technique::OCV;
//!
//! let values = ParameterSet::new()
//!     .with("Rest_time_T", 60.0)
//!     .with("Record_every_dE", 0.01)
//!     .with("Record_every_dT", 1.0);
//!
//! let bundle = bundle(&OCV, &values, 0, 1)?;
//! assert!(bundle.is_first() && bundle.is_last());
//! assert_eq!(bundle.len(), 3);
//! # Ok::<(), echem_core::error::EchemError>(())
//! ```

use crate::catalog::TechniqueId;
use crate::error::{EchemError, Result};
use crate::technique::TechniqueDef;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Largest integer magnitude a single precision float represents exactly.
const SINGLE_EXACT_INT: u64 = 1 << 24;

/// Declared type of a technique parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKind {
    /// 32-bit signed integer.
    Int32,
    /// Boolean, transmitted as 0 or 1.
    Boolean,
    /// IEEE-754 single precision float.
    Single,
}

impl ParamKind {
    /// Type code carried in a [`ParamRecord`].
    pub fn code(self) -> i32 {
        match self {
            Self::Int32 => 0,
            Self::Boolean => 1,
            Self::Single => 2,
        }
    }

    /// Resolves a record type code.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Int32),
            1 => Some(Self::Boolean),
            2 => Some(Self::Single),
            _ => None,
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int32 => f.write_str("int32"),
            Self::Boolean => f.write_str("boolean"),
            Self::Single => f.write_str("single"),
        }
    }
}

/// An uncast parameter value as supplied by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value.
    Float(f64),
}

impl From<bool> for RawValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for RawValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<i64> for RawValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u32> for RawValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f32> for RawValue {
    fn from(v: f32) -> Self {
        Self::Float(f64::from(v))
    }
}

impl From<f64> for RawValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

/// A value represented exactly in its declared type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// 32-bit integer.
    Int32(i32),
    /// Boolean.
    Boolean(bool),
    /// Single precision float.
    Single(f32),
}

impl Value {
    /// Declared type of the value.
    pub fn kind(self) -> ParamKind {
        match self {
            Self::Int32(_) => ParamKind::Int32,
            Self::Boolean(_) => ParamKind::Boolean,
            Self::Single(_) => ParamKind::Single,
        }
    }

    /// The 32-bit word carried in a [`ParamRecord`].
    ///
    /// Singles travel as their IEEE-754 bit pattern.
    pub fn bits(self) -> i32 {
        match self {
            Self::Int32(v) => v,
            Self::Boolean(v) => i32::from(v),
            Self::Single(v) => v.to_bits() as i32,
        }
    }

    /// Reinterprets a record word as a value of `kind`.
    pub fn from_bits(kind: ParamKind, bits: i32) -> Self {
        match kind {
            ParamKind::Int32 => Self::Int32(bits),
            ParamKind::Boolean => Self::Boolean(bits != 0),
            ParamKind::Single => Self::Single(f32::from_bits(bits as u32)),
        }
    }

    /// Numeric view of the value.
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int32(v) => f64::from(v),
            Self::Boolean(v) => f64::from(u8::from(v)),
            Self::Single(v) => f64::from(v),
        }
    }
}

/// Casts `value` to `kind`, refusing any conversion that loses information.
///
/// - integers narrow to `Int32` only when in range;
/// - booleans map to and from `{0, 1}`;
/// - floats become singles when finite and within single precision range;
/// - integers become singles only when exactly representable (`|i| <= 2^24`);
/// - floats become integers only when integral and in range.
pub fn cast(value: RawValue, kind: ParamKind) -> Result<Value> {
    match (value, kind) {
        (RawValue::Bool(b), ParamKind::Boolean) => Ok(Value::Boolean(b)),
        (RawValue::Bool(b), ParamKind::Int32) => Ok(Value::Int32(i32::from(b))),
        (RawValue::Bool(b), ParamKind::Single) => Ok(Value::Single(if b { 1.0 } else { 0.0 })),

        (RawValue::Int(i), ParamKind::Int32) => i32::try_from(i)
            .map(Value::Int32)
            .map_err(|_| EchemError::invalid(format!("{i} does not fit in int32"))),
        (RawValue::Int(i), ParamKind::Boolean) => match i {
            0 => Ok(Value::Boolean(false)),
            1 => Ok(Value::Boolean(true)),
            _ => Err(EchemError::invalid(format!("{i} is not a boolean (expected 0 or 1)"))),
        },
        (RawValue::Int(i), ParamKind::Single) => {
            if i.unsigned_abs() <= SINGLE_EXACT_INT {
                Ok(Value::Single(i as f32))
            } else {
                Err(EchemError::invalid(format!(
                    "{i} is not exactly representable as single"
                )))
            }
        }

        (RawValue::Float(f), _) if !f.is_finite() => {
            Err(EchemError::invalid(format!("{f} is not a finite number")))
        }
        (RawValue::Float(f), ParamKind::Single) => {
            if f.abs() <= f64::from(f32::MAX) {
                Ok(Value::Single(f as f32))
            } else {
                Err(EchemError::invalid(format!("{f} exceeds single precision range")))
            }
        }
        (RawValue::Float(f), ParamKind::Int32) => {
            if f.fract() == 0.0 && f >= f64::from(i32::MIN) && f <= f64::from(i32::MAX) {
                Ok(Value::Int32(f as i32))
            } else {
                Err(EchemError::invalid(format!("{f} is not an int32 value")))
            }
        }
        (RawValue::Float(f), ParamKind::Boolean) => {
            if f == 0.0 {
                Ok(Value::Boolean(false))
            } else if f == 1.0 {
                Ok(Value::Boolean(true))
            } else {
                Err(EchemError::invalid(format!("{f} is not a boolean (expected 0 or 1)")))
            }
        }
    }
}

/// Identity of a value inside a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParameterSpec {
    /// Parameter label.
    pub name: &'static str,
    /// Declared type.
    pub kind: ParamKind,
    /// Position within the bundle, contiguous from 0.
    pub index: usize,
}

/// A spec paired with a value exactly representable in the spec's type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterValue {
    spec: ParameterSpec,
    element: usize,
    value: Value,
}

impl ParameterValue {
    /// Casts `raw` to the spec's type.
    ///
    /// `element` is the value's position among values sharing the label.
    pub fn new(spec: ParameterSpec, element: usize, raw: RawValue) -> Result<Self> {
        let value = cast(raw, spec.kind)
            .map_err(|e| EchemError::invalid(format!("{}[{element}]: {e}", spec.name)))?;
        Ok(Self {
            spec,
            element,
            value,
        })
    }

    /// Spec of the value.
    pub fn spec(&self) -> &ParameterSpec {
        &self.spec
    }

    /// Label of the value.
    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    /// Position within the bundle.
    pub fn index(&self) -> usize {
        self.spec.index
    }

    /// Position among values sharing the label.
    pub fn element(&self) -> usize {
        self.element
    }

    /// Cast value.
    pub fn value(&self) -> Value {
        self.value
    }
}

/// Uncast parameter values grouped by label, in insertion order.
///
/// Scalar parameters hold one value; multi-step parameters hold a list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    entries: Vec<(String, Vec<RawValue>)>,
}

impl ParameterSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a scalar parameter.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<RawValue>) -> Self {
        self.insert(name, vec![value.into()]);
        self
    }

    /// Adds or replaces a list parameter.
    #[must_use]
    pub fn with_list<V>(mut self, name: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self
    where
        V: Into<RawValue>,
    {
        self.insert(name, values.into_iter().map(Into::into).collect());
        self
    }

    /// Adds or replaces the values for `name`.
    pub fn insert(&mut self, name: impl Into<String>, values: Vec<RawValue>) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, existing)) => *existing = values,
            None => self.entries.push((name, values)),
        }
    }

    /// Values stored for `name`.
    pub fn get(&self, name: &str) -> Option<&[RawValue]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Iterates over `(label, values)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[RawValue])> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_slice()))
    }

    /// Total number of values across all labels.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|(_, v)| v.len()).sum()
    }

    /// Whether the set holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cast, indexed parameter values for one technique invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterBundle {
    technique: TechniqueId,
    values: Vec<ParameterValue>,
    is_first: bool,
    is_last: bool,
}

impl ParameterBundle {
    /// Technique the bundle belongs to.
    pub fn technique(&self) -> TechniqueId {
        self.technique
    }

    /// Whether the bundle opens its technique sequence.
    pub fn is_first(&self) -> bool {
        self.is_first
    }

    /// Whether the bundle closes its technique sequence.
    pub fn is_last(&self) -> bool {
        self.is_last
    }

    /// Values in index order.
    pub fn values(&self) -> &[ParameterValue] {
        &self.values
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the bundle is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// First value carrying `name`.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.values
            .iter()
            .find(|v| v.name() == name)
            .map(ParameterValue::value)
    }

    /// Maps named values onto bundle indices for [`update`].
    ///
    /// Each value in `set` must address an existing `(label, element)` pair.
    pub fn resolve(&self, set: &ParameterSet) -> Result<Vec<(usize, RawValue)>> {
        let mut resolved = Vec::with_capacity(set.len());
        for (name, values) in set.iter() {
            for (element, raw) in values.iter().enumerate() {
                let target = self
                    .values
                    .iter()
                    .find(|v| v.name() == name && v.element() == element)
                    .ok_or_else(|| {
                        EchemError::invalid(format!(
                            "{} bundle has no value {name}[{element}]",
                            self.technique
                        ))
                    })?;
                resolved.push((target.index(), *raw));
            }
        }
        Ok(resolved)
    }

    /// Lowers the bundle to driver records.
    pub fn records(&self) -> Vec<ParamRecord> {
        self.values.iter().map(ParamRecord::from_value).collect()
    }

    /// Value of the technique's sampling interval parameter, if positive.
    pub(crate) fn interval(&self, name: &str) -> Option<Duration> {
        let secs = self.get(name)?.as_f64();
        (secs.is_finite() && secs > 0.0).then(|| Duration::from_secs_f64(secs))
    }
}

/// Bundles `values` for `technique` at `position` of a sequence of
/// `sequence_length` techniques.
///
/// Fails with [`EchemError::InvalidParameter`] on unknown labels, on labels
/// with more values than declared, when the total exceeds the technique's
/// maximum arity, or when any value cannot be cast.
pub fn bundle(
    technique: &TechniqueDef,
    values: &ParameterSet,
    position: usize,
    sequence_length: usize,
) -> Result<ParameterBundle> {
    if position >= sequence_length {
        return Err(EchemError::invalid(format!(
            "position {position} outside sequence of length {sequence_length}"
        )));
    }
    if values.len() > technique.max_arity {
        return Err(EchemError::invalid(format!(
            "{} accepts at most {} values, got {}",
            technique.id,
            technique.max_arity,
            values.len()
        )));
    }

    let mut bundled = Vec::with_capacity(values.len());
    for (name, raw_values) in values.iter() {
        let decl = technique.param(name).ok_or_else(|| {
            EchemError::invalid(format!("{} has no parameter {name}", technique.id))
        })?;
        if raw_values.is_empty() {
            return Err(EchemError::invalid(format!("{name} has no values")));
        }
        if raw_values.len() > decl.max_len {
            return Err(EchemError::invalid(format!(
                "{name} accepts at most {} values, got {}",
                decl.max_len,
                raw_values.len()
            )));
        }
        for (element, raw) in raw_values.iter().enumerate() {
            let spec = ParameterSpec {
                name: decl.name,
                kind: decl.kind,
                index: bundled.len(),
            };
            bundled.push(ParameterValue::new(spec, element, *raw)?);
        }
    }

    Ok(ParameterBundle {
        technique: technique.id,
        values: bundled,
        is_first: position == 0,
        is_last: position + 1 == sequence_length,
    })
}

/// Returns a copy of `existing` with the values at the given indices
/// replaced, recast to their declared types.
///
/// All other values and the first/last flags are preserved.
pub fn update(existing: &ParameterBundle, partial: &[(usize, RawValue)]) -> Result<ParameterBundle> {
    let mut updated = existing.clone();
    for (index, raw) in partial {
        let slot = updated
            .values
            .iter_mut()
            .find(|v| v.index() == *index)
            .ok_or_else(|| {
                EchemError::invalid(format!(
                    "{} bundle has no parameter at index {index}",
                    existing.technique
                ))
            })?;
        *slot = ParameterValue::new(slot.spec, slot.element, *raw)?;
    }
    Ok(updated)
}

/// Length of the NUL padded label field of a [`ParamRecord`].
pub const PARAM_LABEL_LEN: usize = 64;

/// Encoded size of a [`ParamRecord`].
pub const PARAM_RECORD_LEN: usize = PARAM_LABEL_LEN + 3 * 4;

/// One parameter as the native library receives it.
///
/// Layout (little endian): 64-byte NUL padded label, `i32` type code,
/// `i32` value word, `i32` element index.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ParamRecord {
    label: [u8; PARAM_LABEL_LEN],
    kind: i32,
    value: i32,
    index: i32,
}

impl ParamRecord {
    fn from_value(value: &ParameterValue) -> Self {
        let mut label = [0u8; PARAM_LABEL_LEN];
        let name = value.name().as_bytes();
        // keep the terminating NUL
        let len = name.len().min(PARAM_LABEL_LEN - 1);
        label[..len].copy_from_slice(&name[..len]);
        Self {
            label,
            kind: value.value().kind().code(),
            value: value.value().bits(),
            index: i32::try_from(value.element()).unwrap_or(i32::MAX),
        }
    }

    /// Label up to the first NUL.
    pub fn label(&self) -> &str {
        let end = self
            .label
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(PARAM_LABEL_LEN);
        std::str::from_utf8(&self.label[..end]).unwrap_or("")
    }

    /// Type code.
    pub fn kind(&self) -> i32 {
        self.kind
    }

    /// Value word.
    pub fn value(&self) -> i32 {
        self.value
    }

    /// Element index among records sharing the label.
    pub fn index(&self) -> i32 {
        self.index
    }

    /// Typed view of the value word.
    pub fn typed_value(&self) -> Option<Value> {
        ParamKind::from_code(self.kind).map(|k| Value::from_bits(k, self.value))
    }

    /// Appends the encoded record to `buf`.
    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.label);
        buf.put_i32_le(self.kind);
        buf.put_i32_le(self.value);
        buf.put_i32_le(self.index);
    }

    /// Decodes one record from the front of `buf`.
    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < PARAM_RECORD_LEN {
            return Err(EchemError::decode(format!(
                "parameter record needs {PARAM_RECORD_LEN} bytes, {} remaining",
                buf.remaining()
            )));
        }
        let mut label = [0u8; PARAM_LABEL_LEN];
        buf.copy_to_slice(&mut label);
        Ok(Self {
            label,
            kind: buf.get_i32_le(),
            value: buf.get_i32_le(),
            index: buf.get_i32_le(),
        })
    }
}

impl fmt::Debug for ParamRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamRecord")
            .field("label", &self.label())
            .field("kind", &self.kind)
            .field("value", &self.typed_value())
            .field("index", &self.index)
            .finish()
    }
}

/// Encodes a record list into one contiguous buffer.
pub fn encode_records(records: &[ParamRecord]) -> Bytes {
    let mut buf = BytesMut::with_capacity(records.len() * PARAM_RECORD_LEN);
    for record in records {
        record.encode(&mut buf);
    }
    buf.freeze()
}

/// One technique of a [`TechniqueSequence`].
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceEntry {
    definition: &'static TechniqueDef,
    bundle: ParameterBundle,
}

impl SequenceEntry {
    /// Technique declaration.
    pub fn definition(&self) -> &'static TechniqueDef {
        self.definition
    }

    /// Current bundle.
    pub fn bundle(&self) -> &ParameterBundle {
        &self.bundle
    }
}

/// Ordered techniques loaded on one channel.
///
/// Exactly one bundle is marked first and exactly one is marked last; a
/// single technique carries both marks.
#[derive(Debug, Clone, PartialEq)]
pub struct TechniqueSequence {
    entries: Vec<SequenceEntry>,
}

impl TechniqueSequence {
    /// Bundles every technique with its position in the sequence.
    pub fn build<I>(techniques: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'static TechniqueDef, ParameterSet)>,
    {
        let techniques: Vec<_> = techniques.into_iter().collect();
        let len = techniques.len();
        let entries = techniques
            .into_iter()
            .enumerate()
            .map(|(position, (definition, values))| {
                bundle(definition, &values, position, len).map(|bundle| SequenceEntry {
                    definition,
                    bundle,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let sequence = Self { entries };
        sequence.validate()?;
        Ok(sequence)
    }

    fn validate(&self) -> Result<()> {
        if self.entries.is_empty() {
            return Err(EchemError::invalid("technique sequence is empty"));
        }
        let firsts = self.entries.iter().filter(|e| e.bundle.is_first).count();
        let lasts = self.entries.iter().filter(|e| e.bundle.is_last).count();
        if firsts != 1 || lasts != 1 {
            return Err(EchemError::invalid(format!(
                "sequence must have exactly one first and one last bundle (found {firsts} and {lasts})"
            )));
        }
        Ok(())
    }

    /// Entries in load order.
    pub fn entries(&self) -> &[SequenceEntry] {
        &self.entries
    }

    /// Entry at `index`.
    pub fn get(&self, index: usize) -> Option<&SequenceEntry> {
        self.entries.get(index)
    }

    /// Number of techniques.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false for a validated sequence.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Replaces values of the bundle at `index`, keeping its flags.
    pub fn update(&mut self, index: usize, partial: &[(usize, RawValue)]) -> Result<&ParameterBundle> {
        let entry = self.entries.get_mut(index).ok_or_else(|| {
            EchemError::invalid(format!("no technique at sequence index {index}"))
        })?;
        entry.bundle = update(&entry.bundle, partial)?;
        Ok(&entry.bundle)
    }

    /// Shortest sampling interval declared by any bundle of the sequence.
    pub fn sample_interval(&self) -> Option<Duration> {
        self.entries
            .iter()
            .filter_map(|e| {
                e.definition
                    .interval_param
                    .and_then(|name| e.bundle.interval(name))
            })
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::technique::{ParamDecl, CA, OCV};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const SMALL_PARAMS: &[ParamDecl] = &[
        ParamDecl::new("Alpha", ParamKind::Single, 2),
        ParamDecl::new("Beta", ParamKind::Int32, 2),
    ];

    static SMALL: TechniqueDef = TechniqueDef {
        id: TechniqueId::Ocv,
        params: SMALL_PARAMS,
        max_arity: 3,
        interval_param: None,
    };

    #[test]
    fn test_cast_round_trip_int_and_bool() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        for _ in 0..1000 {
            let i: i32 = rng.gen();
            assert_eq!(cast(RawValue::from(i), ParamKind::Int32).unwrap(), Value::Int32(i));
        }
        assert_eq!(cast(true.into(), ParamKind::Boolean).unwrap(), Value::Boolean(true));
        assert_eq!(cast(RawValue::Int(0), ParamKind::Boolean).unwrap(), Value::Boolean(false));
        assert_eq!(cast(RawValue::Float(1.0), ParamKind::Boolean).unwrap(), Value::Boolean(true));
    }

    #[test]
    fn test_cast_round_trip_single() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..1000 {
            let f: f64 = rng.gen_range(-1e6..1e6);
            let Value::Single(s) = cast(f.into(), ParamKind::Single).unwrap() else {
                panic!("expected single");
            };
            assert!((f64::from(s) - f).abs() <= f.abs() * f64::from(f32::EPSILON));
        }
    }

    #[test]
    fn test_cast_rejects_lossy_values() {
        assert!(cast(RawValue::Int(i64::from(i32::MAX) + 1), ParamKind::Int32).is_err());
        assert!(cast(RawValue::Int(2), ParamKind::Boolean).is_err());
        assert!(cast(RawValue::Int((1 << 24) + 1), ParamKind::Single).is_err());
        assert!(cast(RawValue::Int(1 << 24), ParamKind::Single).is_ok());
        assert!(cast(RawValue::Int(-(1 << 24)), ParamKind::Single).is_ok());
        assert!(matches!(
            cast(RawValue::Int(i64::MIN), ParamKind::Single),
            Err(EchemError::InvalidParameter(_))
        ));
        assert!(cast(RawValue::Int(i64::MIN), ParamKind::Int32).is_err());
        assert!(cast(RawValue::Float(1e39), ParamKind::Single).is_err());
        assert!(cast(RawValue::Float(f64::NAN), ParamKind::Single).is_err());
        assert!(cast(RawValue::Float(f64::INFINITY), ParamKind::Int32).is_err());
        assert!(cast(RawValue::Float(2.5), ParamKind::Int32).is_err());
        assert!(cast(RawValue::Float(0.5), ParamKind::Boolean).is_err());
        assert_eq!(cast(RawValue::Float(-3.0), ParamKind::Int32).unwrap(), Value::Int32(-3));
    }

    #[test]
    fn test_arity_enforced() {
        let five = ParameterSet::new()
            .with_list("Alpha", [1.0, 2.0])
            .with_list("Beta", [1, 2])
            .with("Alpha2", 1.0);
        let err = bundle(&SMALL, &five, 0, 1).unwrap_err();
        assert!(matches!(err, EchemError::InvalidParameter(_)));

        let three = ParameterSet::new().with_list("Alpha", [1.0, 2.0]).with("Beta", 4);
        let ok = bundle(&SMALL, &three, 0, 1).unwrap();
        assert_eq!(ok.len(), 3);
        let indices: Vec<_> = ok.values().iter().map(ParameterValue::index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn test_unknown_and_oversized_labels_rejected() {
        let unknown = ParameterSet::new().with("Gamma", 1.0);
        assert!(bundle(&SMALL, &unknown, 0, 1).is_err());

        let oversized = ParameterSet::new().with_list("Beta", [1, 2, 3]);
        assert!(bundle(&SMALL, &oversized, 0, 1).is_err());

        let empty = ParameterSet::new().with_list("Beta", Vec::<i32>::new());
        assert!(bundle(&SMALL, &empty, 0, 1).is_err());
    }

    #[test]
    fn test_first_last_flags() {
        let values = ParameterSet::new().with("Alpha", 1.0);
        let single = bundle(&SMALL, &values, 0, 1).unwrap();
        assert!(single.is_first() && single.is_last());

        let flags: Vec<_> = (0..3)
            .map(|p| {
                let b = bundle(&SMALL, &values, p, 3).unwrap();
                (b.is_first(), b.is_last())
            })
            .collect();
        assert_eq!(flags, vec![(true, false), (false, false), (false, true)]);

        assert!(bundle(&SMALL, &values, 3, 3).is_err());
    }

    #[test]
    fn test_update_preserves_other_values_and_flags() {
        let values = ParameterSet::new().with_list("Alpha", [1.0, 2.0]).with("Beta", 4);
        let original = bundle(&SMALL, &values, 2, 3).unwrap();
        let updated = update(&original, &[(1, RawValue::Float(9.5))]).unwrap();

        assert_eq!(updated.values()[0], original.values()[0]);
        assert_eq!(updated.values()[1].value(), Value::Single(9.5));
        assert_eq!(updated.values()[2], original.values()[2]);
        assert!(!updated.is_first() && updated.is_last());

        assert!(update(&original, &[(3, RawValue::Int(1))]).is_err());
        assert!(update(&original, &[(2, RawValue::Float(0.5))]).is_err());
    }

    #[test]
    fn test_resolve_named_update() {
        let values = ParameterSet::new().with_list("Alpha", [1.0, 2.0]).with("Beta", 4);
        let b = bundle(&SMALL, &values, 0, 1).unwrap();
        let partial = b
            .resolve(&ParameterSet::new().with_list("Alpha", [5.0, 6.0]))
            .unwrap();
        assert_eq!(partial, vec![(0, RawValue::Float(5.0)), (1, RawValue::Float(6.0))]);
        assert!(b.resolve(&ParameterSet::new().with_list("Beta", [1, 2])).is_err());
    }

    #[test]
    fn test_record_layout() {
        let values = ParameterSet::new()
            .with_list("Voltage_step", [0.5, -0.25])
            .with("Step_number", 1);
        let b = bundle(&CA, &values, 0, 1).unwrap();
        let records = b.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].label(), "Voltage_step");
        assert_eq!(records[1].index(), 1);
        assert_eq!(records[1].kind(), ParamKind::Single.code());
        assert_eq!(records[1].typed_value(), Some(Value::Single(-0.25)));
        assert_eq!(records[2].index(), 0);

        let bytes = encode_records(&records);
        assert_eq!(bytes.len(), 3 * PARAM_RECORD_LEN);
        assert_eq!(&bytes[..12], b"Voltage_step");
        assert_eq!(bytes[12], 0);
        assert_eq!(&bytes[64..68], &2i32.to_le_bytes());
        assert_eq!(&bytes[68..72], &0.5f32.to_bits().to_le_bytes());

        let mut cursor = bytes.clone();
        let decoded = ParamRecord::decode(&mut cursor).unwrap();
        assert_eq!(decoded, records[0]);
        let mut short = &bytes[..10];
        assert!(ParamRecord::decode(&mut short).is_err());
    }

    #[test]
    fn test_sequence_flags_and_update() {
        let ocv = ParameterSet::new()
            .with("Rest_time_T", 10.0)
            .with("Record_every_dE", 0.01)
            .with("Record_every_dT", 0.5);
        let ca = ParameterSet::new()
            .with_list("Voltage_step", [0.1])
            .with("Record_every_dT", 2.0);
        let mut sequence =
            TechniqueSequence::build([(&OCV, ocv.clone()), (&CA, ca), (&OCV, ocv)]).unwrap();

        let flags: Vec<_> = sequence
            .entries()
            .iter()
            .map(|e| (e.bundle().is_first(), e.bundle().is_last()))
            .collect();
        assert_eq!(flags, vec![(true, false), (false, false), (false, true)]);
        assert_eq!(sequence.sample_interval(), Some(Duration::from_millis(500)));

        let updated = sequence.update(1, &[(0, RawValue::Float(0.2))]).unwrap();
        assert_eq!(updated.get("Voltage_step"), Some(Value::Single(0.2)));
        assert!(sequence.update(5, &[]).is_err());
        assert!(TechniqueSequence::build(Vec::new()).is_err());
    }
}
