//! CSV export of acquired records.

use anyhow::{Context, Result};
use echem_core::MeasurementRecord;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// One CSV line.
#[derive(Debug, Serialize)]
struct Row {
    channel: u8,
    technique: String,
    technique_index: i32,
    process: i32,
    elapsed: f64,
    voltage: Option<f64>,
    current: Option<f64>,
    cycle: Option<i32>,
    state: i32,
}

impl Row {
    fn new(channel: u8, record: &MeasurementRecord) -> Self {
        Self {
            channel,
            technique: record.technique.to_string(),
            technique_index: record.technique_index,
            process: record.process,
            elapsed: record.elapsed,
            voltage: record.voltage,
            current: record.current,
            cycle: record.cycle,
            state: record.state.code(),
        }
    }
}

/// Writes the records of every channel, one row per record.
pub fn write_records<'a, W, I>(writer: W, channels: I) -> Result<usize>
where
    W: Write,
    I: IntoIterator<Item = (u8, &'a [MeasurementRecord])>,
{
    let mut csv = csv::Writer::from_writer(writer);
    let mut rows = 0;
    for (channel, records) in channels {
        for record in records {
            csv.serialize(Row::new(channel, record))?;
            rows += 1;
        }
    }
    csv.flush()?;
    Ok(rows)
}

/// [`write_records`] into a new file at `path`.
pub fn write_file<'a, I>(path: &Path, channels: I) -> Result<usize>
where
    I: IntoIterator<Item = (u8, &'a [MeasurementRecord])>,
{
    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    write_records(file, channels).with_context(|| format!("writing {}", path.display()))
}
