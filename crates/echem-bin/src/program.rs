//! Program files: the channels to run and the technique sequence loaded on
//! each of them.
//!
//! ```toml
//! channels = [0, 1]
//!
//! [[techniques]]
//! technique = "ocv"
//! time = 5.0
//!
//! [[techniques]]
//! technique = "ca"
//! voltages = [0.2, 0.4]
//! durations = [2.0, 2.0]
//! ```

use anyhow::{bail, Context, Result};
use echem_core::technique::OcvParams;
use echem_core::Technique;
use serde::Deserialize;
use std::path::Path;

/// A technique sequence and the channels it runs on.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProgramFile {
    /// Channels loaded with the sequence.
    #[serde(default = "default_channels")]
    pub channels: Vec<u8>,
    /// Techniques in execution order.
    pub techniques: Vec<Technique>,
}

fn default_channels() -> Vec<u8> {
    vec![0]
}

impl ProgramFile {
    /// Reads and validates a TOML program file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses a TOML program.
    pub fn parse(text: &str) -> Result<Self> {
        let program: Self = toml::from_str(text)?;
        program.validate()?;
        Ok(program)
    }

    /// Open circuit rest of `time` seconds on `channels`.
    pub fn ocv(channels: Vec<u8>, time: f64, interval: f64) -> Result<Self> {
        let program = Self {
            channels,
            techniques: vec![Technique::Ocv(OcvParams {
                time_interval: interval,
                ..OcvParams::new(time)
            })],
        };
        program.validate()?;
        Ok(program)
    }

    fn validate(&self) -> Result<()> {
        if self.techniques.is_empty() {
            bail!("program has no techniques");
        }
        if self.channels.is_empty() {
            bail!("program has no channels");
        }
        let mut seen = self.channels.clone();
        seen.sort_unstable();
        if let Some(pair) = seen.windows(2).find(|pair| pair[0] == pair[1]) {
            bail!("channel {} listed twice", pair[0]);
        }
        Ok(())
    }
}
