//! Timing of the simulated instrument.
//!
//! Driver calls block the calling thread for the configured latency, the
//! same way calls into a native library do.

use std::time::Duration;

/// Latencies and clock of a simulated potentiostat.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingConfig {
    /// Time spent opening a connection.
    pub connect_latency: Duration,
    /// Time spent in every other driver call.
    pub call_latency: Duration,
    /// Seconds per tick of the hardware time counter.
    pub time_base: f64,
}

impl TimingConfig {
    /// Zero latency, for unit tests.
    pub fn instant() -> Self {
        Self {
            connect_latency: Duration::ZERO,
            call_latency: Duration::ZERO,
            time_base: 2e-5,
        }
    }

    /// Ethernet-connected VMP3 class instrument.
    pub fn ethernet() -> Self {
        Self {
            connect_latency: Duration::from_millis(150),
            call_latency: Duration::from_millis(3),
            time_base: 2e-5,
        }
    }

    /// USB-connected SP-300 class instrument.
    pub fn usb() -> Self {
        Self {
            connect_latency: Duration::from_millis(60),
            call_latency: Duration::from_millis(1),
            time_base: 2e-5,
        }
    }

    /// Overrides the connection latency.
    #[must_use]
    pub fn with_connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self::instant()
    }
}
