//! Electrical model of the simulated cell.
//!
//! The cell is a Randles circuit without diffusion: a series resistance in
//! front of a charge-transfer resistance shunted by a double-layer
//! capacitance, around a slowly relaxing open circuit potential.

use std::f64::consts::PI;

/// Randles cell used to synthesize measurements.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellModel {
    /// Open circuit potential once relaxed, in volts.
    pub ocv: f64,
    /// Relaxation added to the open circuit potential at `t = 0`, in volts.
    pub relaxation: f64,
    /// Time constant of the relaxation, in seconds.
    pub relaxation_time: f64,
    /// Series (electrolyte) resistance in ohms.
    pub series_resistance: f64,
    /// Charge-transfer resistance in ohms.
    pub charge_transfer_resistance: f64,
    /// Double-layer capacitance in farads.
    pub capacitance: f64,
}

impl Default for CellModel {
    fn default() -> Self {
        Self {
            ocv: 0.45,
            relaxation: 0.005,
            relaxation_time: 30.0,
            series_resistance: 10.0,
            charge_transfer_resistance: 100.0,
            capacitance: 20e-6,
        }
    }
}

impl CellModel {
    /// Open circuit potential `t` seconds after the channel started.
    pub fn open_circuit(&self, t: f64) -> f64 {
        if self.relaxation_time <= 0.0 {
            return self.ocv;
        }
        self.ocv + self.relaxation * (-t / self.relaxation_time).exp()
    }

    /// DC resistance of the cell.
    pub fn dc_resistance(&self) -> f64 {
        self.series_resistance + self.charge_transfer_resistance
    }

    /// Steady state current under an applied potential.
    pub fn current_at(&self, potential: f64, t: f64) -> f64 {
        (potential - self.open_circuit(t)) / self.dc_resistance()
    }

    /// Steady state potential under an applied current.
    pub fn potential_at(&self, current: f64, t: f64) -> f64 {
        self.open_circuit(t) + current * self.dc_resistance()
    }

    /// Complex impedance at `frequency` Hz as `(real, imaginary)` ohms.
    pub fn impedance(&self, frequency: f64) -> (f64, f64) {
        let omega = 2.0 * PI * frequency;
        let rct = self.charge_transfer_resistance;
        let x = omega * rct * self.capacitance;
        let denom = 1.0 + x * x;
        (self.series_resistance + rct / denom, -rct * x / denom)
    }

    /// Impedance modulus and phase (degrees) at `frequency` Hz.
    pub fn impedance_polar(&self, frequency: f64) -> (f64, f64) {
        let (re, im) = self.impedance(frequency);
        (re.hypot(im), im.atan2(re).to_degrees())
    }
}

/// Frequencies of an impedance sweep.
///
/// Logarithmic spacing unless `linear`; a single point sits at `initial`.
pub fn sweep_frequencies(initial: f64, last: f64, points: usize, linear: bool) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![initial],
        n => (0..n)
            .map(|i| {
                let x = i as f64 / (n - 1) as f64;
                if linear || initial <= 0.0 || last <= 0.0 {
                    initial + (last - initial) * x
                } else {
                    initial * (last / initial).powf(x)
                }
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_circuit_relaxes() {
        let cell = CellModel::default();
        assert!((cell.open_circuit(0.0) - 0.455).abs() < 1e-12);
        assert!(cell.open_circuit(10.0) > cell.open_circuit(20.0));
        assert!((cell.open_circuit(1e6) - cell.ocv).abs() < 1e-9);
    }

    #[test]
    fn test_ohmic_response() {
        let cell = CellModel {
            relaxation: 0.0,
            ..CellModel::default()
        };
        let i = cell.current_at(cell.ocv + 0.11, 0.0);
        assert!((i - 1e-3).abs() < 1e-12);
        assert!((cell.potential_at(i, 0.0) - (cell.ocv + 0.11)).abs() < 1e-12);
    }

    #[test]
    fn test_impedance_limits() {
        let cell = CellModel::default();
        let (low, phase_low) = cell.impedance_polar(1e-3);
        let (high, phase_high) = cell.impedance_polar(1e7);
        assert!((low - cell.dc_resistance()).abs() < 0.1);
        assert!((high - cell.series_resistance).abs() < 0.1);
        assert!(phase_low > -1.0 && phase_high > -1.0);
        let (_, phase_mid) = cell.impedance_polar(100.0);
        assert!(phase_mid < -10.0);
    }

    #[test]
    fn test_sweep_frequencies() {
        let log = sweep_frequencies(1e5, 1.0, 6, false);
        assert_eq!(log.len(), 6);
        for (f, expected) in log.iter().zip([1e5, 1e4, 1e3, 1e2, 1e1, 1.0]) {
            assert!((f / expected - 1.0).abs() < 1e-9);
        }
        assert_eq!(sweep_frequencies(10.0, 20.0, 3, true), vec![10.0, 15.0, 20.0]);
        assert_eq!(sweep_frequencies(10.0, 20.0, 1, true), vec![10.0]);
        assert!(sweep_frequencies(10.0, 20.0, 0, false).is_empty());
    }
}
