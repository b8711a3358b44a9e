//! Assembled solve results.

use std::fmt;

use ndarray::{Array2, Array3, Array4, ArrayView2, ArrayView3, Axis, s};
use num_complex::Complex64;

use crate::equation::EquationKind;
use crate::integrator::{Lane, StepRecord, TrajectoryStatus};
use crate::state::expect;

/// Saved states, step records and statuses of a batch.
///
/// Slots a diverged trajectory never reached hold NaN.
#[derive(Debug, Clone)]
pub struct Solution {
    method: &'static str,
    kind: EquationKind,
    tsave: Vec<f64>,
    states: Array4<Complex64>,
    stats: Vec<StepRecord>,
    status: Vec<TrajectoryStatus>,
    measurements: Option<Array3<f64>>,
}

impl Solution {
    pub(crate) fn assemble(
        method: &'static str,
        kind: EquationKind,
        tsave: &[f64],
        shape: (usize, usize),
        channels: usize,
        lanes: Vec<Lane>,
    ) -> Self {
        let nan = Complex64::new(f64::NAN, f64::NAN);
        let batch = lanes.len();
        let mut states = Array4::from_elem((batch, tsave.len(), shape.0, shape.1), nan);
        let mut measurements = (kind == EquationKind::StochasticMaster && channels > 0)
            .then(|| Array3::from_elem((batch, channels, tsave.len().saturating_sub(1)), f64::NAN));

        let mut stats = Vec::with_capacity(batch);
        let mut status = Vec::with_capacity(batch);
        for lane in lanes {
            for (k, y) in lane.saved.iter().enumerate() {
                states.slice_mut(s![lane.index, k, .., ..]).assign(y);
            }
            if let Some(m) = measurements.as_mut() {
                for (channel, currents) in lane.measurements.iter().enumerate() {
                    for (k, &v) in currents.iter().enumerate() {
                        m[[lane.index, channel, k]] = v;
                    }
                }
            }
            stats.push(lane.state.record);
            status.push(lane.state.status);
        }

        Self {
            method,
            kind,
            tsave: tsave.to_vec(),
            states,
            stats,
            status,
            measurements,
        }
    }

    /// Name of the stepping method.
    pub fn method(&self) -> &'static str {
        self.method
    }

    /// Equation class.
    pub fn kind(&self) -> EquationKind {
        self.kind
    }

    /// Save schedule.
    pub fn tsave(&self) -> &[f64] {
        &self.tsave
    }

    /// Number of trajectories.
    pub fn batch_size(&self) -> usize {
        self.states.len_of(Axis(0))
    }

    /// All saved states, `batch × time × n × m`.
    pub fn states(&self) -> &Array4<Complex64> {
        &self.states
    }

    /// Saved states of one trajectory, `time × n × m`.
    pub fn lane_states(&self, lane: usize) -> ArrayView3<'_, Complex64> {
        self.states.index_axis(Axis(0), lane)
    }

    /// One saved state.
    pub fn state(&self, lane: usize, save_index: usize) -> ArrayView2<'_, Complex64> {
        self.states.slice(s![lane, save_index, .., ..])
    }

    /// States at the last save time, `batch × n × m`.
    pub fn final_states(&self) -> ArrayView3<'_, Complex64> {
        let last = self.tsave.len().saturating_sub(1);
        self.states.index_axis(Axis(1), last)
    }

    /// Step records per trajectory.
    pub fn stats(&self) -> &[StepRecord] {
        &self.stats
    }

    /// Status per trajectory.
    pub fn status(&self) -> &[TrajectoryStatus] {
        &self.status
    }

    /// True when every trajectory finished.
    pub fn is_success(&self) -> bool {
        self.status.iter().all(TrajectoryStatus::is_finished)
    }

    /// Accepted and rejected steps summed over the batch.
    pub fn total_steps(&self) -> (u64, u64) {
        self.stats.iter().fold((0, 0), |(a, r), s| {
            (a + s.accepted_steps, r + s.rejected_steps)
        })
    }

    /// Mean measurement current per trajectory, channel and save interval
    /// for stochastic problems.
    pub fn measurements(&self) -> Option<&Array3<f64>> {
        self.measurements.as_ref()
    }

    /// `⟨O⟩` for every trajectory and save time, `batch × time`.
    pub fn expectation(&self, op: &Array2<Complex64>) -> Array2<Complex64> {
        let (batch, times) = (self.batch_size(), self.tsave.len());
        Array2::from_shape_fn((batch, times), |(b, k)| {
            expect(op, &self.state(b, k).to_owned())
        })
    }
}

fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["Kb", "Mb", "Gb", "Tb"];
    if bytes < 1024 {
        return format!("{bytes} b");
    }
    let mut value = bytes as f64;
    let mut unit = "b";
    for u in UNITS {
        if value < 1024.0 {
            break;
        }
        value /= 1024.0;
        unit = u;
    }
    format!("{value:.1} {unit}")
}

impl fmt::Display for Solution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = self
            .states
            .shape()
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        let bytes = self.states.len() * std::mem::size_of::<Complex64>();
        let (accepted, rejected) = self.total_steps();
        writeln!(f, "==== Result ====")?;
        writeln!(f, "Solver  : {}", self.method)?;
        writeln!(f, "States  : complex128 ({shape}) | {}", format_bytes(bytes))?;
        write!(
            f,
            "Infos   : {} steps ({accepted} accepted, {rejected} rejected)",
            accepted + rejected
        )?;
        let diverged = self.status.iter().filter(|s| s.is_terminal() && !s.is_finished()).count();
        if diverged > 0 {
            write!(
                f,
                "\nStatus  : {diverged} of {} trajectories diverged",
                self.status.len()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(64), "64 b");
        assert_eq!(format_bytes(2048), "2.0 Kb");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 Mb");
    }
}
