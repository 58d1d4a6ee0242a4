//! Hole filling by neighbourhood mean.
//!
//! Flagged cells get, for every timestep, the mean of the usable values in
//! the `(2r+1)×(2r+1)` window around them. NaN and −inf both count as
//! missing. The window is clipped at the grid edge. Cells are visited in
//! row-major order and written in place, so a hole filled earlier feeds the
//! holes after it.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::aggregate::DegreeDayOutputs;
use crate::error::{DdcError, Result};
use crate::grid::TemporalGrid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FillOptions {
    pub kernel_radius: usize,
    /// Force flagged cells to −inf before filling so their own values never
    /// enter the mean. On by default.
    pub reset: bool,
}

impl Default for FillOptions {
    fn default() -> Self {
        Self { kernel_radius: 1, reset: true }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FillReport {
    /// Flattened indices of the cells that were filled, row-major.
    pub filled: Vec<usize>,
    /// Cells left NaN in at least one timestep for lack of usable neighbours.
    pub unresolved: Vec<usize>,
}

impl FillReport {
    /// Combine the reports of two grids filled over the same mask.
    fn merge(mut self, other: FillReport) -> Self {
        for (list, more) in [(&mut self.filled, other.filled), (&mut self.unresolved, other.unresolved)] {
            list.extend(more);
            list.sort_unstable();
            list.dedup();
        }
        self
    }
}

fn usable(v: f32) -> bool {
    !v.is_nan() && v != f32::NEG_INFINITY
}

/// Mean of usable values in the clipped window around `(row, col)` on one plane.
fn window_mean(plane: &[f32], rows: usize, cols: usize, row: usize, col: usize, radius: usize) -> f32 {
    let (r0, r1) = (row.saturating_sub(radius), (row + radius).min(rows - 1));
    let (c0, c1) = (col.saturating_sub(radius), (col + radius).min(cols - 1));
    let mut sum = 0.0f64;
    let mut count = 0usize;
    for r in r0..=r1 {
        for &v in &plane[r * cols + c0..=r * cols + c1] {
            if usable(v) {
                sum += f64::from(v);
                count += 1;
            }
        }
    }
    if count == 0 {
        f32::NAN
    } else {
        (sum / count as f64) as f32
    }
}

/// Fill every cell flagged in `mask` with its neighbourhood mean.
pub fn fill_by_interpolation(
    grid: &mut TemporalGrid,
    mask: &[bool],
    opts: &FillOptions,
    progress: &dyn Fn(),
) -> Result<FillReport> {
    if mask.len() != grid.num_cells() {
        return Err(DdcError::ShapeMismatch {
            what: "fill mask".to_string(),
            expected: (1, grid.rows(), grid.cols()),
            found: (1, 1, mask.len()),
        });
    }
    let (rows, cols) = (grid.rows(), grid.cols());
    let targets: Vec<usize> = mask.iter().enumerate().filter(|(_, m)| **m).map(|(i, _)| i).collect();

    if opts.reset {
        debug!(cells = targets.len(), "resetting flagged cells to -inf");
        for &i in &targets {
            grid.fill_cell(i, f32::NEG_INFINITY);
        }
    }

    let mut report = FillReport::default();
    for &index in &targets {
        let (row, col) = (index / cols, index % cols);
        let mut unresolved = false;
        for t in 0..grid.num_timesteps() {
            let plane = grid.plane_mut(t);
            let value = window_mean(plane, rows, cols, row, col, opts.kernel_radius);
            unresolved |= value.is_nan();
            plane[index] = value;
        }
        if unresolved {
            report.unresolved.push(index);
        }
        report.filled.push(index);
        progress();
    }
    info!(
        dataset = %grid.config().dataset_name,
        filled = report.filled.len(),
        unresolved = report.unresolved.len(),
        "holes filled"
    );
    Ok(report)
}

/// Fill TDD and FDD at the flagged cells. Roots are left untouched.
pub fn fill_outputs(
    outputs: &mut DegreeDayOutputs,
    mask: &[bool],
    opts: &FillOptions,
    progress: &dyn Fn(),
) -> Result<FillReport> {
    let fdd = fill_by_interpolation(&mut outputs.fdd, mask, opts, progress)?;
    let tdd = fill_by_interpolation(&mut outputs.tdd, mask, opts, progress)?;
    outputs.flush()?;
    Ok(fdd.merge(tdd))
}
