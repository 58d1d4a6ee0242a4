//! Parallel degree-day extraction over a whole grid.
//!
//! Eligible cells are spread across a dedicated rayon pool. Workers only read
//! the input grid; each finished cell is sent over a bounded channel to a
//! single aggregator thread, which writes TDD, FDD, roots and the method map
//! together under one lock. A panicking cell is caught and written as an
//! exhausted cell, so one bad cell never stops the run.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::aggregate::{DegreeDayOutputs, RunReport};
use crate::error::{DdcError, Result};
use crate::extract::{self, CellOutcome, ExtractOptions, Extraction};
use crate::grid::TemporalGrid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalcOptions {
    pub extract: ExtractOptions,
    /// Compute threads; the aggregator thread comes on top.
    pub workers: usize,
    /// Results buffered between workers and the aggregator.
    pub channel_capacity: usize,
    /// Only cells with a flattened index strictly above this are computed.
    pub start_at: Option<usize>,
}

impl Default for CalcOptions {
    fn default() -> Self {
        Self {
            extract: ExtractOptions::default(),
            workers: 1,
            channel_capacity: 1024,
            start_at: None,
        }
    }
}

/// Flattened indices of the cells a run computes: first timestep present,
/// index past `start_at`, and flagged in `recalc` when a mask is given.
pub fn select_cells(temps: &TemporalGrid, start_at: Option<usize>, recalc: Option<&[bool]>) -> Vec<usize> {
    temps
        .plane(0)
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .map(|(i, _)| i)
        .filter(|&i| start_at.map_or(true, |s| i > s))
        .filter(|&i| recalc.map_or(true, |m| m.get(i).copied().unwrap_or(false)))
        .collect()
}

fn check_inputs(temps: &TemporalGrid, days: &[f64], outputs: &DegreeDayOutputs, recalc: Option<&[bool]>) -> Result<()> {
    if days.len() != temps.num_timesteps() {
        return Err(DdcError::InvalidGrid(format!(
            "{} day offsets for {} temperature timesteps",
            days.len(),
            temps.num_timesteps()
        )));
    }
    let (rows, cols) = (temps.rows(), temps.cols());
    let found = outputs.tdd.config().shape();
    if (found.1, found.2) != (rows, cols) {
        return Err(DdcError::ShapeMismatch {
            what: "output grids".to_string(),
            expected: (found.0, rows, cols),
            found,
        });
    }
    if let Some(mask) = recalc {
        if mask.len() != rows * cols {
            return Err(DdcError::ShapeMismatch {
                what: "recalculation mask".to_string(),
                expected: (1, rows, cols),
                found: (1, 1, mask.len()),
            });
        }
    }
    Ok(())
}

fn run_cell(index: usize, temps: &TemporalGrid, days: &[f64], num_years: usize, opts: &ExtractOptions) -> Extraction {
    let series: Vec<f64> = temps.cell_series(index).into_iter().map(f64::from).collect();
    panic::catch_unwind(AssertUnwindSafe(|| extract::extract_cell(days, &series, num_years, opts))).unwrap_or_else(
        |_| {
            error!(index, "cell extraction panicked; writing sentinels");
            Extraction { outcome: CellOutcome::Exhausted, spline_error: None }
        },
    )
}

/// Compute degree days for every eligible cell of `temps` into `outputs`.
///
/// `days` holds the day offset of each temperature timestep. `progress` is
/// called once per written cell.
pub fn calc_grid_degree_days(
    temps: &TemporalGrid,
    days: &[f64],
    outputs: &mut DegreeDayOutputs,
    opts: &CalcOptions,
    recalc: Option<&[bool]>,
    progress: &(dyn Fn() + Sync),
) -> Result<RunReport> {
    check_inputs(temps, days, outputs, recalc)?;
    let cells = select_cells(temps, opts.start_at, recalc);
    let num_years = outputs.num_years();
    let cols = temps.cols();
    let workers = opts.workers.max(1);
    info!(cells = cells.len(), workers, num_years, "starting degree-day extraction");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("ddc-worker-{i}"))
        .build()
        .map_err(|e| DdcError::ThreadPool(e.to_string()))?;

    let (tx, rx) = mpsc::sync_channel::<(usize, Extraction)>(opts.channel_capacity.max(1));
    let shared = Mutex::new(outputs);

    let joined = thread::scope(|scope| {
        let shared = &shared;
        let aggregator = thread::Builder::new()
            .name("ddc-aggregator".to_string())
            .spawn_scoped(scope, move || {
                let mut report = RunReport::default();
                for (index, extraction) in rx {
                    shared.lock().write_cell(index, &extraction);
                    report.record(index, cols, &extraction);
                    progress();
                }
                report
            })
            .map_err(|e| DdcError::Aggregator(e.to_string()))?;

        pool.install(|| {
            cells.par_iter().for_each_with(tx, |tx, &index| {
                let extraction = run_cell(index, temps, days, num_years, &opts.extract);
                if tx.send((index, extraction)).is_err() {
                    error!(index, "aggregator gone; result dropped");
                }
            });
        });

        aggregator
            .join()
            .map_err(|_| DdcError::Aggregator("aggregator thread panicked".to_string()))
    });
    let mut report = joined?;

    report.dispatched = cells.len();
    report.finish();
    shared.into_inner().flush()?;
    info!(
        spline = report.spline,
        range = report.range,
        exhausted = report.exhausted,
        missing = report.missing,
        spline_errors = report.spline_errors.len(),
        "degree-day extraction finished"
    );
    Ok(report)
}
