//! Output grids and the per-run tally.
//!
//! [`DegreeDayOutputs`] bundles the TDD, FDD, roots and method-map grids that
//! every cell result is written into. [`RunReport`] counts outcomes and keeps
//! the spline errors raised along the way.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{DdcError, Result};
use crate::extract::{CellOutcome, Extraction, Method};
use crate::grid::{GridConfig, TemporalGrid, TimestepDelta};
use crate::raster::RasterMetadata;
use crate::roots::RootSearchError;

/// Shape and labelling shared by all output grids of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputLayout {
    pub rows: usize,
    pub cols: usize,
    pub num_years: usize,
    /// Calendar year of the first TDD/FDD timestep.
    pub start_year: i64,
    pub raster_metadata: RasterMetadata,
}

impl OutputLayout {
    fn annual(&self, name: &str) -> GridConfig {
        let mut cfg = GridConfig::new(name, self.rows, self.cols, self.num_years);
        cfg.start_timestep = self.start_year;
        cfg.delta_timestep = TimestepDelta::Yearly;
        cfg.raster_metadata = self.raster_metadata.clone();
        cfg
    }

    fn roots(&self) -> GridConfig {
        let mut cfg = GridConfig::new("roots", self.rows, self.cols, 2 * self.num_years);
        cfg.delta_timestep = TimestepDelta::Varies;
        cfg.raster_metadata = self.raster_metadata.clone();
        cfg
    }

    pub(crate) fn method_map(&self) -> GridConfig {
        let mut cfg = GridConfig::new("methods", self.rows, self.cols, 1);
        cfg.delta_timestep = TimestepDelta::Varies;
        cfg.raster_metadata = self.raster_metadata.clone();
        cfg
    }
}

/// Descriptor paths of persisted output grids.
#[derive(Debug, Clone)]
pub struct OutputPaths {
    pub tdd: PathBuf,
    pub fdd: PathBuf,
    pub roots: PathBuf,
    /// Where the method map is persisted; `None` keeps it in memory.
    pub method_map: Option<PathBuf>,
}

/// Every grid a run writes into.
#[derive(Debug)]
pub struct DegreeDayOutputs {
    pub tdd: TemporalGrid,
    pub fdd: TemporalGrid,
    pub roots: TemporalGrid,
    /// Single-timestep grid of [`Method::code`] values; NaN where no input.
    pub method_map: TemporalGrid,
}

impl DegreeDayOutputs {
    /// NaN-filled in-memory outputs.
    pub fn in_memory(layout: &OutputLayout) -> Result<Self> {
        Ok(Self {
            tdd: TemporalGrid::new(layout.annual("tdd"), f32::NAN)?,
            fdd: TemporalGrid::new(layout.annual("fdd"), f32::NAN)?,
            roots: TemporalGrid::new(layout.roots(), f32::NAN)?,
            method_map: TemporalGrid::new(layout.method_map(), f32::NAN)?,
        })
    }

    /// Memory-mapped outputs, reopened when their descriptors already exist
    /// so an interrupted run can resume. Returns whether any grid was new.
    pub fn create_or_open(layout: &OutputLayout, paths: &OutputPaths) -> Result<(Self, bool)> {
        let (tdd, new_tdd) = TemporalGrid::create_or_open(&paths.tdd, layout.annual("tdd"))?;
        let (fdd, new_fdd) = TemporalGrid::create_or_open(&paths.fdd, layout.annual("fdd"))?;
        let (roots, new_roots) = TemporalGrid::create_or_open(&paths.roots, layout.roots())?;
        let method_map = match &paths.method_map {
            Some(path) => TemporalGrid::create_or_open(path, layout.method_map())?.0,
            None => TemporalGrid::new(layout.method_map(), f32::NAN)?,
        };
        let outputs = Self { tdd, fdd, roots, method_map };
        outputs.check_shapes()?;
        Ok((outputs, new_tdd || new_fdd || new_roots))
    }

    fn check_shapes(&self) -> Result<()> {
        let (years, rows, cols) = self.tdd.config().shape();
        let check = |grid: &TemporalGrid, what: &str, t: usize| -> Result<()> {
            let found = grid.config().shape();
            if found != (t, rows, cols) {
                return Err(DdcError::ShapeMismatch { what: what.to_string(), expected: (t, rows, cols), found });
            }
            Ok(())
        };
        check(&self.fdd, "fdd", years)?;
        check(&self.roots, "roots", 2 * years)?;
        check(&self.method_map, "method map", 1)
    }

    pub fn num_years(&self) -> usize {
        self.tdd.num_timesteps()
    }

    /// Write one cell's result into every grid.
    pub fn write_cell(&mut self, index: usize, extraction: &Extraction) {
        match &extraction.outcome {
            CellOutcome::Missing => {
                self.tdd.fill_cell(index, f32::NAN);
                self.fdd.fill_cell(index, f32::NAN);
                self.roots.fill_cell(index, f32::NAN);
                self.method_map.fill_cell(index, f32::NAN);
            }
            CellOutcome::Solved { series, method } => {
                self.tdd.set_cell_series(index, &to_f32(&series.tdd));
                self.fdd.set_cell_series(index, &to_f32(&series.fdd));
                self.roots.set_cell_series(index, &to_f32(&series.roots));
                self.method_map.fill_cell(index, method.code());
            }
            CellOutcome::Exhausted => {
                self.tdd.fill_cell(index, f32::NEG_INFINITY);
                self.fdd.fill_cell(index, f32::NEG_INFINITY);
                self.roots.fill_cell(index, f32::NEG_INFINITY);
                self.method_map.fill_cell(index, Method::Range.code());
            }
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.tdd.flush()?;
        self.fdd.flush()?;
        self.roots.flush()?;
        self.method_map.flush()
    }
}

fn to_f32(values: &[f64]) -> Vec<f32> {
    values.iter().map(|&v| v as f32).collect()
}

// ── Run report ────────────────────────────────────────────────────────────────

/// A spline error raised for one cell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplineErrorEntry {
    pub index: usize,
    pub row: usize,
    pub col: usize,
    pub message: String,
}

impl fmt::Display for SplineErrorEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (row {}, col {})", self.message, self.row, self.col)
    }
}

/// Outcome counts of one orchestrator run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub dispatched: usize,
    pub spline: usize,
    pub range: usize,
    pub exhausted: usize,
    pub missing: usize,
    /// Sorted by cell index once the run completes.
    pub spline_errors: Vec<SplineErrorEntry>,
}

impl RunReport {
    pub(crate) fn record(&mut self, index: usize, cols: usize, extraction: &Extraction) {
        let (row, col) = (index / cols, index % cols);
        match &extraction.outcome {
            CellOutcome::Missing => self.missing += 1,
            CellOutcome::Solved { method: Method::Spline, .. } => self.spline += 1,
            CellOutcome::Solved { method: Method::Range, .. } => self.range += 1,
            CellOutcome::Exhausted => self.exhausted += 1,
        }
        debug!(index, row, col, outcome = ?extraction.method(), "cell written");

        if let Some(err) = &extraction.spline_error {
            let message = match err {
                RootSearchError::RootMismatch { .. } => format!("expected root mismatch at element {index}"),
                RootSearchError::Fit(e) => format!("spline fit failed at element {index}: {e}"),
            };
            warn!(index, row, col, error = %err, "spline error");
            self.spline_errors.push(SplineErrorEntry { index, row, col, message });
        }
    }

    pub(crate) fn finish(&mut self) {
        self.spline_errors.sort_by_key(|e| e.index);
    }

    /// Cells written during the run.
    pub fn completed(&self) -> usize {
        self.spline + self.range + self.exhausted + self.missing
    }
}
