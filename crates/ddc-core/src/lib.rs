//! Thawing and freezing degree-day extraction from monthly temperature grids.
//!
//! Each grid cell's monthly series is fitted with a smoothing spline; the
//! spline's zero crossings split the record into thaw and freeze seasons whose
//! integrals are the annual TDD and FDD totals. Cells the spline method cannot
//! resolve fall back to fixed half-year windows, and cells neither method can
//! resolve are marked with −inf for a later neighbourhood-mean fill.

pub mod aggregate;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod extract;
pub mod fill;
pub mod grid;
pub mod mask;
pub mod orchestrator;
pub mod raster;
pub mod roots;
pub mod spline;

pub use aggregate::{DegreeDayOutputs, OutputLayout, OutputPaths, RunReport};
pub use config::DegreeDayConfig;
pub use error::{DdcError, Result};
pub use extract::{extract_cell, CellOutcome, DegreeDays, ExtractOptions, Method};
pub use fill::{fill_by_interpolation, fill_outputs, FillOptions, FillReport};
pub use grid::{GridConfig, TemporalGrid, TimestepDelta};
pub use orchestrator::{calc_grid_degree_days, select_cells, CalcOptions};
pub use spline::SmoothingSpline;
