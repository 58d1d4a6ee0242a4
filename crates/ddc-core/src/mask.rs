//! Boolean cell masks over a grid's spatial plane.
//!
//! Masks are flattened row-major `Vec<bool>`s with one entry per cell.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DdcError, Result};
use crate::grid::TemporalGrid;
use crate::raster::Raster;

/// Comparator applied against a no-data value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskComparison {
    #[default]
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
}

impl MaskComparison {
    pub fn matches(self, value: f32, threshold: f32) -> bool {
        match self {
            Self::Eq => value == threshold,
            Self::Ne => value != threshold,
            Self::Lt => value < threshold,
            Self::Gt => value > threshold,
            Self::Lte => value <= threshold,
            Self::Gte => value >= threshold,
        }
    }
}

impl FromStr for MaskComparison {
    type Err = DdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "eq" => Ok(Self::Eq),
            "ne" => Ok(Self::Ne),
            "lt" => Ok(Self::Lt),
            "gt" => Ok(Self::Gt),
            "lte" => Ok(Self::Lte),
            "gte" => Ok(Self::Gte),
            other => Err(DdcError::Setup(format!("unknown mask comparator '{other}'"))),
        }
    }
}

impl fmt::Display for MaskComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Gt => "gt",
            Self::Lte => "lte",
            Self::Gte => "gte",
        };
        f.write_str(s)
    }
}

/// Set every timestep of cells whose first-timestep value matches
/// `threshold` under `comparison` to NaN. Returns the number of cells masked.
pub fn apply_nodata_mask(grid: &mut TemporalGrid, threshold: f32, comparison: MaskComparison) -> usize {
    let masked: Vec<usize> = grid
        .plane(0)
        .iter()
        .enumerate()
        .filter(|(_, v)| comparison.matches(**v, threshold))
        .map(|(i, _)| i)
        .collect();
    for &i in &masked {
        grid.fill_cell(i, f32::NAN);
    }
    masked.len()
}

fn check_plane(raster: &Raster, rows: usize, cols: usize, what: &str) -> Result<()> {
    if (raster.rows, raster.cols) != (rows, cols) {
        return Err(DdcError::ShapeMismatch {
            what: what.to_string(),
            expected: (1, rows, cols),
            found: (1, raster.rows, raster.cols),
        });
    }
    Ok(())
}

/// Cells to recompute: raster value exactly 1.
pub fn recalc_mask(raster: &Raster, rows: usize, cols: usize) -> Result<Vec<bool>> {
    check_plane(raster, rows, cols, "recalculation mask")?;
    Ok(raster.data.iter().map(|&v| v == 1.0).collect())
}

/// Cells inside a valid-area raster: any non-NaN value whose integer part
/// is non-zero.
pub fn valid_area(raster: &Raster, rows: usize, cols: usize) -> Result<Vec<bool>> {
    check_plane(raster, rows, cols, "valid area")?;
    Ok(raster.data.iter().map(|&v| !v.is_nan() && v.trunc() != 0.0).collect())
}

/// Cells whose first timestep holds the −inf failure sentinel.
pub fn sentinel_mask(grid: &TemporalGrid) -> Vec<bool> {
    grid.plane(0).iter().map(|&v| v == f32::NEG_INFINITY).collect()
}

/// How a valid-area raster selects cells to fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AreaType {
    /// Valid-area cells with no usable value (NaN or −inf).
    #[default]
    Aoi,
    /// Every valid-area cell.
    Exact,
}

impl FromStr for AreaType {
    type Err = DdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "aoi" => Ok(Self::Aoi),
            "exact" => Ok(Self::Exact),
            other => Err(DdcError::Setup(format!("unknown area type '{other}'"))),
        }
    }
}

pub fn area_mask(grid: &TemporalGrid, valid: &[bool], area_type: AreaType) -> Result<Vec<bool>> {
    if valid.len() != grid.num_cells() {
        return Err(DdcError::ShapeMismatch {
            what: "valid area".to_string(),
            expected: (1, grid.rows(), grid.cols()),
            found: (1, 1, valid.len()),
        });
    }
    Ok(match area_type {
        AreaType::Exact => valid.to_vec(),
        AreaType::Aoi => grid
            .plane(0)
            .iter()
            .zip(valid)
            .map(|(&v, &ok)| ok && (v.is_nan() || v == f32::NEG_INFINITY))
            .collect(),
    })
}
