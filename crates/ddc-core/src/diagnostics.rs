//! Diagnostic rasters written to the logging directory.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{DdcError, Result};
use crate::grid::TemporalGrid;
use crate::raster::{self, RasterMetadata};

pub const METHOD_MAP_DESCRIPTOR: &str = "methodmap.json";
pub const METHODS_RASTER: &str = "methods.tif";
pub const METHODS_README: &str = "methods.readme.txt";
pub const INTERPOLATED_RASTER: &str = "interpolated.tif";

const METHODS_LEGEND: &str = "NaN -> no input data\n1 -> spline method\n2 -> range method\n";

/// Descriptor of the persisted method map inside `logging_dir`.
pub fn method_map_path(logging_dir: &Path) -> PathBuf {
    logging_dir.join(METHOD_MAP_DESCRIPTOR)
}

/// Export the method map as `methods.tif` with a legend next to it.
pub fn write_method_map(logging_dir: &Path, method_map: &TemporalGrid) -> Result<()> {
    fs::create_dir_all(logging_dir).map_err(|e| DdcError::io_at(logging_dir, e))?;
    let tif = logging_dir.join(METHODS_RASTER);
    raster::save_raster(
        &tif,
        method_map.plane(0),
        method_map.rows(),
        method_map.cols(),
        &method_map.config().raster_metadata,
    )?;
    let readme = logging_dir.join(METHODS_README);
    fs::write(&readme, METHODS_LEGEND).map_err(|e| DdcError::io_at(&readme, e))?;
    info!(path = %tif.display(), "method map written");
    Ok(())
}

/// Write `interpolated.tif`: 1 at every filled cell, 0 elsewhere.
pub fn write_interpolated(
    logging_dir: &Path,
    rows: usize,
    cols: usize,
    filled: &[usize],
    metadata: &RasterMetadata,
) -> Result<PathBuf> {
    fs::create_dir_all(logging_dir).map_err(|e| DdcError::io_at(logging_dir, e))?;
    let mut plane = vec![0.0f32; rows * cols];
    for &i in filled {
        if let Some(v) = plane.get_mut(i) {
            *v = 1.0;
        }
    }
    let path = logging_dir.join(INTERPOLATED_RASTER);
    raster::save_raster(&path, &plane, rows, cols, metadata)?;
    info!(path = %path.display(), cells = filled.len(), "interpolation map written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridConfig;

    #[test]
    fn method_map_export_writes_raster_and_legend() {
        let dir = tempfile::tempdir().unwrap();
        let grid = TemporalGrid::from_data(GridConfig::new("methods", 1, 3, 1), vec![1.0, 2.0, f32::NAN]).unwrap();
        write_method_map(dir.path(), &grid).unwrap();

        let r = raster::load_raster(&dir.path().join(METHODS_RASTER)).unwrap();
        assert_eq!(&r.data[..2], &[1.0, 2.0]);
        assert!(r.data[2].is_nan());
        let legend = fs::read_to_string(dir.path().join(METHODS_README)).unwrap();
        assert!(legend.contains("2 -> range method"));
    }

    #[test]
    fn interpolated_marks_filled_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_interpolated(dir.path(), 2, 2, &[1, 2], &RasterMetadata::default()).unwrap();
        let r = raster::load_raster(&path).unwrap();
        assert_eq!(r.data, vec![0.0, 1.0, 1.0, 0.0]);
    }
}
