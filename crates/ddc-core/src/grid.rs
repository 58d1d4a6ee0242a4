//! Time-indexed raster container.
//!
//! A `TemporalGrid` stores `num_timesteps` planes of `rows × cols` f32
//! values, timestep-major (`[t][row][col]`). Storage is either an in-memory
//! `Vec<f32>` or a read-write memory-mapped payload file, so output grids are
//! persisted cell by cell as they are written and an interrupted run can be
//! resumed.
//!
//! On disk a grid is two files: a JSON descriptor (`name.json`) holding the
//! [`GridConfig`], and a raw native-endian f32 payload (`name.data`).

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{Datelike, Months, NaiveDate};
use memmap2::{MmapMut, MmapOptions};
use serde::{Deserialize, Serialize};

use crate::error::{DdcError, Result};
use crate::raster::{self, RasterMetadata};

const F32_BYTES: usize = std::mem::size_of::<f32>();

// ── Configuration ─────────────────────────────────────────────────────────────

/// Spacing between consecutive timesteps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestepDelta {
    Monthly,
    Yearly,
    /// Timesteps are not evenly spaced in time (e.g. the roots grid).
    Varies,
}

/// Key-value configuration attached to a grid and persisted in its descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridConfig {
    pub dataset_name: String,
    pub rows: usize,
    pub cols: usize,
    pub num_timesteps: usize,
    /// Label of timestep 0: a year for annual grids, 0 for index-based grids.
    pub start_timestep: i64,
    pub delta_timestep: TimestepDelta,
    /// Calendar date of timestep 0 for monthly grids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub raster_metadata: RasterMetadata,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl GridConfig {
    pub fn new(dataset_name: impl Into<String>, rows: usize, cols: usize, num_timesteps: usize) -> Self {
        Self {
            dataset_name: dataset_name.into(),
            rows,
            cols,
            num_timesteps,
            start_timestep: 0,
            delta_timestep: TimestepDelta::Yearly,
            start_date: None,
            raster_metadata: RasterMetadata::default(),
            attributes: BTreeMap::new(),
        }
    }

    /// `(timesteps, rows, cols)`.
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.num_timesteps, self.rows, self.cols)
    }

    pub fn cells_per_plane(&self) -> usize {
        self.rows * self.cols
    }

    fn total_len(&self) -> usize {
        self.num_timesteps * self.rows * self.cols
    }

    fn validate(&self) -> Result<()> {
        if self.rows == 0 || self.cols == 0 || self.num_timesteps == 0 {
            return Err(DdcError::InvalidGrid(format!(
                "{}: dimensions must be non-zero, got {:?}",
                self.dataset_name,
                self.shape()
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct Descriptor {
    config: GridConfig,
    /// Payload file name, relative to the descriptor's directory.
    payload: String,
}

/// Payload path paired with a descriptor path (`x/tdd.json` → `x/tdd.data`).
pub fn payload_path_for(descriptor: &Path) -> PathBuf {
    descriptor.with_extension("data")
}

// ── Storage ───────────────────────────────────────────────────────────────────

enum Storage {
    Memory(Vec<f32>),
    Mapped { map: MmapMut, path: PathBuf },
}

impl Storage {
    fn as_slice(&self) -> &[f32] {
        match self {
            Storage::Memory(v) => v,
            Storage::Mapped { map, .. } => bytemuck::cast_slice(&map[..]),
        }
    }

    fn as_mut_slice(&mut self) -> &mut [f32] {
        match self {
            Storage::Memory(v) => v,
            Storage::Mapped { map, .. } => bytemuck::cast_slice_mut(&mut map[..]),
        }
    }
}

fn map_payload(file: &File, path: &Path, expected_len: usize) -> Result<MmapMut> {
    // SAFETY: the payload file is owned by this process for the lifetime of
    // the grid; concurrent external modification is not supported.
    let map = unsafe { MmapOptions::new().len(expected_len * F32_BYTES).map_mut(file) }
        .map_err(|e| DdcError::io_at(path, e))?;
    bytemuck::try_cast_slice::<u8, f32>(&map[..]).map_err(|e| {
        DdcError::InvalidGrid(format!("{}: payload not castable to f32: {e:?}", path.display()))
    })?;
    Ok(map)
}

// ── TemporalGrid ──────────────────────────────────────────────────────────────

pub struct TemporalGrid {
    config: GridConfig,
    storage: Storage,
}

impl std::fmt::Debug for TemporalGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backing = match &self.storage {
            Storage::Memory(_) => "memory".to_string(),
            Storage::Mapped { path, .. } => path.display().to_string(),
        };
        f.debug_struct("TemporalGrid")
            .field("config", &self.config)
            .field("backing", &backing)
            .finish()
    }
}

impl TemporalGrid {
    /// In-memory grid with every value set to `fill`.
    pub fn new(config: GridConfig, fill: f32) -> Result<Self> {
        config.validate()?;
        let data = vec![fill; config.total_len()];
        Ok(Self { config, storage: Storage::Memory(data) })
    }

    /// In-memory grid over existing timestep-major data.
    pub fn from_data(config: GridConfig, data: Vec<f32>) -> Result<Self> {
        config.validate()?;
        if data.len() != config.total_len() {
            return Err(DdcError::InvalidGrid(format!(
                "{}: {} values supplied for shape {:?}",
                config.dataset_name,
                data.len(),
                config.shape()
            )));
        }
        Ok(Self { config, storage: Storage::Memory(data) })
    }

    /// Grid backed by a freshly created payload file, filled with `fill`.
    pub fn create_mapped(config: GridConfig, payload: &Path, fill: f32) -> Result<Self> {
        config.validate()?;
        if let Some(parent) = payload.parent() {
            fs::create_dir_all(parent).map_err(|e| DdcError::io_at(parent, e))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(payload)
            .map_err(|e| DdcError::io_at(payload, e))?;
        file.set_len((config.total_len() * F32_BYTES) as u64)
            .map_err(|e| DdcError::io_at(payload, e))?;
        let map = map_payload(&file, payload, config.total_len())?;
        let mut grid = Self {
            config,
            storage: Storage::Mapped { map, path: payload.to_path_buf() },
        };
        grid.data_mut().fill(fill);
        Ok(grid)
    }

    fn read_descriptor(descriptor: &Path) -> Result<(GridConfig, PathBuf)> {
        let text = fs::read_to_string(descriptor).map_err(|e| DdcError::io_at(descriptor, e))?;
        let desc: Descriptor = serde_json::from_str(&text).map_err(|source| DdcError::Descriptor {
            path: descriptor.to_path_buf(),
            source,
        })?;
        desc.config.validate()?;
        let dir = descriptor.parent().unwrap_or_else(|| Path::new("."));
        Ok((desc.config, dir.join(desc.payload)))
    }

    /// Open a saved grid with its payload mapped read-write.
    pub fn open(descriptor: &Path) -> Result<Self> {
        let (config, payload) = Self::read_descriptor(descriptor)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&payload)
            .map_err(|e| DdcError::io_at(&payload, e))?;
        let found = file.metadata().map_err(|e| DdcError::io_at(&payload, e))?.len() as usize;
        let expected = config.total_len() * F32_BYTES;
        if found != expected {
            return Err(DdcError::PayloadLength { path: payload, expected, found });
        }
        let map = map_payload(&file, &payload, config.total_len())?;
        Ok(Self { config, storage: Storage::Mapped { map, path: payload } })
    }

    /// Read a saved grid fully into memory.
    pub fn load(descriptor: &Path) -> Result<Self> {
        let (config, payload) = Self::read_descriptor(descriptor)?;
        let bytes = fs::read(&payload).map_err(|e| DdcError::io_at(&payload, e))?;
        let expected = config.total_len() * F32_BYTES;
        if bytes.len() != expected {
            return Err(DdcError::PayloadLength { path: payload, expected, found: bytes.len() });
        }
        let data = bytes
            .chunks_exact(F32_BYTES)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Self::from_data(config, data)
    }

    /// Open the grid at `descriptor` if it exists, otherwise create it filled
    /// with NaN. Returns the grid and whether it was newly created.
    ///
    /// An existing grid must match the requested shape.
    pub fn create_or_open(descriptor: &Path, config: GridConfig) -> Result<(Self, bool)> {
        if descriptor.exists() {
            let grid = Self::open(descriptor)?;
            if grid.config.shape() != config.shape() {
                return Err(DdcError::ShapeMismatch {
                    what: descriptor.display().to_string(),
                    expected: config.shape(),
                    found: grid.config.shape(),
                });
            }
            return Ok((grid, false));
        }
        let grid = Self::create_mapped(config, &payload_path_for(descriptor), f32::NAN)?;
        grid.save(descriptor)?;
        Ok((grid, true))
    }

    /// Write the descriptor and make sure the payload at
    /// [`payload_path_for`]`(descriptor)` is current.
    pub fn save(&self, descriptor: &Path) -> Result<()> {
        if let Some(parent) = descriptor.parent() {
            fs::create_dir_all(parent).map_err(|e| DdcError::io_at(parent, e))?;
        }
        let payload = payload_path_for(descriptor);
        match &self.storage {
            Storage::Mapped { map, path } if *path == payload => {
                map.flush().map_err(|e| DdcError::io_at(path, e))?;
            }
            _ => {
                let bytes: &[u8] = bytemuck::cast_slice(self.data());
                fs::write(&payload, bytes).map_err(|e| DdcError::io_at(&payload, e))?;
            }
        }
        let desc = Descriptor {
            config: self.config.clone(),
            payload: payload
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let text = serde_json::to_string_pretty(&desc).map_err(|source| DdcError::Descriptor {
            path: descriptor.to_path_buf(),
            source,
        })?;
        fs::write(descriptor, text).map_err(|e| DdcError::io_at(descriptor, e))
    }

    /// Flush a mapped payload to disk. No-op for in-memory grids.
    pub fn flush(&self) -> Result<()> {
        if let Storage::Mapped { map, path } = &self.storage {
            map.flush().map_err(|e| DdcError::io_at(path, e))?;
        }
        Ok(())
    }

    /// Delete the descriptor and payload files of a saved grid.
    pub fn remove_files(descriptor: &Path) -> Result<()> {
        let payload = payload_path_for(descriptor);
        for path in [descriptor, payload.as_path()] {
            if path.exists() {
                fs::remove_file(path).map_err(|e| DdcError::io_at(path, e))?;
            }
        }
        Ok(())
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn set_raster_metadata(&mut self, metadata: RasterMetadata) {
        self.config.raster_metadata = metadata;
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.config.attributes.insert(key.into(), value.into());
    }

    pub fn set_start(&mut self, start_timestep: i64, delta: TimestepDelta, start_date: Option<NaiveDate>) {
        self.config.start_timestep = start_timestep;
        self.config.delta_timestep = delta;
        self.config.start_date = start_date;
    }

    pub fn rows(&self) -> usize {
        self.config.rows
    }

    pub fn cols(&self) -> usize {
        self.config.cols
    }

    pub fn num_timesteps(&self) -> usize {
        self.config.num_timesteps
    }

    pub fn num_cells(&self) -> usize {
        self.config.cells_per_plane()
    }

    pub fn data(&self) -> &[f32] {
        self.storage.as_slice()
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        self.storage.as_mut_slice()
    }

    /// The 2D plane of timestep `t`, row-major.
    pub fn plane(&self, t: usize) -> &[f32] {
        let n = self.num_cells();
        &self.data()[t * n..(t + 1) * n]
    }

    pub fn plane_mut(&mut self, t: usize) -> &mut [f32] {
        let n = self.num_cells();
        &mut self.data_mut()[t * n..(t + 1) * n]
    }

    pub fn set_plane(&mut self, t: usize, values: &[f32]) {
        self.plane_mut(t).copy_from_slice(values);
    }

    #[inline]
    pub fn get(&self, t: usize, row: usize, col: usize) -> f32 {
        self.data()[(t * self.config.rows + row) * self.config.cols + col]
    }

    #[inline]
    pub fn set(&mut self, t: usize, row: usize, col: usize, val: f32) {
        let i = (t * self.config.rows + row) * self.config.cols + col;
        self.data_mut()[i] = val;
    }

    /// Flattened spatial index of `(row, col)`.
    #[inline]
    pub fn cell_index(&self, row: usize, col: usize) -> usize {
        row * self.config.cols + col
    }

    /// `(row, col)` of a flattened spatial index.
    #[inline]
    pub fn row_col(&self, index: usize) -> (usize, usize) {
        (index / self.config.cols, index % self.config.cols)
    }

    /// Every timestep's value at one flattened cell.
    pub fn cell_series(&self, index: usize) -> Vec<f32> {
        let n = self.num_cells();
        let data = self.data();
        (0..self.config.num_timesteps).map(|t| data[t * n + index]).collect()
    }

    /// Overwrite one cell across all timesteps. `values` must have
    /// `num_timesteps` entries.
    pub fn set_cell_series(&mut self, index: usize, values: &[f32]) {
        debug_assert_eq!(values.len(), self.config.num_timesteps);
        let n = self.num_cells();
        let data = self.data_mut();
        for (t, &v) in values.iter().enumerate() {
            data[t * n + index] = v;
        }
    }

    pub fn fill_cell(&mut self, index: usize, val: f32) {
        let n = self.num_cells();
        let steps = self.config.num_timesteps;
        let data = self.data_mut();
        for t in 0..steps {
            data[t * n + index] = val;
        }
    }

    /// Human-readable label of timestep `t`, used in exported file names.
    pub fn timestep_label(&self, t: usize) -> String {
        match (self.config.delta_timestep, self.config.start_date) {
            (TimestepDelta::Monthly, Some(date)) => {
                let d = date.checked_add_months(Months::new(t as u32)).unwrap_or(date);
                format!("{}-{:02}", d.year(), d.month())
            }
            (TimestepDelta::Yearly, _) => (self.config.start_timestep + t as i64).to_string(),
            _ => format!("{t:04}"),
        }
    }

    /// Export one single-band GeoTIFF per timestep into `dir`, named
    /// `{prefix}_{label}.tif`. Returns the written paths.
    pub fn save_all_as_geotiff(&self, dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir).map_err(|e| DdcError::io_at(dir, e))?;
        let mut written = Vec::with_capacity(self.config.num_timesteps);
        for t in 0..self.config.num_timesteps {
            let path = dir.join(format!("{prefix}_{}.tif", self.timestep_label(t)));
            raster::save_raster(
                &path,
                self.plane(t),
                self.config.rows,
                self.config.cols,
                &self.config.raster_metadata,
            )?;
            written.push(path);
        }
        Ok(written)
    }
}
