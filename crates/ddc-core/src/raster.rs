//! Single-band GeoTIFF read/write and monthly raster stacking.
//!
//! Georeferencing is carried through untouched: the GeoTIFF tags of the first
//! input raster are stored in each grid's [`RasterMetadata`] and written back
//! onto every exported raster.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{Months, NaiveDate};
use serde::{Deserialize, Serialize};
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;
use tracing::{debug, warn};

use crate::error::{DdcError, Result};
use crate::grid::{GridConfig, TemporalGrid, TimestepDelta};

/// GeoTIFF georeference tags, kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RasterMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_scale: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiepoint: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transformation: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_key_directory: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_double_params: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_ascii_params: Option<String>,
    /// GDAL no-data value as written in the source file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodata: Option<String>,
}

/// One decoded raster band, row-major.
#[derive(Debug, Clone)]
pub struct Raster {
    pub data: Vec<f32>,
    pub rows: usize,
    pub cols: usize,
    pub metadata: RasterMetadata,
}

impl Raster {
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols + col]
    }
}

// ── Reading ───────────────────────────────────────────────────────────────────

fn read_metadata<R: std::io::Read + std::io::Seek>(
    decoder: &mut Decoder<R>,
    path: &Path,
) -> Result<RasterMetadata> {
    let tiff_err = |e| DdcError::tiff(path, e);
    let f64_tag = |d: &mut Decoder<R>, tag: Tag| -> Result<Option<Vec<f64>>> {
        d.find_tag(tag)
            .map_err(tiff_err)?
            .map(|v| v.into_f64_vec())
            .transpose()
            .map_err(tiff_err)
    };

    let pixel_scale = f64_tag(decoder, Tag::ModelPixelScaleTag)?;
    let tiepoint = f64_tag(decoder, Tag::ModelTiepointTag)?;
    let transformation = f64_tag(decoder, Tag::ModelTransformationTag)?;
    let geo_double_params = f64_tag(decoder, Tag::GeoDoubleParamsTag)?;
    let geo_key_directory = decoder
        .find_tag(Tag::GeoKeyDirectoryTag)
        .map_err(tiff_err)?
        .map(|v| v.into_u16_vec())
        .transpose()
        .map_err(tiff_err)?;
    let geo_ascii_params = decoder
        .find_tag(Tag::GeoAsciiParamsTag)
        .map_err(tiff_err)?
        .map(|v| v.into_string())
        .transpose()
        .map_err(tiff_err)?;
    let nodata = decoder
        .find_tag(Tag::GdalNodata)
        .map_err(tiff_err)?
        .map(|v| v.into_string())
        .transpose()
        .map_err(tiff_err)?
        .map(|s| s.trim_end_matches('\0').trim().to_string());

    Ok(RasterMetadata {
        pixel_scale,
        tiepoint,
        transformation,
        geo_key_directory,
        geo_double_params,
        geo_ascii_params,
        nodata,
    })
}

/// Load the first band of a TIFF as f32, with its georeference metadata.
pub fn load_raster(path: &Path) -> Result<Raster> {
    let file = File::open(path).map_err(|e| DdcError::io_at(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .map_err(|e| DdcError::tiff(path, e))?
        .with_limits(Limits::unlimited());
    let (width, height) = decoder.dimensions().map_err(|e| DdcError::tiff(path, e))?;
    let metadata = read_metadata(&mut decoder, path)?;

    let data: Vec<f32> = match decoder.read_image().map_err(|e| DdcError::tiff(path, e))? {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(_) | DecodingResult::I64(_) => {
            return Err(DdcError::UnsupportedRaster {
                path: path.to_path_buf(),
                format: "64-bit integer samples".to_string(),
            })
        }
    };

    let (rows, cols) = (height as usize, width as usize);
    if data.len() != rows * cols {
        // Multi-band files decode interleaved; only single-band input is supported.
        return Err(DdcError::UnsupportedRaster {
            path: path.to_path_buf(),
            format: format!("{} samples for {rows}×{cols} pixels", data.len()),
        });
    }
    Ok(Raster { data, rows, cols, metadata })
}

// ── Writing ───────────────────────────────────────────────────────────────────

/// Write a single-band f32 GeoTIFF.
pub fn save_raster(
    path: &Path,
    data: &[f32],
    rows: usize,
    cols: usize,
    metadata: &RasterMetadata,
) -> Result<()> {
    let tiff_err = |e| DdcError::tiff(path, e);
    let file = File::create(path).map_err(|e| DdcError::io_at(path, e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(tiff_err)?;
    let mut image = encoder
        .new_image::<colortype::Gray32Float>(cols as u32, rows as u32)
        .map_err(tiff_err)?;

    let dir = image.encoder();
    if let Some(v) = &metadata.pixel_scale {
        dir.write_tag(Tag::ModelPixelScaleTag, &v[..]).map_err(tiff_err)?;
    }
    if let Some(v) = &metadata.tiepoint {
        dir.write_tag(Tag::ModelTiepointTag, &v[..]).map_err(tiff_err)?;
    }
    if let Some(v) = &metadata.transformation {
        dir.write_tag(Tag::ModelTransformationTag, &v[..]).map_err(tiff_err)?;
    }
    if let Some(v) = &metadata.geo_key_directory {
        dir.write_tag(Tag::GeoKeyDirectoryTag, &v[..]).map_err(tiff_err)?;
    }
    if let Some(v) = &metadata.geo_double_params {
        dir.write_tag(Tag::GeoDoubleParamsTag, &v[..]).map_err(tiff_err)?;
    }
    if let Some(s) = &metadata.geo_ascii_params {
        dir.write_tag(Tag::GeoAsciiParamsTag, s.as_str()).map_err(tiff_err)?;
    }
    if let Some(s) = &metadata.nodata {
        dir.write_tag(Tag::GdalNodata, s.as_str()).map_err(tiff_err)?;
    }

    image.write_data(data).map_err(tiff_err)
}

// ── File ordering ─────────────────────────────────────────────────────────────

/// How a directory of monthly rasters is put into chronological order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMethod {
    /// Lexicographic file-name order.
    #[default]
    Default,
    /// SNAP naming (`..._MM_YYYY.tif`): year, then month.
    Snap,
}

fn file_name(path: &Path) -> String {
    path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Year encoded in the last four characters of the file stem.
fn trailing_year(path: &Path) -> Option<i32> {
    let stem = path.file_stem()?.to_str()?;
    let tail = stem.get(stem.len().checked_sub(4)?..)?;
    tail.parse().ok()
}

/// Order files chronologically. SNAP ordering starts from the year of the
/// lexicographically first file and stops at the first year with no files;
/// unmatched files are dropped with a warning.
pub fn sort_files(mut files: Vec<PathBuf>, method: SortMethod) -> Vec<PathBuf> {
    files.sort();
    if method == SortMethod::Default {
        return files;
    }

    let Some(mut year) = files.first().and_then(|f| trailing_year(f)) else {
        warn!("cannot read a year from {:?}; keeping lexicographic order", files.first());
        return files;
    };
    let names: Vec<String> = files.iter().map(|f| file_name(f)).collect();
    let mut used = vec![false; files.len()];
    let mut ordered = Vec::with_capacity(files.len());

    while ordered.len() < files.len() {
        let before = ordered.len();
        for month in 1..=12 {
            let key = format!("{month:02}_{year}");
            if let Some(i) = (0..files.len()).find(|&i| !used[i] && names[i].contains(&key)) {
                used[i] = true;
                ordered.push(files[i].clone());
            }
        }
        if ordered.len() == before {
            break;
        }
        year += 1;
    }

    for (i, f) in files.iter().enumerate() {
        if !used[i] {
            warn!("{} does not fit the SNAP month sequence; skipped", f.display());
        }
    }
    ordered
}

// ── Stacking ──────────────────────────────────────────────────────────────────

/// Build an in-memory monthly grid from chronologically ordered rasters.
///
/// All rasters must share the first raster's dimensions; its georeference
/// metadata is attached to the grid.
pub fn load_and_create(files: &[PathBuf], start_date: NaiveDate, dataset_name: &str) -> Result<TemporalGrid> {
    let Some(first) = files.first() else {
        return Err(DdcError::Setup(format!("no rasters supplied for {dataset_name}")));
    };
    let head = load_raster(first)?;
    let (rows, cols) = (head.rows, head.cols);

    let mut config = GridConfig::new(dataset_name, rows, cols, files.len());
    config.delta_timestep = TimestepDelta::Monthly;
    config.start_date = Some(start_date);
    config.raster_metadata = head.metadata.clone();

    let mut data = Vec::with_capacity(files.len() * rows * cols);
    data.extend_from_slice(&head.data);
    for path in &files[1..] {
        debug!(file = %path.display(), "loading raster");
        let r = load_raster(path)?;
        if (r.rows, r.cols) != (rows, cols) {
            return Err(DdcError::ShapeMismatch {
                what: path.display().to_string(),
                expected: (1, rows, cols),
                found: (1, r.rows, r.cols),
            });
        }
        data.extend_from_slice(&r.data);
    }
    TemporalGrid::from_data(config, data)
}

/// Day offsets of `count` consecutive months, counted from `start`.
///
/// The first offset is 0; each later one is the number of calendar days from
/// `start` to the same day-of-month `m` months later.
pub fn monthly_day_offsets(start: NaiveDate, count: usize) -> Vec<f64> {
    (0..count as u32)
        .map_while(|m| start.checked_add_months(Months::new(m)))
        .map(|d| (d - start).num_days() as f64)
        .collect()
}
