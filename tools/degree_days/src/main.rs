/// Degree-day calculator: turns a stack of monthly temperature rasters into
/// annual thawing (TDD) and freezing (FDD) degree-day grids.
///
/// Two modes:
///   default        compute TDD, FDD and season-transition roots for every cell
///   --fill-holes   repair cells of existing outputs by neighbourhood mean
///
/// Outputs are memory-mapped grids (`tdd.json`, `fdd.json`, `roots.json` in
/// their output directories), so an interrupted run resumes with `--start-at`
/// or `--recalc-mask-file`. Exit codes: 0 success, 2 setup error, 1 otherwise.
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{Datelike, NaiveDate};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ddc_core::aggregate::{DegreeDayOutputs, OutputLayout, OutputPaths};
use ddc_core::config::DegreeDayConfig;
use ddc_core::error::DdcError;
use ddc_core::extract::MONTHS_PER_YEAR;
use ddc_core::grid::TemporalGrid;
use ddc_core::mask::{self, AreaType, MaskComparison};
use ddc_core::raster::{self, SortMethod};
use ddc_core::{diagnostics, fill, orchestrator};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(ValueEnum, Clone, Copy, Debug)]
enum SortArg {
    Default,
    Snap,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CompArg {
    Eq,
    Ne,
    Lt,
    Gt,
    Lte,
    Gte,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutFormat {
    /// One GeoTIFF per timestep; grid files are removed afterwards
    Tiff,
    /// Keep the grid descriptor + payload files only
    Grid,
    /// GeoTIFFs and grid files
    Both,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum AreaArg {
    Aoi,
    Exact,
}

#[derive(Parser, Debug)]
#[command(
    name = "degree_days",
    about = "Compute thawing/freezing degree-days from monthly temperature rasters"
)]
struct Args {
    /// Monthly temperature grid descriptor (.json) or directory of monthly .tif rasters
    #[arg(long)]
    in_temperature: PathBuf,

    /// Calendar year of the first month (required for raster directories)
    #[arg(long)]
    start_year: Option<i32>,

    /// Ordering of rasters in a directory
    #[arg(long, value_enum, default_value = "default")]
    sort_method: SortArg,

    /// Output directory for TDD
    #[arg(long)]
    out_tdd: PathBuf,

    /// Output directory for FDD
    #[arg(long)]
    out_fdd: PathBuf,

    /// Output directory for season-transition roots
    #[arg(long, default_value = "./temp-roots")]
    out_roots: PathBuf,

    /// Only compute cells with a flattened index above this one
    #[arg(long)]
    start_at: Option<usize>,

    /// Compute threads (a result-writer thread is added on top)
    #[arg(long)]
    num_workers: Option<usize>,

    /// No-data value; matching cells are blanked in every month
    #[arg(long, allow_hyphen_values = true)]
    mask_val: Option<f32>,

    /// Comparator used with --mask-val
    #[arg(long, value_enum, default_value = "eq")]
    mask_comp: CompArg,

    /// Raster whose cells equal to 1 are recomputed
    #[arg(long)]
    recalc_mask_file: Option<PathBuf>,

    /// Always use the fixed half-year range method
    #[arg(long)]
    always_fallback: bool,

    /// Directory for diagnostic rasters (method map, interpolated cells)
    #[arg(long)]
    logging_dir: Option<PathBuf>,

    /// Output serialization
    #[arg(long, value_enum, default_value = "tiff")]
    out_format: OutFormat,

    /// Repair existing outputs instead of computing them
    #[arg(long)]
    fill_holes: bool,

    /// Valid-area raster selecting cells to fill (default: cells holding -inf)
    #[arg(long, requires = "fill_holes")]
    valid_area: Option<PathBuf>,

    /// How --valid-area selects cells
    #[arg(long, value_enum, default_value = "aoi")]
    area_type: AreaArg,

    /// Reset flagged cells to -inf before filling [default: true]
    #[arg(long, action = clap::ArgAction::Set, value_name = "BOOL")]
    reset_bad_cells: Option<bool>,

    /// Fill kernel radius in cells
    #[arg(long)]
    kernel_size: Option<usize>,

    /// JSON run configuration; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl From<SortArg> for SortMethod {
    fn from(a: SortArg) -> Self {
        match a {
            SortArg::Default => SortMethod::Default,
            SortArg::Snap => SortMethod::Snap,
        }
    }
}

impl From<CompArg> for MaskComparison {
    fn from(a: CompArg) -> Self {
        match a {
            CompArg::Eq => MaskComparison::Eq,
            CompArg::Ne => MaskComparison::Ne,
            CompArg::Lt => MaskComparison::Lt,
            CompArg::Gt => MaskComparison::Gt,
            CompArg::Lte => MaskComparison::Lte,
            CompArg::Gte => MaskComparison::Gte,
        }
    }
}

impl From<AreaArg> for AreaType {
    fn from(a: AreaArg) -> Self {
        match a {
            AreaArg::Aoi => AreaType::Aoi,
            AreaArg::Exact => AreaType::Exact,
        }
    }
}

fn setup_error(msg: impl Into<String>) -> anyhow::Error {
    DdcError::Setup(msg.into()).into()
}

// ── Setup ────────────────────────────────────────────────────────────────────

struct Descriptors {
    tdd: PathBuf,
    fdd: PathBuf,
    roots: PathBuf,
}

impl Descriptors {
    fn new(args: &Args) -> Self {
        Self {
            tdd: args.out_tdd.join("tdd.json"),
            fdd: args.out_fdd.join("fdd.json"),
            roots: args.out_roots.join("roots.json"),
        }
    }
}

/// Reject missing inputs and conflicting flags before any data is read.
fn validate(args: &Args, desc: &Descriptors) -> Result<()> {
    if !args.in_temperature.exists() {
        return Err(setup_error(format!("input {} does not exist", args.in_temperature.display())));
    }
    if args.in_temperature.is_dir() && args.start_year.is_none() {
        return Err(setup_error("--start-year is required when --in-temperature is a directory"));
    }
    for path in [&args.recalc_mask_file, &args.valid_area, &args.config].into_iter().flatten() {
        if !path.is_file() {
            return Err(setup_error(format!("{} does not exist", path.display())));
        }
    }
    if args.fill_holes {
        if !desc.tdd.is_file() || !desc.fdd.is_file() {
            return Err(setup_error("--fill-holes needs existing TDD and FDD outputs"));
        }
        if args.recalc_mask_file.is_some() || args.start_at.is_some() || args.always_fallback {
            return Err(setup_error(
                "--fill-holes cannot be combined with --recalc-mask-file, --start-at or --always-fallback",
            ));
        }
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<DegreeDayConfig> {
    let mut cfg = match &args.config {
        Some(path) => DegreeDayConfig::from_json_file(path)?,
        None => DegreeDayConfig::default(),
    };
    if let Some(n) = args.num_workers {
        cfg.calc.workers = n;
    }
    if args.start_at.is_some() {
        cfg.calc.start_at = args.start_at;
    }
    cfg.calc.extract.use_fallback |= args.always_fallback;
    if let Some(k) = args.kernel_size {
        cfg.fill.kernel_radius = k;
    }
    if let Some(reset) = args.reset_bad_cells {
        cfg.fill.reset = reset;
    }
    Ok(cfg)
}

/// Monthly temperature grid plus the date of its first month.
fn load_temperature(args: &Args) -> Result<(TemporalGrid, NaiveDate)> {
    let input = &args.in_temperature;
    let first_of_year =
        |y: i32| NaiveDate::from_ymd_opt(y, 1, 1).ok_or_else(|| setup_error(format!("invalid start year {y}")));

    let (mut grid, start) = if input.is_dir() {
        let year = args.start_year.ok_or_else(|| setup_error("--start-year is required"))?;
        let start = first_of_year(year)?;
        let pattern = input.join("*.tif");
        let files: Vec<PathBuf> = glob::glob(&pattern.to_string_lossy())
            .context("invalid raster pattern")?
            .filter_map(|e| e.ok())
            .collect();
        if files.is_empty() {
            return Err(setup_error(format!("no .tif rasters in {}", input.display())));
        }
        let files = raster::sort_files(files, args.sort_method.into());
        info!(rasters = files.len(), "loading monthly temperature rasters");
        let grid = raster::load_and_create(&files, start, "monthly-temperature")
            .with_context(|| format!("loading rasters from {}", input.display()))?;
        (grid, start)
    } else {
        let grid = TemporalGrid::load(input).with_context(|| format!("loading {}", input.display()))?;
        let start = match (args.start_year, grid.config().start_date) {
            (Some(y), _) => first_of_year(y)?,
            (None, Some(d)) => d,
            (None, None) => return Err(setup_error("--start-year is required: the grid has no start date")),
        };
        (grid, start)
    };

    if let Some(value) = args.mask_val {
        let n = mask::apply_nodata_mask(&mut grid, value, args.mask_comp.into());
        info!(cells = n, value, "no-data cells masked");
    }
    Ok((grid, start))
}

fn progress_bar(len: usize, msg: &'static str) -> Result<ProgressBar> {
    let style = ProgressStyle::with_template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
        .context("progress template")?
        .progress_chars("#>-");
    let pb = ProgressBar::new(len as u64);
    pb.set_style(style);
    pb.set_message(msg);
    Ok(pb)
}

// ── Modes ────────────────────────────────────────────────────────────────────

fn calculate(
    args: &Args,
    cfg: &DegreeDayConfig,
    temps: &TemporalGrid,
    days: &[f64],
    outputs: &mut DegreeDayOutputs,
) -> Result<()> {
    let recalc = match &args.recalc_mask_file {
        Some(path) => {
            let r = raster::load_raster(path)?;
            Some(mask::recalc_mask(&r, temps.rows(), temps.cols())?)
        }
        None => None,
    };

    let todo = orchestrator::select_cells(temps, cfg.calc.start_at, recalc.as_deref()).len();
    let pb = progress_bar(todo, "cells")?;
    let tick = || pb.inc(1);
    let report = orchestrator::calc_grid_degree_days(temps, days, outputs, &cfg.calc, recalc.as_deref(), &tick)?;
    pb.finish_and_clear();

    for entry in &report.spline_errors {
        println!("{entry}");
    }
    println!(
        "{} cells: {} spline, {} range, {} unresolved, {} without data; {} spline errors",
        report.dispatched,
        report.spline,
        report.range,
        report.exhausted,
        report.missing,
        report.spline_errors.len()
    );

    if let Some(dir) = &args.logging_dir {
        diagnostics::write_method_map(dir, &outputs.method_map)?;
        let path = dir.join("run-report.json");
        let json = serde_json::to_string_pretty(&report).context("serializing run report")?;
        std::fs::write(&path, json).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}

fn fill_holes(args: &Args, cfg: &DegreeDayConfig, outputs: &mut DegreeDayOutputs) -> Result<()> {
    let (rows, cols) = (outputs.tdd.rows(), outputs.tdd.cols());
    let targets = match &args.valid_area {
        Some(path) => {
            let r = raster::load_raster(path)?;
            let valid = mask::valid_area(&r, rows, cols)?;
            mask::area_mask(&outputs.fdd, &valid, args.area_type.into())?
        }
        None => mask::sentinel_mask(&outputs.tdd),
    };
    let count = targets.iter().filter(|t| **t).count();

    // FDD and TDD are filled in two passes.
    let pb = progress_bar(2 * count, "holes")?;
    let report = fill::fill_outputs(outputs, &targets, &cfg.fill, &|| pb.inc(1))?;
    pb.finish_and_clear();
    if !report.unresolved.is_empty() {
        warn!(cells = report.unresolved.len(), "holes without usable neighbours left as NaN");
    }
    println!("{} cells filled", report.filled.len());

    if let Some(dir) = &args.logging_dir {
        let metadata = outputs.tdd.config().raster_metadata.clone();
        diagnostics::write_interpolated(dir, rows, cols, &report.filled, &metadata)?;
    }
    Ok(())
}

// ── Output ───────────────────────────────────────────────────────────────────

fn save_results(args: &Args, desc: &Descriptors, mut outputs: DegreeDayOutputs) -> Result<()> {
    let targets: [(&Path, &str); 3] = [
        (args.out_tdd.as_path(), "tdd"),
        (args.out_fdd.as_path(), "fdd"),
        (args.out_roots.as_path(), "roots"),
    ];

    if matches!(args.out_format, OutFormat::Tiff | OutFormat::Both) {
        let grids = [&outputs.tdd, &outputs.fdd, &outputs.roots];
        for ((dir, prefix), grid) in targets.iter().zip(grids) {
            let written = grid.save_all_as_geotiff(&dir.join("tiff"), prefix)?;
            info!(dataset = prefix, rasters = written.len(), "exported GeoTIFFs");
        }
    }

    let command = std::env::args().collect::<Vec<_>>().join(" ");
    for grid in [&mut outputs.tdd, &mut outputs.fdd, &mut outputs.roots] {
        grid.set_attribute("command-used-to-create", command.clone());
    }
    outputs.tdd.save(&desc.tdd)?;
    outputs.fdd.save(&desc.fdd)?;
    outputs.roots.save(&desc.roots)?;

    if args.out_format == OutFormat::Tiff {
        drop(outputs);
        for path in [&desc.tdd, &desc.fdd, &desc.roots] {
            TemporalGrid::remove_files(path)?;
        }
    }
    Ok(())
}

// ── Main ─────────────────────────────────────────────────────────────────────

fn run(args: Args) -> Result<()> {
    let desc = Descriptors::new(&args);
    validate(&args, &desc)?;
    let cfg = load_config(&args)?;

    let (temps, start) = load_temperature(&args)?;
    let num_years = temps.num_timesteps() / MONTHS_PER_YEAR;
    if num_years == 0 {
        return Err(setup_error(format!(
            "{} months of temperature data is less than one year",
            temps.num_timesteps()
        )));
    }
    let days = raster::monthly_day_offsets(start, temps.num_timesteps());

    let layout = OutputLayout {
        rows: temps.rows(),
        cols: temps.cols(),
        num_years,
        start_year: i64::from(start.year()),
        raster_metadata: temps.config().raster_metadata.clone(),
    };
    let paths = OutputPaths {
        tdd: desc.tdd.clone(),
        fdd: desc.fdd.clone(),
        roots: desc.roots.clone(),
        method_map: args.logging_dir.as_deref().map(diagnostics::method_map_path),
    };
    let (mut outputs, is_new) = DegreeDayOutputs::create_or_open(&layout, &paths)?;
    info!(num_years, resumed = !is_new, "output grids ready");

    if args.fill_holes {
        fill_holes(&args, &cfg, &mut outputs)?;
    } else {
        calculate(&args, &cfg, &temps, &days, &mut outputs)?;
    }
    save_results(&args, &desc, outputs)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("error: {e:#}");
            let setup = e.downcast_ref::<DdcError>().is_some_and(DdcError::is_setup);
            ExitCode::from(if setup { 2 } else { 1 })
        }
    }
}
