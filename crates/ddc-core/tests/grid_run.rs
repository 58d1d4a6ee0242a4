//! End-to-end runs over small synthetic grids.

use chrono::NaiveDate;
use ddc_core::mask;
use ddc_core::raster::monthly_day_offsets;
use ddc_core::{
    calc_grid_degree_days, fill_outputs, CalcOptions, DegreeDayOutputs, FillOptions, GridConfig, OutputLayout,
    OutputPaths, RunReport, TemporalGrid, TimestepDelta,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const ROWS: usize = 10;
const COLS: usize = 10;
const YEARS: usize = 3;

fn start_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2001, 1, 1).unwrap()
}

fn days() -> Vec<f64> {
    monthly_day_offsets(start_date(), YEARS * 12)
}

fn cycle(day: f64, phase: f64) -> f32 {
    (15.0 * (2.0 * std::f64::consts::PI * (day - phase) / 365.0).sin()) as f32
}

fn seasonal(day: f64) -> f32 {
    cycle(day, 15.0)
}

/// Monthly temperature grid with the same seasonal cycle in every cell.
fn sine_grid() -> TemporalGrid {
    cycle_grid(seasonal)
}

fn cycle_grid(temperature: impl Fn(f64) -> f32) -> TemporalGrid {
    let days = days();
    let mut cfg = GridConfig::new("monthly-temperature", ROWS, COLS, days.len());
    cfg.delta_timestep = TimestepDelta::Monthly;
    cfg.start_date = Some(start_date());
    let mut grid = TemporalGrid::new(cfg, 0.0).unwrap();
    for (t, d) in days.iter().enumerate() {
        grid.plane_mut(t).fill(temperature(*d));
    }
    grid
}

fn layout() -> OutputLayout {
    OutputLayout {
        rows: ROWS,
        cols: COLS,
        num_years: YEARS,
        start_year: 2001,
        raster_metadata: Default::default(),
    }
}

fn run(temps: &TemporalGrid, outputs: &mut DegreeDayOutputs, opts: &CalcOptions, recalc: Option<&[bool]>) -> RunReport {
    calc_grid_degree_days(temps, &days(), outputs, opts, recalc, &|| {}).unwrap()
}

fn workers(n: usize) -> CalcOptions {
    CalcOptions { workers: n, channel_capacity: 8, ..CalcOptions::default() }
}

#[test]
fn clean_sine_grid_resolves_with_spline_method() {
    let temps = sine_grid();
    let mut out = DegreeDayOutputs::in_memory(&layout()).unwrap();
    let report = run(&temps, &mut out, &workers(4), None);

    assert_eq!(report.dispatched, ROWS * COLS);
    assert_eq!(report.spline, ROWS * COLS, "report: {report:?}");
    assert!(report.spline_errors.is_empty());
    assert!(out.method_map.plane(0).iter().all(|&m| m == 1.0));

    for i in 0..ROWS * COLS {
        let tdd = out.tdd.cell_series(i);
        let fdd = out.fdd.cell_series(i);
        assert_eq!(tdd.len(), YEARS);
        assert!(tdd.iter().all(|v| *v > 0.0), "cell {i} tdd {tdd:?}");
        assert!(fdd.iter().all(|v| *v < 0.0), "cell {i} fdd {fdd:?}");
        assert_eq!(fdd[YEARS - 1], fdd[YEARS - 2], "FDD padding at cell {i}");
    }
}

#[test]
fn cycle_starting_on_zero_resolves_with_spline_method() {
    // The record opens on 0°, so day 0 is the first thaw onset.
    let temps = cycle_grid(|d| cycle(d, 0.0));
    assert_eq!(temps.plane(0)[0], 0.0);
    let mut out = DegreeDayOutputs::in_memory(&layout()).unwrap();
    let report = run(&temps, &mut out, &workers(2), None);

    assert_eq!(report.spline, ROWS * COLS, "report: {report:?}");
    assert_eq!(report.range, 0);
    assert!(report.spline_errors.is_empty());
    assert!(out.method_map.plane(0).iter().all(|&m| m == 1.0));
    for i in 0..ROWS * COLS {
        let roots = out.roots.cell_series(i);
        assert_eq!(roots[0], 0.0, "cell {i} roots {roots:?}");
        assert!(out.tdd.cell_series(i).iter().all(|v| *v > 0.0));
        assert!(out.fdd.cell_series(i).iter().all(|v| *v < 0.0));
    }
}

#[test]
fn missing_cell_stays_nan_and_is_not_a_fill_target() {
    let mut temps = sine_grid();
    temps.fill_cell(37, f32::NAN);
    let mut out = DegreeDayOutputs::in_memory(&layout()).unwrap();
    let report = run(&temps, &mut out, &workers(2), None);

    assert_eq!(report.dispatched, ROWS * COLS - 1);
    assert!(out.tdd.cell_series(37).iter().all(|v| v.is_nan()));
    assert!(out.fdd.cell_series(37).iter().all(|v| v.is_nan()));
    assert!(out.roots.cell_series(37).iter().all(|v| v.is_nan()));
    assert!(out.method_map.plane(0)[37].is_nan());
    assert!(!mask::sentinel_mask(&out.tdd)[37]);
}

#[test]
fn noisy_cell_falls_back_with_complete_series() {
    let mut temps = sine_grid();
    let mut rng = StdRng::seed_from_u64(42);
    let noise: Vec<f32> = (0..YEARS * 12)
        .map(|i| {
            let mag = 5.0 + 10.0 * rng.gen::<f32>();
            if i % 2 == 0 { mag } else { -mag }
        })
        .collect();
    temps.set_cell_series(55, &noise);

    let mut out = DegreeDayOutputs::in_memory(&layout()).unwrap();
    let report = run(&temps, &mut out, &workers(3), None);

    assert_eq!(out.method_map.plane(0)[55], 2.0);
    assert_eq!(report.range, 1);
    assert_eq!(report.spline, ROWS * COLS - 1);
    assert_eq!(report.spline_errors.len(), 1);
    assert_eq!(report.spline_errors[0].index, 55);
    assert_eq!((report.spline_errors[0].row, report.spline_errors[0].col), (5, 5));
    assert_eq!(report.spline_errors[0].message, "expected root mismatch at element 55");

    let tdd = out.tdd.cell_series(55);
    let fdd = out.fdd.cell_series(55);
    assert!(tdd.iter().chain(&fdd).all(|v| v.is_finite()));
    assert_eq!(fdd[YEARS - 1], fdd[YEARS - 2]);
}

#[test]
fn resume_leaves_earlier_cells_untouched() {
    let temps = sine_grid();
    let mut out = DegreeDayOutputs::in_memory(&layout()).unwrap();
    let marker = -12345.0f32;
    for i in 0..=40 {
        out.tdd.fill_cell(i, marker);
    }
    let opts = CalcOptions { start_at: Some(40), ..workers(2) };
    let report = run(&temps, &mut out, &opts, None);

    assert_eq!(report.dispatched, ROWS * COLS - 41);
    for i in 0..=40 {
        assert!(out.tdd.cell_series(i).iter().all(|v| *v == marker), "cell {i} was rewritten");
        assert!(out.method_map.plane(0)[i].is_nan());
    }
    assert!(out.tdd.cell_series(41).iter().all(|v| *v > 0.0));
}

#[test]
fn recalc_mask_only_mutates_masked_cells() {
    let temps = sine_grid();
    let mut out = DegreeDayOutputs::in_memory(&layout()).unwrap();
    run(&temps, &mut out, &workers(2), None);
    let before_tdd = out.tdd.data().to_vec();

    // Corrupt two cells, then recompute only those.
    out.tdd.fill_cell(12, f32::NEG_INFINITY);
    out.tdd.fill_cell(88, f32::NEG_INFINITY);
    let snapshot = out.tdd.data().to_vec();
    let mut recalc = vec![false; ROWS * COLS];
    recalc[12] = true;
    recalc[88] = true;
    let report = run(&temps, &mut out, &workers(2), Some(&recalc));

    assert_eq!(report.dispatched, 2);
    let cells = ROWS * COLS;
    for (k, (after, prior)) in out.tdd.data().iter().zip(&snapshot).enumerate() {
        let cell = k % cells;
        if cell == 12 || cell == 88 {
            assert_eq!(after.to_bits(), before_tdd[k].to_bits(), "recomputed cell {cell} differs");
        } else {
            assert_eq!(after.to_bits(), prior.to_bits(), "unmasked cell {cell} changed");
        }
    }
}

#[test]
fn exhausted_cell_is_repaired_by_fill() {
    let mut temps = sine_grid();
    // A single non-finite month makes every fit fail.
    let mut series = temps.cell_series(44);
    series[7] = f32::INFINITY;
    temps.set_cell_series(44, &series);

    let mut out = DegreeDayOutputs::in_memory(&layout()).unwrap();
    let report = run(&temps, &mut out, &workers(2), None);
    assert_eq!(report.exhausted, 1);
    assert!(out.tdd.cell_series(44).iter().all(|v| *v == f32::NEG_INFINITY));

    let holes = mask::sentinel_mask(&out.tdd);
    assert_eq!(holes.iter().filter(|h| **h).count(), 1);
    let neighbour = out.tdd.cell_series(45);
    let fill = fill_outputs(&mut out, &holes, &FillOptions::default(), &|| {}).unwrap();

    assert_eq!(fill.filled, vec![44]);
    // Every neighbour carries the same series, so the mean equals it.
    for (a, b) in out.tdd.cell_series(44).iter().zip(&neighbour) {
        assert!((a - b).abs() < 1e-3, "filled {a} vs neighbour {b}");
    }
    assert!(out.fdd.cell_series(44).iter().all(|v| v.is_finite()));
    assert!(out.roots.cell_series(44).iter().all(|v| *v == f32::NEG_INFINITY), "roots are not filled");
}

#[test]
fn persisted_run_resumes_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let paths = OutputPaths {
        tdd: dir.path().join("tdd.json"),
        fdd: dir.path().join("fdd.json"),
        roots: dir.path().join("roots.json"),
        method_map: Some(dir.path().join("logs").join("methodmap.json")),
    };
    let temps = sine_grid();

    let (mut out, is_new) = DegreeDayOutputs::create_or_open(&layout(), &paths).unwrap();
    assert!(is_new);
    run(&temps, &mut out, &CalcOptions { start_at: Some(49), ..workers(2) }, None);
    drop(out);

    let (mut out, is_new) = DegreeDayOutputs::create_or_open(&layout(), &paths).unwrap();
    assert!(!is_new);
    assert!(out.tdd.cell_series(60).iter().all(|v| *v > 0.0), "first pass persisted");
    assert!(out.tdd.cell_series(10).iter().all(|v| v.is_nan()));

    let mut recalc = vec![false; ROWS * COLS];
    recalc[..50].iter_mut().for_each(|m| *m = true);
    let report = run(&temps, &mut out, &workers(2), Some(&recalc));
    assert_eq!(report.dispatched, 50);
    assert!(out.method_map.plane(0).iter().all(|&m| m == 1.0));
}
