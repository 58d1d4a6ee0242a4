//! Per-cell degree-day extraction.
//!
//! A cell's monthly temperatures are fitted with a smoothing spline whose
//! zero crossings mark season transitions. Two ways of turning that curve into
//! annual totals are tried in order:
//!
//! 1. **Spline method.** Integrate between consecutive roots. Positive areas
//!    are thawing seasons, non-positive areas freezing seasons.
//! 2. **Range method.** Integrate over fixed half-year windows anchored to the
//!    first observation: months 0–5 of each year thaw, months 6–11 freeze.
//!    This assumes thaw precedes freeze within a calendar year, which holds
//!    for high-latitude seasonal climates only.
//!
//! FDD totals are negative. Both methods produce one FDD fewer than years
//! (the last freezing season runs past the data); the last FDD is duplicated
//! so every series has one value per year.
//!
//! Roots alternate thaw onset (positive) and freeze onset (negative), so a
//! root's kind also follows from its position: even indices are thaw onsets.
//! A transition on day 0 is stored as 0 and relies on that position alone.
//! This happens when the record starts on 0° or when the range method finds
//! no crossing inside the first thaw window.

use serde::{Deserialize, Serialize};

use crate::roots::{self, RootSearchError, DEFAULT_MAX_ITERATIONS};
use crate::spline::SmoothingSpline;

pub const MONTHS_PER_YEAR: usize = 12;
const HALF_YEAR: usize = MONTHS_PER_YEAR / 2;

/// Algorithm that produced a cell's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    Spline,
    Range,
}

impl Method {
    /// Value stored in the method map.
    pub fn code(self) -> f32 {
        match self {
            Method::Spline => 1.0,
            Method::Range => 2.0,
        }
    }

    pub fn from_code(code: f32) -> Option<Self> {
        if code == 1.0 {
            Some(Method::Spline)
        } else if code == 2.0 {
            Some(Method::Range)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractOptions {
    /// Refits allowed while searching for the expected root count.
    pub max_iterations: usize,
    /// Skip the spline method and always use the range method.
    pub use_fallback: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self { max_iterations: DEFAULT_MAX_ITERATIONS, use_fallback: false }
    }
}

/// Annual series for one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct DegreeDays {
    /// One thawing total per year.
    pub tdd: Vec<f64>,
    /// One freezing total per year, negative.
    pub fdd: Vec<f64>,
    /// Two signed transition days per year: positive for thaw onset,
    /// negative for freeze onset.
    pub roots: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CellOutcome {
    /// Every input value is NaN.
    Missing,
    Solved { series: DegreeDays, method: Method },
    /// Neither method produced a complete series.
    Exhausted,
}

/// Result of extracting one cell, with the spline error (if any) that sent
/// it off the spline method.
#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub outcome: CellOutcome,
    pub spline_error: Option<RootSearchError>,
}

impl Extraction {
    fn new(outcome: CellOutcome, spline_error: Option<RootSearchError>) -> Self {
        Self { outcome, spline_error }
    }

    pub fn method(&self) -> Option<Method> {
        match &self.outcome {
            CellOutcome::Solved { method, .. } => Some(*method),
            _ => None,
        }
    }
}

/// Extract TDD, FDD and roots for one cell.
///
/// `days` and `temps` are the cell's monthly samples; `num_years` fixes the
/// expected output length and the expected root count (`2 × num_years`).
pub fn extract_cell(days: &[f64], temps: &[f64], num_years: usize, opts: &ExtractOptions) -> Extraction {
    if temps.iter().all(|t| t.is_nan()) {
        return Extraction::new(CellOutcome::Missing, None);
    }
    let expected = 2 * num_years;

    let mut spline_error = None;
    let mut tuned = None;
    if !opts.use_fallback {
        match roots::fit_expected_roots(days, temps, expected, opts.max_iterations) {
            Ok(fit) => {
                if let Some(series) = spline_method(&fit.spline, &fit.roots, num_years) {
                    return Extraction::new(CellOutcome::Solved { series, method: Method::Spline }, None);
                }
                tuned = Some(fit.spline);
            }
            Err(e) => spline_error = Some(e),
        }
    }

    let spline = match tuned {
        Some(s) => s,
        None => match SmoothingSpline::fit(days, temps, roots::default_smoothing(days.len())) {
            Ok(s) => s,
            Err(e) => {
                return Extraction::new(CellOutcome::Exhausted, spline_error.or(Some(e.into())));
            }
        },
    };

    let outcome = match range_method(&spline, days, num_years) {
        Some(series) => CellOutcome::Solved { series, method: Method::Range },
        None => CellOutcome::Exhausted,
    };
    Extraction::new(outcome, spline_error)
}

/// Pad FDD to one value per year by repeating its last entry.
fn pad_fdd(fdd: &mut Vec<f64>, num_years: usize) -> Option<()> {
    let last = *fdd.last()?;
    fdd.resize(num_years, last);
    Some(())
}

// ── Spline method ─────────────────────────────────────────────────────────────

fn spline_method(spline: &SmoothingSpline, roots: &[f64], num_years: usize) -> Option<DegreeDays> {
    let mut tdd = Vec::with_capacity(num_years);
    let mut fdd = Vec::with_capacity(num_years);
    let mut signed = Vec::with_capacity(roots.len());
    let mut last_thaw = false;

    for w in roots.windows(2) {
        let area = spline.integral(w[0], w[1]);
        last_thaw = area > 0.0;
        if last_thaw {
            tdd.push(area);
            signed.push(w[0]);
        } else {
            fdd.push(area);
            signed.push(-w[0]);
        }
    }
    let terminal = *roots.last()?;
    signed.push(if last_thaw { -terminal } else { terminal });

    if tdd.len() != num_years || fdd.len() + 1 != num_years {
        return None;
    }
    pad_fdd(&mut fdd, num_years)?;
    if !all_finite(&[&tdd, &fdd, &signed]) {
        return None;
    }
    Some(DegreeDays { tdd, fdd, roots: signed })
}

// ── Range method ──────────────────────────────────────────────────────────────

/// Integrate over `[start, end]` split at every root strictly inside it.
/// Returns `(positive area, negative area, first interior root)`.
fn window_areas(spline: &SmoothingSpline, roots: &[f64], start: f64, end: f64) -> (f64, f64, Option<f64>) {
    let interior: Vec<f64> = roots.iter().copied().filter(|r| *r > start && *r < end).collect();
    let mut points = Vec::with_capacity(interior.len() + 2);
    points.push(start);
    points.extend_from_slice(&interior);
    points.push(end);

    let (mut pos, mut neg) = (0.0, 0.0);
    for w in points.windows(2) {
        let area = spline.integral(w[0], w[1]);
        if area > 0.0 {
            pos += area;
        } else {
            neg += area;
        }
    }
    (pos, neg, interior.first().copied())
}

fn range_method(spline: &SmoothingSpline, days: &[f64], num_years: usize) -> Option<DegreeDays> {
    if num_years <= 1 || days.len() < MONTHS_PER_YEAR * (num_years - 1) + HALF_YEAR + 1 {
        return None;
    }
    let roots = spline.roots();
    let (_, last_day) = spline.domain();

    let mut tdd = Vec::with_capacity(num_years);
    let mut fdd = Vec::with_capacity(num_years);
    let mut signed = Vec::with_capacity(2 * num_years);

    for year in 0..num_years {
        let base = year * MONTHS_PER_YEAR;
        let thaw_start = days[base];
        let freeze_start = days[base + HALF_YEAR];

        let (thaw, _, onset) = window_areas(spline, &roots, thaw_start, freeze_start);
        tdd.push(thaw);
        signed.push(onset.unwrap_or(thaw_start));

        match days.get(base + MONTHS_PER_YEAR) {
            Some(&freeze_end) => {
                let (_, freeze, onset) = window_areas(spline, &roots, freeze_start, freeze_end);
                fdd.push(freeze);
                signed.push(-onset.unwrap_or(freeze_start));
            }
            None => {
                // Incomplete final freeze window: only the transition day is kept.
                let onset = roots.iter().copied().find(|r| *r > freeze_start && *r < last_day);
                signed.push(-onset.unwrap_or(freeze_start));
            }
        }
    }

    fdd.truncate(num_years - 1);
    pad_fdd(&mut fdd, num_years)?;
    if !all_finite(&[&tdd, &fdd, &signed]) {
        return None;
    }
    Some(DegreeDays { tdd, fdd, roots: signed })
}

fn all_finite(series: &[&[f64]]) -> bool {
    series.iter().all(|s| s.iter().all(|v| v.is_finite()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn days(years: usize) -> Vec<f64> {
        (0..years * MONTHS_PER_YEAR).map(|m| (m as f64 * 365.0 / 12.0).round()).collect()
    }

    fn seasonal(days: &[f64]) -> Vec<f64> {
        days.iter()
            .map(|d| 15.0 * (2.0 * std::f64::consts::PI * (d - 15.0) / 365.0).sin())
            .collect()
    }

    #[test]
    fn clean_cycle_uses_spline_method() {
        let d = days(3);
        let ex = extract_cell(&d, &seasonal(&d), 3, &ExtractOptions::default());
        assert_eq!(ex.spline_error, None);
        let CellOutcome::Solved { series, method } = ex.outcome else {
            panic!("expected a solved cell, got {:?}", ex.outcome);
        };
        assert_eq!(method, Method::Spline);
        assert_eq!(series.tdd.len(), 3);
        assert_eq!(series.fdd.len(), 3);
        assert_eq!(series.roots.len(), 6);
        assert_eq!(series.fdd[2], series.fdd[1], "last FDD duplicates the one before");

        let expected = 15.0 * 365.0 / std::f64::consts::PI;
        for t in &series.tdd {
            assert_relative_eq!(*t, expected, max_relative = 0.15);
        }
        for f in &series.fdd {
            assert!(*f < 0.0, "FDD is stored negative, got {f}");
        }
    }

    fn zero_phase(days: &[f64]) -> Vec<f64> {
        days.iter()
            .map(|d| 15.0 * (2.0 * std::f64::consts::PI * d / 365.0).sin())
            .collect()
    }

    #[test]
    fn record_starting_on_zero_uses_spline_method() {
        let d = days(3);
        let ex = extract_cell(&d, &zero_phase(&d), 3, &ExtractOptions::default());
        assert_eq!(ex.spline_error, None);
        let CellOutcome::Solved { series, method } = ex.outcome else {
            panic!("expected a solved cell, got {:?}", ex.outcome);
        };
        assert_eq!(method, Method::Spline);
        assert_eq!(series.roots.len(), 6);
        assert_eq!(series.roots[0], 0.0, "day 0 opens the first thaw");
        for (i, r) in series.roots.iter().enumerate().skip(1) {
            assert_eq!(*r > 0.0, i % 2 == 0, "root {i} = {r} has the wrong sign");
        }
        assert!(series.tdd.iter().all(|t| *t > 0.0));
        assert!(series.fdd.iter().all(|f| *f < 0.0));
        assert_eq!(series.fdd[2], series.fdd[1]);
    }

    #[test]
    fn spline_roots_alternate_sign_with_areas() {
        let d = days(3);
        let ex = extract_cell(&d, &seasonal(&d), 3, &ExtractOptions::default());
        let CellOutcome::Solved { series, .. } = ex.outcome else {
            panic!("expected a solved cell");
        };
        // Thaw onset first, then alternating.
        for (i, r) in series.roots.iter().enumerate() {
            assert_eq!(*r > 0.0, i % 2 == 0, "root {i} = {r} has the wrong sign");
        }
        let magnitudes: Vec<f64> = series.roots.iter().map(|r| r.abs()).collect();
        assert!(magnitudes.windows(2).all(|w| w[0] < w[1]), "roots ascend: {magnitudes:?}");
        // The last interval is a thaw, so the terminal root closes it as a freeze onset.
        assert!(series.roots[5] < 0.0);
    }

    #[test]
    fn forced_fallback_uses_range_method() {
        let d = days(3);
        let opts = ExtractOptions { use_fallback: true, ..ExtractOptions::default() };
        let ex = extract_cell(&d, &seasonal(&d), 3, &opts);
        assert_eq!(ex.method(), Some(Method::Range));
        let CellOutcome::Solved { series, .. } = ex.outcome else {
            panic!("expected a solved cell");
        };
        assert_eq!(series.tdd.len(), 3);
        assert_eq!(series.fdd.len(), 3);
        assert_eq!(series.roots.len(), 6);
        assert_eq!(series.fdd[2], series.fdd[1]);
        assert!(series.tdd.iter().all(|t| *t > 0.0));
        assert!(series.fdd.iter().all(|f| *f < 0.0));
        for (i, r) in series.roots.iter().enumerate() {
            assert_eq!(*r >= 0.0, i % 2 == 0, "root {i} = {r} has the wrong sign");
        }
    }

    #[test]
    fn noise_falls_back_to_range_method() {
        let d = days(3);
        let mut rng = StdRng::seed_from_u64(7);
        let temps: Vec<f64> = (0..d.len())
            .map(|i| {
                let mag = 5.0 + 10.0 * rng.gen::<f64>();
                if i % 2 == 0 { mag } else { -mag }
            })
            .collect();
        let ex = extract_cell(&d, &temps, 3, &ExtractOptions::default());
        assert!(ex.spline_error.is_some(), "noise should defeat the root search");
        assert_eq!(ex.method(), Some(Method::Range));
        let CellOutcome::Solved { series, .. } = ex.outcome else {
            panic!("expected a solved cell");
        };
        assert_eq!(series.tdd.len(), 3);
        assert_eq!(series.fdd.len(), 3);
        assert_eq!(series.fdd[2], series.fdd[1]);
    }

    #[test]
    fn all_nan_is_missing() {
        let d = days(2);
        let ex = extract_cell(&d, &vec![f64::NAN; d.len()], 2, &ExtractOptions::default());
        assert_eq!(ex.outcome, CellOutcome::Missing);
        assert_eq!(ex.spline_error, None);
    }

    #[test]
    fn partial_nan_is_exhausted_with_error() {
        let d = days(2);
        let mut temps = seasonal(&d);
        temps[5] = f64::NAN;
        let ex = extract_cell(&d, &temps, 2, &ExtractOptions::default());
        assert_eq!(ex.outcome, CellOutcome::Exhausted);
        assert!(matches!(ex.spline_error, Some(RootSearchError::Fit(_))));
    }

    #[test]
    fn single_year_cannot_fall_back() {
        let d = days(1);
        let opts = ExtractOptions { use_fallback: true, ..ExtractOptions::default() };
        let ex = extract_cell(&d, &seasonal(&d), 1, &opts);
        assert_eq!(ex.outcome, CellOutcome::Exhausted);
    }

    #[test]
    fn method_codes_round_trip() {
        for m in [Method::Spline, Method::Range] {
            assert_eq!(Method::from_code(m.code()), Some(m));
        }
        assert_eq!(Method::from_code(f32::NAN), None);
    }
}
