//! Smoothing-factor search for a target number of zero crossings.
//!
//! A first fit uses the default smoothing factor (one unit of squared
//! residual per sample). If that curve does not cross zero exactly
//! `expected` times, the factor is set to 1, 2, 3, … and the curve refitted
//! until the count matches or the iteration budget runs out.
//!
//! A record that starts or ends on 0° begins or ends on a transition, but
//! smoothing lifts the curve off zero there and the crossing is lost. When an
//! end sample is within [`BOUNDARY_ZERO_FRACTION`] of the series' largest
//! magnitude and the curve has no root inside the adjacent sampling step, that
//! end day is counted as a root.

use tracing::trace;

use crate::spline::{SmoothingSpline, SplineError};

pub const DEFAULT_MAX_ITERATIONS: usize = 50;

/// Share of the largest |temperature| under which an end sample counts as 0°.
pub const BOUNDARY_ZERO_FRACTION: f64 = 1e-3;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RootSearchError {
    #[error("expected {expected} roots, last fit had {found} after {iterations} refits")]
    RootMismatch {
        expected: usize,
        found: usize,
        iterations: usize,
    },

    #[error("spline fit failed: {0}")]
    Fit(#[from] SplineError),
}

/// A spline whose roots match the requested count.
#[derive(Debug, Clone)]
pub struct RootFit {
    pub spline: SmoothingSpline,
    pub roots: Vec<f64>,
    /// Smoothing factor that produced the fit.
    pub smoothing: f64,
}

/// Roots of `spline` plus any zero-valued ends of the record it was fitted to.
pub fn transition_days(spline: &SmoothingSpline, days: &[f64], temps: &[f64]) -> Vec<f64> {
    let mut roots = spline.roots();
    let n = days.len().min(temps.len());
    if n < 2 {
        return roots;
    }
    let scale = temps[..n].iter().fold(0.0_f64, |m, t| m.max(t.abs()));
    let near_zero = |t: f64| t.abs() <= BOUNDARY_ZERO_FRACTION * scale;

    if near_zero(temps[0]) && !roots.iter().any(|r| *r < days[1]) {
        roots.insert(0, days[0]);
    }
    if near_zero(temps[n - 1]) && !roots.iter().any(|r| *r > days[n - 2]) {
        roots.push(days[n - 1]);
    }
    roots
}

/// Default smoothing factor for `n` samples.
pub fn default_smoothing(n: usize) -> f64 {
    n as f64
}

pub fn fit_expected_roots(
    days: &[f64],
    temps: &[f64],
    expected: usize,
    max_iterations: usize,
) -> Result<RootFit, RootSearchError> {
    let smoothing = default_smoothing(days.len());
    let spline = SmoothingSpline::fit(days, temps, smoothing)?;
    let roots = transition_days(&spline, days, temps);
    if roots.len() == expected {
        return Ok(RootFit { spline, roots, smoothing });
    }

    let mut found = roots.len();
    for i in 1..=max_iterations {
        let smoothing = i as f64;
        let spline = SmoothingSpline::fit(days, temps, smoothing)?;
        let roots = transition_days(&spline, days, temps);
        trace!(smoothing, roots = roots.len(), expected, "refit");
        if roots.len() == expected {
            return Ok(RootFit { spline, roots, smoothing });
        }
        found = roots.len();
    }

    Err(RootSearchError::RootMismatch { expected, found, iterations: max_iterations })
}
