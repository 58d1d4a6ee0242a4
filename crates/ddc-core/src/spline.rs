//! Natural cubic smoothing spline with a knot at every sample.
//!
//! # Model
//!
//! Among all twice-differentiable curves `g`, pick the one minimising
//!
//! ```text
//! ∫ g''(x)² dx   subject to   Σ (yᵢ − g(xᵢ))² ≤ s
//! ```
//!
//! The minimiser is a natural cubic spline. Following the Reinsch form, its
//! interior second derivatives `γ` and fitted values `g` solve
//!
//! ```text
//! (R + α·QᵀQ) γ = Qᵀy        g = y − α·Q·γ
//! ```
//!
//! where `Q` is the n×(n−2) second-difference matrix and `R` the
//! (n−2)×(n−2) tridiagonal spline-moment matrix. `R + α·QᵀQ` is symmetric
//! positive definite with bandwidth 2, so each solve is a banded Cholesky
//! factorisation in O(n).
//!
//! The residual sum of squares `RSS(α) = α²‖Qγ‖²` grows monotonically with
//! the Lagrange multiplier `α`, from 0 (interpolation) towards the RSS of the
//! least-squares line (α → ∞). The multiplier matching `s` is found by
//! bracketing followed by bisection.
//!
//! # Evaluation
//!
//! The fit is stored as one cubic per knot interval. Outside `[x₀, xₙ₋₁]` the
//! end polynomials are extended, so evaluation and integration both
//! extrapolate. Root finding only reports roots inside the knot span.

use tracing::trace;

/// Fewest samples a spline can be fitted to.
pub const MIN_POINTS: usize = 4;

const BISECT_MAX_ITER: usize = 200;
const RSS_REL_TOL: f64 = 1e-3;
const BRACKET_MAX_STEPS: usize = 40;
const ROOT_DEDUP_TOL: f64 = 1e-9;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SplineError {
    #[error("need at least {MIN_POINTS} samples, got {0}")]
    TooFewPoints(usize),

    #[error("x has {x} samples but y has {y}")]
    LengthMismatch { x: usize, y: usize },

    #[error("non-finite sample at index {0}")]
    NonFinite(usize),

    #[error("x must be strictly increasing (index {0})")]
    NotIncreasing(usize),

    #[error("smoothing system is not positive definite")]
    NotPositiveDefinite,
}

/// A fitted natural cubic smoothing spline.
#[derive(Debug, Clone)]
pub struct SmoothingSpline {
    knots: Vec<f64>,
    /// `[a, b, c, d]` per interval: `a + b·t + c·t² + d·t³`, `t = x − xᵢ`.
    coeffs: Vec<[f64; 4]>,
    /// `∫ from x₀ to xᵢ`, one entry per knot.
    cumulative: Vec<f64>,
    rss: f64,
}

// ── Banded system ─────────────────────────────────────────────────────────────

/// Precomputed band entries of `R`, `QᵀQ` and the right-hand side `Qᵀy`.
struct Bands {
    h: Vec<f64>,
    r0: Vec<f64>,
    r1: Vec<f64>,
    q0: Vec<f64>,
    q1: Vec<f64>,
    q2: Vec<f64>,
    qty: Vec<f64>,
}

impl Bands {
    fn new(x: &[f64], y: &[f64]) -> Self {
        let n = x.len();
        let m = n - 2;
        let h: Vec<f64> = x.windows(2).map(|w| w[1] - w[0]).collect();

        // Column k of Q holds (a, b, c) at rows k, k+1, k+2.
        let a: Vec<f64> = (0..m).map(|k| 1.0 / h[k]).collect();
        let c: Vec<f64> = (0..m).map(|k| 1.0 / h[k + 1]).collect();
        let b: Vec<f64> = (0..m).map(|k| -a[k] - c[k]).collect();

        let r0 = (0..m).map(|k| (h[k] + h[k + 1]) / 3.0).collect();
        let r1 = (0..m.saturating_sub(1)).map(|k| h[k + 1] / 6.0).collect();
        let q0 = (0..m).map(|k| a[k] * a[k] + b[k] * b[k] + c[k] * c[k]).collect();
        let q1 = (0..m.saturating_sub(1))
            .map(|k| b[k] * a[k + 1] + c[k] * b[k + 1])
            .collect();
        let q2 = (0..m.saturating_sub(2)).map(|k| c[k] * a[k + 2]).collect();
        let qty = (0..m)
            .map(|k| (y[k + 2] - y[k + 1]) / h[k + 1] - (y[k + 1] - y[k]) / h[k])
            .collect();

        Self { h, r0, r1, q0, q1, q2, qty }
    }

    fn interior(&self) -> usize {
        self.r0.len()
    }

    /// Solve `(R + α·QᵀQ) γ = Qᵀy` by banded Cholesky.
    fn solve(&self, alpha: f64) -> Result<Vec<f64>, SplineError> {
        let m = self.interior();
        let mut l0 = vec![0.0; m];
        let mut l1 = vec![0.0; m];
        let mut l2 = vec![0.0; m];

        for k in 0..m {
            let a0 = self.r0[k] + alpha * self.q0[k];
            let mut d = a0;
            if k >= 1 {
                d -= l1[k - 1] * l1[k - 1];
            }
            if k >= 2 {
                d -= l2[k - 2] * l2[k - 2];
            }
            if !(d > 0.0) || !d.is_finite() {
                return Err(SplineError::NotPositiveDefinite);
            }
            l0[k] = d.sqrt();
            if k + 1 < m {
                let mut a1 = self.r1[k] + alpha * self.q1[k];
                if k >= 1 {
                    a1 -= l2[k - 1] * l1[k - 1];
                }
                l1[k] = a1 / l0[k];
            }
            if k + 2 < m {
                l2[k] = alpha * self.q2[k] / l0[k];
            }
        }

        // L z = Qᵀy
        let mut z = vec![0.0; m];
        for k in 0..m {
            let mut v = self.qty[k];
            if k >= 1 {
                v -= l1[k - 1] * z[k - 1];
            }
            if k >= 2 {
                v -= l2[k - 2] * z[k - 2];
            }
            z[k] = v / l0[k];
        }
        // Lᵀ γ = z
        let mut gamma = vec![0.0; m];
        for k in (0..m).rev() {
            let mut v = z[k];
            if k + 1 < m {
                v -= l1[k] * gamma[k + 1];
            }
            if k + 2 < m {
                v -= l2[k] * gamma[k + 2];
            }
            gamma[k] = v / l0[k];
        }
        Ok(gamma)
    }

    /// `Q·γ`, one entry per sample.
    fn q_times(&self, gamma: &[f64]) -> Vec<f64> {
        let n = self.h.len() + 1;
        let m = gamma.len();
        let mut out = vec![0.0; n];
        for k in 0..m {
            let a = 1.0 / self.h[k];
            let c = 1.0 / self.h[k + 1];
            out[k] += a * gamma[k];
            out[k + 1] += (-a - c) * gamma[k];
            out[k + 2] += c * gamma[k];
        }
        out
    }

    /// Fitted values, second derivatives and RSS for multiplier `alpha`.
    fn fit(&self, y: &[f64], alpha: f64) -> Result<(Vec<f64>, Vec<f64>, f64), SplineError> {
        let gamma = self.solve(alpha)?;
        if alpha == 0.0 {
            return Ok((y.to_vec(), gamma, 0.0));
        }
        let qg = self.q_times(&gamma);
        let g: Vec<f64> = y.iter().zip(&qg).map(|(yi, q)| yi - alpha * q).collect();
        let rss = alpha * alpha * qg.iter().map(|v| v * v).sum::<f64>();
        Ok((g, gamma, rss))
    }
}

// ── Fitting ───────────────────────────────────────────────────────────────────

fn validate(x: &[f64], y: &[f64]) -> Result<(), SplineError> {
    if x.len() != y.len() {
        return Err(SplineError::LengthMismatch { x: x.len(), y: y.len() });
    }
    if x.len() < MIN_POINTS {
        return Err(SplineError::TooFewPoints(x.len()));
    }
    if let Some(i) = x.iter().zip(y).position(|(a, b)| !a.is_finite() || !b.is_finite()) {
        return Err(SplineError::NonFinite(i));
    }
    if let Some(i) = x.windows(2).position(|w| w[1] <= w[0]) {
        return Err(SplineError::NotIncreasing(i + 1));
    }
    Ok(())
}

/// Least-squares line `(intercept, slope)` and its RSS.
fn least_squares_line(x: &[f64], y: &[f64]) -> (f64, f64, f64) {
    let n = x.len() as f64;
    let mx = x.iter().sum::<f64>() / n;
    let my = y.iter().sum::<f64>() / n;
    let sxx: f64 = x.iter().map(|xi| (xi - mx) * (xi - mx)).sum();
    let sxy: f64 = x.iter().zip(y).map(|(xi, yi)| (xi - mx) * (yi - my)).sum();
    let slope = sxy / sxx;
    let intercept = my - slope * mx;
    let rss = x
        .iter()
        .zip(y)
        .map(|(xi, yi)| {
            let r = yi - (intercept + slope * xi);
            r * r
        })
        .sum();
    (intercept, slope, rss)
}

impl SmoothingSpline {
    /// Fit a smoothing spline whose residual sum of squares is at most `s`.
    ///
    /// `s <= 0` interpolates the data exactly. An `s` at or above the RSS of
    /// the least-squares line yields that line.
    pub fn fit(x: &[f64], y: &[f64], s: f64) -> Result<Self, SplineError> {
        validate(x, y)?;
        let (intercept, slope, line_rss) = least_squares_line(x, y);

        if s > 0.0 && s >= line_rss {
            let knots = x.to_vec();
            let coeffs = x
                .windows(2)
                .map(|w| [intercept + slope * w[0], slope, 0.0, 0.0])
                .collect();
            return Ok(Self::assemble(knots, coeffs, line_rss));
        }

        let bands = Bands::new(x, y);
        let (g, gamma, rss) = if s <= 0.0 {
            bands.fit(y, 0.0)?
        } else {
            Self::search_multiplier(&bands, y, s)?
        };

        let coeffs = Self::piecewise(&bands.h, &g, &gamma);
        Ok(Self::assemble(x.to_vec(), coeffs, rss))
    }

    /// Bracket then bisect `α` until `RSS(α)` is within a relative tolerance
    /// of `s`.
    fn search_multiplier(
        bands: &Bands,
        y: &[f64],
        s: f64,
    ) -> Result<(Vec<f64>, Vec<f64>, f64), SplineError> {
        let rss_at = |alpha: f64| bands.fit(y, alpha).map(|(_, _, r)| r);

        let (mut lo, mut hi) = if rss_at(1.0)? < s {
            let (mut lo, mut hi) = (1.0, 10.0);
            for _ in 0..BRACKET_MAX_STEPS {
                if rss_at(hi)? >= s {
                    break;
                }
                lo = hi;
                hi *= 10.0;
            }
            (lo, hi)
        } else {
            let (mut lo, mut hi) = (0.1, 1.0);
            let mut steps = 0;
            while rss_at(lo)? > s {
                hi = lo;
                lo /= 10.0;
                steps += 1;
                if steps >= BRACKET_MAX_STEPS {
                    lo = 0.0;
                    break;
                }
            }
            (lo, hi)
        };

        let mut best = bands.fit(y, hi)?;
        for iter in 0..BISECT_MAX_ITER {
            let mid = if lo == 0.0 { 0.5 * (lo + hi) } else { (lo * hi).sqrt() };
            let candidate = bands.fit(y, mid)?;
            let rss = candidate.2;
            if (rss - s).abs() < (best.2 - s).abs() {
                best = candidate;
            }
            if (rss - s).abs() <= RSS_REL_TOL * s {
                trace!(alpha = mid, rss, iter, "smoothing multiplier converged");
                break;
            }
            if rss < s {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok(best)
    }

    fn piecewise(h: &[f64], g: &[f64], gamma: &[f64]) -> Vec<[f64; 4]> {
        let n = g.len();
        let mut second = vec![0.0; n];
        second[1..n - 1].copy_from_slice(gamma);

        h.iter()
            .enumerate()
            .map(|(i, &hi)| {
                let (gi, gj) = (second[i], second[i + 1]);
                [
                    g[i],
                    (g[i + 1] - g[i]) / hi - hi * (2.0 * gi + gj) / 6.0,
                    gi / 2.0,
                    (gj - gi) / (6.0 * hi),
                ]
            })
            .collect()
    }

    fn assemble(knots: Vec<f64>, coeffs: Vec<[f64; 4]>, rss: f64) -> Self {
        let mut cumulative = Vec::with_capacity(knots.len());
        cumulative.push(0.0);
        for (i, w) in knots.windows(2).enumerate() {
            let prev = cumulative[i];
            cumulative.push(prev + poly_integral(&coeffs[i], w[1] - w[0]));
        }
        Self { knots, coeffs, cumulative, rss }
    }

    // ── Queries ───────────────────────────────────────────────────────────

    /// `(first knot, last knot)`.
    pub fn domain(&self) -> (f64, f64) {
        (self.knots[0], self.knots[self.knots.len() - 1])
    }

    /// Residual sum of squares of the fit.
    pub fn residual_sum_of_squares(&self) -> f64 {
        self.rss
    }

    fn interval(&self, x: f64) -> usize {
        let last = self.coeffs.len() - 1;
        if x <= self.knots[0] {
            0
        } else {
            // First knot strictly greater than x, minus one.
            (self.knots.partition_point(|&k| k <= x) - 1).min(last)
        }
    }

    pub fn eval(&self, x: f64) -> f64 {
        let i = self.interval(x);
        poly_eval(&self.coeffs[i], x - self.knots[i])
    }

    /// `∫ from x₀ to x`, extrapolating outside the knot span.
    fn antiderivative(&self, x: f64) -> f64 {
        let i = self.interval(x);
        self.cumulative[i] + poly_integral(&self.coeffs[i], x - self.knots[i])
    }

    /// Definite integral of the spline over `[a, b]`.
    pub fn integral(&self, a: f64, b: f64) -> f64 {
        self.antiderivative(b) - self.antiderivative(a)
    }

    /// All real roots inside the knot span, ascending and de-duplicated.
    ///
    /// Each interval is split at the critical points of its cubic; every
    /// monotone piece whose ends change sign contributes one root found by
    /// bisection. Exact zeros at piece boundaries are reported as roots.
    pub fn roots(&self) -> Vec<f64> {
        let mut roots = Vec::new();
        for (i, coef) in self.coeffs.iter().enumerate() {
            let x0 = self.knots[i];
            let h = self.knots[i + 1] - x0;

            let mut cuts = vec![0.0];
            let mut crit = critical_points(coef);
            crit.retain(|&t| t > 0.0 && t < h);
            crit.sort_by(f64::total_cmp);
            cuts.extend(crit);
            cuts.push(h);

            for w in cuts.windows(2) {
                let (t0, t1) = (w[0], w[1]);
                let (f0, f1) = (poly_eval(coef, t0), poly_eval(coef, t1));
                if f0 == 0.0 {
                    roots.push(x0 + t0);
                } else if f0 * f1 < 0.0 {
                    roots.push(x0 + bisect(coef, t0, t1, f0));
                }
            }
        }
        let (_, last) = self.domain();
        if self.eval(last) == 0.0 {
            roots.push(last);
        }

        roots.sort_by(f64::total_cmp);
        roots.dedup_by(|a, b| (*a - *b).abs() <= ROOT_DEDUP_TOL);
        roots
    }
}

// ── Polynomial helpers ────────────────────────────────────────────────────────

#[inline]
fn poly_eval(c: &[f64; 4], t: f64) -> f64 {
    c[0] + t * (c[1] + t * (c[2] + t * c[3]))
}

#[inline]
fn poly_integral(c: &[f64; 4], t: f64) -> f64 {
    t * (c[0] + t * (c[1] / 2.0 + t * (c[2] / 3.0 + t * c[3] / 4.0)))
}

/// Roots of the derivative `b + 2c·t + 3d·t²`.
fn critical_points(c: &[f64; 4]) -> Vec<f64> {
    let (qa, qb, qc) = (3.0 * c[3], 2.0 * c[2], c[1]);
    if qa == 0.0 {
        return if qb != 0.0 { vec![-qc / qb] } else { Vec::new() };
    }
    let disc = qb * qb - 4.0 * qa * qc;
    if disc < 0.0 {
        return Vec::new();
    }
    let q = -0.5 * (qb + qb.signum() * disc.sqrt());
    if q == 0.0 {
        return vec![0.0];
    }
    vec![q / qa, qc / q]
}

/// Bisection on a bracketed sign change of one cubic piece.
fn bisect(c: &[f64; 4], mut lo: f64, mut hi: f64, f_lo: f64) -> f64 {
    let lo_negative = f_lo < 0.0;
    for _ in 0..100 {
        let mid = 0.5 * (lo + hi);
        if mid <= lo || mid >= hi {
            break;
        }
        let fm = poly_eval(c, mid);
        if fm == 0.0 {
            return mid;
        }
        if (fm < 0.0) == lo_negative {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    0.5 * (lo + hi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid(n: usize, step: f64) -> Vec<f64> {
        (0..n).map(|i| i as f64 * step).collect()
    }

    #[test]
    fn interpolates_when_s_is_zero() {
        let x = grid(8, 1.0);
        let y = vec![0.0, 2.0, -1.0, 3.0, 0.5, 4.0, -2.0, 1.0];
        let sp = SmoothingSpline::fit(&x, &y, 0.0).unwrap();
        for (xi, yi) in x.iter().zip(&y) {
            assert_relative_eq!(sp.eval(*xi), *yi, epsilon = 1e-9);
        }
        assert_eq!(sp.residual_sum_of_squares(), 0.0);
    }

    #[test]
    fn natural_spline_of_a_line_is_the_line() {
        let x = grid(6, 1.0);
        let y: Vec<f64> = x.iter().map(|v| 2.0 * v + 1.0).collect();
        let sp = SmoothingSpline::fit(&x, &y, 0.0).unwrap();
        assert_relative_eq!(sp.eval(2.5), 6.0, epsilon = 1e-9);
        assert_relative_eq!(sp.integral(0.0, 4.0), 20.0, epsilon = 1e-9);
        // Extrapolation follows the end polynomials.
        assert_relative_eq!(sp.eval(7.0), 15.0, epsilon = 1e-9);
        assert_relative_eq!(sp.integral(-1.0, 0.0), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn large_s_returns_least_squares_line() {
        let x = grid(5, 1.0);
        let y = vec![0.0, 1.0, 0.0, 1.0, 0.0];
        let sp = SmoothingSpline::fit(&x, &y, 1e6).unwrap();
        // Mean 0.4, zero slope.
        for t in [0.0, 1.3, 4.0] {
            assert_relative_eq!(sp.eval(t), 0.4, epsilon = 1e-9);
        }
    }

    #[test]
    fn rss_tracks_smoothing_factor() {
        let x = grid(24, 30.0);
        let y: Vec<f64> = x
            .iter()
            .enumerate()
            .map(|(i, v)| 10.0 * (v / 58.0).sin() + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let sp = SmoothingSpline::fit(&x, &y, 12.0).unwrap();
        let rss: f64 = x.iter().zip(&y).map(|(a, b)| (b - sp.eval(*a)).powi(2)).sum();
        assert_relative_eq!(sp.residual_sum_of_squares(), 12.0, max_relative = 1e-2);
        assert_relative_eq!(rss, sp.residual_sum_of_squares(), max_relative = 1e-6);
    }

    #[test]
    fn rss_grows_with_smoothing() {
        let x = grid(12, 1.0);
        let y: Vec<f64> = x.iter().map(|v| (v * 1.3).sin() * 3.0).collect();
        let a = SmoothingSpline::fit(&x, &y, 1.0).unwrap();
        let b = SmoothingSpline::fit(&x, &y, 5.0).unwrap();
        assert!(
            a.residual_sum_of_squares() < b.residual_sum_of_squares(),
            "RSS should increase with s: {} vs {}",
            a.residual_sum_of_squares(),
            b.residual_sum_of_squares()
        );
    }

    #[test]
    fn roots_of_a_sine() {
        let x = grid(40, 0.25);
        let y: Vec<f64> = x.iter().map(|v| (v - 0.1).sin()).collect();
        let sp = SmoothingSpline::fit(&x, &y, 0.0).unwrap();
        let roots = sp.roots();
        let expected: Vec<f64> = (0..4).map(|k| 0.1 + k as f64 * std::f64::consts::PI).collect();
        assert_eq!(roots.len(), expected.len(), "roots: {roots:?}");
        for (r, e) in roots.iter().zip(expected) {
            assert_relative_eq!(*r, e, epsilon = 1e-2);
        }
    }

    #[test]
    fn exact_zero_at_knot_is_reported_once() {
        let x = grid(6, 1.0);
        let y: Vec<f64> = x.iter().map(|v| v - 2.0).collect();
        let sp = SmoothingSpline::fit(&x, &y, 0.0).unwrap();
        let roots = sp.roots();
        assert_eq!(roots.len(), 1, "roots: {roots:?}");
        assert_relative_eq!(roots[0], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn zero_at_final_knot_counts() {
        let x = grid(5, 1.0);
        let y: Vec<f64> = x.iter().map(|v| 4.0 - v).collect();
        let sp = SmoothingSpline::fit(&x, &y, 0.0).unwrap();
        assert_eq!(sp.roots(), vec![4.0]);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            SmoothingSpline::fit(&[0.0, 1.0, 2.0], &[0.0, 1.0, 0.0], 0.0).unwrap_err(),
            SplineError::TooFewPoints(3)
        );
        assert_eq!(
            SmoothingSpline::fit(&[0.0, 1.0, 1.0, 2.0], &[0.0; 4], 0.0).unwrap_err(),
            SplineError::NotIncreasing(2)
        );
        assert_eq!(
            SmoothingSpline::fit(&[0.0, 1.0, 2.0, 3.0], &[0.0, f64::NAN, 0.0, 0.0], 0.0).unwrap_err(),
            SplineError::NonFinite(1)
        );
        assert_eq!(
            SmoothingSpline::fit(&[0.0, 1.0, 2.0, 3.0], &[0.0; 3], 0.0).unwrap_err(),
            SplineError::LengthMismatch { x: 4, y: 3 }
        );
    }
}
