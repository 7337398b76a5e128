//! Calibration curve fitting against the reference charge.
//!
//! A sweep produces, per level, a reference charge (measured directly on the scope)
//! and a reading from the device under test. The fitter regresses the reference
//! charge onto the device reading with an ordinary least-squares polynomial:
//!
//! ```text
//! reference ≈ p(reading) = c[0]·reading^d + … + c[d-1]·reading + c[d]
//! ```
//!
//! Coefficients are stored highest power first. Only the first
//! [`CalibrationFitter::max_levels`] points are used so that levels where the
//! device saturates never enter the fit, however many levels the sweep appends.
//!
//! Every fit is computed from scratch over that prefix. Small prefixes are
//! numerically fragile and the prefix length is bounded, so no incremental state
//! is kept.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CalError, CalResult};

/// One (device reading, reference charge) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Independent variable: the device-under-test response.
    pub reading: f64,
    /// Dependent variable: the reference charge in fit units.
    pub reference: f64,
}

/// Polynomial with coefficients ordered highest power first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPolynomial {
    pub coefficients: Vec<f64>,
}

impl CalibrationPolynomial {
    pub fn new(coefficients: Vec<f64>) -> Self {
        Self { coefficients }
    }

    /// Quadratic `quadratic·x² + linear·x + offset`, the form device firmware stores.
    pub fn quadratic(quadratic: f64, linear: f64, offset: f64) -> Self {
        Self::new(vec![quadratic, linear, offset])
    }

    pub fn degree(&self) -> usize {
        self.coefficients.len().saturating_sub(1)
    }

    /// Evaluate with Horner's method.
    pub fn evaluate(&self, x: f64) -> f64 {
        self.coefficients.iter().fold(0.0, |acc, c| acc * x + c)
    }
}

/// PASS/FAIL classification of a fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => write!(f, "PASS"),
            Verdict::Fail => write!(f, "FAIL"),
        }
    }
}

/// Result of fitting a prefix of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFit {
    pub degree: usize,
    pub polynomial: CalibrationPolynomial,
    /// Pearson correlation of reading vs reference; `None` if either series is constant.
    pub correlation: Option<f64>,
    /// `reference - p(reading)` for each prefix point.
    pub residuals: Vec<f64>,
    pub rms_residual: f64,
    pub verdict: Verdict,
    /// Prefix length the fit was computed over.
    pub points_used: usize,
}

/// Outcome of a fit request. Too few levels is a normal state mid-sweep, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum FitOutcome {
    InsufficientData { available: usize, required: usize },
    Fitted(CalibrationFit),
}

impl FitOutcome {
    pub fn fit(&self) -> Option<&CalibrationFit> {
        match self {
            FitOutcome::Fitted(fit) => Some(fit),
            FitOutcome::InsufficientData { .. } => None,
        }
    }
}

/// Fits calibration curves over the trusted prefix of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationFitter {
    /// Polynomial degree (1 or 2).
    pub degree: usize,
    /// Saturation cutoff: only this many leading levels are fitted.
    pub max_levels: usize,
    /// Minimum prefix length before a fit is attempted.
    pub min_points: usize,
    /// RMS residual below which the verdict is PASS, in reference units.
    pub rms_threshold: f64,
}

impl Default for CalibrationFitter {
    fn default() -> Self {
        Self {
            degree: 2,
            max_levels: 19,
            min_points: 4,
            rms_threshold: 100.0,
        }
    }
}

impl CalibrationFitter {
    pub fn new(degree: usize, max_levels: usize) -> Self {
        Self {
            degree,
            max_levels,
            ..Self::default()
        }
    }

    pub fn with_rms_threshold(mut self, rms_threshold: f64) -> Self {
        self.rms_threshold = rms_threshold;
        self
    }

    pub fn with_min_points(mut self, min_points: usize) -> Self {
        self.min_points = min_points;
        self
    }

    /// The points a fit over `points` would use.
    pub fn prefix<'a>(&self, points: &'a [CalibrationPoint]) -> &'a [CalibrationPoint] {
        &points[..points.len().min(self.max_levels)]
    }

    /// Fit the trusted prefix of `points`.
    pub fn fit(&self, points: &[CalibrationPoint]) -> CalResult<FitOutcome> {
        let prefix = self.prefix(points);
        let required = self.min_points.max(self.degree + 1);
        if prefix.len() < required {
            return Ok(FitOutcome::InsufficientData {
                available: prefix.len(),
                required,
            });
        }

        let polynomial = least_squares(prefix, self.degree)?;
        let residuals = residuals(&polynomial, prefix);
        let rms_residual = rms(&residuals);
        let readings: Vec<f64> = prefix.iter().map(|p| p.reading).collect();
        let references: Vec<f64> = prefix.iter().map(|p| p.reference).collect();

        Ok(FitOutcome::Fitted(CalibrationFit {
            degree: self.degree,
            correlation: pearson(&readings, &references),
            verdict: self.classify(rms_residual),
            rms_residual,
            residuals,
            polynomial,
            points_used: prefix.len(),
        }))
    }

    /// RMS residual of an externally supplied polynomial over the same prefix.
    pub fn evaluate_existing(
        &self,
        polynomial: &CalibrationPolynomial,
        points: &[CalibrationPoint],
    ) -> Option<f64> {
        let prefix = self.prefix(points);
        (!prefix.is_empty()).then(|| rms(&residuals(polynomial, prefix)))
    }

    fn classify(&self, rms_residual: f64) -> Verdict {
        if rms_residual < self.rms_threshold {
            Verdict::Pass
        } else {
            Verdict::Fail
        }
    }
}

fn residuals(polynomial: &CalibrationPolynomial, points: &[CalibrationPoint]) -> Vec<f64> {
    points
        .iter()
        .map(|p| p.reference - polynomial.evaluate(p.reading))
        .collect()
}

/// Root mean square of `values`; zero for an empty slice.
pub fn rms(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    (values.iter().map(|v| v * v).sum::<f64>() / values.len() as f64).sqrt()
}

/// Pearson correlation coefficient. `None` for mismatched, short or constant series.
pub fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return None;
    }
    let n = xs.len() as f64;
    let mx = xs.iter().sum::<f64>() / n;
    let my = ys.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx, mut syy) = (0.0, 0.0, 0.0);
    for (x, y) in xs.iter().zip(ys) {
        let (dx, dy) = (x - mx, y - my);
        sxy += dx * dy;
        sxx += dx * dx;
        syy += dy * dy;
    }
    let denom = (sxx * syy).sqrt();
    (denom > 0.0).then(|| (sxy / denom).clamp(-1.0, 1.0))
}

/// Ordinary least-squares polynomial of `degree` through `points`.
///
/// Readings are centred and scaled to `[-1, 1]` before forming the normal
/// equations, then the solution is expanded back to powers of the raw reading.
pub fn least_squares(points: &[CalibrationPoint], degree: usize) -> CalResult<CalibrationPolynomial> {
    let n = degree + 1;
    if points.len() < n {
        return Err(CalError::SingularFit(format!(
            "{} points cannot determine a degree-{degree} polynomial",
            points.len()
        )));
    }

    let centre = points.iter().map(|p| p.reading).sum::<f64>() / points.len() as f64;
    let span = points
        .iter()
        .map(|p| (p.reading - centre).abs())
        .fold(0.0, f64::max);
    if span == 0.0 {
        return Err(CalError::SingularFit("all readings are identical".into()));
    }

    // Normal equations in the scaled variable t = (x - centre) / span.
    let mut a = vec![vec![0.0; n + 1]; n];
    for p in points {
        let t = (p.reading - centre) / span;
        let powers: Vec<f64> = (0..2 * n).map(|k| t.powi(k as i32)).collect();
        for (i, row) in a.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().take(n).enumerate() {
                *cell += powers[i + j];
            }
            row[n] += p.reference * powers[i];
        }
    }
    let scaled = solve(a, points.len())?;

    // Expand sum_k c_k ((x - m) / s)^k into ascending powers of x.
    let mut ascending = vec![0.0; n];
    for (k, ck) in scaled.iter().enumerate() {
        let ck = ck / span.powi(k as i32);
        for (j, slot) in ascending.iter_mut().enumerate().take(k + 1) {
            *slot += ck * binomial(k, j) * (-centre).powi((k - j) as i32);
        }
    }
    ascending.reverse();
    Ok(CalibrationPolynomial::new(ascending))
}

/// Gauss-Jordan elimination with partial pivoting on an augmented matrix.
fn solve(mut a: Vec<Vec<f64>>, samples: usize) -> CalResult<Vec<f64>> {
    let n = a.len();
    let tolerance = 1e-12 * samples as f64;
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col].abs() < tolerance {
            return Err(CalError::SingularFit(format!(
                "normal equations are rank deficient at column {col}"
            )));
        }
        a.swap(col, pivot);
        let pivot_row = a[col].clone();
        for (r, row) in a.iter_mut().enumerate() {
            if r == col {
                continue;
            }
            let factor = row[col] / pivot_row[col];
            for (cell, p) in row.iter_mut().zip(&pivot_row) {
                *cell -= factor * p;
            }
        }
    }
    Ok(a.iter()
        .enumerate()
        .map(|(i, row)| row[n] / row[i])
        .collect())
}

fn binomial(n: usize, k: usize) -> f64 {
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(f: impl Fn(f64) -> f64, xs: impl IntoIterator<Item = f64>) -> Vec<CalibrationPoint> {
        xs.into_iter()
            .map(|x| CalibrationPoint {
                reading: x,
                reference: f(x),
            })
            .collect()
    }

    fn fitted(outcome: FitOutcome) -> CalibrationFit {
        match outcome {
            FitOutcome::Fitted(fit) => fit,
            other => panic!("expected a fit, got {other:?}"),
        }
    }

    #[test]
    fn test_perfect_linear_fit() {
        let data = points(|x| 2.0 * x + 1.0, (1..=10).map(f64::from));
        let fit = fitted(CalibrationFitter::new(1, 19).fit(&data).unwrap());
        assert_eq!(fit.polynomial.coefficients.len(), 2);
        assert!((fit.polynomial.coefficients[0] - 2.0).abs() < 1e-9);
        assert!((fit.polynomial.coefficients[1] - 1.0).abs() < 1e-9);
        assert!((fit.correlation.unwrap() - 1.0).abs() < 1e-12);
        assert!(fit.rms_residual < 1e-9);
        assert_eq!(fit.verdict, Verdict::Pass);
        assert_eq!(fit.points_used, 10);
    }

    #[test]
    fn test_fit_maps_reading_to_reference() {
        // The device reads 2 * charge + 1; the fit must undo that.
        let data: Vec<CalibrationPoint> = (1..=10)
            .map(f64::from)
            .map(|charge| CalibrationPoint {
                reading: 2.0 * charge + 1.0,
                reference: charge,
            })
            .collect();
        let fit = fitted(CalibrationFitter::new(1, 19).fit(&data).unwrap());
        assert!((fit.polynomial.coefficients[0] - 0.5).abs() < 1e-9);
        assert!((fit.polynomial.coefficients[1] + 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_quadratic_recovery_at_count_scale() {
        // ADC-count readings with pC references, the shape of a beam monitor sweep.
        let data = points(
            |x| 0.0125 * x * x + 3.5 * x - 40.0,
            (1..=15).map(|i| f64::from(i) * 110.0),
        );
        let fit = fitted(CalibrationFitter::new(2, 19).fit(&data).unwrap());
        let c = &fit.polynomial.coefficients;
        assert!((c[0] - 0.0125).abs() < 1e-9);
        assert!((c[1] - 3.5).abs() < 1e-6);
        assert!((c[2] + 40.0).abs() < 1e-4);
        assert_eq!(fit.verdict, Verdict::Pass);
    }

    #[test]
    fn test_saturated_tail_is_excluded() {
        let fitter = CalibrationFitter::new(1, 8);
        let trusted = points(|x| 3.0 * x - 2.0, (0..8).map(f64::from));
        let mut extended = trusted.clone();
        extended.extend(points(|_| 2047.0, (8..14).map(f64::from)));

        let base = fitted(fitter.fit(&trusted).unwrap());
        let with_tail = fitted(fitter.fit(&extended).unwrap());
        assert_eq!(base, with_tail);
        assert_eq!(with_tail.points_used, 8);
        assert_eq!(with_tail.residuals.len(), 8);
    }

    #[test]
    fn test_insufficient_data_is_not_an_error() {
        let data = points(|x| x, (0..3).map(f64::from));
        let outcome = CalibrationFitter::new(1, 19).fit(&data).unwrap();
        assert_eq!(
            outcome,
            FitOutcome::InsufficientData {
                available: 3,
                required: 4
            }
        );
        assert!(outcome.fit().is_none());
    }

    #[test]
    fn test_rms_threshold_verdict() {
        // Alternating +-150 residual around a line.
        let data: Vec<_> = (0..10)
            .map(|i| CalibrationPoint {
                reading: f64::from(i),
                reference: 10.0 * f64::from(i) + if i % 2 == 0 { 150.0 } else { -150.0 },
            })
            .collect();
        let fit = fitted(CalibrationFitter::new(1, 19).fit(&data).unwrap());
        assert!(fit.rms_residual > 100.0);
        assert_eq!(fit.verdict, Verdict::Fail);

        let lenient = CalibrationFitter::new(1, 19).with_rms_threshold(1000.0);
        assert_eq!(fitted(lenient.fit(&data).unwrap()).verdict, Verdict::Pass);
    }

    #[test]
    fn test_constant_readings_are_singular() {
        let data: Vec<_> = (0..6)
            .map(|i| CalibrationPoint {
                reading: 5.0,
                reference: f64::from(i),
            })
            .collect();
        assert!(matches!(
            CalibrationFitter::new(1, 19).fit(&data),
            Err(CalError::SingularFit(_))
        ));
    }

    #[test]
    fn test_existing_calibration_comparison() {
        let fitter = CalibrationFitter::new(2, 5);
        let data = points(|x| 2.0 * x, (0..10).map(f64::from));
        let exact = CalibrationPolynomial::quadratic(0.0, 2.0, 0.0);
        assert_eq!(fitter.evaluate_existing(&exact, &data), Some(0.0));

        let offset = CalibrationPolynomial::quadratic(0.0, 2.0, 3.0);
        let rms = fitter.evaluate_existing(&offset, &data).unwrap();
        assert!((rms - 3.0).abs() < 1e-12);
        assert_eq!(fitter.evaluate_existing(&exact, &[]), None);
    }

    #[test]
    fn test_pearson_edge_cases() {
        assert_eq!(pearson(&[1.0, 2.0], &[1.0]), None);
        assert_eq!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), None);
        let r = pearson(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]).unwrap();
        assert!((r + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_horner_evaluation() {
        let p = CalibrationPolynomial::quadratic(1.0, -2.0, 3.0);
        assert_eq!(p.evaluate(2.0), 3.0);
        assert_eq!(p.degree(), 2);
        assert_eq!(Verdict::Fail.to_string(), "FAIL");
    }
}
