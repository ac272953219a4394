//! Synthetic phase draws from complex inner products.
//!
//! For the dominant mode the signal phase enters as `h(φ) = h(0)·e^{2iφ}`, so
//! given `<d, h(0)>` the conditional log-posterior over the phase is
//! `Re(<d, h(0)>·e^{−2iφ})` up to a row constant. That curve is tabulated on a
//! grid over `[0, 2π]`, turned into a [`GridDensity`](crate::kde::GridDensity)
//! and sampled once per row.

use crate::config::SyntheticPhaseSettings;
use crate::error::Result;
use crate::kde::{linspace, KernelDensityEngine, Support};
use crate::math::TWO_PI;
use ndarray::Array2;
use num_complex::Complex64;

/// Phase grid used for the per-row conditional posterior.
pub fn phase_grid(n_grid: usize) -> Vec<f64> {
    linspace(0.0, TWO_PI, n_grid)
}

/// Unnormalized phase log-posterior `[rows, n_grid]`, each row shifted so
/// that its maximum is zero.
pub fn phase_log_posterior(d_inner_h: &[Complex64], grid: &[f64]) -> Array2<f64> {
    let phasors: Vec<Complex64> = grid
        .iter()
        .map(|phi| Complex64::from_polar(1.0, -2.0 * phi))
        .collect();
    let mut out = Array2::zeros((d_inner_h.len(), grid.len()));
    for (mut row, dh) in out.rows_mut().into_iter().zip(d_inner_h) {
        for (v, p) in row.iter_mut().zip(&phasors) {
            *v = (dh * p).re;
        }
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|v| v - max);
    }
    out
}

/// One phase per row and its log-density.
///
/// Rows whose inner product is not finite get phase 0 and log-density `−∞`.
/// Row `i` of the valid rows is sampled with seed `seed + i`.
pub fn sample_synthetic_phase(
    d_inner_h: &[Complex64],
    settings: &SyntheticPhaseSettings,
    seed: u64,
) -> Result<(Vec<f64>, Vec<f64>)> {
    settings.validate()?;
    let valid: Vec<usize> = d_inner_h
        .iter()
        .enumerate()
        .filter(|(_, dh)| dh.re.is_finite() && dh.im.is_finite())
        .map(|(i, _)| i)
        .collect();
    let valid_dh: Vec<Complex64> = valid.iter().map(|&i| d_inner_h[i]).collect();

    let grid = phase_grid(settings.n_grid);
    let log_weights = phase_log_posterior(&valid_dh, &grid);
    let engine = KernelDensityEngine::new(
        Support::new(0.0, TWO_PI, true)?,
        settings.uniform_weight,
        settings.num_processes,
    );
    let (phases, log_probs) = engine.sample_and_log_prob(&grid, &log_weights, seed)?;

    let mut phase = vec![0.0; d_inner_h.len()];
    let mut delta_log_prob = vec![f64::NEG_INFINITY; d_inner_h.len()];
    for ((&i, p), lp) in valid.iter().zip(phases).zip(log_probs) {
        phase[i] = p;
        delta_log_prob[i] = lp;
    }
    Ok((phase, delta_log_prob))
}
