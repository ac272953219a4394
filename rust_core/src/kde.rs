//! One-dimensional densities built from grid log-weights.
//!
//! The grid values are turned into a piecewise-linear density over a bounded
//! (optionally periodic) support and mixed with a uniform floor, so every point
//! of the support keeps a finite log-density. Sampling is exact for that
//! mixture, which makes the returned log-density the one actually sampled.

use crate::error::{Error, Result};
use crate::parallel::map_rows;
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Support of a one-dimensional density.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Support {
    pub lower: f64,
    pub upper: f64,
    pub periodic: bool,
}

impl Support {
    pub fn new(lower: f64, upper: f64, periodic: bool) -> Result<Self> {
        if !(lower.is_finite() && upper.is_finite() && lower < upper) {
            return Err(Error::config(format!(
                "invalid density support [{lower}, {upper}]"
            )));
        }
        Ok(Self {
            lower,
            upper,
            periodic,
        })
    }

    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    /// Map `x` into the support (periodic) or reject it (bounded).
    fn canonical(&self, x: f64) -> Option<f64> {
        if !x.is_finite() {
            return None;
        }
        if self.periodic {
            let y = self.lower + (x - self.lower).rem_euclid(self.width());
            Some(y)
        } else if (self.lower..=self.upper).contains(&x) {
            Some(x)
        } else {
            None
        }
    }
}

/// Piecewise-linear density on a grid, mixed with a uniform component.
#[derive(Debug, Clone)]
pub struct GridDensity {
    support: Support,
    /// Knot positions covering `[lower, upper]`, strictly increasing.
    knots: Vec<f64>,
    /// Unnormalized density at the knots.
    values: Vec<f64>,
    /// Cumulative unnormalized mass at each knot.
    cumulative: Vec<f64>,
    uniform_weight: f64,
}

impl GridDensity {
    /// Build a density from unnormalized log-weights on a sorted grid.
    ///
    /// Weights are stabilized by their maximum before exponentiation. Grid
    /// points must lie inside the support and be strictly increasing.
    pub fn from_log_weights(
        grid: &[f64],
        log_weights: &[f64],
        support: Support,
        uniform_weight: f64,
    ) -> Result<Self> {
        if grid.len() != log_weights.len() {
            return Err(Error::shape("grid log-weights", grid.len(), log_weights.len()));
        }
        if grid.len() < 2 {
            return Err(Error::config("a grid density needs at least two grid points"));
        }
        if !(0.0..1.0).contains(&uniform_weight) {
            return Err(Error::config(format!(
                "uniform_weight must lie in [0, 1), got {uniform_weight}"
            )));
        }
        if grid.windows(2).any(|w| !(w[0] < w[1]))
            || grid[0] < support.lower
            || grid[grid.len() - 1] > support.upper
        {
            return Err(Error::contract(
                "grid must be strictly increasing inside the support",
            ));
        }
        if log_weights.iter().any(|w| w.is_nan()) {
            return Err(Error::contract("grid log-weights contain NaN"));
        }
        let max = log_weights
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return Err(Error::contract("grid log-weights have no finite maximum"));
        }
        let weights: Vec<f64> = log_weights.iter().map(|w| (w - max).exp()).collect();

        let n = grid.len();
        let (first, last) = (grid[0], grid[n - 1]);
        let edge = |at_lower: bool| -> f64 {
            if support.periodic {
                // wrap the gap between the last and first grid point
                let left = last - support.width();
                let t = (support.lower - left) / (first - left);
                weights[n - 1] + t * (weights[0] - weights[n - 1])
            } else if at_lower {
                weights[0]
            } else {
                weights[n - 1]
            }
        };

        let mut knots = Vec::with_capacity(n + 2);
        let mut values = Vec::with_capacity(n + 2);
        if first > support.lower {
            knots.push(support.lower);
            values.push(edge(true));
        }
        knots.extend_from_slice(grid);
        values.extend_from_slice(&weights);
        if last < support.upper {
            knots.push(support.upper);
            values.push(edge(false));
        }

        let mut cumulative = Vec::with_capacity(knots.len());
        cumulative.push(0.0);
        for i in 1..knots.len() {
            let area = 0.5 * (values[i - 1] + values[i]) * (knots[i] - knots[i - 1]);
            cumulative.push(cumulative[i - 1] + area);
        }

        Ok(Self {
            support,
            knots,
            values,
            cumulative,
            uniform_weight,
        })
    }

    pub fn support(&self) -> Support {
        self.support
    }

    fn mass(&self) -> f64 {
        self.cumulative[self.cumulative.len() - 1]
    }

    /// Unnormalized interpolated value at a canonical `x`.
    fn interpolate(&self, x: f64) -> f64 {
        let i = self.knots.partition_point(|&k| k <= x).clamp(1, self.knots.len() - 1);
        let (x0, x1) = (self.knots[i - 1], self.knots[i]);
        let (v0, v1) = (self.values[i - 1], self.values[i]);
        v0 + (v1 - v0) * (x - x0) / (x1 - x0)
    }

    pub fn log_prob(&self, x: f64) -> f64 {
        let Some(x) = self.support.canonical(x) else {
            return f64::NEG_INFINITY;
        };
        let w = self.uniform_weight;
        let p = (1.0 - w) * self.interpolate(x) / self.mass() + w / self.support.width();
        p.ln()
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if rng.gen::<f64>() < self.uniform_weight {
            return self.support.lower + rng.gen::<f64>() * self.support.width();
        }
        let target = rng.gen::<f64>() * self.mass();
        let i = self
            .cumulative
            .partition_point(|&c| c <= target)
            .clamp(1, self.knots.len() - 1);
        let (x0, x1) = (self.knots[i - 1], self.knots[i]);
        let (v0, v1) = (self.values[i - 1], self.values[i]);
        let h = x1 - x0;
        let r = target - self.cumulative[i - 1];
        // solve v0·t + (v1 − v0)·t²/(2h) = r for t ∈ [0, h]
        let slope = (v1 - v0) / h;
        let denom = v0 + (v0 * v0 + 2.0 * slope * r).max(0.0).sqrt();
        let t = if denom > 0.0 { 2.0 * r / denom } else { 0.0 };
        (x0 + t.clamp(0.0, h)).min(self.support.upper)
    }

    pub fn sample_and_log_prob<R: Rng + ?Sized>(&self, rng: &mut R) -> (f64, f64) {
        let x = self.sample(rng);
        (x, self.log_prob(x))
    }
}

/// Batched per-row grid densities, one draw per row.
#[derive(Debug, Clone, Copy)]
pub struct KernelDensityEngine {
    pub support: Support,
    pub uniform_weight: f64,
    pub num_processes: usize,
}

impl KernelDensityEngine {
    pub fn new(support: Support, uniform_weight: f64, num_processes: usize) -> Self {
        Self {
            support,
            uniform_weight,
            num_processes,
        }
    }

    /// One draw and its log-density per row of `log_weights` (`[rows, grid]`).
    ///
    /// Row `i` uses its own RNG seeded with `seed + i`, so the output does not
    /// depend on `num_processes`.
    pub fn sample_and_log_prob(
        &self,
        grid: &[f64],
        log_weights: &Array2<f64>,
        seed: u64,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        if log_weights.ncols() != grid.len() {
            return Err(Error::shape("kernel density grid", grid.len(), log_weights.ncols()));
        }
        let rows = map_rows(log_weights.nrows(), self.num_processes, |i| {
            let row = log_weights.row(i).to_vec();
            let density =
                GridDensity::from_log_weights(grid, &row, self.support, self.uniform_weight)?;
            let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(i as u64));
            Ok(density.sample_and_log_prob(&mut rng))
        })?;
        let rows = rows.into_iter().collect::<Result<Vec<(f64, f64)>>>()?;
        Ok(rows.into_iter().unzip())
    }
}

/// `n` evenly spaced points from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n)
                .map(|i| if i == n - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}
