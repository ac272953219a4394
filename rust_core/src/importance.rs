//! Importance reweighting of proposal samples to the exact posterior.
//!
//! Weights are `prior · likelihood / proposal`; rows outside the prior or with
//! a failed likelihood carry zero weight. Summaries follow the usual
//! definitions: Kish effective sample size, sample efficiency `n_eff / n`, and
//! the evidence estimate `log mean(w)` with its delta-method uncertainty.

use crate::error::{Error, Result};
use crate::gw::GwExtension;
use crate::likelihood::{log_likelihood_multi, BatchOptions};
use crate::math::logsumexp;
use crate::samples::SampleTable;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;

pub const LOG_PRIOR: &str = "log_prior";
pub const LOG_LIKELIHOOD: &str = "log_likelihood";
pub const WEIGHTS: &str = "weights";

/// Summary of an importance sampling pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportanceSamplingResult {
    pub log_weights: Vec<f64>,
    /// Weights normalized to mean one.
    pub weights: Vec<f64>,
    pub n_eff: f64,
    pub sample_efficiency: f64,
    pub log_evidence: f64,
    pub log_evidence_std: f64,
}

impl ImportanceSamplingResult {
    /// Render the summary as a short table.
    pub fn to_table(&self) -> String {
        let n = self.weights.len();
        let zero = self.weights.iter().filter(|w| **w == 0.0).count();
        let mut lines = vec![
            format!("{:<20} {:>14}", "samples", n),
            format!("{:<20} {:>14}", "zero weight", zero),
            format!("{:<20} {:>14.1}", "n_eff", self.n_eff),
            format!("{:<20} {:>13.2}%", "sample efficiency", 100.0 * self.sample_efficiency),
            format!(
                "{:<20} {:>14.4} ± {:.4}",
                "log evidence", self.log_evidence, self.log_evidence_std
            ),
        ];
        if self.sample_efficiency < 0.01 {
            lines.push("⚠  Sample efficiency below 1%: the estimate may be unreliable.".to_string());
        }
        lines.join("\n")
    }
}

/// Weights from per-row log prior, log likelihood and proposal log density.
pub fn importance_weights(
    log_prior: &[f64],
    log_likelihood: &[f64],
    log_prob: &[f64],
) -> Result<ImportanceSamplingResult> {
    let n = log_prob.len();
    if log_prior.len() != n {
        return Err(Error::shape("log_prior", n, log_prior.len()));
    }
    if log_likelihood.len() != n {
        return Err(Error::shape("log_likelihood", n, log_likelihood.len()));
    }
    if n == 0 {
        return Err(Error::contract("importance weights need at least one sample"));
    }

    let log_weights: Vec<f64> = (0..n)
        .map(|i| {
            let lw = log_prior[i] + log_likelihood[i] - log_prob[i];
            if lw.is_nan() || lw == f64::INFINITY {
                f64::NEG_INFINITY
            } else {
                lw
            }
        })
        .collect();
    let log_total = logsumexp(&log_weights);
    if !log_total.is_finite() {
        return Err(Error::contract("all importance weights are zero"));
    }
    let log_mean = log_total - (n as f64).ln();
    let weights: Vec<f64> = log_weights.iter().map(|lw| (lw - log_mean).exp()).collect();

    let sum: f64 = weights.iter().sum();
    let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
    let n_eff = sum * sum / sum_sq;
    let n_f = n as f64;

    Ok(ImportanceSamplingResult {
        log_weights,
        weights,
        n_eff,
        sample_efficiency: n_eff / n_f,
        log_evidence: log_mean,
        log_evidence_std: ((n_f - n_eff) / (n_f * n_eff)).max(0.0).sqrt(),
    })
}

/// Evaluate prior and likelihood for posterior samples and attach
/// `log_prior`, `log_likelihood` and `weights` columns.
///
/// The likelihood marginalizes over phase when the samples carry no phase
/// and over time when the sampler is configured for it. Rows outside the prior
/// are not passed to the likelihood.
pub fn importance_sample(
    gw: &GwExtension,
    mut samples: SampleTable,
    opts: BatchOptions,
) -> Result<(SampleTable, ImportanceSamplingResult)> {
    let log_prob = samples
        .log_prob()
        .ok_or_else(|| Error::MissingColumn(crate::samples::LOG_PROB.to_string()))?
        .to_vec();
    let theta = samples.parameters();

    let prior = if theta.contains("phase") {
        gw.prior.clone()
    } else {
        gw.prior_without_phase()
    };
    let mut log_prior = prior.log_prob(&theta)?;
    for (lp, ok) in log_prior.iter_mut().zip(prior.evaluate_constraints(&theta)?) {
        if !ok {
            *lp = f64::NEG_INFINITY;
        }
    }
    let within: Vec<usize> = (0..theta.len())
        .filter(|&i| log_prior[i] > f64::NEG_INFINITY)
        .collect();

    let phase_marginalization = gw.phase_prior.is_some() && !theta.contains("phase");
    let likelihood = gw.build_likelihood(gw.time_marginalization, phase_marginalization, None)?;
    let inside = log_likelihood_multi(likelihood.as_ref(), &theta.take_rows(&within), opts)?;
    let mut log_likelihood = vec![f64::NEG_INFINITY; theta.len()];
    for (&row, ll) in within.iter().zip(inside) {
        log_likelihood[row] = ll;
    }

    let result = importance_weights(&log_prior, &log_likelihood, &log_prob)?;
    log::info!(
        "importance sampling: n_eff = {:.1}, efficiency = {:.2}%, log evidence = {:.3} ± {:.3}",
        result.n_eff,
        100.0 * result.sample_efficiency,
        result.log_evidence,
        result.log_evidence_std
    );
    samples.insert(LOG_PRIOR, log_prior)?;
    samples.insert(LOG_LIKELIHOOD, log_likelihood)?;
    samples.insert(WEIGHTS, result.weights.clone())?;
    Ok((samples, result))
}

/// Draw `n` rows with replacement, proportional to `weights`.
pub fn resample<R: Rng + ?Sized>(
    samples: &SampleTable,
    weights: &[f64],
    n: usize,
    rng: &mut R,
) -> Result<SampleTable> {
    if weights.len() != samples.len() {
        return Err(Error::shape("resampling weights", samples.len(), weights.len()));
    }
    let dist = WeightedIndex::new(weights)
        .map_err(|e| Error::contract(format!("invalid resampling weights: {e}")))?;
    let rows: Vec<usize> = (0..n).map(|_| dist.sample(rng)).collect();
    Ok(samples.take_rows(&rows))
}
