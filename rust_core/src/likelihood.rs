use crate::domain::FrequencyDomain;
use crate::error::{Error, Result};
use crate::event::EventData;
use crate::geometry::{interferometer_list, Interferometer};
use crate::math::{log_i0, logsumexp};
use crate::parallel::map_rows;
use crate::progress::ProgressGuard;
use crate::samples::{Parameters, SampleTable};
use num_complex::Complex64;
use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::Arc;

/// Per-row likelihood oracle.
pub trait Likelihood: Send + Sync {
    /// Complex inner product `<d, h(θ)>`, summed over detectors.
    fn d_inner_h_complex(&self, theta: &Parameters) -> Result<Complex64>;

    fn log_likelihood(&self, theta: &Parameters) -> Result<f64>;
}

/// Frequency-domain signal model projected onto detectors.
pub trait WaveformModel: Send + Sync {
    /// Strain per detector on `domain.sample_frequencies()`, projected with
    /// the detector geometry at GPS time `t_ref`; `geocent_time` in `theta` is
    /// an offset from it. Failures for specific parameters are reported as
    /// [`Error::PhysicsEvaluation`].
    fn detector_strains(
        &self,
        theta: &Parameters,
        domain: &FrequencyDomain,
        detectors: &[Interferometer],
        t_ref: f64,
    ) -> Result<BTreeMap<String, Vec<Complex64>>>;
}

/// Time marginalization over a uniform time-shift grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeMarginalization {
    pub n_fft: usize,
    pub t_lower: f64,
    pub t_upper: f64,
}

/// Everything a likelihood builder is given.
#[derive(Debug, Clone)]
pub struct LikelihoodSettings {
    pub waveform_generator: serde_json::Value,
    /// Domain the model was trained on; waveforms are generated here.
    pub model_domain: FrequencyDomain,
    /// Domain of the analyzed data (after updates and windowing).
    pub data_domain: FrequencyDomain,
    pub detectors: Vec<String>,
    pub event_data: EventData,
    /// Detector geometry reference time.
    pub t_ref: f64,
    pub time_marginalization: Option<TimeMarginalization>,
    pub phase_marginalization: bool,
    /// Phase grid replacing the analytic phase marginalization.
    pub phase_grid: Option<Vec<f64>>,
}

pub trait LikelihoodBuilder: Send + Sync {
    fn build(&self, settings: LikelihoodSettings) -> Result<Box<dyn Likelihood>>;
}

// ── Stationary Gaussian noise ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum PhaseMarginalization {
    Analytic,
    Grid(Vec<f64>),
}

/// Gaussian likelihood for stationary noise described by per-detector ASDs.
pub struct StationaryGaussianLikelihood {
    waveform: Arc<dyn WaveformModel>,
    model_domain: FrequencyDomain,
    data_domain: FrequencyDomain,
    detectors: Vec<Interferometer>,
    data: EventData,
    /// `4 Δf / (window_factor · asd²)` per detector and bin; zero below `f_min`.
    weights: BTreeMap<String, Vec<f64>>,
    /// `−½ <d, d>`
    log_noise_evidence: f64,
    time_shifts: Option<Vec<f64>>,
    phase: Option<PhaseMarginalization>,
    t_ref: f64,
}

impl StationaryGaussianLikelihood {
    pub fn new(waveform: Arc<dyn WaveformModel>, settings: LikelihoodSettings) -> Result<Self> {
        let data_domain = settings.data_domain;
        let detectors = interferometer_list(&settings.detectors)?;
        settings.event_data.validate(&settings.detectors, &data_domain)?;
        if data_domain.len() > settings.model_domain.len()
            || data_domain.delta_f != settings.model_domain.delta_f
        {
            return Err(Error::config(
                "data domain must be a truncation of the model domain",
            ));
        }

        let norm = 4.0 * data_domain.delta_f / data_domain.window_factor;
        let min_idx = data_domain.min_idx();
        let weights: BTreeMap<String, Vec<f64>> = settings
            .event_data
            .asds
            .iter()
            .filter(|(det, _)| settings.detectors.contains(det))
            .map(|(det, asd)| {
                let w = asd
                    .iter()
                    .enumerate()
                    .map(|(k, a)| if k < min_idx { 0.0 } else { norm / (a * a) })
                    .collect();
                (det.clone(), w)
            })
            .collect();

        let mut d_inner_d = 0.0;
        for (det, strain) in &settings.event_data.strain {
            if let Some(w) = weights.get(det) {
                d_inner_d += strain.iter().zip(w).map(|(d, w)| d.norm_sqr() * w).sum::<f64>();
            }
        }

        let time_shifts = match settings.time_marginalization {
            Some(tm) => {
                if tm.n_fft == 0 || !(tm.t_lower < tm.t_upper) {
                    return Err(Error::config(format!(
                        "invalid time marginalization settings {tm:?}"
                    )));
                }
                let n = tm.n_fft * data_domain.len();
                let step = (tm.t_upper - tm.t_lower) / n as f64;
                Some((0..n).map(|j| tm.t_lower + (j as f64 + 0.5) * step).collect())
            }
            None => None,
        };
        let phase = match (settings.phase_marginalization, settings.phase_grid) {
            (false, None) => None,
            (_, Some(grid)) if grid.is_empty() => {
                return Err(Error::config("phase grid is empty"));
            }
            (_, Some(grid)) => Some(PhaseMarginalization::Grid(grid)),
            (true, None) => Some(PhaseMarginalization::Analytic),
        };

        log::debug!(
            "built stationary Gaussian likelihood: {} detectors, {} bins, time marginalization: {}, phase marginalization: {}",
            detectors.len(),
            data_domain.len(),
            time_shifts.is_some(),
            phase.is_some()
        );

        Ok(Self {
            waveform,
            model_domain: settings.model_domain,
            data_domain,
            detectors,
            data: settings.event_data,
            weights,
            log_noise_evidence: -0.5 * d_inner_d,
            time_shifts,
            phase,
            t_ref: settings.t_ref,
        })
    }

    /// Signal on the data domain.
    fn signal(&self, theta: &Parameters) -> Result<BTreeMap<String, Vec<Complex64>>> {
        let mut strains =
            self.waveform
                .detector_strains(theta, &self.model_domain, &self.detectors, self.t_ref)?;
        let n = self.data_domain.len();
        for ifo in &self.detectors {
            let h = strains.get_mut(ifo.name).ok_or_else(|| {
                Error::contract(format!("waveform model returned no strain for {}", ifo.name))
            })?;
            if h.len() < n {
                return Err(Error::shape(format!("{} waveform", ifo.name), n, h.len()));
            }
            h.truncate(n);
        }
        Ok(strains)
    }

    /// Per-bin `d · conj(h) · w`, summed over detectors, and `<h, h>`.
    fn overlap_terms(&self, h: &BTreeMap<String, Vec<Complex64>>) -> (Vec<Complex64>, f64) {
        let mut per_bin = vec![Complex64::new(0.0, 0.0); self.data_domain.len()];
        let mut h_inner_h = 0.0;
        for ifo in &self.detectors {
            let (Some(d), Some(h), Some(w)) = (
                self.data.strain.get(ifo.name),
                h.get(ifo.name),
                self.weights.get(ifo.name),
            ) else {
                continue;
            };
            for (k, acc) in per_bin.iter_mut().enumerate() {
                *acc += d[k] * h[k].conj() * w[k];
                h_inner_h += h[k].norm_sqr() * w[k];
            }
        }
        (per_bin, h_inner_h)
    }

    /// Log-likelihood contribution of `<d, h>` given the phase treatment.
    fn overlap_term(&self, d_inner_h: Complex64) -> f64 {
        match &self.phase {
            None => d_inner_h.re,
            Some(PhaseMarginalization::Analytic) => log_i0(d_inner_h.norm()),
            Some(PhaseMarginalization::Grid(grid)) => {
                let terms: Vec<f64> = grid
                    .iter()
                    .map(|phi| (d_inner_h * Complex64::from_polar(1.0, -2.0 * phi)).re)
                    .collect();
                logsumexp(&terms) - (grid.len() as f64).ln()
            }
        }
    }
}

impl Likelihood for StationaryGaussianLikelihood {
    fn d_inner_h_complex(&self, theta: &Parameters) -> Result<Complex64> {
        let h = self.signal(theta)?;
        let (per_bin, _) = self.overlap_terms(&h);
        Ok(per_bin.iter().sum())
    }

    fn log_likelihood(&self, theta: &Parameters) -> Result<f64> {
        let Some(shifts) = &self.time_shifts else {
            let h = self.signal(theta)?;
            let (per_bin, h_inner_h) = self.overlap_terms(&h);
            let d_inner_h: Complex64 = per_bin.iter().sum();
            return Ok(self.log_noise_evidence - 0.5 * h_inner_h + self.overlap_term(d_inner_h));
        };

        // signal at geocent_time = 0, then shifted over the grid
        let mut theta = theta.clone();
        theta.insert("geocent_time".to_string(), 0.0);
        let h = self.signal(&theta)?;
        let (per_bin, h_inner_h) = self.overlap_terms(&h);
        let freqs = self.data_domain.sample_frequencies();
        let terms: Vec<f64> = shifts
            .iter()
            .map(|&dt| {
                // <d, h·e^{−2πi f dt}> = Σ d·conj(h)·w·e^{+2πi f dt}
                let z: Complex64 = per_bin
                    .iter()
                    .zip(&freqs)
                    .map(|(c, f)| c * Complex64::from_polar(1.0, 2.0 * PI * f * dt))
                    .sum();
                self.overlap_term(z)
            })
            .collect();
        Ok(self.log_noise_evidence - 0.5 * h_inner_h + logsumexp(&terms)
            - (shifts.len() as f64).ln())
    }
}

/// Builds [`StationaryGaussianLikelihood`]s around a waveform model chosen
/// from the `waveform_generator` settings.
pub struct GaussianLikelihoodBuilder {
    factory: Box<dyn Fn(&serde_json::Value) -> Result<Arc<dyn WaveformModel>> + Send + Sync>,
}

impl GaussianLikelihoodBuilder {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn WaveformModel>> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
        }
    }

    /// Builder that ignores the settings and always uses `waveform`.
    pub fn with_waveform(waveform: Arc<dyn WaveformModel>) -> Self {
        Self::new(move |_| Ok(Arc::clone(&waveform)))
    }
}

impl LikelihoodBuilder for GaussianLikelihoodBuilder {
    fn build(&self, settings: LikelihoodSettings) -> Result<Box<dyn Likelihood>> {
        let waveform = (self.factory)(&settings.waveform_generator)?;
        Ok(Box::new(StationaryGaussianLikelihood::new(waveform, settings)?))
    }
}

// ── Batched evaluation ──────────────────────────────────────────────

/// Options for batched per-row evaluation.
#[derive(Debug, Clone, Copy)]
pub struct BatchOptions {
    pub num_processes: usize,
    /// Report physics failures as NaN instead of aborting.
    pub catch_errors: bool,
    pub progress: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            num_processes: 1,
            catch_errors: true,
            progress: false,
        }
    }
}

fn evaluate_rows<T, F>(
    label: &'static str,
    theta: &SampleTable,
    opts: BatchOptions,
    failed: T,
    f: F,
) -> Result<Vec<T>>
where
    T: Send + Copy,
    F: Fn(&Parameters) -> Result<T> + Sync + Send,
{
    let guard = ProgressGuard::start(label, theta.len(), opts.progress);
    let state = &guard.state;
    let results = map_rows(theta.len(), opts.num_processes, |i| {
        let out = f(&theta.row(i));
        if out.is_err() {
            state.add_failure();
        }
        state.increment();
        out
    })?;
    drop(guard);

    let mut values = Vec::with_capacity(results.len());
    let mut failures: Vec<usize> = Vec::new();
    let mut first_failure: Option<Error> = None;
    for (i, r) in results.into_iter().enumerate() {
        match r {
            Ok(v) => values.push(v),
            Err(Error::PhysicsEvaluation(msg)) if opts.catch_errors => {
                failures.push(i);
                if first_failure.is_none() {
                    first_failure = Some(Error::PhysicsEvaluation(msg));
                }
                values.push(failed);
            }
            Err(e) => return Err(e),
        }
    }
    if let (Some(&row), Some(err)) = (failures.first(), first_failure) {
        log::warn!(
            "{label}: {} of {} evaluations failed and were set to NaN ({err}); example parameters: {:?}",
            failures.len(),
            theta.len(),
            theta.row(row)
        );
    }
    Ok(values)
}

/// `<d, h>` for every row of `theta`; caught failures give `NaN + NaN i`.
pub fn d_inner_h_complex_multi(
    likelihood: &dyn Likelihood,
    theta: &SampleTable,
    opts: BatchOptions,
) -> Result<Vec<Complex64>> {
    evaluate_rows(
        "d_inner_h",
        theta,
        opts,
        Complex64::new(f64::NAN, f64::NAN),
        |row| likelihood.d_inner_h_complex(row),
    )
}

/// Log-likelihood for every row of `theta`; caught failures give `NaN`.
pub fn log_likelihood_multi(
    likelihood: &dyn Likelihood,
    theta: &SampleTable,
    opts: BatchOptions,
) -> Result<Vec<f64>> {
    evaluate_rows("log_likelihood", theta, opts, f64::NAN, |row| {
        likelihood.log_likelihood(row)
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Toy signal `A e^{2iφ} e^{−2πi f (t_c + Δt)}`, flat in frequency, with
    /// `Δt` the detector delay when `ra` and `dec` are given. Fails for
    /// negative amplitude.
    pub(crate) struct ToyWaveform;

    impl WaveformModel for ToyWaveform {
        fn detector_strains(
            &self,
            theta: &Parameters,
            domain: &FrequencyDomain,
            detectors: &[Interferometer],
            t_ref: f64,
        ) -> Result<BTreeMap<String, Vec<Complex64>>> {
            let amp = theta.get("amplitude").copied().unwrap_or(1.0);
            if amp < 0.0 {
                return Err(Error::PhysicsEvaluation(format!("negative amplitude {amp}")));
            }
            let phase = theta.get("phase").copied().unwrap_or(0.0);
            let tc = theta.get("geocent_time").copied().unwrap_or(0.0);
            let freqs = domain.sample_frequencies();
            let strains = detectors
                .iter()
                .map(|ifo| {
                    let delay = match (theta.get("ra"), theta.get("dec")) {
                        (Some(&ra), Some(&dec)) => ifo.time_delay_from_geocenter(ra, dec, t_ref),
                        _ => 0.0,
                    };
                    let h = freqs
                        .iter()
                        .map(|f| {
                            Complex64::from_polar(amp, 2.0 * phase)
                                * FrequencyDomain::time_translation(*f, tc + delay)
                        })
                        .collect();
                    (ifo.name.to_string(), h)
                })
                .collect();
            Ok(strains)
        }
    }

    pub(crate) const TOY_T_REF: f64 = 1e9;

    pub(crate) fn toy_domain() -> FrequencyDomain {
        FrequencyDomain::new(2.0, 16.0, 0.25).unwrap()
    }

    /// Event data equal to the toy signal at the given parameters, unit ASD.
    pub(crate) fn toy_event(detectors: &[&str], theta: &Parameters) -> EventData {
        let domain = toy_domain();
        let ifos = interferometer_list(detectors).unwrap();
        let strain = ToyWaveform
            .detector_strains(theta, &domain, &ifos, TOY_T_REF)
            .unwrap();
        let asds = detectors
            .iter()
            .map(|d| (d.to_string(), vec![1.0; domain.len()]))
            .collect();
        EventData { strain, asds }
    }

    fn settings(theta: &Parameters) -> LikelihoodSettings {
        LikelihoodSettings {
            waveform_generator: serde_json::json!({"approximant": "toy"}),
            model_domain: toy_domain(),
            data_domain: toy_domain(),
            detectors: vec!["H1".into()],
            event_data: toy_event(&["H1"], theta),
            t_ref: TOY_T_REF,
            time_marginalization: None,
            phase_marginalization: false,
            phase_grid: None,
        }
    }

    fn params(pairs: &[(&str, f64)]) -> Parameters {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_exact_signal_maximizes_likelihood() {
        let truth = params(&[("amplitude", 0.3), ("phase", 0.4)]);
        let lik = StationaryGaussianLikelihood::new(Arc::new(ToyWaveform), settings(&truth)).unwrap();
        let at_truth = lik.log_likelihood(&truth).unwrap();
        assert_relative_eq!(at_truth, 0.0, epsilon = 1e-10);
        let off = lik.log_likelihood(&params(&[("amplitude", 0.3), ("phase", 0.9)])).unwrap();
        assert!(off < at_truth);
    }

    #[test]
    fn test_detector_geometry_follows_reference_time() {
        let truth = params(&[("amplitude", 0.3), ("ra", 1.0), ("dec", 0.4)]);
        let at_ref = StationaryGaussianLikelihood::new(Arc::new(ToyWaveform), settings(&truth)).unwrap();
        let mut s = settings(&truth);
        s.t_ref += 6.0 * 3600.0;
        let later = StationaryGaussianLikelihood::new(Arc::new(ToyWaveform), s).unwrap();

        let h1 = Interferometer::by_name("H1").unwrap();
        let shift = h1.time_delay_from_geocenter(1.0, 0.4, TOY_T_REF + 6.0 * 3600.0)
            - h1.time_delay_from_geocenter(1.0, 0.4, TOY_T_REF);
        assert!(shift.abs() > 1e-4, "delay shift {shift}");

        let l_ref = at_ref.log_likelihood(&truth).unwrap();
        assert_relative_eq!(l_ref, 0.0, epsilon = 1e-10);
        assert!(later.log_likelihood(&truth).unwrap() < l_ref - 1e-6);
        // the event-frame data are matched exactly once the signal is shifted back
        let mut shifted = truth.clone();
        shifted.insert("geocent_time".to_string(), -shift);
        assert_relative_eq!(later.log_likelihood(&shifted).unwrap(), 0.0, epsilon = 1e-8);
    }

    #[test]
    fn test_inner_product_phase_dependence() {
        let truth = params(&[("amplitude", 0.3), ("phase", 0.4)]);
        let lik = StationaryGaussianLikelihood::new(Arc::new(ToyWaveform), settings(&truth)).unwrap();
        let dh = lik.d_inner_h_complex(&params(&[("amplitude", 0.3), ("phase", 0.0)])).unwrap();
        // <d, h(φ=0)> carries the phase of d: e^{2i·0.4}
        assert_relative_eq!(dh.arg(), 0.8, epsilon = 1e-10);
        // 57 bins above f_min, 4 Δf = 1, |A|² = 0.09
        assert_relative_eq!(dh.norm(), 0.09 * 57.0, epsilon = 1e-10);
    }

    #[test]
    fn test_phase_grid_approaches_analytic() {
        let truth = params(&[("amplitude", 0.1), ("phase", 0.4)]);
        let mut s = settings(&truth);
        s.phase_marginalization = true;
        let analytic = StationaryGaussianLikelihood::new(Arc::new(ToyWaveform), s.clone()).unwrap();
        s.phase_grid = Some(crate::kde::linspace(0.0, PI, 2001)[..2000].to_vec());
        let grid = StationaryGaussianLikelihood::new(Arc::new(ToyWaveform), s).unwrap();
        let theta = params(&[("amplitude", 0.1)]);
        assert_relative_eq!(
            analytic.log_likelihood(&theta).unwrap(),
            grid.log_likelihood(&theta).unwrap(),
            epsilon = 1e-4
        );
    }

    #[test]
    fn test_time_marginalization_finite() {
        let truth = params(&[("amplitude", 0.2), ("geocent_time", 0.01)]);
        let mut s = settings(&truth);
        s.time_marginalization = Some(TimeMarginalization {
            n_fft: 2,
            t_lower: -0.1,
            t_upper: 0.1,
        });
        let lik = StationaryGaussianLikelihood::new(Arc::new(ToyWaveform), s).unwrap();
        let l = lik.log_likelihood(&params(&[("amplitude", 0.2)])).unwrap();
        assert!(l.is_finite());
        assert!(l <= 0.0);
    }

    #[test]
    fn test_batch_catches_physics_failures() {
        let truth = params(&[("amplitude", 0.3)]);
        let lik = StationaryGaussianLikelihood::new(Arc::new(ToyWaveform), settings(&truth)).unwrap();
        let table = SampleTable::from_columns([("amplitude", vec![0.3, -1.0, 0.2])]).unwrap();
        let out = log_likelihood_multi(&lik, &table, BatchOptions::default()).unwrap();
        assert!(out[0].is_finite() && out[1].is_nan() && out[2].is_finite());

        let strict = BatchOptions {
            catch_errors: false,
            ..Default::default()
        };
        assert!(matches!(
            d_inner_h_complex_multi(&lik, &table, strict),
            Err(Error::PhysicsEvaluation(_))
        ));
    }

    #[test]
    fn test_batch_independent_of_workers() {
        let truth = params(&[("amplitude", 0.3)]);
        let lik = StationaryGaussianLikelihood::new(Arc::new(ToyWaveform), settings(&truth)).unwrap();
        let table = SampleTable::from_columns([
            ("amplitude", (0..20).map(|i| 0.05 * i as f64).collect::<Vec<_>>()),
        ])
        .unwrap();
        let serial = d_inner_h_complex_multi(&lik, &table, BatchOptions::default()).unwrap();
        let pooled = d_inner_h_complex_multi(
            &lik,
            &table,
            BatchOptions {
                num_processes: 3,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(serial, pooled);
    }
}
