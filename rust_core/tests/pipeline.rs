//! End-to-end runs through the public API: GNPE sampling, synthetic phase,
//! reference-time correction and importance weights.

use gwsampler_core::domain::FrequencyDomain;
use gwsampler_core::geometry::Interferometer;
use gwsampler_core::math::{wrap_two_pi, TWO_PI};
use gwsampler_core::{
    importance_sample, BatchOptions, DensityModel, EventData, EventMetadata, GaussianLikelihoodBuilder,
    GnpeSampler, GwExtension, ModelInput, ModelMetadata, NpeSampler, Parameters, Result, SampleTable,
    Sampler, SamplerSettings, SyntheticPhaseSettings, WaveformModel, LOG_PROB,
};
use ndarray::{Array1, Array2};
use num_complex::Complex64;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};
use std::collections::BTreeMap;
use std::sync::Arc;

const METADATA: &str = r#"{
    "train_settings": {
        "data": {
            "detectors": ["H1", "L1"],
            "ref_time": 1126259462.391,
            "inference_parameters": ["chirp_mass", "ra", "dec", "geocent_time"],
            "context_parameters": ["L1_time_proxy"],
            "standardization": {
                "mean": {"chirp_mass": 30.0, "ra": 3.0, "dec": 0.0,
                         "geocent_time": 0.0, "L1_time_proxy": 0.0},
                "std": {"chirp_mass": 3.0, "ra": 1.0, "dec": 0.3,
                        "geocent_time": 0.01, "L1_time_proxy": 0.01}
            },
            "extrinsic_prior": {
                "ra": "default", "dec": "default", "geocent_time": "default",
                "phase": "default"
            },
            "gnpe_time_shifts": {
                "kernel": {"type": "Uniform", "minimum": -0.001, "maximum": 0.001},
                "exact_equiv": true
            }
        }
    },
    "dataset_settings": {
        "intrinsic_prior": {
            "chirp_mass": {"type": "Uniform", "minimum": 10.0, "maximum": 50.0}
        },
        "domain": {"f_min": 2.0, "f_max": 16.0, "delta_f": 0.25},
        "waveform_generator": {"approximant": "flat"}
    }
}"#;

/// Narrow Gaussian in standardized space.
struct GaussianModel;

impl DensityModel for GaussianModel {
    fn n_parameters(&self) -> usize {
        4
    }

    fn sample_and_log_prob(
        &self,
        _input: &ModelInput,
        num_samples: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Array2<f64>, Array1<f64>)> {
        let theta: Array2<f64> =
            Array2::from_shape_fn((num_samples, 4), |_| StandardNormal.sample(rng));
        let log_prob = theta
            .rows()
            .into_iter()
            .map(|r| -0.5 * r.iter().map(|x| x * x).sum::<f64>() - 2.0 * TWO_PI.ln())
            .collect();
        Ok((theta, log_prob))
    }
}

/// Frequency-flat signal `e^{2iφ}`, identical in every detector.
struct FlatWaveform;

impl WaveformModel for FlatWaveform {
    fn detector_strains(
        &self,
        theta: &Parameters,
        domain: &FrequencyDomain,
        detectors: &[Interferometer],
        _t_ref: f64,
    ) -> Result<BTreeMap<String, Vec<Complex64>>> {
        let phase = theta.get("phase").copied().unwrap_or(0.0);
        let h = vec![Complex64::from_polar(1.0, 2.0 * phase); domain.len()];
        Ok(detectors.iter().map(|d| (d.name.to_string(), h.clone())).collect())
    }
}

fn event(metadata: &ModelMetadata, phase: f64) -> EventData {
    let domain = &metadata.dataset_settings.domain;
    let mut data = EventData::default();
    for det in ["H1", "L1"] {
        data.strain.insert(
            det.to_string(),
            vec![Complex64::from_polar(1.0, 2.0 * phase); domain.len()],
        );
        data.asds.insert(det.to_string(), vec![1.0; domain.len()]);
    }
    data
}

fn extension(metadata: &ModelMetadata, settings: &SamplerSettings) -> GwExtension {
    GwExtension::from_metadata(metadata)
        .unwrap()
        .with_event(event(metadata, 1.0), None)
        .unwrap()
        .with_likelihood_builder(Arc::new(GaussianLikelihoodBuilder::with_waveform(Arc::new(
            FlatWaveform,
        ))))
        .with_settings(settings)
        .unwrap()
}

fn gnpe_sampler(settings: &SamplerSettings, seed: u64) -> GnpeSampler {
    let metadata = ModelMetadata::from_json(METADATA).unwrap();
    let init = NpeSampler::new(
        Arc::new(GaussianModel),
        &metadata,
        extension(&metadata, &SamplerSettings::default()),
        seed + 1,
    )
    .unwrap();
    GnpeSampler::new(
        Arc::new(GaussianModel),
        Box::new(init),
        &metadata,
        extension(&metadata, settings),
        settings,
        seed,
    )
    .unwrap()
}

fn settings(num_processes: usize) -> SamplerSettings {
    let mut synthetic_phase = SyntheticPhaseSettings::new(256, 0.01);
    synthetic_phase.num_processes = num_processes;
    SamplerSettings {
        num_iterations: Some(3),
        synthetic_phase: Some(synthetic_phase),
        time_marginalization: None,
        event_time: Some(1126259462.391 + 600.0),
    }
}

#[test]
fn gnpe_run_is_reproducible_across_worker_counts() {
    let a = gnpe_sampler(&settings(1), 11).sample(120).unwrap();
    let b = gnpe_sampler(&settings(4), 11).sample(120).unwrap();
    assert_eq!(a, b);
    for name in ["chirp_mass", "ra", "dec", "geocent_time", "phase", LOG_PROB] {
        assert!(a.contains(name), "missing column {name}");
    }
    assert_eq!(a.len(), 120);
}

#[test]
fn synthetic_phase_concentrates_at_signal_phase() {
    let out = gnpe_sampler(&settings(2), 5).sample(300).unwrap();
    let phase = out.column("phase").unwrap();
    let log_prob = out.log_prob().unwrap();
    let mut near = 0;
    let mut valid = 0;
    for (p, lp) in phase.iter().zip(log_prob) {
        if !lp.is_finite() {
            continue;
        }
        valid += 1;
        assert!((0.0..=TWO_PI).contains(p));
        // e^{2iφ} symmetry: φ = 1 and φ = 1 + π are equivalent
        let d = wrap_two_pi(2.0 * p - 2.0);
        if d.min(TWO_PI - d) < 0.5 {
            near += 1;
        }
    }
    assert!(valid > 250);
    assert!(near as f64 > 0.9 * valid as f64, "{near} of {valid} rows near the signal phase");
}

#[test]
fn out_of_prior_rows_are_excluded_and_weighted_zero() {
    let metadata = ModelMetadata::from_json(METADATA).unwrap();
    let mut gw = extension(&metadata, &settings(1));
    let samples = SampleTable::from_columns([
        ("chirp_mass", vec![30.0, 75.0, 28.0, 5.0]),
        ("ra", vec![1.0, 2.0, 3.0, 4.0]),
        ("dec", vec![0.1, -0.2, 0.3, 0.0]),
        ("geocent_time", vec![0.0, 0.01, -0.01, 0.0]),
        (LOG_PROB, vec![-2.0; 4]),
    ])
    .unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let processed = gw.post_process(samples, false, &mut rng).unwrap();
    let log_prob = processed.log_prob().unwrap();
    assert_eq!(log_prob[1], f64::NEG_INFINITY);
    assert_eq!(log_prob[3], f64::NEG_INFINITY);
    assert_eq!(processed.column("phase").unwrap()[1], 0.0);

    let (weighted, result) = importance_sample(&gw, processed, BatchOptions::default()).unwrap();
    assert_eq!(result.weights[1], 0.0);
    assert_eq!(result.weights[3], 0.0);
    assert!(result.weights[0] > 0.0 && result.weights[2] > 0.0);
    assert!(result.n_eff <= 2.0 + 1e-9);
    assert_eq!(weighted.column("weights").unwrap(), result.weights.as_slice());
}

#[test]
fn reference_time_correction_round_trips() {
    let metadata = ModelMetadata::from_json(METADATA).unwrap();
    let mut gw = GwExtension::from_metadata(&metadata).unwrap();
    gw.event_metadata = Some(EventMetadata {
        time_event: Some(gw.t_ref + 86_164.0905 / 4.0),
    });
    let samples = SampleTable::from_columns([("ra", vec![0.0, 1.5, 6.0])]).unwrap();
    let forward = gw.correct_reference_time(samples.clone(), false).unwrap();
    // a quarter sidereal day rotates the sky by π/2
    let shift = wrap_two_pi(forward.column("ra").unwrap()[0]);
    assert!((shift - TWO_PI / 4.0).abs() < 1e-3, "shift {shift}");
    let back = gw.correct_reference_time(forward, true).unwrap();
    for (a, b) in back.column("ra").unwrap().iter().zip(samples.column("ra").unwrap()) {
        assert!((a - b).abs() < 1e-9);
    }
}
