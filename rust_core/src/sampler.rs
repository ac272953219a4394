use crate::config::ModelMetadata;
use crate::error::{Error, Result};
use crate::gw::GwExtension;
use crate::model::{checked_sample, DensityModel, ModelInput};
use crate::samples::{SampleTable, LOG_PROB};
use crate::transforms::{
    Compose, InferenceData, RepackageStrainsAndAsds, StandardizeParameters, WhitenAndScaleStrain,
};
use ndarray::Array4;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

/// Draws posterior samples from a density model.
pub trait Sampler {
    /// Samples straight from the model pipeline: inference parameters and
    /// `log_prob`, without post-processing corrections.
    fn run_sampler(&mut self, num_samples: usize) -> Result<SampleTable>;

    /// Corrections applied once after sampling (`inverse` undoes them where
    /// that is meaningful).
    fn post_process(&mut self, samples: SampleTable, inverse: bool) -> Result<SampleTable>;

    fn sample(&mut self, num_samples: usize) -> Result<SampleTable> {
        let samples = self.run_sampler(num_samples)?;
        self.post_process(samples, false)
    }
}

/// Sampler for a plain (non-GNPE) model: one network call per batch.
///
/// Every sampler owns a ChaCha8 stream seeded once at construction, so a run
/// is reproducible from its seed.
pub struct NpeSampler {
    model: Arc<dyn DensityModel>,
    pub gw: GwExtension,
    inference_parameters: Vec<String>,
    pre: Compose,
    post: Compose,
    rng: ChaCha8Rng,
    unconditional: bool,
}

impl NpeSampler {
    pub fn new(
        model: Arc<dyn DensityModel>,
        metadata: &ModelMetadata,
        gw: GwExtension,
        seed: u64,
    ) -> Result<Self> {
        let pre = Compose::new(vec![
            Box::new(WhitenAndScaleStrain {
                scale: gw.domain.noise_std(),
            }),
            Box::new(RepackageStrainsAndAsds {
                detectors: gw.detectors.clone(),
                first_index: gw.domain.min_idx(),
            }),
        ]);
        Self::build(model, metadata, gw, pre, seed, false)
    }

    /// Sampler for a model without conditioning data (e.g. a prior model).
    /// Skips the reference-time correction.
    pub fn unconditional(
        model: Arc<dyn DensityModel>,
        metadata: &ModelMetadata,
        gw: GwExtension,
        seed: u64,
    ) -> Result<Self> {
        Self::build(model, metadata, gw, Compose::default(), seed, true)
    }

    fn build(
        model: Arc<dyn DensityModel>,
        metadata: &ModelMetadata,
        gw: GwExtension,
        pre: Compose,
        seed: u64,
        unconditional: bool,
    ) -> Result<Self> {
        metadata.validate()?;
        let data = metadata.data();
        let inference_parameters = data.inference_parameters.clone();
        if model.n_parameters() != inference_parameters.len() {
            return Err(Error::config(format!(
                "model produces {} parameters but metadata lists {}",
                model.n_parameters(),
                inference_parameters.len()
            )));
        }
        let post = Compose::new(vec![Box::new(StandardizeParameters::new(
            inference_parameters.clone(),
            &data.standardization,
            true,
        )?)]);
        Ok(Self {
            model,
            gw,
            inference_parameters,
            pre,
            post,
            rng: ChaCha8Rng::seed_from_u64(seed),
            unconditional,
        })
    }

    pub fn inference_parameters(&self) -> &[String] {
        &self.inference_parameters
    }

    fn model_input(&mut self) -> Result<ModelInput> {
        if self.unconditional {
            return Ok(ModelInput {
                data: Array4::zeros((1, 0, 0, 0)),
                context: None,
            });
        }
        let event = self
            .gw
            .event_data
            .clone()
            .ok_or_else(|| Error::config("no event data attached to the sampler"))?;
        let data = self.pre.apply(InferenceData::from_event(event), &mut self.rng)?;
        let waveform = data
            .waveform
            .ok_or_else(|| Error::contract("pre-processing produced no network input"))?;
        Ok(ModelInput {
            data: waveform,
            context: None,
        })
    }
}

impl Sampler for NpeSampler {
    fn run_sampler(&mut self, num_samples: usize) -> Result<SampleTable> {
        let input = self.model_input()?;
        let (theta, log_prob) =
            checked_sample(self.model.as_ref(), &input, num_samples, &mut self.rng)?;
        let data = InferenceData {
            network_output: Some(theta),
            log_prob: Some(log_prob.to_vec()),
            ..Default::default()
        };
        let data = self.post.apply(data, &mut self.rng)?;
        let mut samples = data.parameters;
        samples.insert(LOG_PROB, data.log_prob.unwrap_or_default())?;
        Ok(samples)
    }

    fn post_process(&mut self, samples: SampleTable, inverse: bool) -> Result<SampleTable> {
        if self.unconditional {
            if self.gw.synthetic_phase.is_some() {
                self.gw.sample_synthetic_phase(samples, inverse, &mut self.rng)
            } else {
                Ok(samples)
            }
        } else {
            self.gw.post_process(samples, inverse, &mut self.rng)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::METADATA;
    use crate::event::EventMetadata;
    use crate::likelihood::tests::toy_event;
    use approx::assert_relative_eq;
    use ndarray::{Array1, Array2};
    use rand_distr::{Distribution, StandardNormal};

    /// Standard normal in standardized space, ignoring its conditioning.
    pub(crate) struct StandardNormalModel {
        pub n: usize,
    }

    impl DensityModel for StandardNormalModel {
        fn n_parameters(&self) -> usize {
            self.n
        }

        fn sample_and_log_prob(
            &self,
            _input: &ModelInput,
            num_samples: usize,
            rng: &mut ChaCha8Rng,
        ) -> Result<(Array2<f64>, Array1<f64>)> {
            let theta: Array2<f64> =
                Array2::from_shape_fn((num_samples, self.n), |_| StandardNormal.sample(rng));
            let log_prob = theta
                .rows()
                .into_iter()
                .map(|r| {
                    -0.5 * r.iter().map(|x| x * x).sum::<f64>()
                        - 0.5 * self.n as f64 * std::f64::consts::TAU.ln()
                })
                .collect();
            Ok((theta, log_prob))
        }
    }

    fn sampler(seed: u64) -> NpeSampler {
        let metadata = ModelMetadata::from_json(METADATA).unwrap();
        let gw = GwExtension::from_metadata(&metadata)
            .unwrap()
            .with_event(toy_event(&["H1", "L1"], &Default::default()), None)
            .unwrap();
        NpeSampler::new(Arc::new(StandardNormalModel { n: 4 }), &metadata, gw, seed).unwrap()
    }

    #[test]
    fn test_output_columns() {
        let mut s = sampler(0);
        let out = s.sample(50).unwrap();
        assert_eq!(
            out.names(),
            &["chirp_mass", "ra", "dec", "geocent_time", LOG_PROB].map(String::from)
        );
        assert_eq!(out.len(), 50);
    }

    #[test]
    fn test_log_prob_includes_jacobian() {
        let mut s = sampler(1);
        let out = s.run_sampler(1).unwrap();
        let row = out.row(0);
        // standardized coordinates of the draw
        let z = [
            (row["chirp_mass"] - 30.0) / 5.0,
            (row["ra"] - 3.0) / 1.5,
            (row["dec"] - 0.0) / 0.5,
            (row["geocent_time"] - 0.0) / 0.02,
        ];
        let log_n = -0.5 * z.iter().map(|x| x * x).sum::<f64>() - 2.0 * std::f64::consts::TAU.ln();
        let log_jac: f64 = [5.0f64, 1.5, 0.5, 0.02].iter().map(|s| s.ln()).sum();
        assert_relative_eq!(row[LOG_PROB], log_n - log_jac, epsilon = 1e-9);
    }

    #[test]
    fn test_seed_reproducible() {
        let a = sampler(7).sample(20).unwrap();
        let b = sampler(7).sample(20).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrong_parameter_count_rejected() {
        let metadata = ModelMetadata::from_json(METADATA).unwrap();
        let gw = GwExtension::from_metadata(&metadata).unwrap();
        let err = NpeSampler::new(Arc::new(StandardNormalModel { n: 3 }), &metadata, gw, 0)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_unconditional_skips_reference_time() {
        let metadata = ModelMetadata::from_json(METADATA).unwrap();
        let mut gw = GwExtension::from_metadata(&metadata).unwrap();
        gw.event_metadata = Some(EventMetadata {
            time_event: Some(gw.t_ref + 1000.0),
        });
        let mut s =
            NpeSampler::unconditional(Arc::new(StandardNormalModel { n: 4 }), &metadata, gw, 3)
                .unwrap();
        let raw = s.run_sampler(10).unwrap();
        let processed = s.post_process(raw.clone(), false).unwrap();
        assert_eq!(raw, processed);
    }
}
