//! Iterative GNPE sampling.
//!
//! The GNPE model is conditioned on noisy proxies of a few parameters (detector
//! arrival times, chirp mass). Starting from an initial draw, each iteration
//! derives proxies from the previous draw, folds them into the network input
//! and draws again. The loop runs a fixed number of iterations.

use crate::config::{ModelMetadata, SamplerSettings};
use crate::error::{Error, Result};
use crate::geometry::interferometer_list;
use crate::gw::GwExtension;
use crate::model::{checked_sample, DensityModel, ModelInput};
use crate::sampler::Sampler;
use crate::samples::{SampleTable, LOG_PROB};
use crate::transforms::{
    Compose, CopyToExtrinsicParameters, GetDetectorTimes, GnpeChirp, GnpeCoalescenceTimes,
    InferenceData, PostCorrectGeocentTime, RepackageStrainsAndAsds, StandardizeContext,
    StandardizeParameters, TimeShiftStrain, Transform, WhitenAndScaleStrain, GLOBAL_TIME_SHIFT,
};
use ndarray::Array4;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;

pub struct GnpeSampler {
    model: Arc<dyn DensityModel>,
    init_sampler: Box<dyn Sampler + Send>,
    pub gw: GwExtension,
    num_iterations: usize,
    inference_parameters: Vec<String>,
    gnpe_parameters: Vec<String>,
    /// Whitening and packing of the event strain, applied once per run.
    strain_pre: Compose,
    pre: Compose,
    post: Compose,
    detector_times: Option<GetDetectorTimes>,
    rng: ChaCha8Rng,
    /// Proxies that conditioned the final iteration.
    pub last_proxies: Option<SampleTable>,
}

impl GnpeSampler {
    pub fn new(
        model: Arc<dyn DensityModel>,
        init_sampler: Box<dyn Sampler + Send>,
        metadata: &ModelMetadata,
        gw: GwExtension,
        settings: &SamplerSettings,
        seed: u64,
    ) -> Result<Self> {
        metadata.validate()?;
        settings.validate()?;
        let num_iterations = settings.require_num_iterations()?;
        let data = metadata.data();
        if data.gnpe_time_shifts.is_none() && data.gnpe_chirp.is_none() {
            return Err(Error::config(
                "GNPE sampling needs a model trained with time or chirp mass proxies",
            ));
        }
        if model.n_parameters() != data.inference_parameters.len() {
            return Err(Error::config(format!(
                "GNPE model produces {} parameters but metadata lists {}",
                model.n_parameters(),
                data.inference_parameters.len()
            )));
        }

        let ifos = interferometer_list(&data.detectors)?;
        let frequencies = gw.domain.masked_frequencies();

        let mut proxy_transforms: Vec<Box<dyn Transform>> = Vec::new();
        if let Some(time) = &data.gnpe_time_shifts {
            proxy_transforms.push(Box::new(GnpeCoalescenceTimes {
                detectors: data.detectors.clone(),
                kernel: time.kernel.clone(),
                exact_equiv: time.exact_equiv,
            }));
            proxy_transforms.push(Box::new(TimeShiftStrain {
                detectors: data.detectors.clone(),
                frequencies: frequencies.clone(),
            }));
        }
        if let Some(chirp) = &data.gnpe_chirp {
            proxy_transforms.push(Box::new(GnpeChirp {
                kernel: chirp.kernel.clone(),
                frequencies,
            }));
        }
        let produced = Compose::new(proxy_transforms);
        let produced_names = produced.proxy_outputs();
        if let Some(missing) = data
            .context_parameters
            .iter()
            .find(|c| !produced_names.contains(c))
        {
            return Err(Error::config(format!(
                "context parameter `{missing}` is not produced by any proxy transform"
            )));
        }
        let gnpe_parameters = produced.gnpe_input_parameters();
        log::debug!("GNPE parameters: {gnpe_parameters:?}");

        let mut pre: Vec<Box<dyn Transform>> = produced.into_transforms();
        pre.push(Box::new(StandardizeContext::new(
            data.context_parameters.clone(),
            &data.standardization,
        )?));

        let detector_times = GetDetectorTimes::new(ifos, data.ref_time);
        let post = Compose::new(vec![
            Box::new(StandardizeParameters::new(
                data.inference_parameters.clone(),
                &data.standardization,
                true,
            )?),
            Box::new(PostCorrectGeocentTime::default()),
            Box::new(CopyToExtrinsicParameters::new([
                "ra",
                "dec",
                "geocent_time",
                "chirp_mass",
                "mass_ratio",
            ])),
            Box::new(detector_times.clone()),
        ]);

        let strain_pre = Compose::new(vec![
            Box::new(WhitenAndScaleStrain {
                scale: gw.domain.noise_std(),
            }),
            Box::new(RepackageStrainsAndAsds {
                detectors: data.detectors.clone(),
                first_index: gw.domain.min_idx(),
            }),
        ]);

        Ok(Self {
            model,
            init_sampler,
            gw,
            num_iterations,
            inference_parameters: data.inference_parameters.clone(),
            gnpe_parameters,
            strain_pre,
            pre: Compose::new(pre),
            post,
            detector_times: data.gnpe_time_shifts.as_ref().map(|_| detector_times),
            rng: ChaCha8Rng::seed_from_u64(seed),
            last_proxies: None,
        })
    }

    pub fn num_iterations(&self) -> usize {
        self.num_iterations
    }

    /// Parameters the proxies are derived from.
    pub fn gnpe_parameters(&self) -> &[String] {
        &self.gnpe_parameters
    }

    pub fn inference_parameters(&self) -> &[String] {
        &self.inference_parameters
    }

    /// Initial extrinsic table: the init draw, completed with detector times
    /// when the init model does not infer them.
    fn initial_extrinsic(&mut self, num_samples: usize) -> Result<SampleTable> {
        let mut init = self.init_sampler.run_sampler(num_samples)?.parameters();
        if init.len() != num_samples {
            return Err(Error::shape("initial samples", num_samples, init.len()));
        }
        if let Some(dt) = &self.detector_times {
            let missing = self.gnpe_parameters.iter().any(|p| !init.contains(p));
            if missing {
                for (name, times) in dt.detector_times(&init)? {
                    if !init.contains(&name) {
                        init.insert(name, times)?;
                    }
                }
            }
        }
        Ok(init)
    }

    fn packed_strain(&mut self) -> Result<Array4<f64>> {
        let event = self
            .gw
            .event_data
            .clone()
            .ok_or_else(|| Error::config("no event data attached to the sampler"))?;
        self.strain_pre
            .apply(InferenceData::from_event(event), &mut self.rng)?
            .waveform
            .ok_or_else(|| Error::contract("pre-processing produced no network input"))
    }
}

impl Sampler for GnpeSampler {
    fn run_sampler(&mut self, num_samples: usize) -> Result<SampleTable> {
        let strain = self.packed_strain()?;
        let mut extrinsic = self.initial_extrinsic(num_samples)?;
        let mut result: Option<(SampleTable, Vec<f64>)> = None;

        for iteration in 1..=self.num_iterations {
            let data = InferenceData {
                waveform: Some(strain.clone()),
                extrinsic_parameters: extrinsic.select(&self.gnpe_parameters)?,
                ..Default::default()
            };
            let data = self.pre.apply(data, &mut self.rng)?;
            let input = ModelInput {
                data: data
                    .waveform
                    .ok_or_else(|| Error::contract("GNPE pre-processing dropped the strain"))?,
                context: data.context_parameters,
            };
            let (theta, log_prob) =
                checked_sample(self.model.as_ref(), &input, num_samples, &mut self.rng)?;

            let proxies = data.extrinsic_parameters;
            let proxy_names: Vec<String> = proxies
                .names()
                .iter()
                .filter(|n| n.ends_with("_proxy") || n.as_str() == GLOBAL_TIME_SHIFT)
                .cloned()
                .collect();
            self.last_proxies = Some(proxies.select(&proxy_names)?);

            let out = self.post.apply(
                InferenceData {
                    network_output: Some(theta),
                    log_prob: Some(log_prob.to_vec()),
                    extrinsic_parameters: proxies,
                    ..Default::default()
                },
                &mut self.rng,
            )?;
            extrinsic = out.extrinsic_parameters;
            result = Some((out.parameters, out.log_prob.unwrap_or_default()));
            log::debug!("GNPE iteration {iteration}/{} done", self.num_iterations);
        }

        let (mut samples, log_prob) =
            result.ok_or_else(|| Error::config("GNPE sampling requires num_iterations"))?;
        samples.insert(LOG_PROB, log_prob)?;
        Ok(samples)
    }

    fn post_process(&mut self, samples: SampleTable, inverse: bool) -> Result<SampleTable> {
        self.gw.post_process(samples, inverse, &mut self.rng)
    }
}
