use crate::config::{ModelMetadata, SamplerSettings, SyntheticPhaseSettings, TimeMarginalizationSettings};
use crate::distributions::PriorComponent;
use crate::domain::FrequencyDomain;
use crate::error::{Error, Result};
use crate::event::{EventData, EventMetadata};
use crate::geometry::sidereal_rotation;
use crate::likelihood::{
    d_inner_h_complex_multi, BatchOptions, Likelihood, LikelihoodBuilder, LikelihoodSettings,
    TimeMarginalization,
};
use crate::math::{wrap_two_pi, TWO_PI};
use crate::prior::{build_prior_with_defaults, PriorDict};
use crate::samples::{SampleTable, LOG_PROB};
use crate::synthetic_phase::sample_synthetic_phase;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use std::time::Instant;

/// GW context injected into a sampler.
#[derive(Clone)]
pub struct GwExtension {
    pub prior: PriorDict,
    /// Split off when `geocent_time` is not inferred (time-marginalized model).
    pub geocent_time_prior: Option<PriorComponent>,
    /// Split off when `phase` is not inferred (phase-marginalized model).
    pub phase_prior: Option<PriorComponent>,
    /// Domain of the training waveforms.
    pub model_domain: FrequencyDomain,
    /// Domain of the analyzed data: updated and carrying the window factor.
    pub domain: FrequencyDomain,
    pub detectors: Vec<String>,
    pub t_ref: f64,
    pub event_metadata: Option<EventMetadata>,
    pub event_data: Option<EventData>,
    pub synthetic_phase: Option<SyntheticPhaseSettings>,
    pub time_marginalization: Option<TimeMarginalizationSettings>,
    waveform_generator: serde_json::Value,
    likelihood_builder: Option<Arc<dyn LikelihoodBuilder>>,
}

impl std::fmt::Debug for GwExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GwExtension")
            .field("prior", &self.prior)
            .field("domain", &self.domain)
            .field("t_ref", &self.t_ref)
            .field("event_metadata", &self.event_metadata)
            .field("synthetic_phase", &self.synthetic_phase)
            .finish_non_exhaustive()
    }
}

impl GwExtension {
    pub fn from_metadata(metadata: &ModelMetadata) -> Result<Self> {
        metadata.validate()?;
        let data = metadata.data();

        let mut prior = build_prior_with_defaults(
            &metadata.dataset_settings.intrinsic_prior,
            &data.extrinsic_prior,
        )?;
        let inferred = |p: &str| data.inference_parameters.iter().any(|q| q == p);
        let geocent_time_prior = if inferred("geocent_time") {
            None
        } else {
            prior.pop("geocent_time")
        };
        let phase_prior = if inferred("phase") {
            None
        } else {
            prior.pop("phase")
        };

        let model_domain = metadata.dataset_settings.domain.clone();
        let mut domain = model_domain.clone();
        if let Some(update) = &data.domain_update {
            domain.update(update)?;
        }
        if let Some(window) = &data.window {
            domain.window_factor = window.window_factor()?;
        }

        Ok(Self {
            prior,
            geocent_time_prior,
            phase_prior,
            model_domain,
            domain,
            detectors: data.detectors.clone(),
            t_ref: data.ref_time,
            event_metadata: None,
            event_data: None,
            synthetic_phase: None,
            time_marginalization: None,
            waveform_generator: metadata.dataset_settings.waveform_generator.clone(),
            likelihood_builder: None,
        })
    }

    /// Attach the analyzed event.
    pub fn with_event(mut self, data: EventData, metadata: Option<EventMetadata>) -> Result<Self> {
        data.validate(&self.detectors, &self.domain)?;
        self.event_data = Some(data);
        if metadata.is_some() {
            self.event_metadata = metadata;
        }
        Ok(self)
    }

    pub fn with_likelihood_builder(mut self, builder: Arc<dyn LikelihoodBuilder>) -> Self {
        self.likelihood_builder = Some(builder);
        self
    }

    /// Take synthetic phase, time marginalization and event time from run settings.
    pub fn with_settings(mut self, settings: &SamplerSettings) -> Result<Self> {
        settings.validate()?;
        self.synthetic_phase = settings.synthetic_phase.clone();
        self.time_marginalization = settings.time_marginalization;
        if let Some(t) = settings.event_time {
            self.event_metadata = Some(EventMetadata {
                time_event: Some(t),
            });
        }
        Ok(self)
    }

    pub fn event_time(&self) -> Option<f64> {
        self.event_metadata.and_then(|m| m.time_event)
    }

    /// Build the likelihood for the attached event.
    ///
    /// Time marginalization needs a split-off uniform `geocent_time` prior, whose
    /// range becomes the marginalization range. Phase marginalization needs a
    /// split-off Uniform[0, 2π) phase prior.
    pub fn build_likelihood(
        &self,
        time_marginalization: Option<TimeMarginalizationSettings>,
        phase_marginalization: bool,
        phase_grid: Option<Vec<f64>>,
    ) -> Result<Box<dyn Likelihood>> {
        let time_marginalization = match time_marginalization {
            None => None,
            Some(tm) => match &self.geocent_time_prior {
                None => {
                    return Err(Error::config(
                        "time marginalization needs a time-marginalized model",
                    ))
                }
                Some(PriorComponent::Uniform { minimum, maximum }) => Some(TimeMarginalization {
                    n_fft: tm.n_fft,
                    t_lower: *minimum,
                    t_upper: *maximum,
                }),
                Some(other) => {
                    return Err(Error::config(format!(
                        "time marginalization needs a uniform geocent_time prior, got {other:?}"
                    )))
                }
            },
        };
        if phase_marginalization {
            self.require_uniform_phase_prior()?;
        }
        let builder = self
            .likelihood_builder
            .as_ref()
            .ok_or_else(|| Error::config("no likelihood builder configured"))?;
        let event_data = self
            .event_data
            .clone()
            .ok_or_else(|| Error::config("no event data attached"))?;

        // samples are already corrected to the event time at this point
        let t_ref = self.event_time().unwrap_or(self.t_ref);
        builder.build(LikelihoodSettings {
            waveform_generator: self.waveform_generator.clone(),
            model_domain: self.model_domain.clone(),
            data_domain: self.domain.clone(),
            detectors: self.detectors.clone(),
            event_data,
            t_ref,
            time_marginalization,
            phase_marginalization,
            phase_grid,
        })
    }

    /// [`Self::prior`] minus the phase component restored by a previous
    /// synthetic-phase pass.
    pub(crate) fn prior_without_phase(&self) -> PriorDict {
        let mut prior = self.prior.clone();
        prior.pop("phase");
        prior
    }

    fn require_uniform_phase_prior(&self) -> Result<()> {
        match &self.phase_prior {
            Some(p) if p.is_uniform_on(0.0, TWO_PI) => Ok(()),
            other => Err(Error::config(format!(
                "phase prior must be Uniform[0, 2π) for a phase-marginalized model, got {other:?}"
            ))),
        }
    }

    /// Rotate `ra` from the reference-time detector frame to the event time
    /// (`inverse` rotates back). No-op without an event time or when it equals
    /// the reference time.
    pub fn correct_reference_time(&self, mut samples: SampleTable, inverse: bool) -> Result<SampleTable> {
        let Some(t_event) = self.event_time() else {
            return Ok(samples);
        };
        if t_event == self.t_ref {
            return Ok(samples);
        }
        let delta = sidereal_rotation(self.t_ref, t_event);
        let delta = if inverse { -delta } else { delta };
        for ra in samples.require_mut("ra")?.iter_mut() {
            *ra = wrap_two_pi(*ra + delta);
        }
        Ok(samples)
    }

    /// Draw a phase for every row and add its log-density to `log_prob`.
    ///
    /// Rows outside the prior (or whose likelihood failed) get phase 0 and
    /// `log_prob = −∞`. Afterwards the phase prior is part of [`Self::prior`].
    pub fn sample_synthetic_phase(
        &mut self,
        mut samples: SampleTable,
        inverse: bool,
        rng: &mut ChaCha8Rng,
    ) -> Result<SampleTable> {
        if inverse {
            return Ok(samples);
        }
        let settings = self
            .synthetic_phase
            .clone()
            .ok_or_else(|| Error::config("synthetic phase is not configured"))?;
        settings.validate()?;
        self.require_uniform_phase_prior()?;
        let start = Instant::now();

        let mut theta = samples.parameters();
        theta.remove("phase");
        let prior = self.prior_without_phase();
        let log_prior = prior.log_prob(&theta)?;
        let constraints = prior.evaluate_constraints(&theta)?;
        let within: Vec<usize> = (0..theta.len())
            .filter(|&i| constraints[i] && log_prior[i] > f64::NEG_INFINITY)
            .collect();

        let likelihood = self.build_likelihood(None, false, None)?;
        let mut inside = theta.take_rows(&within);
        inside.insert("phase", vec![0.0; within.len()])?;
        let d_inner_h = d_inner_h_complex_multi(
            likelihood.as_ref(),
            &inside,
            BatchOptions {
                num_processes: settings.num_processes,
                catch_errors: settings.catch_errors,
                progress: settings.progress,
            },
        )?;
        drop(likelihood);

        let (new_phase, delta_log_prob) = sample_synthetic_phase(&d_inner_h, &settings, rng.gen())?;
        let mut phase = vec![0.0; samples.len()];
        let mut delta = vec![f64::NEG_INFINITY; samples.len()];
        for ((&row, p), lp) in within.iter().zip(new_phase).zip(delta_log_prob) {
            phase[row] = p;
            delta[row] = lp;
        }
        samples.insert("phase", phase)?;
        let log_prob = samples.require_mut(LOG_PROB)?;
        for (l, d) in log_prob.iter_mut().zip(delta) {
            *l += d;
        }

        if let Some(p) = &self.phase_prior {
            self.prior.insert("phase", p.clone());
        }
        log::info!(
            "sampled synthetic phase for {} of {} rows in {:.2}s",
            within.len(),
            samples.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(samples)
    }

    /// Reference-time correction followed, if configured, by synthetic phase.
    pub fn post_process(
        &mut self,
        samples: SampleTable,
        inverse: bool,
        rng: &mut ChaCha8Rng,
    ) -> Result<SampleTable> {
        let samples = self.correct_reference_time(samples, inverse)?;
        if self.synthetic_phase.is_some() {
            self.sample_synthetic_phase(samples, inverse, rng)
        } else {
            Ok(samples)
        }
    }
}
