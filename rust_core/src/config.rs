use crate::distributions::ProxyKernel;
use crate::domain::{DomainUpdate, FrequencyDomain, WindowSettings};
use crate::error::{Error, Result};
use crate::prior::PriorSetting;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Metadata stored with a trained model (read-only).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelMetadata {
    pub train_settings: TrainSettings,
    pub dataset_settings: DatasetSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainSettings {
    pub data: DataSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DataSettings {
    pub detectors: Vec<String>,
    /// GPS time at which the detector geometry was frozen during training.
    pub ref_time: f64,
    pub inference_parameters: Vec<String>,
    #[serde(default)]
    pub context_parameters: Vec<String>,
    pub standardization: Standardization,
    #[serde(default)]
    pub extrinsic_prior: BTreeMap<String, PriorSetting>,
    #[serde(default)]
    pub window: Option<WindowSettings>,
    #[serde(default)]
    pub domain_update: Option<DomainUpdate>,
    #[serde(default)]
    pub gnpe_time_shifts: Option<GnpeTimeSettings>,
    #[serde(default)]
    pub gnpe_chirp: Option<GnpeChirpSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatasetSettings {
    pub intrinsic_prior: BTreeMap<String, PriorSetting>,
    pub domain: FrequencyDomain,
    /// Passed through untouched to the likelihood builder.
    #[serde(default)]
    pub waveform_generator: serde_json::Value,
}

/// Per-parameter mean and standard deviation used by the network.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Standardization {
    pub mean: BTreeMap<String, f64>,
    pub std: BTreeMap<String, f64>,
}

impl Standardization {
    /// `(mean, std)` for a parameter.
    pub fn get(&self, name: &str) -> Result<(f64, f64)> {
        let mean = self.mean.get(name).copied();
        let std = self.std.get(name).copied();
        match (mean, std) {
            (Some(m), Some(s)) if s > 0.0 && m.is_finite() && s.is_finite() => Ok((m, s)),
            (Some(_), Some(s)) => Err(Error::config(format!(
                "standardization std for `{name}` must be positive, got {s}"
            ))),
            _ => Err(Error::config(format!("no standardization for `{name}`"))),
        }
    }
}

/// Detector-time GNPE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GnpeTimeSettings {
    pub kernel: ProxyKernel,
    /// Condition on proxies relative to the first detector and infer the
    /// global time shift exactly.
    #[serde(default)]
    pub exact_equiv: bool,
}

/// Chirp-mass GNPE.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GnpeChirpSettings {
    pub kernel: ProxyKernel,
    #[serde(default)]
    pub order: u32,
}

impl ModelMetadata {
    pub fn from_json(s: &str) -> Result<Self> {
        let metadata: ModelMetadata = serde_json::from_str(s)?;
        metadata.validate()?;
        Ok(metadata)
    }

    pub fn data(&self) -> &DataSettings {
        &self.train_settings.data
    }

    pub fn validate(&self) -> Result<()> {
        let data = self.data();
        if data.detectors.is_empty() {
            return Err(Error::config("no detectors in model metadata"));
        }
        if data.inference_parameters.is_empty() {
            return Err(Error::config("no inference parameters in model metadata"));
        }
        if !data.ref_time.is_finite() {
            return Err(Error::config("ref_time must be finite"));
        }
        for p in data.inference_parameters.iter().chain(&data.context_parameters) {
            data.standardization.get(p)?;
        }
        if let Some(t) = &data.gnpe_time_shifts {
            t.kernel.validate()?;
        }
        if let Some(c) = &data.gnpe_chirp {
            c.kernel.validate()?;
            if c.order != 0 {
                return Err(Error::config(format!(
                    "chirp heterodyning of order {} is not supported",
                    c.order
                )));
            }
        }
        self.dataset_settings.domain.validate()
    }
}

/// Synthetic phase reconstruction.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyntheticPhaseSettings {
    /// Number of phase grid points in `[0, 2π]`.
    pub n_grid: usize,
    #[serde(default = "default_num_processes")]
    pub num_processes: usize,
    /// Weight of the uniform background mixed into the phase density.
    #[serde(default = "default_uniform_weight")]
    pub uniform_weight: f64,
    /// Treat per-row likelihood failures as invalid rows instead of aborting.
    #[serde(default = "default_true")]
    pub catch_errors: bool,
    #[serde(default)]
    pub progress: bool,
}

fn default_num_processes() -> usize {
    1
}

fn default_uniform_weight() -> f64 {
    0.01
}

fn default_true() -> bool {
    true
}

impl SyntheticPhaseSettings {
    pub fn new(n_grid: usize, uniform_weight: f64) -> Self {
        Self {
            n_grid,
            num_processes: 1,
            uniform_weight,
            catch_errors: true,
            progress: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_grid < 2 {
            return Err(Error::config("synthetic phase n_grid must be at least 2"));
        }
        if !(0.0..1.0).contains(&self.uniform_weight) {
            return Err(Error::config(format!(
                "uniform_weight must lie in [0, 1), got {}",
                self.uniform_weight
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeMarginalizationSettings {
    /// Time grid refinement: `n_fft · n_bins` shifts are evaluated.
    pub n_fft: usize,
}

/// Run settings for a sampler.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamplerSettings {
    /// GNPE iterations; required by GNPE samplers.
    #[serde(default)]
    pub num_iterations: Option<usize>,
    #[serde(default)]
    pub synthetic_phase: Option<SyntheticPhaseSettings>,
    #[serde(default)]
    pub time_marginalization: Option<TimeMarginalizationSettings>,
    /// GPS time of the analyzed event.
    #[serde(default)]
    pub event_time: Option<f64>,
}

impl SamplerSettings {
    pub fn from_json(s: &str) -> Result<Self> {
        let settings: SamplerSettings = serde_json::from_str(s)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(sp) = &self.synthetic_phase {
            sp.validate()?;
        }
        if let Some(tm) = &self.time_marginalization {
            if tm.n_fft == 0 {
                return Err(Error::config("time_marginalization.n_fft must be positive"));
            }
        }
        if let Some(t) = self.event_time {
            if !t.is_finite() {
                return Err(Error::config("event_time must be finite"));
            }
        }
        if self.num_iterations == Some(0) {
            return Err(Error::config("num_iterations must be positive"));
        }
        Ok(())
    }

    /// Iteration count, failing if absent.
    pub fn require_num_iterations(&self) -> Result<usize> {
        self.num_iterations
            .ok_or_else(|| Error::config("GNPE sampling requires num_iterations"))
    }
}
