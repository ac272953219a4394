pub mod config;
pub mod distributions;
pub mod domain;
pub mod error;
pub mod event;
pub mod geometry;
pub mod gnpe;
pub mod gw;
pub mod importance;
pub mod kde;
pub mod likelihood;
pub mod math;
pub mod model;
mod parallel;
pub mod prior;
pub mod progress;
pub mod sampler;
pub mod samples;
pub mod synthetic_phase;
pub mod transforms;

pub use config::{ModelMetadata, SamplerSettings, SyntheticPhaseSettings, TimeMarginalizationSettings};
pub use error::{Error, Result};
pub use event::{EventData, EventMetadata};
pub use gnpe::GnpeSampler;
pub use gw::GwExtension;
pub use importance::{importance_sample, importance_weights, resample, ImportanceSamplingResult};
pub use kde::{GridDensity, KernelDensityEngine, Support};
pub use likelihood::{
    BatchOptions, GaussianLikelihoodBuilder, Likelihood, LikelihoodBuilder, LikelihoodSettings,
    WaveformModel,
};
pub use model::{DensityModel, ModelInput};
pub use sampler::{NpeSampler, Sampler};
pub use samples::{Parameters, SampleTable, LOG_PROB};

// Future: heterodyning the chirp phase beyond leading (Newtonian) order.
