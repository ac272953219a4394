//! Composable transforms applied around the density model.
//!
//! A transform consumes an [`InferenceData`] payload and returns the next one.
//! Pipelines are built once per sampler and applied left to right; which
//! transforms are present is decided at construction, never per call.

use crate::config::Standardization;
use crate::distributions::ProxyKernel;
use crate::domain::FrequencyDomain;
use crate::error::{Error, Result};
use crate::event::EventData;
use crate::geometry::Interferometer;
use crate::samples::SampleTable;
use ndarray::{Array2, Array4, Axis};
use num_complex::Complex64;
use rand_chacha::ChaCha8Rng;
use std::f64::consts::PI;
use std::fmt;

/// Solar mass in seconds, `G M_sun / c^3`.
const MTSUN_SI: f64 = 4.925_491_025_543_576e-6;

/// Name of the extrinsic column holding the exact-equivariance time shift.
pub const GLOBAL_TIME_SHIFT: &str = "global_time_shift";

/// Payload passed through a pipeline.
#[derive(Debug, Clone, Default)]
pub struct InferenceData {
    /// Per-detector strain before packing.
    pub strain: Option<EventData>,
    /// Packed network input, `[batch, detector, (re, im, asd), bin]`.
    pub waveform: Option<Array4<f64>>,
    /// Physical parameter values.
    pub parameters: SampleTable,
    /// Parameters used to derive proxies, plus the proxies themselves.
    pub extrinsic_parameters: SampleTable,
    /// Standardized proxies fed to the network.
    pub context_parameters: Option<Array2<f64>>,
    /// Standardized network samples.
    pub network_output: Option<Array2<f64>>,
    pub log_prob: Option<Vec<f64>>,
}

impl InferenceData {
    pub fn from_event(event: EventData) -> Self {
        Self {
            strain: Some(event),
            ..Default::default()
        }
    }

    fn require_waveform(&self, by: &str) -> Result<&Array4<f64>> {
        self.waveform
            .as_ref()
            .ok_or_else(|| Error::contract(format!("{by} needs a packed waveform")))
    }
}

pub trait Transform: Send + Sync + fmt::Debug {
    fn apply(&self, data: InferenceData, rng: &mut ChaCha8Rng) -> Result<InferenceData>;

    /// Transform undoing this one, if it exists.
    fn inverse(&self) -> Option<Box<dyn Transform>> {
        None
    }

    /// Parameters a GNPE transform derives its proxies from.
    fn gnpe_input_parameters(&self) -> Vec<String> {
        Vec::new()
    }

    /// Proxy names this transform writes into the extrinsic table.
    fn proxy_outputs(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Left-to-right composition of transforms.
#[derive(Debug, Default)]
pub struct Compose {
    transforms: Vec<Box<dyn Transform>>,
}

impl Compose {
    pub fn new(transforms: Vec<Box<dyn Transform>>) -> Self {
        Self { transforms }
    }

    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    pub fn into_transforms(self) -> Vec<Box<dyn Transform>> {
        self.transforms
    }

    pub fn apply(&self, mut data: InferenceData, rng: &mut ChaCha8Rng) -> Result<InferenceData> {
        for t in &self.transforms {
            data = t.apply(data, rng)?;
        }
        Ok(data)
    }

    /// Inverse pipeline: inverted transforms in reverse order.
    pub fn inverse(&self) -> Result<Compose> {
        let transforms = self
            .transforms
            .iter()
            .rev()
            .map(|t| {
                t.inverse()
                    .ok_or_else(|| Error::contract(format!("{t:?} has no inverse")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Compose { transforms })
    }

    pub fn gnpe_input_parameters(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for p in self.transforms.iter().flat_map(|t| t.gnpe_input_parameters()) {
            if !out.contains(&p) {
                out.push(p);
            }
        }
        out
    }

    pub fn proxy_outputs(&self) -> Vec<String> {
        self.transforms.iter().flat_map(|t| t.proxy_outputs()).collect()
    }
}

// ── Strain preprocessing ────────────────────────────────────────────

/// Whiten strain by its ASD and scale to unit noise per bin.
#[derive(Debug, Clone)]
pub struct WhitenAndScaleStrain {
    pub scale: f64,
}

impl Transform for WhitenAndScaleStrain {
    fn apply(&self, mut data: InferenceData, _rng: &mut ChaCha8Rng) -> Result<InferenceData> {
        let event = data
            .strain
            .as_mut()
            .ok_or_else(|| Error::contract("WhitenAndScaleStrain needs strain"))?;
        for (det, strain) in event.strain.iter_mut() {
            let asd = event
                .asds
                .get(det)
                .ok_or_else(|| Error::contract(format!("no ASD for detector {det}")))?;
            if asd.len() != strain.len() {
                return Err(Error::shape(format!("{det} ASD"), strain.len(), asd.len()));
            }
            for (s, a) in strain.iter_mut().zip(asd) {
                *s /= a * self.scale;
            }
        }
        Ok(data)
    }
}

/// Pack detectors into `[1, n_det, 3, n_bins]` starting at `first_index`:
/// real part, imaginary part and `1 / (asd · 1e23)`.
#[derive(Debug, Clone)]
pub struct RepackageStrainsAndAsds {
    pub detectors: Vec<String>,
    pub first_index: usize,
}

impl Transform for RepackageStrainsAndAsds {
    fn apply(&self, mut data: InferenceData, _rng: &mut ChaCha8Rng) -> Result<InferenceData> {
        let event = data
            .strain
            .take()
            .ok_or_else(|| Error::contract("RepackageStrainsAndAsds needs strain"))?;
        let mut packed: Option<Array4<f64>> = None;
        for (d, det) in self.detectors.iter().enumerate() {
            let strain = event
                .strain
                .get(det)
                .ok_or_else(|| Error::contract(format!("no strain for detector {det}")))?;
            let asd = event
                .asds
                .get(det)
                .ok_or_else(|| Error::contract(format!("no ASD for detector {det}")))?;
            if strain.len() <= self.first_index || asd.len() != strain.len() {
                return Err(Error::shape(format!("{det} strain"), asd.len(), strain.len()));
            }
            let n_bins = strain.len() - self.first_index;
            let arr = packed.get_or_insert_with(|| {
                Array4::zeros((1, self.detectors.len(), 3, n_bins))
            });
            if arr.shape()[3] != n_bins {
                return Err(Error::shape(format!("{det} strain bins"), arr.shape()[3], n_bins));
            }
            for k in 0..n_bins {
                let s = strain[self.first_index + k];
                arr[[0, d, 0, k]] = s.re;
                arr[[0, d, 1, k]] = s.im;
                arr[[0, d, 2, k]] = 1.0 / (asd[self.first_index + k] * 1e23);
            }
        }
        data.waveform = Some(packed.ok_or_else(|| Error::config("no detectors to package"))?);
        Ok(data)
    }
}

/// Multiply the (re, im) channels of one row/detector by a phase factor per bin.
fn rotate_channels(
    out: &mut Array4<f64>,
    src: &Array4<f64>,
    row: usize,
    src_row: usize,
    det: usize,
    factor: impl Fn(usize) -> Complex64,
) {
    for k in 0..src.shape()[3] {
        let z = Complex64::new(src[[src_row, det, 0, k]], src[[src_row, det, 1, k]]) * factor(k);
        out[[row, det, 0, k]] = z.re;
        out[[row, det, 1, k]] = z.im;
        out[[row, det, 2, k]] = src[[src_row, det, 2, k]];
    }
}

/// Broadcast a single-row waveform to `n` rows (or check it already has `n`).
fn rows_for(waveform: &Array4<f64>, n: usize, by: &str) -> Result<Vec<usize>> {
    match waveform.shape()[0] {
        1 => Ok(vec![0; n]),
        m if m == n => Ok((0..n).collect()),
        m => Err(Error::shape(format!("{by} waveform rows"), n, m)),
    }
}

// ── GNPE proxies ────────────────────────────────────────────────────

/// Proxies for the per-detector arrival times.
///
/// `<ifo>_time_proxy = <ifo>_time + κ`. With exact equivariance the first
/// detector's proxy is subtracted from all of them and stored as
/// [`GLOBAL_TIME_SHIFT`]; the first (identically zero) proxy is then not a
/// context parameter.
#[derive(Debug, Clone)]
pub struct GnpeCoalescenceTimes {
    pub detectors: Vec<String>,
    pub kernel: ProxyKernel,
    pub exact_equiv: bool,
}

impl GnpeCoalescenceTimes {
    fn time_label(det: &str) -> String {
        format!("{det}_time")
    }

    fn proxy_label(det: &str) -> String {
        format!("{det}_time_proxy")
    }
}

impl Transform for GnpeCoalescenceTimes {
    fn apply(&self, mut data: InferenceData, rng: &mut ChaCha8Rng) -> Result<InferenceData> {
        let ext = &mut data.extrinsic_parameters;
        let n = ext.len();
        let mut proxies = Vec::with_capacity(self.detectors.len());
        for det in &self.detectors {
            let times = ext.require(&Self::time_label(det))?;
            let blur = self.kernel.sample_n(n, rng)?;
            proxies.push(times.iter().zip(blur).map(|(t, b)| t + b).collect::<Vec<f64>>());
        }
        if self.exact_equiv {
            let shift = proxies[0].clone();
            for p in proxies.iter_mut() {
                for (v, s) in p.iter_mut().zip(&shift) {
                    *v -= s;
                }
            }
            ext.insert(GLOBAL_TIME_SHIFT, shift)?;
        }
        for (det, p) in self.detectors.iter().zip(proxies) {
            ext.insert(Self::proxy_label(det), p)?;
        }
        Ok(data)
    }

    fn gnpe_input_parameters(&self) -> Vec<String> {
        self.detectors.iter().map(|d| Self::time_label(d)).collect()
    }

    fn proxy_outputs(&self) -> Vec<String> {
        let skip = usize::from(self.exact_equiv);
        self.detectors
            .iter()
            .skip(skip)
            .map(|d| Self::proxy_label(d))
            .collect()
    }
}

/// Shift each detector's packed strain by minus its time proxy (plus the
/// global time shift under exact equivariance).
#[derive(Debug, Clone)]
pub struct TimeShiftStrain {
    pub detectors: Vec<String>,
    /// Frequencies of the packed bins.
    pub frequencies: Vec<f64>,
}

impl Transform for TimeShiftStrain {
    fn apply(&self, mut data: InferenceData, _rng: &mut ChaCha8Rng) -> Result<InferenceData> {
        let src = data.require_waveform("TimeShiftStrain")?;
        let (_, n_det, n_ch, n_bins) = src.dim();
        if n_det != self.detectors.len() {
            return Err(Error::shape("TimeShiftStrain detectors", self.detectors.len(), n_det));
        }
        if n_bins != self.frequencies.len() {
            return Err(Error::shape("TimeShiftStrain bins", self.frequencies.len(), n_bins));
        }
        let n = data.extrinsic_parameters.len();
        let src_rows = rows_for(src, n, "TimeShiftStrain")?;
        let global = data.extrinsic_parameters.column(GLOBAL_TIME_SHIFT);
        let mut out = Array4::zeros((n, n_det, n_ch, n_bins));
        for (d, det) in self.detectors.iter().enumerate() {
            let proxy = data
                .extrinsic_parameters
                .require(&GnpeCoalescenceTimes::proxy_label(det))?;
            for (row, &src_row) in src_rows.iter().enumerate() {
                // translate by minus the full proxy time
                let dt = -(proxy[row] + global.map_or(0.0, |g| g[row]));
                rotate_channels(&mut out, src, row, src_row, d, |k| {
                    FrequencyDomain::time_translation(self.frequencies[k], dt)
                });
            }
        }
        data.waveform = Some(out);
        Ok(data)
    }
}

/// Chirp-mass proxy and leading-order chirp heterodyning of the strain.
#[derive(Debug, Clone)]
pub struct GnpeChirp {
    pub kernel: ProxyKernel,
    pub frequencies: Vec<f64>,
}

impl GnpeChirp {
    pub const PROXY: &'static str = "chirp_mass_proxy";

    /// Newtonian stationary-phase chirp phase for a chirp mass in solar masses.
    pub fn chirp_phase(chirp_mass: f64, f: f64) -> f64 {
        if f <= 0.0 {
            return 0.0;
        }
        let x = PI * chirp_mass * MTSUN_SI * f;
        3.0 / 128.0 * x.powf(-5.0 / 3.0)
    }
}

impl Transform for GnpeChirp {
    fn apply(&self, mut data: InferenceData, rng: &mut ChaCha8Rng) -> Result<InferenceData> {
        let n = data.extrinsic_parameters.len();
        let mc = data.extrinsic_parameters.require("chirp_mass")?;
        let blur = self.kernel.sample_n(n, rng)?;
        let proxy: Vec<f64> = mc.iter().zip(blur).map(|(m, b)| m + b).collect();

        let src = data.require_waveform("GnpeChirp")?;
        let (_, n_det, n_ch, n_bins) = src.dim();
        if n_bins != self.frequencies.len() {
            return Err(Error::shape("GnpeChirp bins", self.frequencies.len(), n_bins));
        }
        let src_rows = rows_for(src, n, "GnpeChirp")?;
        let mut out = Array4::zeros((n, n_det, n_ch, n_bins));
        for (row, &src_row) in src_rows.iter().enumerate() {
            let m = proxy[row];
            for d in 0..n_det {
                rotate_channels(&mut out, src, row, src_row, d, |k| {
                    Complex64::from_polar(1.0, -Self::chirp_phase(m, self.frequencies[k]))
                });
            }
        }
        data.waveform = Some(out);
        data.extrinsic_parameters.insert(Self::PROXY, proxy)?;
        Ok(data)
    }

    fn gnpe_input_parameters(&self) -> Vec<String> {
        vec!["chirp_mass".to_string()]
    }

    fn proxy_outputs(&self) -> Vec<String> {
        vec![Self::PROXY.to_string()]
    }
}

// ── Standardization ─────────────────────────────────────────────────

fn standardization_vectors(
    names: &[String],
    standardization: &Standardization,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut mean = Vec::with_capacity(names.len());
    let mut std = Vec::with_capacity(names.len());
    for n in names {
        let (m, s) = standardization.get(n)?;
        mean.push(m);
        std.push(s);
    }
    Ok((mean, std))
}

/// Select proxies from the extrinsic table and standardize them into
/// `context_parameters`.
#[derive(Debug, Clone)]
pub struct StandardizeContext {
    names: Vec<String>,
    mean: Vec<f64>,
    std: Vec<f64>,
}

impl StandardizeContext {
    pub fn new(names: Vec<String>, standardization: &Standardization) -> Result<Self> {
        let (mean, std) = standardization_vectors(&names, standardization)?;
        Ok(Self { names, mean, std })
    }
}

impl Transform for StandardizeContext {
    fn apply(&self, mut data: InferenceData, _rng: &mut ChaCha8Rng) -> Result<InferenceData> {
        let n = data.extrinsic_parameters.len();
        let mut ctx = Array2::zeros((n, self.names.len()));
        for (j, name) in self.names.iter().enumerate() {
            let col = data.extrinsic_parameters.require(name)?;
            for (i, v) in col.iter().enumerate() {
                ctx[[i, j]] = (v - self.mean[j]) / self.std[j];
            }
        }
        data.context_parameters = Some(ctx);
        Ok(data)
    }
}

/// Map between standardized network samples and physical parameters.
///
/// Forward (`inverse = false`) standardizes `parameters` into
/// `network_output`; `inverse = true` de-standardizes `network_output` into
/// `parameters`. `log_prob` picks up the Jacobian `∓ Σ ln σ`.
#[derive(Debug, Clone)]
pub struct StandardizeParameters {
    names: Vec<String>,
    mean: Vec<f64>,
    std: Vec<f64>,
    inverse: bool,
}

impl StandardizeParameters {
    pub fn new(names: Vec<String>, standardization: &Standardization, inverse: bool) -> Result<Self> {
        let (mean, std) = standardization_vectors(&names, standardization)?;
        Ok(Self {
            names,
            mean,
            std,
            inverse,
        })
    }

    fn log_std_sum(&self) -> f64 {
        self.std.iter().map(|s| s.ln()).sum()
    }
}

impl Transform for StandardizeParameters {
    fn apply(&self, mut data: InferenceData, _rng: &mut ChaCha8Rng) -> Result<InferenceData> {
        let jac = self.log_std_sum();
        if self.inverse {
            let z = data
                .network_output
                .take()
                .ok_or_else(|| Error::contract("StandardizeParameters needs network output"))?;
            if z.ncols() != self.names.len() {
                return Err(Error::shape("network output columns", self.names.len(), z.ncols()));
            }
            let mut params = SampleTable::with_len(z.nrows());
            for (j, (name, col)) in self.names.iter().zip(z.axis_iter(Axis(1))).enumerate() {
                params.insert(
                    name.clone(),
                    col.iter().map(|v| v * self.std[j] + self.mean[j]).collect(),
                )?;
            }
            data.parameters = params;
            if let Some(lp) = data.log_prob.as_mut() {
                lp.iter_mut().for_each(|l| *l -= jac);
            }
        } else {
            let n = data.parameters.len();
            let mut z = Array2::zeros((n, self.names.len()));
            for (j, name) in self.names.iter().enumerate() {
                for (i, v) in data.parameters.require(name)?.iter().enumerate() {
                    z[[i, j]] = (v - self.mean[j]) / self.std[j];
                }
            }
            data.network_output = Some(z);
            data.parameters = SampleTable::with_len(n);
            if let Some(lp) = data.log_prob.as_mut() {
                lp.iter_mut().for_each(|l| *l += jac);
            }
        }
        Ok(data)
    }

    fn inverse(&self) -> Option<Box<dyn Transform>> {
        Some(Box::new(Self {
            inverse: !self.inverse,
            ..self.clone()
        }))
    }
}

// ── Post-processing ─────────────────────────────────────────────────

/// Undo the exact-equivariance time shift on `geocent_time`.
#[derive(Debug, Clone, Default)]
pub struct PostCorrectGeocentTime {
    pub inverse: bool,
}

impl Transform for PostCorrectGeocentTime {
    fn apply(&self, mut data: InferenceData, _rng: &mut ChaCha8Rng) -> Result<InferenceData> {
        let Some(shift) = data.extrinsic_parameters.column(GLOBAL_TIME_SHIFT) else {
            return Ok(data);
        };
        let shift = shift.to_vec();
        let sign = if self.inverse { -1.0 } else { 1.0 };
        let t = data.parameters.require_mut("geocent_time")?;
        if t.len() != shift.len() {
            return Err(Error::shape("geocent_time", shift.len(), t.len()));
        }
        for (t, s) in t.iter_mut().zip(shift) {
            *t += sign * s;
        }
        Ok(data)
    }

    fn inverse(&self) -> Option<Box<dyn Transform>> {
        Some(Box::new(Self {
            inverse: !self.inverse,
        }))
    }
}

/// Copy parameters (those present) into the extrinsic table.
#[derive(Debug, Clone)]
pub struct CopyToExtrinsicParameters {
    pub names: Vec<String>,
    pub inverse: bool,
}

impl CopyToExtrinsicParameters {
    pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            inverse: false,
        }
    }
}

impl Transform for CopyToExtrinsicParameters {
    fn apply(&self, mut data: InferenceData, _rng: &mut ChaCha8Rng) -> Result<InferenceData> {
        if self.inverse {
            for name in &self.names {
                data.extrinsic_parameters.remove(name);
            }
            return Ok(data);
        }
        if data.extrinsic_parameters.len() != data.parameters.len() {
            data.extrinsic_parameters = SampleTable::with_len(data.parameters.len());
        }
        for name in &self.names {
            if let Some(col) = data.parameters.column(name) {
                let col = col.to_vec();
                data.extrinsic_parameters.insert(name.clone(), col)?;
            }
        }
        Ok(data)
    }

    fn inverse(&self) -> Option<Box<dyn Transform>> {
        Some(Box::new(Self {
            names: self.names.clone(),
            inverse: !self.inverse,
        }))
    }
}

/// `<ifo>_time = geocent_time + Δt_ifo(ra, dec)` with the detector geometry
/// frozen at `ref_time`.
#[derive(Debug, Clone)]
pub struct GetDetectorTimes {
    pub detectors: Vec<Interferometer>,
    pub ref_time: f64,
    pub inverse: bool,
}

impl GetDetectorTimes {
    pub fn new(detectors: Vec<Interferometer>, ref_time: f64) -> Self {
        Self {
            detectors,
            ref_time,
            inverse: false,
        }
    }

    /// Detector times for a table holding `ra`, `dec`, `geocent_time`.
    pub fn detector_times(&self, table: &SampleTable) -> Result<Vec<(String, Vec<f64>)>> {
        let ra = table.require("ra")?;
        let dec = table.require("dec")?;
        let tc = table.require("geocent_time")?;
        Ok(self
            .detectors
            .iter()
            .map(|ifo| {
                let times = ra
                    .iter()
                    .zip(dec)
                    .zip(tc)
                    .map(|((&ra, &dec), &tc)| {
                        tc + ifo.time_delay_from_geocenter(ra, dec, self.ref_time)
                    })
                    .collect();
                (format!("{}_time", ifo.name), times)
            })
            .collect())
    }
}

impl Transform for GetDetectorTimes {
    fn apply(&self, mut data: InferenceData, _rng: &mut ChaCha8Rng) -> Result<InferenceData> {
        if self.inverse {
            for ifo in &self.detectors {
                data.extrinsic_parameters.remove(&format!("{}_time", ifo.name));
            }
            return Ok(data);
        }
        for (name, times) in self.detector_times(&data.extrinsic_parameters)? {
            data.extrinsic_parameters.insert(name, times)?;
        }
        Ok(data)
    }

    fn inverse(&self) -> Option<Box<dyn Transform>> {
        Some(Box::new(Self {
            inverse: !self.inverse,
            ..self.clone()
        }))
    }
}
