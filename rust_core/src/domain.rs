use crate::error::{Error, Result};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Frequency grid `k · delta_f` for `k = 0..=f_max/delta_f`; bins below `f_min`
/// are carried but ignored by inner products and network inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrequencyDomain {
    pub f_min: f64,
    pub f_max: f64,
    pub delta_f: f64,
    #[serde(default = "one")]
    pub window_factor: f64,
}

fn one() -> f64 {
    1.0
}

/// Narrowing of a trained domain, e.g. a higher `f_min` at inference time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DomainUpdate {
    pub f_min: Option<f64>,
    pub f_max: Option<f64>,
    pub delta_f: Option<f64>,
}

/// Data window used when the strain was Fourier transformed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", deny_unknown_fields)]
pub enum WindowSettings {
    Tukey {
        /// Sampling frequency in Hz.
        f_s: f64,
        /// Segment duration in seconds.
        #[serde(rename = "T")]
        duration: f64,
        /// Roll-off of each taper in seconds.
        roll_off: f64,
    },
}

impl WindowSettings {
    /// Mean squared window value, `Σ w_i² / N`.
    pub fn window_factor(&self) -> Result<f64> {
        match *self {
            WindowSettings::Tukey {
                f_s,
                duration,
                roll_off,
            } => {
                let n = (duration * f_s).round() as usize;
                if n < 2 || roll_off < 0.0 {
                    return Err(Error::config(format!("invalid window {self:?}")));
                }
                let alpha = (2.0 * roll_off / duration).min(1.0);
                Ok(tukey(n, alpha).iter().map(|w| w * w).sum::<f64>() / n as f64)
            }
        }
    }
}

/// Symmetric Tukey window of length `n`.
fn tukey(n: usize, alpha: f64) -> Vec<f64> {
    if alpha <= 0.0 {
        return vec![1.0; n];
    }
    let m = (n - 1) as f64;
    let width = alpha * m / 2.0;
    (0..n)
        .map(|i| {
            let x = i as f64;
            if x < width {
                0.5 * (1.0 + (PI * (x / width - 1.0)).cos())
            } else if x > m - width {
                0.5 * (1.0 + (PI * ((m - x) / width - 1.0)).cos())
            } else {
                1.0
            }
        })
        .collect()
}

impl FrequencyDomain {
    pub fn new(f_min: f64, f_max: f64, delta_f: f64) -> Result<Self> {
        let d = Self {
            f_min,
            f_max,
            delta_f,
            window_factor: 1.0,
        };
        d.validate()?;
        Ok(d)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.delta_f > 0.0 && self.f_min >= 0.0 && self.f_max > self.f_min)
            || !(self.window_factor > 0.0)
        {
            return Err(Error::config(format!("invalid frequency domain {self:?}")));
        }
        Ok(())
    }

    /// Apply a narrowing update. The grid may only shrink.
    pub fn update(&mut self, update: &DomainUpdate) -> Result<()> {
        if let Some(df) = update.delta_f {
            if (df - self.delta_f).abs() > 1e-12 * self.delta_f {
                return Err(Error::config("domain update cannot change delta_f"));
            }
        }
        let f_min = update.f_min.unwrap_or(self.f_min);
        let f_max = update.f_max.unwrap_or(self.f_max);
        if f_min < self.f_min || f_max > self.f_max {
            return Err(Error::config(format!(
                "domain update [{f_min}, {f_max}] exceeds [{}, {}]",
                self.f_min, self.f_max
            )));
        }
        self.f_min = f_min;
        self.f_max = f_max;
        self.validate()
    }

    /// Number of bins including the ones below `f_min`.
    pub fn len(&self) -> usize {
        (self.f_max / self.delta_f).round() as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// First bin at or above `f_min`.
    pub fn min_idx(&self) -> usize {
        (self.f_min / self.delta_f).round() as usize
    }

    pub fn sample_frequencies(&self) -> Vec<f64> {
        (0..self.len()).map(|k| k as f64 * self.delta_f).collect()
    }

    /// Frequencies of the bins used for inference (`min_idx..`).
    pub fn masked_frequencies(&self) -> Vec<f64> {
        (self.min_idx()..self.len())
            .map(|k| k as f64 * self.delta_f)
            .collect()
    }

    /// Standard deviation of whitened white noise in one bin.
    pub fn noise_std(&self) -> f64 {
        self.window_factor.sqrt() / (4.0 * self.delta_f).sqrt()
    }

    /// Phase factor `exp(-2πi f dt)` realizing a time shift by `dt`.
    #[inline]
    pub fn time_translation(f: f64, dt: f64) -> Complex64 {
        Complex64::from_polar(1.0, -2.0 * PI * f * dt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_grid() {
        let d = FrequencyDomain::new(20.0, 1024.0, 0.125).unwrap();
        assert_eq!(d.len(), 8193);
        assert_eq!(d.min_idx(), 160);
        assert_eq!(d.masked_frequencies().len(), 8193 - 160);
        assert_relative_eq!(d.noise_std(), 1.0 / 0.5f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_update() {
        let mut d = FrequencyDomain::new(20.0, 1024.0, 0.125).unwrap();
        d.update(&DomainUpdate {
            f_min: Some(30.0),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(d.f_min, 30.0);
        assert!(d
            .update(&DomainUpdate {
                f_max: Some(2048.0),
                ..Default::default()
            })
            .is_err());
    }

    #[test]
    fn test_tukey_factor() {
        let w = WindowSettings::Tukey {
            f_s: 4096.0,
            duration: 8.0,
            roll_off: 0.4,
        };
        let f = w.window_factor().unwrap();
        // alpha = 0.1: factor = 1 - 5 alpha / 8 asymptotically
        assert_relative_eq!(f, 1.0 - 5.0 * 0.1 / 8.0, epsilon = 1e-4);
        let parsed: WindowSettings =
            serde_json::from_str(r#"{"type": "tukey", "f_s": 4096, "T": 8.0, "roll_off": 0.4}"#)
                .unwrap();
        assert_eq!(parsed, w);
    }

    #[test]
    fn test_time_translation_phase() {
        let d = FrequencyDomain::new(0.0, 8.0, 1.0).unwrap();
        for f in d.sample_frequencies() {
            let z = FrequencyDomain::time_translation(f, 0.013);
            assert_relative_eq!(z.norm(), 1.0, epsilon = 1e-12);
            assert_relative_eq!(z.im, -(2.0 * PI * f * 0.013).sin(), epsilon = 1e-12);
            let back = z * FrequencyDomain::time_translation(f, -0.013);
            assert_relative_eq!(back.re, 1.0, epsilon = 1e-12);
            assert_relative_eq!(back.im, 0.0, epsilon = 1e-12);
        }
    }
}
