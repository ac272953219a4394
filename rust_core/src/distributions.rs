use crate::error::{Error, Result};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};

/// One-dimensional prior component.
///
/// Tagged in metadata as `{"type": "Uniform", "minimum": 0.0, "maximum": 1.0}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum PriorComponent {
    Uniform {
        minimum: f64,
        maximum: f64,
    },
    /// p(x) ∝ sin(x), used for inclination-like angles.
    Sine {
        #[serde(default)]
        minimum: f64,
        #[serde(default = "pi")]
        maximum: f64,
    },
    /// p(x) ∝ cos(x), used for declination.
    Cosine {
        #[serde(default = "minus_half_pi")]
        minimum: f64,
        #[serde(default = "half_pi")]
        maximum: f64,
    },
    Gaussian {
        mu: f64,
        sigma: f64,
    },
    /// p(x) ∝ x^alpha on [minimum, maximum].
    PowerLaw {
        alpha: f64,
        minimum: f64,
        maximum: f64,
    },
    /// Support restriction only; contributes no density.
    Constraint {
        minimum: f64,
        maximum: f64,
    },
}

fn pi() -> f64 {
    PI
}

fn half_pi() -> f64 {
    FRAC_PI_2
}

fn minus_half_pi() -> f64 {
    -FRAC_PI_2
}

impl PriorComponent {
    pub fn is_constraint(&self) -> bool {
        matches!(self, PriorComponent::Constraint { .. })
    }

    /// True for `Uniform { minimum, maximum }` with exactly these bounds.
    pub fn is_uniform_on(&self, lower: f64, upper: f64) -> bool {
        matches!(self, PriorComponent::Uniform { minimum, maximum }
            if *minimum == lower && *maximum == upper)
    }

    pub fn bounds(&self) -> (f64, f64) {
        match *self {
            PriorComponent::Uniform { minimum, maximum }
            | PriorComponent::Sine { minimum, maximum }
            | PriorComponent::Cosine { minimum, maximum }
            | PriorComponent::PowerLaw {
                minimum, maximum, ..
            }
            | PriorComponent::Constraint { minimum, maximum } => (minimum, maximum),
            PriorComponent::Gaussian { .. } => (f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    fn in_bounds(&self, x: f64) -> bool {
        let (lo, hi) = self.bounds();
        x >= lo && x <= hi
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        let (lo, hi) = self.bounds();
        let ok = match *self {
            PriorComponent::Gaussian { mu, sigma } => mu.is_finite() && sigma > 0.0,
            PriorComponent::PowerLaw { alpha, .. } => alpha.is_finite() && lo > 0.0 && hi > lo,
            _ => lo.is_finite() && hi.is_finite() && hi > lo,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::config(format!("invalid prior for `{name}`: {self:?}")))
        }
    }

    /// Normalized log-density; `-inf` outside the support.
    /// Constraints always return 0.
    pub fn ln_prob(&self, x: f64) -> f64 {
        if x.is_nan() {
            return f64::NEG_INFINITY;
        }
        match *self {
            PriorComponent::Constraint { .. } => 0.0,
            PriorComponent::Gaussian { mu, sigma } => {
                let z = (x - mu) / sigma;
                -0.5 * z * z - sigma.ln() - 0.5 * (2.0 * PI).ln()
            }
            _ if !self.in_bounds(x) => f64::NEG_INFINITY,
            PriorComponent::Uniform { minimum, maximum } => -(maximum - minimum).ln(),
            // ∫ sin = cos(lo) - cos(hi)
            PriorComponent::Sine { minimum, maximum } => {
                (x.sin() / (minimum.cos() - maximum.cos())).ln()
            }
            // ∫ cos = sin(hi) - sin(lo)
            PriorComponent::Cosine { minimum, maximum } => {
                (x.cos() / (maximum.sin() - minimum.sin())).ln()
            }
            PriorComponent::PowerLaw {
                alpha,
                minimum,
                maximum,
            } => {
                let norm = if (alpha + 1.0).abs() < 1e-12 {
                    (maximum / minimum).ln()
                } else {
                    (maximum.powf(alpha + 1.0) - minimum.powf(alpha + 1.0)) / (alpha + 1.0)
                };
                alpha * x.ln() - norm.ln()
            }
        }
    }

    /// Whether `x` satisfies this component's support (used for constraints).
    pub fn satisfied(&self, x: f64) -> bool {
        !x.is_nan() && self.in_bounds(x)
    }

    /// Draw by inverse CDF.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let u: f64 = rng.gen();
        match *self {
            PriorComponent::Uniform { minimum, maximum }
            | PriorComponent::Constraint { minimum, maximum } => {
                minimum + u * (maximum - minimum)
            }
            PriorComponent::Sine { minimum, maximum } => {
                let (c0, c1) = (minimum.cos(), maximum.cos());
                (c0 - u * (c0 - c1)).acos()
            }
            PriorComponent::Cosine { minimum, maximum } => {
                let (s0, s1) = (minimum.sin(), maximum.sin());
                (s0 + u * (s1 - s0)).asin()
            }
            // sigma > 0 is checked by `validate`; a degenerate prior collapses to mu
            PriorComponent::Gaussian { mu, sigma } => Normal::new(mu, sigma)
                .map(|n| n.sample(rng))
                .unwrap_or(mu),
            PriorComponent::PowerLaw {
                alpha,
                minimum,
                maximum,
            } => {
                if (alpha + 1.0).abs() < 1e-12 {
                    minimum * (maximum / minimum).powf(u)
                } else {
                    let a1 = alpha + 1.0;
                    let lo = minimum.powf(a1);
                    let hi = maximum.powf(a1);
                    (lo + u * (hi - lo)).powf(1.0 / a1)
                }
            }
        }
    }
}

// ── Blur kernels for GNPE proxies ───────────────────────────────────

/// Distribution of the random perturbation added to a proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", deny_unknown_fields)]
pub enum BlurDistribution {
    Uniform { minimum: f64, maximum: f64 },
    Normal { mu: f64, sigma: f64 },
}

/// Deterministic proxy offset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixedOffset {
    pub offset: f64,
}

/// How a proxy is perturbed relative to the quantity it is derived from.
///
/// `Fixed` is deterministic (no resampling between iterations); `Blurred`
/// draws a fresh perturbation per row and iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxyKernel {
    Fixed(FixedOffset),
    Blurred(BlurDistribution),
}

impl ProxyKernel {
    pub fn validate(&self) -> Result<()> {
        let ok = match self {
            ProxyKernel::Fixed(f) => f.offset.is_finite(),
            ProxyKernel::Blurred(BlurDistribution::Uniform { minimum, maximum }) => {
                minimum.is_finite() && maximum.is_finite() && maximum > minimum
            }
            ProxyKernel::Blurred(BlurDistribution::Normal { mu, sigma }) => {
                mu.is_finite() && sigma.is_finite() && *sigma > 0.0
            }
        };
        if ok {
            Ok(())
        } else {
            Err(Error::config(format!("invalid proxy kernel {self:?}")))
        }
    }

    /// Kernel width: half-range for uniform, sigma for normal, 0 for fixed.
    pub fn width(&self) -> f64 {
        match self {
            ProxyKernel::Fixed(_) => 0.0,
            ProxyKernel::Blurred(BlurDistribution::Uniform { minimum, maximum }) => {
                0.5 * (maximum - minimum)
            }
            ProxyKernel::Blurred(BlurDistribution::Normal { sigma, .. }) => *sigma,
        }
    }

    /// Perturbations for `n` rows.
    pub fn sample_n<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<Vec<f64>> {
        match self {
            ProxyKernel::Fixed(f) => Ok(vec![f.offset; n]),
            ProxyKernel::Blurred(BlurDistribution::Uniform { minimum, maximum }) => {
                Ok((0..n).map(|_| rng.gen_range(*minimum..*maximum)).collect())
            }
            ProxyKernel::Blurred(BlurDistribution::Normal { mu, sigma }) => {
                let dist = Normal::new(*mu, *sigma)
                    .map_err(|e| Error::config(format!("normal kernel: {e}")))?;
                Ok((0..n).map(|_| dist.sample(rng)).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_prior_from_json() {
        let p: PriorComponent =
            serde_json::from_str(r#"{"type": "Uniform", "minimum": 0.0, "maximum": 2.0}"#)
                .unwrap();
        assert_eq!(p, PriorComponent::Uniform { minimum: 0.0, maximum: 2.0 });
        let c: PriorComponent = serde_json::from_str(r#"{"type": "Cosine"}"#).unwrap();
        assert_eq!(c.bounds(), (-FRAC_PI_2, FRAC_PI_2));
        assert!(serde_json::from_str::<PriorComponent>(
            r#"{"type": "Uniform", "minimum": 0.0, "maximum": 2.0, "foo": 1}"#
        )
        .is_err());
    }

    #[test]
    fn test_ln_prob_normalized() {
        // crude quadrature of exp(ln_prob) over the support
        let priors = [
            PriorComponent::Uniform { minimum: -1.0, maximum: 3.0 },
            PriorComponent::Sine { minimum: 0.0, maximum: PI },
            PriorComponent::Cosine { minimum: -FRAC_PI_2, maximum: FRAC_PI_2 },
            PriorComponent::PowerLaw { alpha: 2.0, minimum: 1.0, maximum: 4.0 },
        ];
        for p in &priors {
            let (lo, hi) = p.bounds();
            let n = 20_000;
            let h = (hi - lo) / n as f64;
            let total: f64 = (0..n)
                .map(|i| p.ln_prob(lo + (i as f64 + 0.5) * h).exp() * h)
                .sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_out_of_support() {
        let p = PriorComponent::Uniform { minimum: 0.0, maximum: 1.0 };
        assert_eq!(p.ln_prob(1.5), f64::NEG_INFINITY);
        assert_eq!(p.ln_prob(f64::NAN), f64::NEG_INFINITY);
        let c = PriorComponent::Constraint { minimum: 0.0, maximum: 1.0 };
        assert_eq!(c.ln_prob(5.0), 0.0);
        assert!(!c.satisfied(5.0));
    }

    #[test]
    fn test_samples_within_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let p = PriorComponent::Sine { minimum: 0.0, maximum: PI };
        for _ in 0..1000 {
            let x = p.sample(&mut rng);
            assert!((0.0..=PI).contains(&x));
        }
    }

    #[test]
    fn test_kernel_parsing() {
        let k: ProxyKernel = serde_json::from_str(r#"{"offset": 0.0}"#).unwrap();
        assert_eq!(k, ProxyKernel::Fixed(FixedOffset { offset: 0.0 }));
        let k: ProxyKernel =
            serde_json::from_str(r#"{"type": "Uniform", "minimum": -0.001, "maximum": 0.001}"#)
                .unwrap();
        assert_relative_eq!(k.width(), 0.001);
        assert!(serde_json::from_str::<ProxyKernel>(r#"{"type": "Cauchy"}"#).is_err());
    }

    #[test]
    fn test_kernel_draws() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let fixed = ProxyKernel::Fixed(FixedOffset { offset: 0.25 });
        assert_eq!(fixed.sample_n(3, &mut rng).unwrap(), vec![0.25; 3]);

        let blur = ProxyKernel::Blurred(BlurDistribution::Uniform {
            minimum: -0.1,
            maximum: 0.1,
        });
        let draws = blur.sample_n(500, &mut rng).unwrap();
        assert!(draws.iter().all(|d| d.abs() <= 0.1));
        assert!(draws.iter().any(|d| *d != draws[0]));
    }
}
