//! Joint prior over named parameters.
//!
//! A [`PriorDict`] is a product of independent one-dimensional components plus
//! constraint components that only restrict the support. Constraints may name
//! a parameter directly or one of the derived masses (`mass_1`, `mass_2`,
//! `total_mass`) computed from `chirp_mass` and `mass_ratio`.

use crate::distributions::PriorComponent;
use crate::error::{Error, Result};
use crate::samples::{Parameters, SampleTable};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::f64::consts::PI;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorDict {
    components: BTreeMap<String, PriorComponent>,
}

/// Entry of a prior mapping in model metadata: either a component or the
/// keyword `"default"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PriorSetting {
    Component(PriorComponent),
    Keyword(String),
}

impl PriorDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.components.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&PriorComponent> {
        self.components.get(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, component: PriorComponent) {
        self.components.insert(name.into(), component);
    }

    /// Remove a component, handing it to the caller (used to split off
    /// marginalized parameters).
    pub fn pop(&mut self, name: &str) -> Option<PriorComponent> {
        self.components.remove(name)
    }

    /// Names of the density-carrying (non-constraint) components.
    pub fn sampled_keys(&self) -> Vec<String> {
        self.components
            .iter()
            .filter(|(_, c)| !c.is_constraint())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Joint log-density per row. Every non-constraint component must have a
    /// column in `theta`; extra columns are ignored.
    pub fn log_prob(&self, theta: &SampleTable) -> Result<Vec<f64>> {
        let mut out = vec![0.0; theta.len()];
        for (name, comp) in &self.components {
            if comp.is_constraint() {
                continue;
            }
            let col = theta.require(name)?;
            for (o, &x) in out.iter_mut().zip(col) {
                *o += comp.ln_prob(x);
            }
        }
        Ok(out)
    }

    /// Per-row constraint satisfaction; `false` marks a violated row.
    pub fn evaluate_constraints(&self, theta: &SampleTable) -> Result<Vec<bool>> {
        let mut ok = vec![true; theta.len()];
        for (name, comp) in self.components.iter().filter(|(_, c)| c.is_constraint()) {
            let values = match theta.column(name) {
                Some(c) => c.to_vec(),
                None => derived_column(theta, name)?,
            };
            for (o, x) in ok.iter_mut().zip(values) {
                *o &= comp.satisfied(x);
            }
        }
        Ok(ok)
    }

    /// Draw `n` rows from the non-constraint components, rejecting rows that
    /// violate constraints.
    pub fn sample<R: rand::Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<SampleTable> {
        let keys = self.sampled_keys();
        let mut rows: Vec<Parameters> = Vec::with_capacity(n);
        let max_tries = 1000 * n.max(1);
        let mut tries = 0;
        while rows.len() < n {
            tries += 1;
            if tries > max_tries {
                return Err(Error::contract("prior constraints reject nearly all draws"));
            }
            let row: Parameters = keys
                .iter()
                .map(|k| (k.clone(), self.components[k].sample(rng)))
                .collect();
            let single = SampleTable::from_columns(row.iter().map(|(k, v)| (k.clone(), vec![*v])))?;
            if self.evaluate_constraints(&single)?[0] {
                rows.push(row);
            }
        }
        let mut table = SampleTable::with_len(n);
        for k in &keys {
            table.insert(k.clone(), rows.iter().map(|r| r[k]).collect())?;
        }
        Ok(table)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, comp) in &self.components {
            comp.validate(name)?;
        }
        Ok(())
    }
}

/// Default extrinsic priors, used for metadata entries given as `"default"`.
pub fn default_extrinsic_prior(name: &str) -> Option<PriorComponent> {
    let comp = match name {
        "dec" => PriorComponent::Cosine {
            minimum: -PI / 2.0,
            maximum: PI / 2.0,
        },
        "ra" | "phase" => PriorComponent::Uniform {
            minimum: 0.0,
            maximum: 2.0 * PI,
        },
        "geocent_time" => PriorComponent::Uniform {
            minimum: -0.1,
            maximum: 0.1,
        },
        "psi" => PriorComponent::Uniform {
            minimum: 0.0,
            maximum: PI,
        },
        "theta_jn" => PriorComponent::Sine {
            minimum: 0.0,
            maximum: PI,
        },
        "luminosity_distance" => PriorComponent::Uniform {
            minimum: 100.0,
            maximum: 1000.0,
        },
        _ => return None,
    };
    Some(comp)
}

/// Merge intrinsic and extrinsic prior settings (extrinsic wins on clashes)
/// and resolve `"default"` entries.
pub fn build_prior_with_defaults(
    intrinsic: &BTreeMap<String, PriorSetting>,
    extrinsic: &BTreeMap<String, PriorSetting>,
) -> Result<PriorDict> {
    let mut prior = PriorDict::new();
    for (name, setting) in intrinsic.iter().chain(extrinsic) {
        let comp = match setting {
            PriorSetting::Component(c) => c.clone(),
            PriorSetting::Keyword(k) if k == "default" => default_extrinsic_prior(name)
                .ok_or_else(|| Error::config(format!("no default prior for `{name}`")))?,
            PriorSetting::Keyword(k) => {
                return Err(Error::config(format!(
                    "unrecognized prior setting `{k}` for `{name}`"
                )))
            }
        };
        prior.insert(name.clone(), comp);
    }
    prior.validate()?;
    Ok(prior)
}

/// Component masses from chirp mass and mass ratio `q = m2 / m1 ≤ 1`.
pub fn component_masses(chirp_mass: f64, mass_ratio: f64) -> (f64, f64) {
    let total = chirp_mass * (1.0 + mass_ratio).powf(1.2) / mass_ratio.powf(0.6);
    let m1 = total / (1.0 + mass_ratio);
    (m1, m1 * mass_ratio)
}

fn derived_column(theta: &SampleTable, name: &str) -> Result<Vec<f64>> {
    let pick: fn(f64, f64) -> f64 = match name {
        "mass_1" => |m1, _| m1,
        "mass_2" => |_, m2| m2,
        "total_mass" => |m1, m2| m1 + m2,
        _ => return Err(Error::MissingColumn(name.to_string())),
    };
    let mc = theta.require("chirp_mass")?;
    let q = theta.require("mass_ratio")?;
    Ok(mc
        .iter()
        .zip(q)
        .map(|(&mc, &q)| {
            let (m1, m2) = component_masses(mc, q);
            pick(m1, m2)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn prior() -> PriorDict {
        let mut p = PriorDict::new();
        p.insert("chirp_mass", PriorComponent::Uniform { minimum: 10.0, maximum: 50.0 });
        p.insert("mass_ratio", PriorComponent::Uniform { minimum: 0.125, maximum: 1.0 });
        p.insert("mass_1", PriorComponent::Constraint { minimum: 10.0, maximum: 80.0 });
        p
    }

    #[test]
    fn test_component_masses() {
        let (m1, m2) = component_masses(30.0, 1.0);
        assert_relative_eq!(m1, m2, epsilon = 1e-12);
        // equal masses: Mc = m * 2^{-1/5}
        assert_relative_eq!(m1, 30.0 * 2f64.powf(0.2), epsilon = 1e-9);
    }

    #[test]
    fn test_log_prob_and_constraints() {
        let p = prior();
        let theta = SampleTable::from_columns([
            ("chirp_mass", vec![20.0, 60.0, 45.0]),
            ("mass_ratio", vec![0.5, 0.5, 0.2]),
        ])
        .unwrap();
        let lp = p.log_prob(&theta).unwrap();
        assert_relative_eq!(lp[0], -(40.0f64).ln() - (0.875f64).ln(), epsilon = 1e-12);
        assert_eq!(lp[1], f64::NEG_INFINITY);
        let ok = p.evaluate_constraints(&theta).unwrap();
        // m1 ≈ 98.6 and ≈ 122.6 for the last two rows
        assert_eq!(ok, vec![true, false, false]);
    }

    #[test]
    fn test_missing_column() {
        let p = prior();
        let theta = SampleTable::from_columns([("chirp_mass", vec![20.0])]).unwrap();
        assert!(matches!(p.log_prob(&theta), Err(Error::MissingColumn(_))));
    }

    #[test]
    fn test_pop_and_restore() {
        let mut p = prior();
        let c = p.pop("chirp_mass").unwrap();
        assert!(!p.contains("chirp_mass"));
        p.insert("chirp_mass", c);
        assert_eq!(p, prior());
    }

    #[test]
    fn test_build_with_defaults() {
        let intrinsic: BTreeMap<String, PriorSetting> = serde_json::from_str(
            r#"{"chirp_mass": {"type": "Uniform", "minimum": 10.0, "maximum": 50.0}}"#,
        )
        .unwrap();
        let extrinsic: BTreeMap<String, PriorSetting> =
            serde_json::from_str(r#"{"ra": "default", "dec": "default"}"#).unwrap();
        let p = build_prior_with_defaults(&intrinsic, &extrinsic).unwrap();
        assert!(p.get("ra").unwrap().is_uniform_on(0.0, 2.0 * PI));

        let bad: BTreeMap<String, PriorSetting> =
            serde_json::from_str(r#"{"foo": "default"}"#).unwrap();
        assert!(build_prior_with_defaults(&intrinsic, &bad).is_err());
    }

    #[test]
    fn test_sample_respects_constraints() {
        let p = prior();
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let s = p.sample(200, &mut rng).unwrap();
        assert_eq!(s.len(), 200);
        assert!(p.evaluate_constraints(&s).unwrap().iter().all(|&b| b));
    }
}
