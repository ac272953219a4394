use crate::domain::FrequencyDomain;
use crate::error::{Error, Result};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Frequency-domain strain and noise ASD per detector for one event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventData {
    pub strain: BTreeMap<String, Vec<Complex64>>,
    pub asds: BTreeMap<String, Vec<f64>>,
}

/// Run-supplied information about the analyzed event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventMetadata {
    /// GPS time of the event.
    pub time_event: Option<f64>,
}

impl EventData {
    /// Check that every detector has strain and ASD covering the whole domain.
    pub fn validate<S: AsRef<str>>(&self, detectors: &[S], domain: &FrequencyDomain) -> Result<()> {
        for det in detectors {
            let det = det.as_ref();
            let strain = self
                .strain
                .get(det)
                .ok_or_else(|| Error::contract(format!("no strain for detector {det}")))?;
            let asd = self
                .asds
                .get(det)
                .ok_or_else(|| Error::contract(format!("no ASD for detector {det}")))?;
            if strain.len() != domain.len() {
                return Err(Error::shape(format!("{det} strain"), domain.len(), strain.len()));
            }
            if asd.len() != domain.len() {
                return Err(Error::shape(format!("{det} ASD"), domain.len(), asd.len()));
            }
            if asd[domain.min_idx()..].iter().any(|a| !(*a > 0.0)) {
                return Err(Error::contract(format!(
                    "{det} ASD must be positive above f_min"
                )));
            }
        }
        Ok(())
    }
}
