use crate::error::{Error, Result};
use ndarray::{Array1, Array2, Array4};
use rand_chacha::ChaCha8Rng;

/// Conditioning input produced by the `pre` transform pipeline.
#[derive(Debug, Clone)]
pub struct ModelInput {
    /// Packed strain, `[batch, detector, channel, bin]`. A batch of one is
    /// shared by all requested samples.
    pub data: Array4<f64>,
    /// Standardized GNPE proxies, `[batch, n_context]`.
    pub context: Option<Array2<f64>>,
}

impl ModelInput {
    pub fn batch_size(&self) -> usize {
        self.data.shape()[0]
    }
}

/// Draw from a conditional density model together with its log-density.
///
/// Implementations must be free of side effects between calls; the same model
/// is called repeatedly with different conditioning inside the GNPE loop.
pub trait DensityModel: Send + Sync {
    /// Number of (standardized) parameters produced per sample.
    fn n_parameters(&self) -> usize;

    /// Returns standardized samples `[num_samples, n_parameters]` and their
    /// log-density under the model.
    fn sample_and_log_prob(
        &self,
        input: &ModelInput,
        num_samples: usize,
        rng: &mut ChaCha8Rng,
    ) -> Result<(Array2<f64>, Array1<f64>)>;
}

/// Call the model and check the shapes it returns.
pub(crate) fn checked_sample(
    model: &dyn DensityModel,
    input: &ModelInput,
    num_samples: usize,
    rng: &mut ChaCha8Rng,
) -> Result<(Array2<f64>, Array1<f64>)> {
    let batch = input.batch_size();
    if batch != 1 && batch != num_samples {
        return Err(Error::shape("model input batch", num_samples, batch));
    }
    if let Some(ctx) = &input.context {
        if ctx.nrows() != num_samples {
            return Err(Error::shape("model context rows", num_samples, ctx.nrows()));
        }
    }
    let (theta, log_prob) = model.sample_and_log_prob(input, num_samples, rng)?;
    if theta.nrows() != num_samples || log_prob.len() != num_samples {
        return Err(Error::contract(format!(
            "model returned {} samples and {} log-probs, expected {num_samples}",
            theta.nrows(),
            log_prob.len()
        )));
    }
    if theta.ncols() != model.n_parameters() {
        return Err(Error::shape("model output columns", model.n_parameters(), theta.ncols()));
    }
    Ok((theta, log_prob))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    struct Broken;

    impl DensityModel for Broken {
        fn n_parameters(&self) -> usize {
            2
        }

        fn sample_and_log_prob(
            &self,
            _input: &ModelInput,
            num_samples: usize,
            _rng: &mut ChaCha8Rng,
        ) -> Result<(Array2<f64>, Array1<f64>)> {
            Ok((Array2::zeros((num_samples, 2)), Array1::zeros(num_samples - 1)))
        }
    }

    #[test]
    fn test_contract_violation_detected() {
        let input = ModelInput {
            data: Array4::zeros((1, 1, 3, 4)),
            context: None,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let err = checked_sample(&Broken, &input, 5, &mut rng).unwrap_err();
        assert!(matches!(err, Error::Contract(_)));

        let bad_batch = ModelInput {
            data: Array4::zeros((3, 1, 3, 4)),
            context: None,
        };
        assert!(matches!(
            checked_sample(&Broken, &bad_batch, 5, &mut rng),
            Err(Error::ShapeMismatch { .. })
        ));
    }
}
