use candle_core::{DType, Tensor};

use crate::config::{KlScope, VfmConfig};
use crate::error::{Result, VfmError};
use crate::interaction::BatchTensors;
use crate::parameter_table::ParameterTable;
use crate::variational_gaussian::GaussianParam;

/// Pieces of the negative ELBO for one batch; all scalars
pub struct ElboTerms {
    /// mse + kl_scale · (λ0 kl_hyper + λ1 kl_bias + λ2 kl_latent)
    pub loss: Tensor,
    pub mse: Tensor,
    /// offset and group hyperparameters against N(0, 1)
    pub kl_hyper: Tensor,
    /// feature biases against their group prior
    pub kl_bias: Tensor,
    /// feature latent vectors against their group prior
    pub kl_latent: Tensor,
}

/// Squared error plus weighted KL penalties
///
/// A term whose weight is zero is never evaluated, so with
/// λ0 = λ1 = λ2 = 0 the loss is exactly the mean squared error.
#[derive(Clone, Copy, Debug)]
pub struct ElboObjective {
    pub lambda0: f32,
    pub lambda1: f32,
    pub lambda2: f32,
    pub kl_scope: KlScope,
}

impl ElboObjective {
    pub fn new(config: &VfmConfig) -> Self {
        Self {
            lambda0: config.lambda0,
            lambda1: config.lambda1,
            lambda2: config.lambda2,
            kl_scope: config.kl_scope,
        }
    }

    /// Negative ELBO of `predictions` against the batch targets
    ///
    /// * `batch` - padded batch the predictions were made on
    /// * `predictions` - `nrows` predictions
    /// * `table` - current parameters
    /// * `kl_scale` - fraction of the data in this batch (B / N), so
    ///   that one pass over the data applies each prior once
    pub fn loss(
        &self,
        batch: &BatchTensors,
        predictions: &Tensor,
        table: &ParameterTable,
        kl_scale: f64,
    ) -> Result<ElboTerms> {
        if predictions.dims() != batch.targets.dims() {
            return Err(VfmError::shape(format!(
                "predictions {:?} vs. targets {:?}",
                predictions.dims(),
                batch.targets.dims()
            )));
        }

        let device = table.device();
        let zero = Tensor::zeros((), DType::F32, device)?;

        let mse = if batch.nrows > 0 {
            (predictions - &batch.targets)?.sqr()?.mean_all()?
        } else {
            zero.clone()
        };

        let kl_hyper = if self.lambda0 > 0.0 {
            (table.offset().kl_to_standard()? + table.prior().kl_hyper()?)?
        } else {
            zero.clone()
        };

        let active = match self.kl_scope {
            KlScope::All => None,
            KlScope::Active => Some(&batch.active),
        };

        let kl_bias = if self.lambda1 > 0.0 {
            let reference = table.prior().bias_reference(active)?;
            feature_kl(table.bias(), &reference, active)?
        } else {
            zero.clone()
        };

        let kl_latent = match table.latent() {
            Some(latent) if self.lambda2 > 0.0 => {
                let reference = table.prior().latent_reference(active)?;
                feature_kl(latent, &reference, active)?
            }
            _ => zero.clone(),
        };

        let penalty = (((&kl_hyper * self.lambda0 as f64)? + (&kl_bias * self.lambda1 as f64)?)?
            + (&kl_latent * self.lambda2 as f64)?)?;
        let loss = (&mse + (penalty * kl_scale)?)?;

        Ok(ElboTerms {
            loss,
            mse,
            kl_hyper,
            kl_bias,
            kl_latent,
        })
    }
}

/// KL of the selected feature rows against their references
fn feature_kl(
    param: &GaussianParam,
    reference: &GaussianParam,
    active: Option<&Tensor>,
) -> Result<Tensor> {
    match active {
        Some(rows) => param.gather(rows)?.kl_to(reference),
        None => param.kl_to(reference),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Grouping;
    use crate::interaction::{Draw, InteractionEngine};
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use vfm_data::{Batch, FeatureSchema, SparseRow};

    fn toy_batch() -> Batch {
        Batch {
            rows: vec![
                SparseRow::one_hot(&[0, 2]),
                SparseRow::one_hot(&[0, 3]),
                SparseRow::one_hot(&[1, 2]),
            ],
            targets: vec![1.0, -2.0, 0.5],
        }
    }

    #[test]
    fn zero_weights_leave_plain_mse() -> Result<()> {
        let dev = Device::Cpu;
        let schema = FeatureSchema::user_item(2, 2);
        let config = VfmConfig {
            rank: 2,
            lambda0: 0.0,
            lambda1: 0.0,
            lambda2: 0.0,
            ..Default::default()
        };
        let table = ParameterTable::new(&config, &schema, &mut StdRng::seed_from_u64(4), &dev)?;
        let batch = toy_batch();
        let tensors = BatchTensors::from_batch(&batch, 4, &dev)?;

        let pred = Tensor::new(&[0.0f32, 1.0, 0.5], &dev)?;
        let terms = ElboObjective::new(&config).loss(&tensors, &pred, &table, 1.0)?;

        // (1² + 3² + 0²) / 3
        let loss: f32 = terms.loss.to_scalar()?;
        assert_abs_diff_eq!(loss, 10.0 / 3.0, epsilon = 1e-6);
        let kl: f32 = terms.kl_bias.to_scalar()?;
        assert_eq!(kl, 0.0);
        Ok(())
    }

    #[test]
    fn penalties_are_scaled_and_weighted() -> Result<()> {
        let dev = Device::Cpu;
        let schema = FeatureSchema::user_item(2, 2);
        let config = VfmConfig {
            rank: 2,
            lambda0: 0.5,
            lambda1: 2.0,
            lambda2: 3.0,
            ..Default::default()
        };
        let table = ParameterTable::new(&config, &schema, &mut StdRng::seed_from_u64(4), &dev)?;
        let tensors = BatchTensors::from_batch(&toy_batch(), 4, &dev)?;
        let pred = InteractionEngine::new(true).predict(&table, &tensors, Draw::Mean)?;
        let terms = ElboObjective::new(&config).loss(&tensors, &pred, &table, 0.25)?;

        let mse: f32 = terms.mse.to_scalar()?;
        let kh: f32 = terms.kl_hyper.to_scalar()?;
        let kb: f32 = terms.kl_bias.to_scalar()?;
        let kv: f32 = terms.kl_latent.to_scalar()?;
        let loss: f32 = terms.loss.to_scalar()?;
        assert!(kh > 0.0 && kb > 0.0 && kv > 0.0);
        assert_abs_diff_eq!(
            loss,
            mse + 0.25 * (0.5 * kh + 2.0 * kb + 3.0 * kv),
            epsilon = 1e-4
        );
        Ok(())
    }

    #[test]
    fn active_scope_covers_only_batch_features() -> Result<()> {
        let dev = Device::Cpu;
        let schema = FeatureSchema::user_item(3, 3);
        let all = VfmConfig {
            rank: 2,
            lambda1: 1.0,
            ..Default::default()
        };
        let active = VfmConfig {
            kl_scope: KlScope::Active,
            ..all.clone()
        };
        let table = ParameterTable::new(&all, &schema, &mut StdRng::seed_from_u64(8), &dev)?;
        let tensors = BatchTensors::from_batch(&toy_batch(), 6, &dev)?;
        let pred = InteractionEngine::new(true).predict(&table, &tensors, Draw::Mean)?;

        let kb_all: f32 = ElboObjective::new(&all)
            .loss(&tensors, &pred, &table, 1.0)?
            .kl_bias
            .to_scalar()?;
        let kb_active: f32 = ElboObjective::new(&active)
            .loss(&tensors, &pred, &table, 1.0)?
            .kl_bias
            .to_scalar()?;

        // features 0, 1, 2, 3 are active; 4 and 5 are not
        let bias = table.bias();
        let reference = table.prior().bias_reference(None)?;
        let rows = Tensor::new(&[0u32, 1, 2, 3], &dev)?;
        let expected: f32 = bias
            .gather(&rows)?
            .kl_to(&reference.gather(&rows)?)?
            .to_scalar()?;
        assert_abs_diff_eq!(kb_active, expected, epsilon = 1e-5);
        assert!(kb_all > kb_active);
        Ok(())
    }

    #[test]
    fn disabled_grouping_matches_one_explicit_group() -> Result<()> {
        let dev = Device::Cpu;
        let config = VfmConfig {
            rank: 3,
            lambda0: 1.0,
            lambda1: 1.0,
            lambda2: 1.0,
            ..Default::default()
        };
        let disabled = VfmConfig {
            grouping: Grouping::Disabled,
            ..config.clone()
        };

        let grouped = FeatureSchema::user_item(2, 2);
        let single = FeatureSchema::single_group(4);
        let a = ParameterTable::new(&disabled, &grouped, &mut StdRng::seed_from_u64(6), &dev)?;
        let b = ParameterTable::new(&config, &single, &mut StdRng::seed_from_u64(6), &dev)?;

        let tensors = BatchTensors::from_batch(&toy_batch(), 4, &dev)?;
        let engine = InteractionEngine::new(true);
        let objective = ElboObjective::new(&config);

        let ta = objective.loss(&tensors, &engine.predict(&a, &tensors, Draw::Mean)?, &a, 0.5)?;
        let tb = objective.loss(&tensors, &engine.predict(&b, &tensors, Draw::Mean)?, &b, 0.5)?;

        for (x, y) in [
            (&ta.kl_hyper, &tb.kl_hyper),
            (&ta.kl_bias, &tb.kl_bias),
            (&ta.kl_latent, &tb.kl_latent),
            (&ta.loss, &tb.loss),
        ] {
            let x: f32 = x.to_scalar()?;
            let y: f32 = y.to_scalar()?;
            assert_abs_diff_eq!(x, y, epsilon = 1e-6);
        }
        Ok(())
    }
}
