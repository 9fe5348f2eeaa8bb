use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use vfm_data::FeatureSchema;

use crate::error::{Result, VfmError};
use crate::variational_gaussian::GaussianParam;

/// Group-level priors over feature biases and latent vectors
///
/// Three layers: a fixed N(0, 1) hyperprior, one learnable Gaussian
/// per group (this struct), and the per-feature posteriors that
/// point to their group by id. Each group's (μ_g, ln σ_g) is itself
/// a `GaussianParam` penalized against N(0, 1), and serves as the KL
/// reference of every feature in that group.
pub struct GroupPrior {
    bias: GaussianParam,
    latent: Option<GaussianParam>,
    group_of: Tensor,
    num_groups: usize,
}

impl GroupPrior {
    /// Create group hyperparameters at zero mean and zero ln σ
    ///
    /// * `varmap` - trainable parameter map
    /// * `schema` - feature-to-group assignment (already collapsed
    ///   to one group when grouping is off)
    /// * `rank` - latent dimension; zero skips the latent prior
    pub fn new(varmap: &VarMap, schema: &FeatureSchema, rank: usize, device: &Device) -> Result<Self> {
        let num_groups = schema.num_groups();
        let zeros = Tensor::zeros((num_groups, 1), DType::F32, device)?;
        let bias = GaussianParam::register(varmap, "group.bias", &zeros, &zeros)?;

        let latent = if rank > 0 {
            let zeros = Tensor::zeros((num_groups, rank), DType::F32, device)?;
            Some(GaussianParam::register(varmap, "group.latent", &zeros, &zeros)?)
        } else {
            None
        };

        let group_of: Vec<u32> = schema.groups().iter().map(|&g| g as u32).collect();
        let group_of = Tensor::from_vec(group_of, schema.num_features(), device)?;

        Ok(Self {
            bias,
            latent,
            group_of,
            num_groups,
        })
    }

    pub fn num_groups(&self) -> usize {
        self.num_groups
    }

    pub fn bias(&self) -> &GaussianParam {
        &self.bias
    }

    pub fn latent(&self) -> Option<&GaussianParam> {
        self.latent.as_ref()
    }

    /// Group ids of the given features, or of every feature
    fn groups_of(&self, features: Option<&Tensor>) -> Result<Tensor> {
        match features {
            Some(f) => Ok(self.group_of.index_select(f, 0)?),
            None => Ok(self.group_of.clone()),
        }
    }

    /// Per-feature reference Gaussians for the biases, one row per
    /// requested feature (every feature when `features` is `None`)
    pub fn bias_reference(&self, features: Option<&Tensor>) -> Result<GaussianParam> {
        self.bias.gather(&self.groups_of(features)?)
    }

    /// Per-feature reference Gaussians for the latent vectors
    pub fn latent_reference(&self, features: Option<&Tensor>) -> Result<GaussianParam> {
        let latent = self
            .latent
            .as_ref()
            .ok_or_else(|| VfmError::shape("model carries no latent prior"))?;
        latent.gather(&self.groups_of(features)?)
    }

    /// KL of every group hyperparameter against the fixed N(0, 1)
    pub fn kl_hyper(&self) -> Result<Tensor> {
        let mut kl = self.bias.kl_to_standard()?;
        if let Some(latent) = self.latent.as_ref() {
            kl = (kl + latent.kl_to_standard()?)?;
        }
        Ok(kl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn references_follow_group_ids() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let schema = FeatureSchema::user_item(2, 3);
        let prior = GroupPrior::new(&varmap, &schema, 4, &dev)?;

        assert_eq!(prior.num_groups(), 2);
        assert_eq!(prior.bias_reference(None)?.dims(), &[5, 1]);
        let active = Tensor::from_vec(vec![4u32, 0], 2, &dev)?;
        assert_eq!(prior.latent_reference(Some(&active))?.dims(), &[2, 4]);

        // zero mean, unit σ: exactly the hyperprior
        let kl: f32 = prior.kl_hyper()?.to_scalar()?;
        assert_abs_diff_eq!(kl, 0.0, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn linear_model_has_no_latent_prior() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let prior = GroupPrior::new(&varmap, &FeatureSchema::single_group(3), 0, &dev)?;
        assert!(prior.latent().is_none());
        assert!(prior.latent_reference(None).is_err());
        Ok(())
    }
}
