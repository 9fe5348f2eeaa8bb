use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use log::debug;
use rand::Rng;
use std::path::Path;
use vfm_data::FeatureSchema;

use crate::config::{Grouping, VfmConfig};
use crate::error::{Result, VfmError};
use crate::hierarchical_prior::GroupPrior;
use crate::uncertainty::Posterior;
use crate::variational_gaussian::{standard_normal, GaussianParam};

/// Every trainable quantity of the model, owned in one place
///
/// * `offset` - global offset c, `1 x 1`
/// * `bias` - per-feature bias β, `F x 1`
/// * `latent` - per-feature latent vectors v, `F x k` (only when the
///   pairwise term is on)
/// * `prior` - group hyperparameters, indexed by group id
///
/// Rows are feature ids; the prior references its rows by group id.
/// All tensors are views of `Var`s registered in one `VarMap`, so an
/// optimizer step replaces every value in place and checkpointing
/// saves the whole table at once.
pub struct ParameterTable {
    varmap: VarMap,
    offset: GaussianParam,
    bias: GaussianParam,
    latent: Option<GaussianParam>,
    prior: GroupPrior,
    schema: FeatureSchema,
    rank: usize,
}

/// `init_ln_std + noise` for log standard deviations
fn init_ln_std<R: Rng + ?Sized>(
    rng: &mut R,
    dims: &[usize],
    scale: f64,
    init: f32,
    device: &Device,
) -> Result<Tensor> {
    Ok(((standard_normal(rng, dims, device)? * scale)? + init as f64)?)
}

impl ParameterTable {
    /// Allocate and initialize every parameter
    ///
    /// Latent means ~ N(0, 1)/√(F·k), bias means ~ N(0, 1)/√F, both
    /// with ln σ at `config.init_ln_std` plus noise of the same
    /// scale. Group hyperparameters start at zero mean, zero ln σ.
    ///
    /// * `config` - validated model configuration
    /// * `schema` - feature groups; collapsed to one group when
    ///   grouping is disabled
    /// * `rng` - source of all initialization noise
    pub fn new<R: Rng + ?Sized>(
        config: &VfmConfig,
        schema: &FeatureSchema,
        rng: &mut R,
        device: &Device,
    ) -> Result<Self> {
        let nfeat = schema.num_features();
        if nfeat == 0 {
            return Err(VfmError::config("feature schema is empty"));
        }
        let rank = config.effective_rank();
        let varmap = VarMap::new();

        let offset = GaussianParam::register(
            &varmap,
            "offset",
            &Tensor::full(config.init_offset_mean, (1, 1), device)?,
            &Tensor::full(config.init_ln_std, (1, 1), device)?,
        )?;

        let bias_scale = 1.0 / (nfeat as f64).sqrt();
        let bias_mean = (standard_normal(rng, &[nfeat, 1], device)? * bias_scale)?;
        let bias_ln_std = init_ln_std(rng, &[nfeat, 1], bias_scale, config.init_ln_std, device)?;
        let bias = GaussianParam::register(&varmap, "feature.bias", &bias_mean, &bias_ln_std)?;

        let latent = if rank > 0 {
            let scale = 1.0 / ((nfeat * rank) as f64).sqrt();
            let mean = (standard_normal(rng, &[nfeat, rank], device)? * scale)?;
            let ln_std = init_ln_std(rng, &[nfeat, rank], scale, config.init_ln_std, device)?;
            Some(GaussianParam::register(&varmap, "feature.latent", &mean, &ln_std)?)
        } else {
            None
        };

        let prior = match config.grouping {
            Grouping::Enabled => GroupPrior::new(&varmap, schema, rank, device)?,
            Grouping::Disabled => GroupPrior::new(&varmap, &schema.collapsed(), rank, device)?,
        };

        debug!(
            "parameter table: {} features, {} groups, rank {}",
            nfeat,
            prior.num_groups(),
            rank
        );

        Ok(Self {
            varmap,
            offset,
            bias,
            latent,
            prior,
            schema: schema.clone(),
            rank,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn offset(&self) -> &GaussianParam {
        &self.offset
    }

    pub fn bias(&self) -> &GaussianParam {
        &self.bias
    }

    pub fn latent(&self) -> Option<&GaussianParam> {
        self.latent.as_ref()
    }

    pub fn prior(&self) -> &GroupPrior {
        &self.prior
    }

    /// The schema the table was built on (before any collapsing)
    pub fn schema(&self) -> &FeatureSchema {
        &self.schema
    }

    pub fn num_features(&self) -> usize {
        self.schema.num_features()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn device(&self) -> &Device {
        self.offset.device()
    }

    /// Names of all parameters, sorted
    pub fn names(&self) -> Result<Vec<String>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| VfmError::config("parameter map is poisoned"))?;
        let mut names: Vec<String> = data.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Name of the first parameter (in sorted order) holding a NaN or
    /// infinite value
    pub fn first_non_finite(&self) -> Result<Option<String>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| VfmError::config("parameter map is poisoned"))?;
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        for name in names {
            let total: f32 = data[name]
                .as_tensor()
                .to_dtype(DType::F32)?
                .sum_all()?
                .to_scalar()?;
            if !total.is_finite() {
                return Ok(Some(name.clone()));
            }
        }
        Ok(None)
    }

    /// Deep copy of every parameter value, by name
    pub fn snapshot(&self) -> Result<Vec<(String, Tensor)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| VfmError::config("parameter map is poisoned"))?;
        let mut out = Vec::with_capacity(data.len());
        for (name, var) in data.iter() {
            out.push((name.clone(), var.as_tensor().copy()?));
        }
        Ok(out)
    }

    /// Write back values taken by `snapshot`
    pub fn restore(&self, snapshot: &[(String, Tensor)]) -> Result<()> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| VfmError::config("parameter map is poisoned"))?;
        for (name, value) in snapshot {
            let var = data
                .get(name)
                .ok_or_else(|| VfmError::config(format!("unknown parameter {}", name)))?;
            var.set(value)?;
        }
        Ok(())
    }

    /// Copy of every mean and variance on the host
    pub fn posterior(&self) -> Result<Posterior> {
        let (offset_mean, offset_var) = self.offset.to_host()?;
        let (bias_mean, bias_var) = self.bias.to_host()?;
        let (latent_mean, latent_var) = match self.latent.as_ref() {
            Some(latent) => latent.to_host()?,
            None => (vec![], vec![]),
        };
        Ok(Posterior {
            num_features: self.num_features(),
            rank: self.rank,
            offset_mean: offset_mean.first().copied().unwrap_or(0.0),
            offset_var: offset_var.first().copied().unwrap_or(0.0),
            bias_mean,
            bias_var,
            latent_mean,
            latent_var,
        })
    }

    /// Write every mean and ln σ to a safetensors file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }

    /// Overwrite every parameter with the values stored in `path`;
    /// the table must have been built with the same config and
    /// schema that produced the file
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.varmap.load(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn shapes_follow_config() -> Result<()> {
        let dev = Device::Cpu;
        let schema = FeatureSchema::user_item(3, 4);
        let config = VfmConfig {
            rank: 2,
            ..Default::default()
        };
        let table = ParameterTable::new(&config, &schema, &mut StdRng::seed_from_u64(1), &dev)?;

        assert_eq!(table.offset().dims(), &[1, 1]);
        assert_eq!(table.bias().dims(), &[7, 1]);
        assert_eq!(table.latent().map(|l| l.dims().to_vec()), Some(vec![7, 2]));
        assert_eq!(table.prior().num_groups(), 2);
        assert_eq!(
            table.names()?,
            vec![
                "feature.bias.ln_std",
                "feature.bias.mean",
                "feature.latent.ln_std",
                "feature.latent.mean",
                "group.bias.ln_std",
                "group.bias.mean",
                "group.latent.ln_std",
                "group.latent.mean",
                "offset.ln_std",
                "offset.mean",
            ]
        );
        assert!(table.first_non_finite()?.is_none());
        Ok(())
    }

    #[test]
    fn linear_model_and_single_group() -> Result<()> {
        let dev = Device::Cpu;
        let schema = FeatureSchema::user_item(3, 4);
        let config = VfmConfig {
            rank: 2,
            interactions: false,
            lambda2: 0.0,
            grouping: Grouping::Disabled,
            ..Default::default()
        };
        let table = ParameterTable::new(&config, &schema, &mut StdRng::seed_from_u64(1), &dev)?;
        assert!(table.latent().is_none());
        assert_eq!(table.rank(), 0);
        assert_eq!(table.prior().num_groups(), 1);
        assert_eq!(table.schema().num_groups(), 2);
        Ok(())
    }

    #[test]
    fn same_seed_same_init() -> Result<()> {
        let dev = Device::Cpu;
        let schema = FeatureSchema::user_item(5, 5);
        let config = VfmConfig::default();
        let a = ParameterTable::new(&config, &schema, &mut StdRng::seed_from_u64(5), &dev)?;
        let b = ParameterTable::new(&config, &schema, &mut StdRng::seed_from_u64(5), &dev)?;
        assert_eq!(a.posterior()?, b.posterior()?);
        Ok(())
    }
}
