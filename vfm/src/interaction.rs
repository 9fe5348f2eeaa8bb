use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use vfm_data::Batch;

use crate::error::{Result, VfmError};
use crate::parameter_table::ParameterTable;
use crate::variational_gaussian::GaussianParam;

/// A `Batch` moved onto the device, padded to `nrows x max_nnz`
pub struct BatchTensors {
    /// flattened slot feature ids, `nrows * max_nnz`
    pub indices: Tensor,
    /// slot values, `nrows x max_nnz` (zero in padded slots)
    pub values: Tensor,
    pub targets: Tensor,
    /// distinct active feature ids, ascending
    pub active: Tensor,
    pub nrows: usize,
    pub max_nnz: usize,
}

impl BatchTensors {
    /// Check feature ids against `num_features` and copy to `device`
    pub fn from_batch(batch: &Batch, num_features: usize, device: &Device) -> Result<Self> {
        if let Some(max_index) = batch.max_index() {
            if max_index >= num_features {
                return Err(VfmError::shape(format!(
                    "feature index {} out of range for {} features",
                    max_index, num_features
                )));
            }
        }

        let padded = batch.padded();
        let (nrows, max_nnz) = (padded.nrows, padded.max_nnz);

        let indices = Tensor::from_vec(padded.indices, nrows * max_nnz, device)?;
        let values = Tensor::from_vec(padded.values, (nrows, max_nnz), device)?;
        let targets = Tensor::from_slice(&batch.targets, nrows, device)?;

        let active: Vec<u32> = batch.active_features().into_iter().map(|f| f as u32).collect();
        let nactive = active.len();
        let active = Tensor::from_vec(active, nactive, device)?;

        Ok(Self {
            indices,
            values,
            targets,
            active,
            nrows,
            max_nnz,
        })
    }
}

/// How parameter values are obtained for a forward pass
pub enum Draw<'a> {
    /// posterior means, no noise (inference)
    Mean,
    /// one reparameterized sample per padded slot (training)
    Sample(&'a mut StdRng),
}

impl Draw<'_> {
    fn take(&mut self, param: &GaussianParam) -> Result<Tensor> {
        match self {
            Draw::Mean => Ok(param.mean().clone()),
            Draw::Sample(rng) => param.sample(&mut **rng),
        }
    }
}

/// FM forward pass
///
/// ŷ = c + Σ_m β_m x_m + ½ Σ_k [ (Σ_m v_mk x_m)² − Σ_m (v_mk x_m)² ]
///
/// * `offset` - c, a single element
/// * `bias_bm` - β at each slot, `B x M`
/// * `latent_bmk` - v at each slot, `B x M x k`; `None` drops the
///   pairwise term
/// * `values_bm` - x at each slot, `B x M`
///
/// Returns `B` predictions.
pub fn fm_predict(
    offset: &Tensor,
    bias_bm: &Tensor,
    latent_bmk: Option<&Tensor>,
    values_bm: &Tensor,
) -> Result<Tensor> {
    let mut pred_b = (bias_bm * values_bm)?.sum(1)?;

    if let Some(latent_bmk) = latent_bmk {
        let vx_bmk = latent_bmk.broadcast_mul(&values_bm.unsqueeze(2)?)?;
        let sum_sq_bk = vx_bmk.sum(1)?.sqr()?;
        let sq_sum_bk = vx_bmk.sqr()?.sum(1)?;
        let pair_b = ((sum_sq_bk - sq_sum_bk)?.sum(1)? * 0.5)?;
        pred_b = (pred_b + pair_b)?;
    }

    Ok(pred_b.broadcast_add(&offset.flatten_all()?)?)
}

/// Computes predictions for a batch from the parameter table
#[derive(Clone, Copy, Debug)]
pub struct InteractionEngine {
    use_interactions: bool,
}

impl InteractionEngine {
    pub fn new(use_interactions: bool) -> Self {
        Self { use_interactions }
    }

    pub fn use_interactions(&self) -> bool {
        self.use_interactions
    }

    /// Predictions for every row of `batch`, `nrows` long
    ///
    /// Only the rows of the table referenced by the batch are
    /// gathered (and sampled), so the cost per row is
    /// O(nnz × rank).
    pub fn predict(
        &self,
        table: &ParameterTable,
        batch: &BatchTensors,
        mut draw: Draw<'_>,
    ) -> Result<Tensor> {
        let offset = draw.take(table.offset())?;
        let (nrows, max_nnz) = (batch.nrows, batch.max_nnz);

        if max_nnz == 0 {
            return Ok(offset.flatten_all()?.broadcast_as(nrows)?.contiguous()?);
        }

        let bias_bm = draw
            .take(&table.bias().gather(&batch.indices)?)?
            .reshape((nrows, max_nnz))?;

        let latent_bmk = match table.latent() {
            Some(latent) if self.use_interactions => {
                let rank = latent.dims()[1];
                Some(
                    draw.take(&latent.gather(&batch.indices)?)?
                        .reshape((nrows, max_nnz, rank))?,
                )
            }
            _ => None,
        };

        fm_predict(&offset, &bias_bm, latent_bmk.as_ref(), &batch.values)
    }
}
