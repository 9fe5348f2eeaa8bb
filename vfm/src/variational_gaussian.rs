use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::error::{Result, VfmError};

/// Lower bound on ln(σ); σ never drops below exp(-10) ≈ 4.5e-5
pub const MIN_LN_STD: f64 = -10.0;

/// Upper bound on ln(σ) to keep σ² finite
pub const MAX_LN_STD: f64 = 10.0;

/// Draw a tensor of independent standard normals from `rng`
pub fn standard_normal<R: Rng + ?Sized>(
    rng: &mut R,
    dims: &[usize],
    device: &Device,
) -> Result<Tensor> {
    let n: usize = dims.iter().product();
    let eps: Vec<f32> = (0..n).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
    Ok(Tensor::from_vec(eps, dims, device)?)
}

/// Register a trainable tensor under `name`, starting at `init`
///
/// Inserted into the map directly rather than through a `VarBuilder`
/// so that initial values come from the caller's seeded generator.
pub fn register_var(varmap: &VarMap, name: &str, init: &Tensor) -> Result<Tensor> {
    let var = Var::from_tensor(init)?;
    let tensor = var.as_tensor().clone();
    let mut data = varmap
        .data()
        .lock()
        .map_err(|_| VfmError::config("parameter map is poisoned"))?;
    if data.contains_key(name) {
        return Err(VfmError::config(format!("duplicate parameter {}", name)));
    }
    data.insert(name.to_string(), var);
    Ok(tensor)
}

/// Elementwise KL( N(μ, σ²) || N(μ_r, σ_r²) ), broadcasting the
/// reference over the variational tensors
///
/// ln σ_r − ln σ + (σ² + (μ − μ_r)²) / (2σ_r²) − 1/2
///
pub fn gaussian_kl(
    mean: &Tensor,
    ln_std: &Tensor,
    ref_mean: &Tensor,
    ref_ln_std: &Tensor,
) -> Result<Tensor> {
    let ln_std = ln_std.clamp(MIN_LN_STD, MAX_LN_STD)?;
    let ref_ln_std = ref_ln_std.clamp(MIN_LN_STD, MAX_LN_STD)?;

    let var = (&ln_std * 2.0)?.exp()?;
    let ref_var = (&ref_ln_std * 2.0)?.exp()?;

    let diff_sq = mean.broadcast_sub(ref_mean)?.sqr()?;
    let ratio = (var + diff_sq)?.broadcast_div(&(ref_var * 2.0)?)?;

    let kl = ref_ln_std.broadcast_sub(&ln_std)?;
    Ok(((kl + ratio)? - 0.5)?)
}

/// Gaussian variational distribution q(θ) = N(μ, σ²I)
///
/// Mean-field with diagonal covariance. Stored as the mean μ and the
/// unconstrained log standard deviation ln(σ), one row per feature
/// (or group), `p x k`.
#[derive(Clone, Debug)]
pub struct GaussianParam {
    mean: Tensor,
    ln_std: Tensor,
}

impl GaussianParam {
    pub fn from_tensors(mean: Tensor, ln_std: Tensor) -> Result<Self> {
        if mean.dims() != ln_std.dims() {
            return Err(VfmError::shape(format!(
                "mean {:?} vs. ln_std {:?}",
                mean.dims(),
                ln_std.dims()
            )));
        }
        Ok(Self { mean, ln_std })
    }

    /// Create trainable `p x k` parameters `{prefix}.mean` and
    /// `{prefix}.ln_std` initialised at the given values
    pub fn register(varmap: &VarMap, prefix: &str, mean: &Tensor, ln_std: &Tensor) -> Result<Self> {
        let mean = register_var(varmap, &format!("{}.mean", prefix), mean)?;
        let ln_std = register_var(varmap, &format!("{}.ln_std", prefix), ln_std)?;
        Self::from_tensors(mean, ln_std)
    }

    /// Variational mean μ
    pub fn mean(&self) -> &Tensor {
        &self.mean
    }

    /// Unconstrained ln(σ)
    pub fn ln_std(&self) -> &Tensor {
        &self.ln_std
    }

    /// σ = exp(ln σ), bounded away from zero
    pub fn std(&self) -> Result<Tensor> {
        Ok(self.ln_std.clamp(MIN_LN_STD, MAX_LN_STD)?.exp()?)
    }

    /// σ²
    pub fn var(&self) -> Result<Tensor> {
        Ok((self.ln_std.clamp(MIN_LN_STD, MAX_LN_STD)? * 2.0)?.exp()?)
    }

    pub fn dims(&self) -> &[usize] {
        self.mean.dims()
    }

    pub fn device(&self) -> &Device {
        self.mean.device()
    }

    pub fn dtype(&self) -> DType {
        self.mean.dtype()
    }

    /// Rows `indices` of both μ and ln σ
    pub fn gather(&self, indices: &Tensor) -> Result<Self> {
        Ok(Self {
            mean: self.mean.index_select(indices, 0)?,
            ln_std: self.ln_std.index_select(indices, 0)?,
        })
    }

    /// Reparameterized draw θ = μ + σ ⊙ ε for a given ε of the same
    /// shape; ∂θ/∂μ = 1 and ∂θ/∂ln σ = σ ⊙ ε
    pub fn sample_with(&self, epsilon: &Tensor) -> Result<Tensor> {
        if epsilon.dims() != self.dims() {
            return Err(VfmError::shape(format!(
                "noise {:?} vs. parameter {:?}",
                epsilon.dims(),
                self.dims()
            )));
        }
        let epsilon = epsilon.to_dtype(self.dtype())?;
        Ok((&self.mean + self.std()?.mul(&epsilon)?)?)
    }

    /// Reparameterized draw with fresh ε ~ N(0, I) from `rng`
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<Tensor> {
        let epsilon = standard_normal(rng, self.dims(), self.device())?;
        self.sample_with(&epsilon)
    }

    /// KL(q || reference) summed over every component. The reference
    /// either matches in shape or broadcasts over rows.
    pub fn kl_to(&self, reference: &GaussianParam) -> Result<Tensor> {
        let kl = gaussian_kl(&self.mean, &self.ln_std, &reference.mean, &reference.ln_std)?;
        Ok(kl.sum_all()?)
    }

    /// KL(q || N(0, 1)) summed over every component
    pub fn kl_to_standard(&self) -> Result<Tensor> {
        let zero = Tensor::zeros((), self.dtype(), self.device())?;
        let kl = gaussian_kl(&self.mean, &self.ln_std, &zero, &zero)?;
        Ok(kl.sum_all()?)
    }

    /// Means and variances copied to the host, row-major
    pub fn to_host(&self) -> Result<(Vec<f32>, Vec<f32>)> {
        let mean = self
            .mean
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let var = self.var()?.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        Ok((mean, var))
    }
}
