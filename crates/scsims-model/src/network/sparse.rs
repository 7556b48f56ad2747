//! Sparse attention mask functions
//!
//! Both functions find their threshold on a detached copy of the input (sort,
//! cumulative sums) and then recompute it over the selected support with
//! differentiable ops only. The support is locally constant, so gradients match
//! the closed-form Jacobians without touching `sqrt` at zero.

use candle_core::{DType, Result, Tensor, D};

/// Sparsemax over the last dimension (Martins & Astudillo, 2016)
pub fn sparsemax(xs: &Tensor) -> Result<Tensor> {
    let xs = xs.broadcast_sub(&xs.max_keepdim(D::Minus1)?)?;
    let tau = sparsemax_threshold(&xs.detach())?;
    let support = xs.detach().broadcast_gt(&tau)?.to_dtype(xs.dtype())?;
    let k = support.sum_keepdim(D::Minus1)?;
    let tau = ((&xs * &support)?.sum_keepdim(D::Minus1)? - 1.0)?.broadcast_div(&k)?;
    xs.broadcast_sub(&tau)?.relu()
}

/// 1.5-entmax over the last dimension (Peters et al., 2019)
pub fn entmax15(xs: &Tensor) -> Result<Tensor> {
    let xs = (xs.broadcast_sub(&xs.max_keepdim(D::Minus1)?)? / 2.0)?;
    let tau_star = entmax_threshold(&xs.detach())?;
    let support = xs.detach().broadcast_gt(&tau_star)?.to_dtype(xs.dtype())?;
    let k = support.sum_keepdim(D::Minus1)?;

    let masked = (&xs * &support)?;
    let mean = masked.sum_keepdim(D::Minus1)?.broadcast_div(&k)?;
    let mean_sq = masked.sqr()?.sum_keepdim(D::Minus1)?.broadcast_div(&k)?;
    let ss = ((mean_sq - mean.sqr()?)? * &k)?;
    // floor keeps the sqrt gradient finite when the support is a single element
    let delta = (ss.affine(-1.0, 1.0)?.broadcast_div(&k)?.relu()? + 1e-12)?;
    let tau = (mean - delta.sqrt()?)?;

    xs.broadcast_sub(&tau)?.relu()?.sqr()
}

fn rank_like(xs: &Tensor) -> Result<Tensor> {
    let n = xs.dim(D::Minus1)?;
    Tensor::arange(1u32, n as u32 + 1, xs.device())?.to_dtype(xs.dtype())
}

fn sparsemax_threshold(z: &Tensor) -> Result<Tensor> {
    let (sorted, _) = z.contiguous()?.sort_last_dim(false)?;
    let rho = rank_like(&sorted)?;
    let cumsum = sorted.cumsum(D::Minus1)?;
    let bound = (sorted.broadcast_mul(&rho)? + 1.0)?;
    let support = bound.gt(&cumsum)?.to_dtype(sorted.dtype())?;
    let k = support.sum_keepdim(D::Minus1)?;
    ((sorted * &support)?.sum_keepdim(D::Minus1)? - 1.0)?.broadcast_div(&k)
}

fn entmax_threshold(z: &Tensor) -> Result<Tensor> {
    let (sorted, _) = z.contiguous()?.sort_last_dim(false)?;
    let rho = rank_like(&sorted)?;
    let mean = sorted.cumsum(D::Minus1)?.broadcast_div(&rho)?;
    let mean_sq = sorted.sqr()?.cumsum(D::Minus1)?.broadcast_div(&rho)?;
    let ss = (mean_sq - mean.sqr()?)?.broadcast_mul(&rho)?;
    let delta = ss.affine(-1.0, 1.0)?.broadcast_div(&rho)?;
    let tau = (mean - delta.relu()?.sqrt()?)?;

    let support_size = tau
        .le(&sorted)?
        .to_dtype(DType::F32)?
        .sum_keepdim(D::Minus1)?;
    let idx = (support_size - 1.0)?.to_dtype(DType::U32)?;
    tau.contiguous()?.gather(&idx.contiguous()?, D::Minus1)
}
