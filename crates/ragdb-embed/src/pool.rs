use anyhow::{ensure, Result};
use candle_core::Tensor;

/// Mean of the token states selected by `attention_mask`, then L2-normalized.
/// `hidden` is `[B, T, H]`, `attention_mask` is `[B, T]`; returns `[B, H]`.
pub fn masked_mean_l2(hidden: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
    let (batch, _seq, hidden_dim) = hidden.dims3()?;
    let mask = attention_mask.to_device(hidden.device())?.to_dtype(hidden.dtype())?.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
    let counts = mask.sum(1)?;
    let mean = summed.broadcast_div(&counts)?;
    let pooled = l2_normalize(&mean)?;
    ensure!(
        pooled.dims() == [batch, hidden_dim].as_slice(),
        "pooled shape {:?} != [{batch}, {hidden_dim}]",
        pooled.dims()
    );
    Ok(pooled)
}

/// Row-wise L2 normalization of a `[B, H]` tensor.
pub fn l2_normalize(rows: &Tensor) -> Result<Tensor> {
    let norm = rows.sqr()?.sum_keepdim(1)?.sqrt()?.affine(1.0, 1e-12)?;
    Ok(rows.broadcast_div(&norm)?)
}
