//! Per-token and per-row log-probabilities of answer spans

use crate::hparams::SftLossType;
use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops::log_softmax;

/// Log-probability of every next token under `logits`.
///
/// `logits` is `(b, t, vocab)` and `labels` is `(b, t)` i64. Position `i` of
/// the logits predicts label `i + 1`. Returns `(token_logps, mask)`, both
/// `(b, t - 1)` f32; positions whose label equals `ignore_index` are 0 in
/// both.
pub fn answer_token_logps(
    logits: &Tensor,
    labels: &Tensor,
    ignore_index: i64,
) -> Result<(Tensor, Tensor)> {
    let (_b, seq_len, _vocab) = logits.dims3()?;
    if seq_len < 2 {
        candle_core::bail!("need at least two positions to score next tokens, got {seq_len}")
    }
    let shifted_logits = logits.narrow(1, 0, seq_len - 1)?;
    let shifted_labels = labels.narrow(1, 1, seq_len - 1)?;

    let mask = shifted_labels.ne(ignore_index)?;
    // ignore positions gather index 0; their values are masked out below
    let safe_labels = mask
        .where_cond(&shifted_labels, &shifted_labels.zeros_like()?)?
        .to_dtype(DType::U32)?
        .contiguous()?;

    let log_probs = log_softmax(&shifted_logits, D::Minus1)?.contiguous()?;
    let gathered = log_probs
        .gather(&safe_labels.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;

    let mask = mask.to_dtype(DType::F32)?;
    let token_logps = (gathered * &mask)?;
    Ok((token_logps, mask))
}

/// Reduces masked per-token values `(b, n)` to one value per row `(b,)`.
///
/// `Mean` divides by the number of unmasked tokens, clamped to at least 1.
pub fn reduce_rows(values: &Tensor, mask: &Tensor, loss_type: SftLossType) -> Result<Tensor> {
    let sums = values.sum(D::Minus1)?;
    match loss_type {
        SftLossType::Sum => Ok(sums),
        SftLossType::Mean => {
            let counts = mask.sum(D::Minus1)?.maximum(1_f32)?;
            sums / counts
        }
    }
}

/// Reduced answer log-likelihood of each row
pub fn sequence_logps(
    logits: &Tensor,
    labels: &Tensor,
    ignore_index: i64,
    loss_type: SftLossType,
) -> Result<Tensor> {
    let (token_logps, mask) = answer_token_logps(logits, labels, ignore_index)?;
    reduce_rows(&token_logps, &mask, loss_type)
}

/// `log(sigmoid(x))`, stable for large `|x|`
pub fn log_sigmoid(xs: &Tensor) -> Result<Tensor> {
    // min(x, 0) - log(1 + exp(-|x|))
    let softplus_tail = (xs.abs()?.neg()?.exp()? + 1.)?.log()?;
    xs.minimum(0_f32)? - softplus_tail
}
