//! Likelihood on preferred answers, unlikelihood on dispreferred ones
//!
//! For each answer token with probability `p`, the unlikelihood term is
//! `-log(max(1 - p, 1e-5))`. Both terms are reduced per row and mixed by the
//! row's score.

use super::logprobs::{answer_token_logps, reduce_rows};
use super::{ComputeLoss, LossOutput};
use crate::collator::{Batch, DEFAULT_IGNORE_INDEX};
use crate::hparams::SftLossType;
use crate::model::CausalLM;
use candle_core::{Result, Tensor};
use std::collections::BTreeMap;

/// Floor on `1 - p` inside the unlikelihood log
pub const UNLIKELIHOOD_EPS: f32 = 1e-5;

#[derive(Debug, Clone)]
pub struct UnlikelihoodLoss {
    sft_loss_type: SftLossType,
    ignore_index: i64,
}

impl UnlikelihoodLoss {
    pub fn new(sft_loss_type: SftLossType) -> Self {
        Self {
            sft_loss_type,
            ignore_index: DEFAULT_IGNORE_INDEX,
        }
    }

    /// Label value excluded from both terms. Must match the collator's
    /// `ignore_index()`.
    pub fn with_ignore_index(mut self, ignore_index: i64) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    /// Per-row `(nll, unlikelihood)` from masked token log-probs `(b, n)`.
    pub fn row_terms(&self, token_logps: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let nll = reduce_rows(token_logps, mask, self.sft_loss_type)?.neg()?;

        let one_minus_p = token_logps.exp()?.affine(-1., 1.)?;
        let ul_tokens = (one_minus_p.maximum(UNLIKELIHOOD_EPS)?.log()?.neg()? * mask)?;
        let ul = reduce_rows(&ul_tokens, mask, self.sft_loss_type)?;
        Ok((nll, ul))
    }
}

impl<M: CausalLM> ComputeLoss<M> for UnlikelihoodLoss {
    fn compute_loss(&self, model: &M, batch: &Batch, train: bool) -> Result<LossOutput> {
        let score = batch.score()?;
        let logits = model.logits(&batch.input_ids, Some(&batch.attention_mask), train)?;
        let (token_logps, mask) = answer_token_logps(&logits, &batch.labels, self.ignore_index)?;
        let (nll, ul) = self.row_terms(&token_logps, &mask)?;

        let one_minus_score = score.affine(-1., 1.)?;
        let losses = ((score * &nll)? + (one_minus_score * &ul)?)?;
        let loss = losses.mean_all()?;

        let mut metrics = BTreeMap::new();
        metrics.insert(
            "loss/likelihood".to_string(),
            nll.detach().mean_all()?.to_scalar::<f32>()?,
        );
        metrics.insert(
            "loss/unlikelihood".to_string(),
            ul.detach().mean_all()?.to_scalar::<f32>()?,
        );
        Ok(LossOutput { loss, metrics })
    }
}
