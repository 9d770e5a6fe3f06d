//! ULMA objective
//!
//! Rows with a high score are trained with a plain likelihood term, rows with
//! a low score with a point-wise preference term on the log-ratio between the
//! policy and the reference:
//!
//! ```text
//! z      = beta * (log pi(y|x) - log pi_ref(y|x) + constant_zx)
//! ulma   : score * -log pi(y|x)  + (1 - score) * -log sigmoid(-z)
//! dpo    : score * -log sigmoid(z) + (1 - score) * -log sigmoid(-z)
//! ```

use super::logprobs::{log_sigmoid, sequence_logps};
use super::reference::Reference;
use super::{ComputeLoss, LossOutput};
use crate::collator::{Batch, DEFAULT_IGNORE_INDEX};
use crate::hparams::{PreferenceLossType, SftLossType};
use crate::model::CausalLM;
use candle_core::{Result, Tensor};
use std::collections::BTreeMap;

pub struct UlmaLoss<M> {
    beta: f64,
    constant_zx: f64,
    sft_loss_type: SftLossType,
    preference_loss_type: PreferenceLossType,
    reference: Reference<M>,
    ignore_index: i64,
}

impl<M: CausalLM> UlmaLoss<M> {
    pub fn new(
        beta: f64,
        constant_zx: f64,
        sft_loss_type: SftLossType,
        preference_loss_type: PreferenceLossType,
        reference: Reference<M>,
    ) -> Self {
        Self {
            beta,
            constant_zx,
            sft_loss_type,
            preference_loss_type,
            reference,
            ignore_index: DEFAULT_IGNORE_INDEX,
        }
    }

    /// Label value excluded from the log-likelihoods. Must match the
    /// collator's `ignore_index()`.
    pub fn with_ignore_index(mut self, ignore_index: i64) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn reference(&self) -> &Reference<M> {
        &self.reference
    }

    /// Per-row losses and the log-ratio `z`, from per-row log-likelihoods.
    pub fn row_losses(
        &self,
        policy_logps: &Tensor,
        reference_logps: &Tensor,
        score: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let z = ((policy_logps - reference_logps)? + self.constant_zx)?.affine(self.beta, 0.)?;
        let negative_term = log_sigmoid(&z.neg()?)?.neg()?;
        let positive_term = match self.preference_loss_type {
            PreferenceLossType::Ulma => policy_logps.neg()?,
            PreferenceLossType::PointwiseDpo => log_sigmoid(&z)?.neg()?,
        };
        let one_minus_score = score.affine(-1., 1.)?;
        let losses = ((score * positive_term)? + (one_minus_score * negative_term)?)?;
        Ok((losses, z))
    }
}

/// Mean of `values` over rows where `selected` holds
fn masked_mean(values: &[f32], scores: &[f32], selected: impl Fn(f32) -> bool) -> Option<f32> {
    let picked = values
        .iter()
        .zip(scores.iter())
        .filter(|(_, s)| selected(**s))
        .map(|(v, _)| *v)
        .collect::<Vec<_>>();
    if picked.is_empty() {
        None
    } else {
        Some(picked.iter().sum::<f32>() / picked.len() as f32)
    }
}

impl<M: CausalLM> ComputeLoss<M> for UlmaLoss<M> {
    fn compute_loss(&self, model: &M, batch: &Batch, train: bool) -> Result<LossOutput> {
        let score = batch.score()?;
        let mask = Some(&batch.attention_mask);

        let policy_logits = model.logits(&batch.input_ids, mask, train)?;
        let policy_logps = sequence_logps(
            &policy_logits,
            &batch.labels,
            self.ignore_index,
            self.sft_loss_type,
        )?;
        let reference_logits = self.reference.logits(model, &batch.input_ids, mask)?;
        let reference_logps = sequence_logps(
            &reference_logits,
            &batch.labels,
            self.ignore_index,
            self.sft_loss_type,
        )?;

        let (losses, z) = self.row_losses(&policy_logps, &reference_logps, score)?;
        let loss = losses.mean_all()?;

        let scores = score.to_vec1::<f32>()?;
        let rewards = z.detach().to_vec1::<f32>()?;
        let mut metrics = BTreeMap::new();
        if let Some(v) = masked_mean(&rewards, &scores, |s| s >= 0.5) {
            metrics.insert("rewards/positive".to_string(), v);
        }
        if let Some(v) = masked_mean(&rewards, &scores, |s| s < 0.5) {
            metrics.insert("rewards/negative".to_string(), v);
        }
        metrics.insert(
            "logps/policy".to_string(),
            policy_logps.detach().mean_all()?.to_scalar::<f32>()?,
        );
        metrics.insert(
            "logps/reference".to_string(),
            reference_logps.mean_all()?.to_scalar::<f32>()?,
        );
        Ok(LossOutput { loss, metrics })
    }
}
