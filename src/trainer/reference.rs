//! Reference model used by the preference term

use crate::error::{TunerError, TunerResult};
use crate::hparams::ReferenceStrategy;
use crate::model::{CausalLM, GPTModel, ModelHandle};
use candle_core::{Result, Tensor};
use tracing::info;

/// Source of reference logits, fixed for the whole run
pub enum Reference<M> {
    /// A separate model over constant copies of the initial weights
    Frozen(M),
    /// The policy with its adapters bypassed
    ImplicitAdapter,
}

impl<M: CausalLM> Reference<M> {
    /// Detached reference logits for `input_ids`, always in eval mode
    pub fn logits(
        &self,
        policy: &M,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
    ) -> Result<Tensor> {
        let logits = match self {
            Reference::Frozen(model) => model.logits(input_ids, attention_mask, false)?,
            Reference::ImplicitAdapter => policy.base_logits(input_ids, attention_mask, false)?,
        };
        Ok(logits.detach())
    }

    pub fn strategy(&self) -> ReferenceStrategy {
        match self {
            Reference::Frozen(_) => ReferenceStrategy::FullReferenceCopy,
            Reference::ImplicitAdapter => ReferenceStrategy::ImplicitAdapterReference,
        }
    }
}

impl Reference<GPTModel> {
    /// Builds the reference for `strategy` from the model about to be trained.
    pub fn resolve(handle: &ModelHandle, strategy: ReferenceStrategy) -> TunerResult<Self> {
        let reference = match strategy {
            ReferenceStrategy::FullReferenceCopy => Reference::Frozen(handle.frozen_copy()?),
            ReferenceStrategy::ImplicitAdapterReference => {
                if handle.model.num_adapters() == 0 {
                    return Err(TunerError::config(
                        "reference_strategy",
                        "implicit_adapter_reference needs a model with adapters attached",
                    ));
                }
                Reference::ImplicitAdapter
            }
        };
        info!(reference_strategy = %strategy, "Resolved reference model");
        Ok(reference)
    }
}
