//! GPT-style causal language model
//!
//! The model is deliberately small and plain: the workflows only need a
//! handle that maps `(input_ids, attention_mask)` to next-token logits, with
//! the option of running the frozen base when adapters are attached.

pub mod attention;
pub mod lora;

use crate::error::{TunerError, TunerResult};
use crate::hparams::{FinetuningArguments, FinetuningType, ModelArguments};
use crate::tokenizer::Tokenizer;
use attention::MultiHeadAttention;
use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{embedding, Dropout, Embedding, VarBuilder, VarMap};
use lora::LinearWithLoRA;
use std::collections::HashMap;
use tracing::info;

const EPS: f32 = 1e-5;

/// Config for specifying parameters of a GPT-2 model
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Config {
    pub vocab_size: usize,
    pub context_length: usize,
    pub emb_dim: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub drop_rate: f32,
    pub qkv_bias: bool,
}

impl Config {
    /// Returns configuration for GPT-2 small
    pub fn gpt2_124m() -> Self {
        Self {
            vocab_size: 50_257,
            context_length: 1_024,
            emb_dim: 768,
            n_heads: 12,
            n_layers: 12,
            drop_rate: 0.1,
            qkv_bias: false,
        }
    }

    /// Returns configuration for GPT-2 medium
    pub fn gpt2_medium() -> Self {
        Self {
            vocab_size: 50_257,
            context_length: 1_024,
            emb_dim: 1_024,
            n_heads: 16,
            n_layers: 24,
            drop_rate: 0.1,
            qkv_bias: false,
        }
    }

    /// Returns configuration for GPT-2 large
    pub fn gpt2_large() -> Self {
        Self {
            vocab_size: 50_257,
            context_length: 1_024,
            emb_dim: 1_280,
            n_heads: 20,
            n_layers: 36,
            drop_rate: 0.1,
            qkv_bias: false,
        }
    }

    /// Returns configuration for GPT-2 x-large
    pub fn gpt2_xlarge() -> Self {
        Self {
            vocab_size: 50_257,
            context_length: 1_024,
            emb_dim: 1_600,
            n_heads: 25,
            n_layers: 48,
            drop_rate: 0.1,
            qkv_bias: false,
        }
    }

    /// Returns a custom configuration for GPT-2 to be used in unit tests
    pub fn gpt_sm_test() -> Self {
        Self {
            vocab_size: 500,
            context_length: 10,
            emb_dim: 12,
            n_heads: 3,
            n_layers: 2,
            drop_rate: 0.1,
            qkv_bias: false,
        }
    }
}

/// A model that produces next-token logits of shape `(b, t, vocab_size)`
pub trait CausalLM {
    fn logits(&self, input_ids: &Tensor, attention_mask: Option<&Tensor>, train: bool)
        -> Result<Tensor>;

    /// Logits with every adapter bypassed. Equals `logits` for models
    /// without adapters.
    fn base_logits(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor>;

    fn num_adapters(&self) -> usize;
}

/// A layer normalization struct
#[derive(Clone, Debug)]
pub struct LayerNorm {
    eps: f32,
    scale: Tensor,
    shift: Tensor,
}

impl LayerNorm {
    pub fn new(emb_dim: usize, vb: VarBuilder<'_>) -> Result<Self> {
        let scale = vb.get_with_hints(emb_dim, "scale", candle_nn::Init::Const(1.))?;
        let shift = vb.get_with_hints(emb_dim, "shift", candle_nn::Init::Const(0.))?;
        Ok(Self {
            eps: EPS,
            scale,
            shift,
        })
    }
}

impl Module for LayerNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mean = xs.mean_keepdim(D::Minus1)?;
        let var = xs.var_keepdim(D::Minus1)?;
        let norm_xs = xs.broadcast_sub(&mean)?.broadcast_div(
            &(var.broadcast_add(&Tensor::new(&[self.eps], xs.device())?)?).sqrt()?,
        )?;
        norm_xs
            .broadcast_mul(&self.scale)?
            .broadcast_add(&self.shift)
    }
}

/// A feed forward neural network module
///
/// Kept as explicit layers rather than `candle_nn::Sequential` so that the
/// linear layers can carry adapters.
#[derive(Clone, Debug)]
pub struct FeedForward {
    first_layer: LinearWithLoRA,
    second_layer: LinearWithLoRA,
}

impl FeedForward {
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            first_layer: LinearWithLoRA::new(
                cfg.emb_dim,
                4_usize * cfg.emb_dim,
                true,
                vb.pp("first_layer"),
            )?,
            second_layer: LinearWithLoRA::new(
                4_usize * cfg.emb_dim,
                cfg.emb_dim,
                true,
                vb.pp("second_layer"),
            )?,
        })
    }

    pub fn forward_t(&self, xs: &Tensor, use_adapters: bool) -> Result<Tensor> {
        let xs = self.first_layer.forward_t(xs, use_adapters)?.gelu()?;
        self.second_layer.forward_t(&xs, use_adapters)
    }
}

/// The transformer block component of GPT
#[derive(Clone, Debug)]
pub struct TransformerBlock {
    att: MultiHeadAttention,
    ff: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    drop_shortcut: Dropout,
}

impl TransformerBlock {
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        let att = MultiHeadAttention::new(
            cfg.emb_dim,
            cfg.emb_dim,
            cfg.drop_rate,
            cfg.n_heads,
            cfg.qkv_bias,
            vb.pp("mha"),
        )?;
        let ff = FeedForward::new(cfg, vb.pp("ff"))?;
        let norm1 = LayerNorm::new(cfg.emb_dim, vb.pp("norm1"))?;
        let norm2 = LayerNorm::new(cfg.emb_dim, vb.pp("norm2"))?;
        let drop_shortcut = Dropout::new(cfg.drop_rate);
        Ok(Self {
            att,
            ff,
            norm1,
            norm2,
            drop_shortcut,
        })
    }

    fn linears_mut(&mut self) -> Vec<(&'static str, &mut LinearWithLoRA)> {
        let [query, key, value, out_proj] = self.att.linears_mut();
        vec![
            ("mha.query", query),
            ("mha.key", key),
            ("mha.value", value),
            ("mha.out_proj", out_proj),
            ("ff.first_layer", &mut self.ff.first_layer),
            ("ff.second_layer", &mut self.ff.second_layer),
        ]
    }

    pub fn forward_t(
        &self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
        use_adapters: bool,
    ) -> Result<Tensor> {
        let shortcut = xs.to_owned();
        let mut x = self.norm1.forward(xs)?;
        x = self.att.forward_t(&x, attention_mask, train, use_adapters)?;
        x = self.drop_shortcut.forward(&x, train)?;
        x = (x + shortcut)?;

        let shortcut = x.clone();
        x = self.norm2.forward(&x)?;
        x = self.ff.forward_t(&x, use_adapters)?;
        x = self.drop_shortcut.forward(&x, train)?;
        x + shortcut
    }
}

/// The GPT model architecture implementation
#[derive(Clone, Debug)]
pub struct GPTModel {
    tok_emb: Embedding,
    pos_emb: Embedding,
    drop_emb: Dropout,
    trf_blocks: Vec<TransformerBlock>,
    final_norm: LayerNorm,
    out_head: LinearWithLoRA,
    num_adapters: usize,
}

impl GPTModel {
    /// Creates a new `GPTModel`
    ///
    /// ```rust
    /// use candle_core::{Device, DType};
    /// use candle_nn::{VarBuilder, VarMap};
    /// use llmtuner_rs::model::{Config, GPTModel};
    ///
    /// let dev = Device::cuda_if_available(0).unwrap();
    /// let varmap = VarMap::new();
    /// let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    ///
    /// let cfg = Config::gpt_sm_test();
    /// let model = GPTModel::new(cfg, vb).unwrap();
    /// ```
    pub fn new(cfg: Config, vb: VarBuilder<'_>) -> Result<Self> {
        let tok_emb = embedding(cfg.vocab_size, cfg.emb_dim, vb.pp("tok_emb"))?;
        let pos_emb = embedding(cfg.context_length, cfg.emb_dim, vb.pp("pos_emb"))?;
        let drop_emb = Dropout::new(cfg.drop_rate);
        let trf_blocks = (0..cfg.n_layers)
            .map(|ix| TransformerBlock::new(cfg, vb.pp(format!("trf.{}", ix))))
            .collect::<Result<Vec<_>>>()?;
        let final_norm = LayerNorm::new(cfg.emb_dim, vb.pp("final_norm"))?;
        let out_head = LinearWithLoRA::new(cfg.emb_dim, cfg.vocab_size, false, vb.pp("out_head"))?;
        Ok(Self {
            tok_emb,
            pos_emb,
            drop_emb,
            trf_blocks,
            final_norm,
            out_head,
            num_adapters: 0,
        })
    }

    /// Attaches a LoRA adapter to every linear layer.
    ///
    /// Adapter weights are created through `vb`, which should be backed by a
    /// `VarMap` distinct from the base weights.
    pub fn with_lora(mut self, rank: usize, alpha: f64, vb: VarBuilder<'_>) -> Result<Self> {
        let mut num_adapters = 0_usize;
        for (ix, block) in self.trf_blocks.iter_mut().enumerate() {
            for (name, linear) in block.linears_mut() {
                linear.attach_lora(rank, alpha, vb.pp(format!("trf.{}.{}", ix, name)))?;
                num_adapters += 1;
            }
        }
        self.out_head.attach_lora(rank, alpha, vb.pp("out_head"))?;
        self.num_adapters = num_adapters + 1;
        Ok(self)
    }

    pub fn forward_t(
        &self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
        use_adapters: bool,
    ) -> Result<Tensor> {
        let (_batch_size, seq_len) = xs.dims2()?;
        let context_length = self.pos_emb.embeddings().dim(0)?;
        if seq_len > context_length {
            candle_core::bail!(
                "sequence of {seq_len} tokens exceeds the context length of {context_length}"
            )
        }
        let tok_embeds = self.tok_emb.forward(xs)?;
        let pos_ids = Tensor::arange(0u32, seq_len as u32, xs.device())?;
        let pos_embeds = self.pos_emb.embeddings().index_select(&pos_ids, 0)?;

        let mut x = tok_embeds.broadcast_add(&pos_embeds)?;
        x = self.drop_emb.forward(&x, train)?;
        for block in self.trf_blocks.iter() {
            x = block.forward_t(&x, attention_mask, train, use_adapters)?;
        }
        x = self.final_norm.forward(&x)?;
        self.out_head.forward_t(&x, use_adapters)
    }
}

impl CausalLM for GPTModel {
    fn logits(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        self.forward_t(input_ids, attention_mask, train, true)
    }

    fn base_logits(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        self.forward_t(input_ids, attention_mask, train, false)
    }

    fn num_adapters(&self) -> usize {
        self.num_adapters
    }
}

/// A loaded model together with the `VarMap`s backing its weights
pub struct ModelHandle {
    pub model: GPTModel,
    pub cfg: Config,
    base_varmap: VarMap,
    adapter_varmap: Option<VarMap>,
    device: Device,
}

impl ModelHandle {
    /// Builds the model, loads initial weights if given and attaches adapters
    /// for LoRA fine-tuning.
    pub fn load(
        model_args: &ModelArguments,
        finetuning_args: &FinetuningArguments,
        vocab_size: usize,
        device: &Device,
    ) -> TunerResult<Self> {
        let mut cfg = model_args.model_preset.config();
        cfg.qkv_bias = model_args.qkv_bias;
        if cfg.vocab_size < vocab_size {
            return Err(TunerError::config(
                "model_preset",
                format!(
                    "vocabulary of {} tokens does not fit the tokenizer's {}",
                    cfg.vocab_size, vocab_size
                ),
            ));
        }

        let mut base_varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&base_varmap, DType::F32, device);
        let model = GPTModel::new(cfg, vb.pp("model"))?;
        if let Some(path) = &model_args.model_name_or_path {
            info!(path = %path.display(), "Loading model weights");
            base_varmap.load(path)?;
        }

        let (model, adapter_varmap) = match finetuning_args.finetuning_type {
            FinetuningType::Full => (model, None),
            FinetuningType::Lora => {
                let adapter_varmap = VarMap::new();
                let adapter_vb = VarBuilder::from_varmap(&adapter_varmap, DType::F32, device);
                let model = model.with_lora(
                    finetuning_args.lora_rank,
                    finetuning_args.lora_alpha,
                    adapter_vb.pp("model"),
                )?;
                (model, Some(adapter_varmap))
            }
        };

        let handle = Self {
            model,
            cfg,
            base_varmap,
            adapter_varmap,
            device: device.clone(),
        };
        info!(
            finetuning_type = %finetuning_args.finetuning_type,
            trainable_params = handle.num_trainable_parameters(),
            total_params = handle.num_parameters(),
            "Model loaded"
        );
        Ok(handle)
    }

    /// The `VarMap` whose variables are optimized
    pub fn trainable_varmap(&self) -> &VarMap {
        self.adapter_varmap.as_ref().unwrap_or(&self.base_varmap)
    }

    pub fn base_varmap(&self) -> &VarMap {
        &self.base_varmap
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn num_trainable_parameters(&self) -> usize {
        count_parameters(self.trainable_varmap())
    }

    pub fn num_parameters(&self) -> usize {
        count_parameters(&self.base_varmap)
            + self.adapter_varmap.as_ref().map(count_parameters).unwrap_or(0)
    }

    /// Builds a copy of the base model backed by constant tensors.
    ///
    /// The copy shares no storage with the live weights and is never seen by
    /// an optimizer, so it keeps the initial weights for the whole run.
    pub fn frozen_copy(&self) -> Result<GPTModel> {
        let vb = frozen_var_builder(&self.base_varmap, DType::F32, &self.device)?;
        GPTModel::new(self.cfg, vb.pp("model"))
    }
}

fn count_parameters(varmap: &VarMap) -> usize {
    varmap.all_vars().iter().map(|v| v.elem_count()).sum()
}

/// A `VarBuilder` over detached copies of every variable in `varmap`
pub fn frozen_var_builder(
    varmap: &VarMap,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| candle_core::Error::Msg(format!("VarMap lock poisoned: {e}")))?;
    let tensors = data
        .iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?.detach())))
        .collect::<Result<HashMap<String, Tensor>>>()?;
    Ok(VarBuilder::from_tensors(tensors, dtype, device))
}

/// Loads the tokenizer and the model for a fine-tuning run
pub fn load_model_and_tokenizer(
    model_args: &ModelArguments,
    finetuning_args: &FinetuningArguments,
    device: &Device,
) -> TunerResult<(ModelHandle, Tokenizer)> {
    let tokenizer = Tokenizer::from_name_or_path(&model_args.tokenizer, model_args.padding_side)?;
    let handle = ModelHandle::load(model_args, finetuning_args, tokenizer.vocab_size(), device)?;
    Ok((handle, tokenizer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hparams::ModelPreset;
    use anyhow::Result;
    use rstest::*;

    #[fixture]
    pub fn vb() -> VarBuilder<'static> {
        let dev = Device::cuda_if_available(0).unwrap();
        let varmap = VarMap::new();
        VarBuilder::from_varmap(&varmap, DType::F32, &dev)
    }

    #[fixture]
    pub fn batch_token_ids() -> Tensor {
        let dev = Device::cuda_if_available(0).unwrap();
        Tensor::new(&[[101_u32, 366, 100, 345], [101, 110, 322, 57]], &dev).unwrap()
    }

    #[fixture]
    fn tiny_model_args() -> ModelArguments {
        ModelArguments {
            model_preset: ModelPreset::Tiny,
            ..Default::default()
        }
    }

    #[rstest]
    fn test_gpt_model_init(vb: VarBuilder<'_>) -> Result<()> {
        let cfg = Config::gpt_sm_test();
        let model = GPTModel::new(cfg, vb)?;

        assert_eq!(model.pos_emb.hidden_size(), cfg.emb_dim);
        assert_eq!(model.tok_emb.hidden_size(), cfg.emb_dim);
        assert_eq!(model.trf_blocks.len(), cfg.n_layers);
        assert_eq!(
            model.out_head.weight().dims(),
            &[cfg.vocab_size, cfg.emb_dim]
        );
        assert_eq!(model.num_adapters(), 0_usize);
        Ok(())
    }

    #[rstest]
    fn test_gpt_model_forward(vb: VarBuilder<'_>, batch_token_ids: Tensor) -> Result<()> {
        let (batch_size, seq_len) = batch_token_ids.dims2()?;

        let cfg = Config::gpt_sm_test();
        let model = GPTModel::new(cfg, vb)?;
        let mask = batch_token_ids.ones_like()?;

        let logits = model.logits(&batch_token_ids, Some(&mask), false)?;

        assert_eq!(logits.dims(), &[batch_size, seq_len, cfg.vocab_size]);
        Ok(())
    }

    #[rstest]
    fn test_with_lora_counts_adapters(batch_token_ids: Tensor) -> Result<()> {
        let dev = batch_token_ids.device().clone();
        let cfg = Config::gpt_sm_test();
        let varmap = VarMap::new();
        let adapter_varmap = VarMap::new();
        let model = GPTModel::new(cfg, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
        let model = model.with_lora(
            2_usize,
            4_f64,
            VarBuilder::from_varmap(&adapter_varmap, DType::F32, &dev),
        )?;

        // six linears per block plus the output head, each with A and B
        let expected_adapters = 6 * cfg.n_layers + 1;
        assert_eq!(model.num_adapters(), expected_adapters);
        assert_eq!(adapter_varmap.all_vars().len(), 2 * expected_adapters);

        // fresh adapters leave the model output unchanged
        let policy = model.logits(&batch_token_ids, None, false)?;
        let base = model.base_logits(&batch_token_ids, None, false)?;
        let diff = (policy - base)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0_f32);
        Ok(())
    }

    #[rstest]
    fn test_model_handle_trainable_varmap(tiny_model_args: ModelArguments) -> Result<()> {
        let dev = Device::cuda_if_available(0)?;
        let full = ModelHandle::load(&tiny_model_args, &FinetuningArguments::default(), 500, &dev)?;
        assert_eq!(full.num_trainable_parameters(), full.num_parameters());

        let lora_args = FinetuningArguments {
            finetuning_type: FinetuningType::Lora,
            lora_rank: 2,
            ..Default::default()
        };
        let lora = ModelHandle::load(&tiny_model_args, &lora_args, 500, &dev)?;
        assert!(lora.num_trainable_parameters() < lora.num_parameters());
        assert_eq!(lora.model.num_adapters(), 6 * lora.cfg.n_layers + 1);
        Ok(())
    }

    #[rstest]
    fn test_model_handle_rejects_small_vocab(tiny_model_args: ModelArguments) -> Result<()> {
        let dev = Device::cuda_if_available(0)?;
        let result = ModelHandle::load(
            &tiny_model_args,
            &FinetuningArguments::default(),
            50_257,
            &dev,
        );
        assert!(result.is_err());
        Ok(())
    }

    #[rstest]
    fn test_frozen_copy_matches_and_detaches(
        tiny_model_args: ModelArguments,
        batch_token_ids: Tensor,
    ) -> Result<()> {
        let dev = batch_token_ids.device().clone();
        let handle = ModelHandle::load(&tiny_model_args, &FinetuningArguments::default(), 500, &dev)?;
        let frozen = handle.frozen_copy()?;

        let live = handle.model.logits(&batch_token_ids, None, false)?;
        let copied = frozen.logits(&batch_token_ids, None, false)?;
        let diff = (&live - &copied)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0_f32);

        // perturb the live weights; the copy must not follow
        for var in handle.base_varmap().all_vars() {
            var.set(&var.as_tensor().affine(0., 0.5)?)?;
        }
        let live = handle.model.logits(&batch_token_ids, None, false)?;
        let copied_again = frozen.logits(&batch_token_ids, None, false)?;
        let diff = (live - &copied_again)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff > 0_f32);
        let diff = (&copied - &copied_again)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0_f32);
        Ok(())
    }
}
