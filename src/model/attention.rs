//! Causal multi-head attention with key padding

use super::lora::LinearWithLoRA;
use candle_core::{DType, Device, Result, Tensor, D};
use candle_nn::{ops::softmax, Dropout, VarBuilder};

/// Added to attention scores of padded keys. Finite so that rows made only of
/// padding (left-padded prompts) still softmax to a valid distribution.
const PADDING_BIAS: f64 = -1e9;

/// Returns a `(seq_len, seq_len)` mask that is 1 above the diagonal
pub fn get_causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<u8> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| u8::from(j > i)))
        .collect();
    Tensor::from_slice(&mask, (seq_len, seq_len), device)
}

pub fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> Result<Tensor> {
    let shape = on_false.shape();
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(shape.dims())?;
    let mask = mask.broadcast_as(shape.dims())?;
    mask.where_cond(&on_true, on_false)
}

#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    num_heads: usize,
    d_out: usize,
    head_dim: usize,
    w_query: LinearWithLoRA,
    w_key: LinearWithLoRA,
    w_value: LinearWithLoRA,
    out_proj: LinearWithLoRA,
    scaling: f64,
    dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(
        d_in: usize,
        d_out: usize,
        drop_p: f32,
        num_heads: usize,
        qkv_bias: bool,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        if d_out % num_heads != 0 {
            candle_core::bail!("`d_out` must be divisible by `num_heads`")
        }
        let head_dim = d_out / num_heads;
        Ok(Self {
            num_heads,
            d_out,
            head_dim,
            w_query: LinearWithLoRA::new(d_in, d_out, qkv_bias, vb.pp("query"))?,
            w_key: LinearWithLoRA::new(d_in, d_out, qkv_bias, vb.pp("key"))?,
            w_value: LinearWithLoRA::new(d_in, d_out, qkv_bias, vb.pp("value"))?,
            out_proj: LinearWithLoRA::new(d_out, d_out, true, vb.pp("out_proj"))?,
            scaling: 1. / (head_dim as f64).sqrt(),
            dropout: Dropout::new(drop_p),
        })
    }

    pub fn num_heads(&self) -> usize {
        self.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn w_query(&self) -> &LinearWithLoRA {
        &self.w_query
    }

    pub(crate) fn linears_mut(&mut self) -> [&mut LinearWithLoRA; 4] {
        [
            &mut self.w_query,
            &mut self.w_key,
            &mut self.w_value,
            &mut self.out_proj,
        ]
    }

    /// Splits `(b, t, d_out)` into `(b, num_heads, t, head_dim)`
    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, num_tokens, _d_out) = xs.dims3()?;
        xs.reshape((b, num_tokens, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Computes context vectors for `xs` of shape `(b, t, d_in)`.
    ///
    /// `attention_mask` is `(b, t)` with 1 for real tokens and 0 for padding.
    pub fn forward_t(
        &self,
        xs: &Tensor,
        attention_mask: Option<&Tensor>,
        train: bool,
        use_adapters: bool,
    ) -> Result<Tensor> {
        let (b, num_tokens, _d_in) = xs.dims3()?;
        let queries = self.split_heads(&self.w_query.forward_t(xs, use_adapters)?)?;
        let keys = self.split_heads(&self.w_key.forward_t(xs, use_adapters)?)?;
        let values = self.split_heads(&self.w_value.forward_t(xs, use_adapters)?)?;

        let mut attn_scores = (queries.matmul(&keys.t()?.contiguous()?)? * self.scaling)?;
        if let Some(attention_mask) = attention_mask {
            let padding = attention_mask
                .eq(0u32)?
                .to_dtype(DType::F32)?
                .reshape((b, 1, 1, num_tokens))?;
            attn_scores = attn_scores.broadcast_add(&(padding * PADDING_BIAS)?)?;
        }
        let causal_mask = get_causal_mask(num_tokens, xs.device())?;
        let masked = masked_fill(&attn_scores, &causal_mask, f32::NEG_INFINITY)?;

        let mut attn_weights = softmax(&masked, D::Minus1)?;
        attn_weights = self.dropout.forward(&attn_weights, train)?;

        let context_vec = attn_weights
            .matmul(&values)?
            .transpose(1, 2)?
            .reshape((b, num_tokens, self.d_out))?
            .contiguous()?;
        self.out_proj.forward_t(&context_vec, use_adapters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_core::IndexOp;
    use candle_nn::VarMap;
    use rstest::*;

    #[fixture]
    pub fn vb() -> VarBuilder<'static> {
        let dev = Device::cuda_if_available(0).unwrap();
        let varmap = VarMap::new();
        VarBuilder::from_varmap(&varmap, DType::F32, &dev)
    }

    #[rstest]
    fn test_causal_mask() -> Result<()> {
        let mask = get_causal_mask(3_usize, &Device::Cpu)?;
        assert_eq!(
            mask.to_vec2::<u8>()?,
            &[[0_u8, 1, 1], [0, 0, 1], [0, 0, 0]]
        );
        Ok(())
    }

    #[rstest]
    fn test_mha_init(vb: VarBuilder<'_>) -> Result<()> {
        let (d_in, d_out, num_heads) = (6_usize, 6_usize, 2_usize);
        let mha = MultiHeadAttention::new(d_in, d_out, 0.5_f32, num_heads, false, vb.pp("attn"))?;

        assert_eq!(mha.num_heads(), num_heads);
        assert_eq!(mha.head_dim(), d_out / num_heads);
        assert_eq!(mha.w_query().weight().dims(), &[d_out, d_in]);
        Ok(())
    }

    #[rstest]
    fn test_mha_rejects_uneven_heads(vb: VarBuilder<'_>) {
        assert!(MultiHeadAttention::new(6, 5, 0.0, 2, false, vb.pp("attn")).is_err());
    }

    #[rstest]
    fn test_mha_forward_shape(vb: VarBuilder<'_>) -> Result<()> {
        let (d_in, d_out, num_heads) = (4_usize, 6_usize, 3_usize);
        let mha = MultiHeadAttention::new(d_in, d_out, 0.0_f32, num_heads, true, vb.pp("attn"))?;
        let input = Tensor::rand(0f32, 1f32, (2_usize, 5_usize, d_in), vb.device())?;
        let context_vectors = mha.forward_t(&input, None, false, true)?;
        assert_eq!(context_vectors.dims(), &[2_usize, 5_usize, d_out]);
        Ok(())
    }

    #[rstest]
    fn test_padding_mask_hides_pad_keys(vb: VarBuilder<'_>) -> Result<()> {
        let (d_in, d_out, num_heads) = (4_usize, 4_usize, 2_usize);
        let mha = MultiHeadAttention::new(d_in, d_out, 0.0_f32, num_heads, true, vb.pp("attn"))?;
        let input = Tensor::rand(0f32, 1f32, (1_usize, 4_usize, d_in), vb.device())?;

        // left padding of one token: real tokens must not see the pad key
        let mask = Tensor::new(&[[0_u32, 1, 1, 1]], vb.device())?;
        let masked = mha.forward_t(&input, Some(&mask), false, true)?;

        // same real tokens without the pad position
        let unpadded = mha.forward_t(&input.i((.., 1.., ..))?, None, false, true)?;

        let diff = (masked.i((.., 1.., ..))? - unpadded)?
            .abs()?
            .max_all()?
            .to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        // pad-only row still yields finite values
        let pad_row = masked.i((0, 0))?.to_vec1::<f32>()?;
        assert!(pad_row.iter().all(|v| v.is_finite()));
        Ok(())
    }
}
