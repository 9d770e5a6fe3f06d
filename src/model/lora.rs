//! Low-rank adapters (LoRA)
//!
//! A `LinearWithLoRA` owns a regular `candle_nn::Linear` and optionally a
//! `LoRALayer`. The base weights and the adapter weights are created from
//! separate `VarBuilder`s, so only the adapter `VarMap` needs to be handed to
//! the optimizer. Every forward pass can bypass the adapter, which is how the
//! frozen base acts as a reference model without a second copy of the weights.

use candle_core::{Module, Result, Tensor};
use candle_nn::{init, linear_b, Linear, VarBuilder};

/// `alpha * (x @ A @ B)` with `A: (in, rank)` and `B: (rank, out)`
#[derive(Clone, Debug)]
pub struct LoRALayer {
    a: Tensor,
    b: Tensor,
    alpha: f64,
}

impl LoRALayer {
    /// `B` starts at zero so that the adapted layer initially equals the base.
    pub fn new(in_dim: usize, out_dim: usize, rank: usize, alpha: f64, vb: VarBuilder<'_>) -> Result<Self> {
        let a = vb.get_with_hints((in_dim, rank), "A", init::DEFAULT_KAIMING_UNIFORM)?;
        let b = vb.get_with_hints((rank, out_dim), "B", init::ZERO)?;
        Ok(Self { a, b, alpha })
    }

    pub fn rank(&self) -> usize {
        self.a.dims()[1]
    }
}

impl Module for LoRALayer {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.broadcast_matmul(&self.a)?
            .broadcast_matmul(&self.b)?
            .affine(self.alpha, 0.)
    }
}

#[derive(Clone, Debug)]
pub struct LinearWithLoRA {
    linear: Linear,
    lora: Option<LoRALayer>,
}

impl LinearWithLoRA {
    pub fn new(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder<'_>) -> Result<Self> {
        Ok(Self {
            linear: linear_b(in_dim, out_dim, bias, vb)?,
            lora: None,
        })
    }

    /// Attaches an adapter, replacing any existing one.
    pub fn attach_lora(&mut self, rank: usize, alpha: f64, vb: VarBuilder<'_>) -> Result<()> {
        let (out_dim, in_dim) = self.linear.weight().dims2()?;
        self.lora = Some(LoRALayer::new(in_dim, out_dim, rank, alpha, vb)?);
        Ok(())
    }

    pub fn has_lora(&self) -> bool {
        self.lora.is_some()
    }

    pub fn weight(&self) -> &Tensor {
        self.linear.weight()
    }

    pub fn forward_t(&self, xs: &Tensor, use_adapters: bool) -> Result<Tensor> {
        let out = self.linear.forward(xs)?;
        match &self.lora {
            Some(lora) if use_adapters => out + lora.forward(xs)?,
            _ => Ok(out),
        }
    }
}
