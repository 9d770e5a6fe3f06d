//! Preference fine-tuning of GPT-style language models with candle
//!
//! Two objectives are supported: ULMA, which mixes supervised likelihood on
//! preferred answers with a preference term against a reference model, and
//! unlikelihood training, which pushes probability away from dispreferred
//! answers. See [`workflow`] for the end-to-end entry points.

pub mod collator;
pub mod data;
pub mod dataloader;
pub mod error;
pub mod hparams;
pub mod model;
pub mod plotting;
pub mod tokenizer;
pub mod trainer;
pub mod workflow;

pub use error::{TunerError, TunerResult};
