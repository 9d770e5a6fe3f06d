//! Hyper-parameters for the fine-tuning workflows
//!
//! The four argument groups mirror how a run is described end-to-end: which
//! model to load, which data to train on, how the loop runs and which
//! objective is optimized. Every group is a `clap::Args` so the binary can
//! flatten it into a subcommand, and `serde` (de)serializable so a run can be
//! described by a JSON file and recorded next to its outputs.

use crate::collator::PaddingSide;
use crate::error::{TunerError, TunerResult};
use crate::model::Config;
use clap::{ArgAction, Args, ValueEnum};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, path::PathBuf, str::FromStr};

/// Implements `FromStr` + `Display` for a unit-variant enum from a fixed table
/// of names, rejecting anything else.
macro_rules! named_variants {
    ($ty:ident, $field:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = TunerError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(Self::$variant),)+
                    other => Err(TunerError::config(
                        $field,
                        format!(
                            "unknown variant `{}`, expected one of: {}",
                            other,
                            [$($name),+].join(", ")
                        ),
                    )),
                }
            }
        }

        impl Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let name = match self {
                    $(Self::$variant => $name,)+
                };
                write!(f, "{}", name)
            }
        }
    };
}

/// How per-token log-probabilities of an answer are reduced to one value per row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SftLossType {
    /// Sum over answer tokens (sequence log-likelihood)
    #[default]
    Sum,
    /// Average over answer tokens (length-normalized)
    Mean,
}

named_variants!(SftLossType, "sft_loss_type", {
    Sum => "sum",
    Mean => "mean",
});

/// Point-wise preference objective used by ULMA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceLossType {
    /// Supervised term on positive rows, `-log sigmoid(-z)` on negative rows
    #[default]
    Ulma,
    /// `-log sigmoid(z)` on positive rows, `-log sigmoid(-z)` on negative rows
    PointwiseDpo,
}

named_variants!(PreferenceLossType, "preference_loss_type", {
    Ulma => "ulma",
    PointwiseDpo => "pointwise_dpo",
});

/// Which parameters are trained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinetuningType {
    /// All model weights are trainable
    #[default]
    Full,
    /// Low-rank adapters on top of a frozen base
    Lora,
}

named_variants!(FinetuningType, "finetuning_type", {
    Full => "full",
    Lora => "lora",
});

/// Where reference log-probabilities come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceStrategy {
    /// A frozen copy of the initial weights
    FullReferenceCopy,
    /// The policy itself with its adapters bypassed
    ImplicitAdapterReference,
}

named_variants!(ReferenceStrategy, "reference_strategy", {
    FullReferenceCopy => "full_reference_copy",
    ImplicitAdapterReference => "implicit_adapter_reference",
});

impl ReferenceStrategy {
    /// Default reference for a given fine-tuning type
    pub fn for_finetuning_type(finetuning_type: FinetuningType) -> Self {
        match finetuning_type {
            FinetuningType::Full => Self::FullReferenceCopy,
            FinetuningType::Lora => Self::ImplicitAdapterReference,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerType {
    Constant,
    #[default]
    Linear,
}

named_variants!(LrSchedulerType, "lr_scheduler_type", {
    Constant => "constant",
    Linear => "linear",
});

/// Prompt template applied to instruction records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptTemplate {
    #[default]
    Alpaca,
    Phi3,
}

named_variants!(PromptTemplate, "prompt_template", {
    Alpaca => "alpaca",
    Phi3 => "phi3",
});

/// GPT-2 sized model presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum ModelPreset {
    #[default]
    Gpt2Small,
    Gpt2Medium,
    Gpt2Large,
    Gpt2Xlarge,
    /// Tiny configuration, handy for smoke runs
    Tiny,
}

impl ModelPreset {
    pub fn config(&self) -> Config {
        match self {
            ModelPreset::Gpt2Small => Config::gpt2_124m(),
            ModelPreset::Gpt2Medium => Config::gpt2_medium(),
            ModelPreset::Gpt2Large => Config::gpt2_large(),
            ModelPreset::Gpt2Xlarge => Config::gpt2_xlarge(),
            ModelPreset::Tiny => Config::gpt_sm_test(),
        }
    }
}

/// Arguments pertaining to which model and tokenizer are loaded
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelArguments {
    /// Architecture preset of the model
    #[arg(long, value_enum, default_value_t = ModelPreset::Gpt2Small)]
    pub model_preset: ModelPreset,

    /// Safetensors file holding initial weights (random init when absent)
    #[arg(long)]
    pub model_name_or_path: Option<PathBuf>,

    /// Use bias terms in the attention query/key/value projections
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub qkv_bias: bool,

    /// `gpt2` (tiktoken) or a path to a HuggingFace `tokenizer.json`
    #[arg(long, default_value = "gpt2")]
    pub tokenizer: String,

    /// Side on which batches are padded: `left` or `right`
    #[arg(long, default_value_t = PaddingSide::Right)]
    pub padding_side: PaddingSide,

    /// Render loss curves after training
    #[arg(long)]
    pub plot_loss: bool,
}

impl Default for ModelArguments {
    fn default() -> Self {
        Self {
            model_preset: ModelPreset::default(),
            model_name_or_path: None,
            qkv_bias: true,
            tokenizer: "gpt2".to_string(),
            padding_side: PaddingSide::Right,
            plot_loss: false,
        }
    }
}

/// Arguments pertaining to the data used for training and evaluation
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct DataArguments {
    /// JSON or JSONL dataset files
    #[arg(long = "dataset", num_args = 1..)]
    pub dataset: Vec<PathBuf>,

    /// Template used to turn instruction records into prompts
    #[arg(long, default_value_t = PromptTemplate::Alpaca)]
    pub prompt_template: PromptTemplate,

    /// Maximum number of prompt tokens kept after tokenization
    #[arg(long, default_value_t = 512)]
    pub max_source_length: usize,

    /// Maximum number of answer tokens kept after tokenization
    #[arg(long, default_value_t = 512)]
    pub max_target_length: usize,

    /// Truncate the number of examples (for debugging)
    #[arg(long)]
    pub max_samples: Option<usize>,

    /// Fraction of the dataset held out for evaluation
    #[arg(long, default_value_t = 0.0)]
    pub val_size: f32,

    /// Mask pad positions in labels with the ignore index
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub ignore_pad_token_for_loss: bool,
}

impl Default for DataArguments {
    fn default() -> Self {
        Self {
            dataset: vec![],
            prompt_template: PromptTemplate::Alpaca,
            max_source_length: 512,
            max_target_length: 512,
            max_samples: None,
            val_size: 0.0,
            ignore_pad_token_for_loss: true,
        }
    }
}

impl DataArguments {
    pub fn validate(&self) -> TunerResult<()> {
        if !(0.0..1.0).contains(&self.val_size) {
            return Err(TunerError::config("val_size", "must be in [0, 1)"));
        }
        if self.max_target_length == 0 {
            return Err(TunerError::config("max_target_length", "must be positive"));
        }
        Ok(())
    }
}

/// Arguments pertaining to the training loop
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingArguments {
    /// Directory receiving checkpoints, metrics and plots
    #[arg(long, default_value = "output")]
    pub output_dir: PathBuf,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub do_train: bool,

    #[arg(long, default_value_t = 1)]
    pub num_train_epochs: usize,

    #[arg(long, default_value_t = 4)]
    pub per_device_train_batch_size: usize,

    #[arg(long, default_value_t = 4)]
    pub per_device_eval_batch_size: usize,

    #[arg(long, default_value_t = 1)]
    pub gradient_accumulation_steps: usize,

    #[arg(long, default_value_t = 5e-5)]
    pub learning_rate: f64,

    #[arg(long, default_value_t = 0.0)]
    pub weight_decay: f64,

    #[arg(long, default_value_t = LrSchedulerType::Linear)]
    pub lr_scheduler_type: LrSchedulerType,

    #[arg(long, default_value_t = 0)]
    pub warmup_steps: usize,

    /// Log the running loss every N optimizer steps
    #[arg(long, default_value_t = 10)]
    pub logging_steps: usize,

    /// Evaluate every N optimizer steps (only if an eval split exists)
    #[arg(long)]
    pub eval_steps: Option<usize>,

    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Safetensors checkpoint of trainable weights to resume from
    #[arg(long)]
    pub resume_from_checkpoint: Option<PathBuf>,

    /// Rank of this process; side effects run on rank 0 only
    #[arg(long, default_value_t = 0)]
    pub process_index: usize,

    /// Train on CPU even when CUDA is available
    #[arg(long)]
    pub no_cuda: bool,
}

impl Default for TrainingArguments {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            do_train: true,
            num_train_epochs: 1,
            per_device_train_batch_size: 4,
            per_device_eval_batch_size: 4,
            gradient_accumulation_steps: 1,
            learning_rate: 5e-5,
            weight_decay: 0.0,
            lr_scheduler_type: LrSchedulerType::Linear,
            warmup_steps: 0,
            logging_steps: 10,
            eval_steps: None,
            seed: 42,
            resume_from_checkpoint: None,
            process_index: 0,
            no_cuda: false,
        }
    }
}

impl TrainingArguments {
    pub fn validate(&self) -> TunerResult<()> {
        if self.per_device_train_batch_size == 0 || self.per_device_eval_batch_size == 0 {
            return Err(TunerError::config("batch_size", "must be positive"));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(TunerError::config(
                "gradient_accumulation_steps",
                "must be positive",
            ));
        }
        if self.learning_rate <= 0.0 {
            return Err(TunerError::config("learning_rate", "must be positive"));
        }
        if self.eval_steps == Some(0) {
            return Err(TunerError::config("eval_steps", "must be positive"));
        }
        Ok(())
    }

    pub fn device(&self) -> candle_core::Result<candle_core::Device> {
        if self.no_cuda {
            Ok(candle_core::Device::Cpu)
        } else {
            candle_core::Device::cuda_if_available(0)
        }
    }
}

/// Arguments pertaining to the fine-tuning objective
#[derive(Debug, Clone, Args, Serialize, Deserialize)]
#[serde(default)]
pub struct FinetuningArguments {
    /// `full` or `lora`
    #[arg(long, default_value_t = FinetuningType::Full)]
    pub finetuning_type: FinetuningType,

    #[arg(long, default_value_t = 8)]
    pub lora_rank: usize,

    #[arg(long, default_value_t = 16.0)]
    pub lora_alpha: f64,

    /// Temperature of the preference term
    #[arg(long, default_value_t = 0.1)]
    pub dpo_beta: f64,

    /// Reduction of the ULMA supervised term: `sum` or `mean`
    #[arg(long, default_value_t = SftLossType::Sum)]
    pub ulma_sft_loss_type: SftLossType,

    /// Log-partition constant added to the ULMA log-ratio
    #[arg(long, default_value_t = 0.0)]
    pub ulma_constant_zx: f64,

    /// `ulma` or `pointwise_dpo`
    #[arg(long, default_value_t = PreferenceLossType::Ulma)]
    pub ulma_preference_loss_type: PreferenceLossType,

    /// Reduction of the unlikelihood terms: `sum` or `mean`
    #[arg(long, default_value_t = SftLossType::Sum)]
    pub unlikelihood_sft_loss_type: SftLossType,

    /// Overrides the reference derived from `finetuning_type`
    #[arg(long)]
    pub reference_strategy: Option<ReferenceStrategy>,
}

impl Default for FinetuningArguments {
    fn default() -> Self {
        Self {
            finetuning_type: FinetuningType::Full,
            lora_rank: 8,
            lora_alpha: 16.0,
            dpo_beta: 0.1,
            ulma_sft_loss_type: SftLossType::Sum,
            ulma_constant_zx: 0.0,
            ulma_preference_loss_type: PreferenceLossType::Ulma,
            unlikelihood_sft_loss_type: SftLossType::Sum,
            reference_strategy: None,
        }
    }
}

impl FinetuningArguments {
    pub fn validate(&self) -> TunerResult<()> {
        if self.dpo_beta <= 0.0 {
            return Err(TunerError::config("dpo_beta", "must be positive"));
        }
        if self.finetuning_type == FinetuningType::Lora && self.lora_rank == 0 {
            return Err(TunerError::config("lora_rank", "must be positive"));
        }
        if self.finetuning_type == FinetuningType::Full
            && self.reference_strategy == Some(ReferenceStrategy::ImplicitAdapterReference)
        {
            return Err(TunerError::config(
                "reference_strategy",
                "implicit_adapter_reference requires finetuning_type = lora",
            ));
        }
        Ok(())
    }

    /// Reference strategy resolved once at setup
    pub fn reference_strategy(&self) -> ReferenceStrategy {
        self.reference_strategy
            .unwrap_or_else(|| ReferenceStrategy::for_finetuning_type(self.finetuning_type))
    }
}

/// All argument groups of a run, as stored in a `--config` JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HParams {
    pub model: ModelArguments,
    pub data: DataArguments,
    pub training: TrainingArguments,
    pub finetuning: FinetuningArguments,
}

impl HParams {
    pub fn from_json_file<P: AsRef<std::path::Path>>(path: P) -> TunerResult<Self> {
        let json_str = std::fs::read_to_string(path.as_ref())?;
        let hparams: HParams = serde_json::from_str(&json_str)?;
        Ok(hparams)
    }

    pub fn validate(&self) -> TunerResult<()> {
        self.data.validate()?;
        self.training.validate()?;
        self.finetuning.validate()
    }
}
