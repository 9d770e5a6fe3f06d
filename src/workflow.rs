//! End-to-end fine-tuning workflows
//!
//! Both workflows follow the same shape: load data and model, preprocess for
//! the stage, build the collator and the loss, train, then persist metrics,
//! state and weights. Loss plots are best effort.

use crate::collator::{CollatorConfig, CustomCollator, UlmaDataCollator, UnlikelihoodDataCollator};
use crate::data::{get_dataset, preprocess_dataset, split_dataset, Example, Stage};
use crate::hparams::{DataArguments, FinetuningArguments, HParams, ModelArguments, TrainingArguments};
use crate::model::{load_model_and_tokenizer, GPTModel};
use crate::plotting::plot_loss;
use crate::trainer::{ComputeLoss, Reference, TrainOutput, Trainer, UlmaLoss, UnlikelihoodLoss};
use anyhow::{Context, Result};
use tracing::{info, warn};

/// Keys plotted after training
pub const PLOT_KEYS: [&str; 2] = ["loss", "eval_loss"];

/// Runs ULMA fine-tuning. Returns `None` when `do_train` is off.
pub fn run_ulma(
    model_args: &ModelArguments,
    data_args: &DataArguments,
    training_args: &TrainingArguments,
    finetuning_args: &FinetuningArguments,
) -> Result<Option<TrainOutput>> {
    let device = training_args.device()?;
    let records = get_dataset(data_args).context("failed to load dataset")?;
    let (handle, tokenizer) = load_model_and_tokenizer(model_args, finetuning_args, &device)
        .context("failed to load model and tokenizer")?;
    let examples = preprocess_dataset(&records, &tokenizer, data_args, Stage::Ulma)?;
    let collator_config =
        CollatorConfig::from_tokenizer(&tokenizer, data_args.ignore_pad_token_for_loss)
            .device(device);
    let ignore_index = collator_config.ignore_index();
    let collator = UlmaDataCollator::new(collator_config);

    let reference = Reference::resolve(&handle, finetuning_args.reference_strategy())?;
    let loss_fn = UlmaLoss::new(
        finetuning_args.dpo_beta,
        finetuning_args.ulma_constant_zx,
        finetuning_args.ulma_sft_loss_type,
        finetuning_args.ulma_preference_loss_type,
        reference,
    )
    .with_ignore_index(ignore_index);

    let split = split_dataset(examples, data_args.val_size, training_args.seed)?;
    let mut trainer = Trainer::new(
        handle,
        loss_fn,
        training_args.clone(),
        split.train_dataset,
        split.eval_dataset,
        collator,
    )?;
    train_and_save(&mut trainer, model_args, training_args)
}

/// Runs unlikelihood fine-tuning. Returns `None` when `do_train` is off.
pub fn run_unlikelihood(
    model_args: &ModelArguments,
    data_args: &DataArguments,
    training_args: &TrainingArguments,
    finetuning_args: &FinetuningArguments,
) -> Result<Option<TrainOutput>> {
    let device = training_args.device()?;
    let records = get_dataset(data_args).context("failed to load dataset")?;
    let (handle, tokenizer) = load_model_and_tokenizer(model_args, finetuning_args, &device)
        .context("failed to load model and tokenizer")?;
    let examples = preprocess_dataset(&records, &tokenizer, data_args, Stage::Unlikelihood)?;
    let collator_config =
        CollatorConfig::from_tokenizer(&tokenizer, data_args.ignore_pad_token_for_loss)
            .device(device);
    let ignore_index = collator_config.ignore_index();
    let collator = UnlikelihoodDataCollator::new(collator_config);
    let loss_fn = UnlikelihoodLoss::new(finetuning_args.unlikelihood_sft_loss_type)
        .with_ignore_index(ignore_index);

    let split = split_dataset(examples, data_args.val_size, training_args.seed)?;
    let mut trainer = Trainer::new(
        handle,
        loss_fn,
        training_args.clone(),
        split.train_dataset,
        split.eval_dataset,
        collator,
    )?;
    train_and_save(&mut trainer, model_args, training_args)
}

/// Validates `hparams` and runs the workflow for `stage`.
pub fn run_exp(stage: Stage, hparams: &HParams) -> Result<Option<TrainOutput>> {
    hparams.validate()?;
    info!(?stage, output_dir = %hparams.training.output_dir.display(), "Starting run");
    match stage {
        Stage::Ulma => run_ulma(
            &hparams.model,
            &hparams.data,
            &hparams.training,
            &hparams.finetuning,
        ),
        Stage::Unlikelihood => run_unlikelihood(
            &hparams.model,
            &hparams.data,
            &hparams.training,
            &hparams.finetuning,
        ),
    }
}

fn train_and_save<L, C>(
    trainer: &mut Trainer<L, C>,
    model_args: &ModelArguments,
    training_args: &TrainingArguments,
) -> Result<Option<TrainOutput>>
where
    L: ComputeLoss<GPTModel>,
    C: CustomCollator<BatchItem = Example> + Clone,
{
    if !training_args.do_train {
        info!("`do_train` is off, nothing to do");
        return Ok(None);
    }
    let output = trainer
        .train(training_args.resume_from_checkpoint.as_deref())
        .context("training failed")?;
    trainer.log_metrics("train", &output.metrics);
    trainer.save_metrics("train", &output.metrics)?;
    trainer.save_state()?;
    trainer.save_model()?;
    if trainer.is_world_process_zero() && model_args.plot_loss {
        if let Err(e) = plot_loss(&training_args.output_dir, &PLOT_KEYS) {
            warn!(error = %e, "Failed to plot loss");
        }
    }
    Ok(Some(output))
}
