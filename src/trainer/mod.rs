//! Generic training loop with pluggable loss strategies
//!
//! The `Trainer` owns the batching, optimization and persistence around a
//! fine-tuning run. What is optimized is decided by a `ComputeLoss`
//! implementation: `UlmaLoss` or `UnlikelihoodLoss`.

pub mod logprobs;
pub mod reference;
pub mod ulma;
pub mod unlikelihood;

pub use reference::Reference;
pub use ulma::UlmaLoss;
pub use unlikelihood::UnlikelihoodLoss;

use crate::collator::{Batch, CustomCollator};
use crate::data::{Example, PreferenceDataset};
use crate::dataloader::PreferenceDataLoader;
use crate::error::{TunerError, TunerResult};
use crate::hparams::{LrSchedulerType, TrainingArguments};
use crate::model::{CausalLM, GPTModel, ModelHandle};
use candle_core::{backprop::GradStore, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use comfy_table::{presets::UTF8_FULL, Table};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs::File, path::Path, time::Instant};
use tracing::{debug, info};

pub const MODEL_FILENAME: &str = "model.safetensors";
pub const TRAINING_ARGS_FILENAME: &str = "training_args.json";
pub const TRAINER_STATE_FILENAME: &str = "trainer_state.json";

/// Scalar loss of a batch plus named diagnostics
pub struct LossOutput {
    pub loss: Tensor,
    pub metrics: BTreeMap<String, f32>,
}

/// A training objective evaluated on one collated batch
pub trait ComputeLoss<M: CausalLM> {
    fn compute_loss(&self, model: &M, batch: &Batch, train: bool) -> candle_core::Result<LossOutput>;
}

/// One entry of the log history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub epoch: f64,
    pub step: usize,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub epoch: f64,
    pub global_step: usize,
    pub max_steps: usize,
    pub log_history: Vec<LogEntry>,
}

impl TrainerState {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> TunerResult<Self> {
        let json_str = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&json_str)?)
    }
}

#[derive(Debug, Clone)]
pub struct TrainOutput {
    pub global_step: usize,
    pub training_loss: f64,
    pub metrics: BTreeMap<String, f64>,
}

/// Learning rate as a function of the optimizer step
#[derive(Debug, Clone, Copy)]
pub struct LrScheduler {
    base_lr: f64,
    scheduler_type: LrSchedulerType,
    warmup_steps: usize,
    total_steps: usize,
}

impl LrScheduler {
    pub fn new(
        base_lr: f64,
        scheduler_type: LrSchedulerType,
        warmup_steps: usize,
        total_steps: usize,
    ) -> Self {
        Self {
            base_lr,
            scheduler_type,
            warmup_steps,
            total_steps,
        }
    }

    /// Rate used for the optimizer step taken after `step` completed steps
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps as f64;
        }
        match self.scheduler_type {
            LrSchedulerType::Constant => self.base_lr,
            LrSchedulerType::Linear => {
                let remaining = self.total_steps.saturating_sub(step) as f64;
                let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1) as f64;
                self.base_lr * (remaining / decay_steps).max(0.)
            }
        }
    }
}

/// Running sums of loss and metrics between two log points
#[derive(Default)]
struct Accumulator {
    loss: f64,
    count: usize,
    metrics: BTreeMap<String, (f64, usize)>,
}

impl Accumulator {
    fn add(&mut self, loss: f32, metrics: &BTreeMap<String, f32>) {
        self.loss += loss as f64;
        self.count += 1;
        for (key, value) in metrics {
            let entry = self.metrics.entry(key.clone()).or_insert((0., 0));
            entry.0 += *value as f64;
            entry.1 += 1;
        }
    }

    /// Means keyed as `<prefix>loss` and `<prefix><metric>`
    fn means(&self, prefix: &str) -> BTreeMap<String, f64> {
        let mut out = BTreeMap::new();
        if self.count > 0 {
            out.insert(format!("{prefix}loss"), self.loss / self.count as f64);
        }
        for (key, (sum, n)) in self.metrics.iter() {
            out.insert(format!("{prefix}{key}"), sum / *n as f64);
        }
        out
    }
}

fn accumulate_grads(acc: &mut Option<GradStore>, grads: GradStore, vars: &[Var]) -> candle_core::Result<()> {
    match acc {
        None => *acc = Some(grads),
        Some(acc) => {
            for var in vars.iter() {
                if let Some(grad) = grads.get(var.as_tensor()) {
                    let sum = match acc.get(var.as_tensor()) {
                        Some(prev) => (prev + grad)?,
                        None => grad.clone(),
                    };
                    acc.insert(var.as_tensor(), sum);
                }
            }
        }
    }
    Ok(())
}

/// State saved next to a checkpoint, if any
fn checkpoint_state(checkpoint: &Path) -> TunerResult<Option<TrainerState>> {
    let state_path = checkpoint.with_file_name(TRAINER_STATE_FILENAME);
    if !state_path.exists() {
        return Ok(None);
    }
    TrainerState::from_json_file(state_path).map(Some)
}

fn progress_bar(total: u64, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
    )
    .map(|style| style.progress_chars("█▓░"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

pub struct Trainer<L, C>
where
    L: ComputeLoss<GPTModel>,
    C: CustomCollator<BatchItem = Example> + Clone,
{
    handle: ModelHandle,
    loss_fn: L,
    args: TrainingArguments,
    train_loader: PreferenceDataLoader<C>,
    eval_loader: Option<PreferenceDataLoader<C>>,
    state: TrainerState,
}

impl<L, C> Trainer<L, C>
where
    L: ComputeLoss<GPTModel>,
    C: CustomCollator<BatchItem = Example> + Clone,
{
    pub fn new(
        handle: ModelHandle,
        loss_fn: L,
        args: TrainingArguments,
        train_dataset: PreferenceDataset,
        eval_dataset: Option<PreferenceDataset>,
        collator: C,
    ) -> TunerResult<Self> {
        args.validate()?;
        let train_loader = PreferenceDataLoader::new(
            train_dataset,
            args.per_device_train_batch_size,
            true,
            false,
            args.seed,
            collator.clone(),
        );
        let eval_loader = eval_dataset.map(|dataset| {
            PreferenceDataLoader::new(
                dataset,
                args.per_device_eval_batch_size,
                false,
                false,
                args.seed,
                collator,
            )
        });
        Ok(Self {
            handle,
            loss_fn,
            args,
            train_loader,
            eval_loader,
            state: TrainerState::default(),
        })
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    pub fn loss_fn(&self) -> &L {
        &self.loss_fn
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn args(&self) -> &TrainingArguments {
        &self.args
    }

    pub fn is_world_process_zero(&self) -> bool {
        self.args.process_index == 0
    }

    fn steps_per_epoch(&self) -> usize {
        self.train_loader
            .len()
            .div_ceil(self.args.gradient_accumulation_steps)
    }

    /// Runs the full training loop.
    ///
    /// `resume_from_checkpoint` is a safetensors file of trainable weights
    /// loaded before the first step. When a `trainer_state.json` sits next to
    /// it, its log history is kept and the optimizer steps it already counts
    /// are skipped. AdamW moments are not persisted and restart from zero.
    pub fn train(&mut self, resume_from_checkpoint: Option<&Path>) -> TunerResult<TrainOutput> {
        if self.train_loader.is_empty() {
            return Err(TunerError::Dataset("training dataset is empty".to_string()));
        }
        let mut resumed_state = None;
        if let Some(path) = resume_from_checkpoint {
            info!(path = %path.display(), "Resuming from checkpoint");
            let mut varmap = self.handle.trainable_varmap().clone();
            varmap.load(path)?;
            resumed_state = checkpoint_state(path)?;
        }

        let vars = self.handle.trainable_varmap().all_vars();
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: self.args.learning_rate,
                weight_decay: self.args.weight_decay,
                ..Default::default()
            },
        )?;

        let accumulation_steps = self.args.gradient_accumulation_steps;
        let steps_per_epoch = self.steps_per_epoch();
        let max_steps = steps_per_epoch * self.args.num_train_epochs;
        let scheduler = LrScheduler::new(
            self.args.learning_rate,
            self.args.lr_scheduler_type,
            self.args.warmup_steps,
            max_steps,
        );
        self.state = TrainerState {
            max_steps,
            ..Default::default()
        };
        if let Some(saved) = resumed_state {
            self.state.global_step = saved.global_step.min(max_steps);
            self.state.epoch = self.state.global_step as f64 / steps_per_epoch as f64;
            self.state.log_history = saved.log_history;
            info!(
                global_step = self.state.global_step,
                "Skipping optimizer steps already taken"
            );
        }
        let steps_done = self.state.global_step;

        info!(
            num_examples = self.train_loader.dataset().len(),
            num_epochs = self.args.num_train_epochs,
            batch_size = self.args.per_device_train_batch_size,
            gradient_accumulation_steps = accumulation_steps,
            total_optimization_steps = max_steps,
            trainable_params = self.handle.num_trainable_parameters(),
            "***** Running training *****"
        );

        let pb = progress_bar(max_steps as u64, self.is_world_process_zero());
        pb.set_position(steps_done as u64);
        let start = Instant::now();
        let mut total = Accumulator::default();
        let mut since_log = Accumulator::default();

        let first_epoch = steps_done / steps_per_epoch;
        for epoch in first_epoch..self.args.num_train_epochs {
            let num_batches = self.train_loader.len();
            let skipped_batches = if epoch == first_epoch {
                (steps_done % steps_per_epoch) * accumulation_steps
            } else {
                0
            };
            let mut accumulated: Option<GradStore> = None;
            let batches = self.train_loader.batcher_for_epoch(epoch).enumerate();
            for (ix, batch) in batches.skip(skipped_batches) {
                let batch = batch?;
                let output = self.loss_fn.compute_loss(&self.handle.model, &batch, true)?;
                let loss_value = output.loss.to_scalar::<f32>()?;
                total.add(loss_value, &output.metrics);
                since_log.add(loss_value, &output.metrics);

                let scaled = output.loss.affine(1. / accumulation_steps as f64, 0.)?;
                accumulate_grads(&mut accumulated, scaled.backward()?, &vars)?;

                let is_last_batch = ix + 1 == num_batches;
                if (ix + 1) % accumulation_steps != 0 && !is_last_batch {
                    continue;
                }
                let Some(grads) = accumulated.take() else {
                    continue;
                };
                let lr = scheduler.lr_at(self.state.global_step);
                optimizer.set_learning_rate(lr);
                optimizer.step(&grads)?;

                self.state.global_step += 1;
                self.state.epoch = self.state.global_step as f64 / steps_per_epoch as f64;
                pb.inc(1);
                pb.set_message(format!("loss {loss_value:.4}"));

                if self.state.global_step % self.args.logging_steps.max(1) == 0 {
                    let mut values = since_log.means("");
                    values.insert("learning_rate".to_string(), lr);
                    self.log(values);
                    since_log = Accumulator::default();
                }
                if let Some(eval_steps) = self.args.eval_steps {
                    if self.eval_loader.is_some() && self.state.global_step % eval_steps == 0 {
                        let values = self.evaluate()?;
                        self.log(values);
                    }
                }
            }
        }
        pb.finish_with_message("done");

        let runtime = start.elapsed().as_secs_f64();
        let training_loss = total.loss / total.count.max(1) as f64;
        let num_samples = (self.train_loader.dataset().len() * self.args.num_train_epochs) as f64;
        let mut metrics = BTreeMap::new();
        metrics.insert("epoch".to_string(), self.state.epoch);
        metrics.insert("train_loss".to_string(), training_loss);
        metrics.insert("train_runtime".to_string(), runtime);
        metrics.insert(
            "train_samples_per_second".to_string(),
            num_samples / runtime.max(f64::EPSILON),
        );
        metrics.insert(
            "train_steps_per_second".to_string(),
            self.state.global_step as f64 / runtime.max(f64::EPSILON),
        );
        self.log(BTreeMap::from([("train_loss".to_string(), training_loss)]));

        Ok(TrainOutput {
            global_step: self.state.global_step,
            training_loss,
            metrics,
        })
    }

    fn log(&mut self, mut values: BTreeMap<String, f64>) {
        // `epoch` and `step` are fields of the entry itself
        values.retain(|key, _| key != "epoch" && key != "step");
        debug!(step = self.state.global_step, ?values, "log");
        self.state.log_history.push(LogEntry {
            epoch: self.state.epoch,
            step: self.state.global_step,
            values,
        });
    }

    /// Mean loss and metrics over the eval split, keyed `eval_*`
    pub fn evaluate(&self) -> TunerResult<BTreeMap<String, f64>> {
        let loader = self
            .eval_loader
            .as_ref()
            .ok_or_else(|| TunerError::Dataset("no evaluation dataset".to_string()))?;
        let mut acc = Accumulator::default();
        for batch in loader.batcher_for_epoch(0) {
            let output = self.loss_fn.compute_loss(&self.handle.model, &batch?, false)?;
            acc.add(output.loss.detach().to_scalar::<f32>()?, &output.metrics);
        }
        let metrics = acc.means("eval_");
        info!(step = self.state.global_step, eval_loss = ?metrics.get("eval_loss"), "Evaluation");
        Ok(metrics)
    }

    pub fn log_metrics(&self, split: &str, metrics: &BTreeMap<String, f64>) {
        if !self.is_world_process_zero() {
            return;
        }
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_header(vec![format!("{split} metric"), "value".to_string()]);
        for (key, value) in metrics.iter() {
            table.add_row(vec![key.clone(), format!("{value:.6}")]);
        }
        info!("***** {split} metrics *****\n{table}");
    }

    fn write_json<T: Serialize>(&self, filename: &str, value: &T) -> TunerResult<()> {
        std::fs::create_dir_all(&self.args.output_dir)?;
        let path = self.args.output_dir.join(filename);
        serde_json::to_writer_pretty(File::create(&path)?, value)?;
        debug!(path = %path.display(), "Wrote file");
        Ok(())
    }

    /// Writes `<output_dir>/<split>_results.json`.
    pub fn save_metrics(&self, split: &str, metrics: &BTreeMap<String, f64>) -> TunerResult<()> {
        if !self.is_world_process_zero() {
            return Ok(());
        }
        self.write_json(&format!("{split}_results.json"), metrics)
    }

    /// Writes `<output_dir>/trainer_state.json`.
    pub fn save_state(&self) -> TunerResult<()> {
        if !self.is_world_process_zero() {
            return Ok(());
        }
        self.write_json(TRAINER_STATE_FILENAME, &self.state)
    }

    /// Writes the trainable weights and the training arguments.
    pub fn save_model(&self) -> TunerResult<()> {
        if !self.is_world_process_zero() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.args.output_dir)?;
        let path = self.args.output_dir.join(MODEL_FILENAME);
        info!(path = %path.display(), "Saving model weights");
        self.handle.trainable_varmap().save(&path)?;
        self.write_json(TRAINING_ARGS_FILENAME, &self.args)
    }
}
