use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use llmtuner_rs::data::Stage;
use llmtuner_rs::hparams::{
    DataArguments, FinetuningArguments, HParams, ModelArguments, TrainingArguments,
};
use llmtuner_rs::workflow::run_exp;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// CLI
#[derive(Debug, Parser)]
#[command(name = "llmtuner")]
#[command(about = "Fine-tune GPT-style models with ULMA or unlikelihood training.", long_about = None)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Train with the ULMA objective
    Ulma(RunArgs),
    /// Train with likelihood on preferred and unlikelihood on dispreferred answers
    Unlikelihood(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// JSON file describing the whole run; replaces every other flag
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    model: ModelArguments,

    #[command(flatten)]
    data: DataArguments,

    #[command(flatten)]
    training: TrainingArguments,

    #[command(flatten)]
    finetuning: FinetuningArguments,
}

impl RunArgs {
    fn into_hparams(self) -> Result<HParams> {
        match self.config {
            Some(path) => {
                info!(path = %path.display(), "Loading run configuration");
                Ok(HParams::from_json_file(path)?)
            }
            None => Ok(HParams {
                model: self.model,
                data: self.data,
                training: self.training,
                finetuning: self.finetuning,
            }),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let (stage, args) = match cli.command {
        Commands::Ulma(args) => (Stage::Ulma, args),
        Commands::Unlikelihood(args) => (Stage::Unlikelihood, args),
    };
    let hparams = args.into_hparams()?;
    if let Some(output) = run_exp(stage, &hparams)? {
        info!(
            global_step = output.global_step,
            training_loss = output.training_loss,
            "Finished training"
        );
    }
    Ok(())
}

fn init_tracing(log_format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).init(),
    }
}
