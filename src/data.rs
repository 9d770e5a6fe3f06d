//! Dataset loading, preprocessing and splitting
//!
//! Raw records come from JSON or JSONL files and are either point-wise
//! (`output` + `score`) or pairwise (`chosen` + `rejected`). Preprocessing
//! formats the prompt with a `PromptFormatter`, tokenizes prompt and answer
//! separately and truncates both, producing the `Example`s consumed by the
//! collators.

use crate::error::{TunerError, TunerResult};
use crate::hparams::{DataArguments, PromptTemplate};
use crate::tokenizer::Tokenizer;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, NoneAsEmptyString};
use std::{
    fs::read_to_string,
    path::Path,
    rc::Rc,
    str::FromStr,
};
use tracing::{debug, info};

/// A raw dataset record, before tokenization
#[serde_as]
#[derive(Debug, Default, Serialize, Deserialize, Clone, PartialEq)]
pub struct RawRecord {
    #[serde(alias = "prompt")]
    instruction: String,
    #[serde_as(as = "NoneAsEmptyString")]
    #[serde(default)]
    input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    chosen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rejected: Option<String>,
}

impl RawRecord {
    pub fn scored(instruction: &str, input: Option<&str>, output: &str, score: f32) -> Self {
        Self {
            instruction: instruction.to_string(),
            input: input.map(str::to_string),
            output: Some(output.to_string()),
            score: Some(score),
            ..Default::default()
        }
    }

    pub fn pairwise(instruction: &str, input: Option<&str>, chosen: &str, rejected: &str) -> Self {
        Self {
            instruction: instruction.to_string(),
            input: input.map(str::to_string),
            chosen: Some(chosen.to_string()),
            rejected: Some(rejected.to_string()),
            ..Default::default()
        }
    }

    pub fn is_pairwise(&self) -> bool {
        self.chosen.is_some() && self.rejected.is_some()
    }
}

pub trait InstructionExample {
    fn instruction(&self) -> &String;
    fn input(&self) -> &Option<String>;
}

impl InstructionExample for RawRecord {
    fn instruction(&self) -> &String {
        &self.instruction
    }

    fn input(&self) -> &Option<String> {
        &self.input
    }
}

/// Turns an instruction record into the prompt text fed to the model
pub trait PromptFormatter {
    fn format_input<T: InstructionExample>(&self, entry: &T) -> String;

    /// Header separating the prompt from the answer
    fn response_prefix(&self) -> &'static str;

    /// Full prompt, response header included
    fn format_prompt<T: InstructionExample>(&self, entry: &T) -> String {
        format!("{}{}", self.format_input(entry), self.response_prefix())
    }
}

pub struct AlpacaPromptFormatter;

impl PromptFormatter for AlpacaPromptFormatter {
    fn format_input<T: InstructionExample>(&self, entry: &T) -> String {
        let instruction_text = format!(
            "Below is an instruction that describes a task. \
            Write a response that appropriately completes the request.\
            \n\n### Instruction:\n{}",
            entry.instruction()
        );
        let input_text = match entry.input() {
            Some(inp) if !inp.is_empty() => format!("\n\n### Input:\n{}", inp),
            _ => String::default(),
        };
        instruction_text + &input_text
    }

    fn response_prefix(&self) -> &'static str {
        "\n\n### Response:\n"
    }
}

pub struct Phi3PromptFormatter;

impl PromptFormatter for Phi3PromptFormatter {
    fn format_input<T: InstructionExample>(&self, entry: &T) -> String {
        let instruction_text = format!("<|user|>\n{}", entry.instruction());
        let input_text = match entry.input() {
            Some(inp) if !inp.is_empty() => format!("\n{}", inp),
            _ => String::default(),
        };
        instruction_text + &input_text
    }

    fn response_prefix(&self) -> &'static str {
        "\n\n<|assistant|>:\n"
    }
}

/// A tokenized prompt/answer pair with its preference score
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredExample {
    pub input_ids: Vec<u32>,
    pub output_ids: Vec<u32>,
    pub score: f32,
}

/// A tokenized prompt with a preferred and a dispreferred answer
#[derive(Debug, Clone, PartialEq)]
pub struct PairwiseExample {
    pub input_ids: Vec<u32>,
    pub chosen_ids: Vec<u32>,
    pub rejected_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Example {
    Scored(ScoredExample),
    Pairwise(PairwiseExample),
}

/// Training stage a dataset is preprocessed for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Pairs stay pairs; the ULMA collator flattens them per batch
    Ulma,
    /// Pairs are split into a score 1 row and a score 0 row
    Unlikelihood,
}

impl FromStr for Stage {
    type Err = TunerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ulma" => Ok(Self::Ulma),
            "unlikelihood" => Ok(Self::Unlikelihood),
            other => Err(TunerError::config(
                "stage",
                format!("unknown variant `{other}`, expected one of: ulma, unlikelihood"),
            )),
        }
    }
}

#[doc(hidden)]
pub struct PreferenceDataset_ {
    examples: Vec<Example>,
}

/// Preprocessed examples, cheap to clone
#[derive(Clone)]
pub struct PreferenceDataset(Rc<PreferenceDataset_>);

impl AsRef<PreferenceDataset> for PreferenceDataset {
    fn as_ref(&self) -> &PreferenceDataset {
        self
    }
}

impl std::ops::Deref for PreferenceDataset {
    type Target = PreferenceDataset_;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl PreferenceDataset {
    pub fn new(examples: Vec<Example>) -> Self {
        Self(Rc::new(PreferenceDataset_ { examples }))
    }

    /// Gets the number of examples.
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn get_item_at_index(&self, idx: usize) -> TunerResult<&Example> {
        self.examples.get(idx).ok_or_else(|| {
            TunerError::Dataset(format!(
                "index {idx} out of range for dataset of {} examples",
                self.len()
            ))
        })
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }
}

/// Train and optional eval partitions
pub struct DatasetSplit {
    pub train_dataset: PreferenceDataset,
    pub eval_dataset: Option<PreferenceDataset>,
}

fn load_records<P: AsRef<Path>>(path: P) -> TunerResult<Vec<RawRecord>> {
    let path = path.as_ref();
    let contents = read_to_string(path)?;
    let is_jsonl = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"));
    let records = if is_jsonl {
        contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<RawRecord>)
            .collect::<Result<Vec<_>, _>>()?
    } else {
        serde_json::from_str::<Vec<RawRecord>>(&contents)?
    };
    debug!(path = %path.display(), num_records = records.len(), "Loaded dataset file");
    Ok(records)
}

/// Reads every dataset file of `data_args`, keeping at most `max_samples` records.
pub fn get_dataset(data_args: &DataArguments) -> TunerResult<Vec<RawRecord>> {
    if data_args.dataset.is_empty() {
        return Err(TunerError::config("dataset", "no dataset file given"));
    }
    let mut records = vec![];
    for path in data_args.dataset.iter() {
        info!(path = %path.display(), "Loading dataset");
        records.extend(load_records(path)?);
    }
    if let Some(max_samples) = data_args.max_samples {
        records.truncate(max_samples);
    }
    if records.is_empty() {
        return Err(TunerError::Dataset("dataset has no records".to_string()));
    }
    Ok(records)
}

/// Prompt tokens keep their leading part; answers keep their leading
/// `max_target_length - 1` tokens followed by EOS.
struct Encoder<'a> {
    tokenizer: &'a Tokenizer,
    max_source_length: usize,
    max_target_length: usize,
}

impl Encoder<'_> {
    fn encode_prompt(&self, prompt: &str) -> TunerResult<Vec<u32>> {
        let mut ids = self.tokenizer.encode(prompt)?;
        ids.truncate(self.max_source_length);
        Ok(ids)
    }

    fn encode_answer(&self, answer: &str) -> TunerResult<Vec<u32>> {
        let mut ids = self.tokenizer.encode(answer)?;
        ids.truncate(self.max_target_length.saturating_sub(1));
        ids.push(self.tokenizer.eos_token_id());
        Ok(ids)
    }
}

fn format_prompt(template: PromptTemplate, record: &RawRecord) -> String {
    match template {
        PromptTemplate::Alpaca => AlpacaPromptFormatter.format_prompt(record),
        PromptTemplate::Phi3 => Phi3PromptFormatter.format_prompt(record),
    }
}

/// Tokenizes and truncates `records` for `stage`.
pub fn preprocess_dataset(
    records: &[RawRecord],
    tokenizer: &Tokenizer,
    data_args: &DataArguments,
    stage: Stage,
) -> TunerResult<Vec<Example>> {
    let encoder = Encoder {
        tokenizer,
        max_source_length: data_args.max_source_length,
        max_target_length: data_args.max_target_length,
    };

    let mut examples = Vec::with_capacity(records.len());
    for (ix, record) in records.iter().enumerate() {
        let input_ids = encoder.encode_prompt(&format_prompt(data_args.prompt_template, record))?;
        match record {
            RawRecord {
                chosen: Some(chosen),
                rejected: Some(rejected),
                ..
            } => {
                let chosen_ids = encoder.encode_answer(chosen)?;
                let rejected_ids = encoder.encode_answer(rejected)?;
                match stage {
                    Stage::Ulma => examples.push(Example::Pairwise(PairwiseExample {
                        input_ids,
                        chosen_ids,
                        rejected_ids,
                    })),
                    Stage::Unlikelihood => {
                        examples.push(Example::Scored(ScoredExample {
                            input_ids: input_ids.clone(),
                            output_ids: chosen_ids,
                            score: 1.0,
                        }));
                        examples.push(Example::Scored(ScoredExample {
                            input_ids,
                            output_ids: rejected_ids,
                            score: 0.0,
                        }));
                    }
                }
            }
            RawRecord {
                output: Some(output),
                score: Some(score),
                ..
            } => {
                if !(0.0..=1.0).contains(score) {
                    return Err(TunerError::Dataset(format!(
                        "record {ix} has score {score} outside [0, 1]"
                    )));
                }
                examples.push(Example::Scored(ScoredExample {
                    input_ids,
                    output_ids: encoder.encode_answer(output)?,
                    score: *score,
                }));
            }
            _ => {
                return Err(TunerError::Dataset(format!(
                    "record {ix} needs either `output` and `score` or `chosen` and `rejected`"
                )))
            }
        }
    }
    info!(
        num_records = records.len(),
        num_examples = examples.len(),
        ?stage,
        "Preprocessed dataset"
    );
    Ok(examples)
}

/// Shuffles with `seed` and holds out `ceil(val_size * len)` examples for
/// evaluation. With `val_size == 0` everything goes to training, unshuffled.
pub fn split_dataset(examples: Vec<Example>, val_size: f32, seed: u64) -> TunerResult<DatasetSplit> {
    if !(0.0..1.0).contains(&val_size) {
        return Err(TunerError::config("val_size", "must be in [0, 1)"));
    }
    if val_size == 0.0 {
        return Ok(DatasetSplit {
            train_dataset: PreferenceDataset::new(examples),
            eval_dataset: None,
        });
    }

    let num_eval = (examples.len() as f32 * val_size).ceil() as usize;
    if num_eval >= examples.len() {
        return Err(TunerError::Dataset(format!(
            "val_size {val_size} leaves no training examples out of {}",
            examples.len()
        )));
    }

    let mut examples = examples;
    let mut rng = StdRng::seed_from_u64(seed);
    examples.shuffle(&mut rng);
    let train = examples.split_off(num_eval);
    info!(
        num_train = train.len(),
        num_eval = examples.len(),
        "Split dataset"
    );
    Ok(DatasetSplit {
        train_dataset: PreferenceDataset::new(train),
        eval_dataset: Some(PreferenceDataset::new(examples)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collator::PaddingSide;
    use anyhow::Result;
    use rstest::*;
    use std::io::Write;

    #[fixture]
    fn tokenizer() -> Tokenizer {
        Tokenizer::from_name_or_path("gpt2", PaddingSide::Right).unwrap()
    }

    #[fixture]
    fn scored_record() -> RawRecord {
        RawRecord::scored(
            "Here is a fake instruction.",
            Some("Here is a fake input."),
            "here is a fake output.",
            1.0,
        )
    }

    #[fixture]
    fn pairwise_record() -> RawRecord {
        RawRecord::pairwise(
            "Here is yet another fake instruction.",
            None,
            "Here is a fake chosen.",
            "Here is a fake rejected.",
        )
    }

    #[rstest]
    fn test_alpaca_prompt_formatter(scored_record: RawRecord) {
        let prompt = AlpacaPromptFormatter.format_prompt(&scored_record);
        let expected = "Below is an instruction that describes a task. Write a response \
        that appropriately completes the request.\n\n\
        ### Instruction:\n\
        Here is a fake instruction.\n\n\
        ### Input:\n\
        Here is a fake input.\n\n\
        ### Response:\n";
        assert_eq!(prompt, expected);
    }

    #[rstest]
    fn test_phi3_prompt_formatter_without_input(pairwise_record: RawRecord) {
        let prompt = Phi3PromptFormatter.format_prompt(&pairwise_record);
        assert_eq!(
            prompt,
            "<|user|>\nHere is yet another fake instruction.\n\n<|assistant|>:\n"
        );
    }

    #[rstest]
    fn test_record_deserialization() -> Result<()> {
        let json = r#"[
            {"prompt": "p1", "input": "", "output": "o1", "score": 0.5},
            {"instruction": "p2", "chosen": "c2", "rejected": "r2"}
        ]"#;
        let records: Vec<RawRecord> = serde_json::from_str(json)?;
        assert_eq!(records[0], RawRecord::scored("p1", None, "o1", 0.5));
        assert_eq!(records[1], RawRecord::pairwise("p2", None, "c2", "r2"));
        assert!(records[1].is_pairwise());
        Ok(())
    }

    #[rstest]
    fn test_get_dataset_json_and_jsonl() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let json_path = dir.path().join("data.json");
        std::fs::write(
            &json_path,
            r#"[{"instruction": "a", "output": "b", "score": 1.0}]"#,
        )?;
        let jsonl_path = dir.path().join("data.jsonl");
        let mut file = std::fs::File::create(&jsonl_path)?;
        writeln!(file, r#"{{"instruction": "c", "chosen": "d", "rejected": "e"}}"#)?;
        writeln!(file)?;
        writeln!(file, r#"{{"instruction": "f", "output": "g", "score": 0.0}}"#)?;

        let data_args = DataArguments {
            dataset: vec![json_path.clone(), jsonl_path.clone()],
            ..Default::default()
        };
        let records = get_dataset(&data_args)?;
        assert_eq!(records.len(), 3_usize);
        assert!(records[1].is_pairwise());

        let data_args = DataArguments {
            dataset: vec![json_path, jsonl_path],
            max_samples: Some(2),
            ..Default::default()
        };
        assert_eq!(get_dataset(&data_args)?.len(), 2_usize);
        Ok(())
    }

    #[rstest]
    fn test_get_dataset_without_files_is_rejected() {
        assert!(get_dataset(&DataArguments::default()).is_err());
    }

    #[rstest]
    fn test_preprocess_scored_record(tokenizer: Tokenizer, scored_record: RawRecord) -> Result<()> {
        let data_args = DataArguments::default();
        let examples = preprocess_dataset(
            &[scored_record.clone()],
            &tokenizer,
            &data_args,
            Stage::Unlikelihood,
        )?;

        let expected_prompt = tokenizer.encode(&AlpacaPromptFormatter.format_prompt(&scored_record))?;
        let mut expected_answer = tokenizer.encode("here is a fake output.")?;
        expected_answer.push(tokenizer.eos_token_id());
        assert_eq!(
            examples,
            vec![Example::Scored(ScoredExample {
                input_ids: expected_prompt,
                output_ids: expected_answer,
                score: 1.0,
            })]
        );
        Ok(())
    }

    #[rstest]
    fn test_preprocess_truncates(tokenizer: Tokenizer, scored_record: RawRecord) -> Result<()> {
        let data_args = DataArguments {
            max_source_length: 5,
            max_target_length: 3,
            ..Default::default()
        };
        let examples = preprocess_dataset(&[scored_record], &tokenizer, &data_args, Stage::Ulma)?;
        let Example::Scored(example) = &examples[0] else {
            panic!("expected a scored example")
        };
        assert_eq!(example.input_ids.len(), 5_usize);
        assert_eq!(example.output_ids.len(), 3_usize);
        assert_eq!(*example.output_ids.last().unwrap(), tokenizer.eos_token_id());
        // leading prompt tokens are kept
        let full_prompt = tokenizer.encode(&AlpacaPromptFormatter.format_prompt(&RawRecord::scored(
            "Here is a fake instruction.",
            Some("Here is a fake input."),
            "",
            1.0,
        )))?;
        assert_eq!(example.input_ids[..], full_prompt[..5]);
        Ok(())
    }

    #[rstest]
    fn test_preprocess_pairs_per_stage(tokenizer: Tokenizer, pairwise_record: RawRecord) -> Result<()> {
        let data_args = DataArguments::default();
        let ulma = preprocess_dataset(&[pairwise_record.clone()], &tokenizer, &data_args, Stage::Ulma)?;
        assert_eq!(ulma.len(), 1_usize);
        let Example::Pairwise(pair) = &ulma[0] else {
            panic!("expected a pairwise example")
        };

        let unlikelihood = preprocess_dataset(
            &[pairwise_record],
            &tokenizer,
            &data_args,
            Stage::Unlikelihood,
        )?;
        assert_eq!(
            unlikelihood,
            vec![
                Example::Scored(ScoredExample {
                    input_ids: pair.input_ids.clone(),
                    output_ids: pair.chosen_ids.clone(),
                    score: 1.0,
                }),
                Example::Scored(ScoredExample {
                    input_ids: pair.input_ids.clone(),
                    output_ids: pair.rejected_ids.clone(),
                    score: 0.0,
                }),
            ]
        );
        Ok(())
    }

    #[rstest]
    fn test_preprocess_rejects_incomplete_record(tokenizer: Tokenizer) {
        let record = RawRecord {
            instruction: "only an instruction".to_string(),
            ..Default::default()
        };
        let result = preprocess_dataset(&[record], &tokenizer, &DataArguments::default(), Stage::Ulma);
        assert!(matches!(result, Err(TunerError::Dataset(_))));
    }

    #[rstest]
    fn test_preprocess_rejects_out_of_range_score(tokenizer: Tokenizer) {
        let record = RawRecord::scored("a", None, "b", 1.5);
        let result = preprocess_dataset(
            &[record],
            &tokenizer,
            &DataArguments::default(),
            Stage::Unlikelihood,
        );
        assert!(result.is_err());
    }

    fn dummy_examples(n: usize) -> Vec<Example> {
        (0..n)
            .map(|ix| {
                Example::Scored(ScoredExample {
                    input_ids: vec![ix as u32],
                    output_ids: vec![ix as u32 + 1],
                    score: 1.0,
                })
            })
            .collect()
    }

    #[rstest]
    fn test_split_dataset() -> Result<()> {
        let split = split_dataset(dummy_examples(10), 0.25, 42)?;
        assert_eq!(split.train_dataset.len(), 7_usize);
        let eval = split.eval_dataset.expect("eval split");
        assert_eq!(eval.len(), 3_usize);

        // same seed, same split
        let again = split_dataset(dummy_examples(10), 0.25, 42)?;
        assert_eq!(again.train_dataset.examples(), split.train_dataset.examples());
        Ok(())
    }

    #[rstest]
    fn test_split_dataset_without_eval() -> Result<()> {
        let split = split_dataset(dummy_examples(4), 0.0, 42)?;
        assert_eq!(split.train_dataset.len(), 4_usize);
        assert!(split.eval_dataset.is_none());
        assert!(split.train_dataset.get_item_at_index(4).is_err());
        Ok(())
    }

    #[rstest]
    #[case(1.0)]
    #[case(-0.1)]
    fn test_split_dataset_rejects_val_size(#[case] val_size: f32) {
        assert!(split_dataset(dummy_examples(4), val_size, 42).is_err());
    }

    #[rstest]
    fn test_stage_from_str() {
        assert_eq!("ulma".parse::<Stage>().unwrap(), Stage::Ulma);
        assert!("dpo".parse::<Stage>().is_err());
    }
}
