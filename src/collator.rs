//! Batch collators for prompt/answer sequence pairs
//!
//! Each example carries a separately tokenized prompt and answer. Collation
//! concatenates the two, pads every row to a common length and builds a label
//! tensor in which only the answer span keeps its token ids; prompt and pad
//! positions hold the ignore index and contribute nothing to the loss.

use crate::data::{Example, ScoredExample};
use crate::error::TunerError;
use crate::tokenizer::Tokenizer;
use candle_core::{Device, Result, Tensor};
use itertools::izip;
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

/// Label value excluded from the loss
pub const DEFAULT_IGNORE_INDEX: i64 = -100;
/// `<|endoftext|>` in the GPT-2 vocabulary
pub const DEFAULT_PAD_TOKEN_ID: u32 = 50_256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaddingSide {
    Left,
    #[default]
    Right,
}

impl FromStr for PaddingSide {
    type Err = TunerError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            other => Err(TunerError::config(
                "padding_side",
                format!("unknown variant `{other}`, expected one of: left, right"),
            )),
        }
    }
}

impl Display for PaddingSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PaddingSide::Left => write!(f, "left"),
            PaddingSide::Right => write!(f, "right"),
        }
    }
}

/// Target length policy for a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingStrategy {
    /// Pad to the longest row in the batch
    #[default]
    Longest,
    /// Pad to a fixed length; longer rows are left as they are
    MaxLength(usize),
}

/// A collated batch; every tensor has the batch as its leading dimension
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(b, t)` u32 token ids
    pub input_ids: Tensor,
    /// `(b, t)` u32, 1 for real tokens and 0 for padding
    pub attention_mask: Tensor,
    /// `(b, t)` i64 answer tokens, ignore index elsewhere
    pub labels: Tensor,
    /// `(b,)` f32 per-row preference score
    pub score: Option<Tensor>,
}

impl Batch {
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.input_ids.dims2()?.0)
    }

    pub fn score(&self) -> Result<&Tensor> {
        self.score
            .as_ref()
            .ok_or_else(|| candle_core::Error::Msg("batch has no `score` field".to_string()))
    }
}

/// Something that turns a list of dataset items into a `Batch`
pub trait CustomCollator {
    type BatchItem;

    fn collate(&self, batch: Vec<Self::BatchItem>) -> Result<Batch>;
}

/// Padding and masking configuration shared by the collators
#[derive(Debug, Clone)]
pub struct CollatorConfig {
    pad_token_id: u32,
    label_pad_token_id: i64,
    padding_side: PaddingSide,
    padding: PaddingStrategy,
    pad_to_multiple_of: Option<usize>,
    device: Device,
}

impl Default for CollatorConfig {
    fn default() -> Self {
        Self {
            pad_token_id: DEFAULT_PAD_TOKEN_ID,
            label_pad_token_id: DEFAULT_IGNORE_INDEX,
            padding_side: PaddingSide::Right,
            padding: PaddingStrategy::Longest,
            pad_to_multiple_of: None,
            device: Device::Cpu,
        }
    }
}

impl CollatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes pad id and padding side from `tokenizer`. Labels on pad positions
    /// get the ignore index when `ignore_pad_token_for_loss`, the pad id
    /// otherwise.
    pub fn from_tokenizer(tokenizer: &Tokenizer, ignore_pad_token_for_loss: bool) -> Self {
        let label_pad_token_id = if ignore_pad_token_for_loss {
            DEFAULT_IGNORE_INDEX
        } else {
            tokenizer.pad_token_id() as i64
        };
        Self::new()
            .pad_token_id(tokenizer.pad_token_id())
            .padding_side(tokenizer.padding_side())
            .label_pad_token_id(label_pad_token_id)
    }

    pub fn pad_token_id(mut self, pad_token_id: u32) -> Self {
        self.pad_token_id = pad_token_id;
        self
    }

    pub fn label_pad_token_id(mut self, label_pad_token_id: i64) -> Self {
        self.label_pad_token_id = label_pad_token_id;
        self
    }

    pub fn padding_side(mut self, padding_side: PaddingSide) -> Self {
        self.padding_side = padding_side;
        self
    }

    pub fn padding(mut self, padding: PaddingStrategy) -> Self {
        self.padding = padding;
        self
    }

    pub fn pad_to_multiple_of(mut self, pad_to_multiple_of: Option<usize>) -> Self {
        self.pad_to_multiple_of = pad_to_multiple_of;
        self
    }

    pub fn device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn ignore_index(&self) -> i64 {
        self.label_pad_token_id
    }

    fn target_length(&self, longest: usize) -> usize {
        let len = match self.padding {
            PaddingStrategy::Longest => longest,
            PaddingStrategy::MaxLength(max_length) => max_length.max(longest),
        };
        match self.pad_to_multiple_of {
            Some(m) if m > 0 => len.div_ceil(m) * m,
            _ => len,
        }
    }

    /// Concatenates, pads and masks `(prompt, answer, score)` rows.
    pub fn collate_rows(&self, rows: &[(&[u32], &[u32], Option<f32>)]) -> Result<Batch> {
        if rows.is_empty() {
            candle_core::bail!("cannot collate an empty batch")
        }
        let longest = rows
            .iter()
            .map(|(prompt, answer, _)| prompt.len() + answer.len())
            .max()
            .unwrap_or(0);
        let target_len = self.target_length(longest);

        let mut input_ids: Vec<u32> = Vec::with_capacity(rows.len() * target_len);
        let mut attention_mask: Vec<u32> = Vec::with_capacity(rows.len() * target_len);
        let mut labels: Vec<i64> = Vec::with_capacity(rows.len() * target_len);

        for (prompt, answer, _) in rows.iter() {
            let (prompt_len, answer_len) = (prompt.len(), answer.len());
            let num_pad = target_len - (prompt_len + answer_len);
            let padding = std::iter::repeat(self.pad_token_id).take(num_pad);
            let concatenated = prompt.iter().chain(answer.iter()).copied();

            let (row_ids, row_mask): (Vec<u32>, Vec<u32>) = match self.padding_side {
                PaddingSide::Left => (
                    padding.chain(concatenated).collect(),
                    std::iter::repeat(0_u32)
                        .take(num_pad)
                        .chain(std::iter::repeat(1_u32).take(prompt_len + answer_len))
                        .collect(),
                ),
                PaddingSide::Right => (
                    concatenated.chain(padding).collect(),
                    std::iter::repeat(1_u32)
                        .take(prompt_len + answer_len)
                        .chain(std::iter::repeat(0_u32).take(num_pad))
                        .collect(),
                ),
            };

            // answer span of the padded row
            let (start, end) = match self.padding_side {
                PaddingSide::Left => (target_len - answer_len, target_len),
                PaddingSide::Right => (prompt_len, prompt_len + answer_len),
            };
            let mut row_labels = vec![self.label_pad_token_id; target_len];
            for (label, token) in izip!(&mut row_labels[start..end], &row_ids[start..end]) {
                *label = *token as i64;
            }

            input_ids.extend(row_ids);
            attention_mask.extend(row_mask);
            labels.extend(row_labels);
        }

        let shape = (rows.len(), target_len);
        let score = if rows.iter().all(|(_, _, score)| score.is_some()) {
            let scores = rows
                .iter()
                .map(|(_, _, score)| score.unwrap_or_default())
                .collect::<Vec<f32>>();
            Some(Tensor::from_vec(scores, rows.len(), &self.device)?)
        } else {
            None
        };

        Ok(Batch {
            input_ids: Tensor::from_vec(input_ids, shape, &self.device)?,
            attention_mask: Tensor::from_vec(attention_mask, shape, &self.device)?,
            labels: Tensor::from_vec(labels, shape, &self.device)?.contiguous()?,
            score,
        })
    }
}

/// Collator for unlikelihood training: point-wise scored rows only
#[derive(Debug, Clone, Default)]
pub struct UnlikelihoodDataCollator {
    config: CollatorConfig,
}

impl UnlikelihoodDataCollator {
    pub fn new(config: CollatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CollatorConfig {
        &self.config
    }
}

impl CustomCollator for UnlikelihoodDataCollator {
    type BatchItem = Example;

    fn collate(&self, batch: Vec<Example>) -> Result<Batch> {
        let rows = batch
            .iter()
            .map(|example| match example {
                Example::Scored(ScoredExample {
                    input_ids,
                    output_ids,
                    score,
                }) => Ok((&input_ids[..], &output_ids[..], Some(*score))),
                Example::Pairwise(_) => Err(candle_core::Error::Msg(
                    "unlikelihood batches expect point-wise scored examples".to_string(),
                )),
            })
            .collect::<Result<Vec<_>>>()?;
        self.config.collate_rows(&rows)
    }
}

/// Collator for ULMA.
///
/// Pairwise examples are flattened so that the first rows of the batch hold
/// the chosen answers (score 1) and the last rows the rejected answers
/// (score 0), both in example order. Scored examples keep their own score and
/// sit with the chosen rows.
#[derive(Debug, Clone, Default)]
pub struct UlmaDataCollator {
    config: CollatorConfig,
}

impl UlmaDataCollator {
    pub fn new(config: CollatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CollatorConfig {
        &self.config
    }
}

impl CustomCollator for UlmaDataCollator {
    type BatchItem = Example;

    fn collate(&self, batch: Vec<Example>) -> Result<Batch> {
        let leading = batch.iter().map(|example| match example {
            Example::Scored(ex) => (&ex.input_ids[..], &ex.output_ids[..], Some(ex.score)),
            Example::Pairwise(ex) => (&ex.input_ids[..], &ex.chosen_ids[..], Some(1_f32)),
        });
        let trailing = batch.iter().filter_map(|example| match example {
            Example::Scored(_) => None,
            Example::Pairwise(ex) => Some((&ex.input_ids[..], &ex.rejected_ids[..], Some(0_f32))),
        });
        let rows = leading.chain(trailing).collect::<Vec<_>>();
        self.config.collate_rows(&rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::PairwiseExample;
    use anyhow::Result;
    use rstest::*;

    fn scored(input_ids: &[u32], output_ids: &[u32], score: f32) -> Example {
        Example::Scored(ScoredExample {
            input_ids: input_ids.to_vec(),
            output_ids: output_ids.to_vec(),
            score,
        })
    }

    #[fixture]
    fn examples() -> Vec<Example> {
        vec![scored(&[1, 2, 3], &[4, 5], 1.), scored(&[1, 2], &[6], 0.)]
    }

    #[fixture]
    fn config() -> CollatorConfig {
        CollatorConfig::new()
            .pad_token_id(0_u32)
            .device(Device::cuda_if_available(0).unwrap())
    }

    #[rstest]
    fn test_right_padding_scenario(examples: Vec<Example>, config: CollatorConfig) -> Result<()> {
        let collator = UnlikelihoodDataCollator::new(config);
        let batch = collator.collate(examples)?;

        assert_eq!(
            batch.input_ids.to_vec2::<u32>()?,
            &[[1_u32, 2, 3, 4, 5], [1, 2, 6, 0, 0]]
        );
        assert_eq!(
            batch.attention_mask.to_vec2::<u32>()?,
            &[[1_u32, 1, 1, 1, 1], [1, 1, 1, 0, 0]]
        );
        assert_eq!(
            batch.labels.to_vec2::<i64>()?,
            &[[-100_i64, -100, -100, 4, 5], [-100, -100, 6, -100, -100]]
        );
        assert_eq!(batch.score()?.to_vec1::<f32>()?, &[1_f32, 0.]);
        Ok(())
    }

    #[rstest]
    fn test_left_padding(examples: Vec<Example>, config: CollatorConfig) -> Result<()> {
        let collator = UnlikelihoodDataCollator::new(config.padding_side(PaddingSide::Left));
        let batch = collator.collate(examples)?;

        assert_eq!(
            batch.input_ids.to_vec2::<u32>()?,
            &[[1_u32, 2, 3, 4, 5], [0, 0, 1, 2, 6]]
        );
        assert_eq!(
            batch.attention_mask.to_vec2::<u32>()?,
            &[[1_u32, 1, 1, 1, 1], [0, 0, 1, 1, 1]]
        );
        assert_eq!(
            batch.labels.to_vec2::<i64>()?,
            &[[-100_i64, -100, -100, 4, 5], [-100, -100, -100, -100, 6]]
        );
        Ok(())
    }

    #[rstest]
    #[case(PaddingSide::Left)]
    #[case(PaddingSide::Right)]
    fn test_label_span_and_shapes(
        #[case] padding_side: PaddingSide,
        config: CollatorConfig,
    ) -> Result<()> {
        let examples = vec![
            scored(&[7, 8, 9, 10], &[11, 12, 13], 1.),
            scored(&[7], &[14, 15], 1.),
            scored(&[7, 8], &[], 0.),
        ];
        let answer_lens = [3_usize, 2, 0];
        let collator = UnlikelihoodDataCollator::new(
            config.padding(PaddingStrategy::MaxLength(9)).padding_side(padding_side),
        );
        let batch = collator.collate(examples)?;

        assert_eq!(batch.input_ids.dims(), &[3_usize, 9]);
        assert_eq!(batch.input_ids.dims(), batch.attention_mask.dims());
        assert_eq!(batch.input_ids.dims(), batch.labels.dims());

        let input_ids = batch.input_ids.to_vec2::<u32>()?;
        let attention_mask = batch.attention_mask.to_vec2::<u32>()?;
        let labels = batch.labels.to_vec2::<i64>()?;
        let real_lens = [7_usize, 3, 2];
        for (row, answer_len) in answer_lens.iter().enumerate() {
            // exactly `answer_len` unmasked labels, each equal to its input id
            let unmasked = labels[row]
                .iter()
                .enumerate()
                .filter(|(_, l)| **l != DEFAULT_IGNORE_INDEX)
                .collect::<Vec<_>>();
            assert_eq!(unmasked.len(), *answer_len);
            for (pos, label) in unmasked {
                assert_eq!(*label, input_ids[row][pos] as i64);
            }
            // attention mask marks exactly the real tokens
            let ones = attention_mask[row].iter().filter(|m| **m == 1).count();
            assert_eq!(ones, real_lens[row]);
        }
        Ok(())
    }

    #[rstest]
    fn test_empty_answer_yields_all_ignore_row(config: CollatorConfig) -> Result<()> {
        let collator = UnlikelihoodDataCollator::new(config);
        let batch = collator.collate(vec![scored(&[1, 2, 3], &[], 0.)])?;
        assert_eq!(batch.labels.to_vec2::<i64>()?, &[[-100_i64, -100, -100]]);
        Ok(())
    }

    #[rstest]
    fn test_single_example_is_not_padded(config: CollatorConfig) -> Result<()> {
        let collator = UnlikelihoodDataCollator::new(config);
        let batch = collator.collate(vec![scored(&[1, 2], &[3, 4, 5], 1.)])?;
        assert_eq!(batch.input_ids.to_vec2::<u32>()?, &[[1_u32, 2, 3, 4, 5]]);
        assert_eq!(batch.attention_mask.to_vec2::<u32>()?, &[[1_u32; 5]]);
        Ok(())
    }

    #[rstest]
    fn test_collate_is_idempotent(examples: Vec<Example>, config: CollatorConfig) -> Result<()> {
        let collator = UnlikelihoodDataCollator::new(config.padding_side(PaddingSide::Left));
        let first = collator.collate(examples.clone())?;
        let second = collator.collate(examples)?;
        assert_eq!(
            first.input_ids.to_vec2::<u32>()?,
            second.input_ids.to_vec2::<u32>()?
        );
        assert_eq!(
            first.attention_mask.to_vec2::<u32>()?,
            second.attention_mask.to_vec2::<u32>()?
        );
        assert_eq!(first.labels.to_vec2::<i64>()?, second.labels.to_vec2::<i64>()?);
        assert_eq!(
            first.score()?.to_vec1::<f32>()?,
            second.score()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[rstest]
    fn test_pad_to_multiple_of(examples: Vec<Example>, config: CollatorConfig) -> Result<()> {
        let collator = UnlikelihoodDataCollator::new(config.pad_to_multiple_of(Some(4)));
        let batch = collator.collate(examples)?;
        assert_eq!(batch.input_ids.dims(), &[2_usize, 8]);
        Ok(())
    }

    #[rstest]
    fn test_max_length_never_truncates(examples: Vec<Example>, config: CollatorConfig) -> Result<()> {
        let collator = UnlikelihoodDataCollator::new(config.padding(PaddingStrategy::MaxLength(3)));
        let batch = collator.collate(examples)?;
        assert_eq!(batch.input_ids.dims(), &[2_usize, 5]);
        Ok(())
    }

    #[rstest]
    fn test_label_pad_token_id_without_ignore(config: CollatorConfig) -> Result<()> {
        let collator = UnlikelihoodDataCollator::new(config.label_pad_token_id(0));
        let batch = collator.collate(vec![scored(&[1], &[2], 1.), scored(&[1], &[2, 3], 1.)])?;
        assert_eq!(batch.labels.to_vec2::<i64>()?, &[[0_i64, 2, 0], [0, 2, 3]]);
        Ok(())
    }

    #[rstest]
    fn test_empty_batch_is_an_error(config: CollatorConfig) {
        let collator = UnlikelihoodDataCollator::new(config);
        assert!(collator.collate(vec![]).is_err());
    }

    #[rstest]
    fn test_unlikelihood_collator_rejects_pairs(config: CollatorConfig) {
        let collator = UnlikelihoodDataCollator::new(config);
        let pair = Example::Pairwise(PairwiseExample {
            input_ids: vec![1],
            chosen_ids: vec![2],
            rejected_ids: vec![3],
        });
        assert!(collator.collate(vec![pair]).is_err());
    }

    #[rstest]
    fn test_ulma_collator_flattens_pairs(config: CollatorConfig) -> Result<()> {
        let collator = UlmaDataCollator::new(config);
        let batch = collator.collate(vec![
            Example::Pairwise(PairwiseExample {
                input_ids: vec![1, 2],
                chosen_ids: vec![3],
                rejected_ids: vec![4, 5],
            }),
            Example::Pairwise(PairwiseExample {
                input_ids: vec![6],
                chosen_ids: vec![7, 8],
                rejected_ids: vec![9],
            }),
        ])?;

        assert_eq!(
            batch.input_ids.to_vec2::<u32>()?,
            &[[1_u32, 2, 3, 0], [6, 7, 8, 0], [1, 2, 4, 5], [6, 9, 0, 0]]
        );
        assert_eq!(
            batch.labels.to_vec2::<i64>()?,
            &[
                [-100_i64, -100, 3, -100],
                [-100, 7, 8, -100],
                [-100, -100, 4, 5],
                [-100, 9, -100, -100]
            ]
        );
        assert_eq!(batch.score()?.to_vec1::<f32>()?, &[1_f32, 1., 0., 0.]);
        Ok(())
    }

    #[rstest]
    fn test_ulma_collator_keeps_pointwise_scores(config: CollatorConfig) -> Result<()> {
        let collator = UlmaDataCollator::new(config);
        let batch = collator.collate(vec![scored(&[1], &[2], 0.25), scored(&[3], &[4], 0.75)])?;
        assert_eq!(batch.score()?.to_vec1::<f32>()?, &[0.25_f32, 0.75]);
        Ok(())
    }

    #[rstest]
    fn test_config_from_tokenizer() -> Result<()> {
        let tokenizer = Tokenizer::from_name_or_path("gpt2", PaddingSide::Left)?;
        let config = CollatorConfig::from_tokenizer(&tokenizer, false);
        assert_eq!(config.pad_token_id, 50_256_u32);
        assert_eq!(config.padding_side, PaddingSide::Left);
        assert_eq!(config.ignore_index(), 50_256_i64);

        let config = CollatorConfig::from_tokenizer(&tokenizer, true);
        assert_eq!(config.ignore_index(), DEFAULT_IGNORE_INDEX);
        Ok(())
    }
}
