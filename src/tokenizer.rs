//! Tokenizer handle used by dataset preprocessing and collation
//!
//! Wraps either a tiktoken BPE (`gpt2`, `cl100k_base`, ...) or a HuggingFace
//! `tokenizer.json`, together with the padding side batches are built with.

use crate::collator::PaddingSide;
use crate::error::{TunerError, TunerResult};
use std::path::Path;
use tiktoken_rs::{get_bpe_from_model, CoreBPE};

const ENDOFTEXT: &str = "<|endoftext|>";

/// Special tokens probed, in order, for end-of-sequence in HuggingFace vocabularies
const HF_EOS_CANDIDATES: [&str; 4] = [ENDOFTEXT, "</s>", "<eos>", "<|im_end|>"];

pub enum TokenizerBackend {
    Tiktoken(CoreBPE),
    HuggingFace(tokenizers::Tokenizer),
}

pub struct Tokenizer {
    backend: TokenizerBackend,
    eos_token_id: u32,
    pad_token_id: u32,
    padding_side: PaddingSide,
}

impl Tokenizer {
    /// Loads a tokenizer.
    ///
    /// `name_or_path` is either a path to a `tokenizer.json` file or a model
    /// name understood by `tiktoken_rs::get_bpe_from_model`.
    pub fn from_name_or_path(name_or_path: &str, padding_side: PaddingSide) -> TunerResult<Self> {
        let path = Path::new(name_or_path);
        if path.is_file() {
            let tokenizer = tokenizers::Tokenizer::from_file(path)
                .map_err(|e| TunerError::Tokenizer(e.to_string()))?;
            Self::from_hf(tokenizer, padding_side)
        } else {
            let bpe = get_bpe_from_model(name_or_path)
                .map_err(|e| TunerError::Tokenizer(e.to_string()))?;
            Ok(Self::from_tiktoken(bpe, padding_side))
        }
    }

    pub fn from_tiktoken(bpe: CoreBPE, padding_side: PaddingSide) -> Self {
        let eos_token_id = bpe.encode_with_special_tokens(ENDOFTEXT)[0];
        Self {
            backend: TokenizerBackend::Tiktoken(bpe),
            eos_token_id,
            // no dedicated pad token in GPT-2 style vocabularies
            pad_token_id: eos_token_id,
            padding_side,
        }
    }

    pub fn from_hf(tokenizer: tokenizers::Tokenizer, padding_side: PaddingSide) -> TunerResult<Self> {
        let eos_token_id = HF_EOS_CANDIDATES
            .iter()
            .find_map(|tok| tokenizer.token_to_id(tok))
            .ok_or_else(|| {
                TunerError::Tokenizer(format!(
                    "no end-of-sequence token found, tried {:?}",
                    HF_EOS_CANDIDATES
                ))
            })?;
        let pad_token_id = tokenizer
            .get_padding()
            .map(|p| p.pad_id)
            .or_else(|| tokenizer.token_to_id("<pad>"))
            .unwrap_or(eos_token_id);
        Ok(Self {
            backend: TokenizerBackend::HuggingFace(tokenizer),
            eos_token_id,
            pad_token_id,
            padding_side,
        })
    }

    pub fn encode(&self, text: &str) -> TunerResult<Vec<u32>> {
        match &self.backend {
            TokenizerBackend::Tiktoken(bpe) => Ok(bpe.encode_with_special_tokens(text)),
            TokenizerBackend::HuggingFace(tokenizer) => tokenizer
                .encode(text, false)
                .map(|enc| enc.get_ids().to_vec())
                .map_err(|e| TunerError::Tokenizer(e.to_string())),
        }
    }

    pub fn decode(&self, token_ids: &[u32]) -> TunerResult<String> {
        match &self.backend {
            TokenizerBackend::Tiktoken(bpe) => bpe
                .decode(token_ids.to_vec())
                .map_err(|e| TunerError::Tokenizer(e.to_string())),
            TokenizerBackend::HuggingFace(tokenizer) => tokenizer
                .decode(token_ids, false)
                .map_err(|e| TunerError::Tokenizer(e.to_string())),
        }
    }

    pub fn vocab_size(&self) -> usize {
        match &self.backend {
            // gpt2 ranks plus `<|endoftext|>`
            TokenizerBackend::Tiktoken(_) => self.eos_token_id as usize + 1,
            TokenizerBackend::HuggingFace(tokenizer) => tokenizer.get_vocab_size(true),
        }
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    pub fn padding_side(&self) -> PaddingSide {
        self.padding_side
    }
}
