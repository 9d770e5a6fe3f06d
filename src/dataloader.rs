//! Batched iteration over a `PreferenceDataset`

use crate::collator::{Batch, CustomCollator};
use crate::data::{Example, PreferenceDataset};
use candle_core::Result;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

pub trait DataLoader {
    type Batcher;

    fn batcher(&self) -> Self::Batcher;
}

/// Yields collated batches; each epoch gets its own seeded shuffle.
pub struct PreferenceDataLoader<C: CustomCollator<BatchItem = Example> + Clone> {
    dataset: PreferenceDataset,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    collator: C,
}

impl<C: CustomCollator<BatchItem = Example> + Clone> PreferenceDataLoader<C> {
    pub fn new(
        dataset: PreferenceDataset,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        seed: u64,
        collator: C,
    ) -> Self {
        Self {
            dataset,
            batch_size,
            shuffle,
            drop_last,
            seed,
            collator,
        }
    }

    pub fn dataset(&self) -> &PreferenceDataset {
        &self.dataset
    }

    /// Number of batches per epoch
    pub fn len(&self) -> usize {
        if self.drop_last {
            self.dataset.len() / self.batch_size
        } else {
            self.dataset.len().div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batcher_for_epoch(&self, epoch: usize) -> PreferenceBatcher<C> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }
        PreferenceBatcher {
            dataset: self.dataset.clone(),
            indices,
            batch_size: self.batch_size,
            drop_last: self.drop_last,
            collator: self.collator.clone(),
            pos: 0,
        }
    }
}

impl<C: CustomCollator<BatchItem = Example> + Clone> DataLoader for PreferenceDataLoader<C> {
    type Batcher = PreferenceBatcher<C>;

    fn batcher(&self) -> Self::Batcher {
        self.batcher_for_epoch(0)
    }
}

pub struct PreferenceBatcher<C> {
    dataset: PreferenceDataset,
    indices: Vec<usize>,
    batch_size: usize,
    drop_last: bool,
    collator: C,
    pos: usize,
}

impl<C: CustomCollator<BatchItem = Example>> Iterator for PreferenceBatcher<C> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.indices.len().saturating_sub(self.pos);
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return None;
        }
        let end = (self.pos + self.batch_size).min(self.indices.len());
        let items = self.indices[self.pos..end]
            .iter()
            .map(|&ix| self.dataset.examples()[ix].clone())
            .collect::<Vec<_>>();
        self.pos = end;
        Some(self.collator.collate(items))
    }
}
