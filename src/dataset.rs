use std::path::Path;

use candle_core::{Device, Tensor};
use log::info;
use rand::Rng;

use crate::{
    error::{Error, Result},
    tokenizer_helper::TokenizerHelper,
};

/// The encoded corpus, split by token position into a training prefix and a
/// validation suffix.
#[derive(Debug, Clone)]
pub struct TokenDataset {
    tokens: Vec<u32>,
    split: usize,
}

impl TokenDataset {
    pub fn from_tokens(tokens: Vec<u32>, train_split: f64) -> Self {
        let split = (tokens.len() as f64 * train_split) as usize;
        Self { tokens, split }
    }

    pub fn from_corpus(path: &Path, tokenizer: &TokenizerHelper, train_split: f64) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let tokens = tokenizer.encode(&text)?;
        let dataset = Self::from_tokens(tokens, train_split);
        info!(
            "corpus {}: {} tokens ({} train, {} valid)",
            path.display(),
            dataset.len(),
            dataset.train_tokens().len(),
            dataset.valid_tokens().len()
        );
        Ok(dataset)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Index of the first validation token.
    pub fn split_index(&self) -> usize {
        self.split
    }

    pub fn train_tokens(&self) -> &[u32] {
        &self.tokens[..self.split]
    }

    pub fn valid_tokens(&self) -> &[u32] {
        &self.tokens[self.split..]
    }

    pub fn train_batcher(
        &self,
        block_size: usize,
        batch_size: usize,
        device: &Device,
    ) -> Result<TokenBatcher<'_>> {
        TokenBatcher::new(self.train_tokens(), block_size, batch_size, device)
    }

    pub fn valid_batcher(
        &self,
        block_size: usize,
        batch_size: usize,
        device: &Device,
    ) -> Result<TokenBatcher<'_>> {
        TokenBatcher::new(self.valid_tokens(), block_size, batch_size, device)
    }
}

/// Samples `(input, target)` windows of `block_size` tokens with replacement.
pub struct TokenBatcher<'a> {
    tokens: &'a [u32],
    block_size: usize,
    batch_size: usize,
    device: Device,
}

impl<'a> TokenBatcher<'a> {
    pub fn new(
        tokens: &'a [u32],
        block_size: usize,
        batch_size: usize,
        device: &Device,
    ) -> Result<Self> {
        if block_size >= tokens.len() {
            return Err(Error::InvalidConfiguration(format!(
                "block_size ({block_size}) must be smaller than the token sequence ({})",
                tokens.len()
            )));
        }
        Ok(Self {
            tokens,
            block_size,
            batch_size,
            device: device.clone(),
        })
    }

    /// Uniform start offsets in `[0, len - block_size)`, so that the target
    /// window (shifted by one) still ends inside the sequence.
    pub fn sample_offsets<R: Rng>(&self, rng: &mut R) -> Vec<usize> {
        let upper = self.tokens.len() - self.block_size;
        (0..self.batch_size).map(|_| rng.gen_range(0..upper)).collect()
    }

    /// Returns `(input, target)`, each `(batch_size, block_size)` of `u32`.
    pub fn next_batch<R: Rng>(&self, rng: &mut R) -> Result<(Tensor, Tensor)> {
        let offsets = self.sample_offsets(rng);
        let mut input = Vec::with_capacity(self.batch_size * self.block_size);
        let mut target = Vec::with_capacity(self.batch_size * self.block_size);
        for start in offsets {
            input.extend_from_slice(&self.tokens[start..start + self.block_size]);
            target.extend_from_slice(&self.tokens[start + 1..start + self.block_size + 1]);
        }
        let shape = (self.batch_size, self.block_size);
        let input = Tensor::from_vec(input, shape, &self.device)?;
        let target = Tensor::from_vec(target, shape, &self.device)?;
        Ok((input, target))
    }
}
