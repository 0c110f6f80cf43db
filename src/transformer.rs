use candle_core::{DType, Error, IndexOp, Result, Tensor, D};
use candle_nn::{linear, ops::softmax, Linear, Module, VarBuilder};
use rand::{distributions::WeightedIndex, prelude::Distribution, Rng};

use crate::{
    config::Config,
    decoder::Decoder,
    embeddings::{positional_embedding::PositionalEmbedding, token_embedding::TokenEmbedding},
};

pub struct Transformer {
    token_embed: TokenEmbedding,
    pos_embed: PositionalEmbedding,
    decoder: Decoder,
    lm_head: Linear,
    block_size: usize,
}

impl Transformer {
    pub fn new(
        token_embed: TokenEmbedding,
        pos_embed: PositionalEmbedding,
        decoder: Decoder,
        lm_head: Linear,
        block_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            token_embed,
            pos_embed,
            decoder,
            lm_head,
            block_size,
        })
    }

    /// `(batch, seq_len)` token ids -> `(batch, seq_len, vocab_size)` logits.
    pub fn forward(&self, idx: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.pos_embed.forward(&self.token_embed.forward(idx)?)?;
        let xs = self.decoder.forward(&xs, train)?;
        self.lm_head.forward(&xs)
    }

    /// Appends `max_new_tokens` sampled ids to every row of `idx`, feeding at
    /// most the last `block_size` tokens back through the model each step.
    pub fn generate<R: Rng>(
        &self,
        idx: &Tensor,
        max_new_tokens: usize,
        rng: &mut R,
    ) -> Result<Tensor> {
        let mut idx = idx.clone();
        for _ in 0..max_new_tokens {
            let (batch_size, seq_len) = idx.dims2()?;
            if seq_len == 0 {
                return Err(Error::Msg("cannot generate from an empty sequence".to_string()));
            }
            let context = if seq_len > self.block_size {
                idx.narrow(1, seq_len - self.block_size, self.block_size)?
            } else {
                idx.clone()
            };
            let logits = self.forward(&context, false)?;
            let last = logits.dim(1)? - 1;
            let probs = softmax(&logits.i((.., last, ..))?, D::Minus1)?; // (batch, vocab_size)

            let next = probs
                .to_dtype(DType::F32)?
                .to_vec2::<f32>()?
                .iter()
                .map(|row| sample(row, rng))
                .collect::<Result<Vec<_>>>()?;
            let next = Tensor::from_vec(next, (batch_size, 1), idx.device())?;
            idx = Tensor::cat(&[&idx, &next], 1)?;
        }
        Ok(idx)
    }
}

/// Draws one id from a categorical distribution.
fn sample<R: Rng>(probs: &[f32], rng: &mut R) -> Result<u32> {
    let distribution =
        WeightedIndex::new(probs).map_err(|e| Error::Msg(format!("sampling error: {e}")))?;
    Ok(distribution.sample(rng) as u32)
}

pub fn transformer(config: &Config, vb: VarBuilder) -> Result<Transformer> {
    let token_embed = TokenEmbedding::new(config.vocab_size, config.n_embed, vb.pp("token_embed"))?;
    let pos_embed = PositionalEmbedding::new(config.block_size, config.n_embed, vb.pp("pos_embed"))?;
    let decoder = Decoder::new(config, vb.pp("decoder"))?;
    let lm_head = linear(config.n_embed, config.vocab_size, vb.pp("lm_head"))?;

    Transformer::new(
        token_embed,
        pos_embed,
        decoder,
        lm_head,
        config.block_size,
    )
}
