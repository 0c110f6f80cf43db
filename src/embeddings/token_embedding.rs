use candle_core::{Result, Tensor};
use candle_nn::{embedding, Embedding, Module, VarBuilder};

pub struct TokenEmbedding {
    embedding: Embedding,
}

impl TokenEmbedding {
    pub fn new(vocab_size: usize, n_embed: usize, vb: VarBuilder) -> Result<Self> {
        let embedding = embedding(vocab_size, n_embed, vb.pp("wte"))?;
        Ok(Self { embedding })
    }
}

impl Module for TokenEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // (batch_sz, seq_len) --> (batch_sz, seq_len, n_embed)
        self.embedding.forward(xs)
    }
}
