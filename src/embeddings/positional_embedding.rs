use candle_core::{Error, Result, Tensor};
use candle_nn::{embedding, Embedding, Module, VarBuilder};

/// Learned position table with one row per context position.
pub struct PositionalEmbedding {
    embedding: Embedding,
    max_position_embeddings: usize,
}

impl PositionalEmbedding {
    pub fn new(max_position_embeddings: usize, n_embed: usize, vb: VarBuilder) -> Result<Self> {
        let embedding = embedding(max_position_embeddings, n_embed, vb.pp("wpe"))?;
        Ok(Self {
            embedding,
            max_position_embeddings,
        })
    }
}

impl Module for PositionalEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // xs is the token embedding, (batch_sz, seq_len, n_embed)
        let (_, seq_len, _) = xs.dims3()?;
        if seq_len > self.max_position_embeddings {
            return Err(Error::Msg(format!(
                "sequence of {seq_len} tokens exceeds the {} position embeddings",
                self.max_position_embeddings
            )));
        }
        let positions = Tensor::arange(0u32, seq_len as u32, xs.device())?;
        // (seq_len, n_embed) broadcast over the batch
        xs.broadcast_add(&self.embedding.forward(&positions)?)
    }
}
