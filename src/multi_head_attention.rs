use candle_core::{Result, Tensor};
use candle_nn::{linear, linear_no_bias, Dropout, Linear, Module, ModuleT, VarBuilder};

#[cfg(feature = "metal")]
use candle_core::D;
#[cfg(feature = "metal")]
use candle_nn::ops::softmax;

#[cfg(not(feature = "metal"))]
use candle_nn::ops::softmax_last_dim;

use crate::{
    config::Config,
    utils::{causal_mask, masked_fill},
};

/// Scaled causal attention. Returns `(output, probabilities)`; with `train` set
/// the probabilities are passed through `dropout` before weighting `v`.
fn attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f64,
    dropout: Option<&Dropout>,
    train: bool,
) -> Result<(Tensor, Tensor)> {
    let seq_len = q.dims()[q.rank() - 2];

    // (batch_sz, seq_len, seq_len) = (batch_sz, seq_len, head_sz) * (batch_sz, head_sz, seq_len)
    let attention_scores = (q.matmul(&k.t()?)? * scale)?;
    let mask = causal_mask(seq_len, q.device())?;
    let attention_scores = masked_fill(&attention_scores, &mask)?;

    #[cfg(not(feature = "metal"))]
    let attention_weights = softmax_last_dim(&attention_scores)?;

    #[cfg(feature = "metal")]
    let attention_weights = softmax(&attention_scores, D::Minus1)?;

    let dropped = match dropout {
        Some(d) => d.forward(&attention_weights, train)?,
        None => attention_weights.clone(),
    };

    // (batch_sz, seq_len, head_sz) = (batch_sz, seq_len, seq_len) * (batch_sz, seq_len, head_sz)
    let attention_output = dropped.matmul(v)?;

    Ok((attention_output, attention_weights))
}

/// One causal self-attention head projecting `n_embed` down to `head_size`.
pub struct AttentionHead {
    query: Linear,
    key: Linear,
    value: Linear,
    dropout: Dropout,
    scale: f64,
}

impl AttentionHead {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let head_size = config.head_size();
        let query = linear_no_bias(config.n_embed, head_size, vb.pp("query"))?;
        let key = linear_no_bias(config.n_embed, head_size, vb.pp("key"))?;
        let value = linear_no_bias(config.n_embed, head_size, vb.pp("value"))?;
        let dropout = Dropout::new(config.attn_dropout);
        let scale = config.attention_scale_factor();

        Ok(Self {
            query,
            key,
            value,
            dropout,
            scale,
        })
    }

    /// `(batch_sz, seq_len, n_embed)` -> output `(batch_sz, seq_len, head_sz)` and
    /// probabilities `(batch_sz, seq_len, seq_len)`.
    pub fn forward_with_weights(&self, xs: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let q = self.query.forward(xs)?;
        let k = self.key.forward(xs)?;
        let v = self.value.forward(xs)?;
        attention(&q, &k, &v, self.scale, Some(&self.dropout), train)
    }
}

impl ModuleT for AttentionHead {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let (output, _) = self.forward_with_weights(xs, train)?;
        Ok(output)
    }
}

pub struct MultiHeadAttention {
    heads: Vec<AttentionHead>,
    projection: Linear,
    dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let heads = (0..config.n_heads)
            .map(|i| AttentionHead::new(config, vb.pp(format!("head_{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let projection = linear(config.n_embed, config.n_embed, vb.pp("projection"))?;
        let dropout = Dropout::new(config.attn_dropout);

        Ok(Self {
            heads,
            projection,
            dropout,
        })
    }

    pub fn heads(&self) -> &[AttentionHead] {
        &self.heads
    }
}

impl ModuleT for MultiHeadAttention {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let outputs = self
            .heads
            .iter()
            .map(|head| head.forward_t(xs, train))
            .collect::<Result<Vec<_>>>()?;
        // n_heads * (batch_sz, seq_len, head_sz) -> (batch_sz, seq_len, n_embed)
        Tensor::cat(&outputs, candle_core::D::Minus1)?
            .apply(&self.projection)?
            .apply_t(&self.dropout, train)
    }
}
