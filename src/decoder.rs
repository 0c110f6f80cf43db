use candle_core::{Result, Tensor};
use candle_nn::{Module, ModuleT, VarBuilder};

use crate::{
    config::Config,
    feed_forward::FeedForward,
    multi_head_attention::MultiHeadAttention,
    residual_connection::ResidualConnection,
    rms_norm::{RmsNormalization, RMS_NORM_EPS},
};

pub struct DecoderBlock {
    self_attention: MultiHeadAttention,
    feed_forward: FeedForward,
    residual_connections: Vec<ResidualConnection>,
}

impl DecoderBlock {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let self_attention = MultiHeadAttention::new(config, vb.pp("self_attention"))?;
        let feed_forward =
            FeedForward::new(config.n_embed, config.block_dropout, vb.pp("feed_forward"))?;
        let residual_connections = (0..2)
            .map(|i| {
                ResidualConnection::new(config.n_embed, vb.pp(format!("residual_connection_{i}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            self_attention,
            feed_forward,
            residual_connections,
        })
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.residual_connections[0]
            .forward(xs, &|x| self.self_attention.forward_t(x, train))?;
        self.residual_connections[1].forward(&xs, &|x| self.feed_forward.forward_t(x, train))
    }
}

/// `n_layers` independently parameterised blocks followed by a final RMS norm.
pub struct Decoder {
    blocks: Vec<DecoderBlock>,
    norm: RmsNormalization,
}

impl Decoder {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let blocks = (0..config.n_layers)
            .map(|i| DecoderBlock::new(config, vb.pp(format!("block_{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let norm = RmsNormalization::new(config.n_embed, RMS_NORM_EPS, vb.pp("norm"))?;
        Ok(Self { blocks, norm })
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = xs.clone();
        for block in &self.blocks {
            x = block.forward(&x, train)?;
        }
        self.norm.forward(&x)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    use super::*;

    fn small_config() -> Config {
        Config {
            n_embed: 8,
            n_heads: 2,
            n_layers: 3,
            block_size: 4,
            ..Config::default()
        }
    }

    #[test]
    fn test_decoder_shape() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = small_config();
        let decoder = Decoder::new(&config, vb).unwrap();
        assert_eq!(decoder.num_blocks(), 3);

        let xs = Tensor::randn(0f32, 1., (2, 4, 8), &device).unwrap();
        let ys = decoder.forward(&xs, true).unwrap();
        assert_eq!(ys.dims(), &[2, 4, 8]);
    }

    #[test]
    fn test_blocks_do_not_share_parameters() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = small_config();
        let _decoder = Decoder::new(&config, vb).unwrap();

        let data = varmap.data().lock().unwrap();
        let w0 = data["block_0.self_attention.head_0.query.weight"]
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let w1 = data["block_1.self_attention.head_0.query.weight"]
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_ne!(w0, w1);
        assert!(data.contains_key("block_2.residual_connection_1.norm.weight"));
        assert!(data.contains_key("norm.weight"));
    }

    #[test]
    fn test_eval_mode_is_deterministic() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let config = Config {
            attn_dropout: 0.5,
            block_dropout: 0.5,
            ..small_config()
        };
        let decoder = Decoder::new(&config, vb).unwrap();

        let xs = Tensor::randn(0f32, 1., (1, 4, 8), &device).unwrap();
        let a = decoder.forward(&xs, false).unwrap().to_vec3::<f32>().unwrap();
        let b = decoder.forward(&xs, false).unwrap().to_vec3::<f32>().unwrap();
        assert_eq!(a, b);

        let trained = decoder.forward(&xs, true).unwrap().to_vec3::<f32>().unwrap();
        assert_ne!(trained, a);
    }
}
