use candle_core::{Result, Tensor};
use candle_nn::{linear, Activation, Dropout, Linear, ModuleT, VarBuilder};

pub const EXPANSION: usize = 4;

pub struct FeedForward {
    linear1: Linear,
    linear2: Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(n_embed: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        let linear1 = linear(n_embed, n_embed * EXPANSION, vb.pp("ff_linear1"))?;
        let linear2 = linear(n_embed * EXPANSION, n_embed, vb.pp("ff_linear2"))?;
        let dropout = Dropout::new(dropout);

        Ok(Self {
            linear1,
            linear2,
            dropout,
        })
    }
}

impl ModuleT for FeedForward {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let output = xs
            .apply(&self.linear1)?
            .apply(&Activation::Silu)?
            .apply(&self.linear2)?
            .apply_t(&self.dropout, train)?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, IndexOp};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn test_feed_forward_is_position_wise() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let ff = FeedForward::new(8, 0.1, vb).unwrap();

        let xs = Tensor::randn(0f32, 1., (2, 5, 8), &device).unwrap();
        let ys = ff.forward_t(&xs, false).unwrap();
        assert_eq!(ys.dims(), &[2, 5, 8]);

        // a single position pushed through alone gives the same row
        let alone = ff.forward_t(&xs.i((1..2, 3..4, ..)).unwrap(), false).unwrap();
        let diff = (alone - ys.i((1..2, 3..4, ..)).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_vec0::<f32>()
            .unwrap();
        assert!(diff < 1e-5);
    }

    #[test]
    fn test_expansion_factor() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let _ff = FeedForward::new(8, 0.0, vb).unwrap();
        let data = varmap.data().lock().unwrap();
        assert_eq!(data["ff_linear1.weight"].dims(), &[32, 8]);
        assert_eq!(data["ff_linear2.weight"].dims(), &[8, 32]);
    }
}
