use candle_core::{DType, Result, Tensor, D};
use candle_nn::{Init, Module, VarBuilder};

pub const RMS_NORM_EPS: f64 = 1e-6;

/// Root-mean-square normalization with a learned per-feature scale. Unlike
/// layer normalization there is no mean subtraction and no bias.
pub struct RmsNormalization {
    eps: f64,
    weight: Tensor,
}

impl RmsNormalization {
    pub fn new(features: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(features, "weight", Init::Const(1.))?;
        Ok(Self { eps, weight })
    }
}

impl Module for RmsNormalization {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs_dtype = xs.dtype();
        let xs = xs.to_dtype(DType::F32)?;
        let mean_sqr = xs.sqr()?.mean_keepdim(D::Minus1)?;
        let result = xs
            .broadcast_div(&(mean_sqr + self.eps)?.sqrt()?)?
            .to_dtype(xs_dtype)?
            .broadcast_mul(&self.weight)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{test_utils::to_vec3_round, Device};
    use candle_nn::VarMap;

    use super::*;

    #[test]
    fn test_rms_norm() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = RmsNormalization::new(3, RMS_NORM_EPS, vb).unwrap();
        let xs = Tensor::new(
            &[[[1f32, 2., 3.], [4., 5., 6.], [9., 8., 7.]]],
            &Device::Cpu,
        )
        .unwrap();
        let ys = layer.forward(&xs).unwrap();
        assert_eq!(
            to_vec3_round(&ys, 4).unwrap(),
            &[[
                [0.4629, 0.9258, 1.3887],
                [0.7895, 0.9869, 1.1843],
                [1.1192, 0.9948, 0.8705]
            ]]
        );
    }

    #[test]
    fn test_rms_norm_zero_input_is_finite() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = RmsNormalization::new(4, RMS_NORM_EPS, vb).unwrap();
        let xs = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let ys = layer.forward(&xs).unwrap();
        assert!(ys
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .all(|x| *x == 0.));
    }

    #[test]
    fn test_rms_norm_uses_learned_scale() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = RmsNormalization::new(2, RMS_NORM_EPS, vb).unwrap();
        varmap
            .data()
            .lock()
            .unwrap()
            .get("weight")
            .unwrap()
            .set(&Tensor::new(&[2f32, 0.5], &Device::Cpu).unwrap())
            .unwrap();
        let xs = Tensor::new(&[[[3f32, 3.]]], &Device::Cpu).unwrap();
        let ys = to_vec3_round(&layer.forward(&xs).unwrap(), 3).unwrap();
        assert_eq!(ys, &[[[2.0, 0.5]]]);
    }
}
