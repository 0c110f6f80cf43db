use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Error, Result, Tensor};
use log::info;

/// Resolves the `device` config option. `auto` picks the first available
/// accelerator and falls back to the CPU.
pub fn device(selector: &str) -> Result<Device> {
    match selector {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(0),
        "metal" => Device::new_metal(0),
        "auto" => {
            if cuda_is_available() {
                Device::new_cuda(0)
            } else if metal_is_available() {
                Device::new_metal(0)
            } else {
                #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
                {
                    info!("Running on CPU, to run on GPU(metal), build with `--features metal`");
                }
                #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
                {
                    info!("Running on CPU, to run on GPU, build with `--features cuda`");
                }
                Ok(Device::Cpu)
            }
        }
        other => Err(Error::Msg(format!("unknown device `{other}`"))),
    }
}

/// Lower-triangular `(1, size, size)` mask: 1 where position `i` may attend to `j <= i`.
pub fn causal_mask(size: usize, device: &Device) -> Result<Tensor> {
    Tensor::tril2(size, DType::U8, device)?.unsqueeze(0)
}

/// Keeps `attn_weights` where `attn_mask` is non-zero and writes `-inf` elsewhere.
pub fn masked_fill(attn_weights: &Tensor, attn_mask: &Tensor) -> Result<Tensor> {
    let attn_device = attn_weights.device();
    let attn_dtype = attn_weights.dtype();
    let attn_shape = attn_weights.shape();

    let attn_mask = attn_mask.broadcast_as(attn_shape)?;
    let mask_value = Tensor::new(f32::NEG_INFINITY, attn_device)?
        .broadcast_as(attn_shape)?
        .to_dtype(attn_dtype)?;
    attn_mask.where_cond(attn_weights, &mask_value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Tensor;

    #[test]
    fn test_masked_fill() {
        let device = Device::Cpu;

        let attn_weights = Tensor::from_vec(vec![1f32, 2.0, 3.0, 4.0], (1, 4), &device).unwrap();
        let attn_mask = Tensor::from_vec(vec![0u32, 1, 0, 1], (1, 4), &device).unwrap();

        let result = masked_fill(&attn_weights, &attn_mask).unwrap();

        assert_eq!(
            result.to_vec2::<f32>().unwrap(),
            vec![vec![f32::NEG_INFINITY, 2.0, f32::NEG_INFINITY, 4.0]]
        );
    }

    #[test]
    fn test_causal_mask() {
        let device = Device::Cpu;

        let result = causal_mask(3, &device).unwrap();
        assert_eq!(result.dims3().unwrap(), (1, 3, 3));
        assert_eq!(
            result.squeeze(0).unwrap().to_vec2::<u8>().unwrap(),
            vec![vec![1, 0, 0], vec![1, 1, 0], vec![1, 1, 1]]
        );
    }

    #[test]
    fn test_device_selector() {
        assert!(device("cpu").unwrap().is_cpu());
        assert!(device("tpu").is_err());
    }
}
