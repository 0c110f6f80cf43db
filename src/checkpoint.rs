use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use log::info;

use crate::{
    error::{Error, Result},
    optimizer::AdamW,
};

const MODEL_PREFIX: &str = "model.";
const OPTIMIZER_PREFIX: &str = "optimizer.";
const ITERATION_KEY: &str = "iteration";

/// A single safetensors file holding model parameters, optimizer state and the
/// iteration to resume from. Every save replaces the previous file.
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn save(&self, varmap: &VarMap, optimizer: &AdamW, iteration: usize) -> Result<()> {
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        {
            let data = varmap
                .data()
                .lock()
                .map_err(|e| Error::Checkpoint(format!("varmap lock poisoned: {e}")))?;
            for (name, var) in data.iter() {
                tensors.insert(format!("{MODEL_PREFIX}{name}"), var.as_tensor().copy()?);
            }
        }
        for (name, tensor) in optimizer.state()? {
            tensors.insert(format!("{OPTIMIZER_PREFIX}{name}"), tensor);
        }
        tensors.insert(
            ITERATION_KEY.to_string(),
            Tensor::new(&[iteration as i64], &Device::Cpu)?,
        );

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        // Written next to the target and renamed over it, so a crash mid-save
        // leaves the previous checkpoint intact.
        let tmp = self.path.with_extension("safetensors.tmp");
        candle_core::safetensors::save(&tensors, &tmp)?;
        std::fs::rename(&tmp, &self.path).map_err(|e| Error::io(&self.path, e))?;
        info!(
            "saved checkpoint at iteration {iteration} to {}",
            self.path.display()
        );
        Ok(())
    }

    /// Restores parameters and optimizer state; returns the saved iteration.
    pub fn restore(&self, varmap: &VarMap, optimizer: &mut AdamW) -> Result<usize> {
        let tensors = self.read()?;
        load_model_state(&tensors, varmap)?;

        let optimizer_state: HashMap<String, Tensor> = tensors
            .iter()
            .filter_map(|(key, tensor)| {
                key.strip_prefix(OPTIMIZER_PREFIX)
                    .map(|name| (name.to_string(), tensor.clone()))
            })
            .collect();
        optimizer
            .load_state(&optimizer_state)
            .map_err(|e| Error::Checkpoint(e.to_string()))?;

        let iteration = iteration(&tensors)?;
        info!(
            "restored checkpoint {} at iteration {iteration}",
            self.path.display()
        );
        Ok(iteration)
    }

    /// Restores only the parameters, for inference.
    pub fn restore_model(&self, varmap: &VarMap) -> Result<usize> {
        let tensors = self.read()?;
        load_model_state(&tensors, varmap)?;
        iteration(&tensors)
    }

    fn read(&self) -> Result<HashMap<String, Tensor>> {
        if !self.exists() {
            return Err(Error::io(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "checkpoint not found"),
            ));
        }
        Ok(candle_core::safetensors::load(&self.path, &Device::Cpu)?)
    }
}

fn load_model_state(tensors: &HashMap<String, Tensor>, varmap: &VarMap) -> Result<()> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| Error::Checkpoint(format!("varmap lock poisoned: {e}")))?;
    for (name, var) in data.iter() {
        let saved = tensors
            .get(&format!("{MODEL_PREFIX}{name}"))
            .ok_or_else(|| Error::Checkpoint(format!("parameter `{name}` is not in the checkpoint")))?;
        if saved.shape() != var.shape() {
            return Err(Error::Checkpoint(format!(
                "parameter `{name}` has shape {:?} in the checkpoint but {:?} in the model",
                saved.dims(),
                var.dims()
            )));
        }
        var.set(&saved.to_device(var.device())?.to_dtype(var.dtype())?)?;
    }
    Ok(())
}

fn iteration(tensors: &HashMap<String, Tensor>) -> Result<usize> {
    let tensor = tensors
        .get(ITERATION_KEY)
        .ok_or_else(|| Error::Checkpoint("checkpoint has no iteration".to_string()))?;
    let iteration = tensor
        .to_dtype(DType::I64)?
        .flatten_all()?
        .to_vec1::<i64>()?
        .first()
        .copied()
        .ok_or_else(|| Error::Checkpoint("checkpoint iteration is empty".to_string()))?;
    Ok(iteration as usize)
}

#[cfg(test)]
mod tests {
    use candle_nn::VarBuilder;

    use super::*;
    use crate::{config::Config, transformer::transformer};

    fn config() -> Config {
        Config {
            block_size: 4,
            vocab_size: 16,
            n_embed: 8,
            n_heads: 2,
            n_layers: 2,
            ..Config::default()
        }
    }

    fn snapshot(varmap: &VarMap) -> HashMap<String, Vec<f32>> {
        varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.flatten_all().unwrap().to_vec1::<f32>().unwrap()))
            .collect()
    }

    fn train_once(config: &Config, varmap: &VarMap, optimizer: &mut AdamW) {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let model = transformer(config, vb).unwrap();
        let idx = Tensor::new(&[[1u32, 2, 3, 4]], &Device::Cpu).unwrap();
        let target = Tensor::new(&[2u32, 3, 4, 5], &Device::Cpu).unwrap();
        let logits = model.forward(&idx, true).unwrap().flatten_to(1).unwrap();
        let loss = candle_nn::loss::cross_entropy(&logits, &target).unwrap();
        optimizer.backward_step(&loss).unwrap();
    }

    #[test]
    fn test_round_trip_restores_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("ckpt/model.safetensors"));
        assert!(!store.exists());

        let config = config();
        let varmap = VarMap::new();
        let mut optimizer = {
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let _model = transformer(&config, vb).unwrap();
            AdamW::new_lr(&varmap, 1e-2).unwrap()
        };
        train_once(&config, &varmap, &mut optimizer);
        store.save(&varmap, &optimizer, 7).unwrap();
        assert!(store.exists());

        let params = snapshot(&varmap);
        let moments = optimizer.state().unwrap();

        // drift away from the saved state
        train_once(&config, &varmap, &mut optimizer);
        assert_ne!(snapshot(&varmap), params);

        let iteration = store.restore(&varmap, &mut optimizer).unwrap();
        assert_eq!(iteration, 7);
        assert_eq!(snapshot(&varmap), params);
        assert_eq!(optimizer.step_count(), 1);
        let restored = optimizer.state().unwrap();
        for (key, tensor) in moments {
            assert_eq!(
                tensor.flatten_all().unwrap().to_dtype(DType::F64).unwrap().to_vec1::<f64>().unwrap(),
                restored[&key].flatten_all().unwrap().to_dtype(DType::F64).unwrap().to_vec1::<f64>().unwrap()
            );
        }
    }

    #[test]
    fn test_restore_model_into_fresh_varmap() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("model.safetensors"));
        let config = config();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _model = transformer(&config, vb).unwrap();
        let optimizer = AdamW::new_lr(&varmap, 1e-2).unwrap();
        store.save(&varmap, &optimizer, 3).unwrap();

        let fresh = VarMap::new();
        let vb = VarBuilder::from_varmap(&fresh, DType::F32, &Device::Cpu);
        let _model = transformer(&config, vb).unwrap();
        assert_ne!(snapshot(&fresh), snapshot(&varmap));
        assert_eq!(store.restore_model(&fresh).unwrap(), 3);
        assert_eq!(snapshot(&fresh), snapshot(&varmap));
    }

    #[test]
    fn test_shape_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().join("model.safetensors"));

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _model = transformer(&config(), vb).unwrap();
        let optimizer = AdamW::new_lr(&varmap, 1e-2).unwrap();
        store.save(&varmap, &optimizer, 1).unwrap();

        let wider = Config {
            n_embed: 16,
            ..config()
        };
        let other = VarMap::new();
        let vb = VarBuilder::from_varmap(&other, DType::F32, &Device::Cpu);
        let _model = transformer(&wider, vb).unwrap();
        let mut optimizer = AdamW::new_lr(&other, 1e-2).unwrap();
        assert!(matches!(
            store.restore(&other, &mut optimizer),
            Err(Error::Checkpoint(_))
        ));
    }

    #[test]
    fn test_empty_iteration_is_an_error() {
        let mut tensors = HashMap::new();
        tensors.insert(
            ITERATION_KEY.to_string(),
            Tensor::new(&[0i64; 0], &Device::Cpu).unwrap(),
        );
        assert!(matches!(iteration(&tensors), Err(Error::Checkpoint(_))));

        tensors.insert(
            ITERATION_KEY.to_string(),
            Tensor::new(&[12i64], &Device::Cpu).unwrap(),
        );
        assert_eq!(iteration(&tensors).unwrap(), 12);
    }

    #[test]
    fn test_missing_checkpoint() {
        let store = CheckpointStore::new("no/such/checkpoint.safetensors");
        let varmap = VarMap::new();
        assert!(matches!(store.restore_model(&varmap), Err(Error::Io { .. })));
    }
}
