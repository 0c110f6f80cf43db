use candle_core::{DType, Device, Tensor};
use candle_nn::{loss, VarBuilder, VarMap};
use log::{debug, info};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    checkpoint::CheckpointStore,
    config::Config,
    dataset::TokenDataset,
    error::Result,
    optimizer::AdamW,
    transformer::{transformer, Transformer},
};

/// Cross-entropy between `(batch, seq_len, vocab)` logits and `(batch, seq_len)` targets.
pub fn loss_fn(logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
    loss::cross_entropy(&logits.flatten_to(1)?, &targets.flatten_all()?)
}

pub struct Trainer {
    config: Config,
    device: Device,
    varmap: VarMap,
    model: Transformer,
    optimizer: AdamW,
    dataset: TokenDataset,
    store: CheckpointStore,
    rng: StdRng,
    start_iter: usize,
}

impl Trainer {
    /// Builds the model and optimizer, resuming from the checkpoint when one
    /// exists at `config.checkpoint_path`.
    pub fn new(config: Config, dataset: TokenDataset, device: Device) -> Result<Self> {
        config.validate()?;
        // both partitions must fit a window before any step runs
        dataset.train_batcher(config.block_size, config.batch_size, &device)?;
        dataset.valid_batcher(config.block_size, config.batch_size, &device)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = transformer(&config, vb)?;
        let mut optimizer = AdamW::new_lr(&varmap, config.lr)?;

        let store = CheckpointStore::new(&config.checkpoint_path);
        let start_iter = if store.exists() {
            info!("continuing training from {}", store.path().display());
            store.restore(&varmap, &mut optimizer)?
        } else {
            info!("initializing a new transformer model from scratch");
            0
        };
        let num_params: usize = varmap.all_vars().iter().map(|v| v.elem_count()).sum();
        info!(
            "model has {num_params} parameters, AdamW lr {}",
            optimizer.learning_rate()
        );

        let rng = StdRng::seed_from_u64(config.seed.wrapping_add(start_iter as u64));
        Ok(Self {
            config,
            device,
            varmap,
            model,
            optimizer,
            dataset,
            store,
            rng,
            start_iter,
        })
    }

    pub fn start_iter(&self) -> usize {
        self.start_iter
    }

    /// One optimizer update on `(input, target)`; returns the loss before the update.
    pub fn train_step(&mut self, input: &Tensor, target: &Tensor) -> Result<f32> {
        let logits = self.model.forward(input, true)?;
        let loss = loss_fn(&logits, target)?;
        self.optimizer.backward_step(&loss)?;
        Ok(loss.to_vec0::<f32>()?)
    }

    /// Mean loss over `val_iters` validation batches in evaluation mode.
    pub fn validate(&mut self) -> Result<f32> {
        let mut total = 0f32;
        for _ in 0..self.config.val_iters {
            let (input, target) = self
                .dataset
                .valid_batcher(self.config.block_size, self.config.batch_size, &self.device)?
                .next_batch(&mut self.rng)?;
            let logits = self.model.forward(&input, false)?;
            total += loss_fn(&logits, &target)?.to_vec0::<f32>()?;
        }
        Ok(total / self.config.val_iters as f32)
    }

    pub fn save(&self, iteration: usize) -> Result<()> {
        self.store.save(&self.varmap, &self.optimizer, iteration)
    }

    /// Runs from the resumed iteration up to `train_iters`, then writes a final
    /// checkpoint. A checkpoint stores the number of completed steps.
    pub fn run(&mut self) -> Result<()> {
        let train_iters = self.config.train_iters;
        if self.start_iter >= train_iters {
            info!(
                "checkpoint is already at iteration {} (target {train_iters})",
                self.start_iter
            );
        }
        for iter in self.start_iter..train_iters {
            self.run_iteration(iter)?;
        }
        self.start_iter = train_iters.max(self.start_iter);
        self.save(self.start_iter)
    }

    /// Step `iter` of the loop: one update on a training batch, then the
    /// periodic checkpoint (storing `iter + 1`) and validation.
    pub fn run_iteration(&mut self, iter: usize) -> Result<f32> {
        let (input, target) = self
            .dataset
            .train_batcher(self.config.block_size, self.config.batch_size, &self.device)?
            .next_batch(&mut self.rng)?;
        let loss = self.train_step(&input, &target)?;
        debug!("iteration {iter}: loss {loss}");

        if iter % self.config.save_interval == 0 {
            self.save(iter + 1)?;
        }

        if iter % self.config.eval_interval == 0 {
            let val_loss = self.validate()?;
            info!("iteration {iter}: train loss {loss:.4}, validation loss {val_loss:.4}");
        }
        Ok(loss)
    }
}
