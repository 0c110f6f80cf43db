use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// How raw attention scores `q·kᵀ` are scaled before the causal softmax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionScale {
    /// Multiply by `sqrt(n_embed)`, the default.
    SqrtEmbed,
    /// Divide by `sqrt(head_size)`.
    InvSqrtHead,
}

impl AttentionScale {
    pub fn factor(&self, n_embed: usize, head_size: usize) -> f64 {
        match self {
            Self::SqrtEmbed => (n_embed as f64).sqrt(),
            Self::InvSqrtHead => 1. / (head_size as f64).sqrt(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub block_size: usize,
    pub batch_size: usize,
    pub vocab_size: usize,
    pub n_embed: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub train_iters: usize,
    pub save_interval: usize,
    pub eval_interval: usize,
    pub val_iters: usize,
    pub lr: f64,
    pub attn_dropout: f32,
    pub block_dropout: f32,
    pub attention_scale: AttentionScale,
    /// `auto`, `cpu`, `cuda` or `metal`.
    pub device: String,
    pub train_split: f64,
    pub seed: u64,
    pub max_new_tokens: usize,
    pub separator: String,
    pub corpus_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub checkpoint_path: PathBuf,
    pub generation_log_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 256,
            batch_size: 64,
            vocab_size: 512,
            n_embed: 384,
            n_heads: 12,
            n_layers: 4,
            train_iters: 5000,
            save_interval: 100,
            eval_interval: 500,
            val_iters: 500,
            lr: 6e-4,
            attn_dropout: 0.1,
            block_dropout: 0.1,
            attention_scale: AttentionScale::SqrtEmbed,
            device: "auto".to_string(),
            train_split: 0.9,
            seed: 1337,
            max_new_tokens: 100,
            separator: "|".to_string(),
            corpus_path: PathBuf::from("data/chat.txt"),
            tokenizer_path: PathBuf::from("tokenizer/bpe.json"),
            checkpoint_path: PathBuf::from("checkpoints/transformer.safetensors"),
            generation_log_path: PathBuf::from("generated.txt"),
        }
    }
}

impl Config {
    pub fn head_size(&self) -> usize {
        self.n_embed / self.n_heads
    }

    pub fn attention_scale_factor(&self) -> f64 {
        self.attention_scale
            .factor(self.n_embed, self.head_size())
    }

    /// Reads a JSON object of overrides and merges it over the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let overrides: Map<String, Value> = serde_json::from_str(&text)?;
        Self::default().with_overrides(overrides)
    }

    /// Returns a copy with the named options replaced. Keys that are not options
    /// are skipped with a warning.
    pub fn with_overrides(&self, overrides: Map<String, Value>) -> Result<Self> {
        let mut current = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            other => {
                return Err(Error::InvalidConfiguration(format!(
                    "config serialized to {other} instead of an object"
                )))
            }
        };
        for (key, value) in overrides {
            match current.get_mut(&key) {
                Some(slot) => *slot = value,
                None => warn!("ignoring unknown config key `{key}`"),
            }
        }
        Ok(serde_json::from_value(Value::Object(current))?)
    }

    /// Applies `key=value` pairs. The value is parsed as a JSON literal and falls
    /// back to a plain string, so `lr=3e-4` and `device=cpu` both work.
    pub fn with_assignments<S: AsRef<str>>(&self, assignments: &[S]) -> Result<Self> {
        let mut overrides = Map::new();
        for assignment in assignments {
            let assignment = assignment.as_ref();
            let (key, raw) = assignment.split_once('=').ok_or_else(|| {
                Error::InvalidConfiguration(format!("expected key=value, got `{assignment}`"))
            })?;
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            overrides.insert(key.trim().to_string(), value);
        }
        self.with_overrides(overrides)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("block_size", self.block_size),
            ("batch_size", self.batch_size),
            ("vocab_size", self.vocab_size),
            ("n_embed", self.n_embed),
            ("n_heads", self.n_heads),
            ("n_layers", self.n_layers),
            ("save_interval", self.save_interval),
            ("eval_interval", self.eval_interval),
            ("val_iters", self.val_iters),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(Error::InvalidConfiguration(format!("{name} must be positive")));
            }
        }
        if self.n_embed % self.n_heads != 0 {
            return Err(Error::InvalidConfiguration(format!(
                "n_embed ({}) is not divisible by n_heads ({})",
                self.n_embed, self.n_heads
            )));
        }
        if !(0f32..1f32).contains(&self.attn_dropout) || !(0f32..1f32).contains(&self.block_dropout) {
            return Err(Error::InvalidConfiguration(
                "dropout probabilities must be in [0, 1)".to_string(),
            ));
        }
        if !(self.train_split > 0. && self.train_split < 1.) {
            return Err(Error::InvalidConfiguration(format!(
                "train_split must be in (0, 1), got {}",
                self.train_split
            )));
        }
        Ok(())
    }
}
