use std::io::{BufRead, Write};

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use log::info;
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    checkpoint::CheckpointStore,
    config::Config,
    error::{Error, Result},
    tokenizer_helper::TokenizerHelper,
    transformer::{transformer, Transformer},
};

/// The reply is the first line the model wrote after the separator.
pub fn extract_reply(generated: &str, separator: &str) -> String {
    generated
        .split(separator)
        .nth(1)
        .and_then(|rest| rest.split('\n').next())
        .unwrap_or_default()
        .to_string()
}

fn format_generation(max_new_tokens: usize, text: &str) -> String {
    let rule = "=".repeat(50);
    format!("generated ({max_new_tokens} tokens)\n{rule}\n{text}\n{rule}\n\n")
}

pub struct ChatSession {
    config: Config,
    tokenizer: TokenizerHelper,
    _varmap: VarMap,
    model: Transformer,
    device: Device,
    rng: StdRng,
}

impl ChatSession {
    /// Loads the trained parameters from `config.checkpoint_path`.
    pub fn new(config: Config, tokenizer: TokenizerHelper, device: Device) -> Result<Self> {
        config.validate()?;
        tokenizer.check_vocab_size(config.vocab_size)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model = transformer(&config, vb)?;
        let store = CheckpointStore::new(&config.checkpoint_path);
        let iteration = store.restore_model(&varmap)?;
        info!(
            "loaded {} trained for {iteration} iterations",
            store.path().display()
        );

        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Self {
            config,
            tokenizer,
            _varmap: varmap,
            model,
            device,
            rng,
        })
    }

    /// Generates a continuation of `line` plus the separator, writes the whole
    /// decoded output to the generation log and returns the reply.
    pub fn respond(&mut self, line: &str) -> Result<String> {
        let prompt = format!("{line}{}", self.config.separator);
        let ids = self.tokenizer.encode(&prompt)?;
        let idx = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let generated = self
            .model
            .generate(&idx, self.config.max_new_tokens, &mut self.rng)?;
        let text = self
            .tokenizer
            .decode(&generated.squeeze(0)?.to_vec1::<u32>()?)?;

        let log_path = &self.config.generation_log_path;
        std::fs::write(log_path, format_generation(self.config.max_new_tokens, &text))
            .map_err(|e| Error::io(log_path, e))?;

        Ok(extract_reply(&text, &self.config.separator))
    }

    /// Prompt/answer loop until `input` reaches end of file.
    pub fn run<R: BufRead, W: Write>(&mut self, mut input: R, mut output: W) -> Result<()> {
        let stdout_error = |e| Error::io("<output>", e);
        loop {
            write!(output, "U >: ").map_err(stdout_error)?;
            output.flush().map_err(stdout_error)?;

            let mut line = String::new();
            let read = input
                .read_line(&mut line)
                .map_err(|e| Error::io("<input>", e))?;
            if read == 0 {
                return Ok(());
            }
            let reply = self.respond(line.trim_end_matches(['\r', '\n']))?;
            writeln!(output, "A >: {reply}").map_err(stdout_error)?;
        }
    }
}
