use std::path::Path;

use log::info;
use tokenizers::models::bpe::{BpeTrainerBuilder, BPE};
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::{
    DecoderWrapper, NormalizerWrapper, PostProcessorWrapper, PreTokenizerWrapper, Tokenizer,
    TokenizerBuilder,
};

use crate::error::{Error, Result};

fn tokenizer_error(e: tokenizers::Error) -> Error {
    Error::Tokenizer(e.to_string())
}

/// Byte-level BPE tokenizer shared by training and chat.
pub struct TokenizerHelper {
    tokenizer: Tokenizer,
}

impl TokenizerHelper {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "tokenizer file not found"),
            ));
        }
        let tokenizer = Tokenizer::from_file(path).map_err(tokenizer_error)?;
        Ok(Self { tokenizer })
    }

    /// Trains a byte-level BPE vocabulary of at most `vocab_size` entries on
    /// `corpus` and saves it to `path`.
    pub fn train(corpus: &Path, vocab_size: usize, path: &Path) -> Result<Self> {
        let byte_level = ByteLevel::default()
            .add_prefix_space(false)
            .use_regex(false);
        let mut trainer = BpeTrainerBuilder::new()
            .show_progress(false)
            .vocab_size(vocab_size)
            .min_frequency(0)
            .initial_alphabet(ByteLevel::alphabet())
            .build();

        let mut tokenizer = TokenizerBuilder::<
            BPE,
            NormalizerWrapper,
            PreTokenizerWrapper,
            PostProcessorWrapper,
            DecoderWrapper,
        >::default()
        .with_model(BPE::default())
        .with_pre_tokenizer(Some(PreTokenizerWrapper::ByteLevel(byte_level)))
        .with_decoder(Some(DecoderWrapper::ByteLevel(byte_level)))
        .build()
        .map_err(tokenizer_error)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let pretty = true;
        tokenizer
            .train_from_files(&mut trainer, vec![corpus.to_string_lossy().to_string()])
            .map_err(tokenizer_error)?
            .save(path, pretty)
            .map_err(tokenizer_error)?;

        let helper = Self::load(path)?;
        info!(
            "trained tokenizer with {} tokens, saved to {}",
            helper.vocab_size(),
            path.display()
        );
        Ok(helper)
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.tokenizer.encode(text, false).map_err(tokenizer_error)?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer.decode(ids, false).map_err(tokenizer_error)
    }

    /// Fails if the tokenizer can emit ids outside `[0, vocab_size)`.
    pub fn check_vocab_size(&self, vocab_size: usize) -> Result<()> {
        if self.vocab_size() > vocab_size {
            return Err(Error::InvalidConfiguration(format!(
                "tokenizer has {} tokens but the model vocab_size is {}",
                self.vocab_size(),
                vocab_size
            )));
        }
        Ok(())
    }
}
