pub mod chat;
pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod decoder;
pub mod embeddings;
pub mod error;
pub mod feed_forward;
pub mod multi_head_attention;
pub mod optimizer;
pub mod residual_connection;
pub mod rms_norm;
pub mod tokenizer_helper;
pub mod train;
pub mod transformer;
pub mod utils;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use chat::ChatSession;
use config::Config;
use dataset::TokenDataset;
use tokenizer_helper::TokenizerHelper;
use train::Trainer;
use utils::device;

#[derive(Parser, Debug)]
#[command(name = "chat-transformer", about = "Train and chat with a small decoder-only transformer")]
struct Args {
    /// JSON file with config overrides.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override a single option, e.g. `--set block_size=128`. Repeatable.
    #[arg(long = "set", value_name = "KEY=VALUE", global = true)]
    overrides: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train the BPE tokenizer on the corpus.
    TrainTokenizer,
    /// Train the model, resuming from the checkpoint if present.
    Train,
    /// Interactive chat on stdin/stdout.
    Chat,
}

fn load_config(args: &Args) -> Result<Config> {
    let config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => Config::default(),
    };
    let config = config.with_assignments(args.overrides.as_slice())?;
    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args)?;
    info!("TRANSFORMER CONFIG: {config:?}");

    match args.command {
        Command::TrainTokenizer => {
            TokenizerHelper::train(&config.corpus_path, config.vocab_size, &config.tokenizer_path)
                .context("training tokenizer")?;
        }
        Command::Train => {
            let device = device(&config.device)?;
            let tokenizer = TokenizerHelper::load(&config.tokenizer_path)
                .context("loading tokenizer, run `train-tokenizer` first")?;
            tokenizer.check_vocab_size(config.vocab_size)?;
            let dataset = TokenDataset::from_corpus(&config.corpus_path, &tokenizer, config.train_split)
                .context("loading corpus")?;
            let mut trainer = Trainer::new(config, dataset, device)?;
            trainer.run()?;
        }
        Command::Chat => {
            let device = device(&config.device)?;
            let tokenizer = TokenizerHelper::load(&config.tokenizer_path)
                .context("loading tokenizer")?;
            let mut session = ChatSession::new(config, tokenizer, device)?;
            let stdin = std::io::stdin();
            session.run(stdin.lock(), std::io::stdout())?;
        }
    }

    Ok(())
}
