pub mod positional_embedding;
pub mod token_embedding;
