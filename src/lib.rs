//! Byte-level BPE (Byte-Pair Encoding) tokenizer.
//!
//! Learns merge rules from a corpus with an incremental trainer (Algorithm 2
//! from "Byte Pair Encoding is Suboptimal for Language Model Pretraining"),
//! encodes text to token ids and back, handles special tokens, and persists
//! models in a line-oriented text format.
//!
//! Python bindings are available behind the `python` feature.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]
#![deny(unused_must_use)]

mod chunker;
mod error;
mod model_io;
mod progress;
pub mod stats;
mod tokenizer;
mod trainer;
pub mod types;
mod vocab;

#[cfg(feature = "python")]
mod python;

pub use chunker::{Chunker, GPT2_SPLIT_PATTERN, GPT4_SPLIT_PATTERN};
pub use error::{
    ConfigError, DecodeError, EncodeError, ErrorMode, ModelIoError, SpecialTokenError, TrainError,
};
pub use model_io::{MODEL_VERSION, render_token};
pub use tokenizer::{AllowedSpecial, Tokenizer};
pub use trainer::Trainer;
pub use types::{Token, TokenPair};
pub use vocab::Vocabulary;
