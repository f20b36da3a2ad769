#![doc = include_str!("../README.md")]
use std::env;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::{Layer, Registry};

pub mod acmod;
pub mod astar;
pub mod config;
pub mod decoder;
pub mod dict;
pub mod dict2pid;
pub mod error;
pub mod feat;
pub mod gauden;
pub mod hmm;
pub mod lattice;
pub mod lextree;
pub mod lm;
pub mod logmath;
pub mod mdef;
pub mod search;
pub mod senone;
pub mod vithist;

pub use config::DecoderConfig;
pub use decoder::{Decoder, Models};
pub use error::{DecodeError, Result};
pub use logmath::{LogMath, Score, WORST_SCORE};

/// Convenience function to setup logging for any binaries I create.
/// Automatically sets all binaries and the decoder library crate to `info`
/// logging by default.
pub fn setup_logging() {
    let filter = match env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_env("RUST_LOG"),
        _ => EnvFilter::new("xd_asr=info,decode=info"),
    };

    let fmt = tracing_subscriber::fmt::Layer::default();

    let subscriber = filter.and_then(fmt).with_subscriber(Registry::default());

    tracing::subscriber::set_global_default(subscriber).unwrap();
}
