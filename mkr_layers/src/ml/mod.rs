pub mod batch;
pub mod error;
pub mod init;
pub mod layers;
mod random;
pub mod seq2seq;

#[cfg(test)]
mod tests;

pub use batch::{Batch, LayerValues, NodeValue};
pub use error::LayerError;
pub use random::*;
