use thiserror::Error;

/// Precondition violations raised by layers. Surfaced through `anyhow::Error`, so callers can
/// recover the variant with `downcast_ref::<LayerError>()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayerError {
    #[error("shape mismatch in {context}: expected length {expected}, got {actual}")]
    ShapeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("batch size mismatch in {context}: expected {expected} examples, got {actual}")]
    BatchSizeMismatch {
        context: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{context} requires a preceding forward pass")]
    MissingForward { context: &'static str },

    #[error("{context} received an empty batch")]
    EmptyBatch { context: &'static str },

    #[error("invalid token at position {position}: {value} is not an index below {vocab_size}")]
    InvalidToken {
        position: usize,
        value: String,
        vocab_size: usize,
    },
}
