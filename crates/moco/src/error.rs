/// Errors raised by the MoCo training components.
#[derive(Debug, thiserror::Error)]
pub enum MocoError {
    /// `before_fit` ran on a callback that already owns a key encoder or queue.
    #[error("Key encoder and queue are already defined")]
    AlreadyInitialized,

    /// A hook that needs the key encoder or queue ran before `before_fit`.
    #[error("MoCo state used before fit started: {0}")]
    NotInitialized(&'static str),

    /// The queue capacity is not a multiple of the batch size.
    #[error("Queue size {capacity} is not divisible by batch size {batch_size}")]
    QueueBatchMismatch { capacity: usize, batch_size: usize },

    /// Embedding width does not match the queue width.
    #[error("Expected embeddings of dimension {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// No callback supplied a loss for the batch.
    #[error("No callback provides a loss function")]
    NoLossFunction,

    /// The batch reached the loss without key embeddings.
    #[error("Batch has no key embeddings (before_batch did not run)")]
    MissingKeys,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
