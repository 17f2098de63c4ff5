use rallypoint_protocol::ConfigError;

/// Errors raised by the prediction buffer.
#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    /// The step's sequence was already confirmed (or superseded).
    #[error("step {sequence} is obsolete, confirmed through {confirmed_through}")]
    Obsolete { sequence: u64, confirmed_through: u64 },

    /// Steps must be added in strictly increasing sequence order.
    #[error("step {sequence} is out of order, last buffered step is {last}")]
    OutOfOrder { sequence: u64, last: u64 },

    #[error(transparent)]
    Config(#[from] ConfigError),
}
