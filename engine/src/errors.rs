use thiserror::Error;

/// Errors that can occur in the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed or inconsistent configuration. Fatal at initialization.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Weight archive missing, corrupt, or inconsistent with the configuration.
    #[error("Weight load error: {0}")]
    WeightLoad(#[from] WeightLoadError),

    /// Fused kernel unavailable. Recorded as a downgrade, never fatal.
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Aborts the current generate call only.
    #[error("Generation error: {0}")]
    Generation(#[from] GenerationError),

    /// A cooperating worker failed, disconnected or timed out
    #[error("Collective error: {0}")]
    Collective(String),

    /// Internal tensor shape contract violated
    #[error("Shape error: {0}")]
    Shape(String),

    /// A background load or generation task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(String),

    /// IO error occurred (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("missing required field `{0}`")]
    MissingField(String),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("`{field}` ({value}) is not divisible by {divisor}")]
    NotDivisible {
        field: &'static str,
        value: usize,
        divisor: usize,
    },

    #[error("could not parse configuration: {0}")]
    Parse(String),

    #[error("could not read configuration {path}: {reason}")]
    Read { path: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WeightLoadError {
    #[error("no tensor archives found in {0}")]
    NoArchives(String),

    #[error("missing tensor `{0}`")]
    MissingTensor(String),

    #[error("tensor `{name}` has shape {found:?}, expected {expected:?} (or a shard of it)")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("corrupt archive {path}: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("could not read {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("tensor `{name}` cannot be sharded: {reason}")]
    Unshardable { name: String, reason: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("fused kernel requires quantized weights, checkpoint precision is {0}")]
    DensePrecision(String),

    #[error("fused kernel unsupported: `{field}` ({value}) is not a multiple of block size {block_size}")]
    UnalignedDimension {
        field: &'static str,
        value: usize,
        block_size: usize,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error("sequence of {requested} positions exceeds max_seq_len {max_seq_len}")]
    SequenceTooLong { requested: usize, max_seq_len: usize },

    #[error("batch of {requested} sequences exceeds max_batch_size {max_batch_size}")]
    BatchTooLarge {
        requested: usize,
        max_batch_size: usize,
    },

    #[error("invalid sampling parameters: {0}")]
    InvalidSampling(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("token id {token} is outside the vocabulary of {vocab_size}")]
    TokenOutOfRange { token: u32, vocab_size: usize },

    #[error("start position {start_pos} leaves a gap after cached length {cached}")]
    CacheGap { start_pos: usize, cached: usize },

    #[error("batch slot {0} was aborted and must be reset before reuse")]
    SlotNotReset(usize),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
