use thiserror::Error;

/// Pipeline error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid or missing settings, detected when a sampler is built.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The waveform or likelihood collaborator failed for specific parameters.
    #[error("physics evaluation failed: {0}")]
    PhysicsEvaluation(String),

    /// Two tables or arrays that must line up do not.
    #[error("shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        /// Where the mismatch was found.
        context: String,
        /// Expected length.
        expected: usize,
        /// Actual length.
        got: usize,
    },

    /// A parameter column required by a stage is absent.
    #[error("missing column `{0}`")]
    MissingColumn(String),

    /// A collaborator or transform broke its contract.
    #[error("contract violation: {0}")]
    Contract(String),

    /// Metadata / settings (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Worker pool could not be created.
    #[error("thread pool error: {0}")]
    ThreadPool(String),
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub(crate) fn contract(msg: impl Into<String>) -> Self {
        Error::Contract(msg.into())
    }

    pub(crate) fn shape(context: impl Into<String>, expected: usize, got: usize) -> Self {
        Error::ShapeMismatch {
            context: context.into(),
            expected,
            got,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
