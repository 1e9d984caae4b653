use shared::events::EngineStatus;

/// Failures surfaced by the chat engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Daemon unreachable or timed out. Normally recovered by falling back to
    /// another backend.
    #[error("Local daemon not reachable: {message}")]
    DetectionFailure { message: String },

    #[error("Model failed to load: {message}")]
    LoadFailure { message: String },

    #[error("Generation failed: {message}")]
    StreamFailure { message: String },

    #[error("Required capability missing: {message}")]
    CapabilityMissing { message: String },

    #[error("Transcript storage failed: {0}")]
    PersistenceFailure(#[from] StoreError),

    #[error("A reply is already being generated")]
    Busy,

    #[error("Cannot {operation} while {status:?}")]
    InvalidState {
        operation: &'static str,
        status: EngineStatus,
    },

    #[error("No backend is available")]
    NoBackend,

    #[error("No model selected for {backend}")]
    NoModelSelected { backend: &'static str },
}

impl EngineError {
    /// Whether a retry/re-detect can be expected to help.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, EngineError::CapabilityMissing { .. })
    }
}

/// Failures of the keyed stores (transcripts and settings).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store initialization failed: {0}")]
    Initialization(String),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
