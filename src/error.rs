//! attnr error types

/// attnr result type
pub type Result<T> = std::result::Result<T, Error>;

/// attnr errors
///
/// Every variant is fatal to the invocation that raised it: the orchestrator
/// either completes with a full, consistent output or fails the whole call.
/// There is no retry or partial-result recovery.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Matrix header/payload mismatch or incompatible dimensions
    #[error("shape error: {reason}")]
    Shape {
        /// Description of what went wrong
        reason: String,
    },

    /// Tile budget too small to fit one row of the feature width
    #[error("config error: {reason}")]
    Config {
        /// Description of what went wrong
        reason: String,
    },

    /// The compute backend could not be acquired
    #[error("backend unavailable: {reason}")]
    BackendUnavailable {
        /// Description of what went wrong
        reason: String,
    },

    /// A dispatch or transfer reported failure
    #[error("backend operation failed: {reason}")]
    BackendOperation {
        /// Description of what went wrong
        reason: String,
    },
}
