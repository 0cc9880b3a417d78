use thiserror::Error;

/// Failures surfaced by the poll subsystem.
///
/// Expected absences (unknown poll id, empty selection) are reported through
/// `Option`/`bool` returns, never through this type.
#[derive(Debug, Error)]
pub enum PollError {
    /// A network-supplied byte payload failed structural checks.
    #[error("malformed poll payload: {0}")]
    MalformedWire(String),

    /// A locally initiated operation violated poll rules.
    #[error("poll validation failed: {0}")]
    Validation(String),

    /// The backing store rejected a read or write.
    #[error("poll store failure: {0}")]
    Persistence(#[from] sled::Error),

    /// A poll id is already confirmed with different content. Collisions
    /// against local drafts are recovered by re-keying the draft and never
    /// surface here.
    #[error("poll id {0} already confirmed with different content")]
    IdCollision(u32),

    /// A stored record could not be interpreted at load time.
    #[error("corrupt poll record: {0}")]
    Corrupt(String),

    /// Handing a poll transaction to the chain failed.
    #[error("poll submission failed: {0}")]
    Submit(String),
}

pub type Result<T> = std::result::Result<T, PollError>;

pub(crate) fn malformed(msg: impl Into<String>) -> PollError {
    PollError::MalformedWire(msg.into())
}

pub(crate) fn invalid(msg: impl Into<String>) -> PollError {
    PollError::Validation(msg.into())
}
