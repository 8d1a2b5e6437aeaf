use thiserror::Error;

pub use crate::io::StunError;

/// Errors surfaced by the ICE agent.
///
/// Protocol failures on the wire never show up here. Malformed or unauthenticated
/// traffic is dropped and logged, unreachable paths end up as [`crate::State::Failed`].
#[derive(Debug, Error)]
pub enum IceError {
    /// A candidate string could not be parsed, or described an unusable address.
    #[error("ICE bad candidate: {0}")]
    BadCandidate(String),

    /// Some STUN protocol error.
    #[error("{0}")]
    Stun(#[from] StunError),

    /// The agent configuration is unusable.
    #[error("ICE config: {0}")]
    Config(String),
}
