use std::io;

use thiserror::Error;

/// A STUN message could not be parsed or serialized.
#[derive(Debug, Error)]
pub enum StunError {
    /// A STUN message could not be parsed.
    #[error("STUN parse error: {0}")]
    Parse(String),

    /// An IO error occurred while writing a STUN message.
    #[error("STUN io: {0}")]
    Io(#[from] io::Error),
}
