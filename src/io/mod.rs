#![allow(clippy::new_without_default)]

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;

mod stun;
pub use stun::{is_stun, long_term_key, Class as StunClass, Method as StunMethod};
pub use stun::{StunMessage, StunMessageBuilder, TransId, TRANSPORT_UDP};

mod id;
pub(crate) use id::Id;

mod sha1;
pub(crate) use self::sha1::Sha1;

mod error;
pub use self::error::StunError;

/// Max UDP packet size we produce.
pub const DATAGRAM_MTU: usize = 1150;

/// An instruction to send an outgoing packet.
pub struct Transmit {
    /// Index of the local socket (interface) to send from.
    ///
    /// Indexes beyond the configured interfaces denote relayed sockets. They never
    /// leave the [`Agent`][crate::Agent], which wraps them for the TURN server.
    pub socket: usize,

    /// The destination address.
    pub destination: SocketAddr,

    /// Contents of the datagram.
    pub contents: DatagramSend,
}

/// A wrapper for some payload that is to be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramSend(Vec<u8>);

impl From<Vec<u8>> for DatagramSend {
    fn from(value: Vec<u8>) -> Self {
        DatagramSend(value)
    }
}

impl From<DatagramSend> for Vec<u8> {
    fn from(value: DatagramSend) -> Self {
        value.0
    }
}

impl Deref for DatagramSend {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for Transmit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transmit")
            .field("socket", &self.socket)
            .field("destination", &self.destination)
            .field("len", &self.contents.len())
            .finish()
    }
}
