//! Server reflexive discovery against one STUN server from one local socket.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use crate::config::Timing;
use crate::ice::{Candidate, CandidateKind, TransactionTracker};
use crate::io::{StunClass, StunMessage, StunMessageBuilder, StunMethod, Transmit};
use crate::util::Pii;

/// Finds the server reflexive address of a socket and keeps the NAT binding
/// towards the server alive.
pub struct StunClient {
    server: SocketAddr,
    socket: usize,
    timing: Timing,
    tracker: TransactionTracker<()>,

    /// The reflexive address, once learned.
    reflexive: Option<SocketAddr>,

    /// A request is sent but not answered.
    pending: bool,

    last_sent: Option<Instant>,

    transmits: VecDeque<Transmit>,
    candidates: VecDeque<Candidate>,
}

impl StunClient {
    pub fn new(server: SocketAddr, socket: usize, timing: Timing, rng: fastrand::Rng) -> Self {
        StunClient {
            server,
            socket,
            timing,
            tracker: TransactionTracker::new(rng, timing.transaction_timeout),
            reflexive: None,
            pending: false,
            last_sent: None,
            transmits: VecDeque::new(),
            candidates: VecDeque::new(),
        }
    }

    /// The local socket index this client sends from.
    pub fn socket(&self) -> usize {
        self.socket
    }

    /// Whether `addr` is the server this client talks to.
    pub fn is_server_endpoint(&self, addr: SocketAddr) -> bool {
        self.server == addr
    }

    /// The server reflexive address, once known.
    pub fn reflexive(&self) -> Option<SocketAddr> {
        self.reflexive
    }

    fn interval(&self) -> std::time::Duration {
        if self.reflexive.is_none() || self.pending {
            self.timing.rto
        } else {
            self.timing.stun_keepalive
        }
    }

    pub fn process(&mut self, now: Instant) {
        if let Some(last) = self.last_sent {
            if now.saturating_duration_since(last) < self.interval() {
                return;
            }
        }

        let trans_id = self.tracker.set_transaction_id(now, ());
        let msg =
            StunMessageBuilder::new(StunMethod::Binding, StunClass::Request, trans_id).build();

        if self.reflexive.is_some() && !self.pending {
            trace!("STUN keepalive to {}", Pii(self.server));
        } else {
            debug!(
                "Send binding request to STUN server {} socket {}",
                Pii(self.server),
                self.socket
            );
        }

        self.pending = true;
        self.last_sent = Some(now);
        self.transmits.push_back(Transmit {
            socket: self.socket,
            destination: self.server,
            contents: msg.to_vec(None).into(),
        });
    }

    /// Handle a message from the server. Returns `false` if the message is
    /// not a response to one of our requests.
    pub fn recv(&mut self, now: Instant, msg: &StunMessage) -> bool {
        let hash = msg.trans_id().hash();
        if !self.tracker.has_transaction(hash) {
            return false;
        }
        self.tracker.remove_transaction(now, hash);
        self.pending = false;

        if !msg.is_successful_binding_response() {
            warn!(
                "STUN server {} answered {:?} {:?}",
                Pii(self.server),
                msg.class(),
                msg.error_code()
            );
            return true;
        }

        let Some(mapped) = msg.mapped_address() else {
            warn!("STUN response without XOR-MAPPED-ADDRESS from {}", Pii(self.server));
            return true;
        };

        if self.reflexive.is_none() {
            if !mapped.is_ipv4() {
                debug!("Ignore IPv6 reflexive address {}", Pii(mapped));
                return true;
            }
            info!(
                "Server reflexive address {} via {} socket {}",
                Pii(mapped),
                Pii(self.server),
                self.socket
            );
            self.reflexive = Some(mapped);
            self.candidates.push_back(Candidate::local(
                CandidateKind::ServerReflexive,
                mapped,
                self.socket,
            ));
        } else if self.reflexive != Some(mapped) {
            debug!("Reflexive address moved to {}, keeping the first", Pii(mapped));
        }

        true
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_candidate(&mut self) -> Option<Candidate> {
        self.candidates.pop_front()
    }

    pub fn poll_timeout(&self, now: Instant) -> Option<Instant> {
        Some(match self.last_sent {
            Some(last) => last + self.interval(),
            None => now,
        })
    }
}
