//! A Sans I/O ICE agent in Rust.
//!
//! This is a [Sans I/O][sansio] implementation of Interactive Connectivity
//! Establishment (RFC 8445) with server reflexive discovery over STUN and
//! relaying over TURN. The [`Agent`] does no network talking and has no
//! internal threads or async tasks. All operations happen from the calls of
//! the public API.
//!
//! # Usage
//!
//! ```
//! use std::time::Instant;
//! use icelink::{Agent, AgentEvent, IceCreds};
//!
//! let now = Instant::now();
//!
//! let mut agent = Agent::builder()
//!     .set_controlling(true)
//!     .add_local_interface("192.168.1.10:5000".parse().unwrap())
//!     .add_stun_server("203.0.113.1:3478".parse().unwrap())
//!     .build()
//!     .unwrap();
//!
//! // From signaling.
//! agent.set_remote_credentials(IceCreds {
//!     ufrag: "Qa5x".into(),
//!     pass: "Yf3sdkd3Xpa0xK2jqLkpQm".into(),
//! });
//! agent
//!     .recv_remote_candidate("candidate:1 1 udp 2130706431 192.168.1.20 6000 typ host")
//!     .unwrap();
//!
//! agent.start(now);
//!
//! loop {
//!     // Send these using the socket at `transmit.socket`.
//!     while let Some(_transmit) = agent.poll_transmit() {}
//!
//!     while let Some(event) = agent.poll_event() {
//!         match event {
//!             AgentEvent::LocalCandidate(_c) => {}
//!             AgentEvent::StateChange(_s) => {}
//!             AgentEvent::Data { .. } => {}
//!         }
//!     }
//!
//!     // Wait for incoming packets until the timeout, pass them to
//!     // agent.recv(), then call agent.process(now).
//!     let Some(_timeout) = agent.poll_timeout() else {
//!         break;
//!     };
//!     # break;
//! }
//! ```
//!
//! # Sockets
//!
//! Local interfaces are given in preference order and the position of each is
//! its socket index. Every [`Transmit`][io::Transmit] names the socket to send
//! from, and every datagram passed to [`Agent::recv`] says which socket it came
//! in on. Relayed candidates get virtual socket indexes after the interfaces,
//! the agent wraps and unwraps their traffic for the TURN server itself.
//!
//! [sansio]: https://sans-io.readthedocs.io

#![forbid(unsafe_code)]
#![allow(clippy::new_without_default)]
#![allow(clippy::bool_to_int_with_if)]

#[macro_use]
extern crate tracing;

mod agent;
pub use agent::{Agent, AgentEvent};

mod config;
pub use config::{AgentConfig, Timing};
pub use config::{MAX_CHECK_ATTEMPTS, RTO_DEFAULT, STUN_SERVER_KEEPALIVE_PERIOD};
pub use config::{TA_DEFAULT, TRANSACTION_TIMEOUT};

mod error;
pub use error::{IceError, StunError};

mod ice;
pub use ice::{candidate_priority, pair_priority, Candidate, CandidateKind};
pub use ice::{CandidatePair, PairId, PairState};
pub use ice::{CheckList, CheckListEvent, CheckListStats};
pub use ice::{IceCreds, NominatingStrategy, Role, State};
pub use ice::{TransactionTracker, NEVER_SEEN_AGE};

pub mod io;

mod stun_client;
pub use stun_client::StunClient;

mod turn_client;
pub use turn_client::{TurnClient, TurnCredentials, TurnEvent, DEFAULT_LIFETIME};

mod util;
