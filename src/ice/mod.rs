//! Candidates, candidate pairs and the connectivity check list.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::io::Id;

mod candidate;
pub use candidate::{candidate_priority, Candidate, CandidateKind};

mod checklist;
pub use checklist::{CheckList, CheckListEvent, CheckListStats};

mod pair;
pub use pair::{pair_priority, CandidatePair, PairId, PairState};

mod sdp;

mod transaction;
pub use transaction::{TransactionTracker, NEVER_SEEN_AGE};

/// Credentials for STUN packages.
///
/// The `ufrag`/`pass` exchanged over signaling, from `a=ice-ufrag` and `a=ice-pwd`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCreds {
    /// From a=ice-ufrag
    pub ufrag: String,
    /// From a=ice-pwd
    pub pass: String,
}

impl IceCreds {
    /// Random credentials, 4 characters ufrag and 22 characters password.
    pub fn new() -> Self {
        IceCreds::with_rng(&mut fastrand::Rng::new())
    }

    pub(crate) fn with_rng(rng: &mut fastrand::Rng) -> Self {
        IceCreds {
            ufrag: Id::<4>::random_with(rng).to_string(),
            pass: Id::<22>::random_with(rng).to_string(),
        }
    }
}

impl Default for IceCreds {
    fn default() -> Self {
        IceCreds::new()
    }
}

/// ICE role, fixed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    /// Decides which pair is used by nominating it.
    Controlling,
    /// Follows the nomination of the other side.
    #[default]
    Controlled,
}

impl Role {
    pub fn is_controlling(&self) -> bool {
        *self == Role::Controlling
    }
}

/// When the controlling side nominates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NominatingStrategy {
    /// Wait until no better pair is still being checked, then nominate the best succeeded pair.
    #[default]
    BestValid,
    /// Nominate the first pair that succeeds.
    FirstValid,
}

/// Overall connectivity state, derived from the best pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum State {
    /// No candidate pairs yet.
    #[default]
    Waiting,
    /// Checks are being performed.
    Running,
    /// The best pair is nominated.
    Completed,
    /// Every pair failed.
    Failed,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Waiting => "waiting",
            State::Running => "running",
            State::Completed => "completed",
            State::Failed => "failed",
        };
        write!(f, "{s}")
    }
}
