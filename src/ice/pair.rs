use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Candidate, Role};

static NEXT_PAIR_ID: AtomicU64 = AtomicU64::new(1);

/// Process unique id of a [`CandidatePair`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairId(u64);

impl PairId {
    fn next() -> Self {
        PairId(NEXT_PAIR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a single candidate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairState {
    /// Not checked, waiting for remote credentials.
    Frozen,
    /// A check has not been sent for this pair.
    Waiting,
    /// A check has been sent, the transaction is in progress.
    InProgress,
    /// A check produced a successful result.
    Succeeded,
    /// The controlling side sent USE-CANDIDATE for this pair.
    Nominating,
    /// Selected for data.
    Nominated,
    /// The check never got a valid response. Terminal.
    Failed,
}

impl PairState {
    fn rank(&self) -> u8 {
        use PairState::*;
        match self {
            Frozen => 0,
            Waiting => 1,
            InProgress => 2,
            Succeeded => 3,
            Nominating => 4,
            Nominated => 5,
            Failed => 6,
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Transitions only ever go forward. A late or duplicate response can
    /// therefore never move a pair back.
    pub fn can_transition_to(&self, next: PairState) -> bool {
        use PairState::*;
        match self {
            Frozen => matches!(
                next,
                Waiting | InProgress | Succeeded | Nominating | Nominated | Failed
            ),
            Waiting => matches!(
                next,
                InProgress | Succeeded | Nominating | Nominated | Failed
            ),
            InProgress => matches!(next, Succeeded | Nominating | Nominated | Failed),
            Succeeded => matches!(next, Nominating | Nominated | Failed),
            Nominating => matches!(next, Nominated | Failed),
            Nominated => matches!(next, Failed),
            Failed => false,
        }
    }
}

/// Priority of a pair.
///
/// `G` is the priority of the controlling side's candidate, `D` the controlled side's.
/// `2^32 * MAX(G,D) + 2 * MIN(G,D) + (G > D ? 1 : 0)`.
pub fn pair_priority(role: Role, local: &Candidate, remote: &Candidate) -> u64 {
    let (g, d) = match role {
        Role::Controlling => (local.priority() as u64, remote.priority() as u64),
        Role::Controlled => (remote.priority() as u64, local.priority() as u64),
    };
    (g.max(d) << 32)
        .saturating_add(2 * g.min(d))
        .saturating_add(if g > d { 1 } else { 0 })
}

/// A pair of candidates, local and remote, under test.
#[derive(Debug, Clone)]
pub struct CandidatePair {
    id: PairId,
    local: Candidate,
    remote: Candidate,
    priority: u64,
    state: PairState,
    attempts: u32,
    /// USE-CANDIDATE arrived before our own check succeeded.
    nominate_on_success: bool,
}

impl CandidatePair {
    pub(crate) fn new(role: Role, local: Candidate, remote: Candidate) -> Self {
        CandidatePair {
            id: PairId::next(),
            priority: pair_priority(role, &local, &remote),
            local,
            remote,
            state: PairState::Frozen,
            attempts: 0,
            nominate_on_success: false,
        }
    }

    /// The stable id.
    pub fn id(&self) -> PairId {
        self.id
    }

    /// The local candidate.
    pub fn local(&self) -> &Candidate {
        &self.local
    }

    /// The remote candidate.
    pub fn remote(&self) -> &Candidate {
        &self.remote
    }

    /// The pair priority.
    pub fn priority(&self) -> u64 {
        self.priority
    }

    /// Current state.
    pub fn state(&self) -> PairState {
        self.state
    }

    /// Number of requests sent for this pair.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// The socket the local side sends from.
    pub fn socket_idx(&self) -> usize {
        self.local
            .socket_idx()
            .expect("local candidate of a pair has a socket")
    }

    pub(crate) fn nominate_on_success(&self) -> bool {
        self.nominate_on_success
    }

    fn order_key(&self) -> OrderKey {
        (
            self.state == PairState::Failed,
            Reverse(self.state.rank()),
            Reverse(self.priority),
            self.id,
        )
    }
}

// Failed last, then state, then priority, then creation order.
type OrderKey = (bool, Reverse<u8>, Reverse<u64>, PairId);

/// Arena of pairs by id, plus an index kept in check order.
#[derive(Debug, Default)]
pub struct PairList {
    pairs: HashMap<PairId, CandidatePair>,
    order: BTreeSet<OrderKey>,
}

impl PairList {
    pub fn new() -> Self {
        PairList::default()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn insert(&mut self, pair: CandidatePair) -> PairId {
        let id = pair.id;
        self.order.insert(pair.order_key());
        self.pairs.insert(id, pair);
        id
    }

    /// Look up a pair. Unknown ids are an invariant violation.
    pub fn get(&self, id: PairId) -> &CandidatePair {
        self.pairs
            .get(&id)
            .unwrap_or_else(|| panic!("unknown candidate pair {id}"))
    }

    pub fn contains(&self, id: PairId) -> bool {
        self.pairs.contains_key(&id)
    }

    /// The best pair, viable if any is.
    pub fn front(&self) -> Option<&CandidatePair> {
        self.order.first().map(|k| self.get(k.3))
    }

    /// All pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = &CandidatePair> + '_ {
        self.order.iter().map(|k| self.get(k.3))
    }

    /// The pair checking `remote` from `socket_idx`, if any.
    pub fn find(&self, socket_idx: usize, remote: SocketAddr) -> Option<PairId> {
        self.iter()
            .find(|p| p.socket_idx() == socket_idx && p.remote.addr() == remote)
            .map(|p| p.id)
    }

    fn update<F: FnOnce(&mut CandidatePair) -> R, R>(&mut self, id: PairId, f: F) -> R {
        let pair = self
            .pairs
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown candidate pair {id}"));
        self.order.remove(&pair.order_key());
        let r = f(pair);
        self.order.insert(pair.order_key());
        r
    }

    /// Move the pair to `state` if that is a forward transition.
    pub fn set_state(&mut self, id: PairId, state: PairState) -> bool {
        let current = self.get(id).state;
        if !current.can_transition_to(state) {
            trace!("Ignore pair {} transition {:?} -> {:?}", id, current, state);
            return false;
        }
        debug!("Pair {} state {:?} -> {:?}", id, current, state);
        self.update(id, |p| p.state = state);
        true
    }

    /// Count one more request for the pair, returning the new total.
    pub fn increment_attempts(&mut self, id: PairId) -> u32 {
        let pair = self
            .pairs
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown candidate pair {id}"));
        pair.attempts += 1;
        pair.attempts
    }

    /// Start counting attempts from zero, used when a succeeded pair is nominated.
    pub fn reset_attempts(&mut self, id: PairId) {
        let pair = self
            .pairs
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown candidate pair {id}"));
        pair.attempts = 0;
    }

    pub fn set_nominate_on_success(&mut self, id: PairId) {
        let pair = self
            .pairs
            .get_mut(&id)
            .unwrap_or_else(|| panic!("unknown candidate pair {id}"));
        pair.nominate_on_success = true;
    }

    /// Remove pairs that check the same remote address from the same socket.
    ///
    /// The earliest created pair is kept.
    pub fn prune(&mut self) -> usize {
        let mut by_id: Vec<_> = self
            .pairs
            .values()
            .map(|p| (p.id, p.socket_idx(), p.remote.addr()))
            .collect();
        by_id.sort_unstable_by_key(|(id, _, _)| *id);

        let mut seen = HashSet::new();
        let mut removed = 0;
        for (id, socket, remote) in by_id {
            if !seen.insert((socket, remote)) {
                if let Some(pair) = self.pairs.remove(&id) {
                    self.order.remove(&pair.order_key());
                    trace!("Prune redundant pair {}", id);
                    removed += 1;
                }
            }
        }
        removed
    }
}
