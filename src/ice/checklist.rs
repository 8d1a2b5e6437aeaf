use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::Instant;

use super::pair::PairList;
use super::{candidate_priority, Candidate, CandidateKind, CandidatePair, IceCreds};
use super::{NominatingStrategy, PairId, PairState, Role, State, TransactionTracker};
use crate::config::Timing;
use crate::io::{StunClass, StunMessage, StunMessageBuilder, StunMethod, Transmit};
use crate::util::Pii;

/// What an outstanding binding request was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CheckTag {
    /// Connectivity check of a pair, nominating if `use_candidate`.
    Pair { id: PairId, use_candidate: bool },
    /// Reflexive discovery towards a STUN server.
    Server { socket: usize, server: SocketAddr },
}

/// Events from a [`CheckList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckListEvent {
    /// A new local candidate to signal to the remote peer.
    LocalCandidate(Candidate),
    /// The derived state changed.
    StateChange(State),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckListStats {
    pub bind_request_sent: u64,
    pub bind_success_recv: u64,
    pub bind_request_recv: u64,
    pub discovered_recv_count: u64,
    pub nomination_send_count: u64,
}

/// Connectivity checks for one media stream.
///
/// Owns the local and remote candidates, the pairs formed from them, and
/// the STUN binding traffic that validates the pairs.
pub struct CheckList {
    /// Fixed for the session.
    role: Role,

    /// Sent in ICE-CONTROLLING/ICE-CONTROLLED. Drawn once.
    tie_breaker: u64,

    strategy: NominatingStrategy,

    timing: Timing,

    local_credentials: IceCreds,

    /// Checks can't be sent before these are known.
    remote_credentials: Option<IceCreds>,

    /// Local candidates, in the order they were added.
    local_candidates: Vec<Candidate>,

    /// Remote candidates, in the order they were added.
    remote_candidates: Vec<Candidate>,

    pairs: PairList,

    tracker: TransactionTracker<CheckTag>,

    /// Set by `start()`.
    started_at: Option<Instant>,

    /// Last scheduling pass, for `Ta` pacing.
    last_process: Option<Instant>,

    /// Last derived state, to detect changes.
    state: State,

    transmits: VecDeque<Transmit>,

    events: VecDeque<CheckListEvent>,

    stats: CheckListStats,
}

impl CheckList {
    pub fn new(
        role: Role,
        local_credentials: IceCreds,
        strategy: NominatingStrategy,
        timing: Timing,
        mut rng: fastrand::Rng,
    ) -> Self {
        let tie_breaker = rng.u64(..);
        CheckList {
            role,
            tie_breaker,
            strategy,
            timing,
            local_credentials,
            remote_credentials: None,
            local_candidates: vec![],
            remote_candidates: vec![],
            pairs: PairList::new(),
            tracker: TransactionTracker::new(rng, timing.transaction_timeout),
            started_at: None,
            last_process: None,
            state: State::Waiting,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
            stats: CheckListStats::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn local_credentials(&self) -> &IceCreds {
        &self.local_credentials
    }

    pub fn remote_credentials(&self) -> Option<&IceCreds> {
        self.remote_credentials.as_ref()
    }

    /// Set the remote credentials. Frozen pairs become Waiting.
    pub fn set_remote_credentials(&mut self, creds: IceCreds) {
        info!("Set remote credentials ufrag {}", Pii(&creds.ufrag));
        self.remote_credentials = Some(creds);
        self.unfreeze();
        self.evaluate_state();
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn stats(&self) -> CheckListStats {
        self.stats
    }

    pub fn local_candidates(&self) -> &[Candidate] {
        &self.local_candidates
    }

    pub fn remote_candidates(&self) -> &[Candidate] {
        &self.remote_candidates
    }

    /// All pairs, best first.
    pub fn pairs(&self) -> impl Iterator<Item = &CandidatePair> + '_ {
        self.pairs.iter()
    }

    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    /// The best pair that has passed a check, if any.
    pub fn best_candidate_pair(&self) -> Option<&CandidatePair> {
        self.pairs.front().filter(|p| {
            matches!(
                p.state(),
                PairState::Succeeded | PairState::Nominating | PairState::Nominated
            )
        })
    }

    /// Create host candidates for the sockets and ask the STUN servers for our
    /// reflexive address on each of them.
    pub fn start(&mut self, now: Instant, sockets: &[SocketAddr], stun_servers: &[SocketAddr]) {
        if self.started_at.is_some() {
            debug!("Check list already started");
            return;
        }
        self.started_at = Some(now);

        for (idx, addr) in sockets.iter().enumerate() {
            self.add_local_candidate(Candidate::local(CandidateKind::Host, *addr, idx));
        }

        for (socket, addr) in sockets.iter().enumerate() {
            for server in stun_servers.iter().filter(|s| s.is_ipv4() == addr.is_ipv4()) {
                let trans_id = self.tracker.set_transaction_id(
                    now,
                    CheckTag::Server {
                        socket,
                        server: *server,
                    },
                );
                let msg = StunMessageBuilder::new(StunMethod::Binding, StunClass::Request, trans_id)
                    .build();
                debug!("Send binding request to STUN server {} on socket {}", Pii(server), socket);
                self.transmit(socket, *server, msg.to_vec(None));
            }
        }

        self.evaluate_state();
    }

    /// Add a local candidate and pair it with every remote candidate.
    ///
    /// Returns `false` for candidates already known.
    pub fn add_local_candidate(&mut self, c: Candidate) -> bool {
        if c.socket_idx().is_none() {
            warn!("Local candidate without socket: {}", c);
            return false;
        }
        let exists = self.local_candidates.iter().any(|l| {
            l.kind() == c.kind() && l.addr() == c.addr() && l.socket_idx() == c.socket_idx()
        });
        if exists {
            trace!("Local candidate already known: {}", c);
            return false;
        }

        info!(
            "Add local candidate {} {} socket {:?}",
            c.kind(),
            Pii(c.addr()),
            c.socket_idx()
        );

        // Peer reflexive candidates are learned by the remote side on its own.
        if c.kind() != CandidateKind::PeerReflexive {
            self.events.push_back(CheckListEvent::LocalCandidate(c.clone()));
        }

        self.local_candidates.push(c.clone());

        let remotes = self.remote_candidates.clone();
        for remote in remotes {
            self.form_pair(c.clone(), remote);
        }
        self.after_pairing();

        true
    }

    /// Add a remote candidate and pair it with every local candidate.
    ///
    /// Returns `false` for addresses already known.
    pub fn add_remote_candidate(&mut self, c: Candidate) -> bool {
        if self.remote_candidates.iter().any(|r| r.addr() == c.addr()) {
            debug!("Remote candidate already known: {}", Pii(c.addr()));
            return false;
        }

        info!("Add remote candidate {} {}", c.kind(), Pii(c.addr()));
        self.remote_candidates.push(c.clone());
        self.pair_remote(c, None);

        true
    }

    fn pair_remote(&mut self, remote: Candidate, only_socket: Option<usize>) {
        let locals: Vec<Candidate> = match only_socket {
            Some(socket) => self
                .local_candidates
                .iter()
                .find(|l| {
                    l.socket_idx() == Some(socket) && l.kind() != CandidateKind::PeerReflexive
                })
                .cloned()
                .into_iter()
                .collect(),
            None => self.local_candidates.clone(),
        };
        for local in locals {
            self.form_pair(local, remote.clone());
        }
        self.after_pairing();
    }

    fn form_pair(&mut self, local: Candidate, remote: Candidate) {
        if local.addr().is_ipv4() != remote.addr().is_ipv4() {
            return;
        }
        let pair = CandidatePair::new(self.role, local, remote);
        trace!(
            "Form pair {} socket {} -> {} prio {}",
            pair.id(),
            pair.socket_idx(),
            pair.remote().addr(),
            pair.priority()
        );
        self.pairs.insert(pair);
    }

    fn after_pairing(&mut self) {
        let pruned = self.pairs.prune();
        if pruned > 0 {
            trace!("Pruned {} redundant pairs", pruned);
        }
        self.unfreeze();
        self.evaluate_state();
    }

    fn unfreeze(&mut self) {
        if self.remote_credentials.is_none() {
            return;
        }
        let frozen: Vec<_> = self
            .pairs
            .iter()
            .filter(|p| p.state() == PairState::Frozen)
            .map(|p| p.id())
            .collect();
        for id in frozen {
            self.pairs.set_state(id, PairState::Waiting);
        }
    }

    /// One scheduling pass, at most once per `Ta`.
    pub fn process(&mut self, now: Instant) {
        if self.started_at.is_none() {
            return;
        }
        if let Some(last) = self.last_process {
            if now < last + self.timing.ta {
                return;
            }
        }
        self.last_process = Some(now);

        if self.remote_credentials.is_some() {
            self.start_checks(now);
            if self.role.is_controlling() {
                self.nominate(now);
            }
            self.retransmit(now);
        }

        self.evaluate_state();
    }

    /// Start one new check per socket, on its best waiting pair.
    fn start_checks(&mut self, now: Instant) {
        let mut sockets = HashSet::new();
        let to_check: Vec<_> = self
            .pairs
            .iter()
            .filter(|p| p.state() == PairState::Waiting)
            .filter(|p| sockets.insert(p.socket_idx()))
            .map(|p| p.id())
            .collect();

        for id in to_check {
            self.pairs.set_state(id, PairState::InProgress);
            self.send_check(now, id, false);
        }
    }

    fn nominate(&mut self, now: Instant) {
        let Some(front) = self.pairs.front() else {
            return;
        };
        if front.state() != PairState::Succeeded {
            return;
        }

        if self.strategy == NominatingStrategy::BestValid {
            let pending_better = self.pairs.iter().any(|p| {
                matches!(
                    p.state(),
                    PairState::Frozen | PairState::Waiting | PairState::InProgress
                ) && p.priority() > front.priority()
            });
            if pending_better {
                trace!("Hold nomination of pair {}, better pairs pending", front.id());
                return;
            }
        }

        let id = front.id();
        info!(
            "Nominate pair {} socket {} -> {}",
            id,
            front.socket_idx(),
            Pii(front.remote().addr())
        );
        self.pairs.set_state(id, PairState::Nominating);
        self.pairs.reset_attempts(id);
        self.stats.nomination_send_count += 1;
        self.send_check(now, id, true);
    }

    /// Per socket, retransmit the pair waiting longest for a response once RTO passed.
    fn retransmit(&mut self, now: Instant) {
        let mut oldest: BTreeMap<usize, (Instant, PairId)> = BTreeMap::new();
        for p in self.pairs.iter() {
            if !matches!(p.state(), PairState::InProgress | PairState::Nominating) {
                continue;
            }
            let tag = CheckTag::Pair {
                id: p.id(),
                use_candidate: p.state() == PairState::Nominating,
            };
            let last = self.tracker.last_timepoint(now, &tag);
            let entry = oldest.entry(p.socket_idx()).or_insert((last, p.id()));
            if last < entry.0 {
                *entry = (last, p.id());
            }
        }

        for (_, (last, id)) in oldest {
            if now.saturating_duration_since(last) < self.timing.rto {
                continue;
            }
            let pair = self.pairs.get(id);
            if pair.attempts() >= self.timing.max_attempts {
                debug!("Pair {} failed after {} attempts", id, pair.attempts());
                self.pairs.set_state(id, PairState::Failed);
            } else {
                let use_candidate = pair.state() == PairState::Nominating;
                self.send_check(now, id, use_candidate);
            }
        }
    }

    fn send_check(&mut self, now: Instant, id: PairId, use_candidate: bool) {
        let Some(remote) = self.remote_credentials.clone() else {
            return;
        };

        let pair = self.pairs.get(id);
        let socket = pair.socket_idx();
        let destination = pair.remote().addr();
        let username = format!("{}:{}", remote.ufrag, self.local_credentials.ufrag);
        let prio = candidate_priority(CandidateKind::PeerReflexive, socket);

        let tag = CheckTag::Pair { id, use_candidate };
        let trans_id = self.tracker.set_transaction_id(now, tag);
        let msg = StunMessageBuilder::new(StunMethod::Binding, StunClass::Request, trans_id)
            .username(&username)
            .prio(prio)
            .ice_role(self.role.is_controlling(), self.tie_breaker)
            .use_candidate(use_candidate)
            .build();
        let buf = msg.to_vec(Some(remote.pass.as_bytes()));

        let attempt = self.pairs.increment_attempts(id);
        self.stats.bind_request_sent += 1;
        debug!(
            "Send binding request pair {} attempt {} socket {} -> {}{}",
            id,
            attempt,
            socket,
            Pii(destination),
            if use_candidate { " USE-CANDIDATE" } else { "" }
        );

        self.transmit(socket, destination, buf);
    }

    /// Handle a STUN datagram received on `socket` from `source`.
    pub fn recv(&mut self, now: Instant, socket: usize, source: SocketAddr, buf: &[u8]) {
        let msg = match StunMessage::parse(buf) {
            Ok(v) => v,
            Err(e) => {
                warn!("Drop STUN from {}: {}", Pii(source), e);
                return;
            }
        };

        if msg.is_binding_request() {
            self.on_stun_request(socket, source, &msg);
        } else if msg.is_response() && msg.method() == StunMethod::Binding {
            self.on_stun_response(now, source, &msg);
        } else {
            debug!(
                "Ignore STUN {:?} {:?} from {}",
                msg.method(),
                msg.class(),
                Pii(source)
            );
        }

        self.evaluate_state();
    }

    fn on_stun_request(&mut self, socket: usize, source: SocketAddr, msg: &StunMessage) {
        let Some((local_ufrag, remote_ufrag)) = msg.split_username() else {
            warn!("Binding request without valid USERNAME from {}", Pii(source));
            return;
        };
        if local_ufrag != self.local_credentials.ufrag {
            warn!("Binding request for other ufrag from {}", Pii(source));
            return;
        }
        if let Some(remote) = &self.remote_credentials {
            if remote_ufrag != remote.ufrag {
                warn!("Binding request from other remote ufrag {}", Pii(source));
                return;
            }
        }
        if !msg.check_integrity(self.local_credentials.pass.as_bytes()) {
            warn!("Binding request with bad integrity from {}", Pii(source));
            return;
        }
        let role_ok = match self.role {
            Role::Controlling => msg.ice_controlled().is_some(),
            Role::Controlled => msg.ice_controlling().is_some(),
        };
        if !role_ok {
            warn!("Binding request role conflict from {}", Pii(source));
            return;
        }
        let Some(prio) = msg.prio() else {
            warn!("Binding request without PRIORITY from {}", Pii(source));
            return;
        };

        self.stats.bind_request_recv += 1;

        if !self.remote_candidates.iter().any(|c| c.addr() == source) {
            let c = Candidate::remote(CandidateKind::PeerReflexive, source, prio);
            info!("Discovered peer reflexive remote candidate {}", Pii(source));
            self.stats.discovered_recv_count += 1;
            self.remote_candidates.push(c.clone());
            self.pair_remote(c, Some(socket));
        }

        if msg.use_candidate() && self.role == Role::Controlled {
            if let Some(id) = self.pairs.find(socket, source) {
                self.nominated_by_remote(id);
            }
        }

        let reply = StunMessageBuilder::new(StunMethod::Binding, StunClass::Success, msg.trans_id())
            .mapped_address(source)
            .build();
        let buf = reply.to_vec(Some(self.local_credentials.pass.as_bytes()));
        trace!("Send binding response socket {} -> {}", socket, Pii(source));
        self.transmit(socket, source, buf);
    }

    fn nominated_by_remote(&mut self, id: PairId) {
        match self.pairs.get(id).state() {
            PairState::Succeeded => {
                info!("Pair {} nominated by remote", id);
                self.pairs.set_state(id, PairState::Nominated);
            }
            PairState::Nominated | PairState::Failed => {}
            _ => {
                debug!("Pair {} nominated before own check succeeded", id);
                self.pairs.set_nominate_on_success(id);
            }
        }
    }

    fn on_stun_response(&mut self, now: Instant, source: SocketAddr, msg: &StunMessage) {
        let hash = msg.trans_id().hash();
        let Some(tag) = self.tracker.tag(hash) else {
            warn!("Binding response for unknown transaction from {}", Pii(source));
            return;
        };

        match tag {
            CheckTag::Server { socket, server } => {
                self.tracker.remove_transaction(now, hash);
                if source != server || !msg.is_successful_binding_response() {
                    debug!("Unusable binding response from STUN server {}", Pii(source));
                    return;
                }
                if let Some(mapped) = msg.mapped_address() {
                    self.add_local_candidate(Candidate::local(
                        CandidateKind::ServerReflexive,
                        mapped,
                        socket,
                    ));
                }
            }
            CheckTag::Pair { id, use_candidate } => {
                self.on_check_response(now, source, msg, hash, id, use_candidate)
            }
        }
    }

    fn on_check_response(
        &mut self,
        now: Instant,
        source: SocketAddr,
        msg: &StunMessage,
        hash: u32,
        id: PairId,
        use_candidate: bool,
    ) {
        if !self.pairs.contains(id) {
            trace!("Binding response for pruned pair {}", id);
            self.tracker.remove_transaction(now, hash);
            return;
        }
        let Some(remote) = &self.remote_credentials else {
            return;
        };
        if !msg.check_integrity(remote.pass.as_bytes()) {
            warn!("Binding response with bad integrity from {}", Pii(source));
            return;
        }
        self.tracker.remove_transaction(now, hash);

        let pair = self.pairs.get(id);
        if pair.remote().addr() != source {
            warn!(
                "Binding response for pair {} from unexpected {}",
                id,
                Pii(source)
            );
            self.pairs.set_state(id, PairState::Failed);
            return;
        }
        if msg.class() == StunClass::Failure {
            warn!("Binding error {:?} for pair {}", msg.error_code(), id);
            self.pairs.set_state(id, PairState::Failed);
            return;
        }
        let Some(mapped) = msg.mapped_address() else {
            warn!("Binding response without XOR-MAPPED-ADDRESS from {}", Pii(source));
            return;
        };

        self.stats.bind_success_recv += 1;

        let socket = pair.socket_idx();
        let nominate_on_success = pair.nominate_on_success();

        if !self.local_candidates.iter().any(|c| c.addr() == mapped) {
            info!("Discovered peer reflexive local candidate {}", Pii(mapped));
            self.add_local_candidate(Candidate::local(
                CandidateKind::PeerReflexive,
                mapped,
                socket,
            ));
        }

        self.pairs.set_state(id, PairState::Succeeded);

        // Only the answer to the USE-CANDIDATE request itself completes a nomination.
        let nominated = match self.role {
            Role::Controlling => use_candidate,
            Role::Controlled => nominate_on_success,
        };
        if nominated && self.pairs.set_state(id, PairState::Nominated) {
            info!("Pair {} nominated socket {} -> {}", id, socket, Pii(source));
        }
    }

    fn evaluate_state(&mut self) {
        let state = match self.pairs.front().map(|p| p.state()) {
            None => State::Waiting,
            Some(PairState::Nominated) => State::Completed,
            Some(PairState::Failed) => State::Failed,
            Some(_) => State::Running,
        };
        if state != self.state {
            info!("State change: {:?} -> {:?}", self.state, state);
            self.state = state;
            self.events.push_back(CheckListEvent::StateChange(state));
        }
    }

    fn transmit(&mut self, socket: usize, destination: SocketAddr, contents: Vec<u8>) {
        self.transmits.push_back(Transmit {
            socket,
            destination,
            contents: contents.into(),
        });
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<CheckListEvent> {
        self.events.pop_front()
    }

    /// When `process` has something to do next.
    pub fn poll_timeout(&self) -> Option<Instant> {
        match self.last_process {
            Some(last) => Some(last + self.timing.ta),
            None => self.started_at,
        }
    }
}
