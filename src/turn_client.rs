//! Relay allocation on a TURN server (RFC 5766) for one local socket.

use std::collections::{BTreeMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::Timing;
use crate::ice::{Candidate, CandidateKind, TransactionTracker};
use crate::io::{long_term_key, StunClass, StunMessage, StunMessageBuilder, StunMethod};
use crate::io::{Transmit, TRANSPORT_UDP};
use crate::util::Pii;

/// Lifetime asked for in Allocate requests, in seconds.
pub const DEFAULT_LIFETIME: u32 = 600;

/// Longest wait between two allocation refreshes.
const MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// Largest payload that fits a Send indication. The STUN length field is 16 bits
/// and also covers XOR-PEER-ADDRESS and the DATA header.
pub const MAX_SEND_DATA: usize = 65_504;

/// Refresh this long before the allocation would expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(10);

/// Long-term credentials for a TURN server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub username: String,
    pub password: String,
}

impl TurnCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        TurnCredentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for TurnCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum TurnTag {
    Allocate,
    Refresh,
    Permission(IpAddr),
}

#[derive(Debug, Default)]
struct Permission {
    /// The server confirmed the permission.
    done: bool,
    last_sent: Option<Instant>,
}

/// Output of a [`TurnClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// The relayed candidate of a new allocation.
    Relayed(Candidate),
    /// Payload from a peer, unwrapped from a Data indication.
    Data { peer: SocketAddr, contents: Vec<u8> },
}

/// Keeps one relay allocation alive and moves data through it.
///
/// The relayed candidate is bound to `relay_socket`, a virtual socket index.
/// Everything actually goes to the server over `socket`.
pub struct TurnClient {
    server: SocketAddr,
    socket: usize,
    relay_socket: usize,
    credentials: TurnCredentials,
    timing: Timing,
    tracker: TransactionTracker<TurnTag>,

    /// From the 401 challenge.
    realm: Option<String>,
    nonce: Option<String>,

    relayed: Option<SocketAddr>,
    lifetime: u32,

    /// The allocate/refresh slot. `None` means now.
    next_request: Option<Instant>,

    permissions: BTreeMap<IpAddr, Permission>,

    stopped: bool,

    transmits: VecDeque<Transmit>,
    events: VecDeque<TurnEvent>,
}

impl TurnClient {
    pub fn new(
        server: SocketAddr,
        socket: usize,
        relay_socket: usize,
        credentials: TurnCredentials,
        timing: Timing,
        rng: fastrand::Rng,
    ) -> Self {
        TurnClient {
            server,
            socket,
            relay_socket,
            credentials,
            timing,
            tracker: TransactionTracker::new(rng, timing.transaction_timeout),
            realm: None,
            nonce: None,
            relayed: None,
            lifetime: DEFAULT_LIFETIME,
            next_request: None,
            permissions: BTreeMap::new(),
            stopped: false,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        }
    }

    /// The physical socket towards the server.
    pub fn socket(&self) -> usize {
        self.socket
    }

    /// The virtual socket of the relayed candidate.
    pub fn relay_socket(&self) -> usize {
        self.relay_socket
    }

    pub fn is_server_endpoint(&self, addr: SocketAddr) -> bool {
        self.server == addr
    }

    /// The relayed address of the current allocation.
    pub fn relayed(&self) -> Option<SocketAddr> {
        self.relayed
    }

    pub fn has_permission(&self, peer: IpAddr) -> bool {
        self.permissions.get(&peer).map(|p| p.done).unwrap_or(false)
    }

    fn key(&self) -> Option<[u8; 16]> {
        let realm = self.realm.as_ref()?;
        Some(long_term_key(
            &self.credentials.username,
            realm,
            &self.credentials.password,
        ))
    }

    /// Add the long-term credential attributes, if challenged already, and serialize.
    fn sign<'a>(&'a self, b: StunMessageBuilder<'a>) -> Vec<u8> {
        match (&self.realm, &self.nonce, self.key()) {
            (Some(realm), Some(nonce), Some(key)) => b
                .username(&self.credentials.username)
                .realm(realm)
                .nonce(nonce)
                .build()
                .to_vec(Some(&key[..])),
            _ => b.build().to_vec(None),
        }
    }

    fn transmit(&mut self, contents: Vec<u8>) {
        self.transmits.push_back(Transmit {
            socket: self.socket,
            destination: self.server,
            contents: contents.into(),
        });
    }

    fn refresh_interval(&self) -> Duration {
        let lifetime = Duration::from_secs(self.lifetime as u64);
        MAX_REFRESH_INTERVAL
            .min(lifetime.saturating_sub(REFRESH_MARGIN))
            .max(self.timing.rto)
    }

    pub fn process(&mut self, now: Instant) {
        if self.stopped {
            return;
        }

        let due = self.next_request.map(|t| now >= t).unwrap_or(true);
        if !due {
            self.process_permissions_rto(now);
            return;
        }

        if self.relayed.is_none() {
            self.send_allocate(now);
        } else {
            self.send_refresh(now, self.lifetime);
        }
        // Retransmit at the same slot until a response moves it.
        self.next_request = Some(now + self.timing.rto);
    }

    fn send_allocate(&mut self, now: Instant) {
        let trans_id = self.tracker.set_transaction_id(now, TurnTag::Allocate);
        let b = StunMessageBuilder::new(StunMethod::Allocate, StunClass::Request, trans_id)
            .requested_transport(TRANSPORT_UDP)
            .lifetime(DEFAULT_LIFETIME);
        let buf = self.sign(b);
        debug!(
            "TURN allocate to {}{}",
            Pii(self.server),
            if self.realm.is_some() { " (authenticated)" } else { "" }
        );
        self.transmit(buf);
    }

    fn send_refresh(&mut self, now: Instant, lifetime: u32) {
        let trans_id = self.tracker.set_transaction_id(now, TurnTag::Refresh);
        let b = StunMessageBuilder::new(StunMethod::Refresh, StunClass::Request, trans_id)
            .lifetime(lifetime);
        let buf = self.sign(b);
        debug!("TURN refresh to {} lifetime {}", Pii(self.server), lifetime);
        self.transmit(buf);
    }

    fn send_permission(&mut self, now: Instant, ip: IpAddr) {
        let trans_id = self.tracker.set_transaction_id(now, TurnTag::Permission(ip));
        let b = StunMessageBuilder::new(StunMethod::CreatePermission, StunClass::Request, trans_id)
            .peer_address(SocketAddr::new(ip, 0));
        let buf = self.sign(b);
        debug!("TURN create permission for {}", Pii(ip));
        if let Some(p) = self.permissions.get_mut(&ip) {
            p.last_sent = Some(now);
        }
        self.transmit(buf);
    }

    /// Resend permissions that are not confirmed, one RTO after the last try.
    fn process_permissions_rto(&mut self, now: Instant) {
        if self.relayed.is_none() {
            return;
        }
        let rto = self.timing.rto;
        let due: Vec<IpAddr> = self
            .permissions
            .iter()
            .filter(|(_, p)| !p.done)
            .filter(|(_, p)| {
                p.last_sent
                    .map(|t| now.saturating_duration_since(t) >= rto)
                    .unwrap_or(true)
            })
            .map(|(ip, _)| *ip)
            .collect();
        for ip in due {
            self.send_permission(now, ip);
        }
    }

    /// Ask the server to let traffic from `peer` through. Repeated calls are no-ops.
    pub fn create_permission(&mut self, now: Instant, peer: IpAddr) {
        if self.stopped || self.permissions.contains_key(&peer) {
            return;
        }
        self.permissions.insert(peer, Permission::default());
        if self.relayed.is_some() {
            self.send_permission(now, peer);
        }
    }

    /// Wrap `data` in a Send indication towards `peer`.
    ///
    /// Returns `false` and drops the data when there is no permission for the peer,
    /// or when it is larger than [`MAX_SEND_DATA`].
    pub fn send(&mut self, peer: SocketAddr, data: &[u8]) -> bool {
        if self.relayed.is_none() || !self.has_permission(peer.ip()) {
            warn!("TURN send to {} without permission, dropped", Pii(peer));
            return false;
        }
        if data.len() > MAX_SEND_DATA {
            warn!(
                "TURN send to {} of {} bytes exceeds {}, dropped",
                Pii(peer),
                data.len(),
                MAX_SEND_DATA
            );
            return false;
        }
        let trans_id = self.tracker.unrecorded_id();
        let buf = StunMessageBuilder::new(StunMethod::Send, StunClass::Indication, trans_id)
            .peer_address(peer)
            .data(data)
            .build()
            .to_vec(None);
        self.transmit(buf);
        true
    }

    /// Release the allocation. Nothing waits for the server to confirm.
    pub fn stop(&mut self, now: Instant) {
        if self.stopped {
            return;
        }
        if self.relayed.is_some() {
            info!("TURN release allocation on {}", Pii(self.server));
            self.send_refresh(now, 0);
        }
        self.stopped = true;
        self.relayed = None;
    }

    /// Handle a message from the server. Returns `false` if it is not ours.
    pub fn recv(&mut self, now: Instant, msg: &StunMessage) -> bool {
        if msg.method() == StunMethod::Data && msg.class() == StunClass::Indication {
            self.on_data(msg);
            return true;
        }

        let hash = msg.trans_id().hash();
        let Some(tag) = self.tracker.tag(hash) else {
            return false;
        };

        if self.stopped {
            self.tracker.remove_transaction(now, hash);
            let late_allocation = tag == TurnTag::Allocate
                && msg.class() == StunClass::Success
                && self.key().map(|k| msg.check_integrity(&k)).unwrap_or(false);
            if late_allocation {
                info!("TURN release allocation granted after stop on {}", Pii(self.server));
                self.send_refresh(now, 0);
            }
            return true;
        }

        match msg.class() {
            StunClass::Success => {
                let valid = self
                    .key()
                    .map(|key| msg.check_integrity(&key))
                    .unwrap_or(false);
                if !valid {
                    warn!("TURN response with bad integrity from {}", Pii(self.server));
                    return true;
                }
                self.tracker.remove_transaction(now, hash);
                self.on_success(now, tag, msg);
            }
            StunClass::Failure => {
                self.tracker.remove_transaction(now, hash);
                self.on_failure(tag, msg);
            }
            _ => {
                warn!("Unexpected TURN {:?} from {}", msg.class(), Pii(self.server));
            }
        }

        true
    }

    fn on_success(&mut self, now: Instant, tag: TurnTag, msg: &StunMessage) {
        match tag {
            TurnTag::Allocate => {
                let Some(relayed) = msg.relayed_address() else {
                    warn!("TURN allocation without XOR-RELAYED-ADDRESS");
                    return;
                };
                self.lifetime = msg.lifetime().unwrap_or(DEFAULT_LIFETIME);
                info!(
                    "TURN allocation {} via {} lifetime {}",
                    Pii(relayed),
                    Pii(self.server),
                    self.lifetime
                );
                self.relayed = Some(relayed);
                self.next_request = Some(now + self.refresh_interval());
                self.events.push_back(TurnEvent::Relayed(Candidate::local(
                    CandidateKind::Relayed,
                    relayed,
                    self.relay_socket,
                )));
                self.resend_permissions(now);
            }
            TurnTag::Refresh => {
                self.lifetime = msg.lifetime().unwrap_or(self.lifetime);
                debug!("TURN refreshed, lifetime {}", self.lifetime);
                self.next_request = Some(now + self.refresh_interval());
                self.resend_permissions(now);
            }
            TurnTag::Permission(ip) => {
                if let Some(p) = self.permissions.get_mut(&ip) {
                    if !p.done {
                        debug!("TURN permission for {} granted", Pii(ip));
                    }
                    p.done = true;
                }
            }
        }
    }

    fn resend_permissions(&mut self, now: Instant) {
        let ips: Vec<IpAddr> = self.permissions.keys().copied().collect();
        for ip in ips {
            self.send_permission(now, ip);
        }
    }

    fn on_failure(&mut self, tag: TurnTag, msg: &StunMessage) {
        let code = msg.error_code().map(|(c, _)| c);

        match code {
            Some(401) => {
                let first_challenge = self.realm.is_none();
                self.realm = msg.realm().map(|s| s.to_string());
                self.nonce = msg.nonce().map(|s| s.to_string());
                if self.realm.is_none() || self.nonce.is_none() {
                    warn!("TURN 401 without REALM/NONCE from {}", Pii(self.server));
                    return;
                }
                if tag == TurnTag::Allocate && first_challenge {
                    debug!("TURN challenged, realm {:?}", self.realm);
                    self.next_request = None;
                } else if tag != TurnTag::Allocate {
                    warn!("TURN authentication lost, allocating again");
                    self.reset();
                } else {
                    warn!("TURN allocation rejected credentials on {}", Pii(self.server));
                }
            }
            Some(438) => {
                let Some(nonce) = msg.nonce() else {
                    warn!("TURN 438 without NONCE from {}", Pii(self.server));
                    return;
                };
                debug!("TURN stale nonce, retrying {:?}", tag);
                self.nonce = Some(nonce.to_string());
                match tag {
                    TurnTag::Allocate | TurnTag::Refresh => self.next_request = None,
                    TurnTag::Permission(ip) => {
                        if let Some(p) = self.permissions.get_mut(&ip) {
                            p.last_sent = None;
                        }
                    }
                }
            }
            _ => match tag {
                TurnTag::Allocate => {
                    warn!("TURN allocation failed {:?} on {}", msg.error_code(), Pii(self.server));
                }
                TurnTag::Refresh => {
                    warn!("TURN refresh failed {:?}, allocating again", msg.error_code());
                    self.reset();
                }
                TurnTag::Permission(ip) => {
                    warn!("TURN permission for {} failed {:?}", Pii(ip), msg.error_code());
                }
            },
        }
    }

    /// Forget the allocation and start over from an Allocate.
    fn reset(&mut self) {
        self.relayed = None;
        self.next_request = None;
        for p in self.permissions.values_mut() {
            p.done = false;
            p.last_sent = None;
        }
    }

    fn on_data(&mut self, msg: &StunMessage) {
        let (Some(peer), Some(data)) = (msg.peer_address(), msg.data()) else {
            warn!("TURN Data indication without peer or data from {}", Pii(self.server));
            return;
        };
        trace!("TURN data from {} len {}", Pii(peer), data.len());
        self.events.push_back(TurnEvent::Data {
            peer,
            contents: data.to_vec(),
        });
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<TurnEvent> {
        self.events.pop_front()
    }

    pub fn poll_timeout(&self, now: Instant) -> Option<Instant> {
        if self.stopped {
            return None;
        }
        let slot = self.next_request.unwrap_or(now);
        let rto = self.timing.rto;
        let perms = self
            .permissions
            .values()
            .filter(|p| !p.done && self.relayed.is_some())
            .map(|p| p.last_sent.map(|t| t + rto).unwrap_or(now))
            .min();
        Some(perms.map(|p| p.min(slot)).unwrap_or(slot))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const REALM: &str = "example.org";
    const NONCE: &str = "abcdef";

    fn server() -> SocketAddr {
        "198.51.100.9:3478".parse().unwrap()
    }

    fn client() -> TurnClient {
        TurnClient::new(
            server(),
            0,
            1,
            TurnCredentials::new("user", "secret"),
            Timing::default(),
            fastrand::Rng::with_seed(11),
        )
    }

    fn key() -> [u8; 16] {
        long_term_key("user", REALM, "secret")
    }

    fn challenge(req: &StunMessage, nonce: &str) -> Vec<u8> {
        StunMessageBuilder::new(req.method(), StunClass::Failure, req.trans_id())
            .error_code(401, "Unauthorized")
            .realm(REALM)
            .nonce(nonce)
            .build()
            .to_vec(None)
    }

    fn error(req: &StunMessage, code: u16, nonce: &str) -> Vec<u8> {
        StunMessageBuilder::new(req.method(), StunClass::Failure, req.trans_id())
            .error_code(code, "Error")
            .realm(REALM)
            .nonce(nonce)
            .build()
            .to_vec(None)
    }

    fn allocated(req: &StunMessage, relayed: SocketAddr, lifetime: u32) -> Vec<u8> {
        StunMessageBuilder::new(StunMethod::Allocate, StunClass::Success, req.trans_id())
            .relayed_address(relayed)
            .mapped_address("203.0.113.1:1000".parse().unwrap())
            .lifetime(lifetime)
            .build()
            .to_vec(Some(&key()[..]))
    }

    fn ok(req: &StunMessage) -> Vec<u8> {
        StunMessageBuilder::new(req.method(), StunClass::Success, req.trans_id())
            .lifetime(DEFAULT_LIFETIME)
            .build()
            .to_vec(Some(&key()[..]))
    }

    fn next(c: &mut TurnClient) -> Vec<u8> {
        c.poll_transmit().unwrap().contents.into()
    }

    /// Run the client through challenge and allocation.
    fn allocate(c: &mut TurnClient, now: Instant) -> SocketAddr {
        let relayed: SocketAddr = "198.51.100.9:50000".parse().unwrap();

        c.process(now);
        let buf = next(c);
        let req = StunMessage::parse(&buf).unwrap();
        assert_eq!(req.method(), StunMethod::Allocate);
        assert_eq!(req.requested_transport(), Some(TRANSPORT_UDP));
        assert!(!req.has_integrity());
        assert!(c.recv(now, &StunMessage::parse(&challenge(&req, NONCE)).unwrap()));

        c.process(now);
        let buf = next(c);
        let req = StunMessage::parse(&buf).unwrap();
        assert_eq!(req.username(), Some("user"));
        assert_eq!(req.realm(), Some(REALM));
        assert!(req.check_integrity(&key()));
        assert!(c.recv(now, &StunMessage::parse(&allocated(&req, relayed, 600)).unwrap()));

        relayed
    }

    #[test]
    fn challenge_then_allocate() {
        let now = Instant::now();
        let mut c = client();
        let relayed = allocate(&mut c, now);

        assert_eq!(c.relayed(), Some(relayed));
        match c.poll_event() {
            Some(TurnEvent::Relayed(cand)) => {
                assert_eq!(cand.kind(), CandidateKind::Relayed);
                assert_eq!(cand.addr(), relayed);
                assert_eq!(cand.socket_idx(), Some(1));
            }
            e => panic!("unexpected {e:?}"),
        }
        assert_eq!(c.poll_timeout(now), Some(now + Duration::from_secs(60)));
    }

    #[test]
    fn refresh_resends_permissions() {
        let now = Instant::now();
        let mut c = client();
        allocate(&mut c, now);
        let peer: IpAddr = "192.0.2.5".parse().unwrap();

        c.create_permission(now, peer);
        c.create_permission(now, peer);
        let buf = next(&mut c);
        assert!(c.poll_transmit().is_none());
        let req = StunMessage::parse(&buf).unwrap();
        assert_eq!(req.method(), StunMethod::CreatePermission);
        assert_eq!(req.peer_address().map(|a| a.ip()), Some(peer));
        assert!(!c.has_permission(peer));
        c.recv(now, &StunMessage::parse(&ok(&req)).unwrap());
        assert!(c.has_permission(peer));

        let later = now + Duration::from_secs(60);
        c.process(later);
        let buf = next(&mut c);
        let req = StunMessage::parse(&buf).unwrap();
        assert_eq!(req.method(), StunMethod::Refresh);
        c.recv(later, &StunMessage::parse(&ok(&req)).unwrap());

        let buf = next(&mut c);
        let req = StunMessage::parse(&buf).unwrap();
        assert_eq!(req.method(), StunMethod::CreatePermission);
    }

    #[test]
    fn pending_permissions_sent_in_address_order() {
        let now = Instant::now();
        let mut c = client();
        let peers: [IpAddr; 3] = [
            "192.0.2.30".parse().unwrap(),
            "192.0.2.4".parse().unwrap(),
            "192.0.2.17".parse().unwrap(),
        ];
        for ip in peers {
            c.create_permission(now, ip);
        }
        allocate(&mut c, now);

        let mut sent = vec![];
        while let Some(t) = c.poll_transmit() {
            let buf: Vec<u8> = t.contents.into();
            let req = StunMessage::parse(&buf).unwrap();
            assert_eq!(req.method(), StunMethod::CreatePermission);
            sent.push(req.peer_address().unwrap().ip());
        }
        let mut expected = peers.to_vec();
        expected.sort();
        assert_eq!(sent, expected);
    }

    #[test]
    fn send_requires_permission() {
        let now = Instant::now();
        let mut c = client();
        allocate(&mut c, now);
        let peer: SocketAddr = "192.0.2.5:4000".parse().unwrap();

        assert!(!c.send(peer, b"hello"));
        assert!(c.poll_transmit().is_none());

        c.create_permission(now, peer.ip());
        let buf = next(&mut c);
        let req = StunMessage::parse(&buf).unwrap();
        c.recv(now, &StunMessage::parse(&ok(&req)).unwrap());

        assert!(c.send(peer, b"hello"));
        let buf = next(&mut c);
        let ind = StunMessage::parse(&buf).unwrap();
        assert_eq!(ind.method(), StunMethod::Send);
        assert_eq!(ind.class(), StunClass::Indication);
        assert_eq!(ind.peer_address(), Some(peer));
        assert_eq!(ind.data(), Some(&b"hello"[..]));
    }

    #[test]
    fn data_indication_is_unwrapped() {
        let mut c = client();
        let peer: SocketAddr = "192.0.2.5:4000".parse().unwrap();
        let payload = vec![7_u8; 301];
        let trans_id = crate::io::TransId::new(&mut fastrand::Rng::with_seed(2));
        let buf = StunMessageBuilder::new(StunMethod::Data, StunClass::Indication, trans_id)
            .peer_address(peer)
            .data(&payload)
            .build()
            .to_vec(None);

        assert!(c.recv(Instant::now(), &StunMessage::parse(&buf).unwrap()));
        assert_eq!(
            c.poll_event(),
            Some(TurnEvent::Data {
                peer,
                contents: payload
            })
        );
    }

    #[test]
    fn stale_nonce_retries() {
        let now = Instant::now();
        let mut c = client();
        allocate(&mut c, now);
        c.poll_event();

        let later = now + Duration::from_secs(60);
        c.process(later);
        let buf = next(&mut c);
        let req = StunMessage::parse(&buf).unwrap();
        c.recv(later, &StunMessage::parse(&error(&req, 438, "fresh")).unwrap());

        c.process(later);
        let buf = next(&mut c);
        let req = StunMessage::parse(&buf).unwrap();
        assert_eq!(req.method(), StunMethod::Refresh);
        assert_eq!(req.nonce(), Some("fresh"));
        assert!(c.relayed().is_some());
    }

    #[test]
    fn refresh_failure_allocates_again() {
        let now = Instant::now();
        let mut c = client();
        allocate(&mut c, now);

        let later = now + Duration::from_secs(60);
        c.process(later);
        let buf = next(&mut c);
        let req = StunMessage::parse(&buf).unwrap();
        c.recv(later, &StunMessage::parse(&error(&req, 437, NONCE)).unwrap());
        assert_eq!(c.relayed(), None);

        c.process(later);
        let buf = next(&mut c);
        let req = StunMessage::parse(&buf).unwrap();
        assert_eq!(req.method(), StunMethod::Allocate);
        assert!(req.check_integrity(&key()));
    }

    #[test]
    fn stop_releases_once() {
        let now = Instant::now();
        let mut c = client();
        allocate(&mut c, now);

        c.stop(now);
        let buf = next(&mut c);
        let req = StunMessage::parse(&buf).unwrap();
        assert_eq!(req.method(), StunMethod::Refresh);
        assert_eq!(req.lifetime(), Some(0));

        c.stop(now);
        c.process(now + Duration::from_secs(120));
        assert!(c.poll_transmit().is_none());
        assert_eq!(c.poll_timeout(now), None);
    }

    #[test]
    fn allocation_granted_after_stop_is_released() {
        let now = Instant::now();
        let mut c = client();

        c.process(now);
        let buf = next(&mut c);
        let req = StunMessage::parse(&buf).unwrap();
        assert!(c.recv(now, &StunMessage::parse(&challenge(&req, NONCE)).unwrap()));
        c.process(now);
        let buf = next(&mut c);
        let req = StunMessage::parse(&buf).unwrap();

        // Stopped while the authenticated Allocate is in flight, nothing to release yet.
        c.stop(now);
        assert!(c.poll_transmit().is_none());

        let relayed: SocketAddr = "198.51.100.9:50000".parse().unwrap();
        let resp = allocated(&req, relayed, 600);
        assert!(c.recv(now, &StunMessage::parse(&resp).unwrap()));

        let buf = next(&mut c);
        let release = StunMessage::parse(&buf).unwrap();
        assert_eq!(release.method(), StunMethod::Refresh);
        assert_eq!(release.lifetime(), Some(0));
        assert!(release.check_integrity(&key()));

        assert!(c.poll_event().is_none());
        assert_eq!(c.relayed(), None);
        assert!(c.poll_transmit().is_none());
    }

    #[test]
    fn oversized_send_is_dropped() {
        let now = Instant::now();
        let mut c = client();
        allocate(&mut c, now);
        let peer: SocketAddr = "[2001:db8::7]:4000".parse().unwrap();
        c.create_permission(now, peer.ip());
        let buf = next(&mut c);
        let req = StunMessage::parse(&buf).unwrap();
        assert!(c.recv(now, &StunMessage::parse(&ok(&req)).unwrap()));

        assert!(!c.send(peer, &vec![0x17; MAX_SEND_DATA + 1]));
        assert!(c.poll_transmit().is_none());

        // The largest allowed payload still encodes with a consistent length.
        assert!(c.send(peer, &vec![0x17; MAX_SEND_DATA]));
        let buf = next(&mut c);
        let ind = StunMessage::parse(&buf).unwrap();
        assert_eq!(ind.peer_address(), Some(peer));
        assert_eq!(ind.data().map(|d| d.len()), Some(MAX_SEND_DATA));
    }

    #[test]
    fn unanswered_allocate_retransmits_at_rto() {
        let now = Instant::now();
        let mut c = client();
        c.process(now);
        next(&mut c);
        c.process(now + Duration::from_millis(200));
        assert!(c.poll_transmit().is_none());
        c.process(now + Duration::from_millis(500));
        assert!(c.poll_transmit().is_some());
    }
}
