use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use crate::config::AgentConfig;
use crate::ice::{CandidatePair, CheckList, CheckListEvent, CheckListStats};
use crate::ice::{Candidate, IceCreds, State};
use crate::io::{is_stun, StunMessage, Transmit};
use crate::stun_client::StunClient;
use crate::turn_client::{TurnClient, TurnEvent};
use crate::util::{Pii, Soonest};
use crate::IceError;

/// Events produced by [`Agent::poll_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A local candidate to send to the remote peer, as an `a=candidate` value.
    LocalCandidate(String),

    /// The connectivity state changed.
    StateChange(State),

    /// A datagram that is not ICE traffic, possibly unwrapped from a TURN relay.
    Data {
        /// The socket it arrived on. Relayed sockets count after the interfaces.
        socket: usize,
        /// Who sent it.
        source: SocketAddr,
        /// Unchanged payload.
        contents: Vec<u8>,
    },
}

/// ICE agent for one media stream.
///
/// Owns the check list plus a STUN and TURN client per configured server and
/// local interface. It is sans-IO: the caller feeds received datagrams to
/// [`Agent::recv`], calls [`Agent::process`] when [`Agent::poll_timeout`]
/// says so, and sends whatever [`Agent::poll_transmit`] returns.
///
/// ```
/// # use std::time::Instant;
/// use icelink::{Agent, AgentEvent};
///
/// let now = Instant::now();
/// let mut agent = Agent::builder()
///     .set_controlling(true)
///     .add_local_interface("192.168.1.10:5000".parse().unwrap())
///     .build()
///     .unwrap();
///
/// agent.start(now);
///
/// while let Some(event) = agent.poll_event() {
///     if let AgentEvent::LocalCandidate(c) = event {
///         // Send to the remote peer over signaling.
///         println!("a=candidate:{c}");
///     }
/// }
/// ```
pub struct Agent {
    interfaces: Vec<SocketAddr>,
    stun_servers: Vec<SocketAddr>,

    check_list: CheckList,
    stun_clients: Vec<StunClient>,
    turn_clients: Vec<TurnClient>,

    started: bool,
    stopped: bool,

    /// The latest time passed in by the caller.
    last_now: Option<Instant>,

    transmits: VecDeque<Transmit>,
    events: VecDeque<AgentEvent>,
}

impl Agent {
    /// Start configuring an agent.
    pub fn builder() -> AgentConfig {
        AgentConfig::new()
    }

    pub(crate) fn new_from_config(config: AgentConfig) -> Result<Agent, IceError> {
        config.validate()?;

        let mut rng = match config.rng_seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };

        let local_credentials = config
            .local_credentials
            .unwrap_or_else(|| IceCreds::with_rng(&mut rng));

        let mut check_list = CheckList::new(
            config.role,
            local_credentials,
            config.nominating_strategy,
            config.timing,
            rng.fork(),
        );
        if let Some(creds) = config.remote_credentials {
            check_list.set_remote_credentials(creds);
        }

        let interfaces = config.local_interfaces;

        let mut stun_clients = vec![];
        for server in &config.stun_servers {
            for (socket, iface) in interfaces.iter().enumerate() {
                if iface.is_ipv4() != server.is_ipv4() {
                    continue;
                }
                stun_clients.push(StunClient::new(*server, socket, config.timing, rng.fork()));
            }
        }

        let mut turn_clients = vec![];
        for (server, creds) in &config.turn_servers {
            for (socket, iface) in interfaces.iter().enumerate() {
                if iface.is_ipv4() != server.is_ipv4() {
                    continue;
                }
                let relay_socket = interfaces.len() + turn_clients.len();
                turn_clients.push(TurnClient::new(
                    *server,
                    socket,
                    relay_socket,
                    creds.clone(),
                    config.timing,
                    rng.fork(),
                ));
            }
        }

        debug!(
            "New agent {:?} interfaces {} stun clients {} turn clients {}",
            config.role,
            interfaces.len(),
            stun_clients.len(),
            turn_clients.len()
        );

        Ok(Agent {
            interfaces,
            stun_servers: config.stun_servers,
            check_list,
            stun_clients,
            turn_clients,
            started: false,
            stopped: false,
            last_now: None,
            transmits: VecDeque::new(),
            events: VecDeque::new(),
        })
    }

    /// Our credentials, to be signaled to the remote peer.
    pub fn local_credentials(&self) -> &IceCreds {
        self.check_list.local_credentials()
    }

    /// Credentials of the remote peer, from signaling.
    pub fn set_remote_credentials(&mut self, creds: IceCreds) {
        self.check_list.set_remote_credentials(creds);
    }

    pub fn state(&self) -> State {
        self.check_list.state()
    }

    pub fn stats(&self) -> CheckListStats {
        self.check_list.stats()
    }

    /// The best pair that passed a connectivity check.
    ///
    /// Once the state is [`State::Completed`] this is the selected pair.
    pub fn best_candidate_pair(&self) -> Option<&CandidatePair> {
        self.check_list.best_candidate_pair()
    }

    pub fn local_candidates(&self) -> &[Candidate] {
        self.check_list.local_candidates()
    }

    pub fn remote_candidates(&self) -> &[Candidate] {
        self.check_list.remote_candidates()
    }

    /// The check list, for inspecting pairs.
    pub fn check_list(&self) -> &CheckList {
        &self.check_list
    }

    /// Gather host candidates and start discovery.
    pub fn start(&mut self, now: Instant) {
        if self.started {
            return;
        }
        info!("Start agent {:?}", self.check_list.role());
        self.started = true;
        self.last_now = Some(now);
        self.check_list
            .start(now, &self.interfaces, &self.stun_servers);
        self.collect(now);
    }

    /// Drive timers. Calls closer together than `Ta` are harmless.
    pub fn process(&mut self, now: Instant) {
        self.last_now = Some(now);
        if !self.started || self.stopped {
            return;
        }

        for c in &mut self.stun_clients {
            c.process(now);
        }
        for c in &mut self.turn_clients {
            c.process(now);
        }
        self.check_list.process(now);

        self.collect(now);
    }

    /// Handle a datagram received on a local interface.
    pub fn recv(&mut self, now: Instant, socket: usize, source: SocketAddr, buf: &[u8]) {
        self.last_now = Some(now);
        if self.stopped {
            return;
        }

        if !is_stun(buf) {
            self.events.push_back(AgentEvent::Data {
                socket,
                source,
                contents: buf.to_vec(),
            });
            return;
        }

        let msg = match StunMessage::parse(buf) {
            Ok(v) => v,
            Err(e) => {
                warn!("Drop STUN from {}: {}", Pii(source), e);
                return;
            }
        };

        let claimed = self
            .turn_clients
            .iter_mut()
            .filter(|c| c.socket() == socket && c.is_server_endpoint(source))
            .any(|c| c.recv(now, &msg))
            || self
                .stun_clients
                .iter_mut()
                .filter(|c| c.socket() == socket && c.is_server_endpoint(source))
                .any(|c| c.recv(now, &msg));

        if !claimed {
            self.check_list.recv(now, socket, source, buf);
        }

        self.collect(now);
    }

    /// Add a remote candidate from signaling, with or without the `a=candidate:` prefix.
    pub fn recv_remote_candidate(&mut self, s: &str) -> Result<(), IceError> {
        let c = Candidate::parse(s)?;
        self.check_list.add_remote_candidate(c);
        Ok(())
    }

    /// Send application data from `socket` to `destination`, typically the
    /// [`Agent::best_candidate_pair`]. Relayed sockets go through their TURN server.
    ///
    /// Returns `false` if the data was dropped.
    pub fn send(&mut self, socket: usize, destination: SocketAddr, data: &[u8]) -> bool {
        if self.stopped {
            return false;
        }
        let sent = self.route(Transmit {
            socket,
            destination,
            contents: data.to_vec().into(),
        });
        self.drain_turn_transmits();
        sent
    }

    /// Release TURN allocations and stop all activity.
    pub fn stop(&mut self, now: Instant) {
        if self.stopped {
            return;
        }
        info!("Stop agent");
        for c in &mut self.turn_clients {
            c.stop(now);
        }
        self.drain_turn_transmits();
        self.stopped = true;
    }

    /// Move outputs of the clients and check list to where they belong.
    fn collect(&mut self, now: Instant) {
        for c in &mut self.stun_clients {
            while let Some(t) = c.poll_transmit() {
                self.transmits.push_back(t);
            }
            while let Some(cand) = c.poll_candidate() {
                self.check_list.add_local_candidate(cand);
            }
        }

        for c in &mut self.turn_clients {
            while let Some(ev) = c.poll_event() {
                match ev {
                    TurnEvent::Relayed(cand) => {
                        self.check_list.add_local_candidate(cand);
                    }
                    TurnEvent::Data { peer, contents } => {
                        if is_stun(&contents) {
                            self.check_list.recv(now, c.relay_socket(), peer, &contents);
                        } else {
                            self.events.push_back(AgentEvent::Data {
                                socket: c.relay_socket(),
                                source: peer,
                                contents,
                            });
                        }
                    }
                }
            }
        }

        // Remote peers paired with a relayed candidate need a permission.
        let n = self.interfaces.len();
        for pair in self.check_list.pairs() {
            let Some(idx) = pair.socket_idx().checked_sub(n) else {
                continue;
            };
            if let Some(c) = self.turn_clients.get_mut(idx) {
                c.create_permission(now, pair.remote().addr().ip());
            }
        }

        while let Some(t) = self.check_list.poll_transmit() {
            self.route(t);
        }

        self.drain_turn_transmits();
        self.drain_check_list_events();
    }

    /// Queue a transmit, wrapping it for the TURN server on relayed sockets.
    fn route(&mut self, t: Transmit) -> bool {
        let n = self.interfaces.len();
        if t.socket < n {
            self.transmits.push_back(t);
            return true;
        }
        match self.turn_clients.get_mut(t.socket - n) {
            Some(c) => c.send(t.destination, &t.contents),
            None => {
                warn!("Transmit on unknown socket {}", t.socket);
                false
            }
        }
    }

    fn drain_turn_transmits(&mut self) {
        for c in &mut self.turn_clients {
            while let Some(t) = c.poll_transmit() {
                self.transmits.push_back(t);
            }
        }
    }

    fn drain_check_list_events(&mut self) {
        while let Some(e) = self.check_list.poll_event() {
            let e = match e {
                CheckListEvent::LocalCandidate(c) => {
                    AgentEvent::LocalCandidate(c.to_candidate_attribute_string())
                }
                CheckListEvent::StateChange(s) => AgentEvent::StateChange(s),
            };
            self.events.push_back(e);
        }
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<AgentEvent> {
        self.drain_check_list_events();
        self.events.pop_front()
    }

    /// When [`Agent::process`] should be called next.
    pub fn poll_timeout(&self) -> Option<Instant> {
        if !self.started || self.stopped {
            return None;
        }
        let now = self.last_now?;

        let mut timeout = self.check_list.poll_timeout();
        for c in &self.stun_clients {
            timeout = timeout.soonest(c.poll_timeout(now));
        }
        for c in &self.turn_clients {
            timeout = timeout.soonest(c.poll_timeout(now));
        }
        timeout
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::ice::{CandidateKind, Role};
    use crate::turn_client::TurnCredentials;

    fn agent(controlling: bool) -> Agent {
        Agent::builder()
            .set_controlling(controlling)
            .set_rng_seed(42)
            .add_local_interface("10.0.0.1:5000".parse().unwrap())
            .add_stun_server("198.51.100.1:3478".parse().unwrap())
            .add_turn_server(
                "198.51.100.2:3478".parse().unwrap(),
                TurnCredentials::new("user", "pass"),
            )
            .build()
            .unwrap()
    }

    fn events(a: &mut Agent) -> Vec<AgentEvent> {
        std::iter::from_fn(|| a.poll_event()).collect()
    }

    #[test]
    fn start_announces_host() {
        let now = Instant::now();
        let mut a = agent(true);
        assert_eq!(a.poll_timeout(), None);
        a.start(now);

        let ev = events(&mut a);
        match &ev[0] {
            AgentEvent::LocalCandidate(s) => {
                let c = Candidate::parse(s).unwrap();
                assert_eq!(c.kind(), CandidateKind::Host);
            }
            e => panic!("unexpected {e:?}"),
        }
        // Binding from the check list to the STUN server.
        assert!(a.poll_transmit().is_some());
        assert!(a.poll_timeout().is_some());
    }

    #[test]
    fn process_drives_clients() {
        let now = Instant::now();
        let mut a = agent(false);
        a.start(now);
        while a.poll_transmit().is_some() {}

        a.process(now);
        let dest: Vec<_> = std::iter::from_fn(|| a.poll_transmit())
            .map(|t| t.destination)
            .collect();
        assert!(dest.contains(&"198.51.100.1:3478".parse().unwrap()));
        assert!(dest.contains(&"198.51.100.2:3478".parse().unwrap()));
    }

    #[test]
    fn non_stun_is_data() {
        let now = Instant::now();
        let mut a = agent(true);
        a.start(now);
        events(&mut a);

        let source: SocketAddr = "192.0.2.1:4000".parse().unwrap();
        a.recv(now, 0, source, &[22, 254, 253, 0, 0]);
        assert_eq!(
            events(&mut a),
            vec![AgentEvent::Data {
                socket: 0,
                source,
                contents: vec![22, 254, 253, 0, 0]
            }]
        );
    }

    #[test]
    fn remote_candidate_errors() {
        let mut a = agent(true);
        assert!(a.recv_remote_candidate("garbage").is_err());
        assert!(a
            .recv_remote_candidate("candidate:1 1 udp 2130706431 192.0.2.1 4000 typ host")
            .is_ok());
        assert_eq!(a.remote_candidates().len(), 1);
    }

    #[test]
    fn seeded_agents_repeat() {
        let a = agent(true);
        let b = agent(true);
        assert_eq!(a.local_credentials(), b.local_credentials());
        assert_eq!(a.check_list().role(), Role::Controlling);
    }

    #[test]
    fn send_on_unknown_socket_is_dropped() {
        let mut a = agent(true);
        a.start(Instant::now());
        assert!(!a.send(7, "192.0.2.1:4000".parse().unwrap(), b"x"));
        assert!(a.send(0, "192.0.2.1:4000".parse().unwrap(), b"x"));
    }

    #[test]
    fn stop_silences() {
        let now = Instant::now();
        let mut a = agent(true);
        a.start(now);
        a.stop(now);
        while a.poll_transmit().is_some() {}
        a.process(now + Duration::from_secs(1));
        assert!(a.poll_transmit().is_none());
        assert_eq!(a.poll_timeout(), None);
    }
}
