use std::net::SocketAddr;
use std::time::Duration;

use crate::ice::{IceCreds, NominatingStrategy, Role};
use crate::turn_client::TurnCredentials;
use crate::{Agent, IceError};

/// Pacing interval, at most one scheduling pass per `Ta`.
pub const TA_DEFAULT: Duration = Duration::from_millis(50);

/// Retransmission timeout for every outstanding request.
pub const RTO_DEFAULT: Duration = Duration::from_millis(500);

/// Connectivity check attempts before a pair fails.
pub const MAX_CHECK_ATTEMPTS: u32 = 8;

/// Binding keepalive towards a STUN server once the reflexive address is known.
pub const STUN_SERVER_KEEPALIVE_PERIOD: Duration = Duration::from_secs(15);

/// How long an unanswered transaction id is remembered.
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timing knobs for checks and retransmissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Pacing interval of the check list.
    pub ta: Duration,
    /// Retransmission timeout.
    pub rto: Duration,
    /// Attempts before a pair is failed.
    pub max_attempts: u32,
    /// STUN server keepalive period.
    pub stun_keepalive: Duration,
    /// Transaction id memory.
    pub transaction_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            ta: TA_DEFAULT,
            rto: RTO_DEFAULT,
            max_attempts: MAX_CHECK_ATTEMPTS,
            stun_keepalive: STUN_SERVER_KEEPALIVE_PERIOD,
            transaction_timeout: TRANSACTION_TIMEOUT,
        }
    }
}

/// Customized config for creating an [`Agent`] instance.
///
/// ```
/// use icelink::AgentConfig;
///
/// let agent = AgentConfig::new()
///     .set_controlling(true)
///     .add_local_interface("192.168.1.10:5000".parse().unwrap())
///     .add_stun_server("203.0.113.1:3478".parse().unwrap())
///     .build()
///     .unwrap();
/// ```
///
/// Configs implement [`Clone`] to help create multiple `Agent` instances.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub(crate) role: Role,
    pub(crate) local_credentials: Option<IceCreds>,
    pub(crate) remote_credentials: Option<IceCreds>,
    pub(crate) local_interfaces: Vec<SocketAddr>,
    pub(crate) stun_servers: Vec<SocketAddr>,
    pub(crate) turn_servers: Vec<(SocketAddr, TurnCredentials)>,
    pub(crate) nominating_strategy: NominatingStrategy,
    pub(crate) rng_seed: Option<u64>,
    pub(crate) timing: Timing,
}

impl AgentConfig {
    /// Creates a new default config.
    pub fn new() -> Self {
        AgentConfig::default()
    }

    /// The configured role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Set the role, it can't change once the agent is built.
    pub fn set_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Shorthand for [`AgentConfig::set_role`].
    pub fn set_controlling(self, controlling: bool) -> Self {
        self.set_role(if controlling {
            Role::Controlling
        } else {
            Role::Controlled
        })
    }

    /// Get the local ICE credentials, if set.
    ///
    /// If not specified, local credentials will be randomly generated when
    /// building the [`Agent`] instance.
    pub fn local_credentials(&self) -> Option<&IceCreds> {
        self.local_credentials.as_ref()
    }

    /// Explicitly sets local ICE credentials.
    pub fn set_local_credentials(mut self, creds: IceCreds) -> Self {
        self.local_credentials = Some(creds);
        self
    }

    /// Remote credentials known up front. They can also arrive later with
    /// [`Agent::set_remote_credentials`].
    pub fn set_remote_credentials(mut self, creds: IceCreds) -> Self {
        self.remote_credentials = Some(creds);
        self
    }

    /// The local interfaces in preference order. The position is the socket index.
    pub fn local_interfaces(&self) -> &[SocketAddr] {
        &self.local_interfaces
    }

    /// Add a local interface. Earlier interfaces are preferred.
    pub fn add_local_interface(mut self, addr: SocketAddr) -> Self {
        self.local_interfaces.push(addr);
        self
    }

    /// Add a STUN server for server reflexive discovery.
    pub fn add_stun_server(mut self, addr: SocketAddr) -> Self {
        self.stun_servers.push(addr);
        self
    }

    /// Add a TURN server with its long-term credentials.
    pub fn add_turn_server(mut self, addr: SocketAddr, creds: TurnCredentials) -> Self {
        self.turn_servers.push((addr, creds));
        self
    }

    /// Set the nominating strategy, only used when controlling.
    ///
    /// Defaults to [`NominatingStrategy::BestValid`].
    pub fn set_nominating_strategy(mut self, strategy: NominatingStrategy) -> Self {
        self.nominating_strategy = strategy;
        self
    }

    /// Seed the random sources, transaction ids, generated credentials and the
    /// tie breaker, for reproducible runs.
    pub fn set_rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// The timing knobs.
    pub fn timing(&self) -> Timing {
        self.timing
    }

    /// Override the timing knobs.
    pub fn set_timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), IceError> {
        if self.local_interfaces.is_empty() {
            return Err(IceError::Config("no local interfaces".into()));
        }
        let t = &self.timing;
        if t.ta.is_zero() || t.rto.is_zero() || t.max_attempts == 0 {
            return Err(IceError::Config(format!("unusable timing {t:?}")));
        }
        for (addr, creds) in &self.turn_servers {
            if creds.username.is_empty() {
                return Err(IceError::Config(format!("TURN server {addr} without username")));
            }
        }
        let servers = self
            .stun_servers
            .iter()
            .chain(self.turn_servers.iter().map(|(a, _)| a));
        for addr in servers {
            let reachable = self
                .local_interfaces
                .iter()
                .any(|i| i.is_ipv4() == addr.is_ipv4());
            if !reachable {
                return Err(IceError::Config(format!(
                    "server {addr} has no interface of the same IP family"
                )));
            }
        }
        Ok(())
    }

    /// Create a [`Agent`] instance using this config.
    pub fn build(self) -> Result<Agent, IceError> {
        Agent::new_from_config(self)
    }
}
