use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use super::sdp::parse_candidate;
use crate::IceError;

/// The only component we ever negotiate. RTCP is always muxed.
pub(crate) const COMPONENT_ID: u32 = 1;

/// ICE candidates are network addresses used to connect to a peer.
///
/// Local candidates carry the index of the socket that produced them. Remote
/// candidates come from signaling and only know what the other side told us.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Candidate {
    /// Type of candidate.
    kind: CandidateKind,

    /// Priority.
    ///
    /// For local candidates it is calculated from the kind and socket index,
    /// for remote it is communicated.
    priority: u32,

    /// The address to use, host, server reflexive or relay.
    addr: SocketAddr,

    /// The local socket this candidate belongs to. `None` for remote candidates.
    socket_idx: Option<usize>,

    /// Groups similar candidates. Calculated locally, communicated for remote.
    foundation: String,
}

/// Type of candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CandidateKind {
    /// Local interface.
    Host,
    /// Discovered from a connectivity check.
    PeerReflexive,
    /// Discovered via a STUN server.
    ServerReflexive,
    /// Allocated on a TURN server.
    Relayed,
}

impl CandidateKind {
    /// The type preference term of the candidate priority.
    fn type_preference(&self) -> u32 {
        // RFC 8445 5.1.2.2 recommended values.
        match self {
            CandidateKind::Host => 126,
            CandidateKind::PeerReflexive => 110,
            CandidateKind::ServerReflexive => 100,
            CandidateKind::Relayed => 0,
        }
    }

    /// The `typ` value in a candidate attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::Relayed => "relay",
        }
    }

    /// Reverse of [`CandidateKind::as_str`].
    ///
    /// Unknown type strings are treated as [`CandidateKind::Relayed`], the least preferred kind.
    pub fn from_type_str(s: &str) -> CandidateKind {
        match s {
            "host" => CandidateKind::Host,
            "prflx" => CandidateKind::PeerReflexive,
            "srflx" => CandidateKind::ServerReflexive,
            _ => CandidateKind::Relayed,
        }
    }
}

/// Priority of a local candidate of the given kind on the given socket.
///
/// `type_pref << 24 | local_pref << 8 | (256 - component)` where the local preference
/// falls with the socket index, so earlier interfaces are preferred.
pub fn candidate_priority(kind: CandidateKind, socket_idx: usize) -> u32 {
    let local_preference = 65_535 - socket_idx.min(65_535) as u32;
    kind.type_preference() << 24 | local_preference << 8 | (256 - COMPONENT_ID)
}

impl Candidate {
    /// Creates a local candidate bound to a socket.
    pub fn local(kind: CandidateKind, addr: SocketAddr, socket_idx: usize) -> Self {
        Candidate {
            kind,
            priority: candidate_priority(kind, socket_idx),
            addr,
            socket_idx: Some(socket_idx),
            foundation: foundation(kind, addr.ip()),
        }
    }

    /// Creates a remote candidate with the priority the remote side chose.
    pub fn remote(kind: CandidateKind, addr: SocketAddr, priority: u32) -> Self {
        Candidate {
            kind,
            priority,
            addr,
            socket_idx: None,
            foundation: foundation(kind, addr.ip()),
        }
    }

    /// Parses a candidate attribute, with or without the `a=candidate:` prefix.
    ///
    /// The result is a remote candidate.
    pub fn parse(s: &str) -> Result<Candidate, IceError> {
        let parsed = parse_candidate(s)?;

        if parsed.component != COMPONENT_ID {
            return Err(IceError::BadCandidate(format!(
                "unsupported component {}",
                parsed.component
            )));
        }
        if !parsed.transport.eq_ignore_ascii_case("udp") {
            return Err(IceError::BadCandidate(format!(
                "unsupported transport {}",
                parsed.transport
            )));
        }
        if !is_valid_ip(parsed.addr.ip()) {
            return Err(IceError::BadCandidate(format!(
                "invalid ip {}",
                parsed.addr.ip()
            )));
        }

        Ok(Candidate {
            kind: parsed.kind,
            priority: parsed.priority,
            addr: parsed.addr,
            socket_idx: None,
            foundation: parsed.foundation,
        })
    }

    /// Kind of candidate.
    pub fn kind(&self) -> CandidateKind {
        self.kind
    }

    /// The candidate priority.
    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// The candidate address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The local socket, if this is a local candidate.
    pub fn socket_idx(&self) -> Option<usize> {
        self.socket_idx
    }

    /// The foundation.
    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    /// The `a=candidate` attribute body, without the attribute prefix.
    pub fn to_candidate_attribute_string(&self) -> String {
        format!(
            "{} {} udp {} {} {} typ {}",
            self.foundation,
            COMPONENT_ID,
            self.priority,
            self.addr.ip(),
            self.addr.port(),
            self.kind
        )
    }
}

fn foundation(kind: CandidateKind, ip: IpAddr) -> String {
    // Same type, same base IP and same transport (always UDP here)
    // gives the same foundation.
    let mut hasher = DefaultHasher::new();
    kind.hash(&mut hasher);
    ip.hash(&mut hasher);
    (hasher.finish() as u32).to_string()
}

fn is_valid_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v) => !v.is_broadcast() && !v.is_multicast() && !v.is_unspecified(),
        IpAddr::V6(v) => !v.is_multicast() && !v.is_unspecified(),
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_candidate_attribute_string())
    }
}

impl fmt::Display for CandidateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Serialize [Candidate] into candidate info.
///
/// `sdpMid` is always null and `sdpMLineIndex` 0, there is only one component.
///
/// e.g. serde_json would produce:
/// ```json
/// {
///  "candidate": "candidate:2130706431 1 udp 2130706175 1.2.3.4 1234 typ host",
///  "sdpMid": null,
///  "sdpMLineIndex": 0
/// }
/// ```
impl Serialize for Candidate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut o = serializer.serialize_struct("CandidateInfo", 3)?;
        o.serialize_field(
            "candidate",
            &format!("candidate:{}", self.to_candidate_attribute_string()),
        )?;
        o.serialize_field("sdpMid", &None::<()>)?;
        o.serialize_field("sdpMLineIndex", &0)?;
        o.end()
    }
}

/// Deserialize [Candidate] from a candidate info, as a remote candidate.
impl<'de> Deserialize<'de> for Candidate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct CandidateInfo {
            candidate: String,
        }

        let info = CandidateInfo::deserialize(deserializer)?;
        Candidate::parse(&info.candidate).map_err(serde::de::Error::custom)
    }
}
