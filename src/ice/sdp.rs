//! Reader for the `a=candidate` attribute, the one piece of SDP ICE needs.

use std::net::{IpAddr, SocketAddr};

use combine::error::*;
use combine::parser::char::*;
use combine::stream::StreamErrorFor;
use combine::*;
use combine::{ParseError, Parser, Stream};

use super::CandidateKind;
use crate::IceError;

/// The fields of a candidate line, before validation.
#[derive(Debug)]
pub(crate) struct ParsedCandidate {
    pub foundation: String,
    pub component: u32,
    pub transport: String,
    pub priority: u32,
    pub addr: SocketAddr,
    pub kind: CandidateKind,
}

pub(crate) fn parse_candidate(s: &str) -> Result<ParsedCandidate, IceError> {
    candidate()
        .parse(s.trim_end())
        .map(|(c, _)| c)
        .map_err(|e| IceError::BadCandidate(format!("{s:?}: {e}")))
}

/// Parser for a candidate, with optional `a=` and `candidate:` prefixes.
fn candidate<Input>() -> impl Parser<Input, Output = ParsedCandidate>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    // Reference: https://datatracker.ietf.org/doc/html/rfc8839#section-5.1
    let number = |what: &'static str| {
        not_sp::<Input>().and_then(move |s| {
            s.parse::<u32>().map_err(|e| {
                StreamErrorFor::<Input>::message_format(format!("invalid {what}: {e}"))
            })
        })
    };

    let port = not_sp::<Input>().and_then(|s| {
        s.parse::<u16>()
            .map_err(StreamErrorFor::<Input>::message_format)
    });

    let ip_addr = not_sp::<Input>().and_then(|s| {
        s.parse::<IpAddr>()
            .map_err(StreamErrorFor::<Input>::message_format)
    });

    (
        optional(attempt(string("a="))),
        optional(attempt(string("candidate:"))),
        not_sp(),
        token(' '),
        number("component"),
        token(' '),
        not_sp(),
        token(' '),
        number("priority"),
        token(' '),
        ip_addr,
        token(' '),
        port,
        string(" typ "),
        not_sp(),
        // raddr/rport, generation, ufrag, network-cost and friends.
        skip_many(any()),
    )
        .map(|p| ParsedCandidate {
            foundation: p.2,
            component: p.4,
            transport: p.6,
            priority: p.8,
            addr: SocketAddr::new(p.10, p.12),
            kind: CandidateKind::from_type_str(&p.14),
        })
}

fn not_sp<Input>() -> impl Parser<Input, Output = String>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1(satisfy(|c| c != ' ' && c != '\r' && c != '\n'))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_plain_body() {
        let c = parse_candidate("3684617590 1 udp 2122260223 10.217.229.219 50028 typ host")
            .unwrap();
        assert_eq!(c.foundation, "3684617590");
        assert_eq!(c.component, 1);
        assert_eq!(c.transport, "udp");
        assert_eq!(c.priority, 2_122_260_223);
        assert_eq!(c.addr, "10.217.229.219:50028".parse().unwrap());
        assert_eq!(c.kind, CandidateKind::Host);
    }

    #[test]
    fn parse_with_prefix_and_extensions() {
        let a = "a=candidate:1 1 UDP 1845494015 198.51.100.100 11100 typ srflx \
                 raddr 203.0.113.100 rport 10100 generation 0 ufrag abc\r\n";
        let c = parse_candidate(a).unwrap();
        assert_eq!(c.kind, CandidateKind::ServerReflexive);
        assert_eq!(c.addr, "198.51.100.100:11100".parse().unwrap());
        assert_eq!(c.transport, "UDP");
    }

    #[test]
    fn parse_ipv6() {
        let c = parse_candidate("candidate:9 1 udp 16777215 2001:db8::7 3478 typ relay").unwrap();
        assert_eq!(c.kind, CandidateKind::Relayed);
        assert_eq!(c.addr, "[2001:db8::7]:3478".parse().unwrap());
    }

    #[test]
    fn unknown_type_is_relayed() {
        let c = parse_candidate("1 1 udp 5 1.2.3.4 9 typ weird").unwrap();
        assert_eq!(c.kind, CandidateKind::Relayed);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_candidate("").is_err());
        assert!(parse_candidate("1 1 udp notanumber 1.2.3.4 9 typ host").is_err());
        assert!(parse_candidate("1 1 udp 5 1.2.3.4 99999 typ host").is_err());
    }
}
