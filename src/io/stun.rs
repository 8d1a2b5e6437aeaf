use std::fmt;
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};
use std::str;

use crc::{Crc, CRC_32_ISO_HDLC};
use md5::{Digest, Md5};

use super::{Sha1, StunError};

const MAGIC: &[u8] = &[0x21, 0x12, 0xA4, 0x42];
const FINGERPRINT_XOR: u32 = 0x5354_554e;

const MSG_HEADER_LEN: usize = 20;
const MSG_INTEGRITY_LEN: usize = 20;
const FPRINT_LEN: usize = 4;
const ATTR_TLV_LENGTH: usize = 4;

// Upper bound for REALM, NONCE, USERNAME and reason phrases.
const MAX_STR_LEN: usize = 763;

/// Protocol number for UDP in the REQUESTED-TRANSPORT attribute.
pub const TRANSPORT_UDP: u8 = 17;

/// Quick check whether a datagram looks like a STUN message.
///
/// Only the header is inspected, the message may still fail to [`StunMessage::parse`].
pub fn is_stun(buf: &[u8]) -> bool {
    buf.len() >= MSG_HEADER_LEN && buf[0] < 2 && &buf[4..8] == MAGIC
}

/// Long-term credential key, `MD5(username ":" realm ":" password)`.
pub fn long_term_key(username: &str, realm: &str, password: &str) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(username.as_bytes());
    hasher.update(b":");
    hasher.update(realm.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// The 96 bit STUN transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransId([u8; 12]);

impl TransId {
    /// Random transaction id drawn from the provided generator.
    pub fn new(rng: &mut fastrand::Rng) -> Self {
        let mut t = [0_u8; 12];
        rng.fill(&mut t);
        TransId(t)
    }

    /// Transaction id from raw bytes.
    pub fn from_bytes(t: [u8; 12]) -> Self {
        TransId(t)
    }

    fn from_slice(s: &[u8]) -> Self {
        let mut t = [0_u8; 12];
        t[..].copy_from_slice(s);
        TransId(t)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// 32 bit digest used to index outstanding transactions.
    pub fn hash(&self) -> u32 {
        let w = |i: usize| {
            u32::from_be_bytes([self.0[i], self.0[i + 1], self.0[i + 2], self.0[i + 3]])
        };
        w(0) ^ w(4).rotate_left(11) ^ w(8).rotate_left(22)
    }
}

/// STUN message class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Class {
    /// Request expecting a response.
    Request,
    /// Fire and forget.
    Indication,
    /// Success response.
    Success,
    /// Error response.
    Failure,
}

impl Class {
    fn from_typ(typ: u16) -> Self {
        use Class::*;
        match typ & 0b0000_0001_0001_0000 {
            0b0000_0000_0000_0000 => Request,
            0b0000_0000_0001_0000 => Indication,
            0b0000_0001_0000_0000 => Success,
            _ => Failure,
        }
    }

    fn to_u16(self) -> u16 {
        use Class::*;
        match self {
            Request => 0b0000_0000_0000_0000,
            Indication => 0b0000_0000_0001_0000,
            Success => 0b0000_0001_0000_0000,
            Failure => 0b0000_0001_0001_0000,
        }
    }
}

/// STUN and TURN methods understood by this crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// STUN binding, also used for ICE connectivity checks.
    Binding,
    /// TURN Allocate.
    Allocate,
    /// TURN Refresh.
    Refresh,
    /// TURN Send indication.
    Send,
    /// TURN Data indication.
    Data,
    /// TURN CreatePermission.
    CreatePermission,
}

impl Method {
    fn from_typ(typ: u16) -> Option<Self> {
        use Method::*;
        // |M11|M10|M9|M8|M7|C1|M6|M5|M4|C0|M3|M2|M1|M0|
        let m = (typ & 0x000f) | ((typ & 0x00e0) >> 1) | ((typ & 0x3e00) >> 2);
        Some(match m {
            0x001 => Binding,
            0x003 => Allocate,
            0x004 => Refresh,
            0x006 => Send,
            0x007 => Data,
            0x008 => CreatePermission,
            _ => return None,
        })
    }

    fn to_u16(self) -> u16 {
        use Method::*;
        let m: u16 = match self {
            Binding => 0x001,
            Allocate => 0x003,
            Refresh => 0x004,
            Send => 0x006,
            Data => 0x007,
            CreatePermission => 0x008,
        };
        (m & 0x000f) | ((m & 0x0070) << 1) | ((m & 0x0f80) << 2)
    }
}

/// Represents a STUN message as fit for our purposes.
///
/// STUN is a very flexible protocol. This implementation provides what ICE
/// connectivity checks, server reflexive discovery and TURN relaying need.
#[derive(Clone, Copy)]
pub struct StunMessage<'a> {
    method: Method,
    class: Class,
    trans_id: TransId,
    attrs: Attributes<'a>,
    integrity: &'a [u8],
    integrity_len: u16,
}

impl<'a> StunMessage<'a> {
    /// Parse a STUN message from a slice of bytes.
    ///
    /// A present FINGERPRINT is verified. MESSAGE-INTEGRITY is not, see
    /// [`StunMessage::check_integrity`].
    pub fn parse(buf: &'a [u8]) -> Result<StunMessage<'a>, StunError> {
        if buf.len() < MSG_HEADER_LEN {
            return Err(StunError::Parse("STUN packet too short".into()));
        }
        if buf[0] & 0b1100_0000 != 0 {
            return Err(StunError::Parse("top bits of STUN type not zero".into()));
        }
        let typ = (buf[0] as u16 & 0b0011_1111) << 8 | buf[1] as u16;
        let len = (buf[2] as u16) << 8 | buf[3] as u16;
        if len & 0b0000_0011 > 0 {
            return Err(StunError::Parse("len is not a multiple of 4".into()));
        }
        if len as usize != buf.len() - MSG_HEADER_LEN {
            return Err(StunError::Parse(
                "STUN length vs UDP packet mismatch".into(),
            ));
        }
        if &buf[4..8] != MAGIC {
            return Err(StunError::Parse("magic cookie mismatch".into()));
        }

        let class = Class::from_typ(typ);
        let method = Method::from_typ(typ)
            .ok_or_else(|| StunError::Parse(format!("unknown STUN method in 0x{typ:04x}")))?;
        let trans_id = TransId::from_slice(&buf[8..20]);

        let mut offsets = Offsets::default();
        let attrs = Attributes::parse(&buf[MSG_HEADER_LEN..], trans_id, &mut offsets)?;

        if let (Some(fp), Some(off)) = (attrs.fingerprint, offsets.fingerprint) {
            let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&buf[..MSG_HEADER_LEN + off])
                ^ FINGERPRINT_XOR;
            if crc != fp {
                return Err(StunError::Parse("STUN fingerprint mismatch".into()));
            }
        }

        // message-integrity only covers the length up until and including
        // the message-integrity attribute.
        let (integrity, integrity_len) = match offsets.integrity {
            Some(off) => (
                &buf[..MSG_HEADER_LEN + off],
                (off + ATTR_TLV_LENGTH + MSG_INTEGRITY_LEN) as u16,
            ),
            None => (&buf[..0], 0),
        };

        Ok(StunMessage {
            method,
            class,
            trans_id,
            attrs,
            integrity,
            integrity_len,
        })
    }

    /// The method of this message.
    pub fn method(&self) -> Method {
        self.method
    }

    /// The class of this message.
    pub fn class(&self) -> Class {
        self.class
    }

    /// The transaction ID of this STUN message.
    pub fn trans_id(&self) -> TransId {
        self.trans_id
    }

    /// Whether this STUN message is a BINDING request.
    pub fn is_binding_request(&self) -> bool {
        self.method == Method::Binding && self.class == Class::Request
    }

    /// Whether this STUN message is a response, successful or not.
    pub fn is_response(&self) -> bool {
        matches!(self.class, Class::Success | Class::Failure)
    }

    /// Whether this STUN message is a _successful_ BINDING response.
    pub fn is_successful_binding_response(&self) -> bool {
        self.method == Method::Binding && self.class == Class::Success
    }

    /// The USERNAME attribute.
    pub fn username(&self) -> Option<&'a str> {
        self.attrs.username
    }

    /// If present, splits the value of the USERNAME attribute into local and remote
    /// (separated by `:`).
    pub fn split_username(&self) -> Option<(&'a str, &'a str)> {
        self.attrs.split_username()
    }

    /// The REALM attribute.
    pub fn realm(&self) -> Option<&'a str> {
        self.attrs.realm
    }

    /// The NONCE attribute.
    pub fn nonce(&self) -> Option<&'a str> {
        self.attrs.nonce
    }

    /// The ERROR-CODE attribute as code and reason phrase.
    pub fn error_code(&self) -> Option<(u16, &'a str)> {
        self.attrs.error_code
    }

    /// If present, returns the value of XOR-MAPPED-ADDRESS attribute.
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.attrs.xor_mapped_address
    }

    /// If present, returns the value of XOR-PEER-ADDRESS attribute.
    pub fn peer_address(&self) -> Option<SocketAddr> {
        self.attrs.xor_peer_address
    }

    /// If present, returns the value of XOR-RELAYED-ADDRESS attribute.
    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.attrs.xor_relayed_address
    }

    /// The LIFETIME attribute in seconds.
    pub fn lifetime(&self) -> Option<u32> {
        self.attrs.lifetime
    }

    /// The REQUESTED-TRANSPORT protocol number.
    pub fn requested_transport(&self) -> Option<u8> {
        self.attrs.requested_transport
    }

    /// The DATA attribute.
    pub fn data(&self) -> Option<&'a [u8]> {
        self.attrs.data
    }

    /// If present, returns the value of the PRIORITY attribute.
    pub fn prio(&self) -> Option<u32> {
        self.attrs.priority
    }

    /// Whether this message has the USE-CANDIDATE attribute.
    pub fn use_candidate(&self) -> bool {
        self.attrs.use_candidate
    }

    /// Tie breaker of the ICE-CONTROLLING attribute.
    pub fn ice_controlling(&self) -> Option<u64> {
        self.attrs.ice_controlling
    }

    /// Tie breaker of the ICE-CONTROLLED attribute.
    pub fn ice_controlled(&self) -> Option<u64> {
        self.attrs.ice_controlled
    }

    /// Whether the message carries MESSAGE-INTEGRITY.
    pub fn has_integrity(&self) -> bool {
        self.attrs.message_integrity.is_some()
    }

    /// Verify the integrity of this message against the provided key.
    ///
    /// The key is the password for short-term credentials, or [`long_term_key`].
    #[must_use]
    pub fn check_integrity(&self, key: &[u8]) -> bool {
        if let Some(integ) = self.attrs.message_integrity {
            let sha1: Sha1 = key.into();
            let comp = sha1.hmac(&[
                &self.integrity[..2],
                &[(self.integrity_len >> 8) as u8, self.integrity_len as u8],
                &self.integrity[4..],
            ]);
            comp == integ
        } else {
            false
        }
    }

    fn has_fingerprint(&self) -> bool {
        !matches!(self.method, Method::Send | Method::Data)
    }

    /// Length of the serialized message.
    pub fn encoded_len(&self, with_integrity: bool) -> usize {
        let mut len = MSG_HEADER_LEN + self.attrs.padded_len();
        if with_integrity {
            len += ATTR_TLV_LENGTH + MSG_INTEGRITY_LEN;
        }
        if self.has_fingerprint() {
            len += ATTR_TLV_LENGTH + FPRINT_LEN;
        }
        len
    }

    /// Serialize this message into the provided buffer, returning the final length of the message.
    ///
    /// With a key, MESSAGE-INTEGRITY is appended. FINGERPRINT is always appended except
    /// for Send and Data indications.
    pub fn to_bytes(&self, key: Option<&[u8]>, buf: &mut [u8]) -> Result<usize, StunError> {
        let total = self.encoded_len(key.is_some());
        if buf.len() < total {
            return Err(StunError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "buffer too small for STUN message",
            )));
        }

        let attrs_end = MSG_HEADER_LEN + self.attrs.padded_len();

        let mut cursor = io::Cursor::new(&mut buf[..]);

        // Message header
        {
            let typ = self.class.to_u16() | self.method.to_u16();
            cursor.write_all(&typ.to_be_bytes())?;
            cursor.write_all(&((total - MSG_HEADER_LEN) as u16).to_be_bytes())?;
            cursor.write_all(MAGIC)?;
            cursor.write_all(&self.trans_id.0)?;
        }

        self.attrs.to_bytes(&mut cursor, &self.trans_id)?;

        let mut end = attrs_end;

        if let Some(key) = key {
            // Length as if message-integrity was the last attribute.
            let len = (end + ATTR_TLV_LENGTH + MSG_INTEGRITY_LEN - MSG_HEADER_LEN) as u16;
            buf[2..4].copy_from_slice(&len.to_be_bytes());

            let sha1: Sha1 = key.into();
            let hmac = sha1.hmac(&[&buf[..end]]);

            buf[end..end + 2].copy_from_slice(&0x0008_u16.to_be_bytes());
            buf[end + 2..end + 4].copy_from_slice(&(MSG_INTEGRITY_LEN as u16).to_be_bytes());
            buf[end + 4..end + 4 + MSG_INTEGRITY_LEN].copy_from_slice(&hmac);
            end += ATTR_TLV_LENGTH + MSG_INTEGRITY_LEN;
        }

        // Fill in total message length
        buf[2..4].copy_from_slice(&((total - MSG_HEADER_LEN) as u16).to_be_bytes());

        if self.has_fingerprint() {
            let crc = Crc::<u32>::new(&CRC_32_ISO_HDLC).checksum(&buf[..end]) ^ FINGERPRINT_XOR;
            buf[end..end + 2].copy_from_slice(&0x8028_u16.to_be_bytes());
            buf[end + 2..end + 4].copy_from_slice(&(FPRINT_LEN as u16).to_be_bytes());
            buf[end + 4..end + 4 + FPRINT_LEN].copy_from_slice(&crc.to_be_bytes());
        }

        Ok(total)
    }

    /// Serialize into a freshly allocated buffer of the exact size.
    pub fn to_vec(&self, key: Option<&[u8]>) -> Vec<u8> {
        let mut buf = vec![0; self.encoded_len(key.is_some())];
        let n = self
            .to_bytes(key, &mut buf)
            .expect("buffer sized by encoded_len");
        buf.truncate(n);
        buf
    }
}

/// Constructs [`StunMessage`] for sending.
#[derive(Clone, Copy)]
pub struct StunMessageBuilder<'a> {
    method: Method,
    class: Class,
    trans_id: TransId,
    attrs: Attributes<'a>,
}

impl<'a> StunMessageBuilder<'a> {
    /// Start a new message.
    pub fn new(method: Method, class: Class, trans_id: TransId) -> Self {
        StunMessageBuilder {
            method,
            class,
            trans_id,
            attrs: Attributes::default(),
        }
    }

    /// Set USERNAME.
    pub fn username(mut self, v: &'a str) -> Self {
        self.attrs.username = Some(v);
        self
    }

    /// Set REALM.
    pub fn realm(mut self, v: &'a str) -> Self {
        self.attrs.realm = Some(v);
        self
    }

    /// Set NONCE.
    pub fn nonce(mut self, v: &'a str) -> Self {
        self.attrs.nonce = Some(v);
        self
    }

    /// Set ERROR-CODE.
    pub fn error_code(mut self, code: u16, reason: &'a str) -> Self {
        self.attrs.error_code = Some((code, reason));
        self
    }

    /// Set SOFTWARE.
    pub fn software(mut self, v: &'a str) -> Self {
        self.attrs.software = Some(v);
        self
    }

    /// Set XOR-MAPPED-ADDRESS.
    pub fn mapped_address(mut self, v: SocketAddr) -> Self {
        self.attrs.xor_mapped_address = Some(v);
        self
    }

    /// Set XOR-PEER-ADDRESS.
    pub fn peer_address(mut self, v: SocketAddr) -> Self {
        self.attrs.xor_peer_address = Some(v);
        self
    }

    /// Set XOR-RELAYED-ADDRESS.
    pub fn relayed_address(mut self, v: SocketAddr) -> Self {
        self.attrs.xor_relayed_address = Some(v);
        self
    }

    /// Set LIFETIME in seconds.
    pub fn lifetime(mut self, v: u32) -> Self {
        self.attrs.lifetime = Some(v);
        self
    }

    /// Set REQUESTED-TRANSPORT.
    pub fn requested_transport(mut self, protocol: u8) -> Self {
        self.attrs.requested_transport = Some(protocol);
        self
    }

    /// Set DATA.
    pub fn data(mut self, v: &'a [u8]) -> Self {
        self.attrs.data = Some(v);
        self
    }

    /// Set PRIORITY.
    pub fn prio(mut self, v: u32) -> Self {
        self.attrs.priority = Some(v);
        self
    }

    /// Add USE-CANDIDATE.
    pub fn use_candidate(mut self, v: bool) -> Self {
        self.attrs.use_candidate = v;
        self
    }

    /// Add ICE-CONTROLLING or ICE-CONTROLLED with the tie breaker.
    pub fn ice_role(mut self, controlling: bool, tie_breaker: u64) -> Self {
        self.attrs.ice_controlling = controlling.then_some(tie_breaker);
        self.attrs.ice_controlled = (!controlling).then_some(tie_breaker);
        self
    }

    /// Finish the message.
    pub fn build(self) -> StunMessage<'a> {
        StunMessage {
            method: self.method,
            class: self.class,
            trans_id: self.trans_id,
            attrs: self.attrs,
            integrity: &[],
            integrity_len: 0,
        }
    }
}

#[derive(Default)]
struct Offsets {
    integrity: Option<usize>,
    fingerprint: Option<usize>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Attributes<'a> {
    username: Option<&'a str>,                 // 0x0006
    message_integrity: Option<&'a [u8]>,       // 0x0008
    error_code: Option<(u16, &'a str)>,        // 0x0009
    lifetime: Option<u32>,                     // 0x000d
    xor_peer_address: Option<SocketAddr>,      // 0x0012
    data: Option<&'a [u8]>,                    // 0x0013
    realm: Option<&'a str>,                    // 0x0014
    nonce: Option<&'a str>,                    // 0x0015
    xor_relayed_address: Option<SocketAddr>,   // 0x0016
    requested_transport: Option<u8>,           // 0x0019
    xor_mapped_address: Option<SocketAddr>,    // 0x0020
    priority: Option<u32>,                     // 0x0024
    use_candidate: bool,                       // 0x0025
    software: Option<&'a str>,                 // 0x8022
    fingerprint: Option<u32>,                  // 0x8028
    ice_controlled: Option<u64>,               // 0x8029
    ice_controlling: Option<u64>,              // 0x802a
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

fn addr_len(addr: &SocketAddr) -> usize {
    if addr.is_ipv4() {
        8
    } else {
        20
    }
}

impl<'a> Attributes<'a> {
    fn split_username(&self) -> Option<(&'a str, &'a str)> {
        // usernames are on the form gfNK:062g where
        // gfNK is my local ufrag and 062g is the remote.
        let v = self.username?;
        let idx = v.find(':')?;

        if idx == 0 || idx + 1 >= v.len() {
            return None;
        }

        Some((&v[..idx], &v[(idx + 1)..]))
    }

    fn padded_len(&self) -> usize {
        let str_len = |v: Option<&str>| v.map(|v| 4 + padded(v.len())).unwrap_or_default();
        let addr = |v: Option<SocketAddr>| v.map(|a| 4 + addr_len(&a)).unwrap_or_default();

        str_len(self.username)
            + str_len(self.realm)
            + str_len(self.nonce)
            + str_len(self.software)
            + self
                .error_code
                .map(|(_, r)| 4 + padded(4 + r.len()))
                .unwrap_or_default()
            + self.lifetime.map(|_| 8).unwrap_or_default()
            + self.requested_transport.map(|_| 8).unwrap_or_default()
            + addr(self.xor_peer_address)
            + addr(self.xor_relayed_address)
            + addr(self.xor_mapped_address)
            + self.data.map(|d| 4 + padded(d.len())).unwrap_or_default()
            + self.priority.map(|_| 8).unwrap_or_default()
            + if self.use_candidate { 4 } else { 0 }
            + self.ice_controlled.map(|_| 12).unwrap_or_default()
            + self.ice_controlling.map(|_| 12).unwrap_or_default()
    }

    fn to_bytes(self, w: &mut dyn Write, trans_id: &TransId) -> io::Result<()> {
        fn tlv(w: &mut dyn Write, typ: u16, value: &[u8]) -> io::Result<()> {
            w.write_all(&typ.to_be_bytes())?;
            w.write_all(&(value.len() as u16).to_be_bytes())?;
            w.write_all(value)?;
            let pad = padded(value.len()) - value.len();
            w.write_all(&[0; 3][..pad])
        }
        fn xor(
            w: &mut dyn Write,
            typ: u16,
            addr: SocketAddr,
            trans_id: &TransId,
        ) -> io::Result<()> {
            let mut buf = [0_u8; 20];
            let len = encode_xor(addr, &mut buf, trans_id);
            tlv(w, typ, &buf[..len])
        }

        if let Some(v) = self.username {
            tlv(w, 0x0006, v.as_bytes())?;
        }
        if let Some(v) = self.realm {
            tlv(w, 0x0014, v.as_bytes())?;
        }
        if let Some(v) = self.nonce {
            tlv(w, 0x0015, v.as_bytes())?;
        }
        if let Some((code, reason)) = self.error_code {
            let mut v = Vec::with_capacity(4 + reason.len());
            v.extend_from_slice(&[0, 0, (code / 100) as u8, (code % 100) as u8]);
            v.extend_from_slice(reason.as_bytes());
            tlv(w, 0x0009, &v)?;
        }
        if let Some(v) = self.requested_transport {
            tlv(w, 0x0019, &[v, 0, 0, 0])?;
        }
        if let Some(v) = self.lifetime {
            tlv(w, 0x000d, &v.to_be_bytes())?;
        }
        if let Some(v) = self.xor_peer_address {
            xor(w, 0x0012, v, trans_id)?;
        }
        if let Some(v) = self.xor_relayed_address {
            xor(w, 0x0016, v, trans_id)?;
        }
        if let Some(v) = self.xor_mapped_address {
            xor(w, 0x0020, v, trans_id)?;
        }
        if let Some(v) = self.data {
            tlv(w, 0x0013, v)?;
        }
        if let Some(v) = self.priority {
            tlv(w, 0x0024, &v.to_be_bytes())?;
        }
        if self.use_candidate {
            tlv(w, 0x0025, &[])?;
        }
        if let Some(v) = self.ice_controlled {
            tlv(w, 0x8029, &v.to_be_bytes())?;
        }
        if let Some(v) = self.ice_controlling {
            tlv(w, 0x802a, &v.to_be_bytes())?;
        }
        if let Some(v) = self.software {
            tlv(w, 0x8022, v.as_bytes())?;
        }

        Ok(())
    }

    fn parse(
        mut buf: &'a [u8],
        trans_id: TransId,
        offsets: &mut Offsets,
    ) -> Result<Attributes<'a>, StunError> {
        let mut attributes = Attributes::default();

        let mut off = 0;
        // With the exception of the FINGERPRINT attribute, which appears after
        // MESSAGE-INTEGRITY, agents MUST ignore all other attributes that
        // follow MESSAGE-INTEGRITY
        let mut ignore_rest = false;
        while !buf.is_empty() {
            if buf.len() < ATTR_TLV_LENGTH {
                return Err(StunError::Parse("Truncated STUN attribute header".into()));
            }
            let typ = (buf[0] as u16) << 8 | buf[1] as u16;
            let len = (buf[2] as usize) << 8 | buf[3] as usize;
            let pad_len = padded(len);
            if ATTR_TLV_LENGTH + pad_len > buf.len() {
                return Err(StunError::Parse(format!(
                    "Bad STUN attribute length: {} > {}",
                    len,
                    buf.len() - ATTR_TLV_LENGTH,
                )));
            }
            let value = &buf[ATTR_TLV_LENGTH..ATTR_TLV_LENGTH + len];

            if !ignore_rest || typ == 0x8028 {
                match typ {
                    0x0006 => {
                        attributes.username = Some(decode_str(typ, value)?);
                    }
                    0x0008 => {
                        if len != MSG_INTEGRITY_LEN {
                            return Err(StunError::Parse(
                                "Expected message integrity to have length 20".into(),
                            ));
                        }
                        // message integrity is up until, but not including the
                        // message integrity attribute.
                        offsets.integrity = Some(off);
                        ignore_rest = true;
                        attributes.message_integrity = Some(value);
                    }
                    0x0009 => {
                        if len < 4 || value[0] != 0 || value[1] != 0 || value[2] & 0b1111_1000 != 0
                        {
                            return Err(StunError::Parse("Malformed error code".into()));
                        }
                        let class = value[2] as u16 * 100;
                        if !(300..=699).contains(&class) {
                            return Err(StunError::Parse(format!(
                                "Error class is not in range: {class}"
                            )));
                        }
                        let code = class + (value[3] % 100) as u16;
                        attributes.error_code = Some((code, decode_str(typ, &value[4..])?));
                    }
                    0x000d => {
                        attributes.lifetime = Some(u32::from_be_bytes(fixed(typ, value)?));
                    }
                    0x0012 => {
                        attributes.xor_peer_address = Some(decode_xor(value, &trans_id)?);
                    }
                    0x0013 => {
                        attributes.data = Some(value);
                    }
                    0x0014 => {
                        attributes.realm = Some(decode_str(typ, value)?);
                    }
                    0x0015 => {
                        attributes.nonce = Some(decode_str(typ, value)?);
                    }
                    0x0016 => {
                        attributes.xor_relayed_address = Some(decode_xor(value, &trans_id)?);
                    }
                    0x0019 => {
                        let v: [u8; 4] = fixed(typ, value)?;
                        attributes.requested_transport = Some(v[0]);
                    }
                    0x0020 => {
                        attributes.xor_mapped_address = Some(decode_xor(value, &trans_id)?);
                    }
                    0x0022 | 0x8022 => {
                        attributes.software = Some(decode_str(typ, value)?);
                    }
                    0x0024 => {
                        attributes.priority = Some(u32::from_be_bytes(fixed(typ, value)?));
                    }
                    0x0025 => {
                        if len != 0 {
                            return Err(StunError::Parse(
                                "UseCandidate that isnt 0 in length".into(),
                            ));
                        }
                        attributes.use_candidate = true;
                    }
                    0x8028 => {
                        offsets.fingerprint = Some(off);
                        attributes.fingerprint = Some(u32::from_be_bytes(fixed(typ, value)?));
                        // Nothing may follow the fingerprint.
                        break;
                    }
                    0x8029 => {
                        attributes.ice_controlled = Some(u64::from_be_bytes(fixed(typ, value)?));
                    }
                    0x802a => {
                        attributes.ice_controlling = Some(u64::from_be_bytes(fixed(typ, value)?));
                    }
                    _ => {
                        trace!("STUN ignore attribute 0x{:04x} len {}", typ, len);
                    }
                }
            }

            // attributes are on even 32 bit boundaries
            buf = &buf[(ATTR_TLV_LENGTH + pad_len)..];
            off += ATTR_TLV_LENGTH + pad_len;
        }
        Ok(attributes)
    }
}

fn fixed<const N: usize>(typ: u16, value: &[u8]) -> Result<[u8; N], StunError> {
    value
        .try_into()
        .map_err(|_| StunError::Parse(format!("0x{typ:04x} expected length {N}")))
}

fn decode_str(typ: u16, buf: &[u8]) -> Result<&str, StunError> {
    if buf.len() > MAX_STR_LEN {
        return Err(StunError::Parse(format!(
            "0x{typ:04x} too long str len: {}",
            buf.len()
        )));
    }
    str::from_utf8(buf).map_err(|_| StunError::Parse(format!("0x{typ:04x} malformed utf-8")))
}

fn encode_xor(addr: SocketAddr, buf: &mut [u8; 20], trans_id: &TransId) -> usize {
    let port = addr.port() ^ 0x2112;
    buf[2..4].copy_from_slice(&port.to_be_bytes());
    buf[1] = if addr.is_ipv4() { 1 } else { 2 };
    let ip_buf = &mut buf[4..];
    match addr {
        SocketAddr::V4(v) => {
            let bytes = v.ip().octets();
            for i in 0..4 {
                ip_buf[i] = bytes[i] ^ MAGIC[i];
            }
            8
        }
        SocketAddr::V6(v) => {
            let bytes = v.ip().octets();
            for i in 0..4 {
                ip_buf[i] = bytes[i] ^ MAGIC[i];
            }
            for i in 4..16 {
                ip_buf[i] = bytes[i] ^ trans_id.0[i - 4];
            }
            20
        }
    }
}

fn decode_xor(buf: &[u8], trans_id: &TransId) -> Result<SocketAddr, StunError> {
    if buf.len() < 8 {
        return Err(StunError::Parse("XOR address too short".into()));
    }
    let port = (((buf[2] as u16) << 8) | (buf[3] as u16)) ^ 0x2112;
    let ip_buf = &buf[4..];
    let ip = match (buf[1], ip_buf.len()) {
        (1, 4) => {
            let mut bytes = [0_u8; 4];
            for i in 0..4 {
                bytes[i] = ip_buf[i] ^ MAGIC[i];
            }
            IpAddr::V4(bytes.into())
        }
        (2, 16) => {
            let mut bytes = [0_u8; 16];
            for i in 0..4 {
                bytes[i] = ip_buf[i] ^ MAGIC[i];
            }
            for i in 4..16 {
                bytes[i] = ip_buf[i] ^ trans_id.0[i - 4];
            }
            IpAddr::V6(bytes.into())
        }
        (f, l) => {
            return Err(StunError::Parse(format!(
                "Invalid address family {f} with length {l}"
            )));
        }
    };

    Ok(SocketAddr::new(ip, port))
}

impl<'a> fmt::Debug for StunMessage<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StunMessage")
            .field("method", &self.method)
            .field("class", &self.class)
            .field("attrs", &self.attrs)
            .field("integrity_len", &self.integrity.len())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn trans_id() -> TransId {
        TransId::new(&mut fastrand::Rng::with_seed(42))
    }

    #[test]
    fn parse_stun_message() {
        const PACKET: &[u8] = &[
            0x00, 0x01, 0x00, 0x50, 0x21, 0x12, 0xa4, 0x42, 0x6a, 0x75, 0x63, 0x31, 0x35, 0x75,
            0x78, 0x55, 0x6e, 0x67, 0x47, 0x63, 0x00, 0x06, 0x00, 0x09, 0x70, 0x39, 0x4b, 0x41,
            0x3a, 0x53, 0x51, 0x41, 0x74, 0x00, 0x00, 0x00, 0xc0, 0x57, 0x00, 0x04, 0x00, 0x01,
            0x00, 0x0a, 0x80, 0x2a, 0x00, 0x08, 0x6e, 0xee, 0xc6, 0xe9, 0x7d, 0x18, 0x39, 0x5c,
            0x00, 0x25, 0x00, 0x00, 0x00, 0x24, 0x00, 0x04, 0x6e, 0x7f, 0x1e, 0xff, 0x00, 0x08,
            0x00, 0x14, 0x5d, 0x04, 0x25, 0xa0, 0x20, 0x7a, 0xb1, 0xe0, 0x54, 0x10, 0x22, 0x99,
            0xaa, 0xf9, 0x83, 0x9c, 0xa0, 0x76, 0xc6, 0xd5, 0x80, 0x28, 0x00, 0x04, 0x36, 0x0e,
            0x21, 0x9f,
        ];

        let message = StunMessage::parse(PACKET).unwrap();
        assert!(message.is_binding_request());
        assert_eq!(message.split_username(), Some(("p9KA", "SQAt")));
        assert!(message.use_candidate());
        assert!(message.ice_controlling().is_some());
        assert!(message.check_integrity(b"xJcE9AQAR7kczUDVOXRUCl"));
        assert!(!message.check_integrity(b"wrong password"));
    }

    #[test]
    fn binding_request_with_integrity() {
        let msg = StunMessageBuilder::new(Method::Binding, Class::Request, trans_id())
            .username("abcd:efgh")
            .prio(1_853_824_767)
            .ice_role(true, 0x1122_3344_5566_7788)
            .use_candidate(true)
            .build();
        let buf = msg.to_vec(Some(&b"password"[..]));
        assert!(is_stun(&buf));

        let parsed = StunMessage::parse(&buf).unwrap();
        assert!(parsed.is_binding_request());
        assert_eq!(parsed.trans_id(), msg.trans_id());
        assert_eq!(parsed.username(), Some("abcd:efgh"));
        assert_eq!(parsed.prio(), Some(1_853_824_767));
        assert_eq!(parsed.ice_controlling(), Some(0x1122_3344_5566_7788));
        assert_eq!(parsed.ice_controlled(), None);
        assert!(parsed.use_candidate());
        assert!(parsed.check_integrity(b"password"));
    }

    #[test]
    fn corrupted_fingerprint_is_rejected() {
        let msg = StunMessageBuilder::new(Method::Binding, Class::Request, trans_id()).build();
        let mut buf = msg.to_vec(None);
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(StunMessage::parse(&buf).is_err());
    }

    #[test]
    fn xor_addresses_ipv6() {
        let addr: SocketAddr = "[2001:db8::1]:3478".parse().unwrap();
        let msg = StunMessageBuilder::new(Method::Binding, Class::Success, trans_id())
            .mapped_address(addr)
            .build();
        let buf = msg.to_vec(None);
        let parsed = StunMessage::parse(&buf).unwrap();
        assert!(parsed.is_successful_binding_response());
        assert_eq!(parsed.mapped_address(), Some(addr));
    }

    #[test]
    fn turn_method_encoding() {
        let msg = StunMessageBuilder::new(Method::CreatePermission, Class::Success, trans_id())
            .build();
        let buf = msg.to_vec(None);
        assert_eq!(&buf[..2], &[0x01, 0x08]);

        let msg = StunMessageBuilder::new(Method::Data, Class::Indication, trans_id()).build();
        let buf = msg.to_vec(None);
        assert_eq!(&buf[..2], &[0x00, 0x17]);
        assert_eq!(buf.len(), 20);
    }

    #[test]
    fn send_indication_keeps_payload() {
        let peer: SocketAddr = "198.51.100.7:6000".parse().unwrap();
        let payload = [1_u8, 2, 3, 4, 5];
        let msg = StunMessageBuilder::new(Method::Send, Class::Indication, trans_id())
            .peer_address(peer)
            .data(&payload)
            .build();
        let buf = msg.to_vec(None);
        let parsed = StunMessage::parse(&buf).unwrap();
        assert_eq!(parsed.method(), Method::Send);
        assert_eq!(parsed.peer_address(), Some(peer));
        assert_eq!(parsed.data(), Some(&payload[..]));
    }

    #[test]
    fn error_response_with_realm_and_nonce() {
        let msg = StunMessageBuilder::new(Method::Allocate, Class::Failure, trans_id())
            .error_code(401, "Unauthorized")
            .realm("example.org")
            .nonce("f00d")
            .build();
        let buf = msg.to_vec(None);
        let parsed = StunMessage::parse(&buf).unwrap();
        assert_eq!(parsed.class(), Class::Failure);
        assert_eq!(parsed.error_code(), Some((401, "Unauthorized")));
        assert_eq!(parsed.realm(), Some("example.org"));
        assert_eq!(parsed.nonce(), Some("f00d"));
        assert!(!parsed.has_integrity());
    }

    #[test]
    fn long_term_integrity() {
        let key = long_term_key("user", "realm", "pass");
        let msg = StunMessageBuilder::new(Method::Refresh, Class::Request, trans_id())
            .username("user")
            .realm("realm")
            .nonce("n")
            .lifetime(0)
            .build();
        let buf = msg.to_vec(Some(&key[..]));
        let parsed = StunMessage::parse(&buf).unwrap();
        assert_eq!(parsed.lifetime(), Some(0));
        assert!(parsed.check_integrity(&key));
        assert!(!parsed.check_integrity(b"pass"));
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(StunMessage::parse(&[0, 1, 0]).is_err());
        let msg = StunMessageBuilder::new(Method::Binding, Class::Request, trans_id())
            .username("a:b")
            .build();
        let buf = msg.to_vec(None);
        assert!(StunMessage::parse(&buf[..buf.len() - 4]).is_err());
    }
}
