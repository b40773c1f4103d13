use super::WireError;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Length of an ed25519 signature on the wire
pub const SIGNATURE_LEN: usize = 64;

/// Message kind discriminators
///
/// These values are fixed by the reference network; renumbering any of
/// them breaks interoperability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Data = 1,
    Create = 2,
    Created = 3,
    Extend = 4,
    Extended = 5,
    Ping = 8,
    Pong = 9,
    Destroy = 10,
    IntroductionResponse = 245,
    IntroductionRequest = 246,
    Puncture = 249,
    PunctureRequest = 250,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Data),
            2 => Some(Self::Create),
            3 => Some(Self::Created),
            4 => Some(Self::Extend),
            5 => Some(Self::Extended),
            8 => Some(Self::Ping),
            9 => Some(Self::Pong),
            10 => Some(Self::Destroy),
            245 => Some(Self::IntroductionResponse),
            246 => Some(Self::IntroductionRequest),
            249 => Some(Self::Puncture),
            250 => Some(Self::PunctureRequest),
            _ => None,
        }
    }
}

/// Cursor over a received frame with bounds-checked reads
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    kind: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], kind: &'static str) -> Self {
        Self { buf, pos: 0, kind }
    }

    fn need(&self, n: usize) -> Result<(), WireError> {
        if self.pos + n > self.buf.len() {
            return Err(WireError::format(
                self.kind,
                format!("need {} more bytes at offset {}", n, self.pos),
            ));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, WireError> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16, WireError> {
        self.need(2)?;
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        self.need(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.buf[self.pos..self.pos + 4]);
        self.pos += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.need(n)?;
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// u16 big-endian length prefix followed by that many bytes
    fn varlen(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.u16()? as usize;
        Ok(self.bytes(len)?.to_vec())
    }

    fn signature(&mut self) -> Result<[u8; SIGNATURE_LEN], WireError> {
        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(self.bytes(SIGNATURE_LEN)?);
        Ok(sig)
    }

    /// IPv4 endpoint: 4 raw octets + u16 big-endian port
    fn addr(&mut self) -> Result<SocketAddrV4, WireError> {
        let octets = self.bytes(4)?;
        let ip = Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]);
        let port = self.u16()?;
        Ok(SocketAddrV4::new(ip, port))
    }

    fn rest(&mut self) -> Vec<u8> {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice.to_vec()
    }
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_varlen(buf: &mut Vec<u8>, data: &[u8]) {
    put_u16(buf, data.len() as u16);
    buf.extend_from_slice(data);
}

fn put_addr(buf: &mut Vec<u8>, addr: &SocketAddrV4) {
    buf.extend_from_slice(&addr.ip().octets());
    put_u16(buf, addr.port());
}

/// A peer gossiped inside an introduction-response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipPeer {
    pub address: SocketAddrV4,
    pub public_key: Vec<u8>,
}

/// First step of the discovery handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroductionRequest {
    pub destination: SocketAddrV4,
    pub source_lan: SocketAddrV4,
    pub source_wan: SocketAddrV4,
    pub identifier: u16,
    pub public_key: Vec<u8>,
    pub signature: [u8; SIGNATURE_LEN],
}

impl IntroductionRequest {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_addr(buf, &self.destination);
        put_addr(buf, &self.source_lan);
        put_addr(buf, &self.source_wan);
        put_u16(buf, self.identifier);
        put_varlen(buf, &self.public_key);
        buf.extend_from_slice(&self.signature);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            destination: r.addr()?,
            source_lan: r.addr()?,
            source_wan: r.addr()?,
            identifier: r.u16()?,
            public_key: r.varlen()?,
            signature: r.signature()?,
        })
    }
}

/// Second step: response plus gossiped peer list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroductionResponse {
    pub destination: SocketAddrV4,
    pub source_lan: SocketAddrV4,
    pub source_wan: SocketAddrV4,
    pub intro_lan: SocketAddrV4,
    pub intro_wan: SocketAddrV4,
    pub identifier: u16,
    pub peers: Vec<GossipPeer>,
    pub public_key: Vec<u8>,
    pub signature: [u8; SIGNATURE_LEN],
}

impl IntroductionResponse {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_addr(buf, &self.destination);
        put_addr(buf, &self.source_lan);
        put_addr(buf, &self.source_wan);
        put_addr(buf, &self.intro_lan);
        put_addr(buf, &self.intro_wan);
        put_u16(buf, self.identifier);
        buf.push(self.peers.len() as u8);
        for peer in &self.peers {
            put_addr(buf, &peer.address);
            put_varlen(buf, &peer.public_key);
        }
        put_varlen(buf, &self.public_key);
        buf.extend_from_slice(&self.signature);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let destination = r.addr()?;
        let source_lan = r.addr()?;
        let source_wan = r.addr()?;
        let intro_lan = r.addr()?;
        let intro_wan = r.addr()?;
        let identifier = r.u16()?;
        let peer_count = r.u8()? as usize;
        let mut peers = Vec::with_capacity(peer_count);
        for _ in 0..peer_count {
            peers.push(GossipPeer {
                address: r.addr()?,
                public_key: r.varlen()?,
            });
        }
        Ok(Self {
            destination,
            source_lan,
            source_wan,
            intro_lan,
            intro_wan,
            identifier,
            peers,
            public_key: r.varlen()?,
            signature: r.signature()?,
        })
    }
}

/// Third step: ask the introducer to open a path to the walker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunctureRequest {
    pub walker_lan: SocketAddrV4,
    pub walker_wan: SocketAddrV4,
    pub identifier: u16,
}

impl PunctureRequest {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_addr(buf, &self.walker_lan);
        put_addr(buf, &self.walker_wan);
        put_u16(buf, self.identifier);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            walker_lan: r.addr()?,
            walker_wan: r.addr()?,
            identifier: r.u16()?,
        })
    }
}

/// Fourth step: the direct-reachability probe itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Puncture {
    pub source_lan: SocketAddrV4,
    pub source_wan: SocketAddrV4,
    pub identifier: u16,
}

impl Puncture {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_addr(buf, &self.source_lan);
        put_addr(buf, &self.source_wan);
        put_u16(buf, self.identifier);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            source_lan: r.addr()?,
            source_wan: r.addr()?,
            identifier: r.u16()?,
        })
    }
}

/// First-hop circuit creation. The identifier is 16-bit, not 32.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Create {
    pub circuit_id: u32,
    pub identifier: u16,
    pub node_public_key: Vec<u8>,
    pub ephemeral_key: Vec<u8>,
}

impl Create {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.circuit_id);
        put_u16(buf, self.identifier);
        put_varlen(buf, &self.node_public_key);
        put_varlen(buf, &self.ephemeral_key);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            circuit_id: r.u32()?,
            identifier: r.u16()?,
            node_public_key: r.varlen()?,
            ephemeral_key: r.varlen()?,
        })
    }
}

/// Reply to Create: relay's ephemeral key, key-confirmation auth tag,
/// and an opaque candidate list for the next extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub circuit_id: u32,
    pub identifier: u16,
    pub ephemeral_key: Vec<u8>,
    pub auth: Vec<u8>,
    pub candidates: Vec<u8>,
}

impl Created {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.circuit_id);
        put_u16(buf, self.identifier);
        put_varlen(buf, &self.ephemeral_key);
        put_varlen(buf, &self.auth);
        buf.extend_from_slice(&self.candidates);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            circuit_id: r.u32()?,
            identifier: r.u16()?,
            ephemeral_key: r.varlen()?,
            auth: r.varlen()?,
            candidates: r.rest(),
        })
    }
}

/// Extension request, routed through already-built hops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extend {
    pub circuit_id: u32,
    pub identifier: u16,
    pub node_public_key: Vec<u8>,
    pub ephemeral_key: Vec<u8>,
    pub node_addr: SocketAddrV4,
}

impl Extend {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.circuit_id);
        put_u16(buf, self.identifier);
        put_varlen(buf, &self.node_public_key);
        put_varlen(buf, &self.ephemeral_key);
        put_addr(buf, &self.node_addr);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            circuit_id: r.u32()?,
            identifier: r.u16()?,
            node_public_key: r.varlen()?,
            ephemeral_key: r.varlen()?,
            node_addr: r.addr()?,
        })
    }
}

/// Reply to Extend, relayed back through the circuit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extended {
    pub circuit_id: u32,
    pub identifier: u16,
    pub ephemeral_key: Vec<u8>,
    pub auth: Vec<u8>,
    pub candidates: Vec<u8>,
}

impl Extended {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.circuit_id);
        put_u16(buf, self.identifier);
        put_varlen(buf, &self.ephemeral_key);
        put_varlen(buf, &self.auth);
        buf.extend_from_slice(&self.candidates);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            circuit_id: r.u32()?,
            identifier: r.u16()?,
            ephemeral_key: r.varlen()?,
            auth: r.varlen()?,
            candidates: r.rest(),
        })
    }
}

/// End-to-end liveness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub circuit_id: u32,
    pub identifier: u16,
}

impl Ping {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.circuit_id);
        put_u16(buf, self.identifier);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            circuit_id: r.u32()?,
            identifier: r.u16()?,
        })
    }
}

/// Probe response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub circuit_id: u32,
    pub identifier: u16,
}

impl Pong {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.circuit_id);
        put_u16(buf, self.identifier);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            circuit_id: r.u32()?,
            identifier: r.u16()?,
        })
    }
}

/// Circuit teardown notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destroy {
    pub circuit_id: u32,
    pub reason: u8,
}

impl Destroy {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.circuit_id);
        buf.push(self.reason);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            circuit_id: r.u32()?,
            reason: r.u8()?,
        })
    }
}

/// Opaque onion-encrypted cell with a circuit-ID header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub circuit_id: u32,
    pub payload: Vec<u8>,
}

impl Data {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.circuit_id);
        buf.extend_from_slice(&self.payload);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            circuit_id: r.u32()?,
            payload: r.rest(),
        })
    }
}

/// A decoded overlay message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    IntroductionRequest(IntroductionRequest),
    IntroductionResponse(IntroductionResponse),
    PunctureRequest(PunctureRequest),
    Puncture(Puncture),
    Create(Create),
    Created(Created),
    Extend(Extend),
    Extended(Extended),
    Ping(Ping),
    Pong(Pong),
    Destroy(Destroy),
    Data(Data),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::IntroductionRequest(_) => MessageKind::IntroductionRequest,
            Self::IntroductionResponse(_) => MessageKind::IntroductionResponse,
            Self::PunctureRequest(_) => MessageKind::PunctureRequest,
            Self::Puncture(_) => MessageKind::Puncture,
            Self::Create(_) => MessageKind::Create,
            Self::Created(_) => MessageKind::Created,
            Self::Extend(_) => MessageKind::Extend,
            Self::Extended(_) => MessageKind::Extended,
            Self::Ping(_) => MessageKind::Ping,
            Self::Pong(_) => MessageKind::Pong,
            Self::Destroy(_) => MessageKind::Destroy,
            Self::Data(_) => MessageKind::Data,
        }
    }

    /// Serialize to wire bytes: discriminator first, then the payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        buf.push(self.kind() as u8);
        match self {
            Self::IntroductionRequest(m) => m.encode_into(&mut buf),
            Self::IntroductionResponse(m) => m.encode_into(&mut buf),
            Self::PunctureRequest(m) => m.encode_into(&mut buf),
            Self::Puncture(m) => m.encode_into(&mut buf),
            Self::Create(m) => m.encode_into(&mut buf),
            Self::Created(m) => m.encode_into(&mut buf),
            Self::Extend(m) => m.encode_into(&mut buf),
            Self::Extended(m) => m.encode_into(&mut buf),
            Self::Ping(m) => m.encode_into(&mut buf),
            Self::Pong(m) => m.encode_into(&mut buf),
            Self::Destroy(m) => m.encode_into(&mut buf),
            Self::Data(m) => m.encode_into(&mut buf),
        }
        buf
    }

    /// Parse a received frame
    pub fn decode(frame: &[u8]) -> Result<Self, WireError> {
        if frame.is_empty() {
            return Err(WireError::format("frame", "empty frame"));
        }

        let kind = MessageKind::from_u8(frame[0]).ok_or(WireError::UnknownKind(frame[0]))?;
        let body = &frame[1..];

        let message = match kind {
            MessageKind::IntroductionRequest => {
                let mut r = Reader::new(body, "introduction-request");
                Self::IntroductionRequest(IntroductionRequest::decode(&mut r)?)
            }
            MessageKind::IntroductionResponse => {
                let mut r = Reader::new(body, "introduction-response");
                Self::IntroductionResponse(IntroductionResponse::decode(&mut r)?)
            }
            MessageKind::PunctureRequest => {
                let mut r = Reader::new(body, "puncture-request");
                Self::PunctureRequest(PunctureRequest::decode(&mut r)?)
            }
            MessageKind::Puncture => {
                let mut r = Reader::new(body, "puncture");
                Self::Puncture(Puncture::decode(&mut r)?)
            }
            MessageKind::Create => {
                let mut r = Reader::new(body, "create");
                Self::Create(Create::decode(&mut r)?)
            }
            MessageKind::Created => {
                let mut r = Reader::new(body, "created");
                Self::Created(Created::decode(&mut r)?)
            }
            MessageKind::Extend => {
                let mut r = Reader::new(body, "extend");
                Self::Extend(Extend::decode(&mut r)?)
            }
            MessageKind::Extended => {
                let mut r = Reader::new(body, "extended");
                Self::Extended(Extended::decode(&mut r)?)
            }
            MessageKind::Ping => {
                let mut r = Reader::new(body, "ping");
                Self::Ping(Ping::decode(&mut r)?)
            }
            MessageKind::Pong => {
                let mut r = Reader::new(body, "pong");
                Self::Pong(Pong::decode(&mut r)?)
            }
            MessageKind::Destroy => {
                let mut r = Reader::new(body, "destroy");
                Self::Destroy(Destroy::decode(&mut r)?)
            }
            MessageKind::Data => {
                let mut r = Reader::new(body, "data");
                Self::Data(Data::decode(&mut r)?)
            }
        };

        Ok(message)
    }

    /// Bytes covered by the signature of a signed discovery message:
    /// the full encoding minus the trailing signature field.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = self.encode();
        match self {
            Self::IntroductionRequest(_) | Self::IntroductionResponse(_) => {
                bytes.truncate(bytes.len() - SIGNATURE_LEN);
            }
            _ => {}
        }
        bytes
    }
}
