use crate::wire::WireError;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Largest payload carried in one session cell. Sized so a fully
/// onion-wrapped cell stays well inside a single datagram.
pub const MAX_CELL_PAYLOAD: usize = 498;

/// Commands carried between origin and exit inside the onion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// Open a TCP connection at the exit
    Connect = 1,
    /// Stream bytes in either direction
    Data = 2,
    /// Close the session
    End = 3,
    /// Exit opened the connection
    ConnectOk = 4,
    /// Exit could not open the connection
    ConnectFail = 5,
}

impl CellCommand {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Connect),
            2 => Some(Self::Data),
            3 => Some(Self::End),
            4 => Some(Self::ConnectOk),
            5 => Some(Self::ConnectFail),
            _ => None,
        }
    }
}

/// One unit of session traffic between origin and exit
///
/// Several sessions share a circuit; the session ID is what the exit
/// and origin demultiplex on. The cell only ever exists inside the
/// onion layers, so no relay on the path can read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCell {
    pub session: u16,
    pub command: CellCommand,
    pub payload: Vec<u8>,
}

impl SessionCell {
    pub fn new(session: u16, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            session,
            command,
            payload,
        }
    }

    /// Connect command payload: IPv4 endpoint in the same shape the
    /// outer wire uses (4 octets + big-endian port).
    pub fn connect(session: u16, dest: SocketAddrV4) -> Self {
        let mut payload = Vec::with_capacity(6);
        payload.extend_from_slice(&dest.ip().octets());
        payload.extend_from_slice(&dest.port().to_be_bytes());
        Self::new(session, CellCommand::Connect, payload)
    }

    pub fn connect_destination(&self) -> Result<SocketAddrV4, WireError> {
        if self.command != CellCommand::Connect || self.payload.len() != 6 {
            return Err(WireError::format("session-cell", "bad connect payload"));
        }
        let ip = Ipv4Addr::new(
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        );
        let port = u16::from_be_bytes([self.payload[4], self.payload[5]]);
        Ok(SocketAddrV4::new(ip, port))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.payload.len());
        buf.extend_from_slice(&self.session.to_be_bytes());
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < 3 {
            return Err(WireError::format("session-cell", "truncated header"));
        }
        let session = u16::from_be_bytes([bytes[0], bytes[1]]);
        let command = CellCommand::from_u8(bytes[2])
            .ok_or_else(|| WireError::format("session-cell", "unknown command"))?;
        Ok(Self {
            session,
            command,
            payload: bytes[3..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_roundtrip() {
        let cell = SessionCell::new(7, CellCommand::Data, b"torrent block".to_vec());
        let decoded = SessionCell::decode(&cell.encode()).unwrap();
        assert_eq!(cell, decoded);
    }

    #[test]
    fn test_connect_destination() {
        let dest = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 6881);
        let cell = SessionCell::connect(3, dest);
        assert_eq!(cell.connect_destination().unwrap(), dest);

        // On the wire: session 0003, command 01, then cb0071091ae1.
        assert_eq!(hex::encode(cell.encode()), "000301cb0071091ae1");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(SessionCell::decode(&[]).is_err());
        assert!(SessionCell::decode(&[0, 1]).is_err());
        assert!(SessionCell::decode(&[0, 1, 0xFF]).is_err());
    }
}
