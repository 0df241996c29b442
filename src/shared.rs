use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;
use rand::RngCore;

use crate::{MAX_CID_SIZE, RESET_TOKEN_SIZE};

/// Protocol-level identifier for a connection
///
/// An opaque byte string of up to 20 octets, compared by value. This is the
/// routing token the dispatcher keys every table on.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// The zero-length connection ID
    pub const EMPTY: ConnectionId = ConnectionId {
        len: 0,
        bytes: [0; MAX_CID_SIZE],
    };

    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Stateless reset token
///
/// Used for an endpoint to securely communicate that it has lost state for a
/// connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResetToken(pub(crate) [u8; RESET_TOKEN_SIZE]);

impl From<[u8; RESET_TOKEN_SIZE]> for ResetToken {
    fn from(x: [u8; RESET_TOKEN_SIZE]) -> Self {
        Self(x)
    }
}

impl ::std::ops::Deref for ResetToken {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

/// An outbound UDP datagram
#[derive(Debug, Clone)]
pub struct Transmit {
    /// The socket this datagram should be sent to
    pub destination: SocketAddr,
    /// Contents of the datagram
    pub contents: Vec<u8>,
}

/// An inbound UDP datagram, as handed to a session
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    /// Contents of the datagram
    pub contents: Bytes,
    /// When the datagram was received from the socket
    pub receipt_time: Instant,
}

/// Which side initiated the close of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ConnectionCloseSource {
    FromSelf,
    FromPeer,
}

/// Error codes attached to synthesized and observed connection closes
///
/// The wire representation is the IETF transport error code space; TLS
/// alerts map into the reserved crypto-error range.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ErrorCode {
    NoError,
    /// The public header could not be parsed or was inconsistent
    InvalidPacketHeader,
    /// The handshake could not be completed
    HandshakeFailed,
    /// A peer violated the protocol
    ProtocolViolation,
    /// The server is shutting down
    PeerGoingAway,
    /// A fatal TLS alert, carrying the alert description byte
    CryptoError(u8),
}

impl ErrorCode {
    /// The transport error code used when encoding a CONNECTION_CLOSE frame
    pub fn wire_code(self) -> u64 {
        use self::ErrorCode::*;
        match self {
            NoError | PeerGoingAway => 0x0,
            InvalidPacketHeader => 0x7, // FRAME_ENCODING_ERROR
            HandshakeFailed => 0x2,     // CONNECTION_REFUSED
            ProtocolViolation => 0xa,
            CryptoError(alert) => 0x100 | u64::from(alert),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::ErrorCode::*;
        match *self {
            NoError => write!(f, "no error"),
            InvalidPacketHeader => write!(f, "invalid packet header"),
            HandshakeFailed => write!(f, "handshake failed"),
            ProtocolViolation => write!(f, "protocol violation"),
            PeerGoingAway => write!(f, "peer going away"),
            CryptoError(alert) => write!(f, "crypto error (alert {})", alert),
        }
    }
}

/// Events a session reports back to the dispatcher
///
/// Sessions never call into the dispatcher directly; their entry points
/// return these values and the dispatcher folds them in after the session
/// borrow ends.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session closed itself; actual destruction is deferred
    ConnectionClosed {
        error: ErrorCode,
        reason: String,
        source: ConnectionCloseSource,
    },
    /// The session could not write and wants a callback once the socket drains
    WriteBlocked,
    /// The peer retired one of our connection IDs; stop routing it
    ConnectionIdRetired(ConnectionId),
    /// A RST_STREAM frame was received
    RstStreamReceived(u64),
    /// A STOP_SENDING frame was received
    StopSendingReceived(u64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_display() {
        let cid = ConnectionId::new(&[0xa1, 0xa2, 0xa3, 0xa4]);
        assert_eq!(format!("{}", cid), "a1a2a3a4");
        assert_eq!(cid.len(), 4);
        assert!(ConnectionId::EMPTY.is_empty());
    }

    #[test]
    fn crypto_error_wire_code() {
        assert_eq!(ErrorCode::CryptoError(80).wire_code(), 0x150);
        assert_eq!(ErrorCode::NoError.wire_code(), 0);
    }
}
