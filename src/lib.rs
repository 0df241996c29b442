//! Server-side QUIC connection dispatcher.
//!
//! This crate implements the component that sits between a server's UDP
//! socket and its QUIC sessions: for every received datagram it parses just
//! enough of the public header to decide who owns the packet — an
//! established session, the buffered-packet store holding a connection whose
//! handshake is still in flight, or the time-wait list answering for dead
//! connection IDs — and creates sessions once a complete client hello has
//! been assembled.
//!
//! The dispatcher performs no I/O. Feed it datagrams with
//! [`Dispatcher::process_packet`], drain outbound packets with
//! [`Dispatcher::poll_transmit`], and drive its deadlines with
//! [`Dispatcher::next_timeout`] / [`Dispatcher::handle_timeout`]. Sessions
//! are created through a [`DispatchDelegate`] and communicate back through
//! [`SessionEvent`] values.

mod buffered_store;
pub use crate::buffered_store::{
    BufferedPacket, BufferedPacketList, BufferedPacketStore, EnqueuePacketResult,
    TlsExtractionResult, INITIAL_IDLE_TIMEOUT, MAX_CONNECTIONS, MAX_PACKETS_PER_CONNECTION,
};

mod chlo;
pub use crate::chlo::{extract_chlo, LegacyChlo, ParsedClientHello};

mod cid_generator;
pub use crate::cid_generator::{
    replacement_connection_id, ConnectionIdGenerator, DeterministicConnectionIdGenerator,
};

mod coding;

mod config;
pub use crate::config::{ConfigError, DispatchConfig};

mod crypto;

mod dispatcher;
pub use crate::dispatcher::{
    DispatchStats, Dispatcher, PacketFate, PacketInfo, DEFAULT_NEW_SESSIONS_PER_EVENT_LOOP,
    MIN_PACKET_SIZE_FOR_VERSION_NEGOTIATION,
};

mod packet;
pub use crate::packet::{
    build_version_negotiation, parse_public_header, parse_version_negotiation, HeaderParseError,
    LongPacketType, PacketForm, ParsedHeader,
};

mod session;
pub use crate::session::{DispatchDelegate, Session};

mod session_map;
pub use crate::session_map::{SessionHandle, SessionIdMap};

mod shared;
pub use crate::shared::{
    ConnectionCloseSource, ConnectionId, ErrorCode, ReceivedPacket, ResetToken, SessionEvent,
    Transmit,
};

mod terminator;

mod time_wait;
pub use crate::time_wait::{
    TimeWaitAction, TimeWaitConnectionInfo, TimeWaitList, MIN_STATELESS_RESET_PACKET_LENGTH,
    TIME_WAIT_PERIOD,
};

mod timer;

mod tls_chlo;
pub use crate::tls_chlo::{TlsChloExtractor, TlsChloState};

mod varint;

mod version;
pub use crate::version::{Version, SUPPORTED_VERSIONS};


/// The longest connection ID any version permits
pub const MAX_CID_SIZE: usize = 20;

/// Clients must choose initial server connection IDs of at least this length
pub const MIN_INITIAL_CONNECTION_ID_LENGTH: usize = 8;

/// Minimum size of a client's first handshake datagram
pub const MIN_INITIAL_SIZE: usize = 1200;

/// Length of a stateless reset token
pub const RESET_TOKEN_SIZE: usize = 16;
