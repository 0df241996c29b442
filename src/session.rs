use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;

use crate::buffered_store::EnqueuePacketResult;
use crate::chlo::ParsedClientHello;
use crate::dispatcher::{PacketFate, PacketInfo};
use crate::shared::{ConnectionId, ErrorCode, ReceivedPacket, SessionEvent};
use crate::version::Version;

/// A live connection, as the dispatcher sees it
///
/// The dispatcher owns sessions, feeds them datagrams, and folds in the
/// events their entry points return. It never inspects a session's internals
/// beyond the identifiers it needs for routing and teardown.
pub trait Session {
    /// Handle one datagram addressed to this session
    fn process_udp_packet(
        &mut self,
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
        packet: &ReceivedPacket,
    ) -> Vec<SessionEvent>;

    /// The socket has drained; the session may try its pending writes again
    fn on_can_write(&mut self) -> Vec<SessionEvent> {
        Vec::new()
    }

    /// Close the connection, sending a CONNECTION_CLOSE to the peer
    fn close_connection(&mut self, error: ErrorCode, reason: &str) -> Vec<SessionEvent>;

    /// The server connection ID the session was created under
    fn connection_id(&self) -> ConnectionId;

    /// Every server connection ID currently routing to this session
    fn active_connection_ids(&self) -> Vec<ConnectionId> {
        vec![self.connection_id()]
    }

    fn version(&self) -> Version;

    fn is_handshake_complete(&self) -> bool;

    /// Called when the session was created under a replacement for the
    /// client-chosen connection ID
    fn set_original_connection_id(&mut self, _cid: ConnectionId) {}

    /// The client-chosen connection ID, if it was replaced
    fn original_connection_id(&self) -> Option<ConnectionId> {
        None
    }

    /// CONNECTION_CLOSE packets the session serialized before closing, to be
    /// replayed from time-wait
    fn termination_packets(&self) -> Vec<Bytes> {
        Vec::new()
    }

    /// Smoothed RTT estimate, used to pace time-wait responses
    fn smoothed_rtt(&self) -> Duration {
        Duration::from_millis(0)
    }
}

/// Hooks a server implementation supplies to the dispatcher
///
/// `create_session` is the only required method; the rest have the default
/// behaviour the dispatcher ships with and exist so deployments can tighten
/// admission or observe failures.
pub trait DispatchDelegate {
    /// Build a session for a fully-parsed client hello
    ///
    /// Returning `None` abandons the connection attempt; the packet is
    /// dropped without a reply.
    fn create_session(
        &mut self,
        server_connection_id: ConnectionId,
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
        alpn: &str,
        version: Version,
        parsed_chlo: &ParsedClientHello,
    ) -> Option<Box<dyn Session>>;

    /// Whether a packet with an unsupported version label should continue
    /// into the slow path instead of triggering version negotiation
    fn should_create_session_for_unknown_version(&mut self, _version_label: u32) -> bool {
        false
    }

    /// Vet a packet for an unknown connection ID that carries a version
    ///
    /// Packets without a version never reach this hook; the dispatcher
    /// answers those with a stateless reset and drops them.
    fn validity_checks(&mut self, _packet_info: &PacketInfo) -> PacketFate {
        PacketFate::Process
    }

    /// Vet a connection attempt once its client hello has fully parsed
    fn validity_checks_on_full_chlo(
        &mut self,
        _packet_info: &PacketInfo,
        _parsed_chlo: &ParsedClientHello,
    ) -> PacketFate {
        PacketFate::Process
    }

    /// A connection attempt was rejected because the dispatcher is no longer
    /// accepting new connections
    fn on_new_connection_rejected(&mut self) {}

    /// Last-chance hook before a packet falls through to the slow path;
    /// return true to claim the packet
    fn on_failed_to_dispatch_packet(&mut self, _packet_info: &PacketInfo) -> bool {
        false
    }

    /// The buffered-packet store refused a packet
    fn on_buffer_packet_failure(
        &mut self,
        _result: EnqueuePacketResult,
        _connection_id: ConnectionId,
    ) {
    }
}
