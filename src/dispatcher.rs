use std::collections::{HashSet, VecDeque};
use std::mem;
use std::net::SocketAddr;
use std::ops::{Index, IndexMut};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use ring::hmac;
use slab::Slab;
use tracing::{debug, trace, warn};

use crate::buffered_store::{
    BufferedPacket, BufferedPacketList, BufferedPacketStore, EnqueuePacketResult,
    TlsExtractionResult,
};
use crate::chlo::{self, ParsedClientHello};
use crate::cid_generator::{ConnectionIdGenerator, DeterministicConnectionIdGenerator};
use crate::config::{ConfigError, DispatchConfig};
use crate::packet::{self, HeaderParseError, LongPacketType, PacketForm, ParsedHeader};
use crate::session::{DispatchDelegate, Session};
use crate::session_map::{SessionHandle, SessionIdMap};
use crate::shared::{
    ConnectionCloseSource, ConnectionId, ErrorCode, ReceivedPacket, SessionEvent, Transmit,
};
use crate::terminator;
use crate::time_wait::{TimeWaitAction, TimeWaitConnectionInfo, TimeWaitList};
use crate::timer::{Timer, TimerTable};
use crate::tls_chlo::{self, TlsChloExtractor};
use crate::version::Version;
use crate::{MIN_INITIAL_CONNECTION_ID_LENGTH, MIN_INITIAL_SIZE};

/// Packets below this size never elicit version negotiation, to deny small
/// packets a reflection amplifier
pub const MIN_PACKET_SIZE_FOR_VERSION_NEGOTIATION: usize = 1200;

/// New sessions the dispatcher will create per event-loop turn unless
/// [`Dispatcher::process_buffered_chlos`] sets a different quota
pub const DEFAULT_NEW_SESSIONS_PER_EVENT_LOOP: usize = 16;

/// What the slow path decided to do with a packet for an unknown connection ID
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketFate {
    /// Continue towards CHLO extraction and session creation
    Process,
    /// Statelessly terminate the connection ID and answer from time-wait
    TimeWait,
    /// Drop with no reply
    Drop,
}

/// A datagram plus everything the public-header parser learned about it
#[derive(Debug, Clone)]
pub struct PacketInfo {
    pub self_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub packet: Bytes,
    pub receipt_time: Instant,
    pub header: ParsedHeader,
}

/// Counters for every silent decision the dispatcher makes
#[derive(Debug, Default, Clone)]
pub struct DispatchStats {
    pub framing_errors: u64,
    pub dropped_blocked_port: u64,
    pub dropped_invalid_cid_length: u64,
    pub dropped_short_connection_id: u64,
    pub dropped_small_initial: u64,
    pub dropped_small_chlo: u64,
    pub reset_suppressed_recent_address: u64,
    pub reset_suppressed_too_many_addresses: u64,
    pub reset_suppressed_small_packet: u64,
    pub version_negotiations_sent: u64,
    pub stateless_terminations: u64,
    pub sessions_created: u64,
    pub packets_dispatched: u64,
}

struct SessionEntry {
    session: Box<dyn Session>,
    // Connection IDs this dispatcher inserted for the session, so teardown
    // can erase them even if the session's own accounting disagrees.
    tracked_cids: Vec<ConnectionId>,
}

impl Index<SessionHandle> for Slab<SessionEntry> {
    type Output = SessionEntry;
    fn index(&self, handle: SessionHandle) -> &SessionEntry {
        &self[handle.0]
    }
}

impl IndexMut<SessionHandle> for Slab<SessionEntry> {
    fn index_mut(&mut self, handle: SessionHandle) -> &mut SessionEntry {
        &mut self[handle.0]
    }
}

enum ExtractChloResult {
    FullChlo(ParsedClientHello),
    TlsAlert(u8),
    /// The packet was buffered for later, or (rarely) dropped
    BufferedOrDropped,
}

/// Server-side QUIC connection dispatcher
///
/// Owns the routing decision for every datagram the server socket receives:
/// hand it to an established session, buffer it for a connection whose
/// handshake has not completed, answer it from the time-wait list, or use it
/// to create a new session. Performs no I/O: outbound packets are drained
/// with [`poll_transmit`](Dispatcher::poll_transmit) and deadlines surface
/// through [`next_timeout`](Dispatcher::next_timeout).
pub struct Dispatcher<D: DispatchDelegate> {
    config: DispatchConfig,
    delegate: D,
    cid_generator: Box<dyn ConnectionIdGenerator>,
    sessions: Slab<SessionEntry>,
    session_ids: SessionIdMap,
    closed_sessions: Vec<SessionEntry>,
    buffered: BufferedPacketStore,
    time_wait: TimeWaitList,
    transmits: VecDeque<Transmit>,
    write_blocked: Vec<SessionHandle>,
    recent_reset_addresses: HashSet<SocketAddr>,
    timers: TimerTable,
    rng: StdRng,
    last_error: Option<HeaderParseError>,
    accept_new_connections: bool,
    new_sessions_allowed_per_event_loop: usize,
    expected_server_connection_id_length: usize,
    stats: DispatchStats,
}

impl<D: DispatchDelegate> Dispatcher<D> {
    /// Create a dispatcher with the default deterministic connection-ID
    /// generator
    pub fn new(config: DispatchConfig, delegate: D) -> Result<Self, ConfigError> {
        let generator = Box::new(DeterministicConnectionIdGenerator::new(
            config.expected_server_connection_id_length,
        ));
        Self::with_connection_id_generator(config, delegate, generator)
    }

    /// Create a dispatcher with a caller-supplied connection-ID generator
    pub fn with_connection_id_generator(
        config: DispatchConfig,
        delegate: D,
        cid_generator: Box<dyn ConnectionIdGenerator>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let reset_key = hmac::Key::new(hmac::HMAC_SHA256, &config.reset_key);
        let expected_server_connection_id_length = config.expected_server_connection_id_length;
        Ok(Self {
            config,
            delegate,
            cid_generator,
            sessions: Slab::new(),
            session_ids: SessionIdMap::new(),
            closed_sessions: Vec::new(),
            buffered: BufferedPacketStore::new(),
            time_wait: TimeWaitList::new(reset_key, StdRng::from_entropy()),
            transmits: VecDeque::new(),
            write_blocked: Vec::new(),
            recent_reset_addresses: HashSet::new(),
            timers: TimerTable::default(),
            rng: StdRng::from_entropy(),
            last_error: None,
            accept_new_connections: true,
            new_sessions_allowed_per_event_loop: DEFAULT_NEW_SESSIONS_PER_EVENT_LOOP,
            expected_server_connection_id_length,
            stats: DispatchStats::default(),
        })
    }

    /// Route one received datagram
    ///
    /// Infallible from the socket's perspective: every failure is absorbed
    /// into a counter, the error memo, or an on-wire response.
    pub fn process_packet(
        &mut self,
        now: Instant,
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
        data: Bytes,
    ) {
        let header = match packet::parse_public_header(&data, self.expected_server_connection_id_length)
        {
            Ok(header) => header,
            Err(e) => {
                debug!("dropping undecodable packet: {}", e);
                self.stats.framing_errors += 1;
                self.last_error = Some(e);
                return;
            }
        };
        if header.dst_cid.len() != self.expected_server_connection_id_length
            && !self.config.should_update_expected_server_connection_id_length
            && header.version.is_known()
            && !header.version.allows_variable_length_connection_ids()
        {
            debug!(connection = %header.dst_cid, "invalid connection ID length");
            self.stats.dropped_invalid_cid_length += 1;
            self.last_error = Some(HeaderParseError::InvalidHeader(
                "bad connection ID length for version",
            ));
            return;
        }
        if header.version_flag && self.is_supported_version(header.version) {
            if !header.version.is_valid_connection_id_length(header.dst_cid.len()) {
                debug!(connection = %header.dst_cid, version = %header.version,
                       "destination connection ID length invalid for version");
                self.stats.dropped_invalid_cid_length += 1;
                self.last_error = Some(HeaderParseError::InvalidHeader(
                    "bad connection ID length for version",
                ));
                return;
            }
            if header.version.supports_client_connection_ids()
                && !header.version.is_valid_connection_id_length(header.src_cid.len())
            {
                debug!(version = %header.version, "source connection ID length invalid for version");
                self.stats.dropped_invalid_cid_length += 1;
                self.last_error = Some(HeaderParseError::InvalidHeader(
                    "bad connection ID length for version",
                ));
                return;
            }
        }
        if self.config.should_update_expected_server_connection_id_length {
            self.expected_server_connection_id_length = header.dst_cid.len();
        }

        let info = PacketInfo {
            self_addr,
            peer_addr,
            packet: data,
            receipt_time: now,
            header,
        };
        if !self.maybe_dispatch_packet(&info, now) {
            self.process_header(info, now);
        }
        self.refresh_expiry_timers();
    }

    /// Fast path: returns true iff the packet was handled
    fn maybe_dispatch_packet(&mut self, info: &PacketInfo, now: Instant) -> bool {
        if is_source_udp_port_blocked(info.peer_addr.port()) {
            trace!(port = info.peer_addr.port(), "dropping packet from blocked port");
            self.stats.dropped_blocked_port += 1;
            return true;
        }

        let server_cid = info.header.dst_cid;

        // Clients must pick initial server connection IDs of at least 64
        // bits; anything shorter and shorter than what we route on cannot
        // belong to a live connection.
        if info.header.version_flag
            && info.header.version.is_known()
            && server_cid.len() < MIN_INITIAL_CONNECTION_ID_LENGTH
            && server_cid.len() < self.expected_server_connection_id_length
            && !self.config.allow_short_initial_server_connection_ids
        {
            debug!(connection = %server_cid, "dropping packet with short destination connection ID");
            self.stats.dropped_short_connection_id += 1;
            return true;
        }

        if let Some(handle) = self.session_ids.find(&server_cid) {
            debug_assert!(!self.buffered.has_buffered_packets(&server_cid));
            if info.header.version_flag
                && info.header.version == Version::legacy_encapsulation()
                && self.sessions[handle].session.version() != Version::legacy_encapsulation()
                && !self.config.disable_legacy_version_encapsulation
            {
                // The packet uses the encapsulation shell version but the
                // session does not: try to extract the real packet.
                if let Some(legacy_chlo) = chlo::extract_chlo(&info.packet) {
                    if let Some(inner) = legacy_chlo.legacy_version_encapsulation_inner_packet {
                        if self.maybe_handle_legacy_version_encapsulation(&inner, info, now) {
                            return true;
                        }
                    }
                }
            }
            self.deliver_packet_to_session(handle, info, now);
            return true;
        }

        if info.header.version.is_known() && !self.config.map_original_connection_ids {
            // The session may have been created under a replaced ID; the
            // replacement is deterministic, so recompute and re-check.
            if let Some(replaced) = self
                .cid_generator
                .maybe_replace_connection_id(&server_cid, info.header.version)
            {
                if let Some(handle) = self.session_ids.find(&replaced) {
                    debug_assert!(!self.buffered.has_buffered_packets(&replaced));
                    self.deliver_packet_to_session(handle, info, now);
                    return true;
                }
            }
        }

        if self.buffered.has_chlo_for_connection(&server_cid) {
            self.buffer_early_packet(info, now);
            return true;
        }

        if self.delegate.on_failed_to_dispatch_packet(info) {
            return true;
        }

        if self.time_wait.contains(&server_cid) {
            self.time_wait.process_packet(
                info.self_addr,
                info.peer_addr,
                &server_cid,
                info.packet.len(),
                &mut self.transmits,
            );
            return true;
        }

        if !self.accept_new_connections && info.header.version_flag {
            // Packets with a version could create state; put the ID in
            // time-wait so the rest of this flight bounces off it.
            self.statelessly_terminate(
                now,
                server_cid,
                info.header.form,
                true,
                info.header.use_length_prefix,
                info.header.version,
                ErrorCode::HandshakeFailed,
                "Stop accepting new connections",
                TimeWaitAction::SendStatelessReset,
            );
            self.time_wait.process_packet(
                info.self_addr,
                info.peer_addr,
                &server_cid,
                info.packet.len(),
                &mut self.transmits,
            );
            self.delegate.on_new_connection_rejected();
            return true;
        }

        if info.header.version_flag {
            if !self.is_supported_version(info.header.version) {
                if self
                    .delegate
                    .should_create_session_for_unknown_version(info.header.version_label)
                {
                    return false;
                }
                if info.packet.len() >= MIN_PACKET_SIZE_FOR_VERSION_NEGOTIATION {
                    self.stats.version_negotiations_sent += 1;
                    self.time_wait.send_version_negotiation(
                        &server_cid,
                        &info.header.src_cid,
                        info.header.form != PacketForm::GoogleQuic,
                        info.header.use_length_prefix,
                        &self.config.supported_versions,
                        info.self_addr,
                        info.peer_addr,
                        &mut self.transmits,
                    );
                }
                return true;
            }

            if info.header.form == PacketForm::IetfLongHeader
                && info.header.long_packet_type == Some(LongPacketType::Initial)
                && info.packet.len() < MIN_INITIAL_SIZE
            {
                debug!(len = info.packet.len(), "dropping too-short initial packet");
                self.stats.dropped_small_initial += 1;
                return true;
            }
        }

        false
    }

    /// Slow path for packets with unknown connection IDs
    fn process_header(&mut self, info: PacketInfo, now: Instant) {
        let server_cid = info.header.dst_cid;
        let mut fate = if !info.header.version_flag {
            // The fixed rule: no version and no known connection ID means the
            // most we will do is a rate-limited stateless reset.
            self.maybe_reset_packets_with_no_version(&info, now);
            PacketFate::Drop
        } else {
            self.delegate.validity_checks(&info)
        };

        let mut error = ErrorCode::HandshakeFailed;
        let mut error_detail = String::from("Reject connection");

        if fate == PacketFate::Process {
            match self.try_extract_chlo_or_buffer(&info, now) {
                ExtractChloResult::TlsAlert(alert) => {
                    fate = PacketFate::TimeWait;
                    error = ErrorCode::CryptoError(alert);
                    error_detail = format!(
                        "TLS handshake failure (Initial) {}: {}",
                        alert,
                        tls_chlo::alert_description(alert)
                    );
                }
                ExtractChloResult::BufferedOrDropped => return,
                ExtractChloResult::FullChlo(parsed_chlo) => {
                    fate = self.delegate.validity_checks_on_full_chlo(&info, &parsed_chlo);
                    if fate == PacketFate::Process {
                        if !self.config.disable_legacy_version_encapsulation {
                            if let Some(inner) =
                                parsed_chlo.legacy_version_encapsulation_inner_packet.clone()
                            {
                                if self.maybe_handle_legacy_version_encapsulation(&inner, &info, now)
                                {
                                    return;
                                }
                            }
                        }
                        self.process_chlo(parsed_chlo, &info, now);
                        return;
                    }
                }
            }
        }

        match fate {
            PacketFate::Process => warn!("packet fate Process fell through"),
            PacketFate::TimeWait => {
                debug!(connection = %server_cid, "adding connection ID to time-wait");
                self.statelessly_terminate(
                    now,
                    server_cid,
                    info.header.form,
                    info.header.version_flag,
                    info.header.use_length_prefix,
                    info.header.version,
                    error,
                    &error_detail,
                    TimeWaitAction::SendStatelessReset,
                );
                debug_assert!(self.time_wait.contains(&server_cid));
                self.time_wait.process_packet(
                    info.self_addr,
                    info.peer_addr,
                    &server_cid,
                    info.packet.len(),
                    &mut self.transmits,
                );
                self.buffered.discard_packets(&server_cid);
            }
            PacketFate::Drop => {}
        }
    }

    fn try_extract_chlo_or_buffer(
        &mut self,
        info: &PacketInfo,
        now: Instant,
    ) -> ExtractChloResult {
        let server_cid = info.header.dst_cid;
        if info.header.version.uses_tls() {
            let extraction = if self.buffered.has_buffered_packets(&server_cid) {
                // Accumulate into the extractor living with the buffered
                // packets for this connection ID.
                self.buffered.ingest_packet_for_tls_chlo_extraction(
                    &server_cid,
                    info.header.version,
                    &info.packet,
                )
            } else {
                // No list yet: check for a full single-packet CHLO with a
                // throwaway extractor.
                let mut extractor = TlsChloExtractor::new();
                extractor.ingest_packet(info.header.version, &info.packet);
                if extractor.has_parsed_full_chlo() {
                    TlsExtractionResult::FullChlo {
                        alpns: extractor.alpns().to_vec(),
                        sni: extractor.server_name().map(String::from),
                        resumption_attempted: extractor.resumption_attempted(),
                        early_data_attempted: extractor.early_data_attempted(),
                    }
                } else if let Some(alert) = extractor.tls_alert() {
                    TlsExtractionResult::Alert(alert)
                } else {
                    TlsExtractionResult::Partial
                }
            };
            match extraction {
                TlsExtractionResult::Alert(alert)
                    if self.config.send_connection_close_for_tls_alerts =>
                {
                    ExtractChloResult::TlsAlert(alert)
                }
                TlsExtractionResult::FullChlo {
                    alpns,
                    sni,
                    resumption_attempted,
                    early_data_attempted,
                } => ExtractChloResult::FullChlo(ParsedClientHello {
                    sni,
                    uaid: None,
                    alpns,
                    retry_token: info.header.retry_token.clone(),
                    resumption_attempted,
                    early_data_attempted,
                    legacy_version_encapsulation_inner_packet: None,
                }),
                _ => {
                    // Could be 0-RTT ahead of the CHLO, or a CHLO fragment.
                    self.buffer_early_packet(info, now);
                    ExtractChloResult::BufferedOrDropped
                }
            }
        } else {
            let legacy = chlo::extract_chlo(&info.packet);
            if self.config.allow_chlo_buffering && legacy.is_none() {
                self.buffer_early_packet(info, now);
                return ExtractChloResult::BufferedOrDropped;
            }
            // Versions without the IETF invariant header skipped the
            // fast-path size gate, so apply it to the CHLO here.
            if info.header.version_flag
                && !info.header.version.has_ietf_invariant_header()
                && info.packet.len() < MIN_INITIAL_SIZE
            {
                debug!(len = info.packet.len(), "dropping too-short CHLO packet");
                self.stats.dropped_small_chlo += 1;
                return ExtractChloResult::BufferedOrDropped;
            }
            let legacy = legacy.unwrap_or_default();
            ExtractChloResult::FullChlo(ParsedClientHello {
                sni: legacy.sni,
                uaid: legacy.uaid,
                alpns: legacy.alpn.into_iter().collect(),
                retry_token: None,
                resumption_attempted: false,
                early_data_attempted: false,
                legacy_version_encapsulation_inner_packet: legacy
                    .legacy_version_encapsulation_inner_packet,
            })
        }
    }

    fn buffer_early_packet(&mut self, info: &PacketInfo, now: Instant) {
        let result = self.buffered.enqueue_packet(
            now,
            info.header.dst_cid,
            info.header.form != PacketForm::GoogleQuic,
            BufferedPacket {
                packet: info.packet.clone(),
                self_addr: info.self_addr,
                peer_addr: info.peer_addr,
                receipt_time: info.receipt_time,
            },
            info.header.version,
            None,
        );
        if result != EnqueuePacketResult::Success {
            debug!(connection = %info.header.dst_cid, ?result, "failed to buffer packet");
            self.delegate
                .on_buffer_packet_failure(result, info.header.dst_cid);
        }
    }

    fn process_chlo(&mut self, parsed_chlo: ParsedClientHello, info: &PacketInfo, now: Instant) {
        if self.config.allow_chlo_buffering && self.new_sessions_allowed_per_event_loop == 0 {
            // Out of quota for this event-loop turn; park the CHLO for
            // `process_buffered_chlos`.
            let result = self.buffered.enqueue_packet(
                now,
                info.header.dst_cid,
                info.header.form != PacketForm::GoogleQuic,
                BufferedPacket {
                    packet: info.packet.clone(),
                    self_addr: info.self_addr,
                    peer_addr: info.peer_addr,
                    receipt_time: info.receipt_time,
                },
                info.header.version,
                Some(parsed_chlo),
            );
            if result != EnqueuePacketResult::Success {
                debug!(connection = %info.header.dst_cid, ?result, "failed to buffer CHLO");
                self.delegate
                    .on_buffer_packet_failure(result, info.header.dst_cid);
            }
            return;
        }

        let handle = match self.create_session_from_chlo(
            now,
            info.header.dst_cid,
            &parsed_chlo,
            info.header.version,
            info.self_addr,
            info.peer_addr,
        ) {
            Some(handle) => handle,
            None => return,
        };

        let queued = self
            .buffered
            .deliver_packets(&info.header.dst_cid)
            .map(BufferedPacketList::into_packets)
            .unwrap_or_default();

        // The CHLO is always the first packet the new session sees.
        self.deliver_packet_to_session(handle, info, now);
        for packet in queued {
            if !self.sessions.contains(handle.0) {
                break;
            }
            let received = ReceivedPacket {
                contents: packet.packet,
                receipt_time: packet.receipt_time,
            };
            let events = self.sessions[handle].session.process_udp_packet(
                packet.self_addr,
                packet.peer_addr,
                &received,
            );
            self.stats.packets_dispatched += 1;
            self.handle_session_events(now, handle, events);
        }
        self.new_sessions_allowed_per_event_loop =
            self.new_sessions_allowed_per_event_loop.saturating_sub(1);
    }

    fn create_session_from_chlo(
        &mut self,
        now: Instant,
        original_cid: ConnectionId,
        parsed_chlo: &ParsedClientHello,
        version: Version,
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Option<SessionHandle> {
        let replaced = self
            .cid_generator
            .maybe_replace_connection_id(&original_cid, version);
        let server_cid = replaced.unwrap_or(original_cid);

        if self.session_ids.contains(&server_cid) {
            // The ID is owned by another session; this attempt cannot
            // succeed. The original ID is free, so it is safe to reject it
            // on the wire.
            if replaced.is_some() {
                self.statelessly_terminate(
                    now,
                    original_cid,
                    PacketForm::IetfLongHeader,
                    true,
                    version.has_length_prefixed_connection_ids(),
                    version,
                    ErrorCode::HandshakeFailed,
                    "Connection ID collision, please retry",
                    TimeWaitAction::SendConnectionClosePackets,
                );
            }
            return None;
        }

        let alpn = self.select_alpn(&parsed_chlo.alpns);
        let mut session = match self.delegate.create_session(
            server_cid,
            self_addr,
            peer_addr,
            &alpn,
            version,
            parsed_chlo,
        ) {
            Some(session) => session,
            None => {
                warn!(connection = %server_cid, %version, alpn = %alpn,
                      "delegate declined to create a session");
                return None;
            }
        };
        if replaced.is_some() {
            session.set_original_connection_id(original_cid);
        }

        let handle = SessionHandle(self.sessions.insert(SessionEntry {
            session,
            tracked_cids: vec![server_cid],
        }));
        let inserted = self.session_ids.insert(server_cid, handle);
        debug_assert!(inserted);
        if self.config.map_original_connection_ids && replaced.is_some() {
            // Future packets addressed to the client-chosen ID must reach the
            // same session; losing this mapping would strand its first flight.
            if self.session_ids.insert(original_cid, handle) {
                self.sessions[handle].tracked_cids.push(original_cid);
            } else {
                warn!(connection = %original_cid, "original connection ID already routed");
            }
        }
        self.stats.sessions_created += 1;
        debug!(connection = %server_cid, %version, "created session");
        Some(handle)
    }

    fn deliver_packet_to_session(&mut self, handle: SessionHandle, info: &PacketInfo, now: Instant) {
        let received = ReceivedPacket {
            contents: info.packet.clone(),
            receipt_time: info.receipt_time,
        };
        let events = self.sessions[handle].session.process_udp_packet(
            info.self_addr,
            info.peer_addr,
            &received,
        );
        self.stats.packets_dispatched += 1;
        self.handle_session_events(now, handle, events);
    }

    fn handle_session_events(
        &mut self,
        now: Instant,
        handle: SessionHandle,
        events: Vec<SessionEvent>,
    ) {
        for event in events {
            match event {
                SessionEvent::ConnectionClosed {
                    error,
                    reason,
                    source,
                } => {
                    if self.sessions.contains(handle.0) {
                        self.on_session_closed(now, handle, error, &reason, source);
                    }
                }
                SessionEvent::WriteBlocked => {
                    if !self.write_blocked.contains(&handle) {
                        self.write_blocked.push(handle);
                    }
                }
                SessionEvent::ConnectionIdRetired(cid) => self.on_connection_id_retired(&cid),
                SessionEvent::RstStreamReceived(stream_id) => {
                    trace!(stream = stream_id, "RST_STREAM received");
                }
                SessionEvent::StopSendingReceived(stream_id) => {
                    trace!(stream = stream_id, "STOP_SENDING received");
                }
            }
        }
    }

    /// A session observed its own close; tear down its routing state
    ///
    /// The session object survives on the closed list until the
    /// delete-sessions deadline fires, so the stack frame that closed it can
    /// unwind safely.
    pub fn on_connection_closed(
        &mut self,
        now: Instant,
        cid: &ConnectionId,
        error: ErrorCode,
        reason: &str,
        source: ConnectionCloseSource,
    ) {
        match self.session_ids.find(cid) {
            Some(handle) => {
                self.on_session_closed(now, handle, error, reason, source);
                self.refresh_expiry_timers();
            }
            None => {
                warn!(connection = %cid, %error, "connection close for unknown connection ID");
            }
        }
    }

    fn on_session_closed(
        &mut self,
        now: Instant,
        handle: SessionHandle,
        error: ErrorCode,
        reason: &str,
        source: ConnectionCloseSource,
    ) {
        let entry = self.sessions.remove(handle.0);
        if error != ErrorCode::NoError {
            debug!(
                connection = %entry.session.connection_id(),
                %error,
                reason,
                ?source,
                "closing connection"
            );
        }
        self.write_blocked.retain(|h| *h != handle);

        let mut cids = entry.session.active_connection_ids();
        for cid in &entry.tracked_cids {
            if !cids.contains(cid) {
                cids.push(*cid);
            }
        }
        for cid in &cids {
            self.session_ids.erase(cid);
        }

        let version = entry.session.version();
        let termination_packets = entry.session.termination_packets();
        if !termination_packets.is_empty() {
            self.time_wait.add_connection_ids(
                now,
                TimeWaitAction::SendConnectionClosePackets,
                TimeWaitConnectionInfo {
                    ietf_quic: version.has_ietf_invariant_header(),
                    termination_packets,
                    connection_ids: cids,
                    srtt: entry.session.smoothed_rtt(),
                },
            );
        } else if !entry.session.is_handshake_complete() {
            // The peer never finished the handshake, so no negotiated close
            // exists; synthesize one under the initial keys.
            self.stats.stateless_terminations += 1;
            let primary = entry.session.connection_id();
            let original = entry.session.original_connection_id().unwrap_or(primary);
            terminator::close_connection(
                now,
                &mut self.time_wait,
                &primary,
                &original,
                version,
                ErrorCode::HandshakeFailed,
                "Connection is closed by server before handshake confirmed",
                cids,
            );
        } else {
            self.time_wait.add_connection_ids(
                now,
                TimeWaitAction::SendStatelessReset,
                TimeWaitConnectionInfo {
                    ietf_quic: version.has_ietf_invariant_header(),
                    termination_packets: Vec::new(),
                    connection_ids: cids,
                    srtt: entry.session.smoothed_rtt(),
                },
            );
        }

        if self.closed_sessions.is_empty() {
            self.timers.set(Timer::DeleteSessions, now);
        }
        self.closed_sessions.push(entry);
    }

    /// A session issued a new connection ID; start routing it
    pub fn try_add_new_connection_id(
        &mut self,
        existing_cid: &ConnectionId,
        new_cid: ConnectionId,
    ) -> bool {
        if !self.session_ids.contains(existing_cid) {
            warn!(
                connection = %existing_cid,
                new = %new_cid,
                "no session owns the existing connection ID"
            );
            return false;
        }
        match self.session_ids.try_add_new_connection_id(existing_cid, new_cid) {
            Some(handle) => {
                if self.sessions.contains(handle.0) {
                    self.sessions[handle].tracked_cids.push(new_cid);
                }
                true
            }
            None => false,
        }
    }

    /// The peer retired a connection ID; stop routing it
    pub fn on_connection_id_retired(&mut self, cid: &ConnectionId) {
        if let Some(handle) = self.session_ids.erase(cid) {
            if self.sessions.contains(handle.0) {
                self.sessions[handle].tracked_cids.retain(|c| c != cid);
            }
        }
    }

    /// A session reported itself write-blocked outside a dispatcher call
    pub fn on_write_blocked(&mut self, cid: &ConnectionId) {
        if let Some(handle) = self.session_ids.find(cid) {
            if !self.write_blocked.contains(&handle) {
                self.write_blocked.push(handle);
            }
        }
    }

    /// The socket drained; give each blocked session one chance to write
    pub fn on_can_write(&mut self, now: Instant) {
        let blocked = mem::take(&mut self.write_blocked);
        let num_blocked_before = blocked.len();
        for handle in blocked {
            if !self.sessions.contains(handle.0) {
                continue;
            }
            let events = self.sessions[handle].session.on_can_write();
            self.handle_session_events(now, handle, events);
        }
        if !self.write_blocked.is_empty() {
            trace!(
                before = num_blocked_before,
                after = self.write_blocked.len(),
                "sessions still write-blocked"
            );
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.write_blocked.is_empty()
    }

    /// Close every session and drain the closed list
    pub fn shutdown(&mut self, now: Instant) {
        loop {
            let handle = match self.sessions.iter().next() {
                Some((index, _)) => SessionHandle(index),
                None => break,
            };
            let events = self.sessions[handle]
                .session
                .close_connection(ErrorCode::PeerGoingAway, "Server shutdown imminent");
            self.handle_session_events(now, handle, events);
            if self.sessions.contains(handle.0) {
                warn!("session did not observe its own close during shutdown");
                self.on_session_closed(
                    now,
                    handle,
                    ErrorCode::PeerGoingAway,
                    "Server shutdown imminent",
                    ConnectionCloseSource::FromSelf,
                );
            }
        }
        self.delete_sessions();
        self.refresh_expiry_timers();
    }

    /// Create up to `max_connections_to_create` sessions from buffered CHLOs,
    /// FIFO in order of CHLO completion
    pub fn process_buffered_chlos(&mut self, now: Instant, max_connections_to_create: usize) {
        self.new_sessions_allowed_per_event_loop = max_connections_to_create;
        while self.new_sessions_allowed_per_event_loop > 0 {
            let (cid, mut list) = match self.buffered.deliver_packets_for_next_connection() {
                Some(next) => next,
                None => break,
            };
            let parsed_chlo = match list.parsed_chlo.take() {
                Some(parsed_chlo) => parsed_chlo,
                None => {
                    warn!(connection = %cid, "buffered connection has no CHLO");
                    self.new_sessions_allowed_per_event_loop -= 1;
                    continue;
                }
            };
            let version = list.version;
            let (self_addr, peer_addr) = match list.first_packet() {
                Some(first) => (first.self_addr, first.peer_addr),
                None => {
                    self.new_sessions_allowed_per_event_loop -= 1;
                    continue;
                }
            };
            if let Some(handle) =
                self.create_session_from_chlo(now, cid, &parsed_chlo, version, self_addr, peer_addr)
            {
                for packet in list.into_packets() {
                    if !self.sessions.contains(handle.0) {
                        break;
                    }
                    let received = ReceivedPacket {
                        contents: packet.packet,
                        receipt_time: packet.receipt_time,
                    };
                    let events = self.sessions[handle].session.process_udp_packet(
                        packet.self_addr,
                        packet.peer_addr,
                        &received,
                    );
                    self.stats.packets_dispatched += 1;
                    self.handle_session_events(now, handle, events);
                }
            }
            self.new_sessions_allowed_per_event_loop -= 1;
        }
        self.refresh_expiry_timers();
    }

    /// The earliest deadline at which [`handle_timeout`](Self::handle_timeout)
    /// should be called
    pub fn next_timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// Fire every deadline at or before `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        let expired: Vec<Timer> = self.timers.take_expired(now).collect();
        for timer in expired {
            match timer {
                Timer::DeleteSessions => self.delete_sessions(),
                Timer::ClearResetAddresses => self.recent_reset_addresses.clear(),
                Timer::ExpireBufferedPackets => {
                    for (cid, list) in self.buffered.expire_before(now) {
                        self.on_expired_packets(now, cid, list);
                    }
                }
                Timer::ExpireTimeWait => self.time_wait.expire_before(now),
            }
        }
        self.refresh_expiry_timers();
    }

    /// The next outbound datagram, if any
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    pub fn start_accepting_new_connections(&mut self) {
        self.accept_new_connections = true;
    }

    /// Stop admitting connections; buffered handshakes are abandoned too
    pub fn stop_accepting_new_connections(&mut self) {
        self.accept_new_connections = false;
        self.buffered.discard_all_packets();
        self.refresh_expiry_timers();
    }

    pub fn is_accepting_new_connections(&self) -> bool {
        self.accept_new_connections
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_chlos_buffered(&self) -> bool {
        self.buffered.has_chlos_buffered()
    }

    pub fn has_buffered_packets(&self, cid: &ConnectionId) -> bool {
        self.buffered.has_buffered_packets(cid)
    }

    pub fn is_connection_id_in_time_wait(&self, cid: &ConnectionId) -> bool {
        self.time_wait.contains(cid)
    }

    pub fn expected_server_connection_id_length(&self) -> usize {
        self.expected_server_connection_id_length
    }

    /// The most recent framing error `process_packet` absorbed
    pub fn last_error(&self) -> Option<&HeaderParseError> {
        self.last_error.as_ref()
    }

    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }

    /// Visit every live session exactly once
    pub fn perform_action_on_active_sessions(&mut self, mut operation: impl FnMut(&mut dyn Session)) {
        for (_, entry) in self.sessions.iter_mut() {
            operation(&mut *entry.session);
        }
    }

    fn delete_sessions(&mut self) {
        self.closed_sessions.clear();
        self.timers.stop(Timer::DeleteSessions);
    }

    fn on_expired_packets(&mut self, now: Instant, cid: ConnectionId, list: BufferedPacketList) {
        debug!(connection = %cid, "buffered packets expired before a session existed");
        self.statelessly_terminate(
            now,
            cid,
            if list.ietf_quic {
                PacketForm::IetfLongHeader
            } else {
                PacketForm::GoogleQuic
            },
            true,
            list.version.has_length_prefixed_connection_ids(),
            list.version,
            ErrorCode::HandshakeFailed,
            "Packets buffered for too long",
            TimeWaitAction::SendStatelessReset,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn statelessly_terminate(
        &mut self,
        now: Instant,
        cid: ConnectionId,
        form: PacketForm,
        version_flag: bool,
        use_length_prefix: bool,
        version: Version,
        error: ErrorCode,
        reason: &str,
        action: TimeWaitAction,
    ) {
        self.stats.stateless_terminations += 1;
        if form != PacketForm::IetfLongHeader && !version_flag {
            trace!(connection = %cid, ?action, "terminating from a non-long-header packet");
            self.time_wait.add_connection_ids(
                now,
                action,
                TimeWaitConnectionInfo {
                    ietf_quic: form != PacketForm::GoogleQuic,
                    termination_packets: Vec::new(),
                    connection_ids: vec![cid],
                    srtt: Duration::from_millis(0),
                },
            );
            return;
        }

        if self.is_supported_version(version) {
            terminator::close_connection(
                now,
                &mut self.time_wait,
                &cid,
                &cid,
                version,
                error,
                reason,
                vec![cid],
            );
            return;
        }

        // Unknown or unsupported version: save an empty version negotiation,
        // which any client can understand.
        let negotiation = packet::build_version_negotiation(
            self.rng.gen(),
            &ConnectionId::EMPTY,
            &cid,
            form != PacketForm::GoogleQuic,
            use_length_prefix,
            &[],
        );
        self.time_wait.add_connection_ids(
            now,
            TimeWaitAction::SendTerminationPackets,
            TimeWaitConnectionInfo {
                ietf_quic: form != PacketForm::GoogleQuic,
                termination_packets: vec![Bytes::from(negotiation)],
                connection_ids: vec![cid],
                srtt: Duration::from_millis(0),
            },
        );
    }

    fn maybe_reset_packets_with_no_version(&mut self, info: &PacketInfo, now: Instant) {
        debug_assert!(!info.header.version_flag);
        if self.recent_reset_addresses.contains(&info.peer_addr) {
            self.stats.reset_suppressed_recent_address += 1;
            return;
        }
        if info.header.form != PacketForm::GoogleQuic {
            if info.packet.len() <= crate::time_wait::MIN_STATELESS_RESET_PACKET_LENGTH {
                self.stats.reset_suppressed_small_packet += 1;
                return;
            }
        } else {
            let min_valid_len = 1 // public flags
                + self.expected_server_connection_id_length
                + 1 // packet number
                + 1 // payload
                + 12; // authentication tag
            if info.packet.len() < min_valid_len {
                self.stats.reset_suppressed_small_packet += 1;
                return;
            }
        }
        if self.recent_reset_addresses.len() >= self.config.max_recent_stateless_reset_addresses {
            self.stats.reset_suppressed_too_many_addresses += 1;
            return;
        }
        if self.recent_reset_addresses.is_empty() {
            self.timers.set(
                Timer::ClearResetAddresses,
                now + self.config.recent_stateless_reset_addresses_lifetime,
            );
        }
        self.recent_reset_addresses.insert(info.peer_addr);
        self.time_wait.send_public_reset(
            info.self_addr,
            info.peer_addr,
            &info.header.dst_cid,
            info.header.form != PacketForm::GoogleQuic,
            info.packet.len(),
            &mut self.transmits,
        );
    }

    fn maybe_handle_legacy_version_encapsulation(
        &mut self,
        inner: &Bytes,
        info: &PacketInfo,
        now: Instant,
    ) -> bool {
        if inner.is_empty() {
            return false;
        }
        let inner_header =
            match packet::parse_public_header(inner, self.expected_server_connection_id_length) {
                Ok(header) => header,
                Err(e) => {
                    debug!("failed to parse encapsulated inner packet: {}", e);
                    return false;
                }
            };
        if inner_header.dst_cid != info.header.dst_cid {
            // Mismatched IDs must never affect routing.
            debug!(
                inner = %inner_header.dst_cid,
                outer = %info.header.dst_cid,
                "ignoring encapsulated packet with mismatched connection ID"
            );
            return false;
        }
        if inner.len() >= info.packet.len() {
            warn!("encapsulated inner packet cannot be larger than the outer packet");
            return false;
        }
        trace!(
            len = inner.len(),
            version = %inner_header.version,
            "re-dispatching encapsulated inner packet"
        );
        // Zero-pad up to the outer length so anti-amplification accounting
        // sees the bytes that actually arrived.
        let mut padded = inner.to_vec();
        padded.resize(info.packet.len(), 0);
        self.process_packet(now, info.self_addr, info.peer_addr, Bytes::from(padded));
        true
    }

    fn select_alpn(&self, alpns: &[String]) -> String {
        if alpns.is_empty() {
            return String::new();
        }
        if alpns.len() > 1 {
            for alpn in alpns {
                if self.config.supported_alpns.iter().any(|supported| supported == alpn) {
                    return alpn.clone();
                }
            }
        }
        alpns[0].clone()
    }

    fn is_supported_version(&self, version: Version) -> bool {
        self.config.supported_versions.contains(&version)
    }

    fn refresh_expiry_timers(&mut self) {
        match self.buffered.next_expiry() {
            Some(deadline) => self.timers.set(Timer::ExpireBufferedPackets, deadline),
            None => self.timers.stop(Timer::ExpireBufferedPackets),
        }
        match self.time_wait.next_expiry() {
            Some(deadline) => self.timers.set(Timer::ExpireTimeWait, deadline),
            None => self.timers.stop(Timer::ExpireTimeWait),
        }
    }
}

fn is_source_udp_port_blocked(port: u16) -> bool {
    // Ports seen in large-scale reflection attacks and loops; never expected
    // to carry real client traffic. Sorted ascending.
    const BLOCKED_PORTS: [u16; 16] = [
        0,     // cannot respond to port 0
        17,    // Quote of the Day
        19,    // Chargen
        53,    // DNS
        111,   // Portmap
        123,   // NTP
        137,   // NETBIOS Name Service
        138,   // NETBIOS Datagram Service
        161,   // SNMP
        389,   // CLDAP
        500,   // IKE
        1900,  // SSDP
        3702,  // WS-Discovery
        5353,  // mDNS
        5355,  // LLMNR
        11211, // memcache
    ];
    if port > BLOCKED_PORTS[BLOCKED_PORTS.len() - 1] {
        return false;
    }
    BLOCKED_PORTS.binary_search(&port).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_ports() {
        for &port in &[0, 53, 123, 5353, 11211] {
            assert!(is_source_udp_port_blocked(port));
        }
        for &port in &[80, 443, 11212, 40000, 65535] {
            assert!(!is_source_udp_port_blocked(port));
        }
    }
}
