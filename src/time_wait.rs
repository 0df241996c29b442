use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, RngCore};
use ring::hmac;
use tracing::{debug, trace, warn};

use crate::crypto;
use crate::packet;
use crate::shared::{ConnectionId, Transmit};
use crate::version::Version;
use crate::RESET_TOKEN_SIZE;

/// How long a connection ID stays in time-wait
pub const TIME_WAIT_PERIOD: Duration = Duration::from_secs(200);
/// Most connection IDs tracked in time-wait; oldest are trimmed beyond this
pub const MAX_CONNECTIONS_IN_TIME_WAIT: usize = 600_000;

/// Minimum amount of padding for a stateless reset to look like a short-header
/// packet
const MIN_PADDING_LEN: usize = 5;
/// Resets with at least this much padding can't be distinguished from real
/// packets
const IDEAL_MIN_PADDING_LEN: usize = MIN_PADDING_LEN + crate::MAX_CID_SIZE;
/// Incoming short-header packets at or below this length never elicit a reset
pub const MIN_STATELESS_RESET_PACKET_LENGTH: usize = MIN_PADDING_LEN + RESET_TOKEN_SIZE;

/// What to do with further packets for a connection ID in time-wait
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TimeWaitAction {
    SendStatelessReset,
    SendConnectionClosePackets,
    SendTerminationPackets,
    DoNothing,
}

/// Everything recorded about a terminated connection's IDs
#[derive(Debug, Clone)]
pub struct TimeWaitConnectionInfo {
    pub ietf_quic: bool,
    pub termination_packets: Vec<Bytes>,
    pub connection_ids: Vec<ConnectionId>,
    pub srtt: Duration,
}

struct Entry {
    action: TimeWaitAction,
    ietf_quic: bool,
    termination_packets: Vec<Bytes>,
    num_packets_seen: usize,
    expiry: Instant,
}

/// Canned responses for recently-closed or statelessly-rejected connection IDs
///
/// The list owns its own expiry: the dispatcher drives
/// [`TimeWaitList::expire_before`] from [`TimeWaitList::next_expiry`].
pub struct TimeWaitList {
    entries: HashMap<ConnectionId, Entry>,
    // Insertion order doubles as expiry order since the period is fixed.
    expiry_order: VecDeque<ConnectionId>,
    reset_key: hmac::Key,
    rng: StdRng,
}

impl TimeWaitList {
    pub fn new(reset_key: hmac::Key, rng: StdRng) -> Self {
        Self {
            entries: HashMap::new(),
            expiry_order: VecDeque::new(),
            reset_key,
            rng,
        }
    }

    pub fn contains(&self, cid: &ConnectionId) -> bool {
        self.entries.contains_key(cid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record every connection ID of a terminated connection
    pub fn add_connection_ids(
        &mut self,
        now: Instant,
        action: TimeWaitAction,
        info: TimeWaitConnectionInfo,
    ) {
        while self.entries.len() >= MAX_CONNECTIONS_IN_TIME_WAIT {
            match self.expiry_order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        let expiry = now + TIME_WAIT_PERIOD;
        for cid in info.connection_ids {
            if self.entries.contains_key(&cid) {
                trace!(connection = %cid, "connection ID already in time-wait");
                continue;
            }
            debug!(connection = %cid, ?action, "connection ID added to time-wait");
            self.entries.insert(
                cid,
                Entry {
                    action,
                    ietf_quic: info.ietf_quic,
                    termination_packets: info.termination_packets.clone(),
                    num_packets_seen: 0,
                    expiry,
                },
            );
            self.expiry_order.push_back(cid);
        }
    }

    /// Respond to a packet addressed to a connection ID in the list
    ///
    /// Responses are throttled: only the 1st, 2nd, 4th, 8th … packet seen for
    /// an entry produces one, so a peer flooding a dead ID cannot use us as
    /// an amplifier.
    pub fn process_packet(
        &mut self,
        self_addr: SocketAddr,
        peer_addr: SocketAddr,
        cid: &ConnectionId,
        packet_len: usize,
        transmits: &mut VecDeque<Transmit>,
    ) {
        let _ = self_addr;
        let entry = match self.entries.get_mut(cid) {
            Some(entry) => entry,
            None => {
                warn!(connection = %cid, "time-wait packet for untracked connection ID");
                return;
            }
        };
        entry.num_packets_seen += 1;
        if !entry.num_packets_seen.is_power_of_two() {
            return;
        }
        match entry.action {
            TimeWaitAction::SendConnectionClosePackets | TimeWaitAction::SendTerminationPackets => {
                for packet in &entry.termination_packets {
                    transmits.push_back(Transmit {
                        destination: peer_addr,
                        contents: packet.to_vec(),
                    });
                }
            }
            TimeWaitAction::SendStatelessReset => {
                let ietf = entry.ietf_quic;
                self.build_public_reset(peer_addr, cid, ietf, packet_len, transmits);
            }
            TimeWaitAction::DoNothing => {}
        }
    }

    /// Emit a version negotiation packet on behalf of the dispatcher
    pub fn send_version_negotiation(
        &mut self,
        server_cid: &ConnectionId,
        client_cid: &ConnectionId,
        ietf: bool,
        use_length_prefix: bool,
        versions: &[Version],
        _self_addr: SocketAddr,
        peer_addr: SocketAddr,
        transmits: &mut VecDeque<Transmit>,
    ) {
        trace!(connection = %server_cid, "sending version negotiation");
        let contents = packet::build_version_negotiation(
            self.rng.gen(),
            client_cid,
            server_cid,
            ietf,
            use_length_prefix,
            versions,
        );
        transmits.push_back(Transmit {
            destination: peer_addr,
            contents,
        });
    }

    /// Emit a stateless reset for a connection ID we hold no state for
    pub fn send_public_reset(
        &mut self,
        _self_addr: SocketAddr,
        peer_addr: SocketAddr,
        cid: &ConnectionId,
        ietf: bool,
        incoming_len: usize,
        transmits: &mut VecDeque<Transmit>,
    ) {
        self.build_public_reset(peer_addr, cid, ietf, incoming_len, transmits);
    }

    fn build_public_reset(
        &mut self,
        peer_addr: SocketAddr,
        cid: &ConnectionId,
        ietf: bool,
        incoming_len: usize,
        transmits: &mut VecDeque<Transmit>,
    ) {
        let contents = if ietf {
            // Pad to at most one byte smaller than the inciting packet to
            // prevent reset loops and amplification.
            let max_padding_len = match incoming_len.checked_sub(RESET_TOKEN_SIZE) {
                Some(headroom) if headroom > MIN_PADDING_LEN => headroom - 1,
                _ => {
                    debug!(
                        len = incoming_len,
                        "inciting packet not larger than minimum stateless reset size"
                    );
                    return;
                }
            };
            let padding_len = if max_padding_len <= IDEAL_MIN_PADDING_LEN {
                max_padding_len
            } else {
                self.rng.gen_range(IDEAL_MIN_PADDING_LEN..max_padding_len)
            };
            let mut buf = vec![0; padding_len];
            self.rng.fill_bytes(&mut buf);
            buf[0] = 0b0100_0000 | buf[0] >> 2;
            buf.extend_from_slice(&crypto::reset_token(&self.reset_key, cid));
            debug_assert!(buf.len() < incoming_len);
            buf
        } else {
            let mut buf = vec![0x0a]; // reset flag + 8-byte connection ID flag
            buf.extend_from_slice(cid);
            // A minimal PRST message carrying only the nonce proof.
            buf.extend_from_slice(b"PRST");
            buf.extend_from_slice(&1u16.to_le_bytes());
            buf.extend_from_slice(&0u16.to_le_bytes());
            buf.extend_from_slice(b"RNON");
            buf.extend_from_slice(&8u32.to_le_bytes());
            let mut nonce = [0u8; 8];
            self.rng.fill_bytes(&mut nonce);
            buf.extend_from_slice(&nonce);
            buf
        };
        debug!(connection = %cid, to = %peer_addr, "sending stateless reset");
        transmits.push_back(Transmit {
            destination: peer_addr,
            contents,
        });
    }

    pub fn next_expiry(&self) -> Option<Instant> {
        let cid = self.expiry_order.front()?;
        self.entries.get(cid).map(|entry| entry.expiry)
    }

    /// Drop entries whose time-wait period has elapsed
    pub fn expire_before(&mut self, now: Instant) {
        while let Some(cid) = self.expiry_order.front() {
            match self.entries.get(cid) {
                Some(entry) if entry.expiry <= now => {
                    trace!(connection = %cid, "connection ID left time-wait");
                    let cid = *cid;
                    self.entries.remove(&cid);
                    self.expiry_order.pop_front();
                }
                Some(_) => break,
                None => {
                    self.expiry_order.pop_front();
                }
            }
        }
    }
}
