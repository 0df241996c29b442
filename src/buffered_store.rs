use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::chlo::ParsedClientHello;
use crate::shared::ConnectionId;
use crate::tls_chlo::TlsChloExtractor;
use crate::version::Version;

/// Most packets retained per nascent connection
pub const MAX_PACKETS_PER_CONNECTION: usize = 5;
/// Most bytes retained per nascent connection
pub const MAX_BYTES_PER_CONNECTION: usize = 16 * 1024;
/// Most nascent connections tracked at once
pub const MAX_CONNECTIONS: usize = 1024;
/// How long a nascent connection may wait for its handshake to complete
pub const INITIAL_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// A datagram retained for a connection that does not yet have a session
#[derive(Debug, Clone)]
pub struct BufferedPacket {
    pub packet: Bytes,
    pub self_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub receipt_time: Instant,
}

/// Everything buffered for one server connection ID
pub struct BufferedPacketList {
    // The CHLO-bearing packet is stored apart so it is always delivered
    // first, even when it arrived after other packets.
    chlo_packet: Option<BufferedPacket>,
    pub buffered_packets: VecDeque<BufferedPacket>,
    pub parsed_chlo: Option<ParsedClientHello>,
    pub ietf_quic: bool,
    pub version: Version,
    pub tls_chlo_extractor: Option<TlsChloExtractor>,
    creation_time: Instant,
    buffered_bytes: usize,
}

impl BufferedPacketList {
    fn new(now: Instant, ietf_quic: bool, version: Version) -> Self {
        Self {
            chlo_packet: None,
            buffered_packets: VecDeque::new(),
            parsed_chlo: None,
            ietf_quic,
            version,
            tls_chlo_extractor: if version.uses_tls() {
                Some(TlsChloExtractor::new())
            } else {
                None
            },
            creation_time: now,
            buffered_bytes: 0,
        }
    }

    pub fn creation_time(&self) -> Instant {
        self.creation_time
    }

    pub fn num_packets(&self) -> usize {
        self.buffered_packets.len() + self.chlo_packet.iter().count()
    }

    /// The packet whose addresses a new session should be created with
    pub fn first_packet(&self) -> Option<&BufferedPacket> {
        self.chlo_packet.as_ref().or_else(|| self.buffered_packets.front())
    }

    /// All packets in delivery order: the CHLO first, the rest as they arrived
    pub fn into_packets(self) -> VecDeque<BufferedPacket> {
        let mut packets = self.buffered_packets;
        if let Some(chlo) = self.chlo_packet {
            packets.push_front(chlo);
        }
        packets
    }
}

/// Outcome of [`BufferedPacketStore::enqueue_packet`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EnqueuePacketResult {
    Success,
    /// The per-connection packet or byte cap was hit
    TooManyPackets,
    /// A CHLO-bearing packet arrived while the pool was full and nothing
    /// could be evicted to make room
    PoolFull,
    /// The list already holds a parsed CHLO
    ChloAlreadyDelivered,
    /// A non-CHLO packet for an unknown connection arrived while the pool
    /// was full; the store does not evict for such traffic
    Dropped,
}

/// Outcome of feeding a buffered connection's TLS extractor one packet
pub enum TlsExtractionResult {
    FullChlo {
        alpns: Vec<String>,
        sni: Option<String>,
        resumption_attempted: bool,
        early_data_attempted: bool,
    },
    Partial,
    Alert(u8),
}

/// Bounded store of datagrams that arrived before their session existed
///
/// Lists are keyed by server connection ID, bounded per connection and
/// globally, expired on a fixed timeout, and drained in FIFO order of CHLO
/// completion when the dispatcher asks for new connections.
#[derive(Default)]
pub struct BufferedPacketStore {
    lists: HashMap<ConnectionId, BufferedPacketList>,
    // Creation order; the front is always the oldest surviving list.
    arrival_order: VecDeque<ConnectionId>,
    // FIFO of connections whose CHLO is complete and undelivered.
    chlo_order: VecDeque<ConnectionId>,
}

impl BufferedPacketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_buffered_packets(&self, cid: &ConnectionId) -> bool {
        self.lists.contains_key(cid)
    }

    pub fn has_chlo_for_connection(&self, cid: &ConnectionId) -> bool {
        self.lists
            .get(cid)
            .map_or(false, |list| list.parsed_chlo.is_some())
    }

    pub fn has_chlos_buffered(&self) -> bool {
        !self.chlo_order.is_empty()
    }

    pub fn num_connections(&self) -> usize {
        self.lists.len()
    }

    pub fn num_packets(&self) -> usize {
        self.lists.values().map(|list| list.num_packets()).sum()
    }

    pub fn enqueue_packet(
        &mut self,
        now: Instant,
        cid: ConnectionId,
        ietf_quic: bool,
        packet: BufferedPacket,
        version: Version,
        parsed_chlo: Option<ParsedClientHello>,
    ) -> EnqueuePacketResult {
        let is_chlo = parsed_chlo.is_some();
        match self.lists.get(&cid) {
            Some(list) => {
                if is_chlo && list.parsed_chlo.is_some() {
                    return EnqueuePacketResult::ChloAlreadyDelivered;
                }
                if !is_chlo
                    && (list.num_packets() >= MAX_PACKETS_PER_CONNECTION
                        || list.buffered_bytes + packet.packet.len() > MAX_BYTES_PER_CONNECTION)
                {
                    return EnqueuePacketResult::TooManyPackets;
                }
            }
            None => {
                if self.lists.len() >= MAX_CONNECTIONS {
                    if !is_chlo {
                        return EnqueuePacketResult::Dropped;
                    }
                    if !self.evict_oldest_without_chlo() {
                        return EnqueuePacketResult::PoolFull;
                    }
                }
                self.lists
                    .insert(cid, BufferedPacketList::new(now, ietf_quic, version));
                self.arrival_order.push_back(cid);
            }
        }
        let list = self.lists.get_mut(&cid).unwrap();

        // Ingestion is idempotent, so feeding every buffered packet keeps the
        // extractor complete regardless of which path saw the packet first.
        if let Some(extractor) = &mut list.tls_chlo_extractor {
            extractor.ingest_packet(version, &packet.packet);
        }

        list.buffered_bytes += packet.packet.len();
        if is_chlo {
            list.chlo_packet = Some(packet);
            list.parsed_chlo = parsed_chlo;
            self.chlo_order.push_back(cid);
            trace!(connection = %cid, "buffered CHLO");
        } else {
            list.buffered_packets.push_back(packet);
            trace!(connection = %cid, "buffered early packet");
        }
        EnqueuePacketResult::Success
    }

    /// Feed one packet to the TLS extractor owned by `cid`'s list
    pub fn ingest_packet_for_tls_chlo_extraction(
        &mut self,
        cid: &ConnectionId,
        version: Version,
        packet: &[u8],
    ) -> TlsExtractionResult {
        let list = match self.lists.get_mut(cid) {
            Some(list) => list,
            None => {
                debug!(connection = %cid, "no buffered list for TLS extraction");
                return TlsExtractionResult::Partial;
            }
        };
        let extractor = match &mut list.tls_chlo_extractor {
            Some(extractor) => extractor,
            None => return TlsExtractionResult::Partial,
        };
        extractor.ingest_packet(version, packet);
        if extractor.has_parsed_full_chlo() {
            TlsExtractionResult::FullChlo {
                alpns: extractor.alpns().to_vec(),
                sni: extractor.server_name().map(|s| s.to_string()),
                resumption_attempted: extractor.resumption_attempted(),
                early_data_attempted: extractor.early_data_attempted(),
            }
        } else if let Some(alert) = extractor.tls_alert() {
            TlsExtractionResult::Alert(alert)
        } else {
            TlsExtractionResult::Partial
        }
    }

    /// Remove and return everything buffered for `cid`
    pub fn deliver_packets(&mut self, cid: &ConnectionId) -> Option<BufferedPacketList> {
        let list = self.lists.remove(cid)?;
        self.forget(cid);
        Some(list)
    }

    /// Remove and return the next connection whose CHLO is complete, FIFO
    pub fn deliver_packets_for_next_connection(
        &mut self,
    ) -> Option<(ConnectionId, BufferedPacketList)> {
        while let Some(cid) = self.chlo_order.pop_front() {
            if self
                .lists
                .get(&cid)
                .map_or(false, |list| list.parsed_chlo.is_some())
            {
                let list = self.lists.remove(&cid).unwrap();
                self.arrival_order.retain(|c| c != &cid);
                return Some((cid, list));
            }
        }
        None
    }

    pub fn discard_packets(&mut self, cid: &ConnectionId) {
        if self.lists.remove(cid).is_some() {
            self.forget(cid);
        }
    }

    pub fn discard_all_packets(&mut self) {
        self.lists.clear();
        self.arrival_order.clear();
        self.chlo_order.clear();
    }

    /// When the oldest list will expire, if any list exists
    pub fn next_expiry(&self) -> Option<Instant> {
        let cid = self.arrival_order.front()?;
        let list = self.lists.get(cid)?;
        Some(list.creation_time + INITIAL_IDLE_TIMEOUT)
    }

    /// Remove every list whose deadline has passed
    pub fn expire_before(&mut self, now: Instant) -> Vec<(ConnectionId, BufferedPacketList)> {
        let mut expired = Vec::new();
        while let Some(&cid) = self.arrival_order.front() {
            match self.lists.get(&cid) {
                Some(list) if list.creation_time + INITIAL_IDLE_TIMEOUT <= now => {
                    let list = self.lists.remove(&cid).unwrap();
                    self.arrival_order.pop_front();
                    self.chlo_order.retain(|c| c != &cid);
                    expired.push((cid, list));
                }
                Some(_) => break,
                None => {
                    self.arrival_order.pop_front();
                }
            }
        }
        expired
    }

    fn evict_oldest_without_chlo(&mut self) -> bool {
        let victim = self
            .arrival_order
            .iter()
            .find(|cid| {
                self.lists
                    .get(*cid)
                    .map_or(false, |list| list.parsed_chlo.is_none())
            })
            .copied();
        match victim {
            Some(cid) => {
                debug!(connection = %cid, "evicting CHLO-less connection to admit a CHLO");
                self.lists.remove(&cid);
                self.forget(&cid);
                true
            }
            None => false,
        }
    }

    fn forget(&mut self, cid: &ConnectionId) {
        self.arrival_order.retain(|c| c != cid);
        self.chlo_order.retain(|c| c != cid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port)
    }

    fn packet(now: Instant, len: usize) -> BufferedPacket {
        BufferedPacket {
            packet: Bytes::from(vec![0u8; len]),
            self_addr: addr(443),
            peer_addr: addr(40000),
            receipt_time: now,
        }
    }

    fn cid(x: u8) -> ConnectionId {
        ConnectionId::new(&[x; 8])
    }

    #[test]
    fn per_connection_cap() {
        let now = Instant::now();
        let mut store = BufferedPacketStore::new();
        for _ in 0..MAX_PACKETS_PER_CONNECTION {
            assert_eq!(
                store.enqueue_packet(now, cid(1), true, packet(now, 100), Version::Q046, None),
                EnqueuePacketResult::Success
            );
        }
        assert_eq!(
            store.enqueue_packet(now, cid(1), true, packet(now, 100), Version::Q046, None),
            EnqueuePacketResult::TooManyPackets
        );
        assert_eq!(store.num_packets(), MAX_PACKETS_PER_CONNECTION);
    }

    #[test]
    fn pool_cap_and_chlo_eviction() {
        let now = Instant::now();
        let mut store = BufferedPacketStore::new();
        for i in 0..MAX_CONNECTIONS {
            let id = ConnectionId::new(&(i as u64).to_be_bytes());
            assert_eq!(
                store.enqueue_packet(now, id, true, packet(now, 64), Version::Q046, None),
                EnqueuePacketResult::Success
            );
        }
        // Non-CHLO traffic for a new connection is dropped outright.
        assert_eq!(
            store.enqueue_packet(now, cid(0xaa), true, packet(now, 64), Version::Q046, None),
            EnqueuePacketResult::Dropped
        );
        // A CHLO evicts the oldest CHLO-less list instead.
        let oldest = ConnectionId::new(&0u64.to_be_bytes());
        assert_eq!(
            store.enqueue_packet(
                now,
                cid(0xbb),
                true,
                packet(now, 64),
                Version::Q046,
                Some(ParsedClientHello::default()),
            ),
            EnqueuePacketResult::Success
        );
        assert!(!store.has_buffered_packets(&oldest));
        assert!(store.has_chlo_for_connection(&cid(0xbb)));
    }

    #[test]
    fn chlo_delivered_first() {
        let now = Instant::now();
        let mut store = BufferedPacketStore::new();
        store.enqueue_packet(now, cid(7), true, packet(now, 100), Version::Q046, None);
        store.enqueue_packet(
            now,
            cid(7),
            true,
            packet(now, 1200),
            Version::Q046,
            Some(ParsedClientHello::default()),
        );
        let list = store.deliver_packets(&cid(7)).unwrap();
        let packets = list.into_packets();
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].packet.len(), 1200);
        assert!(!store.has_buffered_packets(&cid(7)));
    }

    #[test]
    fn chlo_fifo_across_connections() {
        let now = Instant::now();
        let mut store = BufferedPacketStore::new();
        for &id in &[3u8, 1, 2] {
            store.enqueue_packet(
                now,
                cid(id),
                true,
                packet(now, 1200),
                Version::Q046,
                Some(ParsedClientHello::default()),
            );
        }
        let (first, _) = store.deliver_packets_for_next_connection().unwrap();
        let (second, _) = store.deliver_packets_for_next_connection().unwrap();
        let (third, _) = store.deliver_packets_for_next_connection().unwrap();
        assert_eq!(first, cid(3));
        assert_eq!(second, cid(1));
        assert_eq!(third, cid(2));
        assert!(store.deliver_packets_for_next_connection().is_none());
        assert!(!store.has_chlos_buffered());
    }

    #[test]
    fn second_chlo_rejected() {
        let now = Instant::now();
        let mut store = BufferedPacketStore::new();
        store.enqueue_packet(
            now,
            cid(9),
            true,
            packet(now, 1200),
            Version::Q046,
            Some(ParsedClientHello::default()),
        );
        assert_eq!(
            store.enqueue_packet(
                now,
                cid(9),
                true,
                packet(now, 1200),
                Version::Q046,
                Some(ParsedClientHello::default()),
            ),
            EnqueuePacketResult::ChloAlreadyDelivered
        );
    }

    #[test]
    fn expiry_is_oldest_first() {
        let now = Instant::now();
        let mut store = BufferedPacketStore::new();
        store.enqueue_packet(now, cid(1), true, packet(now, 64), Version::Q046, None);
        let later = now + Duration::from_secs(3);
        store.enqueue_packet(later, cid(2), true, packet(later, 64), Version::Q046, None);
        assert_eq!(store.next_expiry(), Some(now + INITIAL_IDLE_TIMEOUT));

        let expired = store.expire_before(now + INITIAL_IDLE_TIMEOUT);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, cid(1));
        assert!(store.has_buffered_packets(&cid(2)));
        assert_eq!(store.next_expiry(), Some(later + INITIAL_IDLE_TIMEOUT));
    }
}
