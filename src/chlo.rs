use std::io;

use bytes::{Buf, Bytes};

use crate::coding::BufExt;

/// The routing-relevant contents of a client hello, either form
///
/// Produced by the legacy tag/value extractor or the TLS extractor; consumed
/// by session creation. Fields that only one handshake form can produce are
/// left at their defaults by the other.
#[derive(Debug, Clone, Default)]
pub struct ParsedClientHello {
    pub sni: Option<String>,
    pub uaid: Option<String>,
    pub alpns: Vec<String>,
    pub retry_token: Option<Bytes>,
    pub resumption_attempted: bool,
    pub early_data_attempted: bool,
    pub legacy_version_encapsulation_inner_packet: Option<Bytes>,
}

pub(crate) const TAG_CHLO: u32 = tag(b"CHLO");
pub(crate) const TAG_SNI: u32 = tag(b"SNI\0");
pub(crate) const TAG_UAID: u32 = tag(b"UAID");
pub(crate) const TAG_ALPN: u32 = tag(b"ALPN");
pub(crate) const TAG_QLVE: u32 = tag(b"QLVE");

const fn tag(x: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*x)
}

// A handshake message carries at most this many tag/value pairs; anything
// larger is treated as garbage rather than parsed.
const MAX_ENTRIES: usize = 128;

/// A client hello in the legacy tag/value form
#[derive(Debug, Clone, Default)]
pub struct LegacyChlo {
    pub sni: Option<String>,
    pub uaid: Option<String>,
    pub alpn: Option<String>,
    pub legacy_version_encapsulation_inner_packet: Option<Bytes>,
}

/// Attempt single-shot extraction of a legacy CHLO from a datagram
///
/// Returns `None` if the datagram does not contain a complete, well-formed
/// CHLO message; the caller treats that as "not yet a CHLO" and buffers the
/// packet. The message is located by its `CHLO` tag so that the surrounding
/// stream framing does not need to be reproduced here.
pub fn extract_chlo(packet: &Bytes) -> Option<LegacyChlo> {
    let start = packet
        .windows(4)
        .position(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]) == TAG_CHLO)?;
    parse_message(packet, start)
}

fn parse_message(packet: &Bytes, start: usize) -> Option<LegacyChlo> {
    let mut buf = io::Cursor::new(&packet[start..]);
    let _message_tag: u32 = buf.get().ok()?;
    let num_entries: u16 = read_le16(&mut buf)?;
    let _padding: u16 = read_le16(&mut buf)?;
    if num_entries as usize > MAX_ENTRIES {
        return None;
    }

    let mut entries = Vec::with_capacity(num_entries as usize);
    let mut last_offset = 0u32;
    for _ in 0..num_entries {
        let entry_tag = read_le32(&mut buf)?;
        let end_offset = read_le32(&mut buf)?;
        if end_offset < last_offset {
            return None;
        }
        entries.push((entry_tag, last_offset, end_offset));
        last_offset = end_offset;
    }

    let values_start = start + buf.position() as usize;
    if packet.len() < values_start + last_offset as usize {
        return None;
    }

    let mut chlo = LegacyChlo::default();
    for (entry_tag, value_start, value_end) in entries {
        let value =
            packet.slice(values_start + value_start as usize..values_start + value_end as usize);
        match entry_tag {
            TAG_SNI => chlo.sni = Some(String::from_utf8(value.to_vec()).ok()?),
            TAG_UAID => chlo.uaid = Some(String::from_utf8(value.to_vec()).ok()?),
            TAG_ALPN => chlo.alpn = Some(String::from_utf8(value.to_vec()).ok()?),
            TAG_QLVE => chlo.legacy_version_encapsulation_inner_packet = Some(value),
            _ => {}
        }
    }
    Some(chlo)
}

fn read_le16(buf: &mut io::Cursor<&[u8]>) -> Option<u16> {
    if buf.remaining() < 2 {
        return None;
    }
    Some(buf.get_u16_le())
}

fn read_le32(buf: &mut io::Cursor<&[u8]>) -> Option<u32> {
    if buf.remaining() < 4 {
        return None;
    }
    Some(buf.get_u32_le())
}

/// Serialize a legacy CHLO message; used when crafting handshakes in tests
#[cfg(test)]
pub(crate) fn build_chlo(entries: &[(u32, &[u8])]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&TAG_CHLO.to_le_bytes());
    buf.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    buf.extend_from_slice(&0u16.to_le_bytes());
    let mut offset = 0u32;
    for (entry_tag, value) in entries {
        offset += value.len() as u32;
        buf.extend_from_slice(&entry_tag.to_le_bytes());
        buf.extend_from_slice(&offset.to_le_bytes());
    }
    for (_, value) in entries {
        buf.extend_from_slice(value);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fields() {
        let mut packet = vec![0u8; 9]; // simulated framing ahead of the message
        packet.extend_from_slice(&build_chlo(&[
            (TAG_SNI, b"example.com"),
            (TAG_ALPN, b"h3-29"),
            (TAG_UAID, b"test agent"),
        ]));
        let chlo = extract_chlo(&Bytes::from(packet)).unwrap();
        assert_eq!(chlo.sni.as_deref(), Some("example.com"));
        assert_eq!(chlo.alpn.as_deref(), Some("h3-29"));
        assert_eq!(chlo.uaid.as_deref(), Some("test agent"));
        assert!(chlo.legacy_version_encapsulation_inner_packet.is_none());
    }

    #[test]
    fn rejects_truncated_values() {
        let mut packet = build_chlo(&[(TAG_SNI, b"example.com")]);
        packet.truncate(packet.len() - 4);
        assert!(extract_chlo(&Bytes::from(packet)).is_none());
    }

    #[test]
    fn no_chlo_tag_is_not_a_chlo() {
        assert!(extract_chlo(&Bytes::from_static(&[0x55; 64])).is_none());
    }

    #[test]
    fn qlve_value_is_binary() {
        let inner = [0x09, 1, 2, 3, 4, 5, 6, 7, 8];
        let packet = build_chlo(&[(TAG_QLVE, &inner)]);
        let chlo = extract_chlo(&Bytes::from(packet)).unwrap();
        assert_eq!(
            chlo.legacy_version_encapsulation_inner_packet.as_deref(),
            Some(&inner[..])
        );
    }
}
