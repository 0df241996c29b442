use std::io;

use bytes::{Buf, BufMut, Bytes};
use err_derive::Error;

use crate::coding::{self, BufExt};
use crate::shared::ConnectionId;
use crate::version::Version;
use crate::MAX_CID_SIZE;

/// Which of the three wire layouts a datagram's public header uses
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketForm {
    /// Google-style public header: flags byte, connection ID, optional version
    GoogleQuic,
    /// IETF invariant long header
    IetfLongHeader,
    /// IETF invariant short header
    IetfShortHeader,
}

/// Long-header packet types, meaningful only for known IETF versions
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongPacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

/// Everything the dispatcher learns from a datagram without any crypto
///
/// Produced by [`parse_public_header`], which is stateless and performs no
/// per-connection allocation. The connection IDs and version are untrusted.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedHeader {
    pub form: PacketForm,
    pub long_packet_type: Option<LongPacketType>,
    pub version_flag: bool,
    pub use_length_prefix: bool,
    pub version_label: u32,
    pub version: Version,
    pub dst_cid: ConnectionId,
    pub src_cid: ConnectionId,
    pub retry_token: Option<Bytes>,
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum HeaderParseError {
    #[error(display = "unexpected end of packet")]
    UnexpectedEnd,
    #[error(display = "invalid header: {}", _0)]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for HeaderParseError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        HeaderParseError::UnexpectedEnd
    }
}

const LONG_HEADER_FORM: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
const GOOGLE_HAS_CONNECTION_ID: u8 = 0x08;
const GOOGLE_VERSION_FLAG: u8 = 0x01;
const GOOGLE_RESET_FLAG: u8 = 0x02;

/// Parse the public header of an untrusted datagram
///
/// For the GOOGLE_QUIC form `expected_server_cid_len` is authoritative; for
/// the IETF short header it determines how many octets of connection ID are
/// read; long headers carry their own connection-ID lengths.
pub fn parse_public_header(
    packet: &Bytes,
    expected_server_cid_len: usize,
) -> Result<ParsedHeader, HeaderParseError> {
    let mut buf = io::Cursor::new(&packet[..]);
    let first: u8 = buf.get()?;
    if first & LONG_HEADER_FORM != 0 {
        let version_label: u32 = buf.get()?;
        let version = Version::from_label(version_label);
        let dst_cid = get_prefixed_cid(&mut buf)?;
        let src_cid = get_prefixed_cid(&mut buf)?;

        let long_packet_type = if version_label == 0 || !version.is_known() {
            None
        } else {
            if first & FIXED_BIT == 0 {
                return Err(HeaderParseError::InvalidHeader("fixed bit unset"));
            }
            Some(match (first & 0x30) >> 4 {
                0x0 => LongPacketType::Initial,
                0x1 => LongPacketType::ZeroRtt,
                0x2 => LongPacketType::Handshake,
                0x3 => LongPacketType::Retry,
                _ => unreachable!(),
            })
        };

        let retry_token = if version.uses_tls() && long_packet_type == Some(LongPacketType::Initial)
        {
            let token_len = buf.get_var()? as usize;
            let token_start = buf.position() as usize;
            if buf.remaining() < token_len {
                return Err(HeaderParseError::UnexpectedEnd);
            }
            buf.advance(token_len);
            Some(packet.slice(token_start..token_start + token_len))
        } else {
            None
        };

        Ok(ParsedHeader {
            form: PacketForm::IetfLongHeader,
            long_packet_type,
            version_flag: true,
            use_length_prefix: version.has_length_prefixed_connection_ids() || !version.is_known(),
            version_label,
            version,
            dst_cid,
            src_cid,
            retry_token,
        })
    } else if first & FIXED_BIT != 0 {
        let dst_cid = get_cid(&mut buf, expected_server_cid_len)?;
        Ok(ParsedHeader {
            form: PacketForm::IetfShortHeader,
            long_packet_type: None,
            version_flag: false,
            use_length_prefix: false,
            version_label: 0,
            version: Version::Unknown(0),
            dst_cid,
            src_cid: ConnectionId::EMPTY,
            retry_token: None,
        })
    } else if first & GOOGLE_HAS_CONNECTION_ID != 0 {
        if first & GOOGLE_RESET_FLAG != 0 {
            return Err(HeaderParseError::InvalidHeader(
                "reset flag set on inbound packet",
            ));
        }
        let dst_cid = get_cid(&mut buf, expected_server_cid_len)?;
        let version_flag = first & GOOGLE_VERSION_FLAG != 0;
        let (version_label, version) = if version_flag {
            let label: u32 = buf.get()?;
            (label, Version::from_label(label))
        } else {
            (0, Version::Unknown(0))
        };
        Ok(ParsedHeader {
            form: PacketForm::GoogleQuic,
            long_packet_type: None,
            version_flag,
            use_length_prefix: false,
            version_label,
            version,
            dst_cid,
            src_cid: ConnectionId::EMPTY,
            retry_token: None,
        })
    } else {
        Err(HeaderParseError::InvalidHeader("invalid flags"))
    }
}

fn get_prefixed_cid(
    buf: &mut io::Cursor<&[u8]>,
) -> Result<ConnectionId, HeaderParseError> {
    let len: u8 = buf.get()?;
    if len as usize > MAX_CID_SIZE {
        return Err(HeaderParseError::InvalidHeader("illegal connection ID length"));
    }
    get_cid(buf, len as usize)
}

fn get_cid(
    buf: &mut io::Cursor<&[u8]>,
    len: usize,
) -> Result<ConnectionId, HeaderParseError> {
    if len > MAX_CID_SIZE {
        return Err(HeaderParseError::InvalidHeader("illegal connection ID length"));
    }
    if buf.remaining() < len {
        return Err(HeaderParseError::UnexpectedEnd);
    }
    let start = buf.position() as usize;
    let cid = ConnectionId::new(&buf.get_ref()[start..start + len]);
    buf.advance(len);
    Ok(cid)
}

/// Encode a version negotiation packet
///
/// `dst_cid` must be the client's source connection ID and `src_cid` the
/// connection ID the client addressed us with, so the client can match the
/// reply to its connection attempt. An empty `versions` list produces the
/// "no common version" termination packet.
pub fn build_version_negotiation(
    random: u8,
    dst_cid: &ConnectionId,
    src_cid: &ConnectionId,
    ietf: bool,
    use_length_prefix: bool,
    versions: &[Version],
) -> Vec<u8> {
    let mut buf = Vec::new();
    if ietf {
        buf.put_u8(LONG_HEADER_FORM | (random & 0x7f));
        buf.put_u32(0);
        if use_length_prefix {
            buf.put_u8(dst_cid.len() as u8);
            buf.put_slice(dst_cid);
            buf.put_u8(src_cid.len() as u8);
            buf.put_slice(src_cid);
        } else {
            buf.put_u8(nibble_len(dst_cid.len()) << 4 | nibble_len(src_cid.len()));
            buf.put_slice(dst_cid);
            buf.put_slice(src_cid);
        }
    } else {
        buf.put_u8(GOOGLE_VERSION_FLAG | GOOGLE_HAS_CONNECTION_ID);
        buf.put_slice(src_cid);
    }
    for version in versions {
        buf.put_u32(version.label());
    }
    buf
}

/// Decode a version negotiation packet built by [`build_version_negotiation`]
///
/// Returns the destination CID, source CID, and the advertised version labels.
pub fn parse_version_negotiation(
    packet: &[u8],
    ietf: bool,
    use_length_prefix: bool,
) -> Result<(ConnectionId, ConnectionId, Vec<u32>), HeaderParseError> {
    let mut buf = io::Cursor::new(packet);
    let first: u8 = buf.get()?;
    let (dst_cid, src_cid) = if ietf {
        if first & LONG_HEADER_FORM == 0 {
            return Err(HeaderParseError::InvalidHeader("not a long header"));
        }
        let version: u32 = buf.get()?;
        if version != 0 {
            return Err(HeaderParseError::InvalidHeader("nonzero version"));
        }
        if use_length_prefix {
            (get_prefixed_cid(&mut buf)?, get_prefixed_cid(&mut buf)?)
        } else {
            let nibbles: u8 = buf.get()?;
            let dst = get_cid(&mut buf, nibble_to_len(nibbles >> 4))?;
            let src = get_cid(&mut buf, nibble_to_len(nibbles & 0x0f))?;
            (dst, src)
        }
    } else {
        if first & (GOOGLE_VERSION_FLAG | GOOGLE_HAS_CONNECTION_ID)
            != GOOGLE_VERSION_FLAG | GOOGLE_HAS_CONNECTION_ID
        {
            return Err(HeaderParseError::InvalidHeader("not a version packet"));
        }
        (ConnectionId::EMPTY, get_cid(&mut buf, 8)?)
    };
    let mut labels = Vec::new();
    while buf.has_remaining() {
        labels.push(buf.get::<u32>()?);
    }
    Ok((dst_cid, src_cid, labels))
}

fn nibble_len(len: usize) -> u8 {
    if len == 0 {
        0
    } else {
        debug_assert!(len >= 3);
        (len - 3) as u8
    }
}

fn nibble_to_len(nibble: u8) -> usize {
    if nibble == 0 {
        0
    } else {
        nibble as usize + 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::SUPPORTED_VERSIONS;

    fn parse(bytes: &[u8], cid_len: usize) -> Result<ParsedHeader, HeaderParseError> {
        parse_public_header(&Bytes::copy_from_slice(bytes), cid_len)
    }

    #[test]
    fn short_header() {
        let mut packet = vec![0x40];
        packet.extend_from_slice(&[0xab; 8]);
        packet.extend_from_slice(&[0; 20]);
        let hdr = parse(&packet, 8).unwrap();
        assert_eq!(hdr.form, PacketForm::IetfShortHeader);
        assert!(!hdr.version_flag);
        assert_eq!(hdr.dst_cid, ConnectionId::new(&[0xab; 8]));
    }

    #[test]
    fn long_header_initial() {
        let mut packet = vec![0xc0];
        packet.extend_from_slice(&0x0000_0001u32.to_be_bytes());
        packet.push(8);
        packet.extend_from_slice(&[0x01; 8]);
        packet.push(4);
        packet.extend_from_slice(&[0x02; 4]);
        packet.push(0); // token length
        packet.extend_from_slice(&[0; 32]);
        let hdr = parse(&packet, 8).unwrap();
        assert_eq!(hdr.form, PacketForm::IetfLongHeader);
        assert_eq!(hdr.long_packet_type, Some(LongPacketType::Initial));
        assert_eq!(hdr.version, Version::V1);
        assert_eq!(hdr.dst_cid.len(), 8);
        assert_eq!(hdr.src_cid.len(), 4);
        assert_eq!(hdr.retry_token.as_deref(), Some(&[][..]));
    }

    #[test]
    fn long_header_cid_too_long() {
        let mut packet = vec![0xc0];
        packet.extend_from_slice(&0x0000_0001u32.to_be_bytes());
        packet.push(21);
        packet.extend_from_slice(&[0x01; 21]);
        packet.push(0);
        assert_eq!(
            parse(&packet, 8),
            Err(HeaderParseError::InvalidHeader("illegal connection ID length"))
        );
    }

    #[test]
    fn google_quic_header() {
        let mut packet = vec![0x09];
        packet.extend_from_slice(&[0x07; 8]);
        packet.extend_from_slice(&0x5130_3433u32.to_be_bytes());
        packet.extend_from_slice(&[0; 16]);
        let hdr = parse(&packet, 8).unwrap();
        assert_eq!(hdr.form, PacketForm::GoogleQuic);
        assert!(hdr.version_flag);
        assert_eq!(hdr.version, Version::Q043);
        assert_eq!(hdr.dst_cid, ConnectionId::new(&[0x07; 8]));
    }

    #[test]
    fn rejects_garbage_flags() {
        assert_eq!(
            parse(&[0x00, 0x01, 0x02], 8),
            Err(HeaderParseError::InvalidHeader("invalid flags"))
        );
    }

    #[test]
    fn version_negotiation_roundtrip() {
        let dst = ConnectionId::new(&[1, 2, 3, 4]);
        let src = ConnectionId::new(&[5, 6, 7, 8, 9, 10, 11, 12]);
        for &use_length_prefix in &[true, false] {
            let packet = build_version_negotiation(
                0x5a,
                &dst,
                &src,
                true,
                use_length_prefix,
                &SUPPORTED_VERSIONS,
            );
            let (d, s, labels) =
                parse_version_negotiation(&packet, true, use_length_prefix).unwrap();
            assert_eq!(d, dst);
            assert_eq!(s, src);
            let expected: Vec<u32> = SUPPORTED_VERSIONS.iter().map(|v| v.label()).collect();
            assert_eq!(labels, expected);
        }
    }
}
