use std::collections::BTreeMap;
use std::io;

use bytes::{Buf, Bytes};
use tracing::trace;

use crate::coding::BufExt;
use crate::crypto;
use crate::version::Version;

/// TLS alert descriptions the extractor can raise
pub(crate) mod alert {
    pub const UNEXPECTED_MESSAGE: u8 = 10;
    pub const ILLEGAL_PARAMETER: u8 = 47;
    pub const DECODE_ERROR: u8 = 50;
    pub const INTERNAL_ERROR: u8 = 80;
}

/// Human-readable name for a TLS alert description byte
pub(crate) fn alert_description(alert: u8) -> &'static str {
    match alert {
        10 => "unexpected_message",
        47 => "illegal_parameter",
        50 => "decode_error",
        80 => "internal_error",
        _ => "unknown alert",
    }
}

/// Progress of TLS client hello extraction for one connection ID
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TlsChloState {
    /// No usable handshake bytes seen yet
    Initial,
    /// Some of the ClientHello has arrived, but not all of it
    ParsedPartialChlo,
    /// The full ClientHello has been parsed
    ParsedFullChlo,
    /// A fatal alert was raised while parsing; terminal
    Alert,
}

/// Incremental extractor for a TLS ClientHello spread over Initial packets
///
/// Ingestion is deterministic and cumulative: replaying the same packets in
/// any order reaches the same terminal state. Once the state is terminal
/// (`ParsedFullChlo` or `Alert`) further ingestion is a no-op.
pub struct TlsChloExtractor {
    state: TlsChloState,
    crypto_stream: CryptoStream,
    alpns: Vec<String>,
    server_name: Option<String>,
    resumption_attempted: bool,
    early_data_attempted: bool,
    tls_alert: Option<u8>,
}

impl Default for TlsChloExtractor {
    fn default() -> Self {
        Self {
            state: TlsChloState::Initial,
            crypto_stream: CryptoStream::default(),
            alpns: Vec::new(),
            server_name: None,
            resumption_attempted: false,
            early_data_attempted: false,
            tls_alert: None,
        }
    }
}

impl TlsChloExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TlsChloState {
        self.state
    }

    pub fn has_parsed_full_chlo(&self) -> bool {
        self.state == TlsChloState::ParsedFullChlo
    }

    pub fn tls_alert(&self) -> Option<u8> {
        self.tls_alert
    }

    pub fn alpns(&self) -> &[String] {
        &self.alpns
    }

    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    pub fn resumption_attempted(&self) -> bool {
        self.resumption_attempted
    }

    pub fn early_data_attempted(&self) -> bool {
        self.early_data_attempted
    }

    /// Feed one datagram to the extractor
    ///
    /// Non-Initial packets, packets of the wrong version, and packets that
    /// fail initial-key decryption are ignored; they may be 0-RTT data or
    /// garbage and do not advance the state machine.
    pub fn ingest_packet(&mut self, version: Version, packet: &[u8]) {
        match self.state {
            TlsChloState::ParsedFullChlo | TlsChloState::Alert => return,
            _ => {}
        }
        let plaintext = match decrypt_initial(version, packet) {
            Some(plaintext) => plaintext,
            None => {
                trace!("ignoring packet that does not decrypt as an Initial");
                return;
            }
        };
        self.process_frames(&plaintext);
        if self.state != TlsChloState::Alert {
            self.try_parse_chlo();
        }
    }

    fn process_frames(&mut self, plaintext: &[u8]) {
        let mut buf = io::Cursor::new(plaintext);
        while buf.has_remaining() {
            let ty = match buf.get_var() {
                Ok(ty) => ty,
                Err(_) => return,
            };
            let ok = match ty {
                0x00 | 0x01 => Ok(()), // PADDING, PING
                0x02 | 0x03 => skip_ack(&mut buf, ty == 0x03),
                0x06 => self.ingest_crypto_frame(&mut buf, plaintext),
                0x1c => skip_connection_close(&mut buf),
                _ => {
                    trace!(frame = ty, "stopping at unexpected frame in Initial");
                    return;
                }
            };
            if ok.is_err() {
                trace!("malformed frame in Initial packet");
                return;
            }
            if self.state == TlsChloState::Alert {
                return;
            }
        }
    }

    fn ingest_crypto_frame(
        &mut self,
        buf: &mut io::Cursor<&[u8]>,
        plaintext: &[u8],
    ) -> Result<(), crate::coding::UnexpectedEnd> {
        let offset = buf.get_var()?;
        let len = buf.get_var()? as usize;
        let start = buf.position() as usize;
        if plaintext.len() < start + len {
            return Err(crate::coding::UnexpectedEnd);
        }
        buf.advance(len);
        if self
            .crypto_stream
            .insert(offset, &plaintext[start..start + len])
            .is_err()
        {
            self.raise_alert(alert::INTERNAL_ERROR);
        }
        Ok(())
    }

    fn try_parse_chlo(&mut self) {
        let data = self.crypto_stream.contiguous();
        if data.len() < 4 {
            if !self.crypto_stream.is_empty() {
                self.state = TlsChloState::ParsedPartialChlo;
            }
            return;
        }
        if data[0] != 0x01 {
            // The first handshake message from a client must be a ClientHello.
            self.raise_alert(alert::UNEXPECTED_MESSAGE);
            return;
        }
        let body_len = u32::from_be_bytes([0, data[1], data[2], data[3]]) as usize;
        if data.len() < 4 + body_len {
            self.state = TlsChloState::ParsedPartialChlo;
            return;
        }
        match parse_client_hello(&data[4..4 + body_len]) {
            Ok(fields) => {
                self.alpns = fields.alpns;
                self.server_name = fields.server_name;
                self.resumption_attempted = fields.resumption_attempted;
                self.early_data_attempted = fields.early_data_attempted;
                self.state = TlsChloState::ParsedFullChlo;
            }
            Err(alert) => self.raise_alert(alert),
        }
    }

    fn raise_alert(&mut self, alert: u8) {
        self.state = TlsChloState::Alert;
        self.tls_alert = Some(alert);
    }
}

fn skip_ack(buf: &mut io::Cursor<&[u8]>, ecn: bool) -> Result<(), crate::coding::UnexpectedEnd> {
    let _largest = buf.get_var()?;
    let _delay = buf.get_var()?;
    let range_count = buf.get_var()?;
    let _first_range = buf.get_var()?;
    for _ in 0..range_count {
        let _gap = buf.get_var()?;
        let _len = buf.get_var()?;
    }
    if ecn {
        for _ in 0..3 {
            let _count = buf.get_var()?;
        }
    }
    Ok(())
}

fn skip_connection_close(
    buf: &mut io::Cursor<&[u8]>,
) -> Result<(), crate::coding::UnexpectedEnd> {
    let _error_code = buf.get_var()?;
    let _frame_type = buf.get_var()?;
    let reason_len = buf.get_var()? as usize;
    if buf.remaining() < reason_len {
        return Err(crate::coding::UnexpectedEnd);
    }
    buf.advance(reason_len);
    Ok(())
}

/// Locate and decrypt the Initial packet at the front of a datagram
fn decrypt_initial(version: Version, packet: &[u8]) -> Option<Vec<u8>> {
    let mut buf = io::Cursor::new(packet);
    let first: u8 = buf.get().ok()?;
    if first & 0x80 == 0 || first & 0x40 == 0 {
        return None;
    }
    if (first & 0x30) >> 4 != 0x0 {
        return None;
    }
    let label: u32 = buf.get().ok()?;
    if label != version.label() {
        return None;
    }
    let dcil: u8 = buf.get().ok()?;
    if dcil as usize > crate::MAX_CID_SIZE || buf.remaining() < dcil as usize {
        return None;
    }
    let dst_start = buf.position() as usize;
    let dst_cid = crate::shared::ConnectionId::new(&packet[dst_start..dst_start + dcil as usize]);
    buf.advance(dcil as usize);
    let scil: u8 = buf.get().ok()?;
    if scil as usize > crate::MAX_CID_SIZE || buf.remaining() < scil as usize {
        return None;
    }
    buf.advance(scil as usize);
    let token_len = buf.get_var().ok()? as usize;
    if buf.remaining() < token_len {
        return None;
    }
    buf.advance(token_len);
    let length = buf.get_var().ok()? as usize;
    let pn_offset = buf.position() as usize;
    if packet.len() < pn_offset + length {
        return None;
    }

    let keys = crypto::initial_keys(version, &dst_cid)?;
    let mut work = packet[..pn_offset + length].to_vec();
    let pn_len = crypto::remove_header_protection(&keys.remote.header, pn_offset, &mut work).ok()?;
    let mut pn = 0u64;
    for &b in &work[pn_offset..pn_offset + pn_len] {
        pn = pn << 8 | u64::from(b);
    }
    let (header, payload) = work.split_at(pn_offset + pn_len);
    let mut payload = payload.to_vec();
    crypto::open(&keys.remote, pn, header, &mut payload).ok()?;
    Some(payload)
}

struct ChloFields {
    server_name: Option<String>,
    alpns: Vec<String>,
    resumption_attempted: bool,
    early_data_attempted: bool,
}

fn parse_client_hello(body: &[u8]) -> Result<ChloFields, u8> {
    let mut buf = io::Cursor::new(body);
    let _legacy_version = get_u16(&mut buf)?;
    skip(&mut buf, 32)?;
    let session_id_len = get_u8(&mut buf)? as usize;
    if session_id_len > 32 {
        return Err(alert::ILLEGAL_PARAMETER);
    }
    skip(&mut buf, session_id_len)?;
    let cipher_suites_len = get_u16(&mut buf)? as usize;
    if cipher_suites_len < 2 || cipher_suites_len % 2 != 0 {
        return Err(alert::DECODE_ERROR);
    }
    skip(&mut buf, cipher_suites_len)?;
    let compression_len = get_u8(&mut buf)? as usize;
    if compression_len < 1 {
        return Err(alert::DECODE_ERROR);
    }
    skip(&mut buf, compression_len)?;

    let mut fields = ChloFields {
        server_name: None,
        alpns: Vec::new(),
        resumption_attempted: false,
        early_data_attempted: false,
    };
    if !buf.has_remaining() {
        return Ok(fields);
    }
    let extensions_len = get_u16(&mut buf)? as usize;
    if buf.remaining() != extensions_len {
        return Err(alert::DECODE_ERROR);
    }
    while buf.has_remaining() {
        let ext_type = get_u16(&mut buf)?;
        let ext_len = get_u16(&mut buf)? as usize;
        if buf.remaining() < ext_len {
            return Err(alert::DECODE_ERROR);
        }
        let ext_start = buf.position() as usize;
        let ext_body = &body[ext_start..ext_start + ext_len];
        buf.advance(ext_len);
        match ext_type {
            0x0000 => fields.server_name = parse_server_name(ext_body)?,
            0x0010 => fields.alpns = parse_alpn(ext_body)?,
            0x0029 => fields.resumption_attempted = true,
            0x002a => fields.early_data_attempted = true,
            _ => {}
        }
    }
    Ok(fields)
}

fn parse_server_name(body: &[u8]) -> Result<Option<String>, u8> {
    let mut buf = io::Cursor::new(body);
    let list_len = get_u16(&mut buf)? as usize;
    if buf.remaining() != list_len {
        return Err(alert::DECODE_ERROR);
    }
    while buf.has_remaining() {
        let name_type = get_u8(&mut buf)?;
        let name_len = get_u16(&mut buf)? as usize;
        if buf.remaining() < name_len {
            return Err(alert::DECODE_ERROR);
        }
        let start = buf.position() as usize;
        let name = &body[start..start + name_len];
        buf.advance(name_len);
        if name_type == 0 {
            let name = ::std::str::from_utf8(name).map_err(|_| alert::ILLEGAL_PARAMETER)?;
            if name.is_empty() {
                return Err(alert::ILLEGAL_PARAMETER);
            }
            return Ok(Some(name.to_string()));
        }
    }
    Ok(None)
}

fn parse_alpn(body: &[u8]) -> Result<Vec<String>, u8> {
    let mut buf = io::Cursor::new(body);
    let list_len = get_u16(&mut buf)? as usize;
    if buf.remaining() != list_len {
        return Err(alert::DECODE_ERROR);
    }
    let mut alpns = Vec::new();
    while buf.has_remaining() {
        let len = get_u8(&mut buf)? as usize;
        if len == 0 || buf.remaining() < len {
            return Err(alert::DECODE_ERROR);
        }
        let start = buf.position() as usize;
        let alpn = &body[start..start + len];
        buf.advance(len);
        alpns.push(
            ::std::str::from_utf8(alpn)
                .map_err(|_| alert::ILLEGAL_PARAMETER)?
                .to_string(),
        );
    }
    Ok(alpns)
}

fn get_u8(buf: &mut io::Cursor<&[u8]>) -> Result<u8, u8> {
    buf.get::<u8>().map_err(|_| alert::DECODE_ERROR)
}

fn get_u16(buf: &mut io::Cursor<&[u8]>) -> Result<u16, u8> {
    buf.get::<u16>().map_err(|_| alert::DECODE_ERROR)
}

fn skip(buf: &mut io::Cursor<&[u8]>, n: usize) -> Result<(), u8> {
    if buf.remaining() < n {
        return Err(alert::DECODE_ERROR);
    }
    buf.advance(n);
    Ok(())
}

// Buffers CRYPTO stream chunks by offset until a contiguous prefix exists.
const MAX_BUFFERED_CRYPTO_BYTES: usize = 64 * 1024;

#[derive(Default)]
struct CryptoStream {
    chunks: BTreeMap<u64, Bytes>,
    buffered: usize,
}

impl CryptoStream {
    fn insert(&mut self, offset: u64, data: &[u8]) -> Result<(), ()> {
        if data.is_empty() {
            return Ok(());
        }
        self.buffered = self.buffered.saturating_add(data.len());
        if self.buffered > MAX_BUFFERED_CRYPTO_BYTES {
            return Err(());
        }
        // Independent of arrival order: a longer chunk at the same offset
        // always wins, and retransmissions carry identical bytes.
        match self.chunks.get(&offset) {
            Some(existing) if existing.len() >= data.len() => {}
            _ => {
                self.chunks.insert(offset, Bytes::copy_from_slice(data));
            }
        }
        Ok(())
    }

    fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn contiguous(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let mut end = 0u64;
        for (&offset, chunk) in &self.chunks {
            if offset > end {
                break;
            }
            let skip = (end - offset) as usize;
            if skip < chunk.len() {
                out.extend_from_slice(&chunk[skip..]);
                end = offset + chunk.len() as u64;
            }
        }
        out
    }
}

/// Build a complete ClientHello handshake message (header included)
#[cfg(test)]
pub(crate) fn build_client_hello(
    sni: Option<&str>,
    alpns: &[&str],
    resumption: bool,
    early_data: bool,
) -> Vec<u8> {
    fn push_extension(out: &mut Vec<u8>, ty: u16, body: &[u8]) {
        out.extend_from_slice(&ty.to_be_bytes());
        out.extend_from_slice(&(body.len() as u16).to_be_bytes());
        out.extend_from_slice(body);
    }

    let mut extensions = Vec::new();
    if let Some(name) = sni {
        let mut ext = Vec::new();
        ext.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        ext.push(0);
        ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
        ext.extend_from_slice(name.as_bytes());
        push_extension(&mut extensions, 0x0000, &ext);
    }
    if !alpns.is_empty() {
        let mut list = Vec::new();
        for alpn in alpns {
            list.push(alpn.len() as u8);
            list.extend_from_slice(alpn.as_bytes());
        }
        let mut ext = Vec::new();
        ext.extend_from_slice(&(list.len() as u16).to_be_bytes());
        ext.extend_from_slice(&list);
        push_extension(&mut extensions, 0x0010, &ext);
    }
    if early_data {
        push_extension(&mut extensions, 0x002a, &[]);
    }
    if resumption {
        push_extension(&mut extensions, 0x0029, &[0, 0]);
    }

    let mut body = Vec::new();
    body.extend_from_slice(&0x0303u16.to_be_bytes());
    body.extend_from_slice(&[0x5a; 32]);
    body.push(0); // no session id
    body.extend_from_slice(&2u16.to_be_bytes());
    body.extend_from_slice(&0x1301u16.to_be_bytes()); // TLS_AES_128_GCM_SHA256
    body.push(1);
    body.push(0); // null compression
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut msg = Vec::new();
    msg.push(0x01);
    msg.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    msg.extend_from_slice(&body);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_stream_reassembles_out_of_order() {
        let mut stream = CryptoStream::default();
        stream.insert(6, b" world").unwrap();
        assert_eq!(stream.contiguous(), b"");
        stream.insert(0, b"hello,").unwrap();
        assert_eq!(stream.contiguous(), b"hello, world");
    }

    #[test]
    fn crypto_stream_tolerates_overlap() {
        let mut stream = CryptoStream::default();
        stream.insert(0, b"hello").unwrap();
        stream.insert(3, b"lo, world").unwrap();
        assert_eq!(stream.contiguous(), b"hello, world");
    }

    #[test]
    fn client_hello_fields() {
        let body = build_client_hello(Some("example.com"), &["h3", "h3-29"], true, false);
        let fields = parse_client_hello(&body[4..]).unwrap();
        assert_eq!(fields.server_name.as_deref(), Some("example.com"));
        assert_eq!(fields.alpns, vec!["h3".to_string(), "h3-29".to_string()]);
        assert!(fields.resumption_attempted);
        assert!(!fields.early_data_attempted);
    }

    #[test]
    fn not_a_client_hello_raises_alert() {
        let mut extractor = TlsChloExtractor::new();
        // ServerHello message type via a hand-fed crypto stream
        extractor.crypto_stream.insert(0, &[0x02, 0, 0, 2, 0, 0]).unwrap();
        extractor.try_parse_chlo();
        assert_eq!(extractor.state(), TlsChloState::Alert);
        assert_eq!(extractor.tls_alert(), Some(alert::UNEXPECTED_MESSAGE));
        // Terminal: further ingestion must not resurrect the extractor.
        extractor.ingest_packet(Version::V1, &[0u8; 64]);
        assert_eq!(extractor.state(), TlsChloState::Alert);
    }

    #[test]
    fn truncated_client_hello_is_partial() {
        let body = build_client_hello(Some("example.com"), &["h3"], false, false);
        let mut extractor = TlsChloExtractor::new();
        extractor.crypto_stream.insert(0, &body[..body.len() - 1]).unwrap();
        extractor.try_parse_chlo();
        assert_eq!(extractor.state(), TlsChloState::ParsedPartialChlo);
        extractor
            .crypto_stream
            .insert(body.len() as u64 - 1, &body[body.len() - 1..])
            .unwrap();
        extractor.try_parse_chlo();
        assert_eq!(extractor.state(), TlsChloState::ParsedFullChlo);
    }
}
