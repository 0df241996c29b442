use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::coding::BufMutExt;
use crate::crypto;
use crate::shared::{ConnectionId, ErrorCode};
use crate::time_wait::{TimeWaitAction, TimeWaitConnectionInfo, TimeWaitList};
use crate::version::Version;

/// Statelessly close a connection that never had (or no longer has) a session
///
/// Builds exactly one CONNECTION_CLOSE packet encrypted under the initial
/// keys derived from `original_cid` and registers every active connection ID
/// under `SendTerminationPackets`. Versions without initial keys fall back to
/// the stateless-reset action, since no close packet the peer could decrypt
/// exists.
pub(crate) fn close_connection(
    now: Instant,
    time_wait: &mut TimeWaitList,
    server_cid: &ConnectionId,
    original_cid: &ConnectionId,
    version: Version,
    error: ErrorCode,
    reason: &str,
    active_connection_ids: Vec<ConnectionId>,
) {
    debug!(
        connection = %server_cid,
        %version,
        %error,
        reason,
        "statelessly terminating connection"
    );
    match build_connection_close_packet(server_cid, original_cid, version, error, reason) {
        Some(packet) => {
            time_wait.add_connection_ids(
                now,
                TimeWaitAction::SendTerminationPackets,
                TimeWaitConnectionInfo {
                    ietf_quic: version.has_ietf_invariant_header(),
                    termination_packets: vec![packet],
                    connection_ids: active_connection_ids,
                    srtt: Duration::from_millis(0),
                },
            );
        }
        None => {
            trace!(%version, "no initial keys; recording reset action instead");
            time_wait.add_connection_ids(
                now,
                TimeWaitAction::SendStatelessReset,
                TimeWaitConnectionInfo {
                    ietf_quic: version.has_ietf_invariant_header(),
                    termination_packets: Vec::new(),
                    connection_ids: active_connection_ids,
                    srtt: Duration::from_millis(0),
                },
            );
        }
    }
}

/// Serialize and seal a single Initial packet carrying one CONNECTION_CLOSE
pub(crate) fn build_connection_close_packet(
    server_cid: &ConnectionId,
    original_cid: &ConnectionId,
    version: Version,
    error: ErrorCode,
    reason: &str,
) -> Option<Bytes> {
    let keys = crypto::initial_keys(version, original_cid)?;

    let mut payload = Vec::new();
    payload.write_var(0x1c); // CONNECTION_CLOSE, transport variant
    payload.write_var(error.wire_code());
    payload.write_var(0); // offending frame type: unknown
    payload.write_var(reason.len() as u64);
    payload.extend_from_slice(reason.as_bytes());
    // Leave room for the header-protection sample.
    while payload.len() < 4 {
        payload.push(0); // PADDING
    }

    let mut header = Vec::new();
    header.push(0xc0); // long header, fixed bit, Initial, 1-byte packet number
    header.extend_from_slice(&version.label().to_be_bytes());
    header.push(0); // no destination CID: the client's IDs are unknown here
    header.push(server_cid.len() as u8);
    header.extend_from_slice(server_cid);
    header.write_var(0); // token length
    header.write_var(1 + payload.len() as u64 + 16); // pn + payload + tag
    let pn_offset = header.len();
    header.push(0); // packet number 0

    crypto::seal(&keys.local, 0, &header, &mut payload);

    let mut packet = header;
    packet.extend_from_slice(&payload);
    crypto::apply_header_protection(&keys.local.header, pn_offset, &mut packet);
    Some(Bytes::from(packet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::BufExt;
    use std::io;

    #[test]
    fn close_packet_roundtrips_under_initial_keys() {
        let server_cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        let original = ConnectionId::new(&[0xca, 0xfe, 0xba, 0xbe, 0, 0, 0, 0]);
        let packet = build_connection_close_packet(
            &server_cid,
            &original,
            Version::V1,
            ErrorCode::HandshakeFailed,
            "Connection ID collision, please retry",
        )
        .unwrap();

        // Decrypt as the client would: initial keys from the original CID,
        // server direction.
        let keys = crypto::initial_keys(Version::V1, &original).unwrap();
        let mut work = packet.to_vec();
        // fixed header + dcil(0) + scil + scid + token len + 1-byte length varint
        let pn_offset = 1 + 4 + 1 + 1 + server_cid.len() + 1 + 1;
        let pn_len =
            crypto::remove_header_protection(&keys.local.header, pn_offset, &mut work).unwrap();
        assert_eq!(pn_len, 1);
        let (header, payload) = work.split_at(pn_offset + pn_len);
        let mut payload = payload.to_vec();
        crypto::open(&keys.local, 0, header, &mut payload).unwrap();

        let mut buf = io::Cursor::new(&payload[..]);
        assert_eq!(buf.get_var().unwrap(), 0x1c);
        assert_eq!(
            buf.get_var().unwrap(),
            ErrorCode::HandshakeFailed.wire_code()
        );
        assert_eq!(buf.get_var().unwrap(), 0);
        let reason_len = buf.get_var().unwrap() as usize;
        let start = buf.position() as usize;
        assert_eq!(
            &payload[start..start + reason_len],
            b"Connection ID collision, please retry"
        );
    }

    #[test]
    fn no_close_packet_without_initial_keys() {
        let cid = ConnectionId::new(&[1; 8]);
        assert!(build_connection_close_packet(
            &cid,
            &cid,
            Version::Q043,
            ErrorCode::HandshakeFailed,
            "reject",
        )
        .is_none());
    }
}
