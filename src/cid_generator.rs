use std::hash::Hasher;

use siphasher::sip::SipHasher13;

use crate::shared::ConnectionId;
use crate::version::Version;
use crate::MAX_CID_SIZE;

/// Chooses the server connection ID a session is created under
///
/// The dispatcher consults this when an incoming server connection ID does
/// not have the length the routing layer expects.
pub trait ConnectionIdGenerator: Send {
    /// Returns the replacement for `cid`, or `None` to keep it as-is
    ///
    /// Must be pure: equal inputs must yield equal outputs, or packets sent
    /// to the replaced ID would stop routing to their session.
    fn maybe_replace_connection_id(
        &mut self,
        cid: &ConnectionId,
        version: Version,
    ) -> Option<ConnectionId>;
}

// Fixed SipHash keys; the derivation only needs to be stable and
// well-distributed, not secret.
const SIPHASH_KEY: (u64, u64) = (0x4855_4c54_4f4e_4d49, 0x4449_5350_4154_4348);

/// Deterministically expand or contract a connection ID to `expected_len`
pub fn replacement_connection_id(cid: &ConnectionId, expected_len: usize) -> ConnectionId {
    debug_assert!(expected_len <= MAX_CID_SIZE);
    let mut bytes = [0u8; MAX_CID_SIZE];
    let mut filled = 0;
    let mut counter = 0u32;
    while filled < expected_len {
        let mut hasher = SipHasher13::new_with_keys(SIPHASH_KEY.0, SIPHASH_KEY.1);
        hasher.write(&counter.to_be_bytes());
        hasher.write(cid);
        let block = hasher.finish().to_be_bytes();
        let n = ::std::cmp::min(block.len(), expected_len - filled);
        bytes[filled..filled + n].copy_from_slice(&block[..n]);
        filled += n;
        counter += 1;
    }
    ConnectionId::new(&bytes[..expected_len])
}

/// The default generator: replace IDs whose length differs from the expected
/// server connection ID length, for versions that permit variable lengths
#[derive(Debug, Clone, Copy)]
pub struct DeterministicConnectionIdGenerator {
    expected_len: usize,
}

impl DeterministicConnectionIdGenerator {
    pub fn new(expected_len: usize) -> Self {
        debug_assert!(expected_len <= MAX_CID_SIZE);
        Self { expected_len }
    }
}

impl ConnectionIdGenerator for DeterministicConnectionIdGenerator {
    fn maybe_replace_connection_id(
        &mut self,
        cid: &ConnectionId,
        version: Version,
    ) -> Option<ConnectionId> {
        if cid.len() == self.expected_len || !version.allows_variable_length_connection_ids() {
            return None;
        }
        Some(replacement_connection_id(cid, self.expected_len))
    }
}
