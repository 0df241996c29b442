use std::fmt;

/// A QUIC version understood well enough to make routing decisions about
///
/// The dispatcher never negotiates or speaks a version itself; it only needs
/// each version's invariants: which header form it uses, whether its
/// handshake is TLS-based, and what connection-ID shapes it permits.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Version {
    /// QUIC v1 (RFC 9000)
    V1,
    /// IETF draft 29
    Draft29,
    /// Google QUIC Q050: IETF invariant header, legacy crypto handshake
    Q050,
    /// Google QUIC Q046: IETF invariant header, legacy crypto handshake
    Q046,
    /// Google QUIC Q043: Google-style public header, legacy crypto handshake
    Q043,
    /// A version label we do not recognise
    Unknown(u32),
}

impl Version {
    pub fn from_label(label: u32) -> Self {
        use self::Version::*;
        match label {
            0x0000_0001 => V1,
            0xff00_001d => Draft29,
            0x5130_3530 => Q050,
            0x5130_3436 => Q046,
            0x5130_3433 => Q043,
            other => Unknown(other),
        }
    }

    pub fn label(self) -> u32 {
        use self::Version::*;
        match self {
            V1 => 0x0000_0001,
            Draft29 => 0xff00_001d,
            Q050 => 0x5130_3530,
            Q046 => 0x5130_3436,
            Q043 => 0x5130_3433,
            Unknown(other) => other,
        }
    }

    pub fn is_known(self) -> bool {
        match self {
            Version::Unknown(_) => false,
            _ => true,
        }
    }

    /// Whether the handshake is a TLS ClientHello rather than a tag/value CHLO
    pub fn uses_tls(self) -> bool {
        match self {
            Version::V1 | Version::Draft29 => true,
            _ => false,
        }
    }

    /// Whether packets use the IETF invariant header layout
    pub fn has_ietf_invariant_header(self) -> bool {
        match self {
            Version::Q043 => false,
            _ => true,
        }
    }

    /// Whether version negotiation packets for this version carry
    /// length-prefixed connection IDs
    pub fn has_length_prefixed_connection_ids(self) -> bool {
        self.uses_tls()
    }

    /// Whether clients may pick server connection IDs of arbitrary length
    pub fn allows_variable_length_connection_ids(self) -> bool {
        self.uses_tls()
    }

    /// Whether the version carries a client-chosen source connection ID that
    /// must satisfy the same length limits as the destination
    pub fn supports_client_connection_ids(self) -> bool {
        self.uses_tls()
    }

    /// Whether a server connection ID of `len` octets is acceptable on the wire
    pub fn is_valid_connection_id_length(self, len: usize) -> bool {
        if self.allows_variable_length_connection_ids() {
            len <= crate::MAX_CID_SIZE
        } else {
            len == 8
        }
    }

    /// The version used as the outer shell for legacy version encapsulation
    pub fn legacy_encapsulation() -> Version {
        Version::Q043
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::Version::*;
        match *self {
            V1 => write!(f, "v1"),
            Draft29 => write!(f, "draft-29"),
            Q050 => write!(f, "Q050"),
            Q046 => write!(f, "Q046"),
            Q043 => write!(f, "Q043"),
            Unknown(label) => write!(f, "unknown({:#010x})", label),
        }
    }
}

/// Every version this crate can route for, most preferred first
pub const SUPPORTED_VERSIONS: [Version; 5] = [
    Version::V1,
    Version::Draft29,
    Version::Q050,
    Version::Q046,
    Version::Q043,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_roundtrip() {
        for &v in &SUPPORTED_VERSIONS {
            assert_eq!(Version::from_label(v.label()), v);
            assert!(v.is_known());
        }
        assert_eq!(
            Version::from_label(0xbaba_baba),
            Version::Unknown(0xbaba_baba)
        );
    }

    #[test]
    fn invariants() {
        assert!(Version::V1.uses_tls());
        assert!(!Version::Q050.uses_tls());
        assert!(!Version::Q043.has_ietf_invariant_header());
        assert!(Version::Q046.has_ietf_invariant_header());
        assert!(Version::V1.is_valid_connection_id_length(0));
        assert!(Version::V1.is_valid_connection_id_length(20));
        assert!(!Version::V1.is_valid_connection_id_length(21));
        assert!(Version::Q043.is_valid_connection_id_length(8));
        assert!(!Version::Q043.is_valid_connection_id_length(9));
    }
}
