use std::time::Duration;

use err_derive::Error;
use rand::RngCore;

use crate::version::{Version, SUPPORTED_VERSIONS};
use crate::MAX_CID_SIZE;

/// Parameters governing the dispatcher, fixed at construction
pub struct DispatchConfig {
    /// Versions the server will create sessions for, most preferred first
    pub supported_versions: Vec<Version>,
    /// ALPN values the server's applications speak, used to pick among the
    /// client's offers
    pub supported_alpns: Vec<String>,
    /// Length of server connection IDs issued by this endpoint, 0–20
    pub expected_server_connection_id_length: usize,
    /// Adopt the length of the first observed destination connection ID
    /// instead of enforcing the expected length
    pub should_update_expected_server_connection_id_length: bool,
    /// Accept initial server connection IDs shorter than eight octets
    pub allow_short_initial_server_connection_ids: bool,
    /// Private key for stateless reset tokens; peers who talked to a
    /// previous instance of this endpoint can recognise its resets
    pub reset_key: Vec<u8>,
    /// Buffer packets that arrive before their connection's CHLO completes
    pub allow_chlo_buffering: bool,
    /// Disable extraction and re-dispatch of legacy-version-encapsulated
    /// inner packets
    pub disable_legacy_version_encapsulation: bool,
    /// Route the client-chosen connection ID to the session even after it
    /// was replaced with a server-chosen one
    pub map_original_connection_ids: bool,
    /// Reply to fatal TLS alerts during CHLO extraction with a
    /// CONNECTION_CLOSE instead of dropping silently
    pub send_connection_close_for_tls_alerts: bool,
    /// Most peer addresses remembered for stateless-reset rate limiting
    pub max_recent_stateless_reset_addresses: usize,
    /// How long the recent-reset address set is remembered before it is
    /// cleared wholesale
    pub recent_stateless_reset_addresses_lifetime: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let mut reset_key = vec![0; 64];
        rand::thread_rng().fill_bytes(&mut reset_key);
        Self {
            supported_versions: SUPPORTED_VERSIONS.to_vec(),
            supported_alpns: Vec::new(),
            expected_server_connection_id_length: 8,
            should_update_expected_server_connection_id_length: false,
            allow_short_initial_server_connection_ids: false,
            reset_key,
            allow_chlo_buffering: true,
            disable_legacy_version_encapsulation: false,
            map_original_connection_ids: true,
            send_connection_close_for_tls_alerts: true,
            max_recent_stateless_reset_addresses: 1024,
            recent_stateless_reset_addresses_lifetime: Duration::from_secs(1),
        }
    }
}

impl DispatchConfig {
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.supported_versions.is_empty() {
            return Err(ConfigError::IllegalValue(
                "at least one supported version is required",
            ));
        }
        if self
            .supported_versions
            .iter()
            .any(|version| !version.is_known())
        {
            return Err(ConfigError::IllegalValue(
                "supported versions must be known versions",
            ));
        }
        if self.expected_server_connection_id_length > MAX_CID_SIZE {
            return Err(ConfigError::IllegalValue(
                "expected_server_connection_id_length must be at most 20",
            ));
        }
        if self.reset_key.len() < 32 {
            return Err(ConfigError::IllegalValue(
                "reset_key must hold at least 32 bytes",
            ));
        }
        if self.max_recent_stateless_reset_addresses == 0 {
            return Err(ConfigError::IllegalValue(
                "max_recent_stateless_reset_addresses must be nonzero",
            ));
        }
        Ok(())
    }
}

/// Errors in the configuration of a dispatcher
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// The supplied configuration contained an invalid value
    #[error(display = "illegal configuration value: {}", _0)]
    IllegalValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(DispatchConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_bad_cid_length() {
        let config = DispatchConfig {
            expected_server_connection_id_length: 21,
            ..DispatchConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_supported_version() {
        let config = DispatchConfig {
            supported_versions: vec![Version::Unknown(0xbaba_baba)],
            ..DispatchConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
