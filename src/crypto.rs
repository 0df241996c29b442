use ring::{aead, hkdf, hmac};

use crate::shared::{ConnectionId, ResetToken};
use crate::version::Version;
use crate::RESET_TOKEN_SIZE;

/// Decryption or encryption failed
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct CryptoError;

impl From<ring::error::Unspecified> for CryptoError {
    fn from(_: ring::error::Unspecified) -> Self {
        CryptoError
    }
}

/// Keys for one direction of the initial encryption level
pub(crate) struct DirectionalKeys {
    pub header: aead::quic::HeaderProtectionKey,
    pub key: aead::LessSafeKey,
    pub iv: [u8; 12],
}

/// Initial-level keys for both directions, from the server's perspective
///
/// `remote` opens packets the client sealed ("client in"); `local` seals
/// packets we send ("server in").
pub(crate) struct InitialKeys {
    pub local: DirectionalKeys,
    pub remote: DirectionalKeys,
}

fn initial_salt(version: Version) -> Option<&'static [u8; 20]> {
    match version {
        Version::V1 => Some(&[
            0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8,
            0x0c, 0xad, 0xcc, 0xbb, 0x7f, 0x0a,
        ]),
        Version::Draft29 => Some(&[
            0xaf, 0xbf, 0xec, 0x28, 0x99, 0x93, 0xd2, 0x4c, 0x9e, 0x97, 0x86, 0xf1, 0x9c, 0x61,
            0x11, 0xe0, 0x43, 0x90, 0xa8, 0x99,
        ]),
        _ => None,
    }
}

/// Derive the initial keys for `dst_cid`, if the version has a TLS handshake
pub(crate) fn initial_keys(version: Version, dst_cid: &ConnectionId) -> Option<InitialKeys> {
    let salt = initial_salt(version)?;
    let initial_secret = hkdf::Salt::new(hkdf::HKDF_SHA256, salt).extract(dst_cid);
    Some(InitialKeys {
        local: directional_keys(&initial_secret, b"server in"),
        remote: directional_keys(&initial_secret, b"client in"),
    })
}

fn directional_keys(initial_secret: &hkdf::Prk, label: &[u8]) -> DirectionalKeys {
    let mut secret = [0u8; 32];
    expand_label(initial_secret, label, &mut secret);
    let secret = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &secret);

    let mut key = [0u8; 16];
    expand_label(&secret, b"quic key", &mut key);
    let mut iv = [0u8; 12];
    expand_label(&secret, b"quic iv", &mut iv);
    let mut hp = [0u8; 16];
    expand_label(&secret, b"quic hp", &mut hp);

    DirectionalKeys {
        header: aead::quic::HeaderProtectionKey::new(&aead::quic::AES_128, &hp)
            .expect("header protection key length is fixed"),
        key: aead::LessSafeKey::new(
            aead::UnboundKey::new(&aead::AES_128_GCM, &key)
                .expect("AEAD key length is fixed"),
        ),
        iv,
    }
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn expand_label(secret: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    const TLS13_PREFIX: &[u8] = b"tls13 ";
    let mut info = Vec::with_capacity(2 + 1 + TLS13_PREFIX.len() + label.len() + 1);
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push((TLS13_PREFIX.len() + label.len()) as u8);
    info.extend_from_slice(TLS13_PREFIX);
    info.extend_from_slice(label);
    info.push(0);
    secret
        .expand(&[&info], OkmLen(out.len()))
        .expect("HKDF output length is in range")
        .fill(out)
        .expect("HKDF output length matches buffer");
}

fn nonce(iv: &[u8; 12], packet_number: u64) -> aead::Nonce {
    let mut bytes = *iv;
    for (b, n) in bytes[4..].iter_mut().zip(&packet_number.to_be_bytes()) {
        *b ^= n;
    }
    aead::Nonce::assume_unique_for_key(bytes)
}

/// Decrypt `payload` in place, authenticated against `header`
pub(crate) fn open(
    keys: &DirectionalKeys,
    packet_number: u64,
    header: &[u8],
    payload: &mut Vec<u8>,
) -> Result<(), CryptoError> {
    let plain_len = keys
        .key
        .open_in_place(nonce(&keys.iv, packet_number), aead::Aad::from(header), payload)?
        .len();
    payload.truncate(plain_len);
    Ok(())
}

/// Encrypt `payload` in place, authenticated against `header`, appending the tag
pub(crate) fn seal(
    keys: &DirectionalKeys,
    packet_number: u64,
    header: &[u8],
    payload: &mut Vec<u8>,
) {
    let tag = keys
        .key
        .seal_in_place_separate_tag(
            nonce(&keys.iv, packet_number),
            aead::Aad::from(header),
            payload,
        )
        .expect("sealing cannot fail for in-range payloads");
    payload.extend_from_slice(tag.as_ref());
}

const LONG_HEADER_FORM: u8 = 0x80;

/// Remove header protection in place; returns the packet number length
///
/// `pn_offset` is the offset of the first packet-number byte. The packet
/// must extend at least four bytes plus a sample past that offset.
pub(crate) fn remove_header_protection(
    hp: &aead::quic::HeaderProtectionKey,
    pn_offset: usize,
    packet: &mut [u8],
) -> Result<usize, CryptoError> {
    if packet.len() < pn_offset + 4 + hp.algorithm().sample_len() {
        return Err(CryptoError);
    }
    let (header, sample) = packet.split_at_mut(pn_offset + 4);
    let mask = hp.new_mask(&sample[0..hp.algorithm().sample_len()])?;
    if header[0] & LONG_HEADER_FORM != 0 {
        header[0] ^= mask[0] & 0x0f;
    } else {
        header[0] ^= mask[0] & 0x1f;
    }
    let pn_length = 1 + (header[0] & 0x03) as usize;
    for (out, inp) in header[pn_offset..pn_offset + pn_length]
        .iter_mut()
        .zip(&mask[1..])
    {
        *out ^= inp;
    }
    Ok(pn_length)
}

/// Apply header protection in place
pub(crate) fn apply_header_protection(
    hp: &aead::quic::HeaderProtectionKey,
    pn_offset: usize,
    packet: &mut [u8],
) {
    debug_assert!(packet.len() >= pn_offset + 4 + hp.algorithm().sample_len());
    let (header, sample) = packet.split_at_mut(pn_offset + 4);
    let mask = hp
        .new_mask(&sample[0..hp.algorithm().sample_len()])
        .expect("sample length is fixed");
    // The packet number length bits must be read before they are masked.
    let pn_length = 1 + (header[0] & 0x03) as usize;
    if header[0] & LONG_HEADER_FORM != 0 {
        header[0] ^= mask[0] & 0x0f;
    } else {
        header[0] ^= mask[0] & 0x1f;
    }
    for (out, inp) in header[pn_offset..pn_offset + pn_length]
        .iter_mut()
        .zip(&mask[1..])
    {
        *out ^= inp;
    }
}

/// Derive the stateless reset token for `cid` under the endpoint's reset key
pub(crate) fn reset_token(key: &hmac::Key, cid: &ConnectionId) -> ResetToken {
    let signature = hmac::sign(key, cid);
    let mut result = [0; RESET_TOKEN_SIZE];
    result.copy_from_slice(&signature.as_ref()[..RESET_TOKEN_SIZE]);
    result.into()
}
