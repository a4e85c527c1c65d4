//! Per-domain HMAC-SHA256 authentication tokens.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// A validated 256-bit shared secret for one domain.
///
/// Construction always goes through [`Key::parse`] or [`Key::generate`], so
/// a live `Key` is guaranteed to be 32 bytes.
#[derive(Clone)]
pub struct Key([u8; 32]);

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Key").field(&"<redacted>").finish()
    }
}

impl Key {
    /// Generates a fresh 256-bit key from a CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parses a 64-character lowercase hex string, rejecting anything else.
    pub fn parse(hex_str: &str) -> Result<Self> {
        if hex_str.len() != 64 || !hex_str.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(Error::InvalidInput(
                "key must be 64 lowercase hex characters".to_owned(),
            ));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut bytes)
            .map_err(|e| Error::InvalidInput(format!("invalid hex key: {e}")))?;
        Ok(Self(bytes))
    }

    /// Renders the key as its 64-character lowercase hex encoding.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Computes `τ = HMAC-SHA256(k_d, cid)`, hex-encoded.
    #[must_use]
    pub fn sign(&self, cid: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC accepts any key length");
        mac.update(cid.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verifies a presented hex token against `cid` in constant time.
    ///
    /// Returns `false` both when the token is malformed and when it simply
    /// does not match — the caller cannot distinguish the two, which is the
    /// point: a malformed token is not an oracle either.
    #[must_use]
    pub fn verify(&self, cid: &str, presented_hex: &str) -> bool {
        let Ok(presented) = hex::decode(presented_hex) else {
            return false;
        };
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC accepts any key length");
        mac.update(cid.as_bytes());
        mac.verify_slice(&presented).is_ok()
    }

    /// Short hex fingerprint of `SHA-256(key)`, for display in `keys` output.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        use sha2::Digest;
        let digest = Sha256::digest(self.0);
        hex::encode(&digest[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let key = Key::generate();
        let cid = "20250101-000000-1-abcd";
        let tau = key.sign(cid);
        assert!(key.verify(cid, &tau));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let k1 = Key::generate();
        let k2 = Key::generate();
        let cid = "20250101-000000-1-abcd";
        let tau = k1.sign(cid);
        assert!(!k2.verify(cid, &tau));
    }

    #[test]
    fn verify_rejects_malformed_token() {
        let key = Key::generate();
        assert!(!key.verify("cid", "not-hex"));
        assert!(!key.verify("cid", "00"));
    }

    #[test]
    fn parse_rejects_uppercase_and_wrong_length() {
        assert!(Key::parse(&"A".repeat(64)).is_err());
        assert!(Key::parse(&"a".repeat(63)).is_err());
        assert!(Key::parse(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn fingerprint_is_stable() {
        let key = Key::parse(&"ab".repeat(32)).unwrap();
        assert_eq!(key.fingerprint(), key.fingerprint());
        assert_eq!(key.fingerprint().len(), 16);
    }
}
