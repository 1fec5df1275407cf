//! SHA-256 helpers for content addressing and grain identity.

use sha2::{Digest, Sha256};

/// Full lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content hash of a fact. Pure function of the exact content text.
pub fn content_hash(content: &str) -> String {
    sha256_hex(content.as_bytes())
}

/// Hash over `|`-joined parts, truncated to `len` hex characters.
pub fn short_digest(parts: &[&str], len: usize) -> String {
    let mut full = sha256_hex(parts.join("|").as_bytes());
    full.truncate(len);
    full
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_content_hash_is_exact() {
        assert_eq!(content_hash("PLA gels"), content_hash("PLA gels"));
        assert_ne!(content_hash("PLA gels"), content_hash("PLA gels "));
    }

    #[test]
    fn test_short_digest_length() {
        let d = short_digest(&["fact:1", "materials", "52"], 16);
        assert_eq!(d.len(), 16);
        assert_eq!(d, short_digest(&["fact:1", "materials", "52"], 16));
        assert_ne!(d, short_digest(&["fact:1", "materials", "53"], 16));
    }
}
