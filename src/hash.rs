//! SHA-1 helpers for the component handshake.

use sha1::{Digest, Sha1};

/// SHA-1 of `data` as a 40-character lowercase hex string.
#[must_use]
pub fn sha1_hex(data: &str) -> String {
    let hash = Sha1::digest(data.as_bytes());
    hash.iter().map(|b| format!("{b:02x}")).collect()
}

/// Handshake digest: SHA-1 over the stream id immediately followed by the secret.
#[must_use]
pub fn handshake_digest(stream_id: &str, secret: &str) -> String {
    sha1_hex(&format!("{stream_id}{secret}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_of_empty_string() {
        assert_eq!(sha1_hex(""), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[test]
    fn test_sha1_known_vector() {
        assert_eq!(sha1_hex("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_handshake_digest_concatenates_without_separator() {
        let digest = handshake_digest("abc123", "s3cr3t");
        assert_eq!(digest, "49fc1ea83a54123ae5a273341bed522fe7d4b91c");
        assert_eq!(digest.len(), 40);
        assert!(digest.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
    }
}
