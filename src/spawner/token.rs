//! Notebook-server bearer token.

use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

const TOKEN_ENTROPY_BYTES: usize = 20;

/// 20 bytes from the OS RNG, hashed with SHA-256 and hex-encoded.
pub fn generate_token() -> String {
    let mut seed = [0u8; TOKEN_ENTROPY_BYTES];
    OsRng.fill_bytes(&mut seed);
    hex::encode(Sha256::digest(seed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_hex_sha256() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_tokens_differ() {
        assert_ne!(generate_token(), generate_token());
    }
}
