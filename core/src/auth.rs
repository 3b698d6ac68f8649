use rand::Rng;
use sha2::{Digest, Sha256};

const OPERATOR_TOKEN_PREFIX: &str = "cg_op_";

/// Generate an operator token. Returns `(full_token, sha256_hash)`.
/// Format: `cg_op_` + 32 random bytes hex-encoded.
pub fn generate_operator_token() -> (String, String) {
    let raw = random_hex(32);
    let full_token = format!("{OPERATOR_TOKEN_PREFIX}{raw}");
    let hash = hash_token(&full_token);
    (full_token, hash)
}

/// SHA-256 hex digest of a token string.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare a presented token against a stored hex digest without
/// short-circuiting on the first differing byte.
pub fn verify_token(token: &str, expected_sha256_hex: &str) -> bool {
    let presented = hash_token(token);
    let expected = expected_sha256_hex.trim().to_ascii_lowercase();
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn random_hex(n: usize) -> String {
    let bytes: Vec<u8> = (0..n).map(|_| rand::thread_rng().r#gen::<u8>()).collect();
    hex::encode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_token_roundtrip() {
        let (token, hash) = generate_operator_token();
        assert!(token.starts_with("cg_op_"));
        assert_eq!(hash, hash_token(&token));
        assert!(verify_token(&token, &hash));
        assert!(verify_token(&token, &hash.to_uppercase()));
    }

    #[test]
    fn wrong_token_is_rejected() {
        let (_, hash) = generate_operator_token();
        assert!(!verify_token("cg_op_guess", &hash));
        assert!(!verify_token("anything", ""));
    }
}
