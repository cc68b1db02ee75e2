use sha2::{Digest, Sha256};

const FINGERPRINT_LEN: usize = 12;

/// Short stable digest of a push token, safe to put in logs in place of the token.
pub fn token_fingerprint(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..FINGERPRINT_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_fingerprint() {
        let a = token_fingerprint("ExponentPushToken[aaaaaaaaaaaa]");
        let b = token_fingerprint("ExponentPushToken[aaaaaaaaaaaa]");
        let c = token_fingerprint("ExponentPushToken[bbbbbbbbbbbb]");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), FINGERPRINT_LEN);
        assert!(!a.contains("ExponentPushToken"));
    }
}
