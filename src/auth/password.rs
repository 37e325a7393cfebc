/// bcrypt operates on at most 72 bytes of input; anything longer is rejected
/// outright rather than silently truncated.
pub const MAX_PASSWORD_BYTES: usize = 72;

pub fn hash_password(plain: &str, cost: u32) -> anyhow::Result<String> {
    if plain.len() > MAX_PASSWORD_BYTES {
        anyhow::bail!(
            "password exceeds {MAX_PASSWORD_BYTES} bytes (got {})",
            plain.len()
        );
    }
    bcrypt::hash(plain, cost).map_err(|e| anyhow::anyhow!("password hash failed: {e}"))
}

pub fn verify_password(plain: &str, hash: &str) -> anyhow::Result<bool> {
    if plain.len() > MAX_PASSWORD_BYTES {
        anyhow::bail!(
            "password exceeds {MAX_PASSWORD_BYTES} bytes (got {})",
            plain.len()
        );
    }
    bcrypt::verify(plain, hash).map_err(|e| anyhow::anyhow!("invalid password hash: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_COST: u32 = 4; // minimum cost, keeps tests fast

    #[test]
    fn hash_and_verify_roundtrip() {
        let plain = "correcthorsebatterystaple";
        let hash = hash_password(plain, TEST_COST).unwrap();

        assert!(hash.starts_with("$2"));
        assert!(verify_password(plain, &hash).unwrap());
    }

    #[test]
    fn wrong_password_fails() {
        let hash = hash_password("secret123", TEST_COST).unwrap();
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn different_hashes_for_same_password() {
        let h1 = hash_password("same", TEST_COST).unwrap();
        let h2 = hash_password("same", TEST_COST).unwrap();
        assert_ne!(h1, h2); // different salts
    }

    #[test]
    fn embedded_cost_in_hash() {
        let hash = hash_password("x", 6).unwrap();
        assert!(hash.contains("$06$"));
    }

    #[test]
    fn seventy_two_bytes_accepted() {
        let plain = "a".repeat(72);
        assert!(hash_password(&plain, TEST_COST).is_ok());
    }

    #[test]
    fn seventy_three_bytes_rejected() {
        let plain = "a".repeat(73);
        assert!(hash_password(&plain, TEST_COST).is_err());
        assert!(verify_password(&plain, "$2b$04$abcdefghijklmnopqrstuv").is_err());
    }
}
