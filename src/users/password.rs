//! Credential handling for stored users.
//!
//! A credential is the argon2id PHC string produced at registration; the
//! plaintext password never reaches the store.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use tracing::error;

/// Hashes a plaintext password into the PHC string kept as the user's credential.
pub fn hash_credential(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let credential = Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map_err(|e| {
            error!(error = %e, "could not derive credential");
            anyhow::anyhow!("credential hashing failed: {e}")
        })?
        .to_string();
    Ok(credential)
}

/// `Ok(false)` on a wrong password; `Err` only when the stored credential is unreadable.
pub fn verify_credential(plain: &str, credential: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(credential).map_err(|e| {
        error!(error = %e, "stored credential is unreadable");
        anyhow::anyhow!("stored credential is not an argon2 PHC string: {e}")
    })?;
    Ok(Argon2::default()
        .verify_password(plain.as_bytes(), &parsed)
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_accepts_same_password() {
        let credential = hash_credential("Secur3P@ssw0rd!").expect("hashing should succeed");
        assert!(credential.starts_with("$argon2"));
        assert!(verify_credential("Secur3P@ssw0rd!", &credential).expect("verify should succeed"));
    }

    #[test]
    fn verify_rejects_wrong_password() {
        let credential = hash_credential("correct-horse-battery-staple").unwrap();
        let accepted =
            verify_credential("wrong-password", &credential).expect("verify should not error");
        assert!(!accepted);
    }

    #[test]
    fn same_password_hashes_differently() {
        let a = hash_credential("repeatable").unwrap();
        let b = hash_credential("repeatable").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn verify_errors_on_malformed_credential() {
        let err = verify_credential("anything", "not-a-valid-hash").unwrap_err();
        assert!(err.to_string().contains("argon2 PHC"));
    }
}
