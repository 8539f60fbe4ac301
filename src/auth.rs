//! Password hashing. Salted SHA-256, hex-encoded; the salt is stored next
//! to the hash so the original credential survives the request -> account
//! copy without ever persisting plaintext.

use sha2::{Digest, Sha256};
use uuid::Uuid;

pub fn new_salt() -> String {
    Uuid::new_v4().to_string()
}

pub fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn verify_password(salt: &str, hash: &str, candidate: &str) -> bool {
    hash_password(salt, candidate) == hash
}
