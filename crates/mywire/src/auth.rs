//! Password scrambling for `mysql_native_password`.
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```
//!
//! Other plugins are not implemented; the connection reports them as
//! unsupported.

use sha1::{Digest, Sha1};

/// Authentication plugin names seen on the wire.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
}

/// Length of the native-password scramble and of the seed it consumes.
pub const SCRAMBLE_LEN: usize = 20;

/// Compute the `mysql_native_password` auth response.
///
/// An empty password yields an empty response. Only the first 20 bytes of
/// `seed` are used.
pub fn mysql_native_password(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = &seed[..seed.len().min(SCRAMBLE_LEN)];

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}
