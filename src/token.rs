//! Secure random tokens.
//!
//! All credentials in the system are lowercase hex strings: vhost access
//! tokens and single-use tokens are 128 chars, the admin cookie is 40.
//! Comparisons go through [`secure_compare`] to keep token validation
//! constant-time.

use rand::RngCore;
use subtle::ConstantTimeEq;

/// Byte width of vhost access tokens and single-use tokens (128 hex chars).
pub const ACCESS_TOKEN_BYTES: usize = 64;

/// Byte width of the admin cookie (40 hex chars).
pub const COOKIE_BYTES: usize = 20;

/// Generate a random lowercase-hex token of `n` bytes (`2 * n` chars).
pub fn generate_token(n: usize) -> String {
    let mut bytes = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(2 * n);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Constant-time string equality.
///
/// Length is allowed to leak; the contents are not.
pub fn secure_compare(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
