//! Monotonic timestamps and cryptographic randomness.
//!
//! The actual poll/timer loop belongs to the async QUIC runtime this crate
//! links against; this module only provides the two primitives the rest of
//! the engine needs directly: a monotonic clock for log timestamps and
//! diagnostics, and a source of cryptographically secure random bytes for
//! connection ids, stateless reset tokens, and the static secret itself.

use std::time::Instant;

/// Nanoseconds since an arbitrary, process-local epoch.
///
/// Only useful for relative comparisons within a single process run.
pub fn now_nanos() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = *START.get_or_init(Instant::now);
    Instant::now().saturating_duration_since(start).as_nanos() as u64
}

/// Fill `buf` with cryptographically secure random bytes.
pub fn fill_random(buf: &mut [u8]) {
    boring::rand::rand_bytes(buf).expect("BoringSSL RAND_bytes failure is unrecoverable");
}

/// Generate a fresh random buffer of length `n`.
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    fill_random(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_nanos_is_monotonic() {
        let a = now_nanos();
        let b = now_nanos();
        assert!(b >= a);
    }

    #[test]
    fn random_bytes_are_not_all_zero() {
        // Not a rigorous randomness test, just a sanity check that the RNG is wired up.
        let buf = random_bytes(32);
        assert_eq!(buf.len(), 32);
        assert!(buf.iter().any(|&b| b != 0));
    }
}
