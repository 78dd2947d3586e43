//! Proof-of-work nonce solving and verification
//!
//! A node with `difficulty > 0` must carry a nonce such that the hex-encoded
//! BLAKE2b-256 digest of `message || nonce` compares greater-or-equal to a
//! difficulty threshold string.
//!
//! The threshold assembly and the string-lexicographic comparison are
//! consensus-critical and preserved exactly: the threshold is the hex nibble
//! with the low `difficulty % 4` bits set (omitted when zero) followed by
//! `difficulty / 4` `'f'` characters, and the digest is compared as a
//! lowercase hex string, not numerically.

use crate::hash::{hash_parts, HashPart};

/// Nonce size in bytes
pub const NONCE_SIZE: usize = 8;

/// Build the difficulty threshold string
///
/// `3 -> "7"`, `5 -> "1f"`, `8 -> "ff"`. Difficulty 0 yields the empty
/// string, which every digest satisfies.
pub fn make_threshold(difficulty: u8) -> String {
    let partial = difficulty % 4;
    let full = (difficulty / 4) as usize;

    let mut threshold = String::with_capacity(full + 1);
    if partial > 0 {
        let nibble = (1u8 << partial) - 1;
        threshold.push(char::from_digit(nibble as u32, 16).unwrap_or('0'));
    }
    for _ in 0..full {
        threshold.push('f');
    }
    threshold
}

/// Solve a nonce for the given message and difficulty
///
/// The nonce is incremented little-endian, byte 0 first. Returns `None`
/// when the 64-bit nonce space is exhausted without a solution.
pub fn solve(message: &[u8], difficulty: u8) -> Option<[u8; NONCE_SIZE]> {
    let threshold = make_threshold(difficulty);
    let mut nonce = [0u8; NONCE_SIZE];

    loop {
        if digest_meets(message, &nonce, &threshold) {
            return Some(nonce);
        }
        if !increment(&mut nonce) {
            return None;
        }
    }
}

/// Verify a nonce against the given message and difficulty
pub fn verify(message: &[u8], nonce: &[u8; NONCE_SIZE], difficulty: u8) -> bool {
    let threshold = make_threshold(difficulty);
    digest_meets(message, nonce, &threshold)
}

fn digest_meets(message: &[u8], nonce: &[u8; NONCE_SIZE], threshold: &str) -> bool {
    let digest = hash_parts(&[HashPart::Bytes(message), HashPart::Bytes(nonce)]);
    // String comparison, not numeric. Consensus rule.
    hex::encode(digest).as_str() >= threshold
}

/// Increment little-endian, byte 0 first. Returns false on wrap-around.
fn increment(nonce: &mut [u8; NONCE_SIZE]) -> bool {
    for byte in nonce.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            return true;
        }
    }
    false
}
