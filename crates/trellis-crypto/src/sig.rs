//! Multi-signature packing
//!
//! A node's `signature` field holds one or more 65-byte entries. Each entry
//! is the 1-byte index of the signer within the eligible-signer set followed
//! by the 64-byte detached ed25519 signature.

use crate::error::{CryptoError, Result};

/// Size of one packed signature entry
pub const SIGNATURE_ENTRY_SIZE: usize = 65;

/// One unpacked signature entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignatureEntry {
    /// Index into the eligible-signer set
    pub signer_index: u8,
    /// Detached ed25519 signature
    pub signature: [u8; 64],
}

/// Pack a signer index and signature into a 65-byte entry
pub fn pack_entry(signer_index: u8, signature: &[u8; 64]) -> [u8; SIGNATURE_ENTRY_SIZE] {
    let mut entry = [0u8; SIGNATURE_ENTRY_SIZE];
    entry[0] = signer_index;
    entry[1..].copy_from_slice(signature);
    entry
}

/// Unpack a buffer of concatenated 65-byte entries
pub fn unpack_entries(buffer: &[u8]) -> Result<Vec<SignatureEntry>> {
    if buffer.is_empty() || buffer.len() % SIGNATURE_ENTRY_SIZE != 0 {
        return Err(CryptoError::MalformedSignatureBuffer(buffer.len()));
    }

    let mut entries = Vec::with_capacity(buffer.len() / SIGNATURE_ENTRY_SIZE);
    for chunk in buffer.chunks_exact(SIGNATURE_ENTRY_SIZE) {
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&chunk[1..]);
        entries.push(SignatureEntry {
            signer_index: chunk[0],
            signature,
        });
    }
    Ok(entries)
}
