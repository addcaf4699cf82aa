//! # Key Encryption Seam
//!
//! The standard tree can store keys encrypted at rest. Encryption is a
//! caller-supplied collaborator: Arbor never picks a cipher, it only defines
//! the seam and the on-disk framing.
//!
//! ## On-Disk Framing
//!
//! With a codec installed, every key in a standard bucket is stored as
//! `[encrypted_len: i32][ciphertext]` and decrypted on read. The length
//! prefix is what lets `size_in_buffer`-style raw access skip over an
//! encrypted key without decrypting it.
//!
//! The bonsai variant never encrypts: its regions are small and shared, and
//! the RID-bag workloads it serves store no sensitive key material.

/// A reversible byte-level codec applied to serialized keys.
///
/// Implementations must satisfy `decrypt(encrypt(b)) == b`. Ciphertext
/// length may differ from plaintext length; the bucket stores the
/// ciphertext length explicitly.
pub trait EncryptionCodec: Send + Sync {
    fn encrypt(&self, plain: &[u8]) -> Vec<u8>;

    fn decrypt(&self, cipher: &[u8]) -> Vec<u8>;
}
