//! Encryption stage for backup archives.
//!
//! Archives are sealed with AES-256-GCM in the STREAM construction, keyed by
//! Argon2id from the job passphrase. The stream is split into fixed-size
//! chunks, each authenticated on its own, and the final chunk carries a
//! distinct flag so truncation is detected.

pub mod key_derivation;
pub mod passphrase;
pub mod stream;

pub use key_derivation::{derive_key, DerivedKey, KdfParams};
pub use passphrase::Passphrase;
pub use stream::AesGcmEncryptor;
