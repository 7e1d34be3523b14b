//! Key derivation using Argon2id.
//!
//! The parameters travel in the archive header, so an artifact stays
//! decryptable after the defaults change.

use super::Passphrase;
use crate::archive::ArchiveError;
use argon2::{Algorithm, Argon2, Params, Version};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the AES-256 key
pub const KEY_LEN: usize = 32;

/// Upper bounds accepted from an archive header (1 GiB of memory)
const MAX_MEMORY_KIB: u32 = 1024 * 1024;
const MAX_ITERATIONS: u32 = 16;
const MAX_LANES: u32 = 16;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Iterations
    pub iterations: u32,
    /// Degree of parallelism
    pub lanes: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // OWASP's baseline recommendation for Argon2id
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            lanes: 1,
        }
    }
}

impl KdfParams {
    /// Reject costs no artifact of ours carries. A damaged header must fail
    /// fast instead of pinning a CPU or exhausting memory.
    pub fn check_bounds(&self) -> Result<(), String> {
        if self.lanes == 0 || self.lanes > MAX_LANES {
            return Err(format!("lanes {} out of range 1..={}", self.lanes, MAX_LANES));
        }
        if self.iterations == 0 || self.iterations > MAX_ITERATIONS {
            return Err(format!(
                "iterations {} out of range 1..={}",
                self.iterations, MAX_ITERATIONS
            ));
        }
        if self.memory_kib < 8 * self.lanes || self.memory_kib > MAX_MEMORY_KIB {
            return Err(format!(
                "memory {} KiB out of range {}..={}",
                self.memory_kib,
                8 * self.lanes,
                MAX_MEMORY_KIB
            ));
        }
        Ok(())
    }

    /// Minimal cost, for tests only
    #[cfg(test)]
    pub fn insecure_for_tests() -> Self {
        Self {
            memory_kib: 1024,
            iterations: 1,
            lanes: 1,
        }
    }
}

/// A derived AES-256 key, wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKey {
    key: [u8; KEY_LEN],
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

/// Derive the archive key from a passphrase and salt
pub fn derive_key(
    passphrase: &Passphrase,
    salt: &[u8],
    params: &KdfParams,
) -> Result<DerivedKey, ArchiveError> {
    let argon2_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.lanes,
        Some(KEY_LEN),
    )
    .map_err(|e| ArchiveError::Encryption(format!("Invalid Argon2 parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(passphrase.expose().as_bytes(), salt, &mut key)
        .map_err(|e| ArchiveError::Encryption(format!("Key derivation failed: {}", e)))?;

    Ok(DerivedKey { key })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: [u8; 16] = [9; 16];

    #[test]
    fn test_same_inputs_same_key() {
        let params = KdfParams::insecure_for_tests();
        let pass = Passphrase::new("test_passphrase");
        let key1 = derive_key(&pass, &SALT, &params).unwrap();
        let key2 = derive_key(&pass, &SALT, &params).unwrap();
        assert_eq!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_different_passphrase_different_key() {
        let params = KdfParams::insecure_for_tests();
        let key1 = derive_key(&Passphrase::new("one"), &SALT, &params).unwrap();
        let key2 = derive_key(&Passphrase::new("two"), &SALT, &params).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_different_salt_different_key() {
        let params = KdfParams::insecure_for_tests();
        let pass = Passphrase::new("same");
        let key1 = derive_key(&pass, &[1; 16], &params).unwrap();
        let key2 = derive_key(&pass, &[2; 16], &params).unwrap();
        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = KdfParams {
            memory_kib: 1,
            iterations: 0,
            lanes: 1,
        };
        let result = derive_key(&Passphrase::new("x"), &SALT, &params);
        assert!(matches!(result, Err(ArchiveError::Encryption(_))));
    }

    #[test]
    fn test_bounds() {
        assert!(KdfParams::default().check_bounds().is_ok());
        assert!(KdfParams::insecure_for_tests().check_bounds().is_ok());

        let too_slow = KdfParams {
            iterations: 0xff00_0002,
            ..KdfParams::default()
        };
        assert!(too_slow.check_bounds().unwrap_err().contains("iterations"));

        let too_big = KdfParams {
            memory_kib: u32::MAX,
            ..KdfParams::default()
        };
        assert!(too_big.check_bounds().unwrap_err().contains("memory"));

        let no_lanes = KdfParams {
            lanes: 0,
            ..KdfParams::default()
        };
        assert!(no_lanes.check_bounds().is_err());
    }
}
