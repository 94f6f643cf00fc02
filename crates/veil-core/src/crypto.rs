//! Transport key material for link layers.
//!
//! Provides two things:
//!   1. `Keypair`: the long-term X25519 transport keypair a link layer
//!      advertises in its `AddressInfo`
//!   2. Key files: persistence of that keypair's private half
//!
//! Keypairs are managed via x25519-dalek for explicit key control. All key
//! material derives ZeroizeOnDrop and is wiped from memory when dropped.
//! There is no unsafe code in this module.

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// On-disk size of a key file: private key followed by its BLAKE3 checksum.
pub const KEY_FILE_LEN: usize = 64;

// ── Keypair ───────────────────────────────────────────────────────────────────

/// A link layer's long-term static X25519 keypair.
///
/// The public key appears in every `AddressInfo` the link layer advertises.
/// The private key never leaves this struct except through [`Keypair::write_to`].
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Keypair {
    /// Private key. Zeroized on drop, never exposed directly.
    private: Zeroizing<[u8; 32]>,
    /// Public key, included in address descriptors.
    pub public: [u8; 32],
}

impl Keypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    /// Serialize the private key for persistent storage.
    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    /// Persist the private key to `path` (mode 0600 on Unix).
    ///
    /// The public key is not stored; it is always derived on load.
    pub fn write_to(&self, path: &Path) -> Result<(), KeyFileError> {
        let mut blob = Zeroizing::new([0u8; KEY_FILE_LEN]);
        blob[..32].copy_from_slice(&*self.private);
        blob[32..].copy_from_slice(blake3::hash(&*self.private).as_bytes());

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| KeyFileError::WriteFailed(path.to_path_buf(), e))?;
            }
        }

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options
            .open(path)
            .map_err(|e| KeyFileError::WriteFailed(path.to_path_buf(), e))?;
        file.write_all(&*blob)
            .map_err(|e| KeyFileError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Load and verify a keypair previously written by [`Keypair::write_to`].
    pub fn read_from(path: &Path) -> Result<Self, KeyFileError> {
        let blob = Zeroizing::new(
            std::fs::read(path).map_err(|e| KeyFileError::ReadFailed(path.to_path_buf(), e))?,
        );
        if blob.len() != KEY_FILE_LEN {
            return Err(KeyFileError::Corrupt(path.to_path_buf()));
        }
        let mut private = [0u8; 32];
        private.copy_from_slice(&blob[..32]);
        if blake3::hash(&private).as_bytes() != &blob[32..] {
            private.zeroize();
            return Err(KeyFileError::Corrupt(path.to_path_buf()));
        }
        let keypair = Self::from_private(private);
        private.zeroize();
        Ok(keypair)
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum KeyFileError {
    #[error("failed to read key file {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to write key file {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("key file {0} is corrupt")]
    Corrupt(PathBuf),
}
