use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use crate::error::{QuorumError, Result};

pub const NONCE_LEN: usize = 12;

/// Sealed blob storage for secret snapshots (space keys, ratchet states).
///
/// Layout:
///   {base}/keys/master.secret      – 32-byte master key (file mode 0600)
///   {base}/keys/{name}.enc         – nonce || AES-256-GCM ciphertext
pub struct KeyStore {
    base_dir: PathBuf,
    master_key: Zeroizing<[u8; 32]>,
}

impl KeyStore {
    /// Initialise the key store, creating the master key if absent.
    pub fn new(base_dir: &Path) -> Result<Self> {
        let keys_dir = base_dir.join("keys");
        fs::create_dir_all(&keys_dir)
            .map_err(|e| QuorumError::Crypto(format!("create keys dir: {}", e)))?;

        let secret_path = keys_dir.join("master.secret");
        let master_key = if secret_path.exists() {
            let bytes = fs::read(&secret_path)
                .map_err(|e| QuorumError::Crypto(format!("read master key: {}", e)))?;
            if bytes.len() != 32 {
                return Err(QuorumError::Crypto("Corrupt master key file".to_string()));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(&bytes);
            Zeroizing::new(key)
        } else {
            let mut key = [0u8; 32];
            OsRng.fill_bytes(&mut key);
            fs::write(&secret_path, key)
                .map_err(|e| QuorumError::Crypto(format!("write master key: {}", e)))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&secret_path, fs::Permissions::from_mode(0o600))
                    .map_err(|e| QuorumError::Crypto(format!("chmod master key: {}", e)))?;
            }
            log::info!("Generated new store master key");
            Zeroizing::new(key)
        };

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            master_key,
        })
    }

    fn blob_path(&self, name: &str) -> PathBuf {
        self.base_dir.join("keys").join(format!("{}.enc", name))
    }

    pub fn save_sealed(&self, name: &str, plaintext: &[u8]) -> Result<()> {
        let (nonce, ciphertext) = seal(self.master_key.as_ref(), plaintext)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        fs::write(self.blob_path(name), out)
            .map_err(|e| QuorumError::Crypto(format!("write sealed {}: {}", name, e)))
    }

    pub fn load_sealed(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)
            .map_err(|e| QuorumError::Crypto(format!("read sealed {}: {}", name, e)))?;
        if data.len() < NONCE_LEN {
            return Err(QuorumError::Crypto("Ciphertext too short".into()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        Ok(Some(open(self.master_key.as_ref(), nonce, ciphertext)?))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

// ── AES-256-GCM helpers ────────────────────────────────────────

/// Encrypt under a raw 32-byte key with a fresh random nonce.
/// Returns `(nonce, ciphertext)`.
#[allow(deprecated)]
pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>)> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| QuorumError::Crypto(format!("AES init: {}", e)))?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| QuorumError::Crypto(format!("AES encrypt: {}", e)))?;
    Ok((nonce_bytes, ciphertext))
}

#[allow(deprecated)]
pub fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return Err(QuorumError::Crypto("Invalid nonce length".into()));
    }
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| QuorumError::Crypto(format!("AES init: {}", e)))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| QuorumError::Crypto(format!("AES decrypt: {}", e)))
}
