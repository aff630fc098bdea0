//! Password-based single-file encryption
//!
//! Artifact layout: `salt (16) || nonce (12) || AES-256-GCM ciphertext`.
//! The key is derived from the password and salt with Argon2id. No output
//! file is written unless the whole operation succeeds.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::Argon2;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Suffix appended to encrypted artifacts
pub const ENCRYPTED_SUFFIX: &str = ".enc";
/// Suffix used on decrypt when the input does not end in [`ENCRYPTED_SUFFIX`]
pub const DECRYPTED_SUFFIX: &str = ".dec";

#[derive(Debug, Error)]
pub enum CryptError {
    #[error("{} is too short to be an encrypted artifact", .0.display())]
    TooShort(PathBuf),

    #[error("output file already exists: {}", .0.display())]
    OutputExists(PathBuf),

    /// Wrong password or tampered artifact
    #[error("decryption failed (wrong password or corrupted file)")]
    Decrypt,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("encryption failed")]
    Encrypt,

    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CryptError + '_ {
    move |source| CryptError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; KEY_LEN], CryptError> {
    let mut key = [0u8; KEY_LEN];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Where [`decrypt`] writes its output for `path`
pub fn decrypted_path(path: &Path) -> PathBuf {
    let name = path.as_os_str().to_string_lossy();
    match name.strip_suffix(ENCRYPTED_SUFFIX) {
        Some(stem) if !stem.is_empty() && !stem.ends_with('/') => PathBuf::from(stem),
        _ => with_suffix(path, DECRYPTED_SUFFIX),
    }
}

/// Write `data` to a file that must not exist yet
fn write_new(path: &Path, data: &[u8]) -> Result<(), CryptError> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => CryptError::OutputExists(path.to_path_buf()),
            _ => CryptError::Io {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
    let written = file.write_all(data).and_then(|_| file.sync_all());
    drop(file);
    if let Err(e) = written {
        let _ = fs::remove_file(path);
        return Err(CryptError::Io {
            path: path.to_path_buf(),
            source: e,
        });
    }
    Ok(())
}

/// Encrypt `path` into `<path>.enc`
pub fn encrypt(path: &Path, password: &str) -> Result<PathBuf, CryptError> {
    let output = with_suffix(path, ENCRYPTED_SUFFIX);
    if output.exists() {
        return Err(CryptError::OutputExists(output));
    }
    let plaintext = fs::read(path).map_err(io_err(path))?;

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|_| CryptError::Encrypt)?;

    let mut artifact = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    artifact.extend_from_slice(&salt);
    artifact.extend_from_slice(&nonce);
    artifact.extend_from_slice(&ciphertext);
    write_new(&output, &artifact)?;

    info!("Encrypted {:?} -> {:?}", path, output);
    Ok(output)
}

/// Decrypt an artifact produced by [`encrypt`]
pub fn decrypt(path: &Path, password: &str) -> Result<PathBuf, CryptError> {
    let artifact = fs::read(path).map_err(io_err(path))?;
    if artifact.len() <= SALT_LEN + NONCE_LEN {
        return Err(CryptError::TooShort(path.to_path_buf()));
    }
    let output = decrypted_path(path);
    if output.exists() {
        return Err(CryptError::OutputExists(output));
    }

    let (salt, rest) = artifact.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let key = derive_key(password, salt)?;
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptError::Decrypt)?;

    write_new(&output, &plaintext)?;

    info!("Decrypted {:?} -> {:?}", path, output);
    Ok(output)
}
