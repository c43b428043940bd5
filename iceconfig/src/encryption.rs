//! Password-at-rest encryption keyed off the local machine's UUID.
//!
//! Relay credentials stored in `config.yaml` are sealed with a key derived
//! from the machine's hardware UUID, so the file is unreadable once copied
//! to another host.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Result};
use base64::Engine;
use sha2::{Digest, Sha256};
use std::process::Command;

const ENCRYPTED_PREFIX: &str = "encrypted:";

/// Reads the machine's hardware UUID: `/etc/machine-id` on Linux, `ioreg` on
/// macOS, `wmic` on Windows.
fn get_machine_uuid() -> Result<String> {
    #[cfg(target_os = "macos")]
    {
        let output = Command::new("ioreg")
            .args(["-d2", "-c", "IOPlatformExpertDevice"])
            .output()?;
        let output_str = String::from_utf8_lossy(&output.stdout);
        for line in output_str.lines() {
            if line.contains("IOPlatformUUID") {
                if let Some(uuid) = line.split('"').nth(3) {
                    return Ok(uuid.to_string());
                }
            }
        }
        Err(anyhow!("failed to extract IOPlatformUUID from ioreg"))
    }

    #[cfg(target_os = "linux")]
    {
        use std::fs;
        if let Ok(uuid) = fs::read_to_string("/etc/machine-id") {
            return Ok(uuid.trim().to_string());
        }
        if let Ok(uuid) = fs::read_to_string("/var/lib/dbus/machine-id") {
            return Ok(uuid.trim().to_string());
        }
        Err(anyhow!("failed to read machine-id"))
    }

    #[cfg(target_os = "windows")]
    {
        let output = Command::new("wmic").args(["csproduct", "get", "UUID"]).output()?;
        let output_str = String::from_utf8_lossy(&output.stdout);
        if let Some(uuid) = output_str.lines().nth(1) {
            return Ok(uuid.trim().to_string());
        }
        Err(anyhow!("failed to extract UUID from wmic"))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        Err(anyhow!("unsupported platform for machine UUID extraction"))
    }
}

fn derive_key() -> Result<[u8; 32]> {
    let machine_uuid = get_machine_uuid()?;
    let mut hasher = Sha256::new();
    hasher.update(machine_uuid.as_bytes());
    hasher.update(b"icebroadcastd-config-encryption-v1");
    let result = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&result);
    Ok(key)
}

/// Encrypts a password, returning `"encrypted:<base64 nonce+ciphertext>"`.
/// The nonce is derived from the plaintext so re-encrypting an unchanged
/// password produces the same ciphertext, keeping the config file diff-quiet.
pub fn encrypt(password: &str) -> Result<String> {
    let key = derive_key()?;
    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|e| anyhow!("failed to create cipher: {e}"))?;

    let mut nonce_bytes = [0u8; 12];
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(b"icebroadcastd-nonce-v1");
    let nonce_hash = hasher.finalize();
    nonce_bytes.copy_from_slice(&nonce_hash[..12]);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, password.as_bytes())
        .map_err(|e| anyhow!("encryption failed: {e}"))?;

    let mut combined = Vec::with_capacity(12 + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    Ok(format!(
        "{ENCRYPTED_PREFIX}{}",
        base64::engine::general_purpose::STANDARD.encode(&combined)
    ))
}

/// Decrypts a value produced by [`encrypt`].
pub fn decrypt(encrypted: &str) -> Result<String> {
    let base64_data = encrypted
        .strip_prefix(ENCRYPTED_PREFIX)
        .ok_or_else(|| anyhow!("encrypted value missing its prefix"))?;

    let key = derive_key()?;
    let cipher =
        Aes256Gcm::new_from_slice(&key).map_err(|e| anyhow!("failed to create cipher: {e}"))?;

    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(base64_data)
        .map_err(|e| anyhow!("invalid base64: {e}"))?;

    if ciphertext.len() < 12 {
        return Err(anyhow!("ciphertext too short to contain a nonce"));
    }
    let nonce = Nonce::from_slice(&ciphertext[..12]);
    let actual_ciphertext = &ciphertext[12..];

    let plaintext = cipher
        .decrypt(nonce, actual_ciphertext)
        .map_err(|e| anyhow!("decryption failed (wrong machine or corrupted data): {e}"))?;

    String::from_utf8(plaintext).map_err(|e| anyhow!("invalid utf-8: {e}"))
}

pub fn is_encrypted(value: &str) -> bool {
    value.starts_with(ENCRYPTED_PREFIX)
}

/// Returns the plaintext password regardless of whether `value` is sealed.
pub fn get_password(value: &str) -> Result<String> {
    if is_encrypted(value) {
        decrypt(value)
    } else {
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_uuid_is_readable() {
        assert!(get_machine_uuid().is_ok());
    }

    #[test]
    fn encrypt_decrypt_round_trips() {
        let password = "SuperSecret123!";
        let encrypted = encrypt(password).unwrap();
        assert!(encrypted.starts_with(ENCRYPTED_PREFIX));
        assert_ne!(encrypted, password);
        assert_eq!(decrypt(&encrypted).unwrap(), password);
    }

    #[test]
    fn encrypting_the_same_password_twice_is_diff_quiet() {
        let a = encrypt("same-password").unwrap();
        let b = encrypt("same-password").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn is_encrypted_detects_the_prefix() {
        assert!(is_encrypted("encrypted:SGVsbG8="));
        assert!(!is_encrypted("plaintext"));
        assert!(!is_encrypted(""));
    }

    #[test]
    fn get_password_handles_both_forms() {
        assert_eq!(get_password("plaintext").unwrap(), "plaintext");
        let encrypted = encrypt("secret").unwrap();
        assert_eq!(get_password(&encrypted).unwrap(), "secret");
    }
}
