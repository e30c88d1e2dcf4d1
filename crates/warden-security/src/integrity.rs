use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use ring::digest::{SHA256, digest};
use ring::signature::{ED25519, UnparsedPublicKey};
use tracing::{info, warn};
use warden_common::{Error, Result};

use crate::manifest::{IntegrityMetadata, PluginManifest, stays_inside};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex_encode(digest(&SHA256, data).as_ref())
}

/// First 16 hex characters of the SHA-256 of a raw public key.
pub fn key_fingerprint(public_key: &[u8]) -> String {
    let mut full = sha256_hex(public_key);
    full.truncate(16);
    full
}

/// The byte string a plugin signer signs: one `path:sha256` line per file,
/// sorted by path.
pub fn canonical_checksums(integrity: &IntegrityMetadata) -> Vec<u8> {
    let mut out = String::new();
    for (path, checksum) in &integrity.checksums {
        out.push_str(path);
        out.push(':');
        out.push_str(&checksum.to_ascii_lowercase());
        out.push('\n');
    }
    out.into_bytes()
}

/// Verify the manifest's integrity metadata against the files under `root`.
///
/// Every listed file must hash to its recorded checksum. When a
/// `trusted_key` (raw 32-byte Ed25519 public key) is supplied, the manifest
/// must also carry a valid signature from that key and, if present, a
/// matching signer fingerprint. A manifest without integrity metadata passes
/// only when no trusted key is required.
pub fn verify_integrity(
    manifest: &PluginManifest,
    root: &Path,
    trusted_key: Option<&[u8]>,
) -> Result<()> {
    let Some(integrity) = manifest.integrity.as_ref() else {
        if trusted_key.is_some() {
            return Err(Error::Integrity(format!(
                "plugin '{}' is unsigned but a trusted signer is required",
                manifest.name
            )));
        }
        warn!("plugin '{}' has no integrity metadata", manifest.name);
        return Ok(());
    };

    for (relative, expected) in &integrity.checksums {
        if !stays_inside(Path::new(relative)) {
            return Err(Error::Integrity(format!(
                "checksum path '{relative}' escapes the plugin directory"
            )));
        }
        let path = root.join(relative);
        let data = std::fs::read(&path).map_err(|e| {
            Error::Integrity(format!("failed to read {}: {e}", path.display()))
        })?;
        let actual = sha256_hex(&data);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(Error::Integrity(format!(
                "SHA-256 mismatch for {relative}: expected {expected}, got {actual}"
            )));
        }
    }

    if let Some(key) = trusted_key {
        verify_signature(integrity, key)?;
        info!(
            "verified signature for plugin '{}' (signer {})",
            manifest.name,
            key_fingerprint(key)
        );
    }

    Ok(())
}

fn verify_signature(integrity: &IntegrityMetadata, public_key: &[u8]) -> Result<()> {
    let signature_b64 = integrity
        .signature
        .as_deref()
        .ok_or_else(|| Error::Integrity("manifest is not signed".into()))?;

    if let Some(expected) = integrity.signer_fingerprint.as_deref() {
        let actual = key_fingerprint(public_key);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(Error::Integrity(format!(
                "signer fingerprint mismatch: manifest names {expected}, trusted key is {actual}"
            )));
        }
    }

    let signature = BASE64
        .decode(signature_b64)
        .map_err(|e| Error::Integrity(format!("invalid signature base64: {e}")))?;

    UnparsedPublicKey::new(&ED25519, public_key)
        .verify(&canonical_checksums(integrity), &signature)
        .map_err(|_| Error::Integrity("Ed25519 signature verification failed".into()))
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push(HEX_CHARS[(b >> 4) as usize] as char);
        s.push(HEX_CHARS[(b & 0xf) as usize] as char);
    }
    s
}
