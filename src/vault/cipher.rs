//! AES-256-GCM sealing of single cells.
//!
//! The associated data binds the cell address and key version, so a record
//! copied to another cell or relabelled with another version fails to open.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::vault::keyring::KeyMaterial;
use crate::vault::types::{CellAddress, EncryptedFieldRecord, VaultError, VaultResult, NONCE_LEN};

const AAD_TAG: &[u8] = b"security-substrate/field/v1";

/// Encrypt under a fresh random nonce. Returns `(nonce, ciphertext || tag)`.
pub(crate) fn seal(
    key: &KeyMaterial,
    address: &CellAddress,
    key_version: u32,
    plaintext: &[u8],
) -> VaultResult<([u8; NONCE_LEN], Vec<u8>)> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| VaultError::InvalidKey(e.to_string()))?;

    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let aad = associated_data(address, key_version);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| VaultError::EncryptionFailed(address.clone()))?;

    Ok((nonce, ciphertext))
}

/// Authenticate and decrypt a stored record with the given key.
pub(crate) fn open(key: &KeyMaterial, record: &EncryptedFieldRecord) -> VaultResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|e| VaultError::InvalidKey(e.to_string()))?;
    let aad = associated_data(&record.address, record.key_version);

    cipher
        .decrypt(
            Nonce::from_slice(&record.nonce),
            Payload {
                msg: &record.ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| VaultError::DecryptionFailure {
            address: record.address.clone(),
        })
}

/// Length-prefixed so that `("ab", "c")` and `("a", "bc")` differ.
fn associated_data(address: &CellAddress, key_version: u32) -> Vec<u8> {
    let parts = [
        address.table_id.as_bytes(),
        address.field_id.as_bytes(),
        address.row_id.as_bytes(),
    ];
    let mut aad = Vec::with_capacity(AAD_TAG.len() + 4 + parts.iter().map(|p| p.len() + 4).sum::<usize>());
    aad.extend_from_slice(AAD_TAG);
    for part in parts {
        aad.extend_from_slice(&(part.len() as u32).to_be_bytes());
        aad.extend_from_slice(part);
    }
    aad.extend_from_slice(&key_version.to_be_bytes());
    aad
}
