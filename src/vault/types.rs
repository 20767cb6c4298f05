//! Field encryption types and error definitions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Identity of one encrypted cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellAddress {
    pub table_id: String,
    pub field_id: String,
    pub row_id: String,
}

impl CellAddress {
    pub fn new(table_id: impl Into<String>, field_id: impl Into<String>, row_id: impl Into<String>) -> Self {
        Self {
            table_id: table_id.into(),
            field_id: field_id.into(),
            row_id: row_id.into(),
        }
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}#{}", self.table_id, self.field_id, self.row_id)
    }
}

/// The current encrypted value of a cell.
///
/// Never carries key material; `key_version` names the key in the ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFieldRecord {
    pub address: CellAddress,
    /// Ciphertext with the GCM tag appended.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_LEN],
    pub key_version: u32,
    pub updated_at: DateTime<Utc>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Errors that can occur in the encryption vault.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("no encrypted value stored for {0}")]
    NotFound(CellAddress),

    /// Authentication failed: wrong key, tampered ciphertext or a record
    /// moved to another cell. Never mapped to an empty value.
    #[error("decryption failed for {address}")]
    DecryptionFailure { address: CellAddress },

    #[error("key version {0} is not in the key ring")]
    UnknownKeyVersion(u32),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("key version {0} already exists")]
    DuplicateKeyVersion(u32),

    #[error("encryption failed for {0}")]
    EncryptionFailed(CellAddress),

    #[error("no active encryption key")]
    NoActiveKey,

    #[error("decrypted value is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

/// Result type for vault operations.
pub type VaultResult<T> = Result<T, VaultError>;
