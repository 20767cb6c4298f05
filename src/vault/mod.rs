//! Field-level encryption subsystem.
//!
//! # Data Flow
//! ```text
//! encrypt(table, field, row, plaintext)
//!     → keyring.rs (active version + key)
//!     → cipher.rs (AES-256-GCM, random nonce, AAD = address + version)
//!     → store.rs (overwrite the cell's single record)
//!
//! decrypt(table, field, row)
//!     → store.rs → keyring.rs (key named by the record) → cipher.rs
//! ```
//!
//! # Design Decisions
//! - Rotation never re-encrypts in bulk; cells migrate on their next write
//!   or through an explicit `reencrypt`
//! - Authentication failure is a hard error, never an empty value
//! - No ephemeral fallback key: without configured material, writes fail

pub mod cipher;
pub mod keyring;
pub mod store;
pub mod types;
#[allow(clippy::module_inception)]
pub mod vault;

pub use keyring::{KeyMaterial, KeyRing, KEY_LEN};
pub use store::{FieldStore, InMemoryFieldStore};
pub use types::{CellAddress, EncryptedFieldRecord, VaultError, VaultResult, NONCE_LEN};
pub use vault::EncryptionVault;
