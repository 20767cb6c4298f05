//! Encrypt-on-write, decrypt-on-read field vault.

use std::sync::{Arc, PoisonError, RwLock};

use crate::clock::SharedClock;
use crate::observability::metrics;
use crate::vault::cipher;
use crate::vault::keyring::{KeyMaterial, KeyRing};
use crate::vault::store::FieldStore;
use crate::vault::types::{CellAddress, EncryptedFieldRecord, VaultError, VaultResult};

/// Field-level encryption over a [`FieldStore`].
#[derive(Debug)]
pub struct EncryptionVault {
    keys: RwLock<KeyRing>,
    store: Arc<dyn FieldStore>,
    clock: SharedClock,
}

impl EncryptionVault {
    pub fn new(keys: KeyRing, store: Arc<dyn FieldStore>, clock: SharedClock) -> Self {
        if let Some(version) = keys.active_version() {
            metrics::record_active_key_version(version);
        }
        Self {
            keys: RwLock::new(keys),
            store,
            clock,
        }
    }

    /// Encrypt `plaintext` under the active key and store it as the cell's value.
    pub fn encrypt(
        &self,
        table_id: &str,
        field_id: &str,
        row_id: &str,
        plaintext: &[u8],
    ) -> VaultResult<EncryptedFieldRecord> {
        let address = CellAddress::new(table_id, field_id, row_id);
        let record = self.seal(address, plaintext)?;
        self.store.put(record.clone());

        tracing::debug!(address = %record.address, key_version = record.key_version, "Field encrypted");
        Ok(record)
    }

    /// Decrypt the current value of a cell.
    pub fn decrypt(&self, table_id: &str, field_id: &str, row_id: &str) -> VaultResult<Vec<u8>> {
        let address = CellAddress::new(table_id, field_id, row_id);
        let record = self.store.get(&address).ok_or(VaultError::NotFound(address))?;
        self.decrypt_record(&record)
    }

    /// Decrypt a record obtained elsewhere, using the key version it names.
    pub fn decrypt_record(&self, record: &EncryptedFieldRecord) -> VaultResult<Vec<u8>> {
        let key = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(record.key_version)
            .ok_or(VaultError::UnknownKeyVersion(record.key_version))?;

        cipher::open(&key, record).inspect_err(|_| {
            metrics::record_decrypt_failure();
            tracing::warn!(
                address = %record.address,
                key_version = record.key_version,
                "Field decryption failed"
            );
        })
    }

    pub fn encrypt_str(
        &self,
        table_id: &str,
        field_id: &str,
        row_id: &str,
        plaintext: &str,
    ) -> VaultResult<EncryptedFieldRecord> {
        self.encrypt(table_id, field_id, row_id, plaintext.as_bytes())
    }

    pub fn decrypt_string(&self, table_id: &str, field_id: &str, row_id: &str) -> VaultResult<String> {
        Ok(String::from_utf8(self.decrypt(table_id, field_id, row_id)?)?)
    }

    /// Make `key` the active key. Existing records keep their version and stay readable.
    pub fn rotate_key(&self, key: KeyMaterial) -> u32 {
        let version = self.keys.write().unwrap_or_else(PoisonError::into_inner).rotate(key);
        metrics::record_active_key_version(version);
        tracing::info!(key_version = version, "Encryption key rotated");
        version
    }

    /// Re-encrypt one cell under the active key if it was written under an older one.
    ///
    /// Returns `false` when the record is already current or was overwritten concurrently.
    pub fn reencrypt(&self, address: &CellAddress) -> VaultResult<bool> {
        let record = self
            .store
            .get(address)
            .ok_or_else(|| VaultError::NotFound(address.clone()))?;
        if Some(record.key_version) == self.active_key_version() {
            return Ok(false);
        }

        let plaintext = zeroize::Zeroizing::new(self.decrypt_record(&record)?);
        let fresh = self.seal(address.clone(), &plaintext)?;
        let version = fresh.key_version;
        let swapped = self.store.replace_if_current(&record.nonce, fresh);

        if swapped {
            tracing::debug!(
                address = %address,
                from = record.key_version,
                to = version,
                "Field re-encrypted"
            );
        }
        Ok(swapped)
    }

    /// Cells still encrypted under a retired key.
    pub fn stale_records(&self) -> Vec<CellAddress> {
        match self.active_key_version() {
            Some(active) => self.store.stale(active),
            None => Vec::new(),
        }
    }

    /// Remove a cell's value. Returns whether one existed.
    pub fn delete(&self, address: &CellAddress) -> bool {
        let removed = self.store.remove(address).is_some();
        if removed {
            tracing::debug!(address = %address, "Field deleted");
        }
        removed
    }

    pub fn record(&self, address: &CellAddress) -> Option<EncryptedFieldRecord> {
        self.store.get(address)
    }

    pub fn active_key_version(&self) -> Option<u32> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).active_version()
    }

    pub fn key_versions(&self) -> Vec<u32> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).versions()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    fn seal(&self, address: CellAddress, plaintext: &[u8]) -> VaultResult<EncryptedFieldRecord> {
        let (key_version, key) = self
            .keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active()
            .ok_or(VaultError::NoActiveKey)?;

        let (nonce, ciphertext) = cipher::seal(&key, &address, key_version, plaintext)?;
        Ok(EncryptedFieldRecord {
            address,
            ciphertext,
            nonce,
            key_version,
            updated_at: self.clock.now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::vault::store::InMemoryFieldStore;

    fn vault() -> EncryptionVault {
        let mut keys = KeyRing::new();
        keys.rotate(KeyMaterial::generate());
        EncryptionVault::new(keys, Arc::new(InMemoryFieldStore::new()), Arc::new(SystemClock::new()))
    }

    #[test]
    fn test_round_trip() {
        let vault = vault();
        let record = vault.encrypt_str("users", "email", "7", "ada@example.com").unwrap();

        assert_eq!(record.key_version, 1);
        assert_eq!(vault.decrypt_string("users", "email", "7").unwrap(), "ada@example.com");
    }

    #[test]
    fn test_missing_cell() {
        let vault = vault();
        assert!(matches!(vault.decrypt("users", "email", "404"), Err(VaultError::NotFound(_))));
    }

    #[test]
    fn test_no_active_key() {
        let vault = EncryptionVault::new(
            KeyRing::new(),
            Arc::new(InMemoryFieldStore::new()),
            Arc::new(SystemClock::new()),
        );
        assert!(matches!(vault.encrypt("t", "f", "r", b"x"), Err(VaultError::NoActiveKey)));
    }

    #[test]
    fn test_tampered_ciphertext_is_hard_error() {
        let vault = vault();
        let mut record = vault.encrypt("t", "f", "r", b"secret").unwrap();
        record.ciphertext[0] ^= 0x01;

        assert!(matches!(
            vault.decrypt_record(&record),
            Err(VaultError::DecryptionFailure { .. })
        ));
    }

    #[test]
    fn test_unknown_key_version() {
        let vault = vault();
        let mut record = vault.encrypt("t", "f", "r", b"secret").unwrap();
        record.key_version = 9;
        assert!(matches!(vault.decrypt_record(&record), Err(VaultError::UnknownKeyVersion(9))));
    }

    #[test]
    fn test_rotation_and_lazy_reencryption() {
        let vault = vault();
        vault.encrypt("t", "f", "1", b"one").unwrap();
        vault.encrypt("t", "f", "2", b"two").unwrap();

        assert_eq!(vault.rotate_key(KeyMaterial::generate()), 2);
        assert_eq!(vault.stale_records().len(), 2);
        assert_eq!(vault.decrypt("t", "f", "1").unwrap(), b"one");

        // A write moves the cell to the new key.
        vault.encrypt("t", "f", "2", b"two v2").unwrap();
        assert_eq!(vault.stale_records(), vec![CellAddress::new("t", "f", "1")]);

        let address = CellAddress::new("t", "f", "1");
        assert!(vault.reencrypt(&address).unwrap());
        assert!(!vault.reencrypt(&address).unwrap());
        assert!(vault.stale_records().is_empty());
        assert_eq!(vault.record(&address).unwrap().key_version, 2);
        assert_eq!(vault.decrypt("t", "f", "1").unwrap(), b"one");
    }

    #[test]
    fn test_delete() {
        let vault = vault();
        vault.encrypt("t", "f", "r", b"x").unwrap();
        let address = CellAddress::new("t", "f", "r");

        assert!(vault.delete(&address));
        assert!(!vault.delete(&address));
        assert!(vault.is_empty());
    }
}
