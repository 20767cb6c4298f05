//! Storage for encrypted cells.

use std::fmt::Debug;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::vault::types::{CellAddress, EncryptedFieldRecord, NONCE_LEN};

/// One current record per cell.
pub trait FieldStore: Send + Sync + Debug {
    fn get(&self, address: &CellAddress) -> Option<EncryptedFieldRecord>;

    /// Store a record, replacing the cell's previous one.
    fn put(&self, record: EncryptedFieldRecord) -> Option<EncryptedFieldRecord>;

    /// Replace the record only if the cell still holds the write identified
    /// by `expected_nonce`. Returns whether the swap happened.
    fn replace_if_current(&self, expected_nonce: &[u8; NONCE_LEN], record: EncryptedFieldRecord) -> bool;

    fn remove(&self, address: &CellAddress) -> Option<EncryptedFieldRecord>;

    /// Addresses of records not written under `active_version`.
    fn stale(&self, active_version: u32) -> Vec<CellAddress>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFieldStore {
    records: DashMap<CellAddress, EncryptedFieldRecord>,
}

impl InMemoryFieldStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FieldStore for InMemoryFieldStore {
    fn get(&self, address: &CellAddress) -> Option<EncryptedFieldRecord> {
        self.records.get(address).map(|r| r.value().clone())
    }

    fn put(&self, record: EncryptedFieldRecord) -> Option<EncryptedFieldRecord> {
        self.records.insert(record.address.clone(), record)
    }

    fn replace_if_current(&self, expected_nonce: &[u8; NONCE_LEN], record: EncryptedFieldRecord) -> bool {
        match self.records.entry(record.address.clone()) {
            Entry::Occupied(mut current) if &current.get().nonce == expected_nonce => {
                current.insert(record);
                true
            }
            _ => false,
        }
    }

    fn remove(&self, address: &CellAddress) -> Option<EncryptedFieldRecord> {
        self.records.remove(address).map(|(_, record)| record)
    }

    fn stale(&self, active_version: u32) -> Vec<CellAddress> {
        self.records
            .iter()
            .filter(|r| r.key_version != active_version)
            .map(|r| r.key().clone())
            .collect()
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(row: &str, nonce: u8, version: u32) -> EncryptedFieldRecord {
        EncryptedFieldRecord {
            address: CellAddress::new("t", "f", row),
            ciphertext: vec![1, 2, 3],
            nonce: [nonce; NONCE_LEN],
            key_version: version,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_put_overwrites_cell() {
        let store = InMemoryFieldStore::new();
        assert!(store.put(record("1", 1, 1)).is_none());
        assert!(store.put(record("1", 2, 1)).is_some());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&CellAddress::new("t", "f", "1")).unwrap().nonce, [2; NONCE_LEN]);
    }

    #[test]
    fn test_replace_if_current() {
        let store = InMemoryFieldStore::new();
        store.put(record("1", 1, 1));

        assert!(!store.replace_if_current(&[9; NONCE_LEN], record("1", 3, 2)));
        assert!(store.replace_if_current(&[1; NONCE_LEN], record("1", 3, 2)));
        assert!(!store.replace_if_current(&[1; NONCE_LEN], record("2", 4, 2)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_stale_lists_old_versions() {
        let store = InMemoryFieldStore::new();
        store.put(record("1", 1, 1));
        store.put(record("2", 2, 2));

        assert_eq!(store.stale(2), vec![CellAddress::new("t", "f", "1")]);
        assert!(store.remove(&CellAddress::new("t", "f", "1")).is_some());
        assert!(store.stale(2).is_empty());
    }
}
