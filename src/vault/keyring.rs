//! Versioned key material.
//!
//! # Responsibilities
//! - Hold every key version ever configured (retired keys stay readable)
//! - Track the active version used for new writes
//! - Load material from configuration or the environment
//!
//! # Design Decisions
//! - Material is zeroized on drop and redacted from `Debug`
//! - Versions start at 1; rotation always allocates `max + 1`

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::VaultConfig;
use crate::vault::types::{VaultError, VaultResult};

/// AES-256 key length in bytes.
pub const KEY_LEN: usize = 32;

/// A single 256-bit key.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl KeyMaterial {
    pub fn from_bytes(bytes: &[u8]) -> VaultResult<Self> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| VaultError::InvalidKey(format!("expected {} bytes, got {}", KEY_LEN, bytes.len())))?;
        Ok(Self(key))
    }

    pub fn from_base64(encoded: &str) -> VaultResult<Self> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| VaultError::InvalidKey(e.to_string()))?,
        );
        Self::from_bytes(&decoded)
    }

    /// Fresh key from the OS RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        let material = Self(key);
        key.zeroize();
        material
    }

    pub fn to_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.0))
    }

    pub(crate) fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

/// Every known key version plus the active one.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: BTreeMap<u32, Arc<KeyMaterial>>,
    active: Option<u32>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from configuration. The active version defaults to the highest one.
    pub fn from_config(config: &VaultConfig) -> VaultResult<Self> {
        let mut ring = Self::new();
        for key in &config.keys {
            let encoded = match (&key.material, &key.material_env) {
                (Some(material), _) => Zeroizing::new(material.clone()),
                (None, Some(var)) => Zeroizing::new(std::env::var(var).map_err(|_| {
                    VaultError::InvalidKey(format!("environment variable {} is not set", var))
                })?),
                (None, None) => {
                    return Err(VaultError::InvalidKey(format!(
                        "key version {} has no material",
                        key.version
                    )))
                }
            };
            ring.insert(key.version, KeyMaterial::from_base64(&encoded)?)?;
        }

        if let Some(version) = config.active_version {
            ring.set_active(version)?;
        }
        tracing::info!(
            versions = ring.keys.len(),
            active = ?ring.active,
            "Key ring loaded"
        );
        Ok(ring)
    }

    /// Add a key version. The highest version becomes active unless one was set explicitly.
    pub fn insert(&mut self, version: u32, key: KeyMaterial) -> VaultResult<()> {
        if version == 0 {
            return Err(VaultError::InvalidKey("key version 0 is reserved".into()));
        }
        if self.keys.contains_key(&version) {
            return Err(VaultError::DuplicateKeyVersion(version));
        }
        self.keys.insert(version, Arc::new(key));
        if self.active.map_or(true, |active| version > active) {
            self.active = Some(version);
        }
        Ok(())
    }

    pub fn set_active(&mut self, version: u32) -> VaultResult<()> {
        if !self.keys.contains_key(&version) {
            return Err(VaultError::UnknownKeyVersion(version));
        }
        self.active = Some(version);
        Ok(())
    }

    /// Install a new key under the next version and make it active.
    pub fn rotate(&mut self, key: KeyMaterial) -> u32 {
        let version = self.keys.keys().next_back().map_or(1, |v| v + 1);
        self.keys.insert(version, Arc::new(key));
        self.active = Some(version);
        version
    }

    pub fn get(&self, version: u32) -> Option<Arc<KeyMaterial>> {
        self.keys.get(&version).cloned()
    }

    pub fn active(&self) -> Option<(u32, Arc<KeyMaterial>)> {
        let version = self.active?;
        self.get(version).map(|key| (version, key))
    }

    pub fn active_version(&self) -> Option<u32> {
        self.active
    }

    pub fn versions(&self) -> Vec<u32> {
        self.keys.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
