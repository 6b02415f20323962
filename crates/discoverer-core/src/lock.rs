//! Lock holder tokens and lock key helpers.
//!
//! Locks are advisory: acquisition is a single atomic set-if-absent, there is
//! no lease or expiry, and release only succeeds for the holder that acquired
//! the key. A holder that dies leaves its key locked until an operator calls
//! [`DistributedLock::force_release`](crate::traits::DistributedLock::force_release).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque token proving ownership of an acquired lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockHolder(String);

impl LockHolder {
    /// Mints a fresh random holder token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for LockHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A currently held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub key: String,
    pub holder: LockHolder,
    pub acquired_at: DateTime<Utc>,
}

/// Key guarding the build of one dataset address.
pub fn dataset_build_key(name: &str, format: &str, config_hash: &str) -> String {
    format!("dataset-build:{}:{}:{}", name, format, config_hash)
}
