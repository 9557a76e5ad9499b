//! Declaration hashing for change detection.
//!
//! Hashes are stored in every state record. Equal hashes mean the declared
//! attributes and explicit dependencies have not changed since the last
//! apply, which lets the diff skip the attribute-by-attribute comparison.

use sha2::{Digest, Sha256};

use crate::graph::Resource;
use crate::state::StateSnapshot;

/// Hasher for computing declaration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new declaration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the hash of a whole declaration set.
    ///
    /// Order-insensitive: resources are hashed in identifier order.
    #[must_use]
    pub fn hash_resources(&self, resources: &[Resource]) -> String {
        let mut hashes: Vec<(String, String)> = resources
            .iter()
            .map(|r| (r.id.to_string(), self.hash_resource(r)))
            .collect();
        hashes.sort();

        let mut hasher = Sha256::new();
        for (id, hash) in hashes {
            hasher.update(id.as_bytes());
            hasher.update([0u8]);
            hasher.update(hash.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Computes the hash of a single declared resource.
    #[must_use]
    pub fn hash_resource(&self, resource: &Resource) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.id.to_string().as_bytes());
        hasher.update([0u8]);

        // Attributes are a BTreeMap and JSON objects keep sorted keys.
        for (name, value) in &resource.attributes {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            let encoded = serde_json::to_vec(value).unwrap_or_default();
            hasher.update(&encoded);
            hasher.update([0u8]);
        }

        let mut deps: Vec<String> = resource.depends_on.iter().map(ToString::to_string).collect();
        deps.sort();
        deps.dedup();
        for dep in deps {
            hasher.update(dep.as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes the hash of a state snapshot.
    ///
    /// Any commit or removal since the snapshot was loaded changes it.
    #[must_use]
    pub fn hash_state(&self, snapshot: &StateSnapshot) -> String {
        let mut records: Vec<_> = snapshot.values().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));

        let mut hasher = Sha256::new();
        for record in records {
            hasher.update(record.id.to_string().as_bytes());
            hasher.update([0u8]);
            hasher.update(record.declaration_hash.as_bytes());
            hasher.update([0u8]);
            hasher.update(record.updated_at.to_rfc3339().as_bytes());
            hasher.update([0u8]);
            hasher.update(serde_json::to_vec(&record.outputs).unwrap_or_default());
            hasher.update([u8::from(record.deposed.is_some())]);
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}
