//! # Identity Store
//!
//! Maps the fields of a [`DeviceIdentity`] onto namespaced storage keys
//! (`<name>.ProductKey`, `<name>.ID`, ...):
//! - `load` reads all seven keys, tolerating missing ones
//! - `save` writes only non-empty fields (partial merge)
//! - `refresh` loads and fills the gaps of an in-memory identity
//!
//! Writes for one device name are serialized through a per-name lock
//! shared by every clone of the store.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use shared::{
    constants::*,
    error::AgentResult,
    types::DeviceIdentity,
};

use crate::storage::Storage;

/// Persists device identities into a [`Storage`] backend
#[derive(Clone)]
pub struct IdentityStore {
    /// Backend
    storage: Arc<dyn Storage>,

    /// One write lock per device name
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl IdentityStore {
    /// Create a store on top of `storage`
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The underlying backend
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Read the persisted identity of the device called `name`.
    ///
    /// Missing keys yield empty values. Malformed ids or tokens are logged
    /// and treated as empty. Backend failures abort the load.
    pub async fn load(&self, name: &str) -> AgentResult<DeviceIdentity> {
        let get = |field: &'static str| {
            let key = storage_key(name, field);
            let storage = Arc::clone(&self.storage);
            async move { storage.get(&key).await.map(Option::unwrap_or_default) }
        };

        let product_key = get(KEY_PRODUCT_KEY).await?;
        let stored_name = get(KEY_NAME).await?;
        let secret = get(KEY_SECRET).await?;
        let version = get(KEY_VERSION).await?;
        let id_raw = get(KEY_ID).await?;
        let access = get(KEY_ACCESS).await?;
        let token_raw = get(KEY_TOKEN).await?;

        let id = if id_raw.is_empty() {
            0
        } else {
            id_raw.parse::<i64>().unwrap_or_else(|e| {
                warn!(device = %name, value = %id_raw, error = %e, "Ignoring malformed stored id");
                0
            })
        };

        let token = hex::decode(&token_raw).unwrap_or_else(|e| {
            warn!(device = %name, error = %e, "Ignoring malformed stored token");
            Vec::new()
        });

        debug!(device = %name, id, "Identity loaded from storage");

        Ok(DeviceIdentity {
            product_key,
            name: stored_name,
            version,
            secret,
            id,
            token,
            access,
        })
    }

    /// Persist every non-empty field of `identity`.
    ///
    /// Empty fields are skipped, so values persisted earlier survive.
    pub async fn save(&self, identity: &DeviceIdentity) -> AgentResult<()> {
        let lock = self.lock_for(&identity.name);
        let _guard = lock.lock().await;

        let name = identity.name.as_str();
        let mut fields: Vec<(&str, String)> = Vec::with_capacity(7);

        if !identity.product_key.is_empty() {
            fields.push((KEY_PRODUCT_KEY, identity.product_key.clone()));
        }
        if !identity.name.is_empty() {
            fields.push((KEY_NAME, identity.name.clone()));
        }
        if !identity.secret.is_empty() {
            fields.push((KEY_SECRET, identity.secret.clone()));
        }
        if !identity.version.is_empty() {
            fields.push((KEY_VERSION, identity.version.clone()));
        }
        if identity.id != 0 {
            fields.push((KEY_ID, identity.id_string()));
        }
        if !identity.token.is_empty() {
            fields.push((KEY_TOKEN, identity.token_hex()));
        }
        if !identity.access.is_empty() {
            fields.push((KEY_ACCESS, identity.access.clone()));
        }

        for (field, value) in &fields {
            self.storage.set(&storage_key(name, field), value).await?;
        }

        debug!(device = %name, fields = fields.len(), "Identity saved to storage");
        Ok(())
    }

    /// Load the persisted identity and fill the empty fields of `identity`
    pub async fn refresh(&self, identity: &mut DeviceIdentity) -> AgentResult<()> {
        let persisted = self.load(&identity.name).await?;
        identity.merge_missing(persisted);
        Ok(())
    }
}
