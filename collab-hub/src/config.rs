//! Hub configuration.

use crate::store::HttpFileStore;

/// Tunables for a hub instance.
///
/// Defaults target a local Orion file server on port 8081 with the hub
/// itself on 8080.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Base URL of the file service, trailing slash included.
    pub base_url: String,
    /// Load endpoint path, relative to `base_url`.
    pub load_path: String,
    /// Save endpoint path, relative to `base_url`.
    pub save_path: String,
    /// Checkpoint interval: save after every Nth accepted operation.
    pub save_every: u64,
    /// Gateway listen address.
    pub bind_addr: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8081/".to_string(),
            load_path: "sharedWorkspace/tree/load/".to_string(),
            save_path: "sharedWorkspace/tree/save/".to_string(),
            save_every: 5,
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl HubConfig {
    /// Build the HTTP file store this configuration points at.
    pub fn file_store(&self) -> HttpFileStore {
        HttpFileStore::new(&self.base_url, &self.load_path, &self.save_path)
    }
}
