use crate::error::{CommError, Result};
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Process-wide table of live transport handles, keyed by the
/// backend-assigned resource key.
///
/// The registry guarantees at most one live handle per key inside a
/// process: attaching to a key someone already holds hands back the same
/// handle. All mutation happens behind one lock.
#[derive(Default)]
pub struct TransportRegistry {
    entries: Mutex<HashMap<String, Arc<dyn Transport>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handle under its own key and return the handle that ended
    /// up registered. When the key is already live the existing handle wins
    /// and the argument is discarded.
    pub fn insert(&self, transport: Arc<dyn Transport>) -> Arc<dyn Transport> {
        let key = transport.key().to_string();
        let mut entries = self.entries.lock();
        match entries.entry(key) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                debug!("Registered transport '{}'", entry.key());
                entry.insert(Arc::clone(&transport));
                transport
            }
        }
    }

    /// Remove a key, returning its handle. Unknown keys are a
    /// [`CommError::RegistrationConflict`]; close paths that can race
    /// removal treat that as a no-op at the call site.
    pub fn unregister(&self, key: &str) -> Result<Arc<dyn Transport>> {
        match self.entries.lock().remove(key) {
            Some(transport) => {
                debug!("Unregistered transport '{}'", key);
                Ok(transport)
            }
            None => Err(CommError::RegistrationConflict {
                key: key.to_string(),
            }),
        }
    }

    /// The live handle for a key, if this process holds one.
    pub fn get(&self, key: &str) -> Option<Arc<dyn Transport>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Keys of every live handle, for diagnostics and shutdown sweeps.
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }
}
