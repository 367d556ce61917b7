//! Protocol factories by name.

use std::{collections::HashMap, sync::{Arc, RwLock}};

use entity_bus_core::ProtocolFactory;

/// Protocol factories, owned by a session manager instead of a global table.
#[derive(Default)]
pub struct ProtocolRegistry {
    factories: RwLock<HashMap<String, Arc<dyn ProtocolFactory>>>,
}

impl ProtocolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, factory: Arc<dyn ProtocolFactory>) {
        let name = name.into();
        match self.factories.write() {
            Ok(mut factories) => {
                tracing::debug!("registered protocol {name}");
                factories.insert(name, factory);
            }
            Err(e) => tracing::error!("protocol registry poisoned: {e}"),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ProtocolFactory>> {
        self.factories.read().ok()?.get(name).cloned()
    }
}
