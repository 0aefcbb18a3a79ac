//! Process-wide protocol registry. Protocols are registered during process
//! startup; the first connection to open seals the registry, after which each
//! connection works from its own snapshot and never touches the registry lock
//! on the message path.

use crate::error::{Error, Result};
use crate::net::message::MessageFactory;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::sync::{Arc, Mutex};

struct RegistryState {
    // name -> version -> factory
    protocols: HashMap<String, HashMap<i32, Arc<dyn MessageFactory>>>,
    sealed: bool,
}

lazy_static! {
    static ref REGISTRY: Mutex<RegistryState> = Mutex::new(RegistryState {
        protocols: HashMap::new(),
        sealed: false,
    });
}

/// Registers one protocol version. Registering the same `(name, version)`
/// again is a no-op, so module initializers may run repeatedly; registering a
/// new entry after the registry is sealed is a configuration error.
pub fn register(factory: Arc<dyn MessageFactory>) -> Result<()> {
    let name = factory.protocol_name().to_string();
    let version = factory.version();
    let mut guard = REGISTRY.lock().unwrap();
    let state = &mut *guard;

    let versions = state.protocols.entry(name.clone()).or_insert_with(HashMap::new);
    if versions.contains_key(&version) {
        return Ok(());
    }

    if state.sealed {
        return Err(Error::Config(format!(
            "protocol {} v{} registered after a connection opened",
            name, version
        )));
    }

    versions.insert(version, factory);
    Ok(())
}

/// A connection-local view of the registry, taken when the connection opens.
/// Lookups after that point are plain map reads on connection-owned state.
#[derive(Clone)]
pub struct ProtocolSnapshot {
    factories: HashMap<String, Arc<dyn MessageFactory>>,
}

impl ProtocolSnapshot {
    /// Snapshot the current registry, selecting the newest version of each
    /// protocol, and seal the registry against further registration.
    pub fn acquire() -> ProtocolSnapshot {
        // The built-in protocols are part of every connection regardless of
        // registration order in the embedding process.
        crate::net::control::register_protocol();
        crate::remote::protocol::register_protocols();

        let mut state = REGISTRY.lock().unwrap();
        state.sealed = true;

        let mut factories = HashMap::new();
        for (name, versions) in state.protocols.iter() {
            if let Some(newest) = versions.keys().max() {
                factories.insert(name.clone(), versions[newest].clone());
            }
        }

        ProtocolSnapshot { factories }
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&Arc<dyn MessageFactory>> {
        self.factories.get(name)
    }

    /// Checks that an exact `(name, version)` pair is available.
    pub fn supports(&self, name: &str, version: i32) -> bool {
        self.factories
            .get(name)
            .map(|factory| factory.version() == version)
            .unwrap_or(false)
    }

    /// The `(name, version)` pairs announced in the open handshake.
    pub fn announce(&self) -> Vec<(String, i32)> {
        let mut protocols: Vec<_> = self
            .factories
            .iter()
            .map(|(name, factory)| (name.clone(), factory.version()))
            .collect();
        protocols.sort();
        protocols
    }
}
