//! Pluggable value serialization. The codec delegates every user value to the
//! serializer negotiated for the channel; the wire format of message headers
//! and primitive fields is fixed and does not go through here.

use crate::error::{Error, Result};
use crate::value::Value;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::sync::{Arc, Mutex};

pub trait Serializer: Send + Sync {
    /// Registry name, exchanged as the serializer tag at channel open.
    fn name(&self) -> &str;

    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()>;

    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// Default serializer: serde + bincode over the value union.
pub struct BincodeSerializer;

impl Serializer for BincodeSerializer {
    fn name(&self) -> &str {
        "bincode"
    }

    fn encode(&self, value: &Value, out: &mut Vec<u8>) -> Result<()> {
        bincode::serialize_into(out, value).map_err(|err| Error::Serialization(err.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        bincode::deserialize(bytes).map_err(|err| Error::Serialization(err.to_string()))
    }
}

lazy_static! {
    static ref REGISTRY: Mutex<HashMap<String, Arc<dyn Serializer>>> = {
        let mut map: HashMap<String, Arc<dyn Serializer>> = HashMap::new();
        map.insert("bincode".to_string(), Arc::new(BincodeSerializer));
        Mutex::new(map)
    };
}

/// Registers a serializer under its own name. Re-registering a name replaces
/// the previous entry.
pub fn register(serializer: Arc<dyn Serializer>) {
    let name = serializer.name().to_string();
    REGISTRY.lock().unwrap().insert(name, serializer);
}

/// Resolves a serializer tag to its implementation.
pub fn lookup(name: &str) -> Result<Arc<dyn Serializer>> {
    REGISTRY
        .lock()
        .unwrap()
        .get(name)
        .cloned()
        .ok_or_else(|| Error::Config(format!("unknown serializer \"{}\"", name)))
}
