//! Value extraction for indices, filters and aggregators. The value model is
//! flat, so the built-in extractors operate on the entry itself; anything
//! richer comes in as a registered external function.

use crate::cache::external::{self, ExtractorFn};
use crate::error::{Error, Result};
use crate::value::Value;
use std::fmt;

#[derive(Clone)]
pub enum Extractor {
    /// Extracts the entry value itself.
    Identity,
    /// Extracts the entry key.
    Key,
    External { name: String, extract: ExtractorFn },
}

impl Extractor {
    /// Resolves a registered external extractor by name.
    pub fn external(name: &str) -> Result<Extractor> {
        let extract = external::extractor(name)?;
        Ok(Extractor::External {
            name: name.to_string(),
            extract,
        })
    }

    pub fn extract(&self, key: &Value, value: &Value) -> Result<Value> {
        match self {
            Extractor::Identity => Ok(value.clone()),
            Extractor::Key => Ok(key.clone()),
            Extractor::External { extract, .. } => extract(value),
        }
    }

    /// Wire form: a tagged list understood by `from_value` on the peer.
    pub fn to_value(&self) -> Value {
        match self {
            Extractor::Identity => Value::List(vec![Value::from("identity")]),
            Extractor::Key => Value::List(vec![Value::from("key")]),
            Extractor::External { name, .. } => {
                Value::List(vec![Value::from("external"), Value::String(name.clone())])
            }
        }
    }

    pub fn from_value(value: &Value) -> Result<Extractor> {
        let items = match value {
            Value::List(items) => items,
            _ => return Err(Error::Serialization("extractor must be a tagged list".to_string())),
        };

        match items.first() {
            Some(Value::String(tag)) if tag == "identity" => Ok(Extractor::Identity),
            Some(Value::String(tag)) if tag == "key" => Ok(Extractor::Key),
            Some(Value::String(tag)) if tag == "external" => match items.get(1) {
                Some(Value::String(name)) => Extractor::external(name),
                _ => Err(Error::Serialization("external extractor missing its name".to_string())),
            },
            _ => Err(Error::Serialization("unknown extractor tag".to_string())),
        }
    }
}

impl PartialEq for Extractor {
    fn eq(&self, other: &Extractor) -> bool {
        match (self, other) {
            (Extractor::Identity, Extractor::Identity) => true,
            (Extractor::Key, Extractor::Key) => true,
            (Extractor::External { name: a, .. }, Extractor::External { name: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Eq for Extractor {}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Extractor::Identity => write!(f, "Identity"),
            Extractor::Key => write!(f, "Key"),
            Extractor::External { name, .. } => write!(f, "External({})", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_builtins() {
        let key = Value::from("k");
        let value = Value::Int(10);

        assert_eq!(Extractor::Identity.extract(&key, &value).unwrap(), Value::Int(10));
        assert_eq!(Extractor::Key.extract(&key, &value).unwrap(), Value::from("k"));
    }

    #[test]
    fn test_external_roundtrip() {
        external::register_extractor(
            "double-it",
            Arc::new(|value| match value {
                Value::Int(i) => Ok(Value::Int(i * 2)),
                other => Err(Error::Serialization(format!("cannot double {:?}", other))),
            }),
        );

        let extractor = Extractor::external("double-it").unwrap();
        assert_eq!(extractor.extract(&Value::Null, &Value::Int(4)).unwrap(), Value::Int(8));
        assert!(extractor.extract(&Value::Null, &Value::from("four")).is_err());

        let revived = Extractor::from_value(&extractor.to_value()).unwrap();
        assert_eq!(revived, extractor);
    }

    #[test]
    fn test_equality_by_shape_and_name() {
        external::register_extractor("same", Arc::new(|v| Ok(v.clone())));

        assert_eq!(Extractor::Identity, Extractor::Identity);
        assert_ne!(Extractor::Identity, Extractor::Key);
        assert_eq!(Extractor::external("same").unwrap(), Extractor::external("same").unwrap());
    }

    #[test]
    fn test_wire_roundtrip_builtins() {
        for extractor in &[Extractor::Identity, Extractor::Key] {
            assert_eq!(&Extractor::from_value(&extractor.to_value()).unwrap(), extractor);
        }
    }
}
