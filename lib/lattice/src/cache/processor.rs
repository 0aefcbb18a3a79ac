//! Entry processors: atomic read-modify-write units executed against one
//! entry under its key lock.

use crate::cache::external::{self, ProcessorFn};
use crate::cache::filter::Filter;
use crate::error::{Error, Result};
use crate::value::{Tag, Value};
use std::fmt;

/// Mutable view over `(key, value, present)` handed to a processor. The
/// engine commits the net effect after the processor returns.
pub struct EntryView {
    key: Value,
    value: Option<Value>,
    mutated: bool,
}

impl EntryView {
    pub(crate) fn new(key: Value, value: Option<Value>) -> EntryView {
        EntryView {
            key,
            value,
            mutated: false,
        }
    }

    #[inline]
    pub fn key(&self) -> &Value {
        &self.key
    }

    #[inline]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = Some(value);
        self.mutated = true;
    }

    pub fn remove(&mut self) {
        self.value = None;
        self.mutated = true;
    }

    /// `(resulting value, whether the processor touched the entry)`.
    pub(crate) fn into_effect(self) -> (Option<Value>, bool) {
        (self.value, self.mutated)
    }
}

#[derive(Clone)]
pub enum Processor {
    /// Unconditional put; returns the previous value as an option-list.
    Put { value: Value },
    /// Removes the entry; returns the removed value as an option-list.
    Remove,
    /// Puts only when the filter matches the current entry; returns whether
    /// the put was applied.
    ConditionalPut { filter: Filter, value: Value },
    /// Adds `delta` to a numeric entry (absent counts as zero) and returns
    /// the new value.
    Increment { delta: i64 },
    External { name: String, apply: ProcessorFn },
}

impl Processor {
    pub fn put(value: Value) -> Processor {
        Processor::Put { value }
    }

    pub fn conditional_put(filter: Filter, value: Value) -> Processor {
        Processor::ConditionalPut { filter, value }
    }

    pub fn increment(delta: i64) -> Processor {
        Processor::Increment { delta }
    }

    /// Resolves a registered external processor by name.
    pub fn external(name: &str) -> Result<Processor> {
        let apply = external::processor(name)?;
        Ok(Processor::External {
            name: name.to_string(),
            apply,
        })
    }

    pub fn apply(&self, entry: &mut EntryView) -> Result<Value> {
        match self {
            Processor::Put { value } => {
                let old = Value::from_option(entry.value().cloned());
                entry.set_value(value.clone());
                Ok(old)
            }
            Processor::Remove => {
                let old = Value::from_option(entry.value().cloned());
                entry.remove();
                Ok(old)
            }
            Processor::ConditionalPut { filter, value } => {
                let current = entry.value().cloned().unwrap_or(Value::Null);
                if filter.evaluate(entry.key(), &current)? {
                    entry.set_value(value.clone());
                    Ok(Value::Bool(true))
                } else {
                    Ok(Value::Bool(false))
                }
            }
            Processor::Increment { delta } => {
                let current = match entry.value() {
                    None => 0,
                    Some(value) => match value.convert(Tag::Long) {
                        Some(Value::Long(l)) => l,
                        _ => return Err(Error::Unsupported("increment on a non-numeric value")),
                    },
                };
                let next = current + delta;
                entry.set_value(Value::Long(next));
                Ok(Value::Long(next))
            }
            Processor::External { apply, .. } => apply(entry),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Processor::Put { value } => Value::List(vec![Value::from("put"), value.clone()]),
            Processor::Remove => Value::List(vec![Value::from("remove")]),
            Processor::ConditionalPut { filter, value } => Value::List(vec![
                Value::from("conditional-put"),
                filter.to_value(),
                value.clone(),
            ]),
            Processor::Increment { delta } => {
                Value::List(vec![Value::from("increment"), Value::Long(*delta)])
            }
            Processor::External { name, .. } => {
                Value::List(vec![Value::from("external"), Value::String(name.clone())])
            }
        }
    }

    pub fn from_value(value: &Value) -> Result<Processor> {
        let items = match value {
            Value::List(items) => items,
            _ => return Err(Error::Serialization("processor must be a tagged list".to_string())),
        };

        let tag = match items.first() {
            Some(Value::String(tag)) => tag.as_str(),
            _ => return Err(Error::Serialization("processor missing its tag".to_string())),
        };

        match tag {
            "put" => match items.get(1) {
                Some(value) => Ok(Processor::put(value.clone())),
                None => Err(Error::Serialization("put processor needs a value".to_string())),
            },
            "remove" => Ok(Processor::Remove),
            "conditional-put" => match (items.get(1), items.get(2)) {
                (Some(filter), Some(value)) => Ok(Processor::ConditionalPut {
                    filter: Filter::from_value(filter)?,
                    value: value.clone(),
                }),
                _ => Err(Error::Serialization("conditional put needs filter and value".to_string())),
            },
            "increment" => match items.get(1) {
                Some(Value::Long(delta)) => Ok(Processor::increment(*delta)),
                _ => Err(Error::Serialization("increment needs a delta".to_string())),
            },
            "external" => match items.get(1) {
                Some(Value::String(name)) => Processor::external(name),
                _ => Err(Error::Serialization("external processor missing its name".to_string())),
            },
            other => Err(Error::Serialization(format!("unknown processor tag \"{}\"", other))),
        }
    }
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Processor::Put { value } => write!(f, "Put({})", value),
            Processor::Remove => write!(f, "Remove"),
            Processor::ConditionalPut { filter, .. } => write!(f, "ConditionalPut({:?})", filter),
            Processor::Increment { delta } => write!(f, "Increment({})", delta),
            Processor::External { name, .. } => write!(f, "External({})", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_reports_old_value() {
        let mut entry = EntryView::new(Value::from("k"), Some(Value::Int(1)));
        let result = Processor::put(Value::Int(2)).apply(&mut entry).unwrap();

        assert_eq!(result, Value::from_option(Some(Value::Int(1))));
        assert_eq!(entry.value(), Some(&Value::Int(2)));

        let (value, mutated) = entry.into_effect();
        assert_eq!(value, Some(Value::Int(2)));
        assert!(mutated);
    }

    #[test]
    fn test_remove_on_absent_is_clean() {
        let mut entry = EntryView::new(Value::from("k"), None);
        let result = Processor::Remove.apply(&mut entry).unwrap();

        assert_eq!(result, Value::from_option(None));
        let (value, mutated) = entry.into_effect();
        assert_eq!(value, None);
        assert!(mutated);
    }

    #[test]
    fn test_conditional_put() {
        let filter = Filter::value_equals(Value::Int(1));

        let mut entry = EntryView::new(Value::from("k"), Some(Value::Int(1)));
        assert_eq!(
            Processor::conditional_put(filter.clone(), Value::Int(9)).apply(&mut entry).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(entry.value(), Some(&Value::Int(9)));

        let mut entry = EntryView::new(Value::from("k"), Some(Value::Int(5)));
        assert_eq!(
            Processor::conditional_put(filter, Value::Int(9)).apply(&mut entry).unwrap(),
            Value::Bool(false)
        );
        assert!(!entry.into_effect().1);
    }

    #[test]
    fn test_increment() {
        let mut entry = EntryView::new(Value::from("n"), Some(Value::Int(5)));
        assert_eq!(Processor::increment(3).apply(&mut entry).unwrap(), Value::Long(8));

        let mut entry = EntryView::new(Value::from("n"), None);
        assert_eq!(Processor::increment(-2).apply(&mut entry).unwrap(), Value::Long(-2));

        let mut entry = EntryView::new(Value::from("n"), Some(Value::from("five")));
        assert!(Processor::increment(1).apply(&mut entry).is_err());
    }

    #[test]
    fn test_wire_roundtrip() {
        let processors = vec![
            Processor::put(Value::Int(1)),
            Processor::Remove,
            Processor::conditional_put(Filter::Always, Value::from("x")),
            Processor::increment(7),
        ];

        for processor in processors {
            let revived = Processor::from_value(&processor.to_value()).unwrap();
            assert_eq!(revived.to_value(), processor.to_value());
        }
    }
}
