//! The filter algebra used by queries, conditional indices, listener scopes
//! and entry processors. Built-in filters are plain data and travel on the
//! wire; the `External` variant travels by registry name.

use crate::cache::external::{self, FilterFn};
use crate::cache::extractor::Extractor;
use crate::cache::index::CacheIndex;
use crate::error::{Error, Result};
use crate::value::Value;
use indexmap::IndexSet;
use std::fmt;

#[derive(Clone)]
pub enum Filter {
    /// Matches every entry.
    Always,
    /// Matches entries whose extracted value equals `value`.
    Equals { extractor: Extractor, value: Value },
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
    External { name: String, evaluate: FilterFn },
}

impl Filter {
    pub fn equals(extractor: Extractor, value: Value) -> Filter {
        Filter::Equals { extractor, value }
    }

    /// Equality on the entry value itself.
    pub fn value_equals(value: Value) -> Filter {
        Filter::equals(Extractor::Identity, value)
    }

    pub fn and(self, other: Filter) -> Filter {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Filter {
        Filter::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Filter {
        Filter::Not(Box::new(self))
    }

    /// Resolves a registered external filter by name.
    pub fn external(name: &str) -> Result<Filter> {
        let evaluate = external::filter(name)?;
        Ok(Filter::External {
            name: name.to_string(),
            evaluate,
        })
    }

    pub fn evaluate(&self, key: &Value, value: &Value) -> Result<bool> {
        match self {
            Filter::Always => Ok(true),
            Filter::Equals { extractor, value: expected } => {
                Ok(extractor.extract(key, value)? == *expected)
            }
            Filter::And(left, right) => Ok(left.evaluate(key, value)? && right.evaluate(key, value)?),
            Filter::Or(left, right) => Ok(left.evaluate(key, value)? || right.evaluate(key, value)?),
            Filter::Not(inner) => Ok(!inner.evaluate(key, value)?),
            Filter::External { evaluate, .. } => evaluate(key, value),
        }
    }

    /// Index-aware planning: returns the candidate key set if this filter can
    /// be answered from the registered indices alone. A partial or
    /// conditional index is never trusted; any miss falls back to a scan.
    pub(crate) fn index_lookup(&self, indexes: &[CacheIndex]) -> Option<IndexSet<Value>> {
        match self {
            Filter::Equals { extractor, value } => {
                let index = indexes
                    .iter()
                    .find(|index| index.extractor() == extractor && !index.is_conditional() && !index.is_partial())?;
                Some(index.keys_equal(value).cloned().unwrap_or_default())
            }
            Filter::And(left, right) => {
                let left = left.index_lookup(indexes)?;
                let right = right.index_lookup(indexes)?;
                Some(left.intersection(&right).cloned().collect())
            }
            Filter::Or(left, right) => {
                let left = left.index_lookup(indexes)?;
                let right = right.index_lookup(indexes)?;
                Some(left.union(&right).cloned().collect())
            }
            Filter::Always | Filter::Not(_) | Filter::External { .. } => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Filter::Always => Value::List(vec![Value::from("always")]),
            Filter::Equals { extractor, value } => Value::List(vec![
                Value::from("equals"),
                extractor.to_value(),
                value.clone(),
            ]),
            Filter::And(left, right) => {
                Value::List(vec![Value::from("and"), left.to_value(), right.to_value()])
            }
            Filter::Or(left, right) => {
                Value::List(vec![Value::from("or"), left.to_value(), right.to_value()])
            }
            Filter::Not(inner) => Value::List(vec![Value::from("not"), inner.to_value()]),
            Filter::External { name, .. } => {
                Value::List(vec![Value::from("external"), Value::String(name.clone())])
            }
        }
    }

    pub fn from_value(value: &Value) -> Result<Filter> {
        let items = match value {
            Value::List(items) => items,
            _ => return Err(Error::Serialization("filter must be a tagged list".to_string())),
        };

        let tag = match items.first() {
            Some(Value::String(tag)) => tag.as_str(),
            _ => return Err(Error::Serialization("filter missing its tag".to_string())),
        };

        match tag {
            "always" => Ok(Filter::Always),
            "equals" => match (items.get(1), items.get(2)) {
                (Some(extractor), Some(value)) => Ok(Filter::Equals {
                    extractor: Extractor::from_value(extractor)?,
                    value: value.clone(),
                }),
                _ => Err(Error::Serialization("equals filter needs extractor and value".to_string())),
            },
            "and" | "or" => match (items.get(1), items.get(2)) {
                (Some(left), Some(right)) => {
                    let left = Box::new(Filter::from_value(left)?);
                    let right = Box::new(Filter::from_value(right)?);
                    Ok(if tag == "and" {
                        Filter::And(left, right)
                    } else {
                        Filter::Or(left, right)
                    })
                }
                _ => Err(Error::Serialization("binary filter needs two operands".to_string())),
            },
            "not" => match items.get(1) {
                Some(inner) => Ok(Filter::Not(Box::new(Filter::from_value(inner)?))),
                None => Err(Error::Serialization("not filter needs an operand".to_string())),
            },
            "external" => match items.get(1) {
                Some(Value::String(name)) => Filter::external(name),
                _ => Err(Error::Serialization("external filter missing its name".to_string())),
            },
            other => Err(Error::Serialization(format!("unknown filter tag \"{}\"", other))),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Filter::Always => write!(f, "Always"),
            Filter::Equals { extractor, value } => write!(f, "Equals({:?} == {})", extractor, value),
            Filter::And(left, right) => write!(f, "And({:?}, {:?})", left, right),
            Filter::Or(left, right) => write!(f, "Or({:?}, {:?})", left, right),
            Filter::Not(inner) => write!(f, "Not({:?})", inner),
            Filter::External { name, .. } => write!(f, "External({})", name),
        }
    }
}
