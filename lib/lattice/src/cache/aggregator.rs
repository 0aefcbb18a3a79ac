//! Aggregators: pure reducers over entry value streams. The contract carries
//! the parallel split-and-combine flag, but this engine only ever drives the
//! final (non-parallel) path.

use crate::cache::external::{self, AccumulatorFactory};
use crate::cache::extractor::Extractor;
use crate::error::{Error, Result};
use crate::value::{Tag, Value};
use std::fmt;

/// One aggregation run. `is_final` is true on the non-parallel path and on
/// the combining stage of a parallel run.
pub trait Accumulator: Send {
    fn init(&mut self, is_final: bool);

    fn process(&mut self, value: &Value, is_final: bool) -> Result<()>;

    fn finalize(&mut self, is_final: bool) -> Result<Value>;
}

#[derive(Clone)]
pub enum Aggregator {
    /// Number of selected entries.
    Count,
    /// Sum of the extracted values, widened to `Long`.
    LongSum(Extractor),
    /// Arithmetic mean of the extracted values as `Double`.
    DoubleAverage(Extractor),
    External { name: String, begin: AccumulatorFactory },
}

impl Aggregator {
    /// Resolves a registered external aggregator by name.
    pub fn external(name: &str) -> Result<Aggregator> {
        let begin = external::aggregator(name)?;
        Ok(Aggregator::External {
            name: name.to_string(),
            begin,
        })
    }

    pub fn begin(&self) -> Box<dyn Accumulator> {
        match self {
            Aggregator::Count => Box::new(CountAccumulator { count: 0 }),
            Aggregator::LongSum(extractor) => Box::new(SumAccumulator {
                extractor: extractor.clone(),
                total: 0,
            }),
            Aggregator::DoubleAverage(extractor) => Box::new(AverageAccumulator {
                extractor: extractor.clone(),
                total: 0.0,
                count: 0,
            }),
            Aggregator::External { begin, .. } => begin(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Aggregator::Count => Value::List(vec![Value::from("count")]),
            Aggregator::LongSum(extractor) => {
                Value::List(vec![Value::from("long-sum"), extractor.to_value()])
            }
            Aggregator::DoubleAverage(extractor) => {
                Value::List(vec![Value::from("double-average"), extractor.to_value()])
            }
            Aggregator::External { name, .. } => {
                Value::List(vec![Value::from("external"), Value::String(name.clone())])
            }
        }
    }

    pub fn from_value(value: &Value) -> Result<Aggregator> {
        let items = match value {
            Value::List(items) => items,
            _ => return Err(Error::Serialization("aggregator must be a tagged list".to_string())),
        };

        let tag = match items.first() {
            Some(Value::String(tag)) => tag.as_str(),
            _ => return Err(Error::Serialization("aggregator missing its tag".to_string())),
        };

        match tag {
            "count" => Ok(Aggregator::Count),
            "long-sum" | "double-average" => match items.get(1) {
                Some(extractor) => {
                    let extractor = Extractor::from_value(extractor)?;
                    Ok(if tag == "long-sum" {
                        Aggregator::LongSum(extractor)
                    } else {
                        Aggregator::DoubleAverage(extractor)
                    })
                }
                None => Err(Error::Serialization("aggregator missing its extractor".to_string())),
            },
            "external" => match items.get(1) {
                Some(Value::String(name)) => Aggregator::external(name),
                _ => Err(Error::Serialization("external aggregator missing its name".to_string())),
            },
            other => Err(Error::Serialization(format!("unknown aggregator tag \"{}\"", other))),
        }
    }
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Aggregator::Count => write!(f, "Count"),
            Aggregator::LongSum(extractor) => write!(f, "LongSum({:?})", extractor),
            Aggregator::DoubleAverage(extractor) => write!(f, "DoubleAverage({:?})", extractor),
            Aggregator::External { name, .. } => write!(f, "External({})", name),
        }
    }
}

struct CountAccumulator {
    count: u64,
}

impl Accumulator for CountAccumulator {
    fn init(&mut self, _is_final: bool) {
        self.count = 0;
    }

    fn process(&mut self, _value: &Value, _is_final: bool) -> Result<()> {
        self.count += 1;
        Ok(())
    }

    fn finalize(&mut self, _is_final: bool) -> Result<Value> {
        Ok(Value::Long(self.count as i64))
    }
}

struct SumAccumulator {
    extractor: Extractor,
    total: i64,
}

impl Accumulator for SumAccumulator {
    fn init(&mut self, _is_final: bool) {
        self.total = 0;
    }

    fn process(&mut self, value: &Value, _is_final: bool) -> Result<()> {
        let extracted = self.extractor.extract(&Value::Null, value)?;
        match extracted.convert(Tag::Long) {
            Some(Value::Long(l)) => {
                self.total += l;
                Ok(())
            }
            _ => Err(Error::Serialization(format!("cannot sum non-numeric value {}", extracted))),
        }
    }

    fn finalize(&mut self, _is_final: bool) -> Result<Value> {
        Ok(Value::Long(self.total))
    }
}

struct AverageAccumulator {
    extractor: Extractor,
    total: f64,
    count: u64,
}

impl Accumulator for AverageAccumulator {
    fn init(&mut self, _is_final: bool) {
        self.total = 0.0;
        self.count = 0;
    }

    fn process(&mut self, value: &Value, _is_final: bool) -> Result<()> {
        let extracted = self.extractor.extract(&Value::Null, value)?;
        match extracted.convert(Tag::Double) {
            Some(Value::Double(d)) => {
                self.total += d;
                self.count += 1;
                Ok(())
            }
            _ => Err(Error::Serialization(format!("cannot average non-numeric value {}", extracted))),
        }
    }

    fn finalize(&mut self, _is_final: bool) -> Result<Value> {
        if self.count == 0 {
            return Ok(Value::Null);
        }
        Ok(Value::Double(self.total / self.count as f64))
    }
}
