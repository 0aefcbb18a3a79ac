//! Eviction policies and unit calculators. A policy assigns each entry a
//! score; when a prune pass runs, the lowest-scoring entries leave first
//! until the cache is back under its low-water mark.

use crate::error::{Error, Result};
use crate::value::Value;
use std::fmt;
use std::sync::Arc;

/// Everything a policy may weigh for one entry.
pub struct EvictionCandidate<'a> {
    pub key: &'a Value,
    pub value: &'a Value,
    pub inserted_at: u64,
    pub last_access_at: u64,
    pub touch_count: u64,
    pub units: u64,
}

pub type ScoreFn = Arc<dyn Fn(&EvictionCandidate) -> u64 + Send + Sync>;

/// Weight applied per touch by the hybrid policy: a frequently read entry
/// ranks as if it were accessed more recently, capped so a hot past cannot
/// pin an entry forever.
const HYBRID_TOUCH_WEIGHT: u64 = 128;
const HYBRID_TOUCH_CAP: u64 = 64;

#[derive(Clone)]
pub enum EvictionPolicy {
    /// Least recently used leaves first.
    Lru,
    /// Least frequently used leaves first.
    Lfu,
    /// Recency blended with capped frequency.
    Hybrid,
    External { name: String, score: ScoreFn },
}

impl EvictionPolicy {
    /// Parses the configuration string form. `"external"` cannot be named in
    /// config because it carries a function; install it programmatically.
    pub fn parse(name: &str) -> Result<EvictionPolicy> {
        match name {
            "lru" => Ok(EvictionPolicy::Lru),
            "lfu" => Ok(EvictionPolicy::Lfu),
            "hybrid" => Ok(EvictionPolicy::Hybrid),
            "external" => Err(Error::Config(
                "external eviction policy must be installed programmatically".to_string(),
            )),
            other => Err(Error::Config(format!("unknown eviction policy \"{}\"", other))),
        }
    }

    pub fn external(name: &str, score: ScoreFn) -> EvictionPolicy {
        EvictionPolicy::External {
            name: name.to_string(),
            score,
        }
    }

    /// Lower scores evict first.
    pub(crate) fn score(&self, candidate: &EvictionCandidate) -> u64 {
        match self {
            EvictionPolicy::Lru => candidate.last_access_at,
            EvictionPolicy::Lfu => candidate.touch_count,
            EvictionPolicy::Hybrid => candidate
                .last_access_at
                .saturating_add(candidate.touch_count.min(HYBRID_TOUCH_CAP) * HYBRID_TOUCH_WEIGHT),
            EvictionPolicy::External { score, .. } => score(candidate),
        }
    }
}

impl fmt::Debug for EvictionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EvictionPolicy::Lru => write!(f, "Lru"),
            EvictionPolicy::Lfu => write!(f, "Lfu"),
            EvictionPolicy::Hybrid => write!(f, "Hybrid"),
            EvictionPolicy::External { name, .. } => write!(f, "External({})", name),
        }
    }
}

pub type UnitsFn = Arc<dyn Fn(&Value, &Value) -> u64 + Send + Sync>;

#[derive(Clone)]
pub enum UnitCalculator {
    /// Every entry costs one unit.
    Fixed,
    /// Entries cost their approximate byte footprint.
    Binary,
    External { name: String, units: UnitsFn },
}

impl UnitCalculator {
    pub fn parse(name: &str) -> Result<UnitCalculator> {
        match name {
            "fixed" => Ok(UnitCalculator::Fixed),
            "binary" => Ok(UnitCalculator::Binary),
            "external" => Err(Error::Config(
                "external unit calculator must be installed programmatically".to_string(),
            )),
            other => Err(Error::Config(format!("unknown unit calculator \"{}\"", other))),
        }
    }

    pub fn external(name: &str, units: UnitsFn) -> UnitCalculator {
        UnitCalculator::External {
            name: name.to_string(),
            units,
        }
    }

    /// An entry never costs zero units, or an unbounded number of zero-cost
    /// entries would defeat the size limit.
    pub(crate) fn units(&self, key: &Value, value: &Value) -> u64 {
        let units = match self {
            UnitCalculator::Fixed => 1,
            UnitCalculator::Binary => key.approx_size() + value.approx_size(),
            UnitCalculator::External { units, .. } => units(key, value),
        };
        units.max(1)
    }
}

impl fmt::Debug for UnitCalculator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UnitCalculator::Fixed => write!(f, "Fixed"),
            UnitCalculator::Binary => write!(f, "Binary"),
            UnitCalculator::External { name, .. } => write!(f, "External({})", name),
        }
    }
}
