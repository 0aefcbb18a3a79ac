//! Process-wide registries for user-supplied functions. Filters, extractors,
//! processors, aggregators, eviction scores, unit calculators and comparators
//! all have an `External` variant that crosses the wire by name only; both
//! peers resolve the name here.

use crate::cache::processor::EntryView;
use crate::error::{Error, Result};
use crate::value::Value;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use crate::cache::aggregator::Accumulator;

pub type FilterFn = Arc<dyn Fn(&Value, &Value) -> Result<bool> + Send + Sync>;
pub type ExtractorFn = Arc<dyn Fn(&Value) -> Result<Value> + Send + Sync>;
pub type ProcessorFn = Arc<dyn Fn(&mut EntryView) -> Result<Value> + Send + Sync>;
pub type AccumulatorFactory = Arc<dyn Fn() -> Box<dyn Accumulator> + Send + Sync>;
pub type ComparatorFn = Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>;

struct Registries {
    filters: HashMap<String, FilterFn>,
    extractors: HashMap<String, ExtractorFn>,
    processors: HashMap<String, ProcessorFn>,
    aggregators: HashMap<String, AccumulatorFactory>,
    comparators: HashMap<String, ComparatorFn>,
}

lazy_static! {
    static ref REGISTRIES: Mutex<Registries> = Mutex::new(Registries {
        filters: HashMap::new(),
        extractors: HashMap::new(),
        processors: HashMap::new(),
        aggregators: HashMap::new(),
        comparators: HashMap::new(),
    });
}

fn missing(kind: &str, name: &str) -> Error {
    Error::Config(format!("no external {} registered under \"{}\"", kind, name))
}

pub fn register_filter(name: &str, filter: FilterFn) {
    REGISTRIES.lock().unwrap().filters.insert(name.to_string(), filter);
}

pub fn filter(name: &str) -> Result<FilterFn> {
    REGISTRIES
        .lock()
        .unwrap()
        .filters
        .get(name)
        .cloned()
        .ok_or_else(|| missing("filter", name))
}

pub fn register_extractor(name: &str, extractor: ExtractorFn) {
    REGISTRIES.lock().unwrap().extractors.insert(name.to_string(), extractor);
}

pub fn extractor(name: &str) -> Result<ExtractorFn> {
    REGISTRIES
        .lock()
        .unwrap()
        .extractors
        .get(name)
        .cloned()
        .ok_or_else(|| missing("extractor", name))
}

pub fn register_processor(name: &str, processor: ProcessorFn) {
    REGISTRIES.lock().unwrap().processors.insert(name.to_string(), processor);
}

pub fn processor(name: &str) -> Result<ProcessorFn> {
    REGISTRIES
        .lock()
        .unwrap()
        .processors
        .get(name)
        .cloned()
        .ok_or_else(|| missing("processor", name))
}

pub fn register_aggregator(name: &str, aggregator: AccumulatorFactory) {
    REGISTRIES.lock().unwrap().aggregators.insert(name.to_string(), aggregator);
}

pub fn aggregator(name: &str) -> Result<AccumulatorFactory> {
    REGISTRIES
        .lock()
        .unwrap()
        .aggregators
        .get(name)
        .cloned()
        .ok_or_else(|| missing("aggregator", name))
}

pub fn register_comparator(name: &str, comparator: ComparatorFn) {
    REGISTRIES.lock().unwrap().comparators.insert(name.to_string(), comparator);
}

pub fn comparator(name: &str) -> Result<ComparatorFn> {
    REGISTRIES
        .lock()
        .unwrap()
        .comparators
        .get(name)
        .cloned()
        .ok_or_else(|| missing("comparator", name))
}
