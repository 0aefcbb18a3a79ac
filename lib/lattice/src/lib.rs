#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]

//! Client library for a clustered in-memory data grid. A single physical
//! connection to a proxy endpoint is multiplexed into many logical channels,
//! each carrying the typed request/response traffic of one service. The same
//! cache surface is also available as an in-process engine, so callers can
//! address local and remote caches interchangeably.

pub mod cache;
pub mod config;
pub mod error;
pub mod net;
pub mod remote;
pub mod service;
pub mod value;

pub use crate::error::{Error, Result};
pub use crate::value::{Tag, Value};
