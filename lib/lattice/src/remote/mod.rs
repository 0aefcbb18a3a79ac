pub mod cache;
pub mod invocation;
pub mod protocol;
