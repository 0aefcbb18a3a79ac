#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod logging;
pub mod time;

pub use uuid::Uuid;

/// Generates a fresh random member identifier.
#[inline]
pub fn new_member_id() -> Uuid {
    Uuid::new_v4()
}
