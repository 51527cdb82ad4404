//! In-process instance state.
//!
//! Records live in memory behind one lock per instance. The map lock is only
//! held long enough to find, insert or drop a record; all state changes go
//! through the per-instance lock so unrelated instances never contend.

mod store;

pub use store::{InstanceSlot, InstanceStore};
