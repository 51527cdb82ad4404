//! # stratus-id
//!
//! Typed identifiers for resources managed by the stratus compute emulator.
//!
//! ## Identity vs. presentation
//!
//! Every resource has a canonical, system-generated identifier of the form
//! `{prefix}_{ulid}`:
//!
//! - `inst_01HV4Z4NYPLTRS0JTUA8XDME5F` for an instance
//! - `op_01HV4Z3MXNKPQR9HSTZ7WCLD4E` for an operation
//! - `addr_01HV4Z2WQXKJNM8GPQY6VBKC3D` for a reserved address
//!
//! Cloud clients also expect an opaque numeric `id` on each resource. That is
//! a [`NumericId`]: a random 64-bit value stored next to the canonical
//! identifier. It is never derived from the canonical identifier and never
//! replaces it as the primary key of a record.

mod error;
mod macros;
mod types;

pub use error::IdError;
#[doc(hidden)]
pub use macros::parse_prefixed;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
