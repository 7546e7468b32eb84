//! # fleet-id
//!
//! Typed identifiers for the three fleet tiers.
//!
//! Resource IDs use a prefixed ULID format, `{prefix}_{ulid}`:
//!
//! - `ctl_01HV4Z2WQXKJNM8GPQY6VBKC3D` (controller)
//! - `host_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (host agent)
//! - `cmd_01HV4Z4NYPLTRS0JTUA8XDME5F` (command correlation id)
//!
//! [`PeerId`] names the node at the other end of a link. It is a lookup key
//! only; addresses live in a separate identity record and are never parsed
//! out of an id.

mod error;
mod macros;
mod peer;
mod types;

pub use error::IdError;
pub use peer::{PeerId, PeerRole};
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
