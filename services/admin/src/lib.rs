//! Fleet admin service library.
//!
//! This crate primarily ships a `fleet-admin` binary, but exposes its
//! pieces so integration tests can run the server in-process.

pub mod api;
pub mod broadcaster;
pub mod config;
pub mod link;
pub mod nodes;
pub mod pending;
pub mod protocol;
pub mod state;
