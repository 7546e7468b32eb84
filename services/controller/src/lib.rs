//! # fleet-controller
//!
//! Per-site tier of the fleet. Keeps one logical link to the admin, failing
//! over from WebSocket streaming to HTTP polling, and supervises a link to
//! every host agent at the site.

pub mod api;
pub mod config;
pub mod fleet_state;
pub mod hosts;
pub mod poll;
pub mod resources;
pub mod runtime;
pub mod session;
