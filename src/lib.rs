//! Arena Instance Server Library
//!
//! Hosts many isolated game instances behind one TCP front end. Each
//! instance runs its fixed-rate simulation inside a worker task and talks to
//! the host only through serializable messages.

pub mod config;
pub mod util;
pub mod game;
pub mod net;
pub mod metrics;
