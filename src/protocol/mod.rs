//! Protocol message types and endpoint addressing for hub communication
//!
//! This module defines the domain and wire message structures exchanged with
//! the hub, the application-property keys that carry protocol semantics, and
//! the per-device endpoint address templates.

pub mod addresses;
pub mod messages;

pub use addresses::*;
pub use messages::*;
