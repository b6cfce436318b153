//! Per-call caller context and access policy.
//!
//! Sessions are created by the embedding application (login is not handled
//! here) and passed explicitly into every service call.

pub mod session;
