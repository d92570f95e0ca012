//! Token-gated bulk transfer service.
//!
//! Runs on its own TLS port next to the control listener.  Every endpoint
//! is guarded by a one-shot token minted on the control channel; the
//! endpoints themselves check nothing else.

pub mod routes;
pub mod tokens;

pub use routes::router;
