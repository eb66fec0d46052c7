//! Facade crate re-exporting the wsmux workspace members.
//!
//! Most users want the `router` feature (the server-side engine); the
//! `rpc` feature exposes the wire-protocol types on their own for
//! adapter and client implementations.

#[cfg(feature = "rpc")]
pub use wsmux_rpc as rpc;

#[cfg(feature = "router")]
pub use wsmux_router as router;
