//! This crate provides the wire-protocol types shared between the router
//! engine and its adapters: the message envelope, domain newtypes, the
//! error taxonomy and the validator-adapter contract.

pub mod domain;
pub mod envelope;
pub mod error;
pub mod macros;
pub mod schema;
