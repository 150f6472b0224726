#![deny(missing_docs)]
//! Core data model and error taxonomy shared by every `relay-*` crate.
//!
//! This crate has no async runtime behavior of its own — it's the vocabulary the
//! scheduler, dispatcher, session manager, and both protocol frontends all speak.

pub mod error;
pub mod id;
pub mod model;
pub mod schema;

pub use error::BrokerError;
pub use id::{RequestId, SessionId};
pub use model::{
    Arguments, Call, CallContext, CallOutcome, Tier, TimeoutTable, TimeoutTier,
    ToolDescriptor, Transport, Visibility, canonical_json, fingerprint,
};
