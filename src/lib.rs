//! Core message-processing pipeline, stores, and protocol authorization
//! engine for a Decentralized Web Node.
//!
//! This crate implements THE CORE as scoped by the specification: the
//! validation/authentication/authorization pipeline, the indexed message
//! and data stores, the protocol authorization engine, and the event log.
//! JSON-Schema validation, JWS cryptographic primitives, the DID resolver,
//! CID/DAG-CBOR codecs, the underlying key-value store, networking, and
//! the top-level API binding are external collaborators whose contracts
//! are declared at the module boundaries below.

pub mod authorize;
pub mod cid;
pub mod dispatcher;
mod error;
pub mod jws;
pub mod message;
pub mod messages;
pub mod permissions;
pub mod protocols;
pub mod records;
pub mod server;
pub mod store;
pub mod validator;

pub use dispatcher::{Dwn, Reply, Status};
pub use error::Error;
pub use message::{Authorization, Interface, Method};
pub use server::DwnConfig;

pub type Result<T> = std::result::Result<T, Error>;
