//! # Envelop Aleo plumbing.
//!
//! Everything that talks to the private chain over HTTP:
//!
//! - [`oracle`] — the chain status oracle: queries an ordered list of
//!   explorer endpoints for a transaction id and returns a normalized state
//!   plus the decoded transaction record.
//! - [`submit`] — the relay submitter: forwards user-signed transactions to a
//!   configured broadcast endpoint, or registers already-broadcast ids.
//! - [`rpc`] — the `relay_` RPC namespace served by the relay binary.
//!
//! Zero-knowledge proof blobs are treated as opaque throughout; nothing here
//! inspects or generates proofs.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod decode;
pub mod oracle;
pub mod rpc;
pub mod submit;

pub use decode::{DecodedTransaction, Transition};
pub use oracle::{StatusOracle, StatusSource, TxState, TxStatusSnapshot};
pub use submit::{
    SubmissionMode, SubmissionRecord, SubmissionStatus, SubmissionStore, SubmitError,
    SubmitRequest, Submitter,
};
