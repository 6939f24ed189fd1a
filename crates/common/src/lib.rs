//! # Envelop common.
//!
//! Primitives shared by every Envelop crate: the hash-to-field routine that
//! must stay bit-identical between client signers and backend verifiers, Leo
//! literal rendering and parsing, and wall-clock helpers.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod field;

/// Returns the current unix epoch in milliseconds.
pub fn unix_epoch_ms() -> u64 {
    use std::time::SystemTime;
    let now = SystemTime::now();
    now.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("Current time {now:?} is invalid: {err:?}"))
        .as_millis() as u64
}
