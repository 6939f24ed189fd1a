//! Leo literal hashing and rendering.
//!
//! Leo programs take `field` and `u64` literals as inputs. Client signers
//! hash user-visible strings (usernames, display names, memos) to `field`
//! literals before proving, and the backend recomputes the same hashes when
//! verifying confirmed transitions, so the mapping here must never change.

use thiserror::Error;

/// FNV-1a 64-bit offset basis.
const FNV_OFFSET_BASIS: u64 = 14695981039346656037;
/// FNV-1a 64-bit prime.
const FNV_PRIME: u64 = 1099511628211;

/// Hashes a UTF-8 string to a 64-bit field element using FNV-1a.
pub fn hash_to_field_u64(input: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in input.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Hashes a UTF-8 string to a Leo `field` literal, e.g. `"42field"`.
pub fn hash_to_field(input: &str) -> String {
    format!("{}field", hash_to_field_u64(input))
}

/// Renders a `u64` as a Leo literal, e.g. `"42u64"`.
pub fn u64_literal(value: u64) -> String {
    format!("{value}u64")
}

/// Errors parsing Leo literals.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LiteralError {
    /// The literal is missing the expected type suffix.
    #[error("literal `{0}` is missing the `{1}` suffix")]
    MissingSuffix(String, &'static str),
    /// The numeric part of the literal did not parse.
    #[error("literal `{0}` has a non-numeric value")]
    NotNumeric(String),
}

/// Parses a Leo `field` literal back to its `u64` value.
///
/// Only literals produced by [`hash_to_field`] are in range; larger field
/// elements are rejected as non-numeric.
pub fn parse_field_literal(literal: &str) -> Result<u64, LiteralError> {
    parse_literal(literal, "field")
}

/// Parses a Leo `u64` literal, e.g. `"42u64"`.
pub fn parse_u64_literal(literal: &str) -> Result<u64, LiteralError> {
    parse_literal(literal, "u64")
}

fn parse_literal(literal: &str, suffix: &'static str) -> Result<u64, LiteralError> {
    let digits = literal
        .strip_suffix(suffix)
        .ok_or_else(|| LiteralError::MissingSuffix(literal.to_owned(), suffix))?;
    digits.parse().map_err(|_| LiteralError::NotNumeric(literal.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("user:alice", 7591812323833019248)]
    #[case("memo", 4828430146670440099)]
    #[case("", FNV_OFFSET_BASIS)]
    #[case("a", 12638187200555641996)]
    fn hash_fixtures(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(hash_to_field_u64(input), expected);
        assert_eq!(hash_to_field(input), format!("{expected}field"));
    }

    #[test]
    fn literals_round_trip() {
        let field = hash_to_field("user:alice");
        assert_eq!(parse_field_literal(&field), Ok(hash_to_field_u64("user:alice")));
        assert_eq!(parse_u64_literal(&u64_literal(1_000_000)), Ok(1_000_000));
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(matches!(parse_field_literal("123"), Err(LiteralError::MissingSuffix(..))));
        assert!(matches!(parse_field_literal("xyzfield"), Err(LiteralError::NotNumeric(..))));
        assert!(matches!(parse_u64_literal("12field"), Err(LiteralError::MissingSuffix(..))));
    }
}
