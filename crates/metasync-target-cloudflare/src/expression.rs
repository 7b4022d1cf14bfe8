//! Filter expression rendering and parsing
//!
//! The managed rule's filter holds one expression:
//!
//! ```text
//! (ip.src in {192.30.252.0/22 185.199.108.0/22})
//! ```
//!
//! An empty set cannot be written as `{}`, so it renders as a sentinel that
//! matches a single unroutable address and parses back to the empty set.

use metasync_core::{AddressRangeSet, Error, Result};

/// Expression written when the desired set is empty
pub const EMPTY_SET_EXPRESSION: &str = "(ip.src eq 0.0.0.0/32)";

const PREFIX: &str = "(ip.src in {";
const SUFFIX: &str = "})";

/// Render CIDRs as a membership expression
pub fn build_expression<S: AsRef<str>>(cidrs: &[S]) -> String {
    if cidrs.is_empty() {
        return EMPTY_SET_EXPRESSION.to_string();
    }
    let list: Vec<&str> = cidrs.iter().map(AsRef::as_ref).collect();
    format!("{PREFIX}{}{SUFFIX}", list.join(" "))
}

/// Recover the CIDR set from an expression produced by [`build_expression`]
///
/// Expressions of any other shape are rejected with a read error. Entries
/// inside the braces that are not valid prefixes are skipped with a warning.
pub fn parse_expression(expression: &str) -> Result<AddressRangeSet> {
    let expression = expression.trim();
    if expression == EMPTY_SET_EXPRESSION {
        return Ok(AddressRangeSet::new());
    }

    let inner = expression
        .strip_prefix(PREFIX)
        .and_then(|rest| rest.strip_suffix(SUFFIX))
        .ok_or_else(|| Error::read(format!("unrecognized filter expression: {expression}")))?;

    if inner.contains(['{', '}']) {
        return Err(Error::read(format!(
            "unrecognized filter expression: {expression}"
        )));
    }

    let mut set = AddressRangeSet::new();
    for cidr in inner.split_whitespace() {
        if let Err(e) = set.add(cidr, std::iter::empty::<String>()) {
            tracing::warn!("Skipping malformed CIDR in filter expression: {}", e);
        }
    }
    Ok(set)
}
