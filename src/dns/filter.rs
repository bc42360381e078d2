//! collapses the answer section to at most one record per record type
//!
//! Some client resolvers take a slow path when an answer carries several
//! address records of the same type, so every response handed back to a
//! client keeps only the first record of each type. Authority and additional
//! sections pass through untouched.

use std::collections::HashSet;

use crate::dns::protocol::DnsPacket;

/// Returns a clone of `response` whose answer section keeps only the first
/// record of each record type, in the order the upstream delivered them.
pub fn flatten_answers(response: &DnsPacket) -> DnsPacket {
    let mut filtered = response.clone();
    if filtered.answers.is_empty() {
        return filtered;
    }

    let original_count = filtered.answers.len();

    let mut seen = HashSet::new();
    filtered
        .answers
        .retain(|rec| seen.insert(rec.get_querytype().to_num()));

    if filtered.answers.len() < original_count {
        log::debug!(
            "Flattened answer section: {} -> {} records",
            original_count,
            filtered.answers.len()
        );
    }

    filtered
}
