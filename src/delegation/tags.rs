use lazy_static::lazy_static;
use regex::Regex;
use std::collections::BTreeSet;

use crate::error::ModelError;
use crate::models::{Ballot, Following};

lazy_static! {
    // Lowercase alphanumeric with interior dashes, e.g. "environment",
    // "budget-2026". Normalization lowercases first, so the case rule is
    // about what survives, not what members may type.
    static ref TAG_RE: Regex = Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap();
}

/// Trim, lowercase and validate a set of topic tags. Blank entries are
/// dropped; anything else that fails the lexical rule is rejected.
pub fn normalize_tags(raw: &[&str]) -> Result<BTreeSet<String>, ModelError> {
    let mut tags = BTreeSet::new();
    for entry in raw {
        let tag = entry.trim().to_lowercase();
        if tag.is_empty() {
            continue;
        }
        if !TAG_RE.is_match(&tag) {
            return Err(ModelError::InvalidTag(entry.to_string()));
        }
        tags.insert(tag);
    }
    Ok(tags)
}

/// Whether a followee's ballot may contribute to the follower's calculated
/// ballot: an unscoped following qualifies against anything, a scoped one
/// only when it shares a topic with the source ballot.
///
/// This predicate is the sole authority on tag-scoped inheritance.
pub fn qualifies(following: &Following, source_ballot: &Ballot) -> bool {
    if following.tags.is_empty() {
        return true;
    }
    following
        .tags
        .iter()
        .any(|tag| source_ballot.tags.contains(tag))
}
