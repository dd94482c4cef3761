use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use log::debug;

use crate::delegation::tags::qualifies;
use crate::models::{Ballot, Decision, Following};
use crate::stars::Stars;

/// Guard against pathological fan-out. Cycles are already caught by the
/// visited path; this bounds the work a very deep (but acyclic) chain can
/// cause. A branch past the limit contributes nothing, same as a cycle.
pub const MAX_INHERITANCE_DEPTH: usize = 10;

/// Everything one resolution pass needs, loaded from the store up front so
/// the recursive computation itself is pure and synchronous.
pub struct DecisionSnapshot {
    pub decision: Decision,
    followings: HashMap<String, Vec<Following>>,
    ballots: HashMap<String, Ballot>,
}

impl DecisionSnapshot {
    pub fn new(decision: Decision) -> Self {
        Self {
            decision,
            followings: HashMap::new(),
            ballots: HashMap::new(),
        }
    }

    /// Record a voter's followings, ordered by ascending priority with
    /// creation time as the stable secondary key so logs are reproducible.
    pub fn set_followings(&mut self, voter_id: impl Into<String>, mut followings: Vec<Following>) {
        followings.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        self.followings.insert(voter_id.into(), followings);
    }

    pub fn add_following(&mut self, following: Following) {
        let voter = following.follower_id.clone();
        let mut list = self.followings.remove(&voter).unwrap_or_default();
        list.push(following);
        self.set_followings(voter, list);
    }

    pub fn insert_ballot(&mut self, ballot: Ballot) {
        self.ballots.insert(ballot.voter_id.clone(), ballot);
    }

    pub fn manual_ballot_count(&self) -> usize {
        self.ballots.values().filter(|b| !b.is_calculated).count()
    }
}

/// Result of one resolution pass: the calculated ballots to persist and the
/// ordered log of every inheritance step, cycle and truncation.
pub struct ResolutionOutcome {
    pub calculated: BTreeMap<String, Ballot>,
    pub log: Vec<String>,
}

/// Recursive delegation-graph resolver for a single decision.
///
/// Manual ballots are immutable leaves; everyone else's ballot is the
/// equal-weight average of whatever their qualifying followees ended up
/// with. The visited path is a per-branch value, never shared between
/// sibling branches, so convergent ("diamond") delegation is not falsely
/// excluded.
pub struct Resolver<'a> {
    snapshot: &'a DecisionSnapshot,
    resolved: BTreeMap<String, Ballot>,
    log: Vec<String>,
}

impl<'a> Resolver<'a> {
    pub fn new(snapshot: &'a DecisionSnapshot) -> Self {
        Self {
            snapshot,
            resolved: BTreeMap::new(),
            log: Vec::new(),
        }
    }

    /// Compute the voter's effective ballot for the snapshot's decision.
    ///
    /// Returns the manual ballot unchanged when one exists, otherwise a
    /// freshly calculated ballot (empty = full abstention, which is valid).
    pub fn resolve(&mut self, voter_id: &str) -> Ballot {
        match self.resolve_branch(voter_id, &HashSet::new()) {
            Some(ballot) => ballot,
            // Unreachable with an empty path, but the contract is total.
            None => Ballot::calculated(voter_id, &self.snapshot.decision.id),
        }
    }

    /// Consume the resolver, yielding the ballots calculated this pass and
    /// the resolution log. Manual ballots are never included.
    pub fn finish(self) -> ResolutionOutcome {
        ResolutionOutcome {
            calculated: self.resolved,
            log: self.log,
        }
    }

    /// Resolve one branch of the delegation graph. `path` holds the voters
    /// already visited on this branch only; `None` means the branch
    /// contributes nothing to its caller's average (cycle or depth cut).
    fn resolve_branch(&mut self, voter_id: &str, path: &HashSet<String>) -> Option<Ballot> {
        if path.contains(voter_id) {
            self.note(format!(
                "Circular delegation: {} is already on this inheritance branch, contributing nothing",
                voter_id
            ));
            return None;
        }
        if path.len() >= MAX_INHERITANCE_DEPTH {
            self.note(format!(
                "Inheritance depth limit ({}) reached at {}, contributing nothing",
                MAX_INHERITANCE_DEPTH, voter_id
            ));
            return None;
        }

        // Memoized from earlier in this pass.
        if let Some(ballot) = self.resolved.get(voter_id) {
            return Some(ballot.clone());
        }

        // Manual ballots are terminal and never recomputed.
        if let Some(existing) = self.snapshot.ballots.get(voter_id) {
            if !existing.is_calculated {
                return Some(existing.clone());
            }
        }

        // Each recursive call receives its own copy of the path extended
        // with the current voter. Sibling branches must not observe each
        // other's visits.
        let mut branch_path = path.clone();
        branch_path.insert(voter_id.to_string());

        let mut sources: Vec<(&Following, Ballot)> = Vec::new();
        if let Some(edges) = self.snapshot.followings.get(voter_id) {
            for edge in edges {
                if branch_path.contains(&edge.followee_id) {
                    self.note(format!(
                        "Circular delegation: {} skips {}, already on this inheritance branch",
                        voter_id, edge.followee_id
                    ));
                    continue;
                }
                let Some(ballot) = self.resolve_branch(&edge.followee_id, &branch_path) else {
                    continue;
                };
                if qualifies(edge, &ballot) {
                    self.note(format!(
                        "{} inherits from {} (priority {}, tags {:?})",
                        voter_id,
                        edge.followee_id,
                        edge.priority,
                        edge.tags.iter().map(String::as_str).collect::<Vec<_>>()
                    ));
                    sources.push((edge, ballot));
                } else {
                    self.note(format!(
                        "{}: ballot of {} does not match followed tags, skipped",
                        voter_id, edge.followee_id
                    ));
                }
            }
        }

        let ballot = self.build_calculated(voter_id, &sources);
        if ballot.is_abstention() {
            self.note(format!("{}: no votes inherited, ballot is empty", voter_id));
        }
        self.resolved.insert(voter_id.to_string(), ballot.clone());
        Some(ballot)
    }

    /// Average the qualifying sources into a calculated ballot. Choices a
    /// source is silent on contribute nothing to that choice's mean (they
    /// are absent, not zero).
    fn build_calculated(&self, voter_id: &str, sources: &[(&Following, Ballot)]) -> Ballot {
        let decision = &self.snapshot.decision;

        let mut votes = BTreeMap::new();
        for choice in &decision.choices {
            let stars: Vec<Stars> = sources
                .iter()
                .filter_map(|(_, ballot)| ballot.votes.get(&choice.id).copied())
                .collect();
            if let Some(mean) = Stars::mean(&stars) {
                debug!(
                    "{}: choice {} averaged from {} source(s) -> {}",
                    voter_id,
                    choice.text,
                    stars.len(),
                    mean
                );
                votes.insert(choice.id.clone(), mean);
            }
        }

        // A calculated ballot carries the topics its votes flowed through:
        // the full source tag set on an unscoped edge, the overlap on a
        // scoped one. This is what lets tag scope chain across hops.
        let mut tags = BTreeSet::new();
        for (edge, ballot) in sources {
            if edge.tags.is_empty() {
                tags.extend(ballot.tags.iter().cloned());
            } else {
                tags.extend(edge.tags.intersection(&ballot.tags).cloned());
            }
        }

        // Reuse the stored ballot row when there is one so recalculation
        // replaces votes instead of spawning a new identity.
        let mut ballot = match self.snapshot.ballots.get(voter_id) {
            Some(existing) => existing.clone(),
            None => Ballot::calculated(voter_id, &decision.id),
        };
        ballot.tags = tags;
        ballot.is_calculated = true;
        ballot.votes = votes;
        ballot
    }

    fn note(&mut self, line: String) {
        debug!("{}", line);
        self.log.push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Ballot, Decision, Following};

    fn decision() -> Decision {
        Decision::new(
            "springfield",
            "Pick a fruit",
            vec!["apple".into(), "banana".into()],
            None,
        )
    }

    fn choice_id(decision: &Decision, text: &str) -> String {
        decision.choice_by_text(text).unwrap().id.clone()
    }

    fn manual_ballot(
        decision: &Decision,
        voter: &str,
        tags: &[&str],
        votes: &[(&str, u8)],
    ) -> Ballot {
        let votes = votes
            .iter()
            .map(|(text, stars)| {
                (
                    choice_id(decision, text),
                    Stars::from_whole(*stars).unwrap(),
                )
            })
            .collect();
        Ballot::manual(voter, &decision.id, tags, votes).unwrap()
    }

    fn follow(snapshot: &mut DecisionSnapshot, follower: &str, followee: &str, tags: &[&str]) {
        snapshot.add_following(Following::new(follower, followee, tags, 1).unwrap());
    }

    #[test]
    fn single_source_inheritance_is_exact() {
        let decision = decision();
        let apple = choice_id(&decision, "apple");
        let mut snapshot = DecisionSnapshot::new(decision.clone());
        snapshot.insert_ballot(manual_ballot(&decision, "grace", &["apple"], &[("apple", 5)]));
        follow(&mut snapshot, "ada", "grace", &["apple"]);

        let ballot = Resolver::new(&snapshot).resolve("ada");
        assert!(ballot.is_calculated);
        assert_eq!(ballot.votes[&apple], Stars::from_whole(5).unwrap());
        assert_eq!(ballot.tags.iter().collect::<Vec<_>>(), vec!["apple"]);
    }

    #[test]
    fn manual_ballot_is_returned_unchanged() {
        let decision = decision();
        let mut snapshot = DecisionSnapshot::new(decision.clone());
        let manual = manual_ballot(&decision, "ada", &[], &[("apple", 2)]);
        snapshot.insert_ballot(manual.clone());
        // Even with followings, the manual ballot stays authoritative.
        follow(&mut snapshot, "ada", "grace", &[]);
        snapshot.insert_ballot(manual_ballot(&decision, "grace", &[], &[("apple", 5)]));

        let mut resolver = Resolver::new(&snapshot);
        let ballot = resolver.resolve("ada");
        assert_eq!(ballot, manual);
        // Nothing was calculated for ada, so nothing gets persisted for her.
        assert!(!resolver.finish().calculated.contains_key("ada"));
    }

    #[test]
    fn tag_scoped_following_gates_inheritance() {
        let decision = decision();
        let apple = choice_id(&decision, "apple");
        let mut snapshot = DecisionSnapshot::new(decision.clone());
        snapshot.insert_ballot(manual_ballot(
            &decision,
            "grace",
            &["environment"],
            &[("apple", 5)],
        ));
        snapshot.insert_ballot(manual_ballot(&decision, "kay", &["budget"], &[("apple", 1)]));
        follow(&mut snapshot, "ada", "grace", &["environment"]);
        follow(&mut snapshot, "ada", "kay", &["environment"]);

        let ballot = Resolver::new(&snapshot).resolve("ada");
        // Only grace's environment-tagged ballot qualifies.
        assert_eq!(ballot.votes[&apple], Stars::from_whole(5).unwrap());
    }

    #[test]
    fn unscoped_following_inherits_unconditionally() {
        let decision = decision();
        let apple = choice_id(&decision, "apple");
        let mut snapshot = DecisionSnapshot::new(decision.clone());
        snapshot.insert_ballot(manual_ballot(&decision, "kay", &["budget"], &[("apple", 3)]));
        follow(&mut snapshot, "ada", "kay", &[]);

        let ballot = Resolver::new(&snapshot).resolve("ada");
        assert_eq!(ballot.votes[&apple], Stars::from_whole(3).unwrap());
        assert_eq!(ballot.tags.iter().collect::<Vec<_>>(), vec!["budget"]);
    }

    #[test]
    fn cycle_resolves_to_mutual_abstention() {
        let decision = decision();
        let mut snapshot = DecisionSnapshot::new(decision);
        follow(&mut snapshot, "ada", "grace", &[]);
        follow(&mut snapshot, "grace", "ada", &[]);

        let mut resolver = Resolver::new(&snapshot);
        let ada = resolver.resolve("ada");
        let grace = resolver.resolve("grace");
        assert!(ada.is_abstention());
        assert!(grace.is_abstention());
        let outcome = resolver.finish();
        assert!(outcome
            .log
            .iter()
            .any(|line| line.contains("Circular delegation")));
    }

    #[test]
    fn diamond_delegation_counts_both_branches() {
        // dan follows betty and carol, who both follow ada. The shared
        // grandparent must reach dan through both branches: sibling
        // branches keep independent visited paths.
        let decision = decision();
        let apple = choice_id(&decision, "apple");
        let mut snapshot = DecisionSnapshot::new(decision.clone());
        snapshot.insert_ballot(manual_ballot(&decision, "ada", &[], &[("apple", 4)]));
        follow(&mut snapshot, "betty", "ada", &[]);
        follow(&mut snapshot, "carol", "ada", &[]);
        follow(&mut snapshot, "dan", "betty", &[]);
        follow(&mut snapshot, "dan", "carol", &[]);

        let mut resolver = Resolver::new(&snapshot);
        let ballot = resolver.resolve("dan");
        assert_eq!(ballot.votes[&apple], Stars::from_whole(4).unwrap());

        let outcome = resolver.finish();
        let inherits: Vec<&String> = outcome
            .log
            .iter()
            .filter(|line| line.starts_with("dan inherits"))
            .collect();
        assert_eq!(inherits.len(), 2, "both branches must contribute");
    }

    #[test]
    fn silent_choices_contribute_nothing_to_the_mean() {
        let decision = decision();
        let apple = choice_id(&decision, "apple");
        let banana = choice_id(&decision, "banana");
        let mut snapshot = DecisionSnapshot::new(decision.clone());
        snapshot.insert_ballot(manual_ballot(
            &decision,
            "grace",
            &[],
            &[("apple", 5), ("banana", 3)],
        ));
        // kay is silent on banana.
        snapshot.insert_ballot(manual_ballot(&decision, "kay", &[], &[("apple", 4)]));
        follow(&mut snapshot, "ada", "grace", &[]);
        follow(&mut snapshot, "ada", "kay", &[]);

        let ballot = Resolver::new(&snapshot).resolve("ada");
        assert_eq!(ballot.votes[&apple].to_string(), "4.5");
        // banana averaged over grace alone, not zero-filled over both.
        assert_eq!(ballot.votes[&banana], Stars::from_whole(3).unwrap());
    }

    #[test]
    fn resolution_is_idempotent() {
        let decision = decision();
        let mut snapshot = DecisionSnapshot::new(decision.clone());
        snapshot.insert_ballot(manual_ballot(&decision, "grace", &[], &[("apple", 5)]));
        snapshot.insert_ballot(manual_ballot(&decision, "kay", &[], &[("apple", 2)]));
        follow(&mut snapshot, "ada", "grace", &[]);
        follow(&mut snapshot, "ada", "kay", &[]);

        let mut first_pass = Resolver::new(&snapshot);
        first_pass.resolve("ada");
        let first = first_pass.finish().calculated;

        // Feed the calculated ballots back in, as a second pass over an
        // unchanged graph would see them.
        let mut snapshot_after = snapshot;
        for ballot in first.values() {
            snapshot_after.insert_ballot(ballot.clone());
        }
        let mut second_pass = Resolver::new(&snapshot_after);
        second_pass.resolve("ada");
        let second = second_pass.finish().calculated;

        assert_eq!(first, second);
    }

    #[test]
    fn depth_limit_cuts_pathological_chains() {
        let decision = decision();
        let apple = choice_id(&decision, "apple");

        // Chain of length MAX_INHERITANCE_DEPTH: the leaf sits exactly at
        // the last resolvable depth.
        let mut snapshot = DecisionSnapshot::new(decision.clone());
        for i in 0..MAX_INHERITANCE_DEPTH - 1 {
            follow(&mut snapshot, &format!("v{}", i), &format!("v{}", i + 1), &[]);
        }
        let leaf = format!("v{}", MAX_INHERITANCE_DEPTH - 1);
        snapshot.insert_ballot(manual_ballot(&decision, &leaf, &[], &[("apple", 5)]));
        let ballot = Resolver::new(&snapshot).resolve("v0");
        assert_eq!(ballot.votes[&apple], Stars::from_whole(5).unwrap());

        // One hop longer and the leaf is out of reach.
        let mut deep = DecisionSnapshot::new(decision.clone());
        for i in 0..MAX_INHERITANCE_DEPTH {
            follow(&mut deep, &format!("v{}", i), &format!("v{}", i + 1), &[]);
        }
        let leaf = format!("v{}", MAX_INHERITANCE_DEPTH);
        deep.insert_ballot(manual_ballot(&decision, &leaf, &[], &[("apple", 5)]));
        let mut resolver = Resolver::new(&deep);
        let ballot = resolver.resolve("v0");
        assert!(ballot.is_abstention());
        assert!(resolver
            .finish()
            .log
            .iter()
            .any(|line| line.contains("depth limit")));
    }

    #[test]
    fn followings_are_visited_in_priority_order() {
        let decision = decision();
        let mut snapshot = DecisionSnapshot::new(decision.clone());
        snapshot.insert_ballot(manual_ballot(&decision, "grace", &[], &[("apple", 5)]));
        snapshot.insert_ballot(manual_ballot(&decision, "kay", &[], &[("apple", 1)]));
        snapshot.add_following(Following::new("ada", "grace", &[], 2).unwrap());
        snapshot.add_following(Following::new("ada", "kay", &[], 1).unwrap());

        let mut resolver = Resolver::new(&snapshot);
        resolver.resolve("ada");
        let log = resolver.finish().log;
        let first = log.iter().position(|l| l.contains("inherits from kay")).unwrap();
        let second = log
            .iter()
            .position(|l| l.contains("inherits from grace"))
            .unwrap();
        assert!(first < second, "priority 1 must be consulted before priority 2");
    }
}
