pub mod resolver;
pub mod tags;

pub use resolver::{DecisionSnapshot, ResolutionOutcome, Resolver, MAX_INHERITANCE_DEPTH};

use std::collections::{HashSet, VecDeque};

use log::{info, warn};

use crate::db::BallotStore;
use crate::error::ResolveError;

/// Outcome of one full resolution pass over a decision.
#[derive(Debug)]
pub struct ResolutionReport {
    pub decision_id: String,
    /// Calculated ballots written back this pass.
    pub calculated_ballots: usize,
    /// Manual ballots found in the graph; these were left untouched.
    pub manual_ballots: usize,
    /// Calculated ballots that ended up empty (full abstention).
    pub abstentions: usize,
    pub log: Vec<String>,
}

/// Resolve every voting member's ballot for a single decision and persist
/// the calculated results.
///
/// This is the whole unit an external scheduler invokes: the core knows
/// nothing about "all communities" or "all decisions". The caller must
/// serialize passes per decision; vote replacement is atomic per ballot.
pub async fn resolve_decision<S: BallotStore + ?Sized>(
    store: &S,
    decision_id: &str,
) -> Result<ResolutionReport, ResolveError> {
    let decision = store.get_decision(decision_id).await?;
    info!("Resolving decision {} ({})", decision.id, decision.title);

    let members = store.list_voting_members(&decision.community_id).await?;

    // Walk followings outward from the voting members until the graph
    // closes. Non-voting members (lobbyists) never feed the tally, but they
    // can be followed, so their edges and ballots belong in the snapshot.
    let mut snapshot = DecisionSnapshot::new(decision.clone());
    let mut seen: HashSet<String> = members.iter().cloned().collect();
    let mut queue: VecDeque<String> = members.iter().cloned().collect();
    while let Some(voter) = queue.pop_front() {
        let followings = store.list_followings(&voter).await?;
        for following in &followings {
            if seen.insert(following.followee_id.clone()) {
                queue.push_back(following.followee_id.clone());
            }
        }
        snapshot.set_followings(voter, followings);
    }
    for ballot in store.list_decision_ballots(decision_id).await? {
        snapshot.insert_ballot(ballot);
    }
    let manual_ballots = snapshot.manual_ballot_count();

    // The pass itself is pure and synchronous over the snapshot.
    let mut resolver = Resolver::new(&snapshot);
    for member in &members {
        resolver.resolve(member);
    }
    let outcome = resolver.finish();

    // Write back: votes are replaced atomically per ballot, then the ballot
    // is flagged calculated with its inherited tags.
    let mut abstentions = 0;
    for ballot in outcome.calculated.values() {
        let stored = store
            .get_or_create_ballot(&ballot.voter_id, decision_id)
            .await?;
        if !stored.is_calculated {
            // A manual ballot appeared after the snapshot was taken. It is
            // authoritative; the stale calculation is discarded.
            warn!(
                "Ballot of {} for {} became manual mid-pass, skipping write",
                ballot.voter_id, decision_id
            );
            continue;
        }
        store.replace_votes(&stored.id, &ballot.votes).await?;
        let mut updated = stored;
        updated.tags = ballot.tags.clone();
        updated.is_calculated = true;
        store.mark_calculated(&updated).await?;
        if ballot.is_abstention() {
            abstentions += 1;
        }
    }

    info!(
        "Decision {} resolved: {} calculated, {} manual, {} abstaining",
        decision_id,
        outcome.calculated.len(),
        manual_ballots,
        abstentions
    );

    Ok(ResolutionReport {
        decision_id: decision_id.to_string(),
        calculated_ballots: outcome.calculated.len(),
        manual_ballots,
        abstentions,
        log: outcome.log,
    })
}
