pub mod star;
pub mod tiebreak;

use std::collections::{BTreeMap, HashMap, HashSet};

use log::info;
use serde::{Deserialize, Serialize};

use crate::db::BallotStore;
use crate::error::TallyError;
use crate::stars::Stars;

/// Head-to-head detail of the automatic runoff between the two finalists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunoffDetails {
    pub finalist_a: String,
    pub finalist_b: String,
    /// Ballots preferring finalist A (strictly more stars than B).
    pub a_preferences: u32,
    /// Ballots preferring finalist B.
    pub b_preferences: u32,
    /// Ballots rating both finalists equally.
    pub no_preference: u32,
}

/// Outcome of a STAR tally for one decision.
///
/// `tally_log` is the ordered audit trail of every phase; a result that
/// cannot be independently re-derived from it is a bug, not a formatting
/// concern. `tied_candidates` is empty on a resolved tally; the unresolved
/// case surfaces as [`TallyError::UnresolvedTie`] instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TallyResult {
    pub winner: Option<String>,
    pub scores: BTreeMap<String, Stars>,
    pub runoff_details: Option<RunoffDetails>,
    pub tally_log: Vec<String>,
    pub tied_candidates: Vec<String>,
}

/// Tally a single decision from its stored ballots.
///
/// Only voting members feed the tally (non-voting "lobbyist" members can be
/// followed, but their ballots stop here). Fully-empty ballots are
/// abstentions and do not dilute the score denominators. Ballot keys are
/// remapped from choice ids to choice texts so the audit log reads like the
/// decision it describes.
///
/// Call this on a snapshot of already-resolved ballots; never concurrently
/// with the same decision's resolver pass.
pub async fn tally_decision<S: BallotStore + ?Sized>(
    store: &S,
    decision_id: &str,
) -> Result<TallyResult, TallyError> {
    let decision = store.get_decision(decision_id).await?;
    let members: HashSet<String> = store
        .list_voting_members(&decision.community_id)
        .await?
        .into_iter()
        .collect();
    let choice_texts: HashMap<&str, &str> = decision
        .choices
        .iter()
        .map(|choice| (choice.id.as_str(), choice.text.as_str()))
        .collect();

    let mut stored = store.list_decision_ballots(decision_id).await?;
    stored.sort_by(|a, b| a.voter_id.cmp(&b.voter_id));

    let mut ballots: Vec<BTreeMap<String, Stars>> = Vec::new();
    let mut lobbyists = 0;
    let mut abstentions = 0;
    for ballot in stored {
        if !members.contains(&ballot.voter_id) {
            lobbyists += 1;
            continue;
        }
        if ballot.is_abstention() {
            abstentions += 1;
            continue;
        }
        let votes = ballot
            .votes
            .into_iter()
            .map(|(choice_id, stars)| {
                let key = choice_texts
                    .get(choice_id.as_str())
                    .map(|text| (*text).to_string())
                    .unwrap_or(choice_id);
                (key, stars)
            })
            .collect();
        ballots.push(votes);
    }

    info!(
        "Tallying decision {} ({}): {} ballots, {} abstaining, {} non-voting excluded",
        decision.id,
        decision.title,
        ballots.len(),
        abstentions,
        lobbyists
    );

    star::tally(&ballots)
}
