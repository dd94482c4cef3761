use std::collections::BTreeMap;

use crate::error::TallyError;
use crate::stars::Stars;
use crate::voting::tiebreak;
use crate::voting::{RunoffDetails, TallyResult};

/// STAR tally: Score, Then Automatic Runoff.
///
/// Ballots map choice to stars; the union of all keys defines the choice
/// universe. A ballot missing a choice contributes 0 to that choice's score
/// phase average (contrast with the resolver, where silence means absence).
/// Every phase appends to the audit log.
pub fn tally(ballots: &[BTreeMap<String, Stars>]) -> Result<TallyResult, TallyError> {
    if ballots.is_empty() {
        return Err(TallyError::NoBallots);
    }

    // Choice universe in first-appearance order. This order is the stable
    // secondary key for every later sort, so the whole tally is a pure
    // function of the ballot sequence.
    let mut choices: Vec<String> = Vec::new();
    for ballot in ballots {
        for choice in ballot.keys() {
            if !choices.iter().any(|c| c == choice) {
                choices.push(choice.clone());
            }
        }
    }
    if choices.is_empty() {
        return Err(TallyError::NoChoices);
    }

    let mut log = Vec::new();
    log.push(format!(
        "Score Phase: averaging stars across {} ballots",
        ballots.len()
    ));

    let mut scores: BTreeMap<String, Stars> = BTreeMap::new();
    for choice in &choices {
        let score = Stars::mean_over(
            ballots.iter().filter_map(|b| b.get(choice).copied()),
            ballots.len(),
        )
        .unwrap_or(Stars::ZERO);
        log.push(format!("  {}: {} stars", choice, score));
        scores.insert(choice.clone(), score);
    }

    if choices.len() == 1 {
        let winner = choices.remove(0);
        log.push(format!(
            "Only one choice received votes; {} wins outright, no runoff",
            winner
        ));
        return Ok(TallyResult {
            winner: Some(winner),
            scores,
            runoff_details: None,
            tally_log: log,
            tied_candidates: Vec::new(),
        });
    }

    let mut ranked = choices.clone();
    ranked.sort_by(|a, b| scores[b].cmp(&scores[a]));

    let (finalist_a, finalist_b) = tiebreak::select_finalists(&ranked, &scores, ballots, &mut log);

    // Automatic runoff: strict per-ballot preference between the finalists,
    // a missing vote counting as 0 stars.
    log.push(format!("Automatic Runoff: {} vs {}", finalist_a, finalist_b));
    let mut a_preferences = 0u32;
    let mut b_preferences = 0u32;
    let mut no_preference = 0u32;
    for ballot in ballots {
        let a = ballot.get(&finalist_a).copied().unwrap_or(Stars::ZERO);
        let b = ballot.get(&finalist_b).copied().unwrap_or(Stars::ZERO);
        if a > b {
            a_preferences += 1;
        } else if b > a {
            b_preferences += 1;
        } else {
            no_preference += 1;
        }
    }
    log.push(format!(
        "  {}: {} preferred, {}: {} preferred, {} with no preference",
        finalist_a, a_preferences, finalist_b, b_preferences, no_preference
    ));

    let winner = if a_preferences > b_preferences {
        finalist_a.clone()
    } else if b_preferences > a_preferences {
        finalist_b.clone()
    } else {
        log.push(
            "Runoff preferences are exactly equal; applying the Official Tiebreaker Protocol"
                .to_string(),
        );
        tiebreak::resolve_runoff_tie(&finalist_a, &finalist_b, &scores, ballots, &mut log)?
    };
    log.push(format!("Winner: {}", winner));

    Ok(TallyResult {
        winner: Some(winner),
        scores,
        runoff_details: Some(RunoffDetails {
            finalist_a,
            finalist_b,
            a_preferences,
            b_preferences,
            no_preference,
        }),
        tally_log: log,
        tied_candidates: Vec::new(),
    })
}
