//! The Official Tiebreaker Protocol.
//!
//! Step 1 picks the runoff finalists out of score-phase ties by repeated
//! head-to-head elimination. Steps 2-4 resolve an exactly tied runoff:
//! higher score-phase average, then more five-star ballots, then a terminal
//! `UnresolvedTie` handed to a human. Every step logs what it did and why.

use std::collections::BTreeMap;

use crate::error::TallyError;
use crate::stars::Stars;

/// Select the two runoff finalists from the score-ranked choice list.
///
/// `ranked` is sorted by score descending with the tally's stable order as
/// the secondary key; ties for first or second place go through Step 1
/// head-to-head elimination.
pub(crate) fn select_finalists(
    ranked: &[String],
    scores: &BTreeMap<String, Stars>,
    ballots: &[BTreeMap<String, Stars>],
    log: &mut Vec<String>,
) -> (String, String) {
    let top_score = scores[&ranked[0]];
    let top: Vec<String> = ranked
        .iter()
        .filter(|choice| scores[*choice] == top_score)
        .cloned()
        .collect();

    if top.len() == 1 {
        let second_score = scores[&ranked[1]];
        let second: Vec<String> = ranked
            .iter()
            .filter(|choice| scores[*choice] == second_score)
            .cloned()
            .collect();
        if second.len() == 1 {
            return (top[0].clone(), second[0].clone());
        }
        log.push(format!(
            "Tiebreaker Step 1: {} choices tied for second at {} stars",
            second.len(),
            second_score
        ));
        let survivors = eliminate_to(second, 1, ballots, log);
        return (top[0].clone(), survivors[0].clone());
    }

    if top.len() == 2 {
        log.push(format!(
            "Tiebreaker Step 1: two-way tie for first at {} stars, both advance to the runoff",
            top_score
        ));
        return (top[0].clone(), top[1].clone());
    }

    log.push(format!(
        "Tiebreaker Step 1: {} choices tied for first at {} stars",
        top.len(),
        top_score
    ));
    let survivors = eliminate_to(top, 2, ballots, log);
    (survivors[0].clone(), survivors[1].clone())
}

/// Repeatedly eliminate the candidate(s) with the most head-to-head losses
/// until `target` remain.
///
/// When every remaining candidate has an identical win/loss record (a
/// perfect cyclic tie), or eliminating the most-beaten set would drop below
/// `target`, elimination is inconclusive: the survivors are taken in stable
/// tally order and the log says so.
pub(crate) fn eliminate_to(
    mut candidates: Vec<String>,
    target: usize,
    ballots: &[BTreeMap<String, Stars>],
    log: &mut Vec<String>,
) -> Vec<String> {
    while candidates.len() > target {
        let mut records = vec![(0u32, 0u32); candidates.len()];
        for i in 0..candidates.len() {
            for j in i + 1..candidates.len() {
                let (first, second) = pairwise_preferences(&candidates[i], &candidates[j], ballots);
                if first > second {
                    records[i].0 += 1;
                    records[j].1 += 1;
                } else if second > first {
                    records[j].0 += 1;
                    records[i].1 += 1;
                }
                // Equal preference counts score neither a win nor a loss.
            }
        }

        if records.iter().all(|record| *record == records[0]) {
            log.push(format!(
                "Tiebreaker Step 1: all head-to-head records are identical ({} wins, {} losses each); \
                 elimination is inconclusive, keeping the first {} in tally order",
                records[0].0, records[0].1, target
            ));
            candidates.truncate(target);
            break;
        }

        let most_losses = records
            .iter()
            .map(|record| record.1)
            .max()
            .unwrap_or_default();
        let worst: Vec<usize> = (0..candidates.len())
            .filter(|&i| records[i].1 == most_losses)
            .collect();

        if candidates.len() - worst.len() < target {
            log.push(format!(
                "Tiebreaker Step 1: eliminating every choice with {} losses would leave fewer than {}; \
                 keeping the least-beaten in tally order",
                most_losses, target
            ));
            // Stable sort: fewer losses first, tally order within equals.
            let mut indexed: Vec<(String, u32)> = candidates
                .into_iter()
                .zip(records.iter().map(|record| record.1))
                .collect();
            indexed.sort_by_key(|(_, losses)| *losses);
            candidates = indexed.into_iter().map(|(choice, _)| choice).collect();
            candidates.truncate(target);
            break;
        }

        for &i in worst.iter().rev() {
            log.push(format!(
                "Tiebreaker Step 1: eliminated {} on head-to-head record ({} wins, {} losses)",
                candidates[i], records[i].0, records[i].1
            ));
            candidates.remove(i);
        }
    }
    candidates
}

/// Resolve an exactly tied runoff between `a` and `b`, or fail with the
/// terminal `UnresolvedTie`. Steps 2 and 3 require a STRICT advantage.
pub(crate) fn resolve_runoff_tie(
    a: &str,
    b: &str,
    scores: &BTreeMap<String, Stars>,
    ballots: &[BTreeMap<String, Stars>],
    log: &mut Vec<String>,
) -> Result<String, TallyError> {
    let score_a = scores[a];
    let score_b = scores[b];
    log.push(format!(
        "Tiebreaker Step 2: score-phase averages ({}: {}, {}: {})",
        a, score_a, b, score_b
    ));
    if score_a > score_b {
        log.push(format!("Tiebreaker Step 2: {} wins on the higher average", a));
        return Ok(a.to_string());
    }
    if score_b > score_a {
        log.push(format!("Tiebreaker Step 2: {} wins on the higher average", b));
        return Ok(b.to_string());
    }
    log.push("Tiebreaker Step 2: averages are equal".to_string());

    let fives_a = count_five_star_ballots(a, ballots);
    let fives_b = count_five_star_ballots(b, ballots);
    log.push(format!(
        "Tiebreaker Step 3: five-star ballots ({}: {}, {}: {})",
        a, fives_a, b, fives_b
    ));
    if fives_a > fives_b {
        log.push(format!("Tiebreaker Step 3: {} wins on five-star ballots", a));
        return Ok(a.to_string());
    }
    if fives_b > fives_a {
        log.push(format!("Tiebreaker Step 3: {} wins on five-star ballots", b));
        return Ok(b.to_string());
    }
    log.push("Tiebreaker Step 3: five-star counts are equal".to_string());

    log.push(format!(
        "Tiebreaker Step 4: tie between {} and {} cannot be resolved automatically; \
         a community manager must decide",
        a, b
    ));
    Err(TallyError::UnresolvedTie {
        tied_candidates: vec![a.to_string(), b.to_string()],
        tally_log: log.clone(),
    })
}

/// Per-ballot strict preferences between two choices, missing votes as 0.
fn pairwise_preferences(
    a: &str,
    b: &str,
    ballots: &[BTreeMap<String, Stars>],
) -> (u32, u32) {
    let mut prefer_a = 0;
    let mut prefer_b = 0;
    for ballot in ballots {
        let stars_a = ballot.get(a).copied().unwrap_or(Stars::ZERO);
        let stars_b = ballot.get(b).copied().unwrap_or(Stars::ZERO);
        if stars_a > stars_b {
            prefer_a += 1;
        } else if stars_b > stars_a {
            prefer_b += 1;
        }
    }
    (prefer_a, prefer_b)
}

fn count_five_star_ballots(choice: &str, ballots: &[BTreeMap<String, Stars>]) -> u32 {
    ballots
        .iter()
        .filter(|ballot| ballot.get(choice) == Some(&Stars::FIVE))
        .count() as u32
}
