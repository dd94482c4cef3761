//! End-to-end flow: seed a community in SQLite, resolve the delegation
//! graph, tally the decision.

use crowdvote::db::{BallotStore, Database};
use crowdvote::models::{Decision, Following};
use crowdvote::stars::Stars;
use crowdvote::{resolve_decision, tally_decision, TallyError};

async fn seeded_community(choice_texts: &[&str]) -> (Database, Decision) {
    let _ = env_logger::builder().is_test(true).try_init();
    let db = Database::in_memory().await.unwrap();
    let decision = Decision::new(
        "springfield",
        "Community garden plan",
        choice_texts.iter().map(|t| t.to_string()).collect(),
        None,
    );
    db.create_decision(&decision).await.unwrap();
    (db, decision)
}

fn choice_id<'a>(decision: &'a Decision, text: &str) -> &'a str {
    &decision.choice_by_text(text).unwrap().id
}

#[tokio::test]
async fn delegated_votes_flow_into_the_tally() {
    let (db, decision) = seeded_community(&["apple", "banana"]).await;
    let apple = choice_id(&decision, "apple");
    let banana = choice_id(&decision, "banana");

    for member in ["ada", "grace", "kay"] {
        db.add_member("springfield", member, true).await.unwrap();
    }

    // grace and kay vote directly; ada follows both.
    db.cast_ballot("grace", &decision.id, &["garden"], &[(apple, 5), (banana, 3)])
        .await
        .unwrap();
    db.cast_ballot("kay", &decision.id, &["garden"], &[(apple, 4), (banana, 5)])
        .await
        .unwrap();
    db.follow(&Following::new("ada", "grace", &[], 1).unwrap())
        .await
        .unwrap();
    db.follow(&Following::new("ada", "kay", &[], 2).unwrap())
        .await
        .unwrap();

    let report = resolve_decision(&db, &decision.id).await.unwrap();
    assert_eq!(report.calculated_ballots, 1);
    assert_eq!(report.manual_ballots, 2);
    assert_eq!(report.abstentions, 0);

    let ada = db.get_or_create_ballot("ada", &decision.id).await.unwrap();
    assert!(ada.is_calculated);
    assert_eq!(ada.votes[apple].to_string(), "4.5");
    assert_eq!(ada.votes[banana].to_string(), "4");

    let result = tally_decision(&db, &decision.id).await.unwrap();
    // apple: (5 + 4 + 4.5) / 3, banana: (3 + 5 + 4) / 3.
    assert_eq!(result.scores["apple"].to_string(), "4.5");
    assert_eq!(result.scores["banana"], Stars::from_whole(4).unwrap());
    assert_eq!(result.winner.as_deref(), Some("apple"));
    assert!(result.tally_log.iter().any(|l| l.contains("Score Phase")));
}

#[tokio::test]
async fn lobbyists_influence_delegation_but_not_the_tally() {
    let (db, decision) = seeded_community(&["apple", "banana"]).await;
    let apple = choice_id(&decision, "apple");

    db.add_member("springfield", "ada", true).await.unwrap();
    // lou is a non-voting lobbyist: followable, never tallied.
    db.add_member("springfield", "lou", false).await.unwrap();
    db.cast_ballot("lou", &decision.id, &[], &[(apple, 1)])
        .await
        .unwrap();
    db.follow(&Following::new("ada", "lou", &[], 1).unwrap())
        .await
        .unwrap();

    resolve_decision(&db, &decision.id).await.unwrap();

    let ada = db.get_or_create_ballot("ada", &decision.id).await.unwrap();
    assert_eq!(ada.votes[apple], Stars::from_whole(1).unwrap());

    // Only ada's ballot reaches the tally: apple averages 1, not (1+1)/2 —
    // and lou's own ballot is not in the denominator either.
    let result = tally_decision(&db, &decision.id).await.unwrap();
    assert_eq!(result.winner.as_deref(), Some("apple"));
    assert_eq!(result.scores["apple"], Stars::from_whole(1).unwrap());
}

#[tokio::test]
async fn tag_scoped_chain_resolves_through_intermediaries() {
    let (db, decision) = seeded_community(&["apple", "banana"]).await;
    let apple = choice_id(&decision, "apple");

    for member in ["ada", "betty", "carol"] {
        db.add_member("springfield", member, true).await.unwrap();
    }

    // carol votes on environment topics; betty follows her on that tag;
    // ada follows betty on the same tag. The scope must survive the hop.
    db.cast_ballot("carol", &decision.id, &["environment"], &[(apple, 5)])
        .await
        .unwrap();
    db.follow(&Following::new("betty", "carol", &["environment"], 1).unwrap())
        .await
        .unwrap();
    db.follow(&Following::new("ada", "betty", &["environment"], 1).unwrap())
        .await
        .unwrap();

    resolve_decision(&db, &decision.id).await.unwrap();

    let betty = db.get_or_create_ballot("betty", &decision.id).await.unwrap();
    assert_eq!(betty.votes[apple], Stars::from_whole(5).unwrap());
    assert!(betty.tags.contains("environment"));

    let ada = db.get_or_create_ballot("ada", &decision.id).await.unwrap();
    assert_eq!(ada.votes[apple], Stars::from_whole(5).unwrap());
}

#[tokio::test]
async fn cycles_resolve_to_abstentions_and_fail_the_tally() {
    let (db, decision) = seeded_community(&["apple"]).await;

    db.add_member("springfield", "ada", true).await.unwrap();
    db.add_member("springfield", "grace", true).await.unwrap();
    db.follow(&Following::new("ada", "grace", &[], 1).unwrap())
        .await
        .unwrap();
    db.follow(&Following::new("grace", "ada", &[], 1).unwrap())
        .await
        .unwrap();

    let report = resolve_decision(&db, &decision.id).await.unwrap();
    assert_eq!(report.calculated_ballots, 2);
    assert_eq!(report.abstentions, 2);
    assert!(report.log.iter().any(|l| l.contains("Circular delegation")));

    // Nothing but empty ballots: the tally refuses to run.
    let err = tally_decision(&db, &decision.id).await.unwrap_err();
    assert!(matches!(err, TallyError::NoBallots));
}

#[tokio::test]
async fn manual_ballots_survive_repeated_resolution() {
    let (db, decision) = seeded_community(&["apple"]).await;
    let apple = choice_id(&decision, "apple");

    db.add_member("springfield", "ada", true).await.unwrap();
    db.add_member("springfield", "grace", true).await.unwrap();
    db.cast_ballot("ada", &decision.id, &[], &[(apple, 2)])
        .await
        .unwrap();
    db.cast_ballot("grace", &decision.id, &[], &[(apple, 5)])
        .await
        .unwrap();
    // ada follows grace, but her manual ballot stays authoritative.
    db.follow(&Following::new("ada", "grace", &[], 1).unwrap())
        .await
        .unwrap();

    resolve_decision(&db, &decision.id).await.unwrap();
    resolve_decision(&db, &decision.id).await.unwrap();

    let ada = db.get_or_create_ballot("ada", &decision.id).await.unwrap();
    assert!(!ada.is_calculated);
    assert_eq!(ada.votes[apple], Stars::from_whole(2).unwrap());
}

#[tokio::test]
async fn repeated_resolution_is_idempotent() {
    let (db, decision) = seeded_community(&["apple", "banana"]).await;
    let apple = choice_id(&decision, "apple");
    let banana = choice_id(&decision, "banana");

    for member in ["ada", "grace", "kay"] {
        db.add_member("springfield", member, true).await.unwrap();
    }
    db.cast_ballot("grace", &decision.id, &[], &[(apple, 5), (banana, 1)])
        .await
        .unwrap();
    db.cast_ballot("kay", &decision.id, &[], &[(apple, 2)])
        .await
        .unwrap();
    db.follow(&Following::new("ada", "grace", &[], 1).unwrap())
        .await
        .unwrap();
    db.follow(&Following::new("ada", "kay", &[], 2).unwrap())
        .await
        .unwrap();

    resolve_decision(&db, &decision.id).await.unwrap();
    let first = db.list_decision_ballots(&decision.id).await.unwrap();

    resolve_decision(&db, &decision.id).await.unwrap();
    let second = db.list_decision_ballots(&decision.id).await.unwrap();

    assert_eq!(first, second);
}

#[tokio::test]
async fn unresolved_tie_propagates_with_the_audit_log() {
    let (db, decision) = seeded_community(&["alice", "bob"]).await;
    let alice = choice_id(&decision, "alice");
    let bob = choice_id(&decision, "bob");

    db.add_member("springfield", "v1", true).await.unwrap();
    db.add_member("springfield", "v2", true).await.unwrap();
    db.cast_ballot("v1", &decision.id, &[], &[(alice, 5), (bob, 4)])
        .await
        .unwrap();
    db.cast_ballot("v2", &decision.id, &[], &[(alice, 4), (bob, 5)])
        .await
        .unwrap();

    resolve_decision(&db, &decision.id).await.unwrap();
    let err = tally_decision(&db, &decision.id).await.unwrap_err();
    match err {
        TallyError::UnresolvedTie {
            tied_candidates,
            tally_log,
        } => {
            assert_eq!(tied_candidates, vec!["alice".to_string(), "bob".to_string()]);
            assert!(tally_log.iter().any(|l| l.contains("Tiebreaker Step 4")));
        }
        other => panic!("expected UnresolvedTie, got {:?}", other),
    }
}
