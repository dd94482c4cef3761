use sqlx::{migrate::MigrateDatabase, sqlite::{SqlitePool, SqlitePoolOptions}, Sqlite, Row};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::env;

use crate::error::{ModelError, StoreError};
use crate::models::{Ballot, Choice, Decision, Following};
use crate::stars::Stars;

/// The storage operations the resolver and the tally engine consume.
///
/// This is the library boundary: the core reads the delegation graph and
/// writes calculated ballots through this trait and nothing else. Vote
/// replacement is atomic per ballot (delete-then-insert in one
/// transaction); a pass that fails mid-way never leaves a ballot with half
/// its votes.
#[async_trait]
pub trait BallotStore: Send + Sync {
    async fn get_decision(&self, decision_id: &str) -> Result<Decision, StoreError>;

    /// Voting members of a community. Non-voting "lobbyist" members are not
    /// listed; their ballots never feed a tally.
    async fn list_voting_members(&self, community_id: &str) -> Result<Vec<String>, StoreError>;

    /// A voter's followings, ordered by ascending priority with creation
    /// time as the stable secondary key.
    async fn list_followings(&self, voter_id: &str) -> Result<Vec<Following>, StoreError>;

    /// Fetch the voter's ballot for a decision, creating an empty
    /// calculated one on first request.
    async fn get_or_create_ballot(
        &self,
        voter_id: &str,
        decision_id: &str,
    ) -> Result<Ballot, StoreError>;

    /// Atomically delete and recreate a ballot's votes.
    async fn replace_votes(
        &self,
        ballot_id: &str,
        votes: &BTreeMap<String, Stars>,
    ) -> Result<(), StoreError>;

    /// Flag a ballot as calculated and persist its inherited tags.
    async fn mark_calculated(&self, ballot: &Ballot) -> Result<(), StoreError>;

    /// Every ballot cast or calculated for a decision, votes attached.
    async fn list_decision_ballots(&self, decision_id: &str) -> Result<Vec<Ballot>, StoreError>;
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new() -> Result<Self, StoreError> {
        // Get database URL from the environment (or .env) or use a default
        dotenvy::dotenv().ok();
        let db_url = env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:crowdvote.db".to_string());

        // Create database if it doesn't exist
        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            Sqlite::create_database(&db_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    /// An in-memory database, one connection only: every `:memory:`
    /// connection is a separate database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    // Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // Initialize the database schema
    async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS members (
                community_id TEXT NOT NULL,
                voter_id TEXT NOT NULL,
                is_voting BOOLEAN NOT NULL DEFAULT TRUE,
                PRIMARY KEY (community_id, voter_id)
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS decisions (
                id TEXT PRIMARY KEY,
                community_id TEXT NOT NULL,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                closes_at TEXT
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS choices (
                id TEXT PRIMARY KEY,
                decision_id TEXT NOT NULL,
                text TEXT NOT NULL,
                position INTEGER NOT NULL,
                FOREIGN KEY (decision_id) REFERENCES decisions(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS followings (
                follower_id TEXT NOT NULL,
                followee_id TEXT NOT NULL,
                tags TEXT NOT NULL,
                priority INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (follower_id, followee_id)
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ballots (
                id TEXT PRIMARY KEY,
                voter_id TEXT NOT NULL,
                decision_id TEXT NOT NULL,
                tags TEXT NOT NULL,
                is_calculated BOOLEAN NOT NULL,
                created_at TEXT NOT NULL,
                UNIQUE (voter_id, decision_id),
                FOREIGN KEY (decision_id) REFERENCES decisions(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS votes (
                ballot_id TEXT NOT NULL,
                choice_id TEXT NOT NULL,
                stars TEXT NOT NULL,
                PRIMARY KEY (ballot_id, choice_id),
                FOREIGN KEY (ballot_id) REFERENCES ballots(id) ON DELETE CASCADE,
                FOREIGN KEY (choice_id) REFERENCES choices(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    // Add or update a community member
    pub async fn add_member(
        &self,
        community_id: &str,
        voter_id: &str,
        is_voting: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO members (community_id, voter_id, is_voting)
            VALUES (?, ?, ?)
            ON CONFLICT(community_id, voter_id)
            DO UPDATE SET is_voting = excluded.is_voting
            "#,
        )
        .bind(community_id)
        .bind(voter_id)
        .bind(is_voting)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // Create a new decision with its choices
    pub async fn create_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        let mut texts = HashSet::new();
        for choice in &decision.choices {
            if !texts.insert(choice.text.as_str()) {
                return Err(ModelError::DuplicateChoice(choice.text.clone()).into());
            }
        }

        sqlx::query(
            r#"
            INSERT INTO decisions (id, community_id, title, created_at, closes_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&decision.id)
        .bind(&decision.community_id)
        .bind(&decision.title)
        .bind(decision.created_at.to_rfc3339())
        .bind(decision.closes_at.map(|dt| dt.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        for (i, choice) in decision.choices.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO choices (id, decision_id, text, position)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(&choice.id)
            .bind(&decision.id)
            .bind(&choice.text)
            .bind(i as i64)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    // Create or update a following (unique per follower/followee pair)
    pub async fn follow(&self, following: &Following) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO followings (follower_id, followee_id, tags, priority, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(follower_id, followee_id)
            DO UPDATE SET tags = excluded.tags, priority = excluded.priority
            "#,
        )
        .bind(&following.follower_id)
        .bind(&following.followee_id)
        .bind(encode_tags(&following.tags)?)
        .bind(i64::from(following.priority))
        .bind(following.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unfollow(&self, follower_id: &str, followee_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            DELETE FROM followings
            WHERE follower_id = ? AND followee_id = ?
            "#,
        )
        .bind(follower_id)
        .bind(followee_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Cast a manual ballot: whole-star ratings plus the voter's topic
    /// tags. Replaces whatever ballot the voter had and clears the
    /// calculated flag, so the resolver treats it as authoritative.
    pub async fn cast_ballot(
        &self,
        voter_id: &str,
        decision_id: &str,
        tags: &[&str],
        ratings: &[(&str, u8)],
    ) -> Result<Ballot, StoreError> {
        // First verify the decision and its choices exist
        let decision = self.get_decision(decision_id).await?;
        let mut votes = BTreeMap::new();
        for (choice_id, stars) in ratings {
            if !decision.choices.iter().any(|c| c.id == *choice_id) {
                return Err(StoreError::ChoiceNotFound((*choice_id).to_string()));
            }
            votes.insert((*choice_id).to_string(), Stars::from_whole(*stars)?);
        }

        let mut ballot = self.get_or_create_ballot(voter_id, decision_id).await?;
        ballot.tags = crate::delegation::tags::normalize_tags(tags)?;
        ballot.is_calculated = false;
        ballot.votes = votes;

        sqlx::query(
            r#"
            UPDATE ballots
            SET tags = ?, is_calculated = FALSE
            WHERE id = ?
            "#,
        )
        .bind(encode_tags(&ballot.tags)?)
        .bind(&ballot.id)
        .execute(&self.pool)
        .await?;

        self.replace_votes(&ballot.id, &ballot.votes).await?;
        Ok(ballot)
    }

    async fn load_votes(&self, ballot_id: &str) -> Result<BTreeMap<String, Stars>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT choice_id, stars
            FROM votes
            WHERE ballot_id = ?
            "#,
        )
        .bind(ballot_id)
        .fetch_all(&self.pool)
        .await?;

        let mut votes = BTreeMap::new();
        for row in rows {
            let choice_id = row.get::<String, _>("choice_id");
            let stars = parse_stars(&row.get::<String, _>("stars"))?;
            votes.insert(choice_id, stars);
        }
        Ok(votes)
    }

    fn row_to_ballot(row: &sqlx::sqlite::SqliteRow) -> Result<Ballot, StoreError> {
        Ok(Ballot {
            id: row.get::<String, _>("id"),
            voter_id: row.get::<String, _>("voter_id"),
            decision_id: row.get::<String, _>("decision_id"),
            tags: decode_tags(&row.get::<String, _>("tags"))?,
            is_calculated: row.get::<bool, _>("is_calculated"),
            votes: BTreeMap::new(),
        })
    }
}

#[async_trait]
impl BallotStore for Database {
    async fn get_decision(&self, decision_id: &str) -> Result<Decision, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, community_id, title, created_at, closes_at
            FROM decisions
            WHERE id = ?
            "#,
        )
        .bind(decision_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::DecisionNotFound(decision_id.to_string()))?;

        let choices = sqlx::query(
            r#"
            SELECT id, text
            FROM choices
            WHERE decision_id = ?
            ORDER BY position
            "#,
        )
        .bind(decision_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| Choice {
            id: row.get::<String, _>("id"),
            text: row.get::<String, _>("text"),
        })
        .collect();

        Ok(Decision {
            id: row.get::<String, _>("id"),
            community_id: row.get::<String, _>("community_id"),
            title: row.get::<String, _>("title"),
            choices,
            created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
            closes_at: row
                .get::<Option<String>, _>("closes_at")
                .map(|s| parse_timestamp(&s))
                .transpose()?,
        })
    }

    async fn list_voting_members(&self, community_id: &str) -> Result<Vec<String>, StoreError> {
        let members = sqlx::query(
            r#"
            SELECT voter_id
            FROM members
            WHERE community_id = ? AND is_voting = TRUE
            ORDER BY voter_id
            "#,
        )
        .bind(community_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("voter_id"))
        .collect();
        Ok(members)
    }

    async fn list_followings(&self, voter_id: &str) -> Result<Vec<Following>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT follower_id, followee_id, tags, priority, created_at
            FROM followings
            WHERE follower_id = ?
            ORDER BY priority, created_at
            "#,
        )
        .bind(voter_id)
        .fetch_all(&self.pool)
        .await?;

        let mut followings = Vec::with_capacity(rows.len());
        for row in rows {
            followings.push(Following {
                follower_id: row.get::<String, _>("follower_id"),
                followee_id: row.get::<String, _>("followee_id"),
                tags: decode_tags(&row.get::<String, _>("tags"))?,
                priority: row.get::<i64, _>("priority") as u32,
                created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
            });
        }
        Ok(followings)
    }

    async fn get_or_create_ballot(
        &self,
        voter_id: &str,
        decision_id: &str,
    ) -> Result<Ballot, StoreError> {
        let existing = sqlx::query(
            r#"
            SELECT id, voter_id, decision_id, tags, is_calculated
            FROM ballots
            WHERE voter_id = ? AND decision_id = ?
            "#,
        )
        .bind(voter_id)
        .bind(decision_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = existing {
            let mut ballot = Self::row_to_ballot(&row)?;
            ballot.votes = self.load_votes(&ballot.id).await?;
            return Ok(ballot);
        }

        let ballot = Ballot::calculated(voter_id, decision_id);
        sqlx::query(
            r#"
            INSERT INTO ballots (id, voter_id, decision_id, tags, is_calculated, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&ballot.id)
        .bind(&ballot.voter_id)
        .bind(&ballot.decision_id)
        .bind(encode_tags(&ballot.tags)?)
        .bind(ballot.is_calculated)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(ballot)
    }

    async fn replace_votes(
        &self,
        ballot_id: &str,
        votes: &BTreeMap<String, Stars>,
    ) -> Result<(), StoreError> {
        // Delete-then-insert inside one transaction: a ballot is never left
        // with a partial vote set.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM votes WHERE ballot_id = ?")
            .bind(ballot_id)
            .execute(&mut *tx)
            .await?;
        for (choice_id, stars) in votes {
            sqlx::query(
                r#"
                INSERT INTO votes (ballot_id, choice_id, stars)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(ballot_id)
            .bind(choice_id)
            .bind(stars.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn mark_calculated(&self, ballot: &Ballot) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE ballots
            SET is_calculated = TRUE, tags = ?
            WHERE id = ?
            "#,
        )
        .bind(encode_tags(&ballot.tags)?)
        .bind(&ballot.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_decision_ballots(&self, decision_id: &str) -> Result<Vec<Ballot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, voter_id, decision_id, tags, is_calculated
            FROM ballots
            WHERE decision_id = ?
            ORDER BY voter_id
            "#,
        )
        .bind(decision_id)
        .fetch_all(&self.pool)
        .await?;

        let mut ballots = Vec::with_capacity(rows.len());
        for row in rows {
            let mut ballot = Self::row_to_ballot(&row)?;
            ballot.votes = self.load_votes(&ballot.id).await?;
            ballots.push(ballot);
        }
        Ok(ballots)
    }
}

fn encode_tags(tags: &BTreeSet<String>) -> Result<String, StoreError> {
    serde_json::to_string(tags).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn decode_tags(raw: &str) -> Result<BTreeSet<String>, StoreError> {
    serde_json::from_str(raw)
        .map_err(|e| StoreError::Corrupt(format!("tags {:?}: {}", raw, e)))
}

fn parse_stars(raw: &str) -> Result<Stars, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("stars {:?}: {}", raw, e)))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {:?}: {}", raw, e)))
}
