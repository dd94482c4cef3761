use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::delegation::tags::normalize_tags;
use crate::error::ModelError;
use crate::stars::Stars;

/// A delegation edge: `follower` inherits votes from `followee`, optionally
/// restricted to the given topic tags. An empty tag set means "all topics".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Following {
    pub follower_id: String,
    pub followee_id: String,
    pub tags: BTreeSet<String>,
    /// Lower value = consulted first. Orders store reads and log output;
    /// qualifying sources are averaged with equal weight regardless.
    pub priority: u32,
    pub created_at: DateTime<Utc>,
}

impl Following {
    pub fn new(
        follower_id: impl Into<String>,
        followee_id: impl Into<String>,
        tags: &[&str],
        priority: u32,
    ) -> Result<Self, ModelError> {
        let follower_id = follower_id.into();
        let followee_id = followee_id.into();
        if follower_id == followee_id {
            return Err(ModelError::SelfFollow);
        }
        if priority < 1 {
            return Err(ModelError::ZeroPriority);
        }
        Ok(Self {
            follower_id,
            followee_id,
            tags: normalize_tags(tags)?,
            priority,
            created_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    pub text: String,
}

/// A question a community decides on, with an ordered set of choices.
/// Read-only to the resolver and the tally engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub community_id: String,
    pub title: String,
    pub choices: Vec<Choice>,
    pub created_at: DateTime<Utc>,
    pub closes_at: Option<DateTime<Utc>>,
}

impl Decision {
    pub fn new(
        community_id: impl Into<String>,
        title: impl Into<String>,
        choice_texts: Vec<String>,
        closes_at: Option<DateTime<Utc>>,
    ) -> Self {
        let choices = choice_texts
            .into_iter()
            .map(|text| Choice {
                id: Uuid::new_v4().to_string(),
                text,
            })
            .collect();

        Self {
            id: Uuid::new_v4().to_string(),
            community_id: community_id.into(),
            title: title.into(),
            choices,
            created_at: Utc::now(),
            closes_at,
        }
    }

    pub fn choice_by_text(&self, text: &str) -> Option<&Choice> {
        self.choices.iter().find(|choice| choice.text == text)
    }
}

/// One member's ballot for one decision.
///
/// A manual ballot (`is_calculated == false`) is authoritative: the resolver
/// returns it unchanged. A calculated ballot is a memoized view that is
/// fully replaced on every resolution pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub id: String,
    pub voter_id: String,
    pub decision_id: String,
    pub tags: BTreeSet<String>,
    pub is_calculated: bool,
    /// Stars keyed by choice id. A choice absent from the map is a choice
    /// the voter is silent on, which is not the same as rating it 0.
    pub votes: BTreeMap<String, Stars>,
}

impl Ballot {
    /// An empty calculated ballot, created the first time a voter is
    /// resolved. With no qualifying sources it stays empty: full abstention.
    pub fn calculated(voter_id: impl Into<String>, decision_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            voter_id: voter_id.into(),
            decision_id: decision_id.into(),
            tags: BTreeSet::new(),
            is_calculated: true,
            votes: BTreeMap::new(),
        }
    }

    /// A ballot cast directly by the voter.
    pub fn manual(
        voter_id: impl Into<String>,
        decision_id: impl Into<String>,
        tags: &[&str],
        votes: BTreeMap<String, Stars>,
    ) -> Result<Self, ModelError> {
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            voter_id: voter_id.into(),
            decision_id: decision_id.into(),
            tags: normalize_tags(tags)?,
            is_calculated: false,
            votes,
        })
    }

    /// True when the ballot rates no choice at all.
    pub fn is_abstention(&self) -> bool {
        self.votes.is_empty()
    }
}
