use thiserror::Error;

/// Failures constructing or validating domain records.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("a member cannot follow themselves")]
    SelfFollow,

    #[error("following priority must be at least 1")]
    ZeroPriority,

    #[error("invalid topic tag: {0:?}")]
    InvalidTag(String),

    #[error("duplicate choice text: {0:?}")]
    DuplicateChoice(String),
}

/// Failures in the storage collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("decision not found: {0}")]
    DecisionNotFound(String),

    #[error("choice not found on decision: {0}")]
    ChoiceNotFound(String),

    #[error("invalid record: {0}")]
    Model(#[from] ModelError),

    #[error("invalid star rating: {0}")]
    Rating(#[from] crate::stars::StarsError),

    #[error("malformed stored value: {0}")]
    Corrupt(String),
}

/// Failures of a delegation resolution pass.
///
/// Cycles and over-depth branches are NOT errors: they are recovered locally
/// inside the resolver and only show up in the resolution log.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Failures of a STAR tally.
#[derive(Debug, Error)]
pub enum TallyError {
    #[error("cannot tally an empty ballot set")]
    NoBallots,

    #[error("ballots contain no choices")]
    NoChoices,

    /// Terminal outcome of Tiebreaker Step 4: every automatic rule is
    /// exhausted and a community manager must decide out-of-band. Carries
    /// the tied candidates and the full ordered audit log so the result
    /// stays independently verifiable.
    #[error("unresolved tie between: {}", tied_candidates.join(", "))]
    UnresolvedTie {
        tied_candidates: Vec<String>,
        tally_log: Vec<String>,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
