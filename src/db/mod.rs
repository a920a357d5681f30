pub mod changes;
pub mod memory;
pub mod option;
pub mod poll;
pub mod postgres;
pub mod vote;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use option::{InternalOption, OptionId};
use poll::{InternalPoll, PollId, UserId};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use vote::{InternalVote, StoredVote, VoteId, VoterId};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, serde::Deserialize, serde::Serialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

pub(crate) use string_id;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Which guard of the vote transaction rejected the write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precondition {
    /// A vote for this (voter, poll) pair already exists.
    VoteExists,
    /// The option does not exist or belongs to another poll.
    OptionNotInPoll,
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precondition::VoteExists => f.write_str("vote already exists"),
            Precondition::OptionNotInPoll => f.write_str("option does not belong to poll"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordVoteError {
    #[error("concurrent write conflict")]
    Conflict,
    #[error("precondition failed: {0}")]
    PreconditionFailed(Precondition),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum UpdatePollError {
    #[error("poll missing, not owned by caller, or already in requested state")]
    PreconditionFailed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Durable poll store. `None` means the record does not exist.
#[async_trait]
pub trait PollStore: Send + Sync {
    async fn get_poll(&self, id: &PollId) -> Result<Option<InternalPoll>, StoreError>;

    async fn get_option(&self, id: &OptionId) -> Result<Option<InternalOption>, StoreError>;

    /// Inserts the vote and increments the option counter in one transaction.
    ///
    /// The insert is guarded by "no vote exists for (voter, poll)" and the
    /// increment by "option belongs to poll". Either both writes commit or
    /// neither does.
    async fn record_vote(
        &self,
        vote: &InternalVote,
        observed_at: DateTime<Utc>,
    ) -> Result<(), RecordVoteError>;

    async fn get_vote(
        &self,
        voter_id: &VoterId,
        poll_id: &PollId,
    ) -> Result<Option<StoredVote>, StoreError>;

    /// Marks the vote with this id as settled. A vote that is missing or
    /// carries another id is left alone.
    async fn settle_vote(
        &self,
        voter_id: &VoterId,
        poll_id: &PollId,
        vote_id: &VoteId,
    ) -> Result<(), StoreError>;

    async fn create_poll(
        &self,
        poll: &InternalPoll,
        options: &[InternalOption],
    ) -> Result<(), StoreError>;

    async fn update_duration(
        &self,
        id: &PollId,
        owner: &UserId,
        duration: i64,
    ) -> Result<(), UpdatePollError>;

    async fn set_archived(
        &self,
        id: &PollId,
        owner: &UserId,
        archived: bool,
    ) -> Result<(), UpdatePollError>;
}

async fn bounded<T, E, F>(limit: Duration, fut: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<StoreError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit).into()),
    }
}

/// Wraps every call to the inner store in a timeout.
///
/// A timed out `record_vote` may still have committed.
#[derive(Clone)]
pub struct TimeoutStore {
    inner: Arc<dyn PollStore>,
    limit: Duration,
}

impl TimeoutStore {
    pub fn new(inner: Arc<dyn PollStore>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl PollStore for TimeoutStore {
    async fn get_poll(&self, id: &PollId) -> Result<Option<InternalPoll>, StoreError> {
        bounded(self.limit, self.inner.get_poll(id)).await
    }

    async fn get_option(&self, id: &OptionId) -> Result<Option<InternalOption>, StoreError> {
        bounded(self.limit, self.inner.get_option(id)).await
    }

    async fn record_vote(
        &self,
        vote: &InternalVote,
        observed_at: DateTime<Utc>,
    ) -> Result<(), RecordVoteError> {
        bounded(self.limit, self.inner.record_vote(vote, observed_at)).await
    }

    async fn get_vote(
        &self,
        voter_id: &VoterId,
        poll_id: &PollId,
    ) -> Result<Option<StoredVote>, StoreError> {
        bounded(self.limit, self.inner.get_vote(voter_id, poll_id)).await
    }

    async fn settle_vote(
        &self,
        voter_id: &VoterId,
        poll_id: &PollId,
        vote_id: &VoteId,
    ) -> Result<(), StoreError> {
        bounded(self.limit, self.inner.settle_vote(voter_id, poll_id, vote_id)).await
    }

    async fn create_poll(
        &self,
        poll: &InternalPoll,
        options: &[InternalOption],
    ) -> Result<(), StoreError> {
        bounded(self.limit, self.inner.create_poll(poll, options)).await
    }

    async fn update_duration(
        &self,
        id: &PollId,
        owner: &UserId,
        duration: i64,
    ) -> Result<(), UpdatePollError> {
        bounded(self.limit, self.inner.update_duration(id, owner, duration)).await
    }

    async fn set_archived(
        &self,
        id: &PollId,
        owner: &UserId,
        archived: bool,
    ) -> Result<(), UpdatePollError> {
        bounded(self.limit, self.inner.set_archived(id, owner, archived)).await
    }
}

pub async fn new_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    new_pool_with(database_url.parse()?).await
}

pub async fn new_pool_with(connect_options: PgConnectOptions) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5 as u32)
        .connect_with(connect_options)
        .await
}
