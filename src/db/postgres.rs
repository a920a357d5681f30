use super::{
    changes::ChangeRecord,
    option::{InternalOption, OptionId},
    poll::{InternalPoll, PollId, UserId},
    vote::{InternalVote, StoredVote, VoteId, VoterId},
    PollStore, Precondition, RecordVoteError, StoreError, UpdatePollError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use sqlx::{
    migrate::Migrator,
    postgres::{PgListener, PgRow},
    Done, PgPool, Row,
};
use std::path::Path;
use tracing::{debug, error, info, instrument, warn};

/// Channel the store triggers notify on after commit. The payload is the id
/// of the `change_log` row holding the record.
pub const CHANGE_CHANNEL: &str = "poll_store_changes";

const UNIQUE_VIOLATION: &str = "23505";
const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Every this many change ids the feed drops change log rows older than an hour.
const PRUNE_EVERY: i64 = 1000;

pub async fn migrate(pool: &PgPool, migrations: &Path) -> Result<(), sqlx::migrate::MigrateError> {
    let migrator = Migrator::new(migrations).await?;
    migrator.run(pool).await
}

#[derive(Clone, Debug)]
pub struct PgPollStore {
    pool: PgPool,
}

impl PgPollStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn poll_from_row(row: &PgRow) -> Result<InternalPoll, sqlx::Error> {
    Ok(InternalPoll {
        id: PollId(row.try_get("id")?),
        owner_id: UserId(row.try_get("owner_id")?),
        prompt: row.try_get("prompt")?,
        created_at: row.try_get("created_at")?,
        duration: row.try_get("duration")?,
        archived: row.try_get("archived")?,
    })
}

fn option_from_row(row: &PgRow) -> Result<InternalOption, sqlx::Error> {
    Ok(InternalOption {
        id: OptionId(row.try_get("id")?),
        poll_id: PollId(row.try_get("poll_id")?),
        index: row.try_get("display_index")?,
        text: row.try_get("text")?,
        votes: row.try_get("votes")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn database_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.into_owned()),
        _ => None,
    }
}

fn vote_error(err: sqlx::Error) -> RecordVoteError {
    let code = database_code(&err);
    classify_vote_error(code.as_deref(), err)
}

/// Only a unique violation means another vote for the pair won. Serialization
/// failures and deadlocks say nothing about the vote and are retried.
fn classify_vote_error(code: Option<&str>, err: sqlx::Error) -> RecordVoteError {
    match code {
        Some(UNIQUE_VIOLATION) => RecordVoteError::Conflict,
        Some(FOREIGN_KEY_VIOLATION) => {
            RecordVoteError::PreconditionFailed(Precondition::OptionNotInPoll)
        }
        _ => RecordVoteError::Store(err.into()),
    }
}

#[async_trait]
impl PollStore for PgPollStore {
    #[instrument(skip(self))]
    async fn get_poll(&self, id: &PollId) -> Result<Option<InternalPoll>, StoreError> {
        debug!("Retrieving poll");
        let row = sqlx::query(
            r#"SELECT id, owner_id, prompt, created_at, duration, archived FROM polls WHERE id = $1"#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(poll_from_row).transpose()?)
    }

    #[instrument(skip(self))]
    async fn get_option(&self, id: &OptionId) -> Result<Option<InternalOption>, StoreError> {
        debug!("Retrieving option");
        let row = sqlx::query(
            r#"SELECT id, poll_id, display_index, text, votes, updated_at FROM options WHERE id = $1"#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(option_from_row).transpose()?)
    }

    #[instrument(skip(self))]
    async fn record_vote(
        &self,
        vote: &InternalVote,
        observed_at: DateTime<Utc>,
    ) -> Result<(), RecordVoteError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        // The unique key on (voter_id, poll_id) serializes racing inserts: the
        // loser waits for the winner to commit and then inserts nothing.
        let inserted = sqlx::query(
            r#"
            INSERT INTO votes (voter_id, poll_id, option_id, vote_id) VALUES ($1, $2, $3, $4)
            ON CONFLICT (voter_id, poll_id) DO NOTHING
            "#,
        )
        .bind(vote.voter_id.as_str())
        .bind(vote.poll_id.as_str())
        .bind(vote.option_id.as_str())
        .bind(vote.vote_id.as_str())
        .execute(&mut tx)
        .await
        .map_err(vote_error)?
        .rows_affected();
        if inserted == 0 {
            tx.rollback().await.map_err(StoreError::from)?;
            return Err(RecordVoteError::PreconditionFailed(Precondition::VoteExists));
        }

        let updated = sqlx::query(
            r#"
            UPDATE options SET votes = votes + 1, updated_at = $3
            WHERE id = $1 AND poll_id = $2
            "#,
        )
        .bind(vote.option_id.as_str())
        .bind(vote.poll_id.as_str())
        .bind(observed_at)
        .execute(&mut tx)
        .await
        .map_err(vote_error)?
        .rows_affected();
        if updated == 0 {
            tx.rollback().await.map_err(StoreError::from)?;
            return Err(RecordVoteError::PreconditionFailed(
                Precondition::OptionNotInPoll,
            ));
        }

        tx.commit().await.map_err(vote_error)?;
        debug!("Vote committed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_vote(
        &self,
        voter_id: &VoterId,
        poll_id: &PollId,
    ) -> Result<Option<StoredVote>, StoreError> {
        let row = sqlx::query(
            r#"SELECT option_id, vote_id, settled FROM votes WHERE voter_id = $1 AND poll_id = $2"#,
        )
        .bind(voter_id.as_str())
        .bind(poll_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        Ok(Some(StoredVote {
            vote: InternalVote {
                voter_id: voter_id.clone(),
                poll_id: poll_id.clone(),
                option_id: OptionId(row.try_get("option_id")?),
                vote_id: VoteId(row.try_get("vote_id")?),
            },
            settled: row.try_get("settled")?,
        }))
    }

    #[instrument(skip(self))]
    async fn settle_vote(
        &self,
        voter_id: &VoterId,
        poll_id: &PollId,
        vote_id: &VoteId,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE votes SET settled = TRUE WHERE voter_id = $1 AND poll_id = $2 AND vote_id = $3"#,
        )
        .bind(voter_id.as_str())
        .bind(poll_id.as_str())
        .bind(vote_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn create_poll(
        &self,
        poll: &InternalPoll,
        options: &[InternalOption],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO polls (id, owner_id, prompt, created_at, duration, archived)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(poll.id.as_str())
        .bind(poll.owner_id.as_str())
        .bind(&poll.prompt)
        .bind(poll.created_at)
        .bind(poll.duration)
        .bind(poll.archived)
        .execute(&mut tx)
        .await?;
        for option in options {
            sqlx::query(
                r#"
                INSERT INTO options (id, poll_id, display_index, text, votes, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(option.id.as_str())
            .bind(option.poll_id.as_str())
            .bind(option.index)
            .bind(&option.text)
            .bind(option.votes)
            .bind(option.updated_at)
            .execute(&mut tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_duration(
        &self,
        id: &PollId,
        owner: &UserId,
        duration: i64,
    ) -> Result<(), UpdatePollError> {
        let updated = sqlx::query(r#"UPDATE polls SET duration = $3 WHERE id = $1 AND owner_id = $2"#)
            .bind(id.as_str())
            .bind(owner.as_str())
            .bind(duration)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?
            .rows_affected();
        if updated == 0 {
            return Err(UpdatePollError::PreconditionFailed);
        }
        Ok(())
    }

    async fn set_archived(
        &self,
        id: &PollId,
        owner: &UserId,
        archived: bool,
    ) -> Result<(), UpdatePollError> {
        let updated = sqlx::query(
            r#"UPDATE polls SET archived = $3 WHERE id = $1 AND owner_id = $2 AND archived <> $3"#,
        )
        .bind(id.as_str())
        .bind(owner.as_str())
        .bind(archived)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?
        .rows_affected();
        if updated == 0 {
            return Err(UpdatePollError::PreconditionFailed);
        }
        Ok(())
    }
}

/// Change log fed by the `poll_store_changes` notification channel.
///
/// The triggers write each record to `change_log` and notify only its id, so
/// records of any size go through.
pub struct PgChangeFeed {
    pool: PgPool,
    listener: PgListener,
}

impl PgChangeFeed {
    pub async fn connect(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        info!(channel = CHANGE_CHANNEL, "Listening for store changes");
        Ok(Self {
            pool: pool.clone(),
            listener,
        })
    }

    /// Ends when the listener connection fails for good.
    pub fn into_stream(self) -> impl Stream<Item = ChangeRecord> {
        stream::unfold(self, |mut feed| async move {
            loop {
                let notification = match feed.listener.recv().await {
                    Ok(notification) => notification,
                    Err(err) => {
                        error!("Change listener failed: {}", err);
                        return None;
                    }
                };
                match feed.fetch(notification.payload()).await {
                    Ok(Some(record)) => return Some((record, feed)),
                    Ok(None) => {}
                    Err(err) => warn!(
                        payload = notification.payload(),
                        "Skipping change notification: {}", err
                    ),
                }
            }
        })
    }

    async fn fetch(&self, payload: &str) -> Result<Option<ChangeRecord>, StoreError> {
        let id: i64 = payload
            .trim()
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("change id {:?}", payload)))?;
        let row = sqlx::query(r#"SELECT record FROM change_log WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        let record: serde_json::Value = match row {
            Some(row) => row.try_get("record")?,
            None => {
                debug!(id, "Change already pruned");
                return Ok(None);
            }
        };
        if id % PRUNE_EVERY == 0 {
            self.prune().await;
        }
        serde_json::from_value(record)
            .map(Some)
            .map_err(|err| StoreError::Corrupt(err.to_string()))
    }

    async fn prune(&self) {
        let pruned = sqlx::query(
            r#"DELETE FROM change_log WHERE recorded_at < now() - interval '1 hour'"#,
        )
        .execute(&self.pool)
        .await;
        match pruned {
            Ok(done) => debug!(rows = done.rows_affected(), "Pruned change log"),
            Err(err) => warn!("Failed to prune change log: {}", err),
        }
    }
}
