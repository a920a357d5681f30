use super::{
    changes::ChangeRecord,
    option::{InternalOption, OptionId},
    poll::{InternalPoll, PollId, UserId},
    vote::{InternalVote, StoredVote, VoteId, VoterId},
    PollStore, Precondition, RecordVoteError, StoreError, UpdatePollError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Default)]
struct Tables {
    polls: HashMap<PollId, InternalPoll>,
    options: HashMap<OptionId, InternalOption>,
    votes: HashMap<(VoterId, PollId), StoredVote>,
}

/// In-process poll store.
///
/// Every transaction runs inside one critical section, which gives the same
/// all-or-nothing conditional write as the database backed store. Change
/// records are emitted while the section is held so per-item order is kept.
#[derive(Default)]
pub struct MemoryPollStore {
    tables: Mutex<Tables>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChangeRecord>>>,
    fail_next: AtomicU32,
    lose_next_ack: AtomicU32,
    stall_next_vote: AtomicU32,
}

impl MemoryPollStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to the change log. Only mutations committed after the
    /// call are delivered.
    pub fn changes(&self) -> mpsc::UnboundedReceiver<ChangeRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(tx);
        }
        rx
    }

    /// The next `count` calls fail before touching any data.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// The next `count` vote writes commit but report a failure, like a
    /// response lost to a timeout.
    pub fn lose_next_ack(&self, count: u32) {
        self.lose_next_ack.store(count, Ordering::SeqCst);
    }

    /// The next `count` vote writes never complete.
    pub fn stall_next_vote(&self, count: u32) {
        self.stall_next_vote.store(count, Ordering::SeqCst);
    }

    pub fn vote(&self, voter_id: &VoterId, poll_id: &PollId) -> Option<InternalVote> {
        let tables = self.tables.lock().ok()?;
        tables
            .votes
            .get(&(voter_id.clone(), poll_id.clone()))
            .map(|stored| stored.vote.clone())
    }

    pub fn vote_count(&self, poll_id: &PollId) -> usize {
        self.tables
            .lock()
            .map(|tables| {
                tables
                    .votes
                    .values()
                    .filter(|stored| &stored.vote.poll_id == poll_id)
                    .count()
            })
            .unwrap_or(0)
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        if take_one(&self.fail_next) {
            return Err(StoreError::Unavailable("injected failure".to_owned()));
        }
        self.tables
            .lock()
            .map_err(|_| StoreError::Unavailable("poisoned table lock".to_owned()))
    }

    fn emit(&self, record: Result<ChangeRecord, serde_json::Error>) {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!("Failed to encode change record: {}", err);
                return;
            }
        };
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|tx| tx.send(record.clone()).is_ok());
        }
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl PollStore for MemoryPollStore {
    async fn get_poll(&self, id: &PollId) -> Result<Option<InternalPoll>, StoreError> {
        Ok(self.tables()?.polls.get(id).cloned())
    }

    async fn get_option(&self, id: &OptionId) -> Result<Option<InternalOption>, StoreError> {
        Ok(self.tables()?.options.get(id).cloned())
    }

    async fn record_vote(
        &self,
        vote: &InternalVote,
        observed_at: DateTime<Utc>,
    ) -> Result<(), RecordVoteError> {
        if take_one(&self.stall_next_vote) {
            futures::future::pending::<()>().await;
        }
        let mut tables = self.tables()?;
        let key = (vote.voter_id.clone(), vote.poll_id.clone());
        if tables.votes.contains_key(&key) {
            return Err(RecordVoteError::PreconditionFailed(Precondition::VoteExists));
        }
        let old = match tables.options.get(&vote.option_id) {
            Some(option) if option.poll_id == vote.poll_id => option.clone(),
            _ => {
                return Err(RecordVoteError::PreconditionFailed(
                    Precondition::OptionNotInPoll,
                ))
            }
        };

        let mut new = old.clone();
        new.votes += 1;
        new.updated_at = observed_at;
        tables.votes.insert(
            key,
            StoredVote {
                vote: vote.clone(),
                settled: false,
            },
        );
        tables.options.insert(new.id.clone(), new.clone());
        debug!(option_id = new.id.as_str(), votes = new.votes, "Vote committed");
        self.emit(ChangeRecord::option_updated(&old, &new));

        if take_one(&self.lose_next_ack) {
            return Err(StoreError::Unavailable("acknowledgement lost".to_owned()).into());
        }
        Ok(())
    }

    async fn get_vote(
        &self,
        voter_id: &VoterId,
        poll_id: &PollId,
    ) -> Result<Option<StoredVote>, StoreError> {
        Ok(self
            .tables()?
            .votes
            .get(&(voter_id.clone(), poll_id.clone()))
            .cloned())
    }

    async fn settle_vote(
        &self,
        voter_id: &VoterId,
        poll_id: &PollId,
        vote_id: &VoteId,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        if let Some(stored) = tables.votes.get_mut(&(voter_id.clone(), poll_id.clone())) {
            if &stored.vote.vote_id == vote_id {
                stored.settled = true;
            }
        }
        Ok(())
    }

    async fn create_poll(
        &self,
        poll: &InternalPoll,
        options: &[InternalOption],
    ) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        if tables.polls.contains_key(&poll.id)
            || options
                .iter()
                .any(|option| tables.options.contains_key(&option.id))
        {
            return Err(StoreError::Corrupt(format!("poll {} already exists", poll.id)));
        }
        tables.polls.insert(poll.id.clone(), poll.clone());
        for option in options {
            tables.options.insert(option.id.clone(), option.clone());
        }
        Ok(())
    }

    async fn update_duration(
        &self,
        id: &PollId,
        owner: &UserId,
        duration: i64,
    ) -> Result<(), UpdatePollError> {
        let mut tables = self.tables()?;
        let old = match tables.polls.get(id) {
            Some(poll) if &poll.owner_id == owner => poll.clone(),
            _ => return Err(UpdatePollError::PreconditionFailed),
        };
        let mut new = old.clone();
        new.duration = duration;
        tables.polls.insert(id.clone(), new.clone());
        self.emit(ChangeRecord::poll_updated(&old, &new));
        Ok(())
    }

    async fn set_archived(
        &self,
        id: &PollId,
        owner: &UserId,
        archived: bool,
    ) -> Result<(), UpdatePollError> {
        let mut tables = self.tables()?;
        let old = match tables.polls.get(id) {
            Some(poll) if &poll.owner_id == owner && poll.archived != archived => poll.clone(),
            _ => return Err(UpdatePollError::PreconditionFailed),
        };
        let mut new = old.clone();
        new.archived = archived;
        tables.polls.insert(id.clone(), new.clone());
        self.emit(ChangeRecord::poll_updated(&old, &new));
        Ok(())
    }
}
