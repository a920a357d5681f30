use crate::db::{
    option::OptionId,
    poll::{InternalPoll, PollId},
    vote::{RequestId, VoteId, VoterId},
    PollStore, StoreError,
};
use crate::events::{InboundVoteMessage, RejectReason};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// A permanent, non-retryable refusal of a vote request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub message: String,
}

impl Rejection {
    pub fn new(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("{0}")]
    Rejected(Rejection),
    /// Leave the message unacknowledged so the queue redelivers it.
    #[error(transparent)]
    Transient(#[from] StoreError),
}

impl From<Rejection> for VoteError {
    fn from(rejection: Rejection) -> Self {
        VoteError::Rejected(rejection)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteRequest {
    pub voter_id: VoterId,
    pub poll_id: PollId,
    pub option_id: OptionId,
    pub request_id: RequestId,
    pub vote_id: VoteId,
    pub observed_at: DateTime<Utc>,
}

impl VoteRequest {
    pub fn from_message(message: &InboundVoteMessage) -> Result<Self, Rejection> {
        let voter_id = message.voter().ok_or_else(|| {
            Rejection::new(
                RejectReason::MalformedRequest,
                "vote carries neither a user nor an origin",
            )
        })?;
        let observed_at = Utc
            .timestamp_millis_opt(message.observed_at_epoch_millis)
            .single()
            .ok_or_else(|| {
                Rejection::new(
                    RejectReason::MalformedRequest,
                    format!(
                        "invalid observation time {}",
                        message.observed_at_epoch_millis
                    ),
                )
            })?;
        Ok(Self {
            voter_id,
            poll_id: message.poll_id.clone(),
            option_id: message.option_id.clone(),
            request_id: message.request_id.clone(),
            vote_id: VoteId::from(&message.request_id),
            observed_at,
        })
    }
}

/// Lifecycle rules, compared at millisecond resolution.
pub fn check_lifecycle(poll: &InternalPoll, observed_at: &DateTime<Utc>) -> Result<(), Rejection> {
    if poll.archived {
        return Err(Rejection::new(
            RejectReason::PollArchived,
            format!("poll {} is archived", poll.id),
        ));
    }
    if observed_at.timestamp_millis() >= poll.expires_at_millis() {
        return Err(Rejection::new(
            RejectReason::PollExpired,
            format!("poll {} has expired", poll.id),
        ));
    }
    Ok(())
}

pub async fn admit(store: &dyn PollStore, request: &VoteRequest) -> Result<InternalPoll, VoteError> {
    let poll = store.get_poll(&request.poll_id).await?.ok_or_else(|| {
        Rejection::new(
            RejectReason::PollNotFound,
            format!("poll {} not found", request.poll_id),
        )
    })?;
    check_lifecycle(&poll, &request.observed_at)?;
    debug!(poll_id = poll.id.as_str(), "Vote admitted");
    Ok(poll)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryPollStore;

    fn poll(archived: bool) -> InternalPoll {
        InternalPoll {
            id: "p1".into(),
            owner_id: "u1".into(),
            prompt: "?".to_owned(),
            created_at: Utc.timestamp_millis(1_600_000_000_000),
            duration: 300,
            archived,
        }
    }

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis(millis)
    }

    fn reason(result: Result<(), Rejection>) -> Option<RejectReason> {
        result.err().map(|rejection| rejection.reason)
    }

    #[test]
    fn votes_are_accepted_until_the_expiration_instant() {
        let poll = poll(false);
        assert_eq!(reason(check_lifecycle(&poll, &at(1_600_000_000_000))), None);
        assert_eq!(reason(check_lifecycle(&poll, &at(1_600_000_299_999))), None);
        assert_eq!(
            reason(check_lifecycle(&poll, &at(1_600_000_300_000))),
            Some(RejectReason::PollExpired)
        );
        assert_eq!(
            reason(check_lifecycle(&poll, &at(1_600_000_301_000))),
            Some(RejectReason::PollExpired)
        );
    }

    #[test]
    fn archived_poll_rejects_before_expiry() {
        assert_eq!(
            reason(check_lifecycle(&poll(true), &at(1_600_000_001_000))),
            Some(RejectReason::PollArchived)
        );
    }

    #[test]
    fn request_without_voter_is_malformed() {
        let message = InboundVoteMessage {
            option_id: "o1".into(),
            poll_id: "p1".into(),
            voter_id: Some(String::new()),
            anonymous_origin_id: None,
            observed_at_epoch_millis: 1,
            request_id: "r1".into(),
        };
        let rejection = VoteRequest::from_message(&message).unwrap_err();
        assert_eq!(rejection.reason, RejectReason::MalformedRequest);
    }

    #[actix_rt::test]
    async fn missing_poll_is_rejected() {
        let store = MemoryPollStore::new();
        let request = VoteRequest {
            voter_id: "v1".into(),
            poll_id: "nope".into(),
            option_id: "o1".into(),
            request_id: "r1".into(),
            vote_id: "r1".into(),
            observed_at: at(0),
        };
        match admit(&store, &request).await {
            Err(VoteError::Rejected(rejection)) => {
                assert_eq!(rejection.reason, RejectReason::PollNotFound);
                assert_eq!(rejection.message, "poll nope not found");
            }
            other => panic!("unexpected admission result {:?}", other),
        }
    }
}
