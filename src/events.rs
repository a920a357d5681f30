//! Wire formats of the inbound vote queue, the outcome channel and the
//! poll-scoped fanout topics.

use crate::db::{
    option::OptionId,
    poll::{PollId, UserId},
    vote::{RequestId, VoteId, VoterId},
};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Every counted vote and poll modification of a poll.
    pub fn poll(poll_id: &PollId) -> Self {
        Self(format!("poll/{}", poll_id))
    }

    /// The outcome of a single vote request.
    pub fn vote(request_id: &RequestId) -> Self {
        Self(format!("vote/{}", request_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundVoteMessage {
    pub option_id: OptionId,
    pub poll_id: PollId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous_origin_id: Option<String>,
    pub observed_at_epoch_millis: i64,
    pub request_id: RequestId,
}

impl InboundVoteMessage {
    /// The authenticated user wins over the anonymous origin. Empty values
    /// count as absent.
    pub fn voter(&self) -> Option<VoterId> {
        self.voter_id
            .iter()
            .chain(self.anonymous_origin_id.iter())
            .find(|id| !id.is_empty())
            .map(|id| VoterId(id.clone()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectReason {
    MalformedRequest,
    PollNotFound,
    PollArchived,
    PollExpired,
    DuplicateVote,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutcomeEvent {
    #[serde(rename_all = "camelCase")]
    VoteSucceeded {
        voter_id: VoterId,
        poll_id: PollId,
        option_id: OptionId,
        vote_id: VoteId,
    },
    #[serde(rename_all = "camelCase")]
    VoteFailed {
        request_id: RequestId,
        poll_id: PollId,
        option_id: OptionId,
        reason: RejectReason,
        error: String,
    },
}

impl OutcomeEvent {
    /// Topic the requester listens on.
    pub fn topic(&self) -> Topic {
        match self {
            OutcomeEvent::VoteSucceeded { vote_id, .. } => {
                Topic::vote(&RequestId(vote_id.0.clone()))
            }
            OutcomeEvent::VoteFailed { request_id, .. } => Topic::vote(request_id),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FanoutEvent {
    #[serde(rename_all = "camelCase")]
    VoteCounted {
        option_id: OptionId,
        poll_id: PollId,
        updated_at: String,
        votes: i64,
    },
    #[serde(rename_all = "camelCase")]
    PollModified {
        poll_id: PollId,
        user_id: UserId,
        prompt: String,
        created_at: String,
        duration: i64,
        archived: bool,
    },
    #[serde(rename_all = "camelCase")]
    PollArchived { poll_id: PollId, archived: bool },
}

impl FanoutEvent {
    pub fn poll_id(&self) -> &PollId {
        match self {
            FanoutEvent::VoteCounted { poll_id, .. }
            | FanoutEvent::PollModified { poll_id, .. }
            | FanoutEvent::PollArchived { poll_id, .. } => poll_id,
        }
    }
}

/// Anything pushed to a topic subscriber.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Notification {
    Outcome(OutcomeEvent),
    Fanout(FanoutEvent),
}
