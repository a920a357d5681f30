use super::{option::OptionId, poll::PollId, string_id};
use uuid::Uuid;

string_id!(
    /// Authenticated user id, or the network origin of an anonymous voter.
    VoterId
);
string_id!(VoteId);
string_id!(
    /// Idempotency token of an inbound vote request.
    RequestId
);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_hyphenated().to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&RequestId> for VoteId {
    /// Redelivery of the same request reproduces the same vote identity.
    fn from(request_id: &RequestId) -> Self {
        Self(request_id.0.clone())
    }
}

/// Unique per (voter, poll). Never updated once written.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InternalVote {
    pub voter_id: VoterId,
    pub poll_id: PollId,
    pub option_id: OptionId,
    pub vote_id: VoteId,
}

/// A vote as held by the store. `settled` is set once the success outcome for
/// the vote has been handed to the publisher.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StoredVote {
    pub vote: InternalVote,
    pub settled: bool,
}
